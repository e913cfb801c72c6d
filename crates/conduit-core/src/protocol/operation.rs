//! Operation registration and lookup.
//!
//! Operations are registered under `(name, version)` and grouped into
//! interfaces for capability listing. Lookup accepts any registered version
//! that is semver-compatible with the requested one: same major version and
//! at least as new; for `0.x` versions the minor must match as well. Short
//! versions such as `"1.0"` read as `1.0.0`.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use semver::Version;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use crate::cancel::CancellationToken;
use crate::error::{ConduitError, Result};
use crate::fulfillment::PendingUpdate;
use crate::marshal::RpcValue;

/// Interface name used by [`OperationRegistry::register`].
pub const DEFAULT_INTERFACE: &str = "default";

/// Channel carrying progress notifications out of running operations.
pub type ProgressSender = mpsc::UnboundedSender<PendingUpdate>;

/// Error raised by an operation implementation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationError {
    pub classification: String,
    pub message: String,
}

impl OperationError {
    pub fn new(classification: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            classification: classification.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for OperationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.classification, self.message)
    }
}

impl<E> From<E> for OperationError
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn from(err: E) -> Self {
        let type_name = std::any::type_name::<E>();
        let classification = type_name.rsplit("::").next().unwrap_or(type_name);
        Self::new(classification, err.to_string())
    }
}

pub type OperationResult = std::result::Result<RpcValue, OperationError>;

/// Per-invocation context handed to every operation.
#[derive(Clone)]
pub struct OperationContext {
    request_id: String,
    cancellation: CancellationToken,
    progress: Option<ProgressSender>,
    sequence: Arc<AtomicU64>,
}

impl OperationContext {
    pub fn new(
        request_id: impl Into<String>,
        cancellation: CancellationToken,
        progress: Option<ProgressSender>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            cancellation,
            progress,
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Context for direct invocations outside any request.
    pub fn detached() -> Self {
        Self::new(String::new(), CancellationToken::new(), None)
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Emit a pending update to the frontend. No-op when nobody listens.
    pub fn report_progress(&self, metadata: serde_json::Value) {
        let Some(progress) = &self.progress else {
            return;
        };
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let _ = progress.send(PendingUpdate::new(&self.request_id, sequence, metadata));
    }
}

/// An operation implementation.
pub trait OperationHandler: Send + Sync + 'static {
    fn call(&self, params: RpcValue, context: OperationContext) -> BoxFuture<'static, OperationResult>;
}

impl<F, Fut> OperationHandler for F
where
    F: Fn(RpcValue, OperationContext) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = OperationResult> + Send + 'static,
{
    fn call(&self, params: RpcValue, context: OperationContext) -> BoxFuture<'static, OperationResult> {
        Box::pin(self(params, context))
    }
}

/// A resolved registration.
#[derive(Clone)]
pub struct RegisteredOperation {
    pub interface: String,
    pub name: String,
    pub version: Version,
    /// Version exactly as registered.
    pub version_label: String,
    pub handler: Arc<dyn OperationHandler>,
}

/// Capability listing entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterfaceDescriptor {
    pub interface_name: String,
    pub version: String,
    pub operation_names: Vec<String>,
    pub compatible: bool,
}

impl InterfaceDescriptor {
    /// Whether this backend interface can serve a frontend expecting `required`.
    pub fn is_compatible_with(&self, required: &str) -> bool {
        match (parse_version(&self.version), parse_version(required)) {
            (Some(offered), Some(required)) => is_compatible(&offered, &required),
            _ => false,
        }
    }
}

/// Static `(name, version) -> handler` table.
#[derive(Default)]
pub struct OperationRegistry {
    operations: HashMap<String, Vec<RegisteredOperation>>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an operation in the default interface.
    pub fn register<H: OperationHandler>(
        &mut self,
        name: &str,
        version: &str,
        handler: H,
    ) -> Result<()> {
        self.register_in(DEFAULT_INTERFACE, name, version, handler)
    }

    /// Register an operation under a named interface.
    pub fn register_in<H: OperationHandler>(
        &mut self,
        interface: &str,
        name: &str,
        version: &str,
        handler: H,
    ) -> Result<()> {
        let parsed = parse_version(version).ok_or_else(|| ConduitError::Config {
            message: format!("operation {} has invalid version '{}'", name, version),
        })?;

        let slot = self.operations.entry(name.to_string()).or_default();
        if slot.iter().any(|op| op.version == parsed) {
            return Err(ConduitError::Config {
                message: format!("operation {} v{} registered twice", name, version),
            });
        }

        debug!("Registered operation {}.{} v{}", interface, name, version);
        slot.push(RegisteredOperation {
            interface: interface.to_string(),
            name: name.to_string(),
            version: parsed,
            version_label: version.to_string(),
            handler: Arc::new(handler),
        });
        Ok(())
    }

    /// Newest registration compatible with the requested version.
    pub fn resolve(&self, name: &str, version: &str) -> Option<&RegisteredOperation> {
        let requested = parse_version(version)?;
        self.operations
            .get(name)?
            .iter()
            .filter(|op| is_compatible(&op.version, &requested))
            .max_by(|a, b| a.version.cmp(&b.version))
    }

    /// Capability listing, one entry per `(interface, version)`.
    pub fn describe(&self) -> Vec<InterfaceDescriptor> {
        let mut grouped: BTreeMap<(String, String), Vec<String>> = BTreeMap::new();
        for op in self.operations.values().flatten() {
            grouped
                .entry((op.interface.clone(), op.version_label.clone()))
                .or_default()
                .push(op.name.clone());
        }
        grouped
            .into_iter()
            .map(|((interface_name, version), mut operation_names)| {
                operation_names.sort();
                InterfaceDescriptor {
                    interface_name,
                    version,
                    operation_names,
                    compatible: true,
                }
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.operations.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Parse a version, padding missing minor/patch components with zero.
pub fn parse_version(text: &str) -> Option<Version> {
    let text = text.trim();
    if let Ok(version) = Version::parse(text) {
        return Some(version);
    }
    let split_at = text.find(['-', '+']).unwrap_or(text.len());
    let (core, suffix) = text.split_at(split_at);
    let components = core.split('.').count();
    if core.is_empty() || components >= 3 {
        return None;
    }
    let padded = format!("{}{}{}", core, ".0".repeat(3 - components), suffix);
    Version::parse(&padded).ok()
}

/// Whether an offered version satisfies a requested one.
pub fn is_compatible(offered: &Version, requested: &Version) -> bool {
    if offered.major != requested.major {
        return false;
    }
    if offered.major == 0 && offered.minor != requested.minor {
        return false;
    }
    offered >= requested
}
