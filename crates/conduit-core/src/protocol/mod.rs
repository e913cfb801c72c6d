//! Backend protocol: operation registration and request dispatch.

pub mod dispatcher;
pub mod operation;

pub use dispatcher::{DispatchOutcome, Dispatcher, InboundRequest};
pub use operation::{
    InterfaceDescriptor, OperationContext, OperationError, OperationHandler, OperationRegistry,
    OperationResult, ProgressSender, DEFAULT_INTERFACE,
};

/// Reserved operation answered by backends with their capability listing.
pub const DESCRIBE_OPERATION: &str = "rpc.describe";
pub const DESCRIBE_VERSION: &str = "1.0";
