//! Frontend request tracking: lifecycle states, the registry of live
//! requests, and the handle returned to callers.

pub mod handle;
pub mod registry;
pub mod state;

pub use handle::{RequestCanceller, RequestHandle};
pub use registry::{
    OutboundRequest, RegistryStats, RequestRegistry, RequestSnapshot, UpdateListener,
};
pub use state::RequestState;
