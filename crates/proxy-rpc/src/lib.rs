//! Local-shell control surface: the operations a front-end drives the
//! fleet manager with.

mod control;
mod import;
mod types;

pub use control::{ControlSurface, RpcError};
pub use types::{
    CapabilitySnapshot, ImportOptions, ListenerSnapshot, ListenerSpec, ManagerSnapshot, ServerSnapshot, ServerSpec,
    StateResponse,
};
