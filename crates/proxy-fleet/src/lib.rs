//! Fleet manager: the registries of upstream servers and local listeners,
//! selection by filter, health checking, and change notification.

mod filter;
mod health;
mod managed;
mod manager;

pub use filter::ServerFilter;
pub use health::CheckServerTask;
pub use managed::{ManagedListener, ManagedServer};
pub use manager::{local_ip, FleetConfig, FleetError, FleetManager, ListenerRunner, DEFAULT_RECHECK_INTERVAL};
