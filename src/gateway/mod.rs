//! HTTP gateway: admission, forwarding and upstream trust.

mod forward;
mod server;
mod service;
pub mod trust;

pub use forward::{Forwarder, UpstreamProxy};
pub use server::GatewayServer;
pub use service::{dispatch, handle, GatewayState};
