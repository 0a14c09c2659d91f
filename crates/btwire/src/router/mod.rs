//! Dynamic message routers.
//!
//! A router is a single task that owns a route table and serves admin
//! requests (add/remove/get/start/terminate) alongside message traffic.
//!
//! - [`FanOutRouter`]: one source, many filtered destinations
//! - [`FanInRouter`]: many filtered sources, one sink
//!
//! Routes are ordered by registration. Adding a route under an existing
//! name replaces it and closes the old route's channel. Terminating a router
//! closes every route it still holds.

mod fan_in;
mod fan_out;
pub mod passage;
mod route;

pub use fan_in::FanInRouter;
pub use fan_out::{Delivery, FanOutRouter};
pub use route::{Passage, RouteInfo, RouterState, open};

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RouterError {
    #[error("router {0} has terminated")]
    Terminated(String),

    #[error("route rejected: {0}")]
    Rejected(String),
}

/// Capacity of the admin request channel of every router.
const ADMIN_CAPACITY: usize = 16;
