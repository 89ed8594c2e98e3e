//! Inbound command handling
//!
//! - [`routes`] - exact-topic route table (core and component commands)
//! - [`context`] - shared services and snapshot publishing
//! - [`handlers`] - one handler per action
//! - [`dispatcher`] - bounded worker pool, result/refresh/restart ordering

pub mod context;
pub mod dispatcher;
pub mod handlers;
pub mod routes;

pub use context::{CommandContext, CoreServices, RuntimeSettings};
pub use dispatcher::Dispatcher;
pub use handlers::HandlerOutcome;
pub use routes::{CoreCommand, Route, RouteTable};
