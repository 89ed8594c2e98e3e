//! Agent session runtime
//!
//! - [`runtime`] - connect, route inbound commands, orderly shutdown
//! - [`scheduler`] - heartbeat and telemetry loops
//! - [`telemetry`] - threshold and interval gate for metric publishes
//! - [`session`] - connection timestamp behind `uptime_s`
//! - [`signals`] - SIGINT/SIGTERM registration

pub mod runtime;
pub mod scheduler;
pub mod session;
pub mod signals;
pub mod telemetry;

pub use runtime::{Runtime, RuntimeError};
pub use scheduler::{PeriodicTask, Schedulers};
pub use session::SessionClock;
pub use signals::ShutdownSignals;
pub use telemetry::TelemetryGate;
