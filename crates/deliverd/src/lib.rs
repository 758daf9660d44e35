//! Outbound SMTP delivery engine: turns batches of queued recipients
//! into bounded sets of concurrent connections, drives each connection
//! through the protocol, and settles every recipient back into the
//! queue with a definitive outcome.

pub mod metrics;
pub mod policy;
pub mod queue;
pub mod routing;
pub mod scheduler;
mod session;
pub mod unit;

pub use policy::{ConnectionPolicy, PolicyClass, PolicyTable, Tls};
pub use queue::{
    Classification, DeliveryStatus, Queue, QueueEntry, QueueState, RetrySchedule,
};
pub use routing::{Credentials, Destination, Relay, Router, SaslMechanism};
pub use scheduler::{Scheduler, SchedulerConfig, StopHandle};
pub use unit::{BodySource, MessageUnit, UnitRecipient};
