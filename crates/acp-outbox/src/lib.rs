//! Outbox dispatch: background delivery of domain events.
//!
//! The dispatcher claims PENDING rows with `FOR UPDATE SKIP LOCKED`,
//! transports each one, and completes it with an ownership-safe update —
//! published, scheduled for retry, or demoted to FAILED. Failure
//! classification drives the retry policy; exhausted or non-retryable
//! messages become terminal and wait for an operator. The DLQ and parking
//! lot are diagnostic sinks for messages the *external* transport hands
//! back; they never recirculate anything.

pub mod backoff;
pub mod dispatcher;
pub mod dlq;
pub mod failure;
pub mod transport;

pub use backoff::backoff_delay;
pub use dispatcher::{Dispatcher, DispatcherConfig, TickSummary};
pub use dlq::{DlqHandler, ParkingLotHandler};
pub use failure::{FailureKind, TransportError};
pub use transport::{EventTransport, HttpTransport, LogTransport};
