//! Orchestration services for the access-control core.
//!
//! This crate owns every request-path transaction: the access pipeline
//! (idempotent attempt → engine → decision → command → events), the
//! command-outcome callback with its final-state guard, and the
//! policy-change publisher. All of them write their domain events through
//! the composite [`EventPublisher`] — outbox transactionally, in-process
//! bus best-effort.

pub mod access;
pub mod callback;
pub mod candidates;
pub mod error;
pub mod policy;
pub mod publisher;

pub use access::{AccessService, AttemptResult, RegisterAttempt};
pub use callback::{CallbackService, CallbackOutcome, CommandOutcome};
pub use candidates::CandidateProvider;
pub use error::CoreError;
pub use policy::{apply_policy_envelope, spawn_cache_invalidator, PolicyService};
pub use publisher::EventPublisher;
