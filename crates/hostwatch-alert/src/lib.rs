//! Alert evaluation and incident lifecycle for host metrics.
//!
//! Rules live in an [`registry::AlertRegistry`] that publishes immutable
//! [`registry::RuleSnapshot`]s. Each pass, the [`engine::AlertEngine`] reads a
//! host's recent samples through a [`engine::SampleSource`], evaluates every
//! active rule of that host, debounces the resulting status per (rule, host)
//! and turns reported transitions into incident updates through an
//! [`incident::IncidentStore`].

pub mod clause;
pub mod debounce;
pub mod engine;
pub mod error;
pub mod evaluate;
pub mod evaluator;
pub mod incident;
pub mod lookup;
pub mod registry;
pub mod rule;
pub mod threshold;

#[cfg(test)]
mod tests;

pub use engine::{AlertEngine, HostPassReport, SampleSource};
pub use error::{BoxError, EngineError, IncidentError, RegistryError, ValidationError};
pub use evaluate::{evaluate, Evaluation, SkipReason, Status};
pub use incident::{BreachOutcome, IncidentManager, IncidentStore};
pub use registry::{AlertRegistry, AlertUpsert, RuleSnapshot, Scope, Upserted};
pub use rule::CompiledRule;
