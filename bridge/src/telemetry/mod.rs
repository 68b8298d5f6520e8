//! # Telemetry Module
//!
//! Observability for the distribution side: which engines poll which
//! RuleSets and what they were last served.

pub mod subscriptions;

pub use subscriptions::{PollSubscription, SubscriptionTracker, DEFAULT_SUBSCRIPTION_TTL};
