//! Standardized topic construction and broker wildcard matching.
//!
//! Every component of the crate derives its status, liveness, and handover
//! topics from the same four-segment base, and every subscription filter is
//! evaluated with the same matcher, so the topic layout lives in one place.

pub mod builder;
pub mod matcher;

pub use builder::{TopicBuilder, TopicError, DEFAULT_NAMESPACE_ROOT};
pub use matcher::matches;
