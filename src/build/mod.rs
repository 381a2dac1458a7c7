//! Build context and the project configuration it is derived from.
//!
//! - [`context`] - Immutable per-invocation paths and settings

pub mod context;
