//! Explicit state machines built on `statig`.

pub mod lifecycle_sm;
