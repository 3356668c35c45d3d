//! Helpers shared by the stages that call external services

pub mod retry;

pub use retry::{call_with_policy, CallPolicy};
