//! Shared helpers: bootstrap, AWS error classification, retry and metrics.

pub mod aws;
pub mod bootstrap;
pub mod metrics;
pub mod retry;
