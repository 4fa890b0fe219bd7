//! # Overview
//! This crate provides a small fixture lifecycle manager for integration
//! tests: given a declarative resource request (image, ports, network
//! memberships, readiness strategy, lifecycle hooks), it creates the
//! container, runs the hooks for each phase in registration order, blocks
//! until the readiness condition is satisfied, exposes the resolved
//! connection info, and guarantees idempotent teardown. The container
//! runtime itself stays behind an opaque boundary.

mod config;
/// Defines error types and custom error handling for fixture operations.
pub mod errors;
/// Phase-keyed lifecycle hooks and the logging hook variant.
pub mod hooks;
/// Responsible for the lifecycle logic: create, readiness wait, terminate.
pub mod manager;
/// Pluggable readiness strategies.
pub mod readiness;
/// Declarative resource and network descriptors.
pub mod request;
/// The opaque container-runtime boundary and its Docker implementation.
pub mod runtime;
/// Provides utilities and helpers for testing fixture lifecycles.
#[cfg(any(test, feature = "testing"))]
pub mod test_utils;
