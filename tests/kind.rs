//! Cluster-backed integration tests for llmops
//!
//! These tests need a reachable Kubernetes cluster (kind works) and are
//! ignored by default:
//!
//! ```bash
//! cargo test --test kind -- --ignored
//! ```
//!
//! They run against the `llmops-dev` namespace, creating it when missing.

mod kind_tests;
