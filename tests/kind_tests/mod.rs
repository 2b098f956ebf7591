//! Integration stories against a real API server
//!
//! - `endpoint_lifecycle`: deploy, redeploy, rollback and delete through the
//!   endpoint service, checking what lands in the cluster
//! - `reconciler`: delete-then-create against real garbage collection

mod endpoint_lifecycle;
mod helpers;
mod reconciler;
