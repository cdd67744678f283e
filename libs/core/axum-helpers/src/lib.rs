//! Shared axum plumbing for fleet services.
//!
//! This crate provides:
//! - Process-level liveness (`/healthz`) and the dependency-check fold
//!   behind readiness pages
//! - [`ShutdownCoordinator`], the single-fire teardown trigger that keeps
//!   the final-status-publish → stop-children → drain-server order intact

pub mod health;
pub mod shutdown;

pub use health::{CheckFuture, DependencyReport, check_dependencies, liveness_router};
pub use shutdown::{ShutdownCoordinator, ShutdownReason};
