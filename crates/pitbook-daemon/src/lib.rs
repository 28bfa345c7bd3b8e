#![forbid(unsafe_code)]

//! pitbook-daemon - Loyalty-Ledger Runtime Host
//!
//! This crate hosts the `pitbook-core` kernel at runtime. It owns everything
//! that is per-process rather than per-transaction: the privileged command
//! surface the surrounding workflow layer links against, the per-staff
//! rate limiter, the accrual recovery coordinator with its background sweep,
//! and Prometheus metrics.
//!
//! There is no network surface here. Callers link the library and dispatch
//! commands directly; the binary in `main.rs` only runs the recovery sweep
//! loop.
//!
//! # Modules
//!
//! - [`dispatch`]: two-lane privileged command dispatch (staff and service)
//! - [`metrics`]: Prometheus metrics for issuance and recovery observability
//! - [`rate_limit`]: sliding-window per-staff manual-reward limiter
//! - [`recovery`]: close-then-accrue workflow recovery coordinator

pub mod dispatch;
pub mod metrics;
pub mod rate_limit;
pub mod recovery;
