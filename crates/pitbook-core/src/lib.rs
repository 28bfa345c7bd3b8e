#![forbid(unsafe_code)]

//! pitbook-core - Multi-Tenant Authority & Loyalty-Ledger Kernel
//!
//! This library implements the kernel of the pitbook platform: many casino
//! properties ("tenants") share one relational backing store, reached through
//! pooled short-lived connections with no session affinity. The kernel
//! derives "who is calling, for which tenant, with which role" fresh for
//! every transaction, and builds exactly-once, concurrency-safe, auditable
//! loyalty-point mutations on top of that authority.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   verified claims   ┌──────────────────┐
//! │ token        │────────────────────▶│ identity         │
//! │ (HMAC mint/  │                     │ (resolver over   │
//! │  verify)     │                     │  staff records)  │
//! └──────────────┘                     └────────┬─────────┘
//!                                               │ resolved triple
//!                                               ▼
//! ┌──────────────┐   per-transaction   ┌──────────────────┐
//! │ store        │◀───ContextCell──────│ context          │
//! │ (pool, txn,  │                     │ (establish +     │
//! │  lock table) │                     │  authority guard)│
//! └──────┬───────┘                     └──────────────────┘
//!        │ guarded writes
//!        ▼
//! ┌──────────────────────────────────────────────────────┐
//! │ ledger (idempotency keys, per-player issuance)        │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`config`]: TOML configuration with fail-closed validation
//! - [`context`]: transaction-local authority state and the authority guard
//! - [`gaming_day`]: tenant-offset business-day boundary computation
//! - [`identity`]: staff identity records and the identity resolver
//! - [`ledger`]: append-only point ledger and the issuance engine
//! - [`policy`]: read-only tier policy input
//! - [`sessions`]: read-only rating-session input rows
//! - [`store`]: `SQLite` store, connection pool, and per-player lock table
//! - [`token`]: HMAC-signed staff bearer tokens
//!
//! # Authority Model
//!
//! No component trusts caller-supplied scoping parameters. The authoritative
//! `(tenant, actor, role)` triple is derived inside each transaction from
//! the signed token plus a fresh identity-record query, held in a set-once
//! cell inside [`store::StoreTxn`] that cannot outlive the transaction, and
//! re-derived from scratch for the next transaction. Caller-supplied tenant
//! ids are accepted only as redundant confirmation and rejected on mismatch.

pub mod config;
pub mod context;
pub mod gaming_day;
pub mod identity;
pub mod ledger;
pub mod policy;
pub mod sessions;
pub mod store;
pub mod token;

#[cfg(any(test, feature = "testkit"))]
#[doc(hidden)]
pub mod testkit;
