//! # Shopfloor
//!
//! ERP change-tracking synchronizer and work-order reconciliation engine on
//! the `may` runtime.
//!
//! [`sync`] replicates whitelisted upstream ERP tables into per-tenant
//! PostgreSQL replicas. [`mes`] keeps dispatch statistics, consistency
//! findings and the completed-work-order archive in line with the reports
//! operators file.

pub mod admin;
pub mod config;
pub mod connection;
pub mod executor;
pub mod mes;
pub mod metrics;
pub mod raw_sql;
pub mod sync;
pub mod tenant;
pub mod transaction;

#[cfg(any(test, feature = "test-helpers"))]
pub mod test_helpers;

pub use config::EngineConfig;
pub use executor::{DbError, Executor, PgExecutor};
pub use tenant::{PgTenantStore, Tenant, TenantDirectory, TenantStore};
