//! Token issuance and marketplace synchronization engine
//!
//! This crate re-exports all the components of the mintbridge system.

pub use mintbridge_core::*;
pub use mintbridge_ledger::*;
pub use mintbridge_storage_impl::*;
pub use mintbridge_runtime::*;
