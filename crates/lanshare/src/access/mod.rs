//! Client access control.
//!
//! This module decides which peers the share server will talk to:
//! - [`AccessPolicy`] holds the allowed/blocked address sets
//! - [`AddressStore`] persists each set (JSON file by default)

pub mod policy;
pub mod store;

pub use policy::{AccessPolicy, AddressSet, ListKind};
pub use store::{AddressStore, JsonAddressStore, StoreError};
