//! # oncewrite-core
//!
//! Core abstractions shared by every oncewrite component.
//!
//! - **Key Store**: the minimal contract the idempotency coordinator needs from its
//!   shared backend (atomic create-if-absent, compare-and-replace, delete, TTL expiry)
//! - **Error Types**: shared error definitions and result types
//! - **Observability**: logging initialization and span helpers
//!
//! ## Example
//!
//! ```rust
//! use oncewrite_core::prelude::*;
//!
//! // Every idempotency coordinator instance shares one store
//! let store = MemoryKeyStore::new();
//! assert!(store.is_empty());
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod key_store;
pub mod observability;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::key_store::{
        KeyStore, MemoryKeyStore, StoredValue, WritePrecondition, WriteResult,
    };
}

pub use error::{Error, Result};
pub use key_store::{
    KeyStore, MemoryKeyStore, StoredValue, WritePrecondition, WriteResult, spawn_expiry_sweep,
};
pub use observability::{LogFormat, init_logging};
