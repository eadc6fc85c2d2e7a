//! # Warden Core
//!
//! Pure domain types for the Warden workload-identity control plane.
//!
//! ## Design Principles
//!
//! This crate is intentionally **IO-free**:
//! - No filesystem operations
//! - No network calls
//! - No database interactions
//! - No crypto
//!
//! All types are plain Rust structs/enums with serde serialization where the
//! daemon persists them. Parsing and validation of identifiers lives here so
//! that every component agrees on what a well-formed SPIFFE ID, selector or
//! registration entry looks like. The actual IO (signing, persistence, gRPC)
//! lives in `warden-server`.
//!
//! ## Modules
//!
//! - [`id`] - Trust domains and SPIFFE IDs
//! - [`selector`] - Node and workload selectors
//! - [`entry`] - Registration entries
//! - [`node`] - Attested node records
//! - [`bundle`] - Trust bundles
//! - [`token`] - Join tokens

pub mod bundle;
pub mod entry;
pub mod id;
pub mod node;
pub mod selector;
pub mod token;

pub use bundle::Bundle;
pub use entry::{EntryError, RegistrationEntry};
pub use id::{IdError, SpiffeId, TrustDomain};
pub use node::AttestedNode;
pub use selector::{Selector, SelectorMatch};
pub use token::JoinToken;
