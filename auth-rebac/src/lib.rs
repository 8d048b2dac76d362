//! Relationship-based authorization for shared documents and folders
//!
//! This crate implements a Zanzibar-style authorization engine providing:
//! - Typed relationship tuples (ownership, group membership, folder hierarchy, sharing grants)
//! - A validated schema of rewrite rules, loadable from YAML or JSON
//! - `Check` with concurrent, depth-bounded evaluation
//! - `ListObjects` by walking the relation graph backwards from the subject
//! - Atomic, schema-checked mutations with parent-cycle and last-owner protection
//! - In-memory and PostgreSQL tuple stores
//!
//! # Core Concepts
//!
//! - **Entity**: a typed object, `user:alice`, `group:eng`, `folder:10`, `doc:99`
//! - **Userset**: every subject holding a relation on an entity, `group:eng#member`
//! - **Tuple**: "subject has relation to object"
//! - **Rewrite**: how a relation is derived (direct tuples, other relations, hops through `parent`)
//!
//! # Example
//!
//! ```rust
//! use auth_rebac::{AuthorizationEngine, DocumentAuthorizer, InMemoryTupleStore};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = AuthorizationEngine::new(Arc::new(InMemoryTupleStore::new()));
//!     let authz = DocumentAuthorizer::new(Arc::new(engine));
//!
//!     authz.create_folder("alice", "10", None).await?;
//!     authz.create_document("alice", "99", Some("10")).await?;
//!     authz.add_user_to_group("carol", "eng").await?;
//!     authz.assign_group_to_folder("eng", "10", auth_rebac::Access::Viewer).await?;
//!
//!     assert!(authz.can_read("carol", "99").await?);
//!     assert!(!authz.can_write("carol", "99").await?);
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod check;
pub mod config;
pub mod engine;
pub mod error;
pub mod facade;
pub mod list;
pub mod models;
pub mod mutation;
pub mod schema;
pub mod store;

pub use config::*;
pub use engine::*;
pub use error::*;
pub use facade::*;
pub use models::*;
pub use schema::*;
pub use store::{InMemoryTupleStore, PostgresTupleStore, TupleStore};
