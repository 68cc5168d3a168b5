//! # Vigil Database Crate
//!
//! This crate is the engine's "permanent archive": strategy execution states,
//! execution and decision records, and the orders placed per strategy.
//!
//! ## Architectural Principles
//!
//! - **Storage Seam:** the engine only sees the `StateStore` trait. PostgreSQL
//!   (`DbRepository`) backs live runs; `MemoryStore` backs paper runs and tests.
//! - **Asynchronous & Pooled:** All PostgreSQL operations are asynchronous and
//!   share a connection pool (`PgPool`).
//!
//! ## Public API
//!
//! - `database_url`, `connect`, `run_migrations`: connection bootstrap.
//! - `StateStore`, `DbRepository`, `MemoryStore`: the storage seam and its implementations.
//! - `DbError`: The specific error types that can be returned from this crate.

// Declare the modules that constitute this crate.
pub mod connection;
pub mod error;
pub mod memory;
pub mod repository;
pub mod store;

// Re-export the key components to create a clean, public-facing API.
pub use connection::{connect, database_url, run_migrations};
pub use error::DbError;
pub use memory::MemoryStore;
pub use repository::DbRepository;
pub use store::StateStore;
