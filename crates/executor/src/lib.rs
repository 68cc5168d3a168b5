//! # Vigil Executor Crate
//!
//! This crate turns validated `Decision`s into venue calls and provides a
//! simulated venue to run them against.
//!
//! ## Architectural Principles
//!
//! - **Policy vs. Mechanics:** the `Dispatcher` only translates. Phase gating,
//!   risk checks and duplicate detection are the engine's job and happen
//!   before a decision reaches this crate.
//! - **Venue Abstraction:** everything here talks to `Arc<dyn VenueAdapter>`,
//!   so the engine can run unchanged against Bitget or the `PaperVenue`.
//!
//! ## Public API
//!
//! - `Dispatcher`: maps each `DecisionAction` onto adapter calls, sizing
//!   orders from their quote notional.
//! - `PaperVenue`: an in-memory `VenueAdapter` for tests and dry runs.
//! - `ExecutorError`: The specific error types that can be returned from this crate.

// Declare the modules that constitute this crate.
pub mod dispatch;
pub mod error;
pub mod paper;

// Re-export the key components to provide a clean, public-facing API.
pub use dispatch::{DispatchReport, Dispatcher, quantity_for_notional};
pub use error::ExecutorError;
pub use paper::PaperVenue;
