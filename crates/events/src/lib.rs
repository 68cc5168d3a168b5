//! # Vigil Events
//!
//! The engine's in-process messaging: the `StrategyBus` that carries newly
//! published strategies to the coordinator, and the `EngineEvent`s the engine
//! broadcasts about what it did.
//!
//! Like the other Layer 0 crates, it depends only on `core-types`.

// Declare the modules that make up this crate.
pub mod bus;
pub mod error;
pub mod messages;

// Re-export the core types to provide a clean public API.
pub use bus::{StrategyBus, StrategyMessage};
pub use error::EventsError;
pub use messages::{EmergencyClose, EngineEvent, PhaseChange};
