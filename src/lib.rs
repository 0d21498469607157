//! Trade Gateway - Core Library
//! Multi-tenant trading gateway: per-user worker processes behind a
//! shared-memory bus, plus a built-in simulated futures broker.

// Public modules
pub mod bus;
pub mod core;
pub mod gateway;
pub mod protocol;
pub mod shutdown;
pub mod sim;

// Re-exports
pub use core::{Config, Error, Result};
