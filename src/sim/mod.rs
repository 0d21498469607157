//! Built-in simulated broker
//!
//! Runs inside the `trade-sim` worker process: one account per session,
//! fills simulated against the instrument table's top of book.

pub mod engine;
pub mod instrument;
pub mod model;
pub mod quotes;
pub mod store;
pub mod worker;

pub use engine::{PersistedState, Rejection, SimEngine};
pub use instrument::{Instrument, InstrumentTable};
pub use quotes::QuoteMatrix;
pub use store::SnapshotStore;
pub use worker::SimWorker;
