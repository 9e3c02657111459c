//! Input sources feeding the facade.
//!
//! Current input sources:
//! - `simulation`: in-memory remote sources for development and tests

pub mod simulation;

pub use simulation::{SimulatedBeamline, SimulatedProxy, run_beamline_simulation};
