//! Beamline information bridge library.
//!
//! A supervisory facade that mirrors values from remote control sources,
//! derives logical attributes from them, aggregates an overall device
//! status, and notifies subscribers of every change.

pub mod attributes;
pub mod beamline;
pub mod config;
pub mod derivation;
pub mod error;
pub mod facade;
pub mod input;
pub mod notify;
pub mod proxy;
pub mod status;

pub use error::{FacadeError, Result};
pub use facade::{FacadeBuilder, FacadeNode};
