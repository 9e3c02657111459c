//! Status aggregator.
//!
//! Folds the states of two upstream devices into one overall severity and
//! a reason string. The classifier is stateless: the result depends only on
//! the two current sub-states, checked in a fixed priority order (the
//! primary source first, faults before unexpected states).

use crate::attributes::{AttrValue, AttributeCache, DevState, Freshness};
use crate::error::{FacadeError, Result};
use serde::{Deserialize, Serialize};
use strum::Display;

/// Published name of the aggregated state attribute.
pub const STATE_ATTRIBUTE: &str = "State";
/// Published name of the aggregated reason attribute.
pub const STATUS_ATTRIBUTE: &str = "Status";

pub const NOMINAL_REASON: &str = "Everything is OK.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
pub enum Severity {
    Nominal,
    Degraded,
    Faulted,
}

impl Severity {
    /// State published for this severity.
    pub fn dev_state(self) -> DevState {
        match self {
            Severity::Nominal => DevState::On,
            Severity::Degraded => DevState::Alarm,
            Severity::Faulted => DevState::Fault,
        }
    }
}

/// Aggregated classification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub severity: Severity,
    pub reason: String,
}

impl StatusReport {
    fn new(severity: Severity, reason: impl Into<String>) -> Self {
        Self {
            severity,
            reason: reason.into(),
        }
    }
}

/// One status-contributing device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubSource {
    /// Display name used in reasons (e.g. "MPS PLC device").
    pub label: String,
    /// Cached attribute holding the device state.
    pub attribute: String,
}

impl SubSource {
    pub fn new(label: impl Into<String>, attribute: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            attribute: attribute.into(),
        }
    }

    fn check(&self, state: DevState) -> Option<StatusReport> {
        if state == DevState::Fault {
            Some(StatusReport::new(
                Severity::Faulted,
                format!("{} is in FAULT.", self.label),
            ))
        } else if !state.is_healthy() {
            Some(StatusReport::new(
                Severity::Degraded,
                format!("{} is in an unexpected state: {}", self.label, state),
            ))
        } else {
            None
        }
    }
}

/// Result of evaluating the aggregator against the cache.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusReading {
    pub report: StatusReport,
    /// Stale when either sub-state is stale or missing. A stale sub-state
    /// is already classified as `Unknown` in `report`.
    pub freshness: Freshness,
}

pub struct StatusAggregator {
    primary: SubSource,
    secondary: SubSource,
}

impl StatusAggregator {
    pub fn new(primary: SubSource, secondary: SubSource) -> Self {
        Self { primary, secondary }
    }

    /// Cached attributes the aggregator reads.
    pub fn inputs(&self) -> [&str; 2] {
        [self.primary.attribute.as_str(), self.secondary.attribute.as_str()]
    }

    pub fn depends_on(&self, name: &str) -> bool {
        self.inputs().contains(&name)
    }

    /// Classify two sub-states. A missing state counts as `Unknown`, which
    /// is an unexpected state, never nominal.
    pub fn classify(
        &self,
        primary: Option<DevState>,
        secondary: Option<DevState>,
    ) -> StatusReport {
        let primary = primary.unwrap_or(DevState::Unknown);
        let secondary = secondary.unwrap_or(DevState::Unknown);

        self.primary
            .check(primary)
            .or_else(|| self.secondary.check(secondary))
            .unwrap_or_else(|| StatusReport::new(Severity::Nominal, NOMINAL_REASON))
    }

    /// Classify from a consistent snapshot of both sub-states.
    ///
    /// A sub-state whose last refresh failed is not trusted: it is
    /// classified as `Unknown`, like one that was never read.
    pub fn evaluate(&self, cache: &AttributeCache) -> Result<StatusReading> {
        let snapshot = cache.snapshot(self.inputs())?;
        let mut states = [None, None];
        let mut freshness = Freshness::Fresh;

        for (slot, name) in states.iter_mut().zip(self.inputs()) {
            let reading = snapshot
                .get(name)
                .ok_or_else(|| FacadeError::UnknownAttribute(name.to_string()))?;
            if !reading.is_fresh() {
                freshness = Freshness::Stale;
            }
            *slot = match &reading.value {
                None => None,
                Some(AttrValue::State(_)) if !reading.is_fresh() => None,
                Some(AttrValue::State(state)) => Some(*state),
                Some(other) => {
                    return Err(FacadeError::TypeMismatch {
                        attribute: name.to_string(),
                        expected: "state".to_string(),
                        found: other.value_type().to_string(),
                    });
                }
            };
        }

        Ok(StatusReading {
            report: self.classify(states[0], states[1]),
            freshness,
        })
    }
}
