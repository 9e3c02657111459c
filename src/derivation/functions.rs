//! Derivation functions used by the beamline facade.

use super::{Inputs, LogicalAttribute};
use crate::attributes::{AttrValue, AttributeSpec};
use crate::error::Result;
use std::sync::Arc;
use strum::{Display, EnumString};

/// What the machine is currently used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
pub enum OperationStatus {
    #[strum(serialize = "Injection")]
    Injection,
    #[strum(serialize = "Experiment Enable")]
    ExperimentEnable,
    /// Machine Dedicated Time
    #[strum(serialize = "MDT")]
    Mdt,
}

/// Classify machine operation. Injection dominates; experiments need both
/// the enable flag and beam current strictly above the threshold.
pub fn operation_status(
    beam_current: f64,
    experiment_enable: bool,
    injection: bool,
    threshold: f64,
) -> OperationStatus {
    if injection {
        OperationStatus::Injection
    } else if beam_current > threshold && experiment_enable {
        OperationStatus::ExperimentEnable
    } else {
        OperationStatus::Mdt
    }
}

/// Linear unit conversion (e.g. A to mA with a factor of 1000).
pub fn scale(raw: f64, factor: f64) -> f64 {
    raw * factor
}

/// Logical string attribute bound to `[beam_current, experiment_enable, injection]`.
pub fn operation_status_rule(
    spec: AttributeSpec,
    beam_current: &str,
    experiment_enable: &str,
    injection: &str,
    threshold: f64,
) -> LogicalAttribute {
    LogicalAttribute::new(
        spec,
        [beam_current, experiment_enable, injection],
        Arc::new(move |inputs: &Inputs<'_>| -> Result<AttrValue> {
            let status = operation_status(
                inputs.float(0)?,
                inputs.boolean(1)?,
                inputs.boolean(2)?,
                threshold,
            );
            Ok(AttrValue::Str(status.to_string()))
        }),
    )
}

/// Logical float attribute: `raw * factor`.
pub fn scaled_rule(spec: AttributeSpec, raw: &str, factor: f64) -> LogicalAttribute {
    LogicalAttribute::new(
        spec,
        [raw],
        Arc::new(move |inputs: &Inputs<'_>| -> Result<AttrValue> {
            Ok(AttrValue::Float(scale(inputs.float(0)?, factor)))
        }),
    )
}
