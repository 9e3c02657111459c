//! Beamline information device.
//!
//! Declares the concrete attribute catalogue published to beamlines: control
//! room messages, forwarded machine-protection and beam-monitor values, the
//! beam current in mA, the derived operation status, and the aggregated
//! device state.

use crate::attributes::{AttrValue, AttributeSpec, DisplayLevel, ValueType};
use crate::config::Config;
use crate::derivation::functions::{operation_status_rule, scaled_rule};
use crate::error::Result;
use crate::facade::FacadeBuilder;
use crate::proxy::RemoteValueProxy;
use crate::status::{StatusAggregator, SubSource};
use std::sync::Arc;

pub const GENERAL_INFO: &str = "GeneralInfo";
pub const FILLING_PATTERN: &str = "FillingPattern";
pub const INJECTION_STATUS: &str = "InjectionStatus";
pub const EXPERIMENT_ENABLE: &str = "ExperimentEnable";
pub const RAW_BEAM_CURRENT: &str = "RawBeamCurrent";
pub const BEAM_CURRENT: &str = "BeamCurrent";
pub const BIM_STATE: &str = "BIMState";
pub const MPS_STATE: &str = "MPSState";
pub const OPERATION_STATUS: &str = "OperationStatus";

pub const MPS_LABEL: &str = "MPS PLC device";
pub const BIM_LABEL: &str = "BIM device";

/// Remote sources backing the proxied attributes.
pub struct BeamlineSources {
    pub injection_status: Arc<dyn RemoteValueProxy>,
    pub experiment_enable: Arc<dyn RemoteValueProxy>,
    /// Beam current in A.
    pub beam_current: Arc<dyn RemoteValueProxy>,
    pub bim_state: Arc<dyn RemoteValueProxy>,
    pub mps_state: Arc<dyn RemoteValueProxy>,
}

/// Assemble the beamline facade. Call [`FacadeBuilder::start`] on the result.
pub fn build(config: &Config, sources: BeamlineSources) -> Result<FacadeBuilder> {
    FacadeBuilder::from_config(config)
        .local(
            AttributeSpec::local(GENERAL_INFO, AttrValue::from("No information."))
                .with_label("General info")
                .with_doc("General message from CR to all beamlines."),
        )?
        .local(
            AttributeSpec::local(FILLING_PATTERN, AttrValue::from("No filling pattern."))
                .with_label("Filling Pattern")
                .with_doc("The filling pattern currently used in the storage ring."),
        )?
        .proxied(
            AttributeSpec::proxied(INJECTION_STATUS, ValueType::Bool)
                .with_doc("Forwarded injection status tag from MPS PLC."),
            sources.injection_status,
        )?
        .proxied(
            AttributeSpec::proxied(EXPERIMENT_ENABLE, ValueType::Bool)
                .with_doc("Forwarded experiment enable status tag from MPS PLC."),
            sources.experiment_enable,
        )?
        .proxied(
            AttributeSpec::proxied(RAW_BEAM_CURRENT, ValueType::Float)
                .with_label("Beam Current in A")
                .with_unit("A")
                .with_doc("Forwarded beam current from BIM."),
            sources.beam_current,
        )?
        .proxied(
            AttributeSpec::proxied(BIM_STATE, ValueType::State)
                .with_doc("State of the beam intensity monitor."),
            sources.bim_state,
        )?
        .proxied(
            AttributeSpec::proxied(MPS_STATE, ValueType::State)
                .with_doc("State of the MPS PLC device."),
            sources.mps_state,
        )?
        .logical(scaled_rule(
            AttributeSpec::logical(BEAM_CURRENT, ValueType::Float)
                .with_label("Beam Current in mA")
                .with_unit("mA")
                .with_display_level(DisplayLevel::Expert)
                .with_doc("Forwarded beam current from BIM. It is displayed in mA."),
            RAW_BEAM_CURRENT,
            config.beam.scale_factor,
        ))?
        .logical(operation_status_rule(
            AttributeSpec::logical(OPERATION_STATUS, ValueType::Str)
                .with_label("Operation Status")
                .with_doc("One of: Injection, MDT (Machine Dedicated Time), Experiment Enable."),
            BEAM_CURRENT,
            EXPERIMENT_ENABLE,
            INJECTION_STATUS,
            config.beam.experiment_threshold_ma,
        ))?
        .status(StatusAggregator::new(
            SubSource::new(MPS_LABEL, MPS_STATE),
            SubSource::new(BIM_LABEL, BIM_STATE),
        ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::{DevState, Freshness};
    use crate::error::FacadeError;
    use crate::facade::FacadeNode;
    use crate::input::simulation::SimulatedBeamline;
    use crate::status::Severity;

    async fn started() -> (SimulatedBeamline, FacadeNode) {
        let config = Config::default();
        let sim = SimulatedBeamline::new(&config.sources);
        let node = build(&config, sim.sources()).unwrap().start();
        node.refresh_all().await;
        (sim, node)
    }

    fn text(node: &FacadeNode, name: &str) -> String {
        node.read_attribute(name)
            .unwrap()
            .value
            .unwrap()
            .as_str()
            .unwrap()
            .to_string()
    }

    #[tokio::test]
    async fn test_catalogue_defaults() {
        let (_sim, node) = started().await;

        assert_eq!(node.name(), "InformationForBeamlines");
        assert_eq!(text(&node, GENERAL_INFO), "No information.");
        assert_eq!(text(&node, FILLING_PATTERN), "No filling pattern.");
        assert_eq!(
            node.read_attribute(BEAM_CURRENT).unwrap().value,
            Some(AttrValue::Float(250.0))
        );
        assert_eq!(text(&node, OPERATION_STATUS), "Experiment Enable");

        let report = node.current_status().unwrap();
        assert_eq!(report.severity, Severity::Nominal);
        assert_eq!(text(&node, "Status"), "Everything is OK.");
        assert_eq!(
            node.read_attribute("State").unwrap().value,
            Some(AttrValue::State(DevState::On))
        );
    }

    #[tokio::test]
    async fn test_describe_carries_metadata() {
        let (_sim, node) = started().await;

        let spec = node.describe(BEAM_CURRENT).unwrap();
        assert_eq!(spec.unit.as_deref(), Some("mA"));
        assert_eq!(spec.label, "Beam Current in mA");

        let spec = node.describe(INJECTION_STATUS).unwrap();
        assert_eq!(spec.display_level, DisplayLevel::Expert);
        assert!(!spec.is_writable());

        assert!(node.describe(GENERAL_INFO).unwrap().is_writable());
        assert_eq!(node.attribute_names().len(), 11);
    }

    #[tokio::test]
    async fn test_operation_status_follows_sources() {
        let (sim, node) = started().await;
        let mut events = node.subscribe(OPERATION_STATUS);

        sim.injection_status.set(true);
        node.refresh(INJECTION_STATUS).await.unwrap();
        assert_eq!(text(&node, OPERATION_STATUS), "Injection");
        assert_eq!(events.try_recv().unwrap().new, AttrValue::from("Injection"));

        sim.injection_status.set(false);
        sim.beam_current.set(0.0005);
        node.refresh(INJECTION_STATUS).await.unwrap();
        node.refresh(RAW_BEAM_CURRENT).await.unwrap();
        // 0.5 mA is below the threshold
        assert_eq!(text(&node, OPERATION_STATUS), "MDT");

        sim.beam_current.set(0.2);
        sim.experiment_enable.set(false);
        node.refresh(RAW_BEAM_CURRENT).await.unwrap();
        node.refresh(EXPERIMENT_ENABLE).await.unwrap();
        assert_eq!(text(&node, OPERATION_STATUS), "MDT");
    }

    #[tokio::test]
    async fn test_status_reports_faulted_devices() {
        let (sim, node) = started().await;

        sim.bim_state.set(DevState::Fault);
        node.refresh(BIM_STATE).await.unwrap();
        let report = node.current_status().unwrap();
        assert_eq!(report.severity, Severity::Faulted);
        assert_eq!(report.reason, "BIM device is in FAULT.");

        sim.mps_state.set(DevState::Standby);
        node.refresh(MPS_STATE).await.unwrap();
        let report = node.current_status().unwrap();
        assert_eq!(report.severity, Severity::Degraded);
        assert_eq!(
            report.reason,
            "MPS PLC device is in an unexpected state: STANDBY"
        );
        assert_eq!(
            node.read_attribute("State").unwrap().value,
            Some(AttrValue::State(DevState::Alarm))
        );
    }

    #[tokio::test]
    async fn test_unreachable_beam_monitor_goes_stale() {
        let (sim, node) = started().await;

        sim.beam_current.fail();
        node.refresh(RAW_BEAM_CURRENT).await.unwrap();

        let raw = node.read_attribute(RAW_BEAM_CURRENT).unwrap();
        assert_eq!(raw.value, Some(AttrValue::Float(0.25)));
        assert_eq!(raw.freshness, Freshness::Stale);
        for name in [BEAM_CURRENT, OPERATION_STATUS] {
            assert!(matches!(
                node.read_attribute(name),
                Err(FacadeError::DerivationUnavailable { .. })
            ));
        }

        sim.beam_current.set(0.3);
        node.refresh(RAW_BEAM_CURRENT).await.unwrap();
        assert!(node.read_attribute(BEAM_CURRENT).unwrap().is_fresh());
        assert_eq!(text(&node, OPERATION_STATUS), "Experiment Enable");
    }

    #[tokio::test]
    async fn test_unreachable_bim_is_reported() {
        let (sim, node) = started().await;

        sim.bim_state.fail();
        node.refresh(BIM_STATE).await.unwrap();

        let report = node.current_status().unwrap();
        assert_eq!(report.severity, Severity::Degraded);
        assert_eq!(report.reason, "BIM device is in an unexpected state: UNKNOWN");
        assert_eq!(
            node.read_attribute("State").unwrap().value,
            Some(AttrValue::State(DevState::Alarm))
        );
    }

    #[tokio::test]
    async fn test_operator_messages_are_writable() {
        let (_sim, node) = started().await;
        let mut all = node.subscribe(crate::notify::Scope::All);

        node.write_attribute(FILLING_PATTERN, "Hybrid").await.unwrap();
        let event = all.try_recv().unwrap();
        assert_eq!(event.attribute, FILLING_PATTERN);
        assert_eq!(event.new, AttrValue::from("Hybrid"));

        assert!(matches!(
            node.write_attribute(OPERATION_STATUS, "Injection").await,
            Err(FacadeError::NotWritable(_))
        ));
        assert!(matches!(
            node.write_attribute(MPS_STATE, DevState::On).await,
            Err(FacadeError::NotWritable(_))
        ));
    }
}
