//! Simulated remote sources for development and testing.
//!
//! [`SimulatedProxy`] is an in-memory [`RemoteValueProxy`] whose value and
//! availability can be driven from tests. [`run_beamline_simulation`] cycles
//! a full set of beamline sources through injection, experiment and fault
//! phases so the facade has something to publish.

use crate::attributes::{AttrValue, DevState};
use crate::beamline::BeamlineSources;
use crate::config::SourceConfig;
use crate::proxy::{ProxyError, RemoteValueProxy};
use async_trait::async_trait;
use log::info;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::task::JoinHandle;
use tokio::time::{Duration, interval};
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
struct SimState {
    value: Option<AttrValue>,
    failing: bool,
    writable: bool,
}

/// In-memory stand-in for a remote source.
#[derive(Debug)]
pub struct SimulatedProxy {
    source: String,
    state: Mutex<SimState>,
    reads: AtomicU32,
}

impl SimulatedProxy {
    /// Create a read-only source with no value yet.
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            state: Mutex::new(SimState {
                value: None,
                failing: false,
                writable: false,
            }),
            reads: AtomicU32::new(0),
        }
    }

    /// Create a source that starts with a value.
    pub fn with_value(source: impl Into<String>, value: impl Into<AttrValue>) -> Self {
        let proxy = Self::new(source);
        proxy.set(value);
        proxy
    }

    /// Accept writes forwarded from the facade.
    pub fn writable(self) -> Self {
        self.state.lock().writable = true;
        self
    }

    /// Set the remote value and make the source reachable again.
    pub fn set(&self, value: impl Into<AttrValue>) {
        let mut state = self.state.lock();
        state.value = Some(value.into());
        state.failing = false;
    }

    /// Make reads fail as if the source were unreachable.
    pub fn fail(&self) {
        self.state.lock().failing = true;
    }

    /// Answer reads with no value.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.value = None;
        state.failing = false;
    }

    pub fn value(&self) -> Option<AttrValue> {
        self.state.lock().value.clone()
    }

    /// Number of reads served so far.
    pub fn reads(&self) -> u32 {
        self.reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteValueProxy for SimulatedProxy {
    fn source(&self) -> &str {
        &self.source
    }

    async fn read(&self) -> Result<Option<AttrValue>, ProxyError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock();
        if state.failing {
            return Err(ProxyError::Unreachable(self.source.clone()));
        }
        Ok(state.value.clone())
    }

    async fn write(&self, value: AttrValue) -> Result<(), ProxyError> {
        let mut state = self.state.lock();
        if !state.writable {
            return Err(ProxyError::ReadOnly);
        }
        if state.failing {
            return Err(ProxyError::Unreachable(self.source.clone()));
        }
        state.value = Some(value);
        Ok(())
    }
}

/// Simulated versions of every beamline source.
#[derive(Clone)]
pub struct SimulatedBeamline {
    pub injection_status: Arc<SimulatedProxy>,
    pub experiment_enable: Arc<SimulatedProxy>,
    pub beam_current: Arc<SimulatedProxy>,
    pub bim_state: Arc<SimulatedProxy>,
    pub mps_state: Arc<SimulatedProxy>,
}

impl SimulatedBeamline {
    /// Sources named after the configured tags, starting in a healthy,
    /// beam-delivering state.
    pub fn new(tags: &SourceConfig) -> Self {
        Self {
            injection_status: Arc::new(SimulatedProxy::with_value(
                &tags.injection_status_tag,
                false,
            )),
            experiment_enable: Arc::new(SimulatedProxy::with_value(
                &tags.experiment_enable_tag,
                true,
            )),
            beam_current: Arc::new(SimulatedProxy::with_value(&tags.beam_current_attr, 0.25)),
            bim_state: Arc::new(SimulatedProxy::with_value(
                &tags.bim_state_tag,
                DevState::On,
            )),
            mps_state: Arc::new(SimulatedProxy::with_value(
                &tags.mps_state_tag,
                DevState::Running,
            )),
        }
    }

    pub fn sources(&self) -> BeamlineSources {
        BeamlineSources {
            injection_status: self.injection_status.clone(),
            experiment_enable: self.experiment_enable.clone(),
            beam_current: self.beam_current.clone(),
            bim_state: self.bim_state.clone(),
            mps_state: self.mps_state.clone(),
        }
    }

    /// Apply one step of the simulated machine cycle.
    pub fn step(&self, tick: u32) {
        match tick % 6 {
            0 => {
                info!("[Sim] Injection started");
                self.injection_status.set(true);
                self.beam_current.set(0.05);
            }
            1 => {
                info!("[Sim] Injection finished, beam at 250 mA");
                self.injection_status.set(false);
                self.beam_current.set(0.25);
            }
            2 => {
                info!("[Sim] BIM went to FAULT");
                self.bim_state.set(DevState::Fault);
            }
            3 => {
                info!("[Sim] BIM recovered");
                self.bim_state.set(DevState::On);
            }
            4 => {
                info!("[Sim] Beam dumped, experiments disabled");
                self.beam_current.set(0.0);
                self.experiment_enable.set(false);
            }
            _ => {
                info!("[Sim] Experiments enabled");
                self.experiment_enable.set(true);
            }
        }
    }
}

/// Spawn a task that advances the simulated machine cycle every `period`
/// until `cancel` fires.
pub fn run_beamline_simulation(
    beamline: SimulatedBeamline,
    period: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        // The first tick completes immediately; keep the initial state for one period
        ticker.tick().await;
        let mut tick = 0u32;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    beamline.step(tick);
                    tick = tick.wrapping_add(1);
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_proxy_read_states() {
        let proxy = SimulatedProxy::new("diag/bim/1/Current");
        assert_eq!(proxy.read().await.unwrap(), None);

        proxy.set(0.2);
        assert_eq!(proxy.read().await.unwrap(), Some(AttrValue::Float(0.2)));

        proxy.fail();
        assert!(matches!(
            proxy.read().await,
            Err(ProxyError::Unreachable(_))
        ));
        assert_eq!(proxy.reads(), 3);
    }

    #[tokio::test]
    async fn test_write_requires_writable_source() {
        let read_only = SimulatedProxy::new("a");
        assert!(matches!(
            read_only.write(AttrValue::Bool(true)).await,
            Err(ProxyError::ReadOnly)
        ));

        let writable = SimulatedProxy::new("b").writable();
        writable.write(AttrValue::Bool(true)).await.unwrap();
        assert_eq!(writable.value(), Some(AttrValue::Bool(true)));
    }

    #[test]
    fn test_simulation_cycle_returns_to_start() {
        let beamline = SimulatedBeamline::new(&crate::config::Config::default().sources);
        beamline.step(0);
        assert_eq!(beamline.injection_status.value(), Some(AttrValue::Bool(true)));
        beamline.step(2);
        assert_eq!(beamline.bim_state.value(), Some(AttrValue::State(DevState::Fault)));
        for tick in 3..6 {
            beamline.step(tick);
        }
        assert_eq!(beamline.bim_state.value(), Some(AttrValue::State(DevState::On)));
        assert_eq!(beamline.experiment_enable.value(), Some(AttrValue::Bool(true)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_simulation_task_stops_on_cancel() {
        let beamline = SimulatedBeamline::new(&crate::config::Config::default().sources);
        let cancel = CancellationToken::new();
        let handle = run_beamline_simulation(
            beamline.clone(),
            Duration::from_secs(10),
            cancel.clone(),
        );

        tokio::time::sleep(Duration::from_secs(15)).await;
        assert_eq!(beamline.injection_status.value(), Some(AttrValue::Bool(true)));

        cancel.cancel();
        handle.await.unwrap();
    }
}
