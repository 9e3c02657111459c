//! Facade node: the composition root.
//!
//! Owns the attribute cache, the derivation engine, the status aggregator
//! and the change notifier, and exposes the read / write / status /
//! subscribe contract on top of them. While running, one task per proxied
//! attribute keeps the cache fresh and a second path applies values pushed
//! by remote sources.
//!
//! # Example
//! ```ignore
//! let node = FacadeBuilder::new("InformationForBeamlines", 64)
//!     .local(AttributeSpec::local("GeneralInfo", AttrValue::from("No information.")))?
//!     .proxied(AttributeSpec::proxied("InjectionStatus", ValueType::Bool), proxy)?
//!     .start();
//!
//! let mut events = node.subscribe("GeneralInfo");
//! node.write_attribute("GeneralInfo", "Beam dump at 14:00").await?;
//! ```

mod poller;

use crate::attributes::{
    AttrValue, AttributeCache, AttributeKind, AttributeSpec, Reading, Update, ValueType,
};
use crate::config::Config;
use crate::derivation::{DerivationEngine, LogicalAttribute};
use crate::error::{FacadeError, Result};
use crate::notify::{ChangeNotifier, Scope, Subscription};
use crate::proxy::{ProxyError, ProxyUpdate, RemoteValueProxy};
use crate::status::{
    STATE_ATTRIBUTE, STATUS_ATTRIBUTE, StatusAggregator, StatusReading, StatusReport,
};
use chrono::Utc;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Buffer for values pushed by remote sources.
const PUSH_CHANNEL_CAPACITY: usize = 64;

/// Collects attribute declarations, then starts a [`FacadeNode`].
pub struct FacadeBuilder {
    name: String,
    poll_interval: Duration,
    notifier: Arc<ChangeNotifier>,
    cache: AttributeCache,
    engine: DerivationEngine,
    aggregator: Option<StatusAggregator>,
}

impl FacadeBuilder {
    /// `queue_capacity` bounds every subscriber's event queue.
    pub fn new(name: impl Into<String>, queue_capacity: usize) -> Self {
        let notifier = Arc::new(ChangeNotifier::new(queue_capacity));
        Self {
            name: name.into(),
            poll_interval: Duration::from_secs(1),
            cache: AttributeCache::new(notifier.clone()),
            notifier,
            engine: DerivationEngine::new(),
            aggregator: None,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.device_name, config.notify.queue_capacity)
            .with_poll_interval(config.poll.interval())
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn local(mut self, spec: AttributeSpec) -> Result<Self> {
        self.check_reserved(&spec.name)?;
        self.cache.register_local(spec)?;
        Ok(self)
    }

    pub fn proxied(
        mut self,
        spec: AttributeSpec,
        proxy: Arc<dyn RemoteValueProxy>,
    ) -> Result<Self> {
        self.check_reserved(&spec.name)?;
        self.cache.register_proxied(spec, proxy)?;
        Ok(self)
    }

    pub fn logical(mut self, rule: LogicalAttribute) -> Result<Self> {
        self.check_reserved(&rule.spec.name)?;
        self.engine.register(&self.cache, rule)?;
        Ok(self)
    }

    /// Publish an aggregated `State`/`Status` pair. Both sub-sources must be
    /// state-typed attributes already registered in the cache.
    pub fn status(mut self, aggregator: StatusAggregator) -> Result<Self> {
        for name in [STATE_ATTRIBUTE, STATUS_ATTRIBUTE] {
            if self.cache.contains(name) || self.engine.contains(name) {
                return Err(FacadeError::DuplicateAttribute(name.to_string()));
            }
        }
        for input in aggregator.inputs() {
            match self.cache.spec(input) {
                Some(spec) if spec.value_type == ValueType::State => {}
                _ => {
                    return Err(FacadeError::InvalidBinding {
                        attribute: STATE_ATTRIBUTE.to_string(),
                        input: input.to_string(),
                    });
                }
            }
        }
        self.aggregator = Some(aggregator);
        Ok(self)
    }

    fn check_reserved(&self, name: &str) -> Result<()> {
        if self.aggregator.is_some() && (name == STATE_ATTRIBUTE || name == STATUS_ATTRIBUTE) {
            return Err(FacadeError::DuplicateAttribute(name.to_string()));
        }
        Ok(())
    }

    /// Start refresh and ingest tasks. Must be called inside a Tokio runtime.
    pub fn start(self) -> FacadeNode {
        let inner = Arc::new(Inner {
            name: self.name,
            cache: self.cache,
            engine: self.engine,
            aggregator: self.aggregator,
            notifier: self.notifier,
            published: Mutex::new(HashMap::new()),
        });
        inner.prime();

        let cancel = CancellationToken::new();
        let (updates, update_rx) = mpsc::channel(PUSH_CHANNEL_CAPACITY);

        let proxied = inner.cache.proxied_names();
        let mut tasks = Vec::with_capacity(proxied.len() + 1);
        for name in proxied {
            tasks.push(poller::spawn_poller(
                inner.clone(),
                name,
                self.poll_interval,
                cancel.clone(),
            ));
        }
        tasks.push(poller::spawn_ingest(inner.clone(), update_rx, cancel.clone()));

        info!(
            "[Facade] {} started: {} cached, {} logical attribute(s), {} poller(s)",
            inner.name,
            inner.cache.names().len(),
            inner.engine.names().len(),
            tasks.len() - 1
        );

        FacadeNode {
            inner,
            cancel,
            tasks: Mutex::new(tasks),
            updates,
        }
    }
}

/// State shared between the node handle and its background tasks.
pub(crate) struct Inner {
    name: String,
    cache: AttributeCache,
    engine: DerivationEngine,
    aggregator: Option<StatusAggregator>,
    notifier: Arc<ChangeNotifier>,
    /// Last published value of every logical and status attribute.
    /// Held while deriving so derived events stay in change order.
    published: Mutex<HashMap<String, AttrValue>>,
}

impl Inner {
    fn is_status_attribute(&self, name: &str) -> bool {
        self.aggregator.is_some() && (name == STATE_ATTRIBUTE || name == STATUS_ATTRIBUTE)
    }

    /// Seed published values so the first real transition is reported
    /// against the startup value.
    fn prime(&self) {
        for name in self.engine.names() {
            if let Err(e) = self.derive(name) {
                debug!("[Facade] {} has no initial value: {}", name, e);
            }
        }
        if self.aggregator.is_some()
            && let Err(e) = self.status()
        {
            warn!("[Facade] Initial status unavailable: {}", e);
        }
    }

    fn read(&self, name: &str) -> Result<Reading> {
        if self.cache.contains(name) {
            let reading = self.cache.get(name)?;
            if reading.value.is_none() {
                return Err(FacadeError::Unavailable(name.to_string()));
            }
            return Ok(reading);
        }
        if self.engine.contains(name) {
            return self.derive(name);
        }
        if self.is_status_attribute(name) {
            let reading = self.status()?;
            let value = if name == STATE_ATTRIBUTE {
                AttrValue::State(reading.report.severity.dev_state())
            } else {
                AttrValue::Str(reading.report.reason)
            };
            return Ok(Reading {
                value: Some(value),
                freshness: reading.freshness,
                updated_at: Some(Utc::now()),
            });
        }
        Err(FacadeError::UnknownAttribute(name.to_string()))
    }

    /// Evaluate a logical attribute and publish it if it changed.
    fn derive(&self, name: &str) -> Result<Reading> {
        let mut published = self.published.lock();
        let reading = self.engine.evaluate(name, &self.cache)?;
        if let Some(value) = &reading.value {
            self.publish_if_changed(&mut published, name, value.clone());
        }
        Ok(reading)
    }

    /// Re-run the status aggregator and publish `State`/`Status` transitions.
    fn status(&self) -> Result<StatusReading> {
        let aggregator = self
            .aggregator
            .as_ref()
            .ok_or_else(|| FacadeError::UnknownAttribute(STATE_ATTRIBUTE.to_string()))?;

        let mut published = self.published.lock();
        let reading = aggregator.evaluate(&self.cache)?;
        let state = AttrValue::State(reading.report.severity.dev_state());
        if self.publish_if_changed(&mut published, STATE_ATTRIBUTE, state) {
            info!(
                "[Facade] {} is now {}: {}",
                self.name, reading.report.severity, reading.report.reason
            );
        }
        self.publish_if_changed(
            &mut published,
            STATUS_ATTRIBUTE,
            AttrValue::Str(reading.report.reason.clone()),
        );
        Ok(reading)
    }

    fn publish_if_changed(
        &self,
        published: &mut HashMap<String, AttrValue>,
        name: &str,
        value: AttrValue,
    ) -> bool {
        let old = published.get(name).cloned();
        if old.as_ref() == Some(&value) {
            return false;
        }
        published.insert(name.to_string(), value.clone());
        self.notifier.publish(name, old, value);
        true
    }

    /// Recompute everything that depends on a cached attribute whose value
    /// or freshness changed.
    fn on_changed(&self, name: &str) {
        for dependent in self.engine.affected_by(name) {
            match self.derive(&dependent) {
                Ok(_) => {}
                Err(FacadeError::DerivationUnavailable { input, .. }) => {
                    debug!("[Facade] {} waits for {}", dependent, input);
                }
                Err(e) => warn!("[Facade] Derivation of {} failed: {}", dependent, e),
            }
        }

        if self
            .aggregator
            .as_ref()
            .is_some_and(|aggregator| aggregator.depends_on(name))
            && let Err(e) = self.status()
        {
            warn!("[Facade] Status aggregation failed: {}", e);
        }
    }

    async fn refresh(&self, name: &str) -> Result<Update> {
        let update = self.cache.refresh(name).await?;
        if update.affects_dependents() {
            self.on_changed(name);
        }
        Ok(update)
    }

    async fn write(&self, name: &str, value: AttrValue) -> Result<()> {
        let Some(spec) = self.cache.spec(name) else {
            if self.engine.contains(name) || self.is_status_attribute(name) {
                return Err(FacadeError::NotWritable(name.to_string()));
            }
            return Err(FacadeError::UnknownAttribute(name.to_string()));
        };
        if !spec.is_writable() {
            return Err(FacadeError::NotWritable(name.to_string()));
        }
        if value.value_type() != spec.value_type {
            return Err(FacadeError::TypeMismatch {
                attribute: name.to_string(),
                expected: spec.value_type.to_string(),
                found: value.value_type().to_string(),
            });
        }

        match spec.kind {
            AttributeKind::Local => {
                if self.cache.set(name, value)?.is_changed() {
                    info!("[Facade] {} written", name);
                    self.on_changed(name);
                }
                Ok(())
            }
            AttributeKind::Proxied => {
                let proxy = self
                    .cache
                    .proxy(name)
                    .ok_or_else(|| FacadeError::NotWritable(name.to_string()))?;
                match proxy.write(value).await {
                    Ok(()) => {}
                    Err(ProxyError::ReadOnly) => {
                        return Err(FacadeError::NotWritable(name.to_string()));
                    }
                    Err(e) => {
                        return Err(FacadeError::Remote {
                            attribute: name.to_string(),
                            message: e.to_string(),
                        });
                    }
                }
                info!("[Facade] {} forwarded to {}", name, proxy.source());
                self.refresh(name).await?;
                Ok(())
            }
            AttributeKind::Logical => Err(FacadeError::NotWritable(name.to_string())),
        }
    }

    /// Apply a value pushed by a remote source.
    fn ingest(&self, update: ProxyUpdate) {
        let name = update.attribute.as_str();
        match self.cache.spec(name) {
            Some(spec) if spec.kind == AttributeKind::Proxied => {}
            Some(_) => {
                warn!("[Facade] Ignoring pushed value for non-proxied {}", name);
                return;
            }
            None => {
                warn!("[Facade] Ignoring pushed value for unknown {}", name);
                return;
            }
        }

        match update.value {
            Some(value) => match self.cache.set(name, value) {
                Ok(Update::Unchanged) => {}
                Ok(_) => self.on_changed(name),
                Err(e) => {
                    warn!("[Facade] Rejected pushed value for {}: {}", name, e);
                    self.push_failed(name);
                }
            },
            None => {
                debug!("[Facade] {} reported unavailable by its source", name);
                self.push_failed(name);
            }
        }
    }

    fn push_failed(&self, name: &str) {
        match self.cache.mark_stale(name) {
            Ok(true) => {
                warn!("[Facade] {} is stale: its source pushed no usable value", name);
                self.on_changed(name);
            }
            Ok(false) => {}
            Err(e) => warn!("[Facade] Could not mark {} stale: {}", name, e),
        }
    }

    fn describe(&self, name: &str) -> Result<AttributeSpec> {
        if let Some(spec) = self.cache.spec(name) {
            return Ok(spec);
        }
        if let Some(spec) = self.engine.spec(name) {
            return Ok(spec.clone());
        }
        if self.is_status_attribute(name) {
            let spec = if name == STATE_ATTRIBUTE {
                AttributeSpec::logical(STATE_ATTRIBUTE, ValueType::State)
                    .with_doc("Aggregated device state.")
            } else {
                AttributeSpec::logical(STATUS_ATTRIBUTE, ValueType::Str)
                    .with_doc("Reason for the aggregated device state.")
            };
            return Ok(spec);
        }
        Err(FacadeError::UnknownAttribute(name.to_string()))
    }
}

/// A running facade.
///
/// Dropping the node cancels its tasks and closes every subscription;
/// [`shutdown`](Self::shutdown) additionally waits for the tasks to finish.
pub struct FacadeNode {
    inner: Arc<Inner>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    updates: mpsc::Sender<ProxyUpdate>,
}

impl FacadeNode {
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Current value of a local, proxied, logical or status attribute.
    ///
    /// Proxied attributes that never produced a value fail with
    /// `Unavailable`; logical attributes with a missing input fail with
    /// `DerivationUnavailable`. A stale value is returned as such.
    pub fn read_attribute(&self, name: &str) -> Result<Reading> {
        self.inner.read(name)
    }

    /// Write a local attribute, or forward a write to a writable proxied one.
    pub async fn write_attribute(&self, name: &str, value: impl Into<AttrValue>) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(FacadeError::ShutDown);
        }
        self.inner.write(name, value.into()).await
    }

    /// Latest aggregated status and reason.
    pub fn current_status(&self) -> Result<StatusReport> {
        self.inner.status().map(|reading| reading.report)
    }

    /// Latest aggregated status together with the freshness of its inputs.
    pub fn current_status_reading(&self) -> Result<StatusReading> {
        self.inner.status()
    }

    /// Subscribe to changes of one attribute or of all attributes.
    pub fn subscribe(&self, scope: impl Into<Scope>) -> Subscription {
        self.inner.notifier.subscribe(scope)
    }

    /// Channel for remote sources that push values instead of being polled.
    pub fn update_sender(&self) -> mpsc::Sender<ProxyUpdate> {
        self.updates.clone()
    }

    /// Refresh one proxied attribute now, outside its polling schedule.
    pub async fn refresh(&self, name: &str) -> Result<Update> {
        self.inner.refresh(name).await
    }

    /// Refresh every proxied attribute once.
    pub async fn refresh_all(&self) {
        for name in self.inner.cache.proxied_names() {
            if let Err(e) = self.inner.refresh(&name).await {
                warn!("[Facade] Refresh of {} failed: {}", name, e);
            }
        }
    }

    pub fn describe(&self, name: &str) -> Result<AttributeSpec> {
        self.inner.describe(name)
    }

    /// Every attribute name the facade answers to, sorted.
    pub fn attribute_names(&self) -> Vec<String> {
        let mut names = self.inner.cache.names();
        names.extend(self.inner.engine.names().iter().cloned());
        if self.inner.aggregator.is_some() {
            names.push(STATE_ATTRIBUTE.to_string());
            names.push(STATUS_ATTRIBUTE.to_string());
        }
        names.sort();
        names
    }

    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// Stop all refresh tasks, wait for them, and close every subscription.
    pub async fn shutdown(&self) {
        info!("[Facade] Shutting down {}...", self.inner.name);
        self.cancel.cancel();

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await
                && !e.is_cancelled()
            {
                warn!("[Facade] Task ended abnormally: {}", e);
            }
        }

        self.inner.notifier.close();
        info!("[Facade] {} shutdown complete", self.inner.name);
    }
}

impl Drop for FacadeNode {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.inner.notifier.close();
    }
}
