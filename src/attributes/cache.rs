//! Attribute cache: the single source of truth for current values.
//!
//! Holds the last known value of every local and proxied attribute. Reads
//! never touch the network; all remote I/O happens in [`AttributeCache::refresh`],
//! which funnels successful reads through [`AttributeCache::set`] and turns
//! failures into staleness.
//!
//! A single `RwLock` guards all entries. No I/O happens under the lock, so
//! refreshes of different attributes only contend for the few instructions
//! it takes to swap a value, and a snapshot of several inputs is taken under
//! one read guard.

use super::{AttrValue, AttributeKind, AttributeSpec};
use crate::error::{FacadeError, Result};
use crate::notify::ChangeNotifier;
use crate::proxy::RemoteValueProxy;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// The most recent read or write succeeded.
    Fresh,
    /// The last refresh failed or none has happened yet; the value (if any)
    /// is the last known good one.
    Stale,
}

/// A cached value together with its freshness.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    /// `None` means no value has ever been obtained.
    pub value: Option<AttrValue>,
    pub freshness: Freshness,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Reading {
    pub fn is_fresh(&self) -> bool {
        self.freshness == Freshness::Fresh
    }
}

/// What a write or refresh did to a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Update {
    /// Same value, same freshness.
    Unchanged,
    /// The value changed and a change event was published.
    Changed,
    /// Stale entry confirmed with its previous value.
    Recovered,
    /// A fresh entry went stale.
    WentStale,
}

impl Update {
    pub fn is_changed(self) -> bool {
        self == Update::Changed
    }

    /// Whether attributes computed from this one need recomputing.
    pub fn affects_dependents(self) -> bool {
        self != Update::Unchanged
    }
}

struct Entry {
    spec: AttributeSpec,
    value: Option<AttrValue>,
    freshness: Freshness,
    updated_at: Option<DateTime<Utc>>,
    /// Consecutive failed refreshes.
    failures: u32,
    version: u32,
}

impl Entry {
    fn reading(&self) -> Reading {
        Reading {
            value: self.value.clone(),
            freshness: self.freshness,
            updated_at: self.updated_at,
        }
    }
}

/// Point-in-time copy of several cache entries.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    readings: HashMap<String, Reading>,
}

impl Snapshot {
    pub fn get(&self, name: &str) -> Option<&Reading> {
        self.readings.get(name)
    }
}

/// Cache of local and proxied attribute values.
pub struct AttributeCache {
    entries: RwLock<HashMap<String, Entry>>,
    proxies: HashMap<String, Arc<dyn RemoteValueProxy>>,
    notifier: Arc<ChangeNotifier>,
}

impl AttributeCache {
    pub fn new(notifier: Arc<ChangeNotifier>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            proxies: HashMap::new(),
            notifier,
        }
    }

    /// Declare a local attribute.
    pub fn register_local(&mut self, spec: AttributeSpec) -> Result<()> {
        if spec.kind != AttributeKind::Local {
            return Err(FacadeError::InvalidBinding {
                attribute: spec.name,
                input: "local".to_string(),
            });
        }
        self.insert(spec)
    }

    /// Declare a proxied attribute bound to its remote source.
    pub fn register_proxied(
        &mut self,
        spec: AttributeSpec,
        proxy: Arc<dyn RemoteValueProxy>,
    ) -> Result<()> {
        if spec.kind != AttributeKind::Proxied {
            return Err(FacadeError::InvalidBinding {
                attribute: spec.name,
                input: proxy.source().to_string(),
            });
        }
        let name = spec.name.clone();
        self.insert(spec)?;
        self.proxies.insert(name, proxy);
        Ok(())
    }

    fn insert(&mut self, spec: AttributeSpec) -> Result<()> {
        let entries = self.entries.get_mut();
        if entries.contains_key(&spec.name) {
            return Err(FacadeError::DuplicateAttribute(spec.name));
        }
        if let Some(default) = &spec.default
            && default.value_type() != spec.value_type
        {
            return Err(type_mismatch(&spec, default));
        }

        // Local defaults count as known values; proxied ones wait for a refresh
        let freshness = match (&spec.kind, &spec.default) {
            (AttributeKind::Local, Some(_)) => Freshness::Fresh,
            _ => Freshness::Stale,
        };
        let updated_at = spec.default.as_ref().map(|_| Utc::now());
        entries.insert(
            spec.name.clone(),
            Entry {
                value: spec.default.clone(),
                spec,
                freshness,
                updated_at,
                failures: 0,
                version: 0,
            },
        );
        Ok(())
    }

    /// Last known value and freshness. Never blocks on a remote call.
    pub fn get(&self, name: &str) -> Result<Reading> {
        self.entries
            .read()
            .get(name)
            .map(Entry::reading)
            .ok_or_else(|| FacadeError::UnknownAttribute(name.to_string()))
    }

    pub fn spec(&self, name: &str) -> Option<AttributeSpec> {
        self.entries.read().get(name).map(|entry| entry.spec.clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.read().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Names of all proxied attributes.
    pub fn proxied_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.proxies.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn proxy(&self, name: &str) -> Option<Arc<dyn RemoteValueProxy>> {
        self.proxies.get(name).cloned()
    }

    /// Number of value changes recorded for an attribute.
    pub fn version(&self, name: &str) -> Option<u32> {
        self.entries.read().get(name).map(|entry| entry.version)
    }

    /// Copy several entries under one read guard.
    pub fn snapshot<I, S>(&self, names: I) -> Result<Snapshot>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let entries = self.entries.read();
        let mut readings = HashMap::new();
        for name in names {
            let name = name.as_ref();
            let entry = entries
                .get(name)
                .ok_or_else(|| FacadeError::UnknownAttribute(name.to_string()))?;
            readings.insert(name.to_string(), entry.reading());
        }
        Ok(Snapshot { readings })
    }

    /// Overwrite a cached value and mark it fresh.
    ///
    /// This is the single write path for both local writes and refreshes.
    /// The change event (if the value differs) is published while the write
    /// lock is held, so events for one attribute are queued in the order the
    /// changes happened.
    pub fn set(&self, name: &str, value: AttrValue) -> Result<Update> {
        let mut entries = self.entries.write();
        let entry = entries
            .get_mut(name)
            .ok_or_else(|| FacadeError::UnknownAttribute(name.to_string()))?;

        if value.value_type() != entry.spec.value_type {
            return Err(type_mismatch(&entry.spec, &value));
        }

        if entry.failures > 0 {
            info!(
                "[Cache] {} recovered after {} failed refresh(es)",
                name, entry.failures
            );
        }
        let was_stale = entry.freshness == Freshness::Stale;
        entry.freshness = Freshness::Fresh;
        entry.failures = 0;
        entry.updated_at = Some(Utc::now());

        if entry.value.as_ref() == Some(&value) {
            return Ok(if was_stale {
                Update::Recovered
            } else {
                Update::Unchanged
            });
        }

        let old = entry.value.replace(value.clone());
        entry.version = entry.version.wrapping_add(1);
        debug!("[Cache] {} changed: {:?} -> {}", name, old, value);
        self.notifier.publish(name, old, value);
        Ok(Update::Changed)
    }

    /// Mark an entry stale, keeping its last known value visible.
    /// Returns whether the entry was fresh before.
    pub fn mark_stale(&self, name: &str) -> Result<bool> {
        let mut entries = self.entries.write();
        let entry = entries
            .get_mut(name)
            .ok_or_else(|| FacadeError::UnknownAttribute(name.to_string()))?;
        let was_fresh = entry.freshness == Freshness::Fresh;
        entry.freshness = Freshness::Stale;
        entry.failures = entry.failures.saturating_add(1);
        Ok(was_fresh)
    }

    /// Pull the latest value through the attribute's proxy.
    ///
    /// Remote failures never propagate: they leave the previous value in
    /// place, marked stale. Local attributes have nothing to refresh.
    pub async fn refresh(&self, name: &str) -> Result<Update> {
        let Some(proxy) = self.proxy(name) else {
            if self.contains(name) {
                return Ok(Update::Unchanged);
            }
            return Err(FacadeError::UnknownAttribute(name.to_string()));
        };

        match proxy.read().await {
            Ok(Some(value)) => match self.set(name, value) {
                Ok(update) => Ok(update),
                Err(FacadeError::TypeMismatch { found, .. }) => {
                    self.note_failure(name, proxy.source(), &format!("wrong type {}", found))
                }
                Err(e) => Err(e),
            },
            Ok(None) => self.note_failure(name, proxy.source(), "no value"),
            Err(e) => self.note_failure(name, proxy.source(), &e.to_string()),
        }
    }

    fn note_failure(&self, name: &str, source: &str, reason: &str) -> Result<Update> {
        if self.mark_stale(name)? {
            warn!(
                "[Cache] {} is stale: read from {} failed ({})",
                name, source, reason
            );
            Ok(Update::WentStale)
        } else {
            debug!("[Cache] {} still stale: {} ({})", name, source, reason);
            Ok(Update::Unchanged)
        }
    }
}

fn type_mismatch(spec: &AttributeSpec, value: &AttrValue) -> FacadeError {
    FacadeError::TypeMismatch {
        attribute: spec.name.clone(),
        expected: spec.value_type.to_string(),
        found: value.value_type().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::ValueType;
    use crate::input::simulation::SimulatedProxy;
    use crate::notify::Scope;

    fn cache_with(proxy: Arc<SimulatedProxy>) -> (AttributeCache, Arc<ChangeNotifier>) {
        let notifier = Arc::new(ChangeNotifier::new(16));
        let mut cache = AttributeCache::new(notifier.clone());
        cache
            .register_local(AttributeSpec::local(
                "GeneralInfo",
                AttrValue::from("No information."),
            ))
            .unwrap();
        cache
            .register_proxied(
                AttributeSpec::proxied("RawBeamCurrent", ValueType::Float),
                proxy,
            )
            .unwrap();
        (cache, notifier)
    }

    #[test]
    fn test_initial_values() {
        let (cache, _) = cache_with(Arc::new(SimulatedProxy::new("bim")));

        let local = cache.get("GeneralInfo").unwrap();
        assert_eq!(local.value, Some(AttrValue::from("No information.")));
        assert!(local.is_fresh());

        let proxied = cache.get("RawBeamCurrent").unwrap();
        assert_eq!(proxied.value, None);
        assert_eq!(proxied.freshness, Freshness::Stale);
    }

    #[test]
    fn test_unknown_attribute() {
        let (cache, _) = cache_with(Arc::new(SimulatedProxy::new("bim")));
        assert!(matches!(
            cache.get("Nope"),
            Err(FacadeError::UnknownAttribute(_))
        ));
        assert!(matches!(
            cache.set("Nope", AttrValue::from(true)),
            Err(FacadeError::UnknownAttribute(_))
        ));
    }

    #[test]
    fn test_duplicate_registration_is_rejected() {
        let notifier = Arc::new(ChangeNotifier::new(4));
        let mut cache = AttributeCache::new(notifier);
        let spec = AttributeSpec::local("GeneralInfo", AttrValue::from(""));
        cache.register_local(spec.clone()).unwrap();
        assert!(matches!(
            cache.register_local(spec),
            Err(FacadeError::DuplicateAttribute(_))
        ));
    }

    #[test]
    fn test_set_rejects_wrong_type() {
        let (cache, _) = cache_with(Arc::new(SimulatedProxy::new("bim")));
        let err = cache.set("GeneralInfo", AttrValue::from(1.0)).unwrap_err();
        assert!(matches!(err, FacadeError::TypeMismatch { .. }));
    }

    #[test]
    fn test_set_same_value_emits_no_event() {
        let (cache, notifier) = cache_with(Arc::new(SimulatedProxy::new("bim")));
        let mut sub = notifier.subscribe(Scope::All);

        assert_eq!(
            cache
                .set("GeneralInfo", AttrValue::from("No information."))
                .unwrap(),
            Update::Unchanged
        );
        assert!(sub.try_recv().is_none());
        assert_eq!(cache.version("GeneralInfo"), Some(0));

        assert!(
            cache
                .set("GeneralInfo", AttrValue::from("Beam dump at 14:00"))
                .unwrap()
                .is_changed()
        );
        let event = sub.try_recv().unwrap();
        assert_eq!(event.old, Some(AttrValue::from("No information.")));
        assert_eq!(event.new, AttrValue::from("Beam dump at 14:00"));
        assert_eq!(cache.version("GeneralInfo"), Some(1));
    }

    #[tokio::test]
    async fn test_refresh_sets_fresh_value() {
        let proxy = Arc::new(SimulatedProxy::new("bim"));
        let (cache, _) = cache_with(proxy.clone());

        for current in [0.25, 0.5, 0.5, -0.002] {
            proxy.set(current);
            cache.refresh("RawBeamCurrent").await.unwrap();
            let reading = cache.get("RawBeamCurrent").unwrap();
            assert_eq!(reading.value, Some(AttrValue::Float(current)));
            assert!(reading.is_fresh());
        }
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_last_known_good() {
        let proxy = Arc::new(SimulatedProxy::new("bim"));
        let (cache, notifier) = cache_with(proxy.clone());

        proxy.set(0.3);
        cache.refresh("RawBeamCurrent").await.unwrap();
        let mut sub = notifier.subscribe(Scope::All);

        proxy.fail();
        assert_eq!(
            cache.refresh("RawBeamCurrent").await.unwrap(),
            Update::WentStale
        );
        let reading = cache.get("RawBeamCurrent").unwrap();
        assert_eq!(reading.value, Some(AttrValue::Float(0.3)));
        assert_eq!(reading.freshness, Freshness::Stale);
        assert!(sub.try_recv().is_none());

        // Only the first failure is a transition
        assert_eq!(
            cache.refresh("RawBeamCurrent").await.unwrap(),
            Update::Unchanged
        );

        // Same value after recovery: fresh again, still no event
        proxy.set(0.3);
        assert_eq!(
            cache.refresh("RawBeamCurrent").await.unwrap(),
            Update::Recovered
        );
        assert!(cache.get("RawBeamCurrent").unwrap().is_fresh());
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_refresh_without_value_marks_stale() {
        let proxy = Arc::new(SimulatedProxy::new("bim"));
        let (cache, _) = cache_with(proxy.clone());

        proxy.clear();
        cache.refresh("RawBeamCurrent").await.unwrap();
        let reading = cache.get("RawBeamCurrent").unwrap();
        assert_eq!(reading.value, None);
        assert_eq!(reading.freshness, Freshness::Stale);
    }

    #[tokio::test]
    async fn test_refresh_with_wrong_type_is_contained() {
        let proxy = Arc::new(SimulatedProxy::new("bim"));
        let (cache, _) = cache_with(proxy.clone());

        proxy.set(0.1);
        cache.refresh("RawBeamCurrent").await.unwrap();
        proxy.set(true);
        assert_eq!(
            cache.refresh("RawBeamCurrent").await.unwrap(),
            Update::WentStale
        );

        let reading = cache.get("RawBeamCurrent").unwrap();
        assert_eq!(reading.value, Some(AttrValue::Float(0.1)));
        assert_eq!(reading.freshness, Freshness::Stale);
    }

    #[tokio::test]
    async fn test_refresh_local_is_noop() {
        let (cache, _) = cache_with(Arc::new(SimulatedProxy::new("bim")));
        assert_eq!(
            cache.refresh("GeneralInfo").await.unwrap(),
            Update::Unchanged
        );
        assert!(cache.refresh("Nope").await.is_err());
    }

    #[test]
    fn test_snapshot_copies_requested_entries() {
        let (cache, _) = cache_with(Arc::new(SimulatedProxy::new("bim")));
        let snapshot = cache.snapshot(["GeneralInfo", "RawBeamCurrent"]).unwrap();
        assert!(snapshot.get("GeneralInfo").unwrap().is_fresh());
        assert!(snapshot.get("RawBeamCurrent").unwrap().value.is_none());
        assert!(cache.snapshot(["Missing"]).is_err());
    }
}
