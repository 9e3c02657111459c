//! Derivation engine for logical attributes.
//!
//! A logical attribute declares the ordered list of inputs it is bound to
//! and a pure function over their current values. Inputs may be cached
//! attributes or previously registered logical attributes, which keeps the
//! dependency graph acyclic by construction.
//!
//! Every evaluation reads all of its cached inputs from a single
//! [`Snapshot`](crate::attributes::cache::Snapshot), so one derivation never
//! mixes values from before and after a concurrent update.

pub mod functions;

use crate::attributes::cache::Snapshot;
use crate::attributes::{
    AttrValue, AttributeCache, AttributeKind, AttributeSpec, Freshness, Reading,
};
use crate::error::{FacadeError, Result};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Pure derivation function over the bound input values.
pub type DeriveFn = Arc<dyn Fn(&Inputs<'_>) -> Result<AttrValue> + Send + Sync>;

/// Resolved input values handed to a [`DeriveFn`], in binding order.
pub struct Inputs<'a> {
    attribute: &'a str,
    names: &'a [String],
    values: Vec<AttrValue>,
}

impl Inputs<'_> {
    pub fn get(&self, index: usize) -> Result<&AttrValue> {
        self.values.get(index).ok_or_else(|| FacadeError::InvalidBinding {
            attribute: self.attribute.to_string(),
            input: format!("#{}", index),
        })
    }

    pub fn float(&self, index: usize) -> Result<f64> {
        let value = self.get(index)?;
        value.as_f64().ok_or_else(|| self.mismatch(index, "float", value))
    }

    pub fn boolean(&self, index: usize) -> Result<bool> {
        let value = self.get(index)?;
        value.as_bool().ok_or_else(|| self.mismatch(index, "boolean", value))
    }

    pub fn text(&self, index: usize) -> Result<&str> {
        let value = self.get(index)?;
        value.as_str().ok_or_else(|| self.mismatch(index, "string", value))
    }

    fn mismatch(&self, index: usize, expected: &str, found: &AttrValue) -> FacadeError {
        FacadeError::TypeMismatch {
            attribute: self.names[index].clone(),
            expected: expected.to_string(),
            found: found.value_type().to_string(),
        }
    }
}

/// A derived, read-only attribute.
#[derive(Clone)]
pub struct LogicalAttribute {
    pub spec: AttributeSpec,
    pub inputs: Vec<String>,
    derive: DeriveFn,
}

impl LogicalAttribute {
    pub fn new<I, S>(spec: AttributeSpec, inputs: I, derive: DeriveFn) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            spec,
            inputs: inputs.into_iter().map(Into::into).collect(),
            derive,
        }
    }
}

impl std::fmt::Debug for LogicalAttribute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogicalAttribute")
            .field("name", &self.spec.name)
            .field("inputs", &self.inputs)
            .finish()
    }
}

/// Registry and evaluator of logical attributes.
#[derive(Default)]
pub struct DerivationEngine {
    rules: HashMap<String, LogicalAttribute>,
    /// Registration order, which is also a topological order.
    order: Vec<String>,
    /// Direct dependents of every bound input.
    dependents: HashMap<String, Vec<String>>,
}

impl DerivationEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a logical attribute. Each input must already be known,
    /// either to the cache or as an earlier logical attribute.
    pub fn register(&mut self, cache: &AttributeCache, rule: LogicalAttribute) -> Result<()> {
        let name = rule.spec.name.clone();
        if rule.spec.kind != AttributeKind::Logical {
            return Err(FacadeError::InvalidBinding {
                attribute: name,
                input: "logical".to_string(),
            });
        }
        if self.rules.contains_key(&name) || cache.contains(&name) {
            return Err(FacadeError::DuplicateAttribute(name));
        }
        for input in &rule.inputs {
            if *input == name || !(cache.contains(input) || self.rules.contains_key(input)) {
                return Err(FacadeError::InvalidBinding {
                    attribute: name,
                    input: input.clone(),
                });
            }
        }

        for input in &rule.inputs {
            let dependents = self.dependents.entry(input.clone()).or_default();
            if !dependents.contains(&name) {
                dependents.push(name.clone());
            }
        }
        self.order.push(name.clone());
        self.rules.insert(name, rule);
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.rules.contains_key(name)
    }

    pub fn spec(&self, name: &str) -> Option<&AttributeSpec> {
        self.rules.get(name).map(|rule| &rule.spec)
    }

    /// Logical attribute names in registration order.
    pub fn names(&self) -> &[String] {
        &self.order
    }

    /// Cached attributes a logical attribute ultimately reads.
    pub fn leaf_inputs(&self, name: &str) -> Result<Vec<String>> {
        let rule = self
            .rules
            .get(name)
            .ok_or_else(|| FacadeError::UnknownAttribute(name.to_string()))?;
        let mut leaves = Vec::new();
        for input in &rule.inputs {
            if self.rules.contains_key(input) {
                for leaf in self.leaf_inputs(input)? {
                    if !leaves.contains(&leaf) {
                        leaves.push(leaf);
                    }
                }
            } else if !leaves.contains(input) {
                leaves.push(input.clone());
            }
        }
        Ok(leaves)
    }

    /// Logical attributes that (transitively) depend on `name`, in an order
    /// where every attribute comes after its own inputs.
    pub fn affected_by(&self, name: &str) -> Vec<String> {
        let mut affected = HashSet::new();
        let mut pending = vec![name.to_string()];
        while let Some(current) = pending.pop() {
            if let Some(dependents) = self.dependents.get(&current) {
                for dependent in dependents {
                    if affected.insert(dependent.clone()) {
                        pending.push(dependent.clone());
                    }
                }
            }
        }
        self.order
            .iter()
            .filter(|name| affected.contains(*name))
            .cloned()
            .collect()
    }

    /// Evaluate a logical attribute against the current cache contents.
    pub fn evaluate(&self, name: &str, cache: &AttributeCache) -> Result<Reading> {
        let leaves = self.leaf_inputs(name)?;
        let snapshot = cache.snapshot(&leaves)?;
        self.evaluate_with(name, &snapshot)
    }

    /// Evaluate a logical attribute against a snapshot.
    ///
    /// Fails with `DerivationUnavailable` if any bound input has no value
    /// or its most recent refresh failed. The last known good value stays
    /// readable on the input itself, but is never fed into a derivation.
    pub fn evaluate_with(&self, name: &str, snapshot: &Snapshot) -> Result<Reading> {
        let rule = self
            .rules
            .get(name)
            .ok_or_else(|| FacadeError::UnknownAttribute(name.to_string()))?;

        let mut values = Vec::with_capacity(rule.inputs.len());
        let mut updated_at = None;

        for input in &rule.inputs {
            let reading = if self.rules.contains_key(input) {
                self.evaluate_with(input, snapshot)?
            } else {
                snapshot
                    .get(input)
                    .cloned()
                    .ok_or_else(|| FacadeError::UnknownAttribute(input.clone()))?
            };

            let value = match reading.value {
                Some(value) if reading.freshness == Freshness::Fresh => value,
                _ => {
                    return Err(FacadeError::DerivationUnavailable {
                        attribute: name.to_string(),
                        input: input.clone(),
                    });
                }
            };
            updated_at = updated_at.max(reading.updated_at);
            values.push(value);
        }

        let inputs = Inputs {
            attribute: name,
            names: &rule.inputs,
            values,
        };
        let value = (rule.derive)(&inputs)?;
        if value.value_type() != rule.spec.value_type {
            return Err(FacadeError::TypeMismatch {
                attribute: name.to_string(),
                expected: rule.spec.value_type.to_string(),
                found: value.value_type().to_string(),
            });
        }

        Ok(Reading {
            value: Some(value),
            freshness: Freshness::Fresh,
            updated_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::functions::{operation_status_rule, scaled_rule};
    use super::*;
    use crate::attributes::ValueType;
    use crate::input::simulation::SimulatedProxy;
    use crate::notify::ChangeNotifier;

    fn beamline_cache() -> AttributeCache {
        let mut cache = AttributeCache::new(Arc::new(ChangeNotifier::new(8)));
        for (name, value_type) in [
            ("RawBeamCurrent", ValueType::Float),
            ("ExperimentEnable", ValueType::Bool),
            ("InjectionStatus", ValueType::Bool),
        ] {
            cache
                .register_proxied(
                    AttributeSpec::proxied(name, value_type),
                    Arc::new(SimulatedProxy::new(name)),
                )
                .unwrap();
        }
        cache
    }

    fn beamline_engine(cache: &AttributeCache) -> DerivationEngine {
        let mut engine = DerivationEngine::new();
        engine
            .register(
                cache,
                scaled_rule(
                    AttributeSpec::logical("BeamCurrent", ValueType::Float),
                    "RawBeamCurrent",
                    1000.0,
                ),
            )
            .unwrap();
        engine
            .register(
                cache,
                operation_status_rule(
                    AttributeSpec::logical("OperationStatus", ValueType::Str),
                    "BeamCurrent",
                    "ExperimentEnable",
                    "InjectionStatus",
                    1.0,
                ),
            )
            .unwrap();
        engine
    }

    fn set_inputs(cache: &AttributeCache, raw: f64, enable: bool, injection: bool) {
        cache.set("RawBeamCurrent", AttrValue::Float(raw)).unwrap();
        cache.set("ExperimentEnable", AttrValue::Bool(enable)).unwrap();
        cache.set("InjectionStatus", AttrValue::Bool(injection)).unwrap();
    }

    fn status(engine: &DerivationEngine, cache: &AttributeCache) -> AttrValue {
        engine
            .evaluate("OperationStatus", cache)
            .unwrap()
            .value
            .unwrap()
    }

    #[test]
    fn test_operation_status_through_chained_rules() {
        let cache = beamline_cache();
        let engine = beamline_engine(&cache);

        set_inputs(&cache, 0.005, false, true);
        assert_eq!(status(&engine, &cache), AttrValue::from("Injection"));

        set_inputs(&cache, 0.002, true, false);
        assert_eq!(status(&engine, &cache), AttrValue::from("Experiment Enable"));

        set_inputs(&cache, 0.0005, true, false);
        assert_eq!(status(&engine, &cache), AttrValue::from("MDT"));

        set_inputs(&cache, 0.3, false, false);
        assert_eq!(status(&engine, &cache), AttrValue::from("MDT"));
    }

    #[test]
    fn test_unit_conversion_rule() {
        let cache = beamline_cache();
        let engine = beamline_engine(&cache);

        cache.set("RawBeamCurrent", AttrValue::Float(-0.002)).unwrap();
        let reading = engine.evaluate("BeamCurrent", &cache).unwrap();
        assert_eq!(reading.value, Some(AttrValue::Float(-2.0)));
        assert!(reading.is_fresh());
    }

    #[test]
    fn test_missing_input_is_derivation_unavailable() {
        let cache = beamline_cache();
        let engine = beamline_engine(&cache);

        cache.set("RawBeamCurrent", AttrValue::Float(0.1)).unwrap();
        cache.set("InjectionStatus", AttrValue::Bool(false)).unwrap();

        match engine.evaluate("OperationStatus", &cache) {
            Err(FacadeError::DerivationUnavailable { attribute, input }) => {
                assert_eq!(attribute, "OperationStatus");
                assert_eq!(input, "ExperimentEnable");
            }
            other => panic!("expected DerivationUnavailable, got {:?}", other),
        }
    }

    #[test]
    fn test_stale_input_is_derivation_unavailable() {
        let cache = beamline_cache();
        let engine = beamline_engine(&cache);

        set_inputs(&cache, 0.2, true, false);
        cache.mark_stale("ExperimentEnable").unwrap();

        match engine.evaluate("OperationStatus", &cache) {
            Err(FacadeError::DerivationUnavailable { input, .. }) => {
                assert_eq!(input, "ExperimentEnable");
            }
            other => panic!("expected DerivationUnavailable, got {:?}", other),
        }
        // Last known good value is still visible on the input
        assert_eq!(
            cache.get("ExperimentEnable").unwrap().value,
            Some(AttrValue::Bool(true))
        );

        // A stale leaf behind a chained input blocks the whole chain
        cache.set("ExperimentEnable", AttrValue::Bool(true)).unwrap();
        cache.mark_stale("RawBeamCurrent").unwrap();
        assert!(matches!(
            engine.evaluate("BeamCurrent", &cache),
            Err(FacadeError::DerivationUnavailable { .. })
        ));
        assert!(matches!(
            engine.evaluate("OperationStatus", &cache),
            Err(FacadeError::DerivationUnavailable { .. })
        ));

        cache.set("RawBeamCurrent", AttrValue::Float(0.2)).unwrap();
        assert_eq!(status(&engine, &cache), AttrValue::from("Experiment Enable"));
    }

    #[test]
    fn test_registration_rejects_unknown_and_self_bindings() {
        let cache = beamline_cache();
        let mut engine = DerivationEngine::new();

        let unknown = scaled_rule(
            AttributeSpec::logical("BeamCurrent", ValueType::Float),
            "NotThere",
            1000.0,
        );
        assert!(matches!(
            engine.register(&cache, unknown),
            Err(FacadeError::InvalidBinding { .. })
        ));

        let itself = scaled_rule(
            AttributeSpec::logical("Loop", ValueType::Float),
            "Loop",
            2.0,
        );
        assert!(matches!(
            engine.register(&cache, itself),
            Err(FacadeError::InvalidBinding { .. })
        ));

        let shadowing = scaled_rule(
            AttributeSpec::logical("RawBeamCurrent", ValueType::Float),
            "RawBeamCurrent",
            2.0,
        );
        assert!(matches!(
            engine.register(&cache, shadowing),
            Err(FacadeError::DuplicateAttribute(_))
        ));
    }

    #[test]
    fn test_dependency_queries() {
        let cache = beamline_cache();
        let engine = beamline_engine(&cache);

        assert_eq!(
            engine.leaf_inputs("OperationStatus").unwrap(),
            vec!["RawBeamCurrent", "ExperimentEnable", "InjectionStatus"]
        );
        assert_eq!(
            engine.affected_by("RawBeamCurrent"),
            vec!["BeamCurrent", "OperationStatus"]
        );
        assert_eq!(engine.affected_by("InjectionStatus"), vec!["OperationStatus"]);
        assert!(engine.affected_by("GeneralInfo").is_empty());
    }

    #[test]
    fn test_wrong_input_type_is_reported() {
        let mut cache = AttributeCache::new(Arc::new(ChangeNotifier::new(8)));
        cache
            .register_local(AttributeSpec::local("Raw", AttrValue::from("text")))
            .unwrap();
        let mut engine = DerivationEngine::new();
        engine
            .register(
                &cache,
                scaled_rule(AttributeSpec::logical("Scaled", ValueType::Float), "Raw", 2.0),
            )
            .unwrap();

        assert!(matches!(
            engine.evaluate("Scaled", &cache),
            Err(FacadeError::TypeMismatch { .. })
        ));
    }
}
