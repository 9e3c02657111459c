//! Attribute declarations and the attribute cache.
//!
//! Every attribute the facade exposes is declared up front with an
//! [`AttributeSpec`]. Local and proxied attributes live in the
//! [`AttributeCache`]; logical attributes are declared here too but their
//! values come from the derivation engine.

pub mod cache;
pub mod value;

pub use cache::{AttributeCache, Freshness, Reading, Update};
pub use value::{AttrValue, DevState, ValueType};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessMode {
    ReadOnly,
    ReadWrite,
}

/// Where an attribute's value comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttributeKind {
    /// Set directly by a writer, held in memory only.
    Local,
    /// Mirrors a remote source through a proxy.
    Proxied,
    /// Computed from other attributes.
    Logical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisplayLevel {
    Operator,
    Expert,
}

/// Static description of one attribute.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttributeSpec {
    pub name: String,
    pub value_type: ValueType,
    pub access: AccessMode,
    pub kind: AttributeKind,
    /// Initial cached value. `None` means "no data yet".
    pub default: Option<AttrValue>,
    pub label: String,
    pub doc: String,
    pub unit: Option<String>,
    pub display_level: DisplayLevel,
}

impl AttributeSpec {
    /// Read-write local attribute with an initial value.
    pub fn local(name: impl Into<String>, default: AttrValue) -> Self {
        let name = name.into();
        Self {
            label: name.clone(),
            name,
            value_type: default.value_type(),
            access: AccessMode::ReadWrite,
            kind: AttributeKind::Local,
            default: Some(default),
            doc: String::new(),
            unit: None,
            display_level: DisplayLevel::Operator,
        }
    }

    /// Read-only proxied attribute; starts without a value until the first refresh.
    pub fn proxied(name: impl Into<String>, value_type: ValueType) -> Self {
        let name = name.into();
        Self {
            label: name.clone(),
            name,
            value_type,
            access: AccessMode::ReadOnly,
            kind: AttributeKind::Proxied,
            default: None,
            doc: String::new(),
            unit: None,
            display_level: DisplayLevel::Expert,
        }
    }

    /// Read-only logical attribute.
    pub fn logical(name: impl Into<String>, value_type: ValueType) -> Self {
        let name = name.into();
        Self {
            label: name.clone(),
            name,
            value_type,
            access: AccessMode::ReadOnly,
            kind: AttributeKind::Logical,
            default: None,
            doc: String::new(),
            unit: None,
            display_level: DisplayLevel::Operator,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_doc(mut self, doc: impl Into<String>) -> Self {
        self.doc = doc.into();
        self
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    pub fn with_display_level(mut self, level: DisplayLevel) -> Self {
        self.display_level = level;
        self
    }

    /// Proxied attributes only: forward writes to the remote source.
    pub fn writable(mut self) -> Self {
        if self.kind != AttributeKind::Logical {
            self.access = AccessMode::ReadWrite;
        }
        self
    }

    pub fn is_writable(&self) -> bool {
        self.access == AccessMode::ReadWrite && self.kind != AttributeKind::Logical
    }
}
