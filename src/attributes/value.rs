//! Typed attribute values and the device state vocabulary.

use serde::{Deserialize, Serialize};
use std::fmt;
use strum::{Display, EnumString};

/// State vocabulary reported by remote control devices.
///
/// Only `On` and `Running` count as healthy; everything else is either a
/// fault or an unexpected state for the status aggregator.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[strum(serialize_all = "UPPERCASE", ascii_case_insensitive)]
pub enum DevState {
    On,
    Off,
    Close,
    Open,
    Insert,
    Extract,
    Moving,
    Standby,
    Fault,
    Init,
    Running,
    Alarm,
    Disable,
    Unknown,
}

impl DevState {
    /// Whether this state means the device is operating normally.
    pub fn is_healthy(self) -> bool {
        matches!(self, DevState::On | DevState::Running)
    }
}

/// Declared type of an attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
pub enum ValueType {
    #[strum(serialize = "string")]
    Str,
    #[strum(serialize = "boolean")]
    Bool,
    #[strum(serialize = "float")]
    Float,
    #[strum(serialize = "state")]
    State,
}

/// A single attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttrValue {
    Str(String),
    Bool(bool),
    Float(f64),
    State(DevState),
}

impl AttrValue {
    pub fn value_type(&self) -> ValueType {
        match self {
            AttrValue::Str(_) => ValueType::Str,
            AttrValue::Bool(_) => ValueType::Bool,
            AttrValue::Float(_) => ValueType::Float,
            AttrValue::State(_) => ValueType::State,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttrValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttrValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AttrValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_state(&self) -> Option<DevState> {
        match self {
            AttrValue::State(s) => Some(*s),
            _ => None,
        }
    }
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrValue::Str(s) => write!(f, "{}", s),
            AttrValue::Bool(b) => write!(f, "{}", b),
            AttrValue::Float(v) => write!(f, "{}", v),
            AttrValue::State(s) => write!(f, "{}", s),
        }
    }
}

impl From<&str> for AttrValue {
    fn from(value: &str) -> Self {
        AttrValue::Str(value.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(value: String) -> Self {
        AttrValue::Str(value)
    }
}

impl From<bool> for AttrValue {
    fn from(value: bool) -> Self {
        AttrValue::Bool(value)
    }
}

impl From<f64> for AttrValue {
    fn from(value: f64) -> Self {
        AttrValue::Float(value)
    }
}

impl From<DevState> for AttrValue {
    fn from(value: DevState) -> Self {
        AttrValue::State(value)
    }
}
