//! Remote value proxies.
//!
//! A proxy is the facade's only view of a remote source. The transport
//! behind it (connection handling, retries, backoff) belongs to the proxy;
//! the facade just asks for the current value and treats every failure as
//! "value unavailable".

use crate::attributes::AttrValue;
use async_trait::async_trait;
use thiserror::Error;

/// Failures reported by a remote source.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("remote source {0} is unreachable")]
    Unreachable(String),

    #[error("remote source does not accept writes")]
    ReadOnly,

    #[error("remote source rejected the value: {0}")]
    Rejected(String),
}

/// Read (and optionally write) access to one remote value.
#[async_trait]
pub trait RemoteValueProxy: Send + Sync {
    /// Name of the remote source, for logging.
    fn source(&self) -> &str;

    /// Fetch the current remote value. `Ok(None)` means the source answered
    /// but has no value to offer.
    async fn read(&self) -> Result<Option<AttrValue>, ProxyError>;

    /// Forward a new value to the remote source.
    async fn write(&self, _value: AttrValue) -> Result<(), ProxyError> {
        Err(ProxyError::ReadOnly)
    }
}

/// A value pushed by a remote source instead of being polled.
#[derive(Debug, Clone, PartialEq)]
pub struct ProxyUpdate {
    pub attribute: String,
    /// `None` marks the source as currently unavailable.
    pub value: Option<AttrValue>,
}

impl ProxyUpdate {
    pub fn value(attribute: impl Into<String>, value: impl Into<AttrValue>) -> Self {
        Self {
            attribute: attribute.into(),
            value: Some(value.into()),
        }
    }

    pub fn unavailable(attribute: impl Into<String>) -> Self {
        Self {
            attribute: attribute.into(),
            value: None,
        }
    }
}
