//! Manager API access
//!
//! Actions fetch contextual data from the manager with a single templated
//! GET. The [`ManagerApi`] trait is the seam the action executor depends on;
//! [`ManagerClient`] is the HTTP implementation.

mod client;

pub use client::{ManagerClient, ManagerClientBuilder, ManagerClientConfig};

use crate::error::ApiError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Top-level fields of a JSON object response
pub type ApiFields = Map<String, Value>;

/// Read-only access to the manager
#[async_trait]
pub trait ManagerApi: Send + Sync {
    /// GET an already-expanded endpoint path and return the JSON object body
    async fn fetch(&self, path: &str) -> Result<ApiFields, ApiError>;
}

/// Classification of the startup API key probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum KeyStatus {
    /// Probe answered 200 or 404
    Valid { http_status: u16 },
    /// Any other HTTP status
    InvalidOrServerIssue { http_status: u16 },
    /// No HTTP response at all
    Unreachable { error: String },
}

impl KeyStatus {
    pub fn from_status(http_status: u16) -> Self {
        match http_status {
            200 | 404 => KeyStatus::Valid { http_status },
            _ => KeyStatus::InvalidOrServerIssue { http_status },
        }
    }

    pub fn is_valid(&self) -> bool {
        matches!(self, KeyStatus::Valid { .. })
    }
}

/// Flatten API fields into context strings
///
/// Strings are taken verbatim, numbers and booleans via their display form,
/// arrays and objects as compact JSON. Nulls are skipped.
pub fn fields_to_context(fields: &ApiFields) -> Vec<(String, String)> {
    fields
        .iter()
        .filter_map(|(key, value)| {
            let text = match value {
                Value::Null => return None,
                Value::String(s) => s.clone(),
                Value::Bool(b) => b.to_string(),
                Value::Number(n) => n.to_string(),
                other => other.to_string(),
            };
            Some((key.clone(), text))
        })
        .collect()
}
