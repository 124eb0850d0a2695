use serde::{Deserialize, Serialize};

const DEFAULT_REQUEST_FREELIST_LIMIT: usize = 1024;

/// Server configuration.
///
/// Deserialized from a JSON document; unrecognized keys are ignored, so a
/// superset configuration can be passed through unchanged.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Upper bound on recycled request objects.
    pub request_freelist_limit: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            request_freelist_limit: DEFAULT_REQUEST_FREELIST_LIMIT,
        }
    }
}

impl Config {
    pub fn from_json(value: &serde_json::Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value.clone())
    }
}
