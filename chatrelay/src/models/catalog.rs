//! Model listing entries.

use serde::{Deserialize, Serialize};

/// One model the provider can serve.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelInfo {
    pub id: String,
    /// Display name; providers without one repeat the id.
    pub name: String,
    /// Unix seconds, when the provider reports it.
    #[serde(default)]
    pub created: Option<i64>,
    #[serde(default)]
    pub owned_by: Option<String>,
}

impl ModelInfo {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            created: None,
            owned_by: None,
        }
    }
}
