// SPDX-License-Identifier: PolyForm-Shield-1.0

//! Catalog of predefined models and their recommended serving settings.
//!
//! The catalog is an operator-maintained JSON document shaped like:
//!
//! ```json
//! {
//!   "predefined_models": [
//!     {
//!       "name": "Qwen/Qwen2.5-7B-Instruct-AWQ",
//!       "abbr": "qwen",
//!       "type": "llm",
//!       "quantization": "awq",
//!       "max_model_len": 8192,
//!       "recommended_settings": { "gpu_memory_utilization": 0.4, "max_num_seqs": 64 }
//!     }
//!   ]
//! }
//! ```

use serde::{Deserialize, Serialize};

use crate::ModelType;

/// Recommended runtime knobs for a catalog entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecommendedSettings {
    #[serde(default)]
    pub gpu_memory_utilization: Option<f64>,
    #[serde(default)]
    pub max_num_seqs: Option<u32>,
}

/// One predefined model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub name: String,
    pub abbr: String,
    #[serde(default, rename = "type")]
    pub model_type: Option<ModelType>,
    #[serde(default)]
    pub quantization: Option<String>,
    #[serde(default)]
    pub max_model_len: Option<u32>,
    #[serde(default)]
    pub recommended_settings: RecommendedSettings,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelCatalog {
    #[serde(default)]
    pub predefined_models: Vec<CatalogEntry>,
}

impl ModelCatalog {
    /// Find an entry by abbreviation, falling back to the full model name.
    pub fn lookup(&self, abbr: &str, name: &str) -> Option<&CatalogEntry> {
        self.predefined_models
            .iter()
            .find(|e| e.abbr == abbr)
            .or_else(|| self.predefined_models.iter().find(|e| e.name == name))
    }

    pub fn len(&self) -> usize {
        self.predefined_models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.predefined_models.is_empty()
    }
}
