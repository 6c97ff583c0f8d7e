// SPDX-License-Identifier: PolyForm-Shield-1.0

//! Shared data model for neuron deployments.
//!
//! The central entity is [`ModelRecord`]: one persisted lifecycle record per
//! deployed worker, keyed by its abbreviation (`abbr`). Records are stored as
//! flat string hashes (see [`ModelRecord::to_fields`]) so that any keyed-hash
//! backend can hold them without a schema.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod catalog;

pub use catalog::{CatalogEntry, ModelCatalog, RecommendedSettings};

/// Flat string map used to persist a record in a keyed-hash store.
pub type Fields = BTreeMap<String, String>;

/// Store key prefix shared by every model record.
pub const MODEL_KEY_PREFIX: &str = "model:";

/// Longest abbreviation accepted for a deployment.
pub const MAX_ABBR_LEN: usize = 48;

pub const DEFAULT_MAX_MODEL_LEN: u32 = 4096;
pub const DEFAULT_GPU_MEMORY_UTILIZATION: f64 = 0.9;
pub const DEFAULT_MAX_NUM_SEQS: u32 = 256;

/// Field names used in the persisted hash.
pub mod fields {
    pub const ABBR: &str = "abbr";
    pub const NAME: &str = "name";
    pub const TYPE: &str = "type";
    pub const QUANTIZATION: &str = "quantization";
    pub const PORT: &str = "port";
    pub const GPU_DEVICE: &str = "gpu_device";
    pub const MAX_MODEL_LEN: &str = "max_model_len";
    pub const GPU_MEMORY_UTILIZATION: &str = "gpu_memory_utilization";
    pub const MAX_NUM_SEQS: &str = "max_num_seqs";
    pub const STATUS: &str = "status";
    pub const PROGRESS: &str = "progress";
    pub const PROGRESS_MESSAGE: &str = "progress_message";
    pub const CONTAINER_ID: &str = "container_id";
}

/// Store key for the record of `abbr`.
pub fn model_key(abbr: &str) -> String {
    format!("{MODEL_KEY_PREFIX}{abbr}")
}

/// Errors raised while decoding or validating records.
#[derive(Debug, Error, PartialEq)]
pub enum RecordError {
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    #[error("invalid value {value:?} for field `{field}`")]
    InvalidField { field: &'static str, value: String },
    #[error("invalid abbreviation {0:?}: expected [a-z0-9][a-z0-9_-]* of at most 48 chars")]
    InvalidAbbr(String),
}

/// Kind of model served by a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelType {
    Llm,
    Embedding,
    Reranker,
    Vision,
}

impl ModelType {
    pub fn as_str(self) -> &'static str {
        match self {
            ModelType::Llm => "llm",
            ModelType::Embedding => "embedding",
            ModelType::Reranker => "reranker",
            ModelType::Vision => "vision",
        }
    }
}

impl fmt::Display for ModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelType {
    type Err = RecordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "llm" => Ok(ModelType::Llm),
            "embedding" => Ok(ModelType::Embedding),
            "reranker" => Ok(ModelType::Reranker),
            "vision" => Ok(ModelType::Vision),
            other => Err(RecordError::InvalidField {
                field: fields::TYPE,
                value: other.to_string(),
            }),
        }
    }
}

/// Lifecycle status of a deployment.
///
/// The set of legal moves between statuses is closed and lives in
/// [`ModelStatus::can_transition_to`]; every writer of `status` goes through
/// it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelStatus {
    Deploying,
    Running,
    Stopped,
    Error,
}

impl ModelStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ModelStatus::Deploying => "deploying",
            ModelStatus::Running => "running",
            ModelStatus::Stopped => "stopped",
            ModelStatus::Error => "error",
        }
    }

    /// Active records hold a port and count towards GPU load.
    pub fn is_active(self) -> bool {
        matches!(self, ModelStatus::Deploying | ModelStatus::Running)
    }

    /// Transition table for a deployment.
    ///
    /// - `deploying` settles into `running` or `error`.
    /// - `running` leaves via an explicit stop or a detected crash.
    /// - `stopped` and `error` only move on an explicit restart.
    pub fn can_transition_to(self, next: ModelStatus) -> bool {
        use ModelStatus::*;
        match (self, next) {
            (Deploying, Running) | (Deploying, Error) => true,
            (Running, Stopped) | (Running, Error) => true,
            (Stopped, Deploying) | (Error, Deploying) => true,
            (Deploying, Deploying)
            | (Deploying, Stopped)
            | (Running, Running)
            | (Running, Deploying)
            | (Stopped, Running)
            | (Stopped, Stopped)
            | (Stopped, Error)
            | (Error, Running)
            | (Error, Stopped)
            | (Error, Error) => false,
        }
    }
}

impl fmt::Display for ModelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelStatus {
    type Err = RecordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "deploying" => Ok(ModelStatus::Deploying),
            "running" => Ok(ModelStatus::Running),
            "stopped" => Ok(ModelStatus::Stopped),
            "error" => Ok(ModelStatus::Error),
            other => Err(RecordError::InvalidField {
                field: fields::STATUS,
                value: other.to_string(),
            }),
        }
    }
}

/// Check that `abbr` is usable as a record key, container-name suffix and
/// URL segment.
pub fn validate_abbr(abbr: &str) -> Result<(), RecordError> {
    let mut chars = abbr.chars();
    let first_ok = chars
        .next()
        .map(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        .unwrap_or(false);
    let rest_ok = chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_');
    if first_ok && rest_ok && abbr.len() <= MAX_ABBR_LEN {
        Ok(())
    } else {
        Err(RecordError::InvalidAbbr(abbr.to_string()))
    }
}

/// Persisted lifecycle record for one deployed worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRecord {
    pub abbr: String,
    /// full model identifier, e.g. a HuggingFace repo id.
    pub name: String,
    #[serde(rename = "type")]
    pub model_type: ModelType,
    pub quantization: Option<String>,
    pub port: u16,
    pub gpu_device: u32,
    pub max_model_len: u32,
    pub gpu_memory_utilization: f64,
    pub max_num_seqs: u32,
    pub status: ModelStatus,
    /// 0-100, only meaningful while deploying.
    pub progress: Option<u8>,
    pub progress_message: Option<String>,
    pub container_id: Option<String>,
}

impl ModelRecord {
    /// Public route under which the proxy exposes this worker.
    pub fn endpoint(&self) -> String {
        format!("/api/v1/{}", self.abbr)
    }

    /// Encode every attribute as a string field.
    ///
    /// Absent optionals are written as empty strings so that a full write
    /// always overwrites leftovers from a previous attempt.
    pub fn to_fields(&self) -> Fields {
        let mut out = Fields::new();
        out.insert(fields::ABBR.into(), self.abbr.clone());
        out.insert(fields::NAME.into(), self.name.clone());
        out.insert(fields::TYPE.into(), self.model_type.to_string());
        out.insert(
            fields::QUANTIZATION.into(),
            self.quantization.clone().unwrap_or_else(|| "none".into()),
        );
        out.insert(fields::PORT.into(), self.port.to_string());
        out.insert(fields::GPU_DEVICE.into(), self.gpu_device.to_string());
        out.insert(fields::MAX_MODEL_LEN.into(), self.max_model_len.to_string());
        out.insert(
            fields::GPU_MEMORY_UTILIZATION.into(),
            self.gpu_memory_utilization.to_string(),
        );
        out.insert(fields::MAX_NUM_SEQS.into(), self.max_num_seqs.to_string());
        out.insert(fields::STATUS.into(), self.status.to_string());
        out.insert(
            fields::PROGRESS.into(),
            self.progress.map(|p| p.to_string()).unwrap_or_default(),
        );
        out.insert(
            fields::PROGRESS_MESSAGE.into(),
            self.progress_message.clone().unwrap_or_default(),
        );
        out.insert(
            fields::CONTAINER_ID.into(),
            self.container_id.clone().unwrap_or_default(),
        );
        out
    }

    /// Decode a record from its persisted fields.
    ///
    /// Tunables fall back to their defaults when blank so that hand-written
    /// or partially migrated hashes still load.
    pub fn from_fields(fields: &Fields) -> Result<Self, RecordError> {
        let quantization = optional(fields, fields::QUANTIZATION).filter(|q| q != "none");

        Ok(Self {
            abbr: required(fields, fields::ABBR)?,
            name: required(fields, fields::NAME)?,
            model_type: required(fields, fields::TYPE)?.parse()?,
            quantization,
            port: parse_required(fields, fields::PORT)?,
            gpu_device: parse_required(fields, fields::GPU_DEVICE)?,
            max_model_len: parse_or(fields, fields::MAX_MODEL_LEN, DEFAULT_MAX_MODEL_LEN)?,
            gpu_memory_utilization: parse_or(
                fields,
                fields::GPU_MEMORY_UTILIZATION,
                DEFAULT_GPU_MEMORY_UTILIZATION,
            )?,
            max_num_seqs: parse_or(fields, fields::MAX_NUM_SEQS, DEFAULT_MAX_NUM_SEQS)?,
            status: required(fields, fields::STATUS)?.parse()?,
            progress: optional(fields, fields::PROGRESS)
                .map(|p| parse_value(fields::PROGRESS, &p))
                .transpose()?,
            progress_message: optional(fields, fields::PROGRESS_MESSAGE),
            container_id: optional(fields, fields::CONTAINER_ID),
        })
    }
}

fn optional(fields: &Fields, name: &'static str) -> Option<String> {
    fields.get(name).filter(|v| !v.is_empty()).cloned()
}

fn required(fields: &Fields, name: &'static str) -> Result<String, RecordError> {
    optional(fields, name).ok_or(RecordError::MissingField(name))
}

fn parse_value<T: FromStr>(name: &'static str, value: &str) -> Result<T, RecordError> {
    value.trim().parse().map_err(|_| RecordError::InvalidField {
        field: name,
        value: value.to_string(),
    })
}

fn parse_required<T: FromStr>(fields: &Fields, name: &'static str) -> Result<T, RecordError> {
    parse_value(name, &required(fields, name)?)
}

fn parse_or<T: FromStr>(fields: &Fields, name: &'static str, default: T) -> Result<T, RecordError> {
    match optional(fields, name) {
        Some(v) => parse_value(name, &v),
        None => Ok(default),
    }
}

/// Request to deploy a model.
///
/// `port` and `gpu_device` are assigned by the allocator when omitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployRequest {
    pub name: String,
    pub abbr: String,
    #[serde(rename = "type")]
    pub model_type: ModelType,
    #[serde(default)]
    pub quantization: Option<String>,
    #[serde(default = "default_max_model_len")]
    pub max_model_len: u32,
    #[serde(default = "default_gpu_memory_utilization")]
    pub gpu_memory_utilization: f64,
    #[serde(default = "default_max_num_seqs")]
    pub max_num_seqs: u32,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub gpu_device: Option<u32>,
}

fn default_max_model_len() -> u32 {
    DEFAULT_MAX_MODEL_LEN
}

fn default_gpu_memory_utilization() -> f64 {
    DEFAULT_GPU_MEMORY_UTILIZATION
}

fn default_max_num_seqs() -> u32 {
    DEFAULT_MAX_NUM_SEQS
}

impl DeployRequest {
    /// Minimal request with default tunables and automatic placement.
    pub fn new(abbr: impl Into<String>, name: impl Into<String>, model_type: ModelType) -> Self {
        Self {
            name: name.into(),
            abbr: abbr.into(),
            model_type,
            quantization: None,
            max_model_len: DEFAULT_MAX_MODEL_LEN,
            gpu_memory_utilization: DEFAULT_GPU_MEMORY_UTILIZATION,
            max_num_seqs: DEFAULT_MAX_NUM_SEQS,
            port: None,
            gpu_device: None,
        }
    }

    /// Reject requests that could never produce a working deployment.
    pub fn validate(&self) -> Result<(), RecordError> {
        validate_abbr(&self.abbr)?;
        if self.name.trim().is_empty() {
            return Err(RecordError::MissingField(fields::NAME));
        }
        if !(self.gpu_memory_utilization > 0.0 && self.gpu_memory_utilization <= 1.0) {
            return Err(RecordError::InvalidField {
                field: fields::GPU_MEMORY_UTILIZATION,
                value: self.gpu_memory_utilization.to_string(),
            });
        }
        if self.max_model_len == 0 {
            return Err(RecordError::InvalidField {
                field: fields::MAX_MODEL_LEN,
                value: "0".into(),
            });
        }
        if self.max_num_seqs == 0 {
            return Err(RecordError::InvalidField {
                field: fields::MAX_NUM_SEQS,
                value: "0".into(),
            });
        }
        Ok(())
    }

    /// Normalised quantization tag; `none` and blank mean unquantized.
    pub fn quantization(&self) -> Option<String> {
        self.quantization
            .as_deref()
            .map(str::trim)
            .filter(|q| !q.is_empty() && *q != "none")
            .map(str::to_lowercase)
    }
}
