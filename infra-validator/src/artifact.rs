//! Artifact references consumed and produced by a validation run
//!
//! Artifacts are plain references to a storage location. The validator never
//! mutates its inputs; only the blessing artifact gets files and properties
//! written to it.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Trait shared by every artifact the validator handles
pub trait Artifact: Send + Sync + std::fmt::Debug {
    /// Artifact type name (e.g., "Model", "Examples", "InfraBlessing")
    fn type_name(&self) -> &str;

    /// Storage location of the artifact
    fn uri(&self) -> &Path;
}

/// A trained model, as exported by a trainer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub uri: PathBuf,
    #[serde(default)]
    pub version: Option<String>,
}

impl ModelArtifact {
    pub fn new<P: Into<PathBuf>>(uri: P) -> Self {
        Self {
            uri: uri.into(),
            version: None,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }
}

impl Artifact for ModelArtifact {
    fn type_name(&self) -> &str {
        "Model"
    }

    fn uri(&self) -> &Path {
        &self.uri
    }
}

/// Example data split into named subdirectories
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExamplesArtifact {
    pub uri: PathBuf,
    pub split_names: Vec<String>,
}

impl ExamplesArtifact {
    pub fn new<P: Into<PathBuf>>(uri: P, split_names: Vec<String>) -> Self {
        Self {
            uri: uri.into(),
            split_names,
        }
    }

    /// Directory holding the given split, if the artifact declares it
    pub fn split_uri(&self, split_name: &str) -> Option<PathBuf> {
        self.split_names
            .iter()
            .any(|s| s == split_name)
            .then(|| self.uri.join(split_name))
    }
}

impl Artifact for ExamplesArtifact {
    fn type_name(&self) -> &str {
        "Examples"
    }

    fn uri(&self) -> &Path {
        &self.uri
    }
}

/// Typed value of an artifact custom property
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Int(i64),
    String(String),
}

/// Output artifact carrying the infra validation verdict
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlessingArtifact {
    pub uri: PathBuf,
    #[serde(default)]
    pub custom_properties: BTreeMap<String, PropertyValue>,
}

impl BlessingArtifact {
    pub fn new<P: Into<PathBuf>>(uri: P) -> Self {
        Self {
            uri: uri.into(),
            custom_properties: BTreeMap::new(),
        }
    }

    pub fn set_int_custom_property(&mut self, key: impl Into<String>, value: i64) {
        self.custom_properties
            .insert(key.into(), PropertyValue::Int(value));
    }

    pub fn set_string_custom_property(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.custom_properties
            .insert(key.into(), PropertyValue::String(value.into()));
    }

    pub fn get_int_custom_property(&self, key: &str) -> Option<i64> {
        match self.custom_properties.get(key) {
            Some(PropertyValue::Int(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_string_custom_property(&self, key: &str) -> Option<&str> {
        match self.custom_properties.get(key) {
            Some(PropertyValue::String(v)) => Some(v),
            _ => None,
        }
    }
}

impl Artifact for BlessingArtifact {
    fn type_name(&self) -> &str {
        "InfraBlessing"
    }

    fn uri(&self) -> &Path {
        &self.uri
    }
}
