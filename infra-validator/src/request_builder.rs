//! Synthesizing validation requests from example data
//!
//! Examples are read from JSON files in the requested split directory, one
//! JSON object per line (`.jsonl`) or per file (`.json`). Files are read in
//! name order until `max_examples` examples have been collected.

use crate::artifact::ExamplesArtifact;
use crate::config::{RequestKind, RequestSpec, RpcKind};
use crate::error::{ValidatorError, ValidatorResult};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::fmt;
use std::path::{Path, PathBuf};

/// Protocol a request is meant for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestTarget {
    TensorFlowServing(RpcKind),
    OnnxRuntime,
}

impl fmt::Display for RequestTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TensorFlowServing(rpc_kind) => write!(f, "tensorflow_serving {rpc_kind}"),
            Self::OnnxRuntime => write!(f, "onnx_runtime"),
        }
    }
}

/// Request payload sent to a loaded model; opaque to the validator
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyntheticRequest {
    pub target: RequestTarget,
    pub body: Value,
}

/// Turns example data into requests for the query phase
pub trait RequestBuilder: Send + Sync {
    fn build_requests(
        &self,
        examples: &ExamplesArtifact,
        spec: &RequestSpec,
    ) -> ValidatorResult<Vec<SyntheticRequest>>;
}

/// Builds requests from JSON example files
#[derive(Debug, Clone, Copy, Default)]
pub struct ExamplesRequestBuilder;

impl RequestBuilder for ExamplesRequestBuilder {
    fn build_requests(
        &self,
        examples: &ExamplesArtifact,
        spec: &RequestSpec,
    ) -> ValidatorResult<Vec<SyntheticRequest>> {
        let split_dir = examples.split_uri(&spec.split_name).ok_or_else(|| {
            ValidatorError::config(format!(
                "Examples at {} have no split {:?} (available: {:?})",
                examples.uri.display(),
                spec.split_name,
                examples.split_names
            ))
        })?;

        let records = read_examples(&split_dir, spec.max_examples)?;
        if records.is_empty() {
            log::warn!(
                "No examples found in {}, validating model loading only",
                split_dir.display()
            );
            return Ok(Vec::new());
        }
        log::info!(
            "Building requests from {} examples in {}",
            records.len(),
            split_dir.display()
        );

        Ok(match &spec.kind {
            RequestKind::TensorflowServing(tf) => {
                let key = match tf.rpc_kind {
                    RpcKind::Classify | RpcKind::Regress => "examples",
                    RpcKind::Predict => "instances",
                };
                let signatures: Vec<Option<&String>> = if tf.signature_names.is_empty() {
                    vec![None]
                } else {
                    tf.signature_names.iter().map(Some).collect()
                };
                signatures
                    .into_iter()
                    .map(|signature_name| {
                        let mut body = Map::new();
                        if let Some(name) = signature_name {
                            body.insert("signature_name".to_string(), json!(name));
                        }
                        body.insert(key.to_string(), Value::Array(records.clone()));
                        SyntheticRequest {
                            target: RequestTarget::TensorFlowServing(tf.rpc_kind),
                            body: Value::Object(body),
                        }
                    })
                    .collect()
            }
            RequestKind::OnnxRuntime(_) => records
                .into_iter()
                .map(|record| SyntheticRequest {
                    target: RequestTarget::OnnxRuntime,
                    body: json!({ "inputs": record }),
                })
                .collect(),
        })
    }
}

fn example_files(split_dir: &Path) -> ValidatorResult<Vec<PathBuf>> {
    if !split_dir.is_dir() {
        return Err(ValidatorError::config(format!(
            "Example split directory not found: {}",
            split_dir.display()
        )));
    }
    let mut files = Vec::new();
    for entry in std::fs::read_dir(split_dir)? {
        let path = entry?.path();
        let is_json = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("json") | Some("jsonl")
        );
        if is_json && path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Read at most `limit` example objects from a split directory
pub fn read_examples(split_dir: &Path, limit: usize) -> ValidatorResult<Vec<Value>> {
    let mut records = Vec::new();
    for file in example_files(split_dir)? {
        let content = std::fs::read_to_string(&file)?;
        let values: Vec<Value> = if file.extension().and_then(|e| e.to_str()) == Some("jsonl") {
            content
                .lines()
                .filter(|line| !line.trim().is_empty())
                .map(serde_json::from_str)
                .collect::<Result<_, _>>()?
        } else {
            vec![serde_json::from_str(&content)?]
        };

        for value in values {
            if !value.is_object() {
                return Err(ValidatorError::config(format!(
                    "Example in {} is not a JSON object",
                    file.display()
                )));
            }
            records.push(value);
            if records.len() >= limit {
                return Ok(records);
            }
        }
    }
    Ok(records)
}
