//! Validation run configuration
//!
//! Everything a run needs besides artifacts is described here: which serving
//! binaries to try and where to place them, the retry budget, and how to
//! synthesize requests for the optional query phase. All of it deserializes
//! from a single JSON document.

use crate::error::{ValidatorError, ValidatorResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_TENSORFLOW_SERVING_IMAGE: &str = "tensorflow/serving";
pub const DEFAULT_SPLIT_NAME: &str = "eval";

const DEFAULT_MAX_LOADING_TIME_SECONDS: i64 = 300;
const DEFAULT_NUM_TRIES: i64 = 5;

/// Top level configuration of a validation run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InfraValidatorConfig {
    pub serving_spec: ServingSpec,
    #[serde(default)]
    pub validation_spec: ValidationSpec,
    #[serde(default)]
    pub request_spec: Option<RequestSpec>,
}

impl InfraValidatorConfig {
    /// Load a configuration from a JSON file and validate it
    pub fn from_path<P: AsRef<Path>>(path: P) -> ValidatorResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ValidatorError::config(format!("Failed to read {}: {e}", path.display()))
        })?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> ValidatorResult<Self> {
        let config: Self = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ValidatorResult<()> {
        self.serving_spec.validate()?;
        self.validation_spec.validate()?;
        if let Some(request_spec) = &self.request_spec {
            request_spec.validate()?;
            match (&self.serving_spec.binary, &request_spec.kind) {
                (ServingBinarySpec::TensorflowServing(_), RequestKind::TensorflowServing(_))
                | (ServingBinarySpec::OnnxRuntime(_), RequestKind::OnnxRuntime(_)) => {}
                (binary, kind) => {
                    return Err(ValidatorError::config(format!(
                        "Request kind {} cannot be sent to a {} binary",
                        kind.name(),
                        binary.name()
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Which serving binary variant(s) to run, and where
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServingSpec {
    pub binary: ServingBinarySpec,
    /// Inferred from the binary when absent
    #[serde(default)]
    pub placement: Option<Placement>,
    #[serde(default)]
    pub binary_selection: BinarySelection,
}

impl ServingSpec {
    pub fn model_name(&self) -> &str {
        match &self.binary {
            ServingBinarySpec::TensorflowServing(spec) => &spec.model_name,
            ServingBinarySpec::OnnxRuntime(spec) => &spec.model_name,
        }
    }

    /// The placement actually used for this spec
    pub fn effective_placement(&self) -> Placement {
        match (&self.placement, &self.binary) {
            (Some(placement), _) => placement.clone(),
            (None, ServingBinarySpec::TensorflowServing(_)) => {
                Placement::LocalDocker(LocalDockerConfig::default())
            }
            (None, ServingBinarySpec::OnnxRuntime(_)) => Placement::InProcess,
        }
    }

    pub fn validate(&self) -> ValidatorResult<()> {
        if self.model_name().trim().is_empty() {
            return Err(ValidatorError::config("model_name must not be empty"));
        }
        match (&self.binary, self.effective_placement()) {
            (ServingBinarySpec::TensorflowServing(spec), Placement::LocalDocker(_)) => {
                if spec.tags.is_empty() && spec.digests.is_empty() {
                    return Err(ValidatorError::config(
                        "tensorflow_serving requires at least one tag or digest",
                    ));
                }
                Ok(())
            }
            (ServingBinarySpec::OnnxRuntime(_), Placement::InProcess) => Ok(()),
            (binary, placement) => Err(ValidatorError::config(format!(
                "{} binary cannot be placed {}",
                binary.name(),
                placement
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServingBinarySpec {
    TensorflowServing(TensorFlowServingSpec),
    OnnxRuntime(OnnxRuntimeSpec),
}

impl ServingBinarySpec {
    pub fn name(&self) -> &'static str {
        match self {
            Self::TensorflowServing(_) => "tensorflow_serving",
            Self::OnnxRuntime(_) => "onnx_runtime",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorFlowServingSpec {
    pub model_name: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub digests: Vec<String>,
    #[serde(default = "default_tensorflow_serving_image")]
    pub image_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OnnxRuntimeSpec {
    pub model_name: String,
    /// Device string such as `cpu:4` or `cuda:0`
    #[serde(default = "default_device")]
    pub device: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Placement {
    LocalDocker(LocalDockerConfig),
    InProcess,
}

impl fmt::Display for Placement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LocalDocker(_) => write!(f, "local_docker"),
            Self::InProcess => write!(f, "in_process"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalDockerConfig {
    /// Docker CLI executable
    #[serde(default = "default_docker_path")]
    pub docker_path: String,
    /// Network to attach serving containers to
    #[serde(default)]
    pub network: Option<String>,
}

impl Default for LocalDockerConfig {
    fn default() -> Self {
        Self {
            docker_path: default_docker_path(),
            network: None,
        }
    }
}

/// How declared serving binaries are spread over attempts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinarySelection {
    /// Every attempt exercises every binary in order
    #[default]
    All,
    /// Attempt `i` exercises binary `i mod n`
    RoundRobin,
    /// Every attempt exercises the first binary only
    First,
}

/// Retry budget of a validation run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationSpec {
    #[serde(default = "default_max_loading_time_seconds")]
    pub max_loading_time_seconds: i64,
    #[serde(default = "default_num_tries")]
    pub num_tries: i64,
    /// Once exceeded, no further attempt is started
    #[serde(default)]
    pub overall_deadline_seconds: Option<u64>,
}

impl Default for ValidationSpec {
    fn default() -> Self {
        Self {
            max_loading_time_seconds: DEFAULT_MAX_LOADING_TIME_SECONDS,
            num_tries: DEFAULT_NUM_TRIES,
            overall_deadline_seconds: None,
        }
    }
}

impl ValidationSpec {
    pub fn new(max_loading_time_seconds: i64, num_tries: i64) -> Self {
        Self {
            max_loading_time_seconds,
            num_tries,
            overall_deadline_seconds: None,
        }
    }

    pub fn validate(&self) -> ValidatorResult<()> {
        if self.num_tries <= 0 {
            return Err(ValidatorError::config(format!(
                "num_tries must be at least 1, got {}",
                self.num_tries
            )));
        }
        if self.max_loading_time_seconds <= 0 {
            return Err(ValidatorError::config(format!(
                "max_loading_time_seconds must be positive, got {}",
                self.max_loading_time_seconds
            )));
        }
        Ok(())
    }

    /// Per wait timeout. Only meaningful after [`ValidationSpec::validate`].
    pub fn loading_timeout(&self) -> Duration {
        Duration::from_secs(self.max_loading_time_seconds.max(0) as u64)
    }

    pub fn overall_deadline(&self) -> Option<Duration> {
        self.overall_deadline_seconds.map(Duration::from_secs)
    }
}

/// How to synthesize requests for the query phase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestSpec {
    pub kind: RequestKind,
    #[serde(default = "default_split_name")]
    pub split_name: String,
    #[serde(default = "default_max_examples")]
    pub max_examples: usize,
}

impl RequestSpec {
    pub fn validate(&self) -> ValidatorResult<()> {
        if self.max_examples == 0 {
            return Err(ValidatorError::config("max_examples must be at least 1"));
        }
        if self.split_name.is_empty() {
            return Err(ValidatorError::config("split_name must not be empty"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    TensorflowServing(TensorFlowServingRequestSpec),
    OnnxRuntime(OnnxRuntimeRequestSpec),
}

impl RequestKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::TensorflowServing(_) => "tensorflow_serving",
            Self::OnnxRuntime(_) => "onnx_runtime",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorFlowServingRequestSpec {
    pub rpc_kind: RpcKind,
    #[serde(default)]
    pub signature_names: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OnnxRuntimeRequestSpec {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RpcKind {
    #[serde(alias = "CLASSIFY")]
    Classify,
    #[serde(alias = "REGRESS")]
    Regress,
    #[serde(alias = "PREDICT")]
    Predict,
}

impl RpcKind {
    /// REST method suffix, as in `/v1/models/<name>:classify`
    pub fn method(&self) -> &'static str {
        match self {
            Self::Classify => "classify",
            Self::Regress => "regress",
            Self::Predict => "predict",
        }
    }
}

impl fmt::Display for RpcKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.method())
    }
}

fn default_tensorflow_serving_image() -> String {
    DEFAULT_TENSORFLOW_SERVING_IMAGE.to_string()
}

fn default_device() -> String {
    "cpu:1".to_string()
}

fn default_docker_path() -> String {
    "docker".to_string()
}

fn default_max_loading_time_seconds() -> i64 {
    DEFAULT_MAX_LOADING_TIME_SECONDS
}

fn default_num_tries() -> i64 {
    DEFAULT_NUM_TRIES
}

fn default_split_name() -> String {
    DEFAULT_SPLIT_NAME.to_string()
}

fn default_max_examples() -> usize {
    1
}
