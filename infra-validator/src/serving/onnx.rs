//! ONNX Runtime serving binary
//!
//! Runs the model inside this process instead of a separate server: the
//! runner loads `model.onnx` into an ONNX Runtime session on a blocking
//! thread, and the client feeds request inputs through that session. Useful
//! for models exported to ONNX and for hosts without docker.

use super::{ModelServerClient, ModelServerRunner, RunnerState, ServerEndpoint};
use crate::error::{ValidatorError, ValidatorResult};
use crate::request_builder::{RequestTarget, SyntheticRequest};
use async_trait::async_trait;
use log::{debug, info};
use ndarray::{ArrayD, IxDyn};
use ort::execution_providers::ExecutionProvider;
use ort::{session::Session, value::Value as OrtValue};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

pub const MODEL_FILE_NAME: &str = "model.onnx";

/// Device types for model execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Device {
    /// CPU device with thread count
    Cpu(usize),
    /// CUDA device with device ID
    #[cfg(feature = "cuda")]
    Cuda(usize),
}

impl Default for Device {
    fn default() -> Self {
        Self::Cpu(1)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu(i) => write!(f, "cpu:{i}"),
            #[cfg(feature = "cuda")]
            Self::Cuda(i) => write!(f, "cuda:{i}"),
        }
    }
}

impl std::str::FromStr for Device {
    type Err = ValidatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (device_type, id_part) = s
            .trim()
            .split_once(':')
            .map_or_else(|| (s.trim(), None), |(device, id)| (device, Some(id)));

        let id = match id_part {
            None => None,
            Some(id) => Some(id.trim().parse::<usize>().map_err(|_| {
                ValidatorError::config(format!("Invalid device id in {s:?}"))
            })?),
        };

        match device_type.to_lowercase().as_str() {
            "cpu" => Ok(Self::Cpu(id.unwrap_or(1))),
            #[cfg(feature = "cuda")]
            "cuda" => Ok(Self::Cuda(id.unwrap_or(0))),
            _ => Err(ValidatorError::config(format!("Unsupported device: {s}"))),
        }
    }
}

impl Device {
    /// Check if the device is available on the system
    pub fn is_available(&self) -> bool {
        match self {
            Self::Cpu(_) => true,
            #[cfg(feature = "cuda")]
            Self::Cuda(id) => {
                use ort::execution_providers::CUDAExecutionProvider;
                CUDAExecutionProvider::default()
                    .with_device_id(*id as i32)
                    .is_available()
                    .unwrap_or(false)
            }
        }
    }
}

#[derive(Debug, Clone)]
struct TensorInfo {
    name: String,
    data_type: String,
}

/// A loaded ONNX Runtime session
pub struct OnnxBackend {
    session: Session,
    inputs: Vec<TensorInfo>,
    outputs: Vec<TensorInfo>,
}

impl OnnxBackend {
    /// Load an ONNX model file on `device`
    pub fn load(model_file: &Path, device: Device) -> ValidatorResult<Self> {
        if !device.is_available() {
            return Err(ValidatorError::runner(format!(
                "Device {device} is not available"
            )));
        }

        let mut builder = Session::builder().map_err(|e| {
            ValidatorError::runner(format!("Failed to create session builder: {e}"))
        })?;
        match device {
            Device::Cpu(_) => {
                use ort::execution_providers::CPUExecutionProvider;
                CPUExecutionProvider::default()
                    .register(&mut builder)
                    .map_err(|e| ValidatorError::runner(format!("Failed to register CPU: {e}")))?;
            }
            #[cfg(feature = "cuda")]
            Device::Cuda(id) => {
                use ort::execution_providers::CUDAExecutionProvider;
                CUDAExecutionProvider::default()
                    .with_device_id(id as i32)
                    .register(&mut builder)
                    .map_err(|e| ValidatorError::runner(format!("Failed to register CUDA: {e}")))?;
            }
        }

        let session = builder.commit_from_file(model_file).map_err(|e| {
            ValidatorError::runner(format!(
                "Failed to load ONNX model {}: {e}",
                model_file.display()
            ))
        })?;

        let inputs: Vec<TensorInfo> = session
            .inputs
            .iter()
            .map(|input| TensorInfo {
                name: input.name.clone(),
                data_type: format!("{:?}", input.input_type),
            })
            .collect();
        let outputs: Vec<TensorInfo> = session
            .outputs
            .iter()
            .map(|output| TensorInfo {
                name: output.name.clone(),
                data_type: format!("{:?}", output.output_type),
            })
            .collect();

        info!(
            "ONNX session for {} loaded with {} inputs and {} outputs",
            model_file.display(),
            inputs.len(),
            outputs.len()
        );
        for input in &inputs {
            debug!("  input '{}': {}", input.name, input.data_type);
        }

        Ok(Self {
            session,
            inputs,
            outputs,
        })
    }

    /// Run one inference. Every declared input must be present.
    pub fn infer(&mut self, inputs: &Map<String, Value>) -> ValidatorResult<Map<String, Value>> {
        let mut onnx_inputs = HashMap::new();
        for info in &self.inputs {
            let data = inputs.get(&info.name).ok_or_else(|| {
                ValidatorError::inference(format!("Missing required input: {}", info.name))
            })?;
            onnx_inputs.insert(info.name.clone(), json_to_tensor(&info.name, data)?);
        }

        let outputs = self
            .session
            .run(onnx_inputs)
            .map_err(|e| ValidatorError::inference(format!("ONNX inference failed: {e}")))?;

        let mut result = Map::new();
        for info in &self.outputs {
            if let Some(tensor) = outputs.get(&info.name) {
                result.insert(info.name.clone(), tensor_to_json(tensor)?);
            }
        }
        Ok(result)
    }
}

/// Flatten a (possibly nested) JSON array, returning its values and shape.
/// A flat array becomes a batch of one.
fn flatten(data: &Value) -> Option<(Vec<&Value>, Vec<usize>)> {
    let Value::Array(rows) = data else {
        return None;
    };
    if rows.iter().all(|r| !r.is_array()) {
        return Some((rows.iter().collect(), vec![1, rows.len()]));
    }

    let mut values = Vec::new();
    let mut inner_shape: Option<Vec<usize>> = None;
    for row in rows {
        let (row_values, mut row_shape) = flatten(row)?;
        // drop the batch-of-one dimension added for leaf rows
        if row.as_array().is_some_and(|r| r.iter().all(|v| !v.is_array())) {
            row_shape.remove(0);
        }
        if inner_shape.as_ref().is_some_and(|shape| *shape != row_shape) {
            return None;
        }
        inner_shape = Some(row_shape);
        values.extend(row_values);
    }

    let mut shape = vec![rows.len()];
    shape.extend(inner_shape.unwrap_or_default());
    Some((values, shape))
}

/// Convert a JSON value to an ONNX tensor, as i64 when every element is an
/// integer and as f32 otherwise
fn json_to_tensor(
    name: &str,
    data: &Value,
) -> ValidatorResult<ort::value::Value<ort::value::DynValueTypeMarker>> {
    let (values, shape) = flatten(data).ok_or_else(|| {
        ValidatorError::inference(format!("Input {name} is not a rectangular array"))
    })?;

    if let Some(ints) = values.iter().map(|v| v.as_i64()).collect::<Option<Vec<_>>>() {
        let array = ArrayD::<i64>::from_shape_vec(IxDyn(&shape), ints).map_err(|e| {
            ValidatorError::inference(format!("Failed to create i64 tensor for {name}: {e}"))
        })?;
        return Ok(OrtValue::from_array(array)
            .map_err(|e| {
                ValidatorError::inference(format!("Failed to create ONNX value for {name}: {e}"))
            })?
            .into_dyn());
    }

    if let Some(floats) = values
        .iter()
        .map(|v| v.as_f64().map(|f| f as f32))
        .collect::<Option<Vec<_>>>()
    {
        let array = ArrayD::<f32>::from_shape_vec(IxDyn(&shape), floats).map_err(|e| {
            ValidatorError::inference(format!("Failed to create f32 tensor for {name}: {e}"))
        })?;
        return Ok(OrtValue::from_array(array)
            .map_err(|e| {
                ValidatorError::inference(format!("Failed to create ONNX value for {name}: {e}"))
            })?
            .into_dyn());
    }

    Err(ValidatorError::inference(format!(
        "Unsupported data type in array for input: {name}"
    )))
}

fn tensor_to_json(tensor: &ort::value::Value<ort::value::DynValueTypeMarker>) -> ValidatorResult<Value> {
    if let Ok((_, data)) = tensor.try_extract_tensor::<f32>() {
        return Ok(Value::Array(
            data.iter()
                .map(|&x| {
                    serde_json::Number::from_f64(x as f64)
                        .map(Value::Number)
                        .unwrap_or(Value::Null)
                })
                .collect(),
        ));
    }
    if let Ok((_, data)) = tensor.try_extract_tensor::<i64>() {
        return Ok(Value::Array(
            data.iter().map(|&x| Value::Number(x.into())).collect(),
        ));
    }
    Err(ValidatorError::inference(
        "Unsupported tensor type for output conversion",
    ))
}

/// Shared handle to the session loaded by an [`OnnxRunner`]
#[derive(Clone, Default)]
pub struct OnnxSession {
    backend: Arc<Mutex<Option<OnnxBackend>>>,
}

impl OnnxSession {
    pub fn is_loaded(&self) -> bool {
        self.backend.lock().map(|b| b.is_some()).unwrap_or(false)
    }

    fn install(&self, backend: OnnxBackend) -> ValidatorResult<()> {
        let mut guard = self
            .backend
            .lock()
            .map_err(|_| ValidatorError::runner("ONNX session lock poisoned"))?;
        *guard = Some(backend);
        Ok(())
    }

    fn release(&self) {
        if let Ok(mut guard) = self.backend.lock() {
            guard.take();
        }
    }

    async fn infer(&self, inputs: Map<String, Value>) -> ValidatorResult<Map<String, Value>> {
        let backend = Arc::clone(&self.backend);
        tokio::task::spawn_blocking(move || {
            let mut guard = backend
                .lock()
                .map_err(|_| ValidatorError::inference("ONNX session lock poisoned"))?;
            let backend = guard
                .as_mut()
                .ok_or_else(|| ValidatorError::inference("ONNX session is not loaded"))?;
            backend.infer(&inputs)
        })
        .await
        .map_err(|e| ValidatorError::inference(format!("Inference task failed: {e}")))?
    }
}

/// Loads a model into an in-process ONNX Runtime session
pub struct OnnxRunner {
    model_file: PathBuf,
    device: Device,
    session: OnnxSession,
    loading: Option<JoinHandle<ValidatorResult<OnnxBackend>>>,
    state: RunnerState,
}

impl OnnxRunner {
    /// `model_path` is either a `.onnx` file or a directory holding `model.onnx`
    pub fn new(model_path: &Path, device: Device) -> Self {
        let model_file = if model_path.extension().and_then(|e| e.to_str()) == Some("onnx") {
            model_path.to_path_buf()
        } else {
            model_path.join(MODEL_FILE_NAME)
        };
        Self {
            model_file,
            device,
            session: OnnxSession::default(),
            loading: None,
            state: RunnerState::Created,
        }
    }
}

#[async_trait]
impl ModelServerRunner for OnnxRunner {
    async fn start(&mut self) -> ValidatorResult<()> {
        if self.state != RunnerState::Created {
            return Err(ValidatorError::runner("ONNX runner already started"));
        }
        if !self.model_file.is_file() {
            return Err(ValidatorError::runner(format!(
                "ONNX model file not found: {}",
                self.model_file.display()
            )));
        }
        let model_file = self.model_file.clone();
        let device = self.device;
        self.loading = Some(tokio::task::spawn_blocking(move || {
            OnnxBackend::load(&model_file, device)
        }));
        self.state = RunnerState::Starting;
        Ok(())
    }

    async fn wait_until_running(&mut self, timeout: Duration) -> ValidatorResult<()> {
        let loading = self
            .loading
            .take()
            .ok_or_else(|| ValidatorError::runner("ONNX runner not started"))?;

        let backend = match tokio::time::timeout(timeout, loading).await {
            Err(_) => {
                return Err(ValidatorError::timeout(
                    format!("{} to load", self.model_file.display()),
                    timeout,
                ))
            }
            Ok(joined) => joined
                .map_err(|e| ValidatorError::runner(format!("Model loading task failed: {e}")))??,
        };
        self.session.install(backend)?;
        self.state = RunnerState::Running;
        Ok(())
    }

    fn endpoint(&self) -> ValidatorResult<ServerEndpoint> {
        if self.state != RunnerState::Running {
            return Err(ValidatorError::runner("ONNX session is not running"));
        }
        Ok(ServerEndpoint::InProcess(self.session.clone()))
    }

    async fn stop(&mut self) -> ValidatorResult<()> {
        if let Some(loading) = self.loading.take() {
            loading.abort();
        }
        self.session.release();
        self.state = RunnerState::Stopped;
        Ok(())
    }
}

/// Client feeding requests through an in-process session
pub struct OnnxClient {
    model_name: String,
    session: OnnxSession,
}

impl OnnxClient {
    pub fn new(model_name: String, session: OnnxSession) -> Self {
        Self {
            model_name,
            session,
        }
    }
}

#[async_trait]
impl ModelServerClient for OnnxClient {
    async fn wait_until_model_loaded(&mut self, _timeout: Duration) -> ValidatorResult<()> {
        // Sessions are fully loaded once the runner reports running
        if self.session.is_loaded() {
            Ok(())
        } else {
            Err(ValidatorError::client(format!(
                "Model {} is not loaded",
                self.model_name
            )))
        }
    }

    async fn send_requests(&mut self, requests: &[SyntheticRequest]) -> ValidatorResult<()> {
        for (i, request) in requests.iter().enumerate() {
            if request.target != RequestTarget::OnnxRuntime {
                return Err(ValidatorError::request(format!(
                    "ONNX Runtime cannot handle {} requests",
                    request.target
                )));
            }
            let inputs = request
                .body
                .get("inputs")
                .and_then(Value::as_object)
                .cloned()
                .ok_or_else(|| {
                    ValidatorError::request(format!("Request {i} has no inputs object"))
                })?;
            let outputs = self.session.infer(inputs).await?;
            debug!(
                "Request {i} to {} produced outputs {:?}",
                self.model_name,
                outputs.keys().collect::<Vec<_>>()
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_device_parsing() {
        assert_eq!("cpu".parse::<Device>().unwrap(), Device::Cpu(1));
        assert_eq!(" CPU:8 ".parse::<Device>().unwrap(), Device::Cpu(8));
        assert!("cpu:x".parse::<Device>().is_err());
        assert!("tpu:0".parse::<Device>().is_err());
        assert_eq!(Device::Cpu(2).to_string(), "cpu:2");
        assert!(Device::default().is_available());
    }

    #[test]
    fn test_flatten_shapes() {
        let flat = json!([1, 2, 3]);
        let (values, shape) = flatten(&flat).unwrap();
        assert_eq!(values.len(), 3);
        assert_eq!(shape, vec![1, 3]);

        let matrix = json!([[1.0, 2.0], [3.0, 4.0], [5.0, 6.0]]);
        let (values, shape) = flatten(&matrix).unwrap();
        assert_eq!(values.len(), 6);
        assert_eq!(shape, vec![3, 2]);

        assert!(flatten(&json!([[1, 2], [3]])).is_none());
        assert!(flatten(&json!({"a": 1})).is_none());
    }

    #[test]
    fn test_integer_inputs_become_i64_tensors() {
        let tensor = json_to_tensor("trip_seconds", &json!([[60, 120], [300, 45]])).unwrap();
        assert!(tensor.try_extract_tensor::<f32>().is_err());
        assert_eq!(tensor_to_json(&tensor).unwrap(), json!([60, 120, 300, 45]));
    }

    #[test]
    fn test_fractional_inputs_become_f32_tensors() {
        let tensor = json_to_tensor("trip_miles", &json!([1, 2.5, 4])).unwrap();
        assert!(tensor.try_extract_tensor::<i64>().is_err());
        assert_eq!(tensor_to_json(&tensor).unwrap(), json!([1.0, 2.5, 4.0]));
    }

    #[test]
    fn test_unconvertible_inputs_are_rejected() {
        let err = json_to_tensor("x", &json!([[1.0, 2.0], [3.0]])).unwrap_err();
        assert!(err.to_string().contains("not a rectangular array"));

        let err = json_to_tensor("company", &json!(["A", "B"])).unwrap_err();
        assert!(err.to_string().contains("Unsupported data type"));

        assert!(json_to_tensor("x", &json!(1.5)).is_err());
    }

    #[tokio::test]
    async fn test_runner_fails_without_model_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut runner = OnnxRunner::new(temp_dir.path(), Device::Cpu(1));
        let err = runner.start().await.unwrap_err();
        assert!(err.to_string().contains("model.onnx"));
        assert!(runner.endpoint().is_err());
        runner.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_client_requires_loaded_session() {
        let mut client = OnnxClient::new("m".to_string(), OnnxSession::default());
        assert!(client
            .wait_until_model_loaded(Duration::from_secs(1))
            .await
            .is_err());
        let request = SyntheticRequest {
            target: RequestTarget::OnnxRuntime,
            body: json!({"inputs": {"x": [1.0]}}),
        };
        let err = client.send_requests(&[request]).await.unwrap_err();
        assert!(err.to_string().contains("not loaded"));
    }
}
