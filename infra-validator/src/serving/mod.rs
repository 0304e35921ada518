//! Serving binaries and the runner/client seams the validator drives
//!
//! A [`ServingBinary`] is one runnable serving configuration derived from a
//! [`ServingSpec`]. The validator never builds runners or clients itself: it
//! goes through a [`RunnerFactory`] and a [`ClientFactory`], which default to
//! [`DefaultServingFactory`] and are replaced by fakes in tests.

use crate::config::{LocalDockerConfig, Placement, ServingBinarySpec, ServingSpec};
use crate::error::{ValidatorError, ValidatorResult};
use crate::request_builder::SyntheticRequest;
use async_trait::async_trait;
use std::fmt;
use std::path::Path;
use std::time::Duration;
use tokio::time::Instant;

pub mod docker;
pub mod onnx;
pub mod tf_serving;

pub use docker::LocalDockerRunner;
pub use onnx::{Device, OnnxClient, OnnxRunner, OnnxSession};
pub use tf_serving::TensorFlowServingClient;

/// Interval between readiness probes of runners and clients
pub(crate) const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// End of a readiness wait. A timeout too large to represent never expires
/// here; the validator still bounds the wait itself.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Deadline(Option<Instant>);

impl Deadline {
    pub(crate) fn after(timeout: Duration) -> Self {
        Self(Instant::now().checked_add(timeout))
    }

    /// Delay before the next probe, `None` once the deadline has passed
    pub(crate) fn next_poll(&self) -> Option<Duration> {
        let Some(deadline) = self.0 else {
            return Some(POLL_INTERVAL);
        };
        let now = Instant::now();
        (now < deadline).then(|| POLL_INTERVAL.min(deadline - now))
    }
}

/// One resolved, runnable serving configuration
#[derive(Debug, Clone, PartialEq)]
pub enum ServingBinary {
    /// TensorFlow Serving image run in a local docker container
    TensorFlowServing {
        model_name: String,
        image: String,
        docker: LocalDockerConfig,
    },
    /// ONNX Runtime session loaded inside this process
    OnnxRuntime { model_name: String, device: Device },
}

impl ServingBinary {
    pub fn model_name(&self) -> &str {
        match self {
            Self::TensorFlowServing { model_name, .. } => model_name,
            Self::OnnxRuntime { model_name, .. } => model_name,
        }
    }

    /// Build a protocol client for a server of this binary at `endpoint`
    pub fn make_client(
        &self,
        endpoint: ServerEndpoint,
    ) -> ValidatorResult<Box<dyn ModelServerClient>> {
        match (self, endpoint) {
            (Self::TensorFlowServing { model_name, .. }, ServerEndpoint::Http { host, port }) => {
                Ok(Box::new(TensorFlowServingClient::new(
                    &host,
                    port,
                    model_name.clone(),
                )?))
            }
            (Self::OnnxRuntime { model_name, .. }, ServerEndpoint::InProcess(session)) => {
                Ok(Box::new(OnnxClient::new(model_name.clone(), session)))
            }
            (binary, endpoint) => Err(ValidatorError::client(format!(
                "{binary} cannot be reached through {endpoint}"
            ))),
        }
    }
}

impl fmt::Display for ServingBinary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TensorFlowServing { image, .. } => write!(f, "{image}"),
            Self::OnnxRuntime { device, .. } => write!(f, "onnx_runtime@{device}"),
        }
    }
}

/// Resolve every serving binary declared by `spec`, in declaration order
pub fn parse_serving_binaries(spec: &ServingSpec) -> ValidatorResult<Vec<ServingBinary>> {
    spec.validate()?;
    let mut binaries = Vec::new();
    match (&spec.binary, spec.effective_placement()) {
        (ServingBinarySpec::TensorflowServing(tf), Placement::LocalDocker(docker)) => {
            for tag in &tf.tags {
                binaries.push(ServingBinary::TensorFlowServing {
                    model_name: tf.model_name.clone(),
                    image: format!("{}:{}", tf.image_name, tag),
                    docker: docker.clone(),
                });
            }
            for digest in &tf.digests {
                binaries.push(ServingBinary::TensorFlowServing {
                    model_name: tf.model_name.clone(),
                    image: format!("{}@{}", tf.image_name, digest),
                    docker: docker.clone(),
                });
            }
        }
        (ServingBinarySpec::OnnxRuntime(onnx), Placement::InProcess) => {
            binaries.push(ServingBinary::OnnxRuntime {
                model_name: onnx.model_name.clone(),
                device: onnx.device.parse()?,
            });
        }
        (binary, placement) => {
            return Err(ValidatorError::config(format!(
                "{} binary cannot be placed {placement}",
                binary.name()
            )));
        }
    }
    if binaries.is_empty() {
        return Err(ValidatorError::config("No serving binary declared"));
    }
    Ok(binaries)
}

/// Where a running server can be reached
#[derive(Clone)]
pub enum ServerEndpoint {
    Http { host: String, port: u16 },
    InProcess(OnnxSession),
}

impl fmt::Display for ServerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http { host, port } => write!(f, "http://{host}:{port}"),
            Self::InProcess(_) => write!(f, "in-process session"),
        }
    }
}

impl fmt::Debug for ServerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Lifecycle of a runner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    Created,
    Starting,
    Running,
    Stopped,
}

/// Starts and stops one serving binary instance
#[async_trait]
pub trait ModelServerRunner: Send {
    /// Launch the server without waiting for it to come up
    async fn start(&mut self) -> ValidatorResult<()>;

    /// Block until the server is running or `timeout` elapses
    async fn wait_until_running(&mut self, timeout: Duration) -> ValidatorResult<()>;

    /// Endpoint of the running server
    fn endpoint(&self) -> ValidatorResult<ServerEndpoint>;

    /// Release the server. Safe to call in any state.
    async fn stop(&mut self) -> ValidatorResult<()>;
}

/// Protocol client bound to a running server
#[async_trait]
pub trait ModelServerClient: Send {
    /// Block until the model is loaded or `timeout` elapses
    async fn wait_until_model_loaded(&mut self, timeout: Duration) -> ValidatorResult<()>;

    /// Send every request; the first failure fails the call
    async fn send_requests(&mut self, requests: &[SyntheticRequest]) -> ValidatorResult<()>;
}

/// Creates runners for serving binaries
pub trait RunnerFactory: Send + Sync {
    fn create_runner(
        &self,
        binary: &ServingBinary,
        model_path: &Path,
        unique_id: &str,
    ) -> ValidatorResult<Box<dyn ModelServerRunner>>;
}

/// Creates clients for running serving binaries
pub trait ClientFactory: Send + Sync {
    fn make_client(
        &self,
        binary: &ServingBinary,
        endpoint: ServerEndpoint,
    ) -> ValidatorResult<Box<dyn ModelServerClient>>;
}

/// Factory backed by the real serving binaries
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultServingFactory;

impl RunnerFactory for DefaultServingFactory {
    fn create_runner(
        &self,
        binary: &ServingBinary,
        model_path: &Path,
        unique_id: &str,
    ) -> ValidatorResult<Box<dyn ModelServerRunner>> {
        match binary {
            ServingBinary::TensorFlowServing { .. } => Ok(Box::new(LocalDockerRunner::new(
                binary, model_path, unique_id,
            )?)),
            ServingBinary::OnnxRuntime { device, .. } => {
                Ok(Box::new(OnnxRunner::new(model_path, *device)))
            }
        }
    }
}

impl ClientFactory for DefaultServingFactory {
    fn make_client(
        &self,
        binary: &ServingBinary,
        endpoint: ServerEndpoint,
    ) -> ValidatorResult<Box<dyn ModelServerClient>> {
        binary.make_client(endpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{OnnxRuntimeSpec, TensorFlowServingSpec};

    fn tf_spec(tags: &[&str], digests: &[&str]) -> ServingSpec {
        ServingSpec {
            binary: ServingBinarySpec::TensorflowServing(TensorFlowServingSpec {
                model_name: "chicago-taxi".to_string(),
                tags: tags.iter().map(|t| t.to_string()).collect(),
                digests: digests.iter().map(|d| d.to_string()).collect(),
                image_name: "tensorflow/serving".to_string(),
            }),
            placement: None,
            binary_selection: Default::default(),
        }
    }

    #[test]
    fn test_one_binary_per_tag_and_digest() {
        let binaries = parse_serving_binaries(&tf_spec(&["1.15.0", "2.1.0"], &["sha256:abc"]))
            .unwrap();
        let images: Vec<String> = binaries.iter().map(|b| b.to_string()).collect();
        assert_eq!(
            images,
            vec![
                "tensorflow/serving:1.15.0",
                "tensorflow/serving:2.1.0",
                "tensorflow/serving@sha256:abc",
            ]
        );
        assert!(binaries.iter().all(|b| b.model_name() == "chicago-taxi"));
    }

    #[test]
    fn test_no_tags_is_configuration_error() {
        let err = parse_serving_binaries(&tf_spec(&[], &[])).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_onnx_binary_parses_device() {
        let spec = ServingSpec {
            binary: ServingBinarySpec::OnnxRuntime(OnnxRuntimeSpec {
                model_name: "m".to_string(),
                device: "cpu:4".to_string(),
            }),
            placement: None,
            binary_selection: Default::default(),
        };
        let binaries = parse_serving_binaries(&spec).unwrap();
        assert_eq!(
            binaries,
            vec![ServingBinary::OnnxRuntime {
                model_name: "m".to_string(),
                device: Device::Cpu(4),
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_polls_until_expired() {
        let deadline = Deadline::after(Duration::from_millis(2500));
        assert_eq!(deadline.next_poll(), Some(POLL_INTERVAL));
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(deadline.next_poll(), Some(Duration::from_millis(500)));
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(deadline.next_poll(), None);
    }

    #[test]
    fn test_unrepresentable_deadline_never_expires() {
        let deadline = Deadline::after(Duration::from_secs(i64::MAX as u64));
        assert_eq!(deadline.next_poll(), Some(POLL_INTERVAL));
        assert_eq!(Deadline::after(Duration::MAX).next_poll(), Some(POLL_INTERVAL));
    }

    #[test]
    fn test_client_requires_matching_endpoint() {
        let binary = ServingBinary::OnnxRuntime {
            model_name: "m".to_string(),
            device: Device::Cpu(1),
        };
        let err = binary
            .make_client(ServerEndpoint::Http {
                host: "127.0.0.1".to_string(),
                port: 8501,
            })
            .err()
            .unwrap();
        assert!(matches!(err, ValidatorError::Client(_)));
    }
}
