//! Infra validation: load the model under real serving binaries, retry a
//! bounded number of times, and bless the model if any attempt succeeds.
//!
//! A run is a sequence of attempts. Each attempt starts a runner, waits for it
//! to come up, builds a client, waits for the model to load and, when
//! requests were built, sends them. The runner is stopped at the end of every
//! attempt. The first successful attempt ends the run with
//! [`Verdict::Blessed`]; if all `num_tries` attempts fail the verdict is
//! [`Verdict::NotBlessed`]. Attempt failures never escape the run, only
//! configuration and blessing write errors do.

use crate::artifact::{BlessingArtifact, ExamplesArtifact, ModelArtifact};
use crate::blessing::{write_blessing, Verdict};
use crate::config::{BinarySelection, InfraValidatorConfig, ValidationSpec};
use crate::error::{ValidatorError, ValidatorResult};
use crate::model_paths;
use crate::request_builder::{ExamplesRequestBuilder, RequestBuilder, SyntheticRequest};
use crate::serving::{
    parse_serving_binaries, ClientFactory, DefaultServingFactory, ModelServerRunner,
    RunnerFactory, ServingBinary,
};
use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::Instant;

/// Per-execution settings supplied by the caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionContext {
    /// Scratch space for prepared model copies
    pub tmp_dir: PathBuf,
    /// Distinguishes server instances of concurrent executions
    pub unique_id: String,
}

impl ExecutionContext {
    pub fn new<P: Into<PathBuf>>(tmp_dir: P, unique_id: impl Into<String>) -> Self {
        Self {
            tmp_dir: tmp_dir.into(),
            unique_id: unique_id.into(),
        }
    }
}

/// Step of an attempt at which it failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    CreateRunner,
    StartRunner,
    WaitUntilRunning,
    MakeClient,
    WaitUntilModelLoaded,
    SendRequests,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::CreateRunner => "create runner",
            Self::StartRunner => "start runner",
            Self::WaitUntilRunning => "wait until running",
            Self::MakeClient => "make client",
            Self::WaitUntilModelLoaded => "wait until model loaded",
            Self::SendRequests => "send requests",
        };
        f.write_str(name)
    }
}

/// Error of a single attempt against one serving binary
#[derive(Debug)]
pub struct AttemptError {
    pub stage: Stage,
    pub error: ValidatorError,
}

impl fmt::Display for AttemptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed: {}", self.stage, self.error)
    }
}

impl std::error::Error for AttemptError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// Recorded failure of one attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptFailure {
    /// 1-based attempt number
    pub attempt: u32,
    pub binary: String,
    pub stage: Stage,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

/// Outcome of a validation run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlessingResult {
    pub blessed: bool,
    /// Number of attempts made
    pub attempts: u32,
    pub succeeded_attempt: Option<u32>,
    /// Every failed attempt, in order
    pub failures: Vec<AttemptFailure>,
}

impl BlessingResult {
    pub fn verdict(&self) -> Verdict {
        if self.blessed {
            Verdict::Blessed
        } else {
            Verdict::NotBlessed
        }
    }
}

/// Runs infra validation against injected serving collaborators
pub struct InfraValidator {
    context: ExecutionContext,
    runner_factory: Box<dyn RunnerFactory>,
    client_factory: Box<dyn ClientFactory>,
    request_builder: Box<dyn RequestBuilder>,
}

impl InfraValidator {
    /// Validator using the real serving binaries and the JSON example reader
    pub fn new(context: ExecutionContext) -> Self {
        Self {
            context,
            runner_factory: Box::new(DefaultServingFactory),
            client_factory: Box::new(DefaultServingFactory),
            request_builder: Box::new(ExamplesRequestBuilder),
        }
    }

    pub fn with_runner_factory(mut self, factory: impl RunnerFactory + 'static) -> Self {
        self.runner_factory = Box::new(factory);
        self
    }

    pub fn with_client_factory(mut self, factory: impl ClientFactory + 'static) -> Self {
        self.client_factory = Box::new(factory);
        self
    }

    pub fn with_request_builder(mut self, builder: impl RequestBuilder + 'static) -> Self {
        self.request_builder = Box::new(builder);
        self
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.context
    }

    /// Validate `model` and write the verdict to `blessing`.
    ///
    /// Returns an error only for invalid configuration (before any attempt)
    /// or when the verdict cannot be written.
    pub async fn run(
        &self,
        config: &InfraValidatorConfig,
        model: &ModelArtifact,
        examples: Option<&ExamplesArtifact>,
        blessing: &mut BlessingArtifact,
    ) -> ValidatorResult<BlessingResult> {
        config.validate()?;
        let binaries = parse_serving_binaries(&config.serving_spec)?;
        let model_path = self.prepare_model_path(model, config.serving_spec.model_name())?;

        let requests = match (&config.request_spec, examples) {
            (None, _) => Vec::new(),
            (Some(spec), Some(examples)) => self.request_builder.build_requests(examples, spec)?,
            (Some(_), None) => {
                return Err(ValidatorError::config(
                    "A request spec was given without examples",
                ));
            }
        };

        info!(
            "Infra validating {} with {} serving binaries ({} requests)",
            model_path.display(),
            binaries.len(),
            requests.len()
        );
        let result = self
            .validate_with_retry(
                &model_path,
                &binaries,
                config.serving_spec.binary_selection,
                &config.validation_spec,
                &requests,
            )
            .await?;

        write_blessing(result.verdict(), blessing)?;
        Ok(result)
    }

    /// Run attempts until one succeeds or `num_tries` attempts have failed
    pub async fn validate_with_retry(
        &self,
        model_path: &Path,
        binaries: &[ServingBinary],
        selection: BinarySelection,
        spec: &ValidationSpec,
        requests: &[SyntheticRequest],
    ) -> ValidatorResult<BlessingResult> {
        spec.validate()?;
        if binaries.is_empty() {
            return Err(ValidatorError::config("No serving binary to validate with"));
        }

        let num_tries = u32::try_from(spec.num_tries)
            .map_err(|_| ValidatorError::config(format!("num_tries too large: {}", spec.num_tries)))?;
        let timeout = spec.loading_timeout();
        let started = Instant::now();
        let mut failures = Vec::new();
        let mut attempts = 0;

        for attempt in 1..=num_tries {
            if let Some(deadline) = spec.overall_deadline() {
                if attempt > 1 && started.elapsed() >= deadline {
                    warn!(
                        "Overall deadline of {deadline:?} exceeded, skipping remaining {} attempts",
                        num_tries - attempt + 1
                    );
                    break;
                }
            }

            attempts = attempt;
            info!("Infra validation attempt {attempt}/{num_tries}");
            match self
                .attempt(attempt, binaries, selection, model_path, timeout, requests)
                .await
            {
                Ok(()) => {
                    info!("Infra validation attempt {attempt} succeeded, model is blessed");
                    return Ok(BlessingResult {
                        blessed: true,
                        attempts,
                        succeeded_attempt: Some(attempt),
                        failures,
                    });
                }
                Err(failure) => {
                    warn!(
                        "Infra validation attempt {attempt} with {} failed at {}: {}",
                        failure.binary, failure.stage, failure.error
                    );
                    failures.push(failure);
                }
            }
        }

        warn!("Infra validation failed after {attempts} attempts, model is not blessed");
        Ok(BlessingResult {
            blessed: false,
            attempts,
            succeeded_attempt: None,
            failures,
        })
    }

    async fn attempt(
        &self,
        attempt: u32,
        binaries: &[ServingBinary],
        selection: BinarySelection,
        model_path: &Path,
        timeout: Duration,
        requests: &[SyntheticRequest],
    ) -> Result<(), AttemptFailure> {
        let selected: Vec<usize> = match selection {
            BinarySelection::All => (0..binaries.len()).collect(),
            BinarySelection::RoundRobin => vec![(attempt as usize - 1) % binaries.len()],
            BinarySelection::First => vec![0],
        };

        for index in selected {
            let binary = &binaries[index];
            let instance_id = format!("{}-{attempt}-{index}", self.context.unique_id);
            self.validate_once(binary, model_path, &instance_id, timeout, requests)
                .await
                .map_err(|e| AttemptFailure {
                    attempt,
                    binary: binary.to_string(),
                    stage: e.stage,
                    error: e.error.to_string(),
                    failed_at: Utc::now(),
                })?;
        }
        Ok(())
    }

    /// One load (and optional query) cycle against a single serving binary.
    /// The runner is stopped on every path once it has been created.
    pub async fn validate_once(
        &self,
        binary: &ServingBinary,
        model_path: &Path,
        instance_id: &str,
        timeout: Duration,
        requests: &[SyntheticRequest],
    ) -> Result<(), AttemptError> {
        let mut runner = self
            .runner_factory
            .create_runner(binary, model_path, instance_id)
            .map_err(at(Stage::CreateRunner))?;

        let outcome = self
            .exercise(runner.as_mut(), binary, timeout, requests)
            .await;

        if let Err(e) = runner.stop().await {
            warn!("Failed to stop {binary} runner {instance_id}: {e}");
        }
        outcome
    }

    async fn exercise(
        &self,
        runner: &mut dyn ModelServerRunner,
        binary: &ServingBinary,
        timeout: Duration,
        requests: &[SyntheticRequest],
    ) -> Result<(), AttemptError> {
        runner.start().await.map_err(at(Stage::StartRunner))?;
        bounded("the server to run", timeout, runner.wait_until_running(timeout))
            .await
            .map_err(at(Stage::WaitUntilRunning))?;

        let endpoint = runner.endpoint().map_err(at(Stage::MakeClient))?;
        let mut client = self
            .client_factory
            .make_client(binary, endpoint)
            .map_err(at(Stage::MakeClient))?;

        bounded(
            "the model to load",
            timeout,
            client.wait_until_model_loaded(timeout),
        )
        .await
        .map_err(at(Stage::WaitUntilModelLoaded))?;

        if !requests.is_empty() {
            client
                .send_requests(requests)
                .await
                .map_err(at(Stage::SendRequests))?;
        }
        Ok(())
    }

    /// Path of a numeric version directory holding the serving model.
    ///
    /// Models exported without a version directory are copied under the
    /// execution's tmp dir as `<unique_id>/<model_name>/<version>`, where the
    /// version is the artifact's numeric `version` when set and
    /// [`model_paths::serving_model_version`] otherwise.
    pub fn prepare_model_path(
        &self,
        model: &ModelArtifact,
        model_name: &str,
    ) -> ValidatorResult<PathBuf> {
        let model_path = model_paths::serving_model_path(&model.uri)?;
        if !model_path.is_dir() {
            return Err(ValidatorError::model_path(format!(
                "Serving model not found: {}",
                model_path.display()
            )));
        }
        if model_paths::version_of(&model_path).is_some() {
            return Ok(model_path);
        }

        // a numeric artifact version takes precedence over the export timestamp
        let version = match model
            .version
            .clone()
            .filter(|v| !v.is_empty() && v.bytes().all(|b| b.is_ascii_digit()))
        {
            Some(version) => version,
            None => model_paths::serving_model_version(&model.uri)?,
        };
        let target = self
            .context
            .tmp_dir
            .join(&self.context.unique_id)
            .join(model_name)
            .join(version);
        info!(
            "Copying {} to versioned path {}",
            model_path.display(),
            target.display()
        );
        copy_dir_all(&model_path, &target)?;
        Ok(target)
    }
}

fn at(stage: Stage) -> impl Fn(ValidatorError) -> AttemptError {
    move |error| AttemptError { stage, error }
}

/// Bound a collaborator wait with a hard timeout of our own
async fn bounded<F>(what: &str, timeout: Duration, wait: F) -> ValidatorResult<()>
where
    F: Future<Output = ValidatorResult<()>>,
{
    match tokio::time::timeout(timeout, wait).await {
        Ok(result) => result,
        Err(_) => Err(ValidatorError::timeout(what, timeout)),
    }
}

fn copy_dir_all(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_all(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_prepare_keeps_versioned_model() {
        let temp_dir = TempDir::new().unwrap();
        let versioned = temp_dir
            .path()
            .join("model/serving_model_dir/export/taxi/1582072718");
        std::fs::create_dir_all(&versioned).unwrap();

        let validator = InfraValidator::new(ExecutionContext::new(temp_dir.path().join("tmp"), "1"));
        let path = validator
            .prepare_model_path(&ModelArtifact::new(temp_dir.path().join("model")), "taxi")
            .unwrap();
        assert_eq!(path, versioned);
    }

    #[test]
    fn test_prepare_copies_unversioned_model() {
        let temp_dir = TempDir::new().unwrap();
        let serving_dir = temp_dir.path().join("model/serving_model_dir");
        std::fs::create_dir_all(serving_dir.join("variables")).unwrap();
        std::fs::write(serving_dir.join("saved_model.pb"), b"pb").unwrap();
        std::fs::write(serving_dir.join("variables/variables.index"), b"idx").unwrap();

        let tmp_dir = temp_dir.path().join("tmp");
        let validator = InfraValidator::new(ExecutionContext::new(&tmp_dir, "7"));
        let model = ModelArtifact::new(temp_dir.path().join("model")).with_version("42");
        let path = validator.prepare_model_path(&model, "taxi").unwrap();

        assert_eq!(path, tmp_dir.join("7/taxi/42"));
        assert_eq!(std::fs::read(path.join("saved_model.pb")).unwrap(), b"pb");
        assert!(path.join("variables/variables.index").is_file());
    }

    #[test]
    fn test_prepare_versions_unversioned_copy_from_serving_model() {
        let temp_dir = TempDir::new().unwrap();
        let serving_dir = temp_dir.path().join("model/serving_model_dir");
        std::fs::create_dir_all(&serving_dir).unwrap();
        std::fs::write(serving_dir.join("saved_model.pb"), b"pb").unwrap();

        let tmp_dir = temp_dir.path().join("tmp");
        let validator = InfraValidator::new(ExecutionContext::new(&tmp_dir, "7"));
        let model = ModelArtifact::new(temp_dir.path().join("model")).with_version("v2");
        let before = Utc::now().timestamp();
        let path = validator.prepare_model_path(&model, "taxi").unwrap();

        assert_eq!(path.parent().unwrap(), tmp_dir.join("7/taxi"));
        let version: i64 = model_paths::version_of(&path).unwrap().parse().unwrap();
        assert!(version >= before && version <= Utc::now().timestamp());
        assert!(path.join("saved_model.pb").is_file());
    }

    #[test]
    fn test_prepare_rejects_missing_model() {
        let temp_dir = TempDir::new().unwrap();
        let validator = InfraValidator::new(ExecutionContext::new(temp_dir.path(), "1"));
        let err = validator
            .prepare_model_path(&ModelArtifact::new(temp_dir.path().join("absent")), "taxi")
            .unwrap_err();
        assert!(err.is_configuration());
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_times_out_hanging_wait() {
        let err = bounded("forever", Duration::from_secs(10), async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        })
        .await
        .unwrap_err();
        assert!(matches!(err, ValidatorError::Timeout { .. }));
    }
}
