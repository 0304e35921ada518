//! Scripted serving collaborators for validator tests

#![allow(dead_code)]

use async_trait::async_trait;
use infra_validator::{
    ClientFactory, ModelServerClient, ModelServerRunner, RunnerFactory, ServerEndpoint,
    ServingBinary, SyntheticRequest, ValidatorError, ValidatorResult,
};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Where a scripted attempt fails
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Fail {
    #[default]
    Nothing,
    Start,
    Running,
    HangRunning,
    Loaded,
    Send,
}

/// Shared script and event log of the fakes
#[derive(Default)]
pub struct Harness {
    plans: Mutex<VecDeque<Fail>>,
    current: Mutex<Fail>,
    events: Mutex<Vec<String>>,
    model_paths: Mutex<Vec<PathBuf>>,
}

impl Harness {
    /// One plan per created runner; runners beyond the script succeed
    pub fn new(plans: impl IntoIterator<Item = Fail>) -> Arc<Self> {
        Arc::new(Self {
            plans: Mutex::new(plans.into_iter().collect()),
            ..Default::default()
        })
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.events()
            .iter()
            .filter(|e| e.starts_with(prefix))
            .count()
    }

    pub fn model_paths(&self) -> Vec<PathBuf> {
        self.model_paths.lock().unwrap().clone()
    }

    fn record(&self, event: impl Into<String>) {
        self.events.lock().unwrap().push(event.into());
    }
}

pub struct FakeRunnerFactory(pub Arc<Harness>);

impl RunnerFactory for FakeRunnerFactory {
    fn create_runner(
        &self,
        binary: &ServingBinary,
        model_path: &Path,
        _unique_id: &str,
    ) -> ValidatorResult<Box<dyn ModelServerRunner>> {
        let plan = self.0.plans.lock().unwrap().pop_front().unwrap_or_default();
        *self.0.current.lock().unwrap() = plan;
        self.0.model_paths.lock().unwrap().push(model_path.to_path_buf());
        self.0.record(format!("create {binary}"));
        Ok(Box::new(FakeRunner {
            harness: Arc::clone(&self.0),
            plan,
        }))
    }
}

struct FakeRunner {
    harness: Arc<Harness>,
    plan: Fail,
}

#[async_trait]
impl ModelServerRunner for FakeRunner {
    async fn start(&mut self) -> ValidatorResult<()> {
        self.harness.record("start");
        if self.plan == Fail::Start {
            return Err(ValidatorError::runner("docker daemon unavailable"));
        }
        Ok(())
    }

    async fn wait_until_running(&mut self, _timeout: Duration) -> ValidatorResult<()> {
        self.harness.record("wait_running");
        match self.plan {
            Fail::Running => Err(ValidatorError::runner("container exited")),
            Fail::HangRunning => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn endpoint(&self) -> ValidatorResult<ServerEndpoint> {
        Ok(ServerEndpoint::Http {
            host: "127.0.0.1".to_string(),
            port: 8501,
        })
    }

    async fn stop(&mut self) -> ValidatorResult<()> {
        self.harness.record("stop");
        Ok(())
    }
}

pub struct FakeClientFactory(pub Arc<Harness>);

impl ClientFactory for FakeClientFactory {
    fn make_client(
        &self,
        _binary: &ServingBinary,
        _endpoint: ServerEndpoint,
    ) -> ValidatorResult<Box<dyn ModelServerClient>> {
        self.0.record("make_client");
        let plan = *self.0.current.lock().unwrap();
        Ok(Box::new(FakeClient {
            harness: Arc::clone(&self.0),
            plan,
        }))
    }
}

struct FakeClient {
    harness: Arc<Harness>,
    plan: Fail,
}

#[async_trait]
impl ModelServerClient for FakeClient {
    async fn wait_until_model_loaded(&mut self, _timeout: Duration) -> ValidatorResult<()> {
        self.harness.record("wait_loaded");
        if self.plan == Fail::Loaded {
            return Err(ValidatorError::client("model version failed to load"));
        }
        Ok(())
    }

    async fn send_requests(&mut self, requests: &[SyntheticRequest]) -> ValidatorResult<()> {
        self.harness.record(format!("send {}", requests.len()));
        if self.plan == Fail::Send {
            return Err(ValidatorError::request("classify returned HTTP 400"));
        }
        Ok(())
    }
}
