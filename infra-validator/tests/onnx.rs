use infra_validator::serving::onnx::OnnxBackend;
use infra_validator::serving::OnnxRunner;
use infra_validator::{
    BlessingArtifact, Device, ExamplesArtifact, ExecutionContext, InfraValidator,
    InfraValidatorConfig, ModelArtifact, ModelServerClient, ModelServerRunner, RequestTarget,
    ServingBinary, SyntheticRequest,
};
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;

/// Identity graph: float input `x` of shape [batch, 3] copied to output `y`
fn fixture_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/identity")
}

fn onnx_binary() -> ServingBinary {
    ServingBinary::OnnxRuntime {
        model_name: "identity".to_string(),
        device: Device::Cpu(1),
    }
}

fn onnx_request(inputs: serde_json::Value) -> SyntheticRequest {
    SyntheticRequest {
        target: RequestTarget::OnnxRuntime,
        body: json!({ "inputs": inputs }),
    }
}

#[test]
fn test_backend_runs_identity_model() {
    let mut backend =
        OnnxBackend::load(&fixture_dir().join("model.onnx"), Device::Cpu(1)).unwrap();

    let inputs = json!({"x": [[0.5, 1.5, 2.5], [3.0, 4.0, 5.0]]});
    let outputs = backend.infer(inputs.as_object().unwrap()).unwrap();
    assert_eq!(outputs["y"], json!([0.5, 1.5, 2.5, 3.0, 4.0, 5.0]));

    let err = backend
        .infer(json!({"z": [[1.0, 2.0, 3.0]]}).as_object().unwrap())
        .unwrap_err();
    assert!(err.to_string().contains("Missing required input: x"));
}

#[tokio::test]
async fn test_runner_and_client_lifecycle() {
    let mut runner = OnnxRunner::new(&fixture_dir(), Device::Cpu(1));
    runner.start().await.unwrap();
    runner
        .wait_until_running(Duration::from_secs(60))
        .await
        .unwrap();

    let mut client = onnx_binary().make_client(runner.endpoint().unwrap()).unwrap();
    client
        .wait_until_model_loaded(Duration::from_secs(1))
        .await
        .unwrap();
    client
        .send_requests(&[
            onnx_request(json!({"x": [0.5, 1.5, 2.5]})),
            onnx_request(json!({"x": [[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]]})),
        ])
        .await
        .unwrap();

    // integer data builds an i64 tensor, which the float input rejects
    let err = client
        .send_requests(&[onnx_request(json!({"x": [[1, 2, 3]]}))])
        .await
        .unwrap_err();
    assert!(err.to_string().contains("ONNX inference failed"));

    runner.stop().await.unwrap();
    assert!(runner.endpoint().is_err());
    assert!(client
        .wait_until_model_loaded(Duration::from_secs(1))
        .await
        .is_err());
}

#[tokio::test]
async fn test_onnx_model_is_blessed_end_to_end() {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path();

    let model_uri = root.join("trainer/current");
    let version_dir = model_uri.join("serving_model_dir/export/identity/1700000000");
    fs::create_dir_all(&version_dir).unwrap();
    fs::copy(fixture_dir().join("model.onnx"), version_dir.join("model.onnx")).unwrap();

    let examples_uri = root.join("examples");
    fs::create_dir_all(examples_uri.join("eval")).unwrap();
    fs::write(
        examples_uri.join("eval/data.jsonl"),
        "{\"x\": [0.25, 0.5, 0.75]}\n{\"x\": [1.0, 2.0, 3.5]}\n",
    )
    .unwrap();

    let config = InfraValidatorConfig::from_json(
        r#"{
            "serving_spec": {"binary": {"onnx_runtime": {"model_name": "identity", "device": "cpu:1"}}},
            "validation_spec": {"max_loading_time_seconds": 60, "num_tries": 2},
            "request_spec": {"kind": {"onnx_runtime": {}}, "max_examples": 2}
        }"#,
    )
    .unwrap();
    let mut blessing = BlessingArtifact::new(root.join("output/blessing"));

    let result = InfraValidator::new(ExecutionContext::new(root.join(".temp"), "1"))
        .run(
            &config,
            &ModelArtifact::new(&model_uri),
            Some(&ExamplesArtifact::new(&examples_uri, vec!["eval".to_string()])),
            &mut blessing,
        )
        .await
        .unwrap();

    assert!(result.blessed, "failures: {:?}", result.failures);
    assert_eq!(result.attempts, 1);
    assert!(blessing.uri.join("INFRA_BLESSED").is_file());
    assert_eq!(blessing.get_int_custom_property("blessed"), Some(1));
}
