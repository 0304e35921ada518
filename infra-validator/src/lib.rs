//! # Infra Validator
//!
//! Checks that a trained model can actually be loaded, and optionally
//! queried, by a serving binary before it is promoted. Validation is retried
//! a bounded number of times and ends in a binary verdict persisted as a
//! marker file plus a `blessed` property on the output artifact.

pub mod artifact;
pub mod blessing;
pub mod config;
pub mod error;
pub mod model_paths;
pub mod request_builder;
pub mod serving;
pub mod validator;

// Re-exports
pub use artifact::{Artifact, BlessingArtifact, ExamplesArtifact, ModelArtifact, PropertyValue};
pub use blessing::{write_blessing, Verdict, BLESSED_FILE_NAME, NOT_BLESSED_FILE_NAME};
pub use config::{
    BinarySelection, InfraValidatorConfig, RequestKind, RequestSpec, RpcKind, ServingSpec,
    ValidationSpec,
};
pub use error::{ValidatorError, ValidatorResult};
pub use model_paths::{lookup_model_paths, resolve_model_path, ModelFlavor};
pub use request_builder::{ExamplesRequestBuilder, RequestBuilder, RequestTarget, SyntheticRequest};
pub use serving::{
    parse_serving_binaries, ClientFactory, DefaultServingFactory, Device, ModelServerClient,
    ModelServerRunner, RunnerFactory, ServerEndpoint, ServingBinary,
};
pub use validator::{
    AttemptError, AttemptFailure, BlessingResult, ExecutionContext, InfraValidator, Stage,
};
