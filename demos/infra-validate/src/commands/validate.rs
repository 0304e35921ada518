use infra_validator::{
    BlessingArtifact, ExamplesArtifact, ExecutionContext, InfraValidator, InfraValidatorConfig,
    ModelArtifact, ValidatorError,
};
use serde_json::json;

pub struct ValidateArgs {
    pub config: String,
    pub model: String,
    pub model_version: Option<String>,
    pub examples: Option<String>,
    pub splits: Vec<String>,
    pub blessing: String,
    pub tmp_dir: String,
    pub unique_id: String,
}

pub async fn run_validate(args: ValidateArgs) -> Result<(), ValidatorError> {
    let config = InfraValidatorConfig::from_path(&args.config)?;

    let mut model = ModelArtifact::new(&args.model);
    if let Some(version) = args.model_version {
        model = model.with_version(version);
    }
    let examples = args
        .examples
        .map(|uri| ExamplesArtifact::new(uri, args.splits.clone()));
    let mut blessing = BlessingArtifact::new(&args.blessing);

    log::info!(
        "Validating {} with {} (config {})",
        args.model,
        config.serving_spec.model_name(),
        args.config
    );

    let validator = InfraValidator::new(ExecutionContext::new(&args.tmp_dir, &args.unique_id));
    let result = validator
        .run(&config, &model, examples.as_ref(), &mut blessing)
        .await?;

    let report = json!({
        "blessing": blessing,
        "result": result,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(())
}
