use clap::{Parser, Subcommand};
use infra_validator::ValidatorError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;
use commands::{run_resolve, run_validate};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(name = "infra-validate")]
#[command(about = "Check that a model can be loaded by its serving binary before promoting it")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a model and write the blessing artifact
    Validate {
        /// JSON file with serving_spec, validation_spec and request_spec
        #[arg(short, long)]
        config: String,

        /// Trainer output uri holding serving_model_dir
        #[arg(short, long)]
        model: String,

        /// Model version used when the export has no version directory
        #[arg(long)]
        model_version: Option<String>,

        /// Examples uri, required when the config has a request_spec
        #[arg(short, long)]
        examples: Option<String>,

        /// Split names present under the examples uri
        #[arg(long, value_delimiter = ',', default_value = "eval")]
        splits: Vec<String>,

        /// Directory receiving the blessing marker
        #[arg(short, long)]
        blessing: String,

        /// Scratch directory for prepared model copies
        #[arg(long, default_value = "./.infra-validator")]
        tmp_dir: String,

        /// Identifier used to name serving instances
        #[arg(long, default_value = "1")]
        unique_id: String,
    },
    /// Print the model path(s) found under a directory
    Resolve {
        /// Directory to search
        #[arg(long)]
        base: String,

        /// Naming convention of the export
        #[arg(long, default_value = "exporter")]
        flavor: Flavor,

        /// Print every match instead of requiring exactly one
        #[arg(long)]
        all: bool,
    },
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
pub enum Flavor {
    /// <base>/<timestamp>
    Timestamped,
    /// <base>/export/<exporter>/<timestamp>
    Exporter,
}

#[tokio::main]
async fn main() -> Result<(), ValidatorError> {
    // stdout carries the JSON report
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Validate {
            config,
            model,
            model_version,
            examples,
            splits,
            blessing,
            tmp_dir,
            unique_id,
        } => {
            run_validate(commands::ValidateArgs {
                config,
                model,
                model_version,
                examples,
                splits,
                blessing,
                tmp_dir,
                unique_id,
            })
            .await?;
        }
        Commands::Resolve { base, flavor, all } => {
            run_resolve(base, flavor, all)?;
        }
    }

    Ok(())
}
