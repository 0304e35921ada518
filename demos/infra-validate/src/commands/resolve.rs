use infra_validator::{lookup_model_paths, resolve_model_path, ModelFlavor, ValidatorError};

use crate::Flavor;

pub fn run_resolve(base: String, flavor: Flavor, all: bool) -> Result<(), ValidatorError> {
    let flavor = match flavor {
        Flavor::Timestamped => ModelFlavor::Timestamped,
        Flavor::Exporter => ModelFlavor::Exporter,
    };

    if all {
        for path in lookup_model_paths(&base, flavor) {
            println!("{}", path.display());
        }
    } else {
        println!("{}", resolve_model_path(&base, flavor)?.display());
    }

    Ok(())
}
