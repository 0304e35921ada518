//! Locating exported model directories by naming convention
//!
//! Trainers export models under timestamped directories. Two layouts
//! (flavors) are recognized:
//!
//! ```text
//! <base>/                       # ModelFlavor::Timestamped
//!   1582072718/                 # UTC timestamp in seconds
//!
//! <base>/                       # ModelFlavor::Exporter
//!   export/
//!     <exporter name>/
//!       1582072718/
//! ```
//!
//! A trainer output uri holds a serving model directory and, for trainers
//! that produce one, an eval model directory:
//!
//! ```text
//! <uri>/
//!   eval_model_dir/             # Timestamped flavor
//!   serving_model_dir/          # Exporter flavor, or the model itself
//! ```

use crate::error::{ValidatorError, ValidatorResult};
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub const EVAL_MODEL_DIR: &str = "eval_model_dir";
pub const SERVING_MODEL_DIR: &str = "serving_model_dir";
pub const EXPORT_SUB_DIR_NAME: &str = "export";

/// Read-only directory listing capability
pub trait DirectoryLister {
    fn is_dir(&self, path: &Path) -> bool;

    /// Entry names directly under `path`, in a stable order
    fn list_dir(&self, path: &Path) -> std::io::Result<Vec<String>>;
}

/// Lister backed by the local filesystem
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFs;

impl DirectoryLister for LocalFs {
    fn is_dir(&self, path: &Path) -> bool {
        path.is_dir()
    }

    fn list_dir(&self, path: &Path) -> std::io::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(path)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }
}

/// Naming convention of an exported model
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFlavor {
    /// `<base>/<timestamp>`
    Timestamped,
    /// `<base>/export/<exporter_name>/<timestamp>`
    Exporter,
}

impl FromStr for ModelFlavor {
    type Err = ValidatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "timestamped" => Ok(Self::Timestamped),
            "exporter" => Ok(Self::Exporter),
            _ => Err(ValidatorError::config(format!(
                "Unsupported model flavor: {s}"
            ))),
        }
    }
}

impl ModelFlavor {
    /// All model paths under `base` matching this flavor
    pub fn lookup(&self, fs: &dyn DirectoryLister, base: &Path) -> Vec<PathBuf> {
        match self {
            Self::Timestamped => timestamped_children(fs, base),
            Self::Exporter => {
                let export_dir = base.join(EXPORT_SUB_DIR_NAME);
                list_or_empty(fs, &export_dir)
                    .into_iter()
                    .map(|exporter_name| export_dir.join(exporter_name))
                    .filter(|dir| fs.is_dir(dir))
                    .flat_map(|dir| timestamped_children(fs, &dir))
                    .collect()
            }
        }
    }

    /// The single model path under `base` matching this flavor
    pub fn resolve(&self, fs: &dyn DirectoryLister, base: &Path) -> ValidatorResult<PathBuf> {
        only_path(self.lookup(fs, base), base)
    }
}

/// Look up all model paths of `flavor` under `base` on the local filesystem
pub fn lookup_model_paths<P: AsRef<Path>>(base: P, flavor: ModelFlavor) -> Vec<PathBuf> {
    flavor.lookup(&LocalFs, base.as_ref())
}

/// Resolve the single model path of `flavor` under `base` on the local filesystem
pub fn resolve_model_path<P: AsRef<Path>>(base: P, flavor: ModelFlavor) -> ValidatorResult<PathBuf> {
    flavor.resolve(&LocalFs, base.as_ref())
}

pub fn eval_model_dir<P: AsRef<Path>>(output_uri: P) -> PathBuf {
    output_uri.as_ref().join(EVAL_MODEL_DIR)
}

pub fn serving_model_dir<P: AsRef<Path>>(output_uri: P) -> PathBuf {
    output_uri.as_ref().join(SERVING_MODEL_DIR)
}

/// Timestamped eval model, falling back to the serving model when there is none
pub fn eval_model_path<P: AsRef<Path>>(output_uri: P) -> ValidatorResult<PathBuf> {
    let model_dir = eval_model_dir(&output_uri);
    let paths = ModelFlavor::Timestamped.lookup(&LocalFs, &model_dir);
    if paths.is_empty() {
        return serving_model_path(output_uri);
    }
    only_path(paths, &model_dir)
}

/// Exported serving model, or the serving model dir itself when it does not
/// follow the exporter layout
pub fn serving_model_path<P: AsRef<Path>>(output_uri: P) -> ValidatorResult<PathBuf> {
    let model_dir = serving_model_dir(output_uri);
    let paths = ModelFlavor::Exporter.lookup(&LocalFs, &model_dir);
    if paths.is_empty() {
        return Ok(model_dir);
    }
    only_path(paths, &model_dir)
}

/// Version of the serving model: the timestamp of its directory, or the
/// current time for models exported without one
pub fn serving_model_version<P: AsRef<Path>>(output_uri: P) -> ValidatorResult<String> {
    let path = serving_model_path(output_uri)?;
    Ok(version_of(&path).unwrap_or_else(|| chrono::Utc::now().timestamp().to_string()))
}

/// Numeric final component of `path`, if any
pub fn version_of(path: &Path) -> Option<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .filter(|n| is_timestamp(n))
        .map(str::to_string)
}

fn is_timestamp(name: &str) -> bool {
    !name.is_empty() && name.bytes().all(|b| b.is_ascii_digit())
}

fn list_or_empty(fs: &dyn DirectoryLister, dir: &Path) -> Vec<String> {
    if !fs.is_dir(dir) {
        return Vec::new();
    }
    match fs.list_dir(dir) {
        Ok(names) => names,
        Err(e) => {
            log::debug!("Failed to list {}: {e}", dir.display());
            Vec::new()
        }
    }
}

fn timestamped_children(fs: &dyn DirectoryLister, dir: &Path) -> Vec<PathBuf> {
    list_or_empty(fs, dir)
        .into_iter()
        .filter(|name| is_timestamp(name))
        .map(|name| dir.join(name))
        .filter(|path| fs.is_dir(path))
        .collect()
}

fn only_path(mut paths: Vec<PathBuf>, base: &Path) -> ValidatorResult<PathBuf> {
    match paths.len() {
        0 => Err(ValidatorError::model_path(format!(
            "No model found under {}",
            base.display()
        ))),
        1 => Ok(paths.remove(0)),
        n => Err(ValidatorError::model_path(format!(
            "Expected a single model under {}, found {n}",
            base.display()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn mkdirs(root: &Path, dirs: &[&str]) {
        for dir in dirs {
            fs::create_dir_all(root.join(dir)).unwrap();
        }
    }

    #[test]
    fn test_timestamped_lookup_skips_non_numeric_and_files() {
        let temp_dir = TempDir::new().unwrap();
        let base = temp_dir.path();
        mkdirs(base, &["1582072718", "1582072719", "tmp-1582072720", "latest"]);
        fs::write(base.join("1582072721"), b"not a dir").unwrap();

        let paths = lookup_model_paths(base, ModelFlavor::Timestamped);
        assert_eq!(
            paths,
            vec![base.join("1582072718"), base.join("1582072719")]
        );
        assert!(resolve_model_path(base, ModelFlavor::Timestamped)
            .unwrap_err()
            .to_string()
            .contains("found 2"));
    }

    #[test]
    fn test_exporter_lookup_walks_every_exporter() {
        let temp_dir = TempDir::new().unwrap();
        let base = temp_dir.path();
        mkdirs(
            base,
            &[
                "export/my_exporter/1582072718",
                "export/my_exporter/temp-123",
                "export/other_exporter/1582072800",
            ],
        );
        fs::write(base.join("export/stray_file"), b"").unwrap();

        let paths = lookup_model_paths(base, ModelFlavor::Exporter);
        assert_eq!(
            paths,
            vec![
                base.join("export/my_exporter/1582072718"),
                base.join("export/other_exporter/1582072800"),
            ]
        );
    }

    #[test]
    fn test_missing_structure_is_empty_not_error() {
        let temp_dir = TempDir::new().unwrap();
        let missing = temp_dir.path().join("nope");

        assert!(lookup_model_paths(&missing, ModelFlavor::Timestamped).is_empty());
        assert!(lookup_model_paths(temp_dir.path(), ModelFlavor::Exporter).is_empty());

        let err = resolve_model_path(&missing, ModelFlavor::Exporter).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_serving_model_path_falls_back_to_model_dir() {
        let temp_dir = TempDir::new().unwrap();
        let uri = temp_dir.path();
        mkdirs(uri, &["serving_model_dir"]);

        assert_eq!(serving_model_path(uri).unwrap(), serving_model_dir(uri));
        assert_eq!(eval_model_path(uri).unwrap(), serving_model_dir(uri));

        let version = serving_model_version(uri).unwrap();
        assert!(version.parse::<i64>().unwrap() > 1_500_000_000);
    }

    #[test]
    fn test_estimator_layout_paths_and_version() {
        let temp_dir = TempDir::new().unwrap();
        let uri = temp_dir.path();
        mkdirs(
            uri,
            &[
                "serving_model_dir/export/chicago-taxi/1582072718",
                "eval_model_dir/1582072700",
            ],
        );

        assert_eq!(
            serving_model_path(uri).unwrap(),
            uri.join("serving_model_dir/export/chicago-taxi/1582072718")
        );
        assert_eq!(
            eval_model_path(uri).unwrap(),
            uri.join("eval_model_dir/1582072700")
        );
        assert_eq!(serving_model_version(uri).unwrap(), "1582072718");
    }

    #[test]
    fn test_flavor_from_str() {
        assert_eq!(
            "Exporter".parse::<ModelFlavor>().unwrap(),
            ModelFlavor::Exporter
        );
        assert!("keras".parse::<ModelFlavor>().is_err());
    }
}
