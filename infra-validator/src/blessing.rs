//! Persisting the infra validation verdict

use crate::artifact::BlessingArtifact;
use crate::error::ValidatorResult;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const BLESSED_FILE_NAME: &str = "INFRA_BLESSED";
pub const NOT_BLESSED_FILE_NAME: &str = "INFRA_NOT_BLESSED";
pub const BLESSED_PROPERTY: &str = "blessed";

/// Binary outcome of a validation run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Blessed,
    NotBlessed,
}

impl Verdict {
    pub fn marker_file_name(&self) -> &'static str {
        match self {
            Self::Blessed => BLESSED_FILE_NAME,
            Self::NotBlessed => NOT_BLESSED_FILE_NAME,
        }
    }

    pub fn property_value(&self) -> i64 {
        match self {
            Self::Blessed => 1,
            Self::NotBlessed => 0,
        }
    }

    fn opposite(&self) -> Self {
        match self {
            Self::Blessed => Self::NotBlessed,
            Self::NotBlessed => Self::Blessed,
        }
    }
}

/// Write the marker file for `verdict` into the artifact's directory and
/// record the `blessed` property. Returns the marker path.
///
/// A marker left by an earlier run into the same directory is removed so
/// that exactly one marker exists afterwards.
pub fn write_blessing(
    verdict: Verdict,
    artifact: &mut BlessingArtifact,
) -> ValidatorResult<PathBuf> {
    std::fs::create_dir_all(&artifact.uri)?;

    let stale = artifact.uri.join(verdict.opposite().marker_file_name());
    match std::fs::remove_file(&stale) {
        Ok(()) => log::warn!("Removed stale marker {}", stale.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    let marker = artifact.uri.join(verdict.marker_file_name());
    std::fs::write(&marker, b"")?;
    artifact.set_int_custom_property(BLESSED_PROPERTY, verdict.property_value());

    log::info!(
        "Wrote {} to {}",
        verdict.marker_file_name(),
        artifact.uri.display()
    );
    Ok(marker)
}
