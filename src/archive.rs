use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use glob::glob;
use serde::Serialize;
use tracing::{debug, warn};

use crate::security::compute_sha256;

/// One workspace file kept after the run, with the digest recorded so the
/// copy can be verified later.
#[derive(Debug, Clone, Serialize)]
pub struct ArchivedArtifact {
    pub source: PathBuf,
    pub archived: PathBuf,
    pub digest: String,
}

/// Collect workspace files matching the artifact patterns into
/// `<archive_dir>/<build_id>/`. Patterns that match nothing are logged, not
/// fatal.
pub fn collect(
    patterns: &[String],
    workdir: &Path,
    archive_dir: &Path,
    build_id: u64,
) -> Result<Vec<ArchivedArtifact>> {
    if patterns.is_empty() {
        return Ok(Vec::new());
    }

    let destination = archive_dir.join(build_id.to_string());
    fs::create_dir_all(&destination).with_context(|| {
        format!(
            "Failed to create archive directory: {}",
            destination.display()
        )
    })?;

    let mut archived = Vec::new();
    for pattern in patterns {
        let absolute = workdir.join(pattern);
        let matches = glob(&absolute.to_string_lossy())
            .with_context(|| format!("Invalid artifact pattern: {pattern}"))?;

        let mut found = false;
        for entry in matches {
            let source = entry?;
            if !source.is_file() {
                continue;
            }
            found = true;

            let file_name = source
                .file_name()
                .map(|name| name.to_string_lossy().to_string())
                .unwrap_or_else(|| "artifact".to_string());
            let target = destination.join(&file_name);
            fs::copy(&source, &target).with_context(|| {
                format!(
                    "Failed to archive '{}' into '{}'",
                    source.display(),
                    target.display()
                )
            })?;

            let digest = compute_sha256(&target)?;
            debug!(source = %source.display(), digest = %digest, "Archived artifact");
            archived.push(ArchivedArtifact {
                source,
                archived: target,
                digest,
            });
        }

        if !found {
            warn!(pattern = %pattern, "Artifact pattern matched no files");
        }
    }

    Ok(archived)
}
