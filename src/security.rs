use std::fs::File;
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use cargo_metadata::MetadataCommand;
use serde::Serialize;
use sha2::{Digest, Sha256};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Bom {
    bom_format: &'static str,
    spec_version: &'static str,
    version: u32,
    metadata: BomMetadata,
    components: Vec<Component>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BomMetadata {
    timestamp: String,
    tools: Vec<Tool>,
}

#[derive(Debug, Serialize)]
struct Tool {
    name: &'static str,
    version: &'static str,
}

#[derive(Debug, Serialize)]
struct Component {
    #[serde(rename = "type")]
    component_type: &'static str,
    name: String,
    version: Option<String>,
    purl: Option<String>,
    licenses: Option<Vec<LicenseWrapper>>,
}

#[derive(Debug, Serialize)]
struct LicenseWrapper {
    license: License,
}

#[derive(Debug, Serialize)]
struct License {
    id: String,
}

/// Generate a CycloneDX-style SBOM for this binary's dependency tree and
/// write it to `output`.
pub fn generate_sbom(output: &Path) -> Result<()> {
    let metadata = MetadataCommand::new()
        .exec()
        .context("Failed to fetch cargo metadata")?;

    let root_id = metadata.root_package().map(|pkg| pkg.id.clone());
    let mut components = Vec::new();
    for package in &metadata.packages {
        let is_root = root_id.as_ref().is_some_and(|id| id == &package.id);
        if package.source.is_none() && !is_root {
            // Path dependencies would leak local filesystem layout.
            continue;
        }

        components.push(Component {
            component_type: "library",
            name: package.name.clone(),
            version: Some(package.version.to_string()),
            purl: Some(format!("pkg:cargo/{}@{}", package.name, package.version)),
            licenses: package.license.as_ref().map(|expr| {
                vec![LicenseWrapper {
                    license: License { id: expr.clone() },
                }]
            }),
        });
    }

    let bom = Bom {
        bom_format: "CycloneDX",
        spec_version: "1.5",
        version: 1,
        metadata: BomMetadata {
            timestamp: chrono::Utc::now().to_rfc3339(),
            tools: vec![Tool {
                name: "conveyor",
                version: env!("CARGO_PKG_VERSION"),
            }],
        },
        components,
    };

    if let Some(parent) = output.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create SBOM directory: {}", parent.display()))?;
    }

    let file = File::create(output)
        .with_context(|| format!("Failed to create SBOM file: {}", output.display()))?;
    serde_json::to_writer_pretty(file, &bom)
        .with_context(|| format!("Failed to write SBOM JSON: {}", output.display()))?;

    Ok(())
}

/// SHA256 of the file at `path` as a lowercase hex string. Used to
/// fingerprint scan reports and archived artifacts.
pub fn compute_sha256(path: &Path) -> Result<String> {
    let mut file = File::open(path)
        .with_context(|| format!("Failed to open file for hashing: {}", path.display()))?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)
        .with_context(|| format!("Failed to hash file: {}", path.display()))?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// Write the digest of `path` into `output` in `sha256sum` format and return
/// it.
pub fn write_sha256(path: &Path, output: &Path) -> Result<String> {
    let digest = compute_sha256(path)?;
    if let Some(parent) = output.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create digest directory: {}", parent.display()))?;
    }
    let mut file = File::create(output)
        .with_context(|| format!("Failed to create digest file: {}", output.display()))?;
    writeln!(file, "{}  {}", digest, path.display())
        .with_context(|| format!("Failed to write digest file: {}", output.display()))?;
    Ok(digest)
}
