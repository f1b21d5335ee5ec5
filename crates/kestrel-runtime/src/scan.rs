//! Plugin directory scanning.
//!
//! Layout under the plugin root:
//!
//! ```text
//! plugins/
//!   weather/            -> container "weather"
//!     forecast.toml     -> artifact manifest
//!     geo.toml
//!   games/
//!     dice.toml
//! ```
//!
//! A manifest names a catalog artifact:
//!
//! ```toml
//! artifact = "dice"   # defaults to the file stem
//! enabled = true      # defaults to true
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use figment::Figment;
use figment::providers::{Format, Toml};
use serde::Deserialize;
use tracing::{debug, error, info};

use kestrel_core::{Artifact, ArtifactCatalog, LoadError};

use crate::error::{RuntimeError, RuntimeResult};

#[derive(Debug, Deserialize)]
struct Manifest {
    #[serde(default)]
    artifact: Option<String>,
    #[serde(default = "default_enabled")]
    enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// One container directory and the artifacts its manifests resolved to.
#[derive(Debug)]
pub struct ContainerSource {
    pub name: String,
    pub path: PathBuf,
    pub artifacts: Vec<Artifact>,
}

/// Creates the plugin root if it does not exist.
pub fn ensure_root(root: &Path) -> RuntimeResult<()> {
    if !root.exists() {
        info!(path = %root.display(), "Creating plugin directory");
        fs::create_dir_all(root).map_err(|source| RuntimeError::Directory {
            path: root.display().to_string(),
            source,
        })?;
    }
    Ok(())
}

/// Scans every immediate subdirectory of `root`, sorted by name.
///
/// Fails only when the root itself cannot be created or listed.
pub fn scan_root(root: &Path, catalog: &ArtifactCatalog) -> RuntimeResult<Vec<ContainerSource>> {
    ensure_root(root)?;
    let mut dirs = Vec::new();
    for entry in read_dir(root)? {
        if entry.is_dir() {
            dirs.push(entry);
        }
    }
    dirs.sort();
    Ok(scan_containers(&dirs, catalog))
}

/// Scans each container directory, logging and skipping the unreadable ones.
pub fn scan_containers(dirs: &[PathBuf], catalog: &ArtifactCatalog) -> Vec<ContainerSource> {
    dirs.iter()
        .filter_map(|dir| match scan_container(dir, catalog) {
            Ok(source) => Some(source),
            Err(e) => {
                error!(path = %dir.display(), error = %e, "Skipping container directory");
                None
            }
        })
        .collect()
}

/// Resolves the manifests of one container directory.
///
/// Unreadable manifests and unknown artifacts are logged and skipped.
pub fn scan_container(dir: &Path, catalog: &ArtifactCatalog) -> RuntimeResult<ContainerSource> {
    let name = dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut manifests: Vec<_> = read_dir(dir)?
        .into_iter()
        .filter(|p| p.is_file() && p.extension().is_some_and(|e| e == "toml"))
        .collect();
    manifests.sort();

    let mut artifacts = Vec::new();
    for path in manifests {
        match read_manifest(&path, catalog) {
            Ok(Some(artifact)) => artifacts.push(artifact),
            Ok(None) => debug!(container = %name, manifest = %path.display(), "Artifact disabled"),
            Err(e) => error!(
                container = %name,
                manifest  = %path.display(),
                error     = %e,
                "Skipping artifact"
            ),
        }
    }

    Ok(ContainerSource {
        name,
        path: dir.to_path_buf(),
        artifacts,
    })
}

fn read_manifest(path: &Path, catalog: &ArtifactCatalog) -> Result<Option<Artifact>, LoadError> {
    let manifest: Manifest = Figment::from(Toml::file(path))
        .extract()
        .map_err(|e| LoadError::Manifest {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
    if !manifest.enabled {
        return Ok(None);
    }

    let name = match manifest.artifact {
        Some(name) => name,
        None => path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default(),
    };
    catalog
        .get(&name)
        .map(Some)
        .ok_or(LoadError::UnknownArtifact(name))
}

fn read_dir(dir: &Path) -> RuntimeResult<Vec<PathBuf>> {
    let io_err = |source| RuntimeError::Directory {
        path: dir.display().to_string(),
        source,
    };
    fs::read_dir(dir)
        .map_err(io_err)?
        .map(|entry| entry.map(|e| e.path()).map_err(io_err))
        .collect()
}
