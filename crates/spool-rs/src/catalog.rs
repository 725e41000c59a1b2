//! Model catalog: model name → download URL plus launch hints.
//!
//! The catalog file (`models/llm.json`) maps a model name to its download
//! URLs and the GPU-layer / context-size hints used when launching a server
//! process for it. A missing or corrupt catalog degrades to an empty one —
//! the caller simply has no model choices — it never takes the rest of the
//! system down.
//!
//! Acquisition failures here are reported as descriptive strings, matching
//! the process layer's status-string discipline (see [`crate::process`]).

use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Bound on one synchronous model download.
pub const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(15 * 60);

fn default_layers() -> u32 {
    40
}

fn default_context() -> u32 {
    2048
}

/// One catalog row.
#[derive(Deserialize, Clone, Debug)]
pub struct CatalogEntry {
    /// Download URLs; the first is used, its last path segment names the
    /// local file.
    pub urls: Vec<String>,
    /// GPU layers to offload when launching this model.
    #[serde(default = "default_layers")]
    pub layers: u32,
    /// Context size to launch this model with.
    #[serde(default = "default_context")]
    pub context: u32,
}

impl CatalogEntry {
    /// Local file name derived from the first URL's last path segment.
    pub fn file_name(&self) -> Option<&str> {
        self.urls
            .first()
            .and_then(|url| url.rsplit('/').next())
            .filter(|name| !name.is_empty())
    }
}

/// The loaded catalog plus the directory model files live in.
#[derive(Clone, Debug)]
pub struct ModelCatalog {
    entries: HashMap<String, CatalogEntry>,
    models_dir: PathBuf,
}

impl ModelCatalog {
    /// Load the catalog from a JSON file. Missing or corrupt files yield an
    /// empty catalog; model files are expected next to the catalog file.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let models_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("models"));

        let entries = match std::fs::read_to_string(path) {
            Ok(raw) => match serde_json::from_str::<HashMap<String, CatalogEntry>>(&raw) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!("model catalog {} is corrupt, ignoring it: {e}", path.display());
                    HashMap::new()
                }
            },
            Err(_) => {
                debug!("no model catalog at {}", path.display());
                HashMap::new()
            }
        };

        Self {
            entries,
            models_dir,
        }
    }

    /// Build a catalog directly from entries (tests, embedded defaults).
    pub fn with_entries(
        entries: HashMap<String, CatalogEntry>,
        models_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            entries,
            models_dir: models_dir.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Known model names, sorted for stable presentation.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn get(&self, name: &str) -> Option<&CatalogEntry> {
        self.entries.get(name)
    }

    /// Where the model file for `name` lives (or would live) on disk.
    pub fn local_path(&self, name: &str) -> Option<PathBuf> {
        self.get(name)
            .and_then(CatalogEntry::file_name)
            .map(|file| self.models_dir.join(file))
    }

    /// Materialize the model file for `name`, downloading it when missing.
    ///
    /// Blocks the caller until the file is present or the bounded wait
    /// expires. The download streams into a `.part` file renamed into place
    /// only once complete, so an interrupted transfer never leaves a
    /// half-written model behind the real name.
    pub async fn ensure_local(&self, name: &str) -> Result<PathBuf, String> {
        let entry = self
            .get(name)
            .ok_or_else(|| format!("model {name:?} is not in the catalog"))?;
        let path = self
            .local_path(name)
            .ok_or_else(|| format!("model {name:?} has no usable download URL"))?;
        if path.exists() {
            return Ok(path);
        }

        let url = entry
            .urls
            .first()
            .ok_or_else(|| format!("model {name:?} has no download URL"))?;
        debug!("downloading {url} -> {}", path.display());
        match tokio::time::timeout(DOWNLOAD_TIMEOUT, download(url, &path)).await {
            Ok(Ok(())) => Ok(path),
            Ok(Err(e)) => Err(format!("download of {url} failed: {e}")),
            Err(_) => Err(format!(
                "download of {url} did not finish within {DOWNLOAD_TIMEOUT:?}"
            )),
        }
    }
}

/// Stream `url` into `dest` via a `.part` sibling.
async fn download(url: &str, dest: &Path) -> Result<(), String> {
    let mut resp = reqwest::get(url)
        .await
        .map_err(|e| format!("request failed: {e}"))?;
    if !resp.status().is_success() {
        return Err(format!("HTTP {}", resp.status()));
    }

    let part = dest.with_extension("part");
    let mut file = tokio::fs::File::create(&part)
        .await
        .map_err(|e| format!("cannot create {}: {e}", part.display()))?;
    while let Some(chunk) = resp
        .chunk()
        .await
        .map_err(|e| format!("read failed: {e}"))?
    {
        file.write_all(&chunk)
            .await
            .map_err(|e| format!("write failed: {e}"))?;
    }
    file.flush().await.map_err(|e| format!("flush failed: {e}"))?;
    drop(file);

    tokio::fs::rename(&part, dest)
        .await
        .map_err(|e| format!("rename into place failed: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(urls: &[&str]) -> CatalogEntry {
        serde_json::from_value(serde_json::json!({
            "urls": urls,
        }))
        .unwrap()
    }

    #[test]
    fn missing_catalog_is_empty() {
        let catalog = ModelCatalog::load("/definitely/not/here/llm.json");
        assert!(catalog.is_empty());
        assert!(catalog.names().is_empty());
    }

    #[test]
    fn corrupt_catalog_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("llm.json");
        std::fs::write(&path, "{not json").unwrap();
        let catalog = ModelCatalog::load(&path);
        assert!(catalog.is_empty());
    }

    #[test]
    fn entry_defaults_apply() {
        let e = entry(&["https://host/models/tiny.gguf"]);
        assert_eq!(e.layers, 40);
        assert_eq!(e.context, 2048);
        assert_eq!(e.file_name(), Some("tiny.gguf"));
    }

    #[test]
    fn local_path_joins_models_dir_and_url_file_name() {
        let mut entries = HashMap::new();
        entries.insert("tiny".to_string(), entry(&["https://host/repo/tiny.gguf"]));
        let catalog = ModelCatalog::with_entries(entries, "/models");
        assert_eq!(
            catalog.local_path("tiny"),
            Some(PathBuf::from("/models/tiny.gguf"))
        );
        assert_eq!(catalog.local_path("unknown"), None);
    }

    #[tokio::test]
    async fn ensure_local_returns_existing_file_without_downloading() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("tiny.gguf"), b"weights").unwrap();

        let mut entries = HashMap::new();
        // The URL is unreachable; an existing file must short-circuit it.
        entries.insert(
            "tiny".to_string(),
            entry(&["http://127.0.0.1:1/tiny.gguf"]),
        );
        let catalog = ModelCatalog::with_entries(entries, dir.path());

        let path = catalog.ensure_local("tiny").await.unwrap();
        assert_eq!(path, dir.path().join("tiny.gguf"));
    }

    #[tokio::test]
    async fn ensure_local_unknown_model_reports_status() {
        let catalog = ModelCatalog::with_entries(HashMap::new(), "/models");
        let err = catalog.ensure_local("ghost").await.unwrap_err();
        assert!(err.contains("not in the catalog"));
    }
}
