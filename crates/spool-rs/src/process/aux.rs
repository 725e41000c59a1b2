//! The auxiliary summarization model: a second, lightweight server process
//! on its own port, used only by the summarize compression strategy.
//!
//! Lazy by design — nothing is spawned until the first chunk needs a
//! summary, and a mode switch that stops needing it releases the process
//! eagerly via [`AuxiliaryModel::release`]. Unavailability surfaces as
//! [`Error::AuxiliaryUnavailable`] carrying the status string from the
//! process layer.

use crate::catalog::ModelCatalog;
use crate::context::compress::{ChunkSummarizer, SUMMARIZE_INSTRUCTION, SummaryFuture};
use crate::process::server::{LaunchSpec, ProcessState, ServerProcess};
use crate::template::ChatTemplate;
use crate::{Error, KoboldClient, SamplingParams};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};

/// Fixed local port the auxiliary model binds.
pub const AUX_PORT: u16 = 5006;

/// Context size for the auxiliary model. Small on purpose — it only ever
/// sees one twenty-line chunk plus the instruction.
pub const AUX_CONTEXT_SIZE: u32 = 4096;

/// GPU layers for the auxiliary model; it stays on the CPU so it never
/// competes with the main model for video memory.
pub const AUX_GPU_LAYERS: u32 = 0;

/// Generous bound on auxiliary startup (model load included).
pub const AUX_START_TIMEOUT: Duration = Duration::from_secs(120);

/// Generation length for one chunk summary.
const SUMMARY_MAX_TOKENS: u32 = 120;

/// Owns the auxiliary server process and the client that talks to it.
pub struct AuxiliaryModel {
    process: ServerProcess,
    client: KoboldClient,
    catalog: ModelCatalog,
    executable: PathBuf,
    model: String,
    sampling: SamplingParams,
    start_timeout: Duration,
}

impl AuxiliaryModel {
    /// `executable` is the server binary, `model` the catalog name of the
    /// small summarization model.
    pub fn new(
        executable: impl Into<PathBuf>,
        catalog: ModelCatalog,
        model: impl Into<String>,
    ) -> Result<Self, Error> {
        let client = KoboldClient::new(format!("http://127.0.0.1:{AUX_PORT}"))?;
        let sampling = SamplingParams::default()
            .with_temperature(0.3)
            .with_max_new_tokens(SUMMARY_MAX_TOKENS);
        Ok(Self {
            process: ServerProcess::new(),
            client,
            catalog,
            executable: executable.into(),
            model: model.into(),
            sampling,
            start_timeout: AUX_START_TIMEOUT,
        })
    }

    /// Shrink the startup bound (tests).
    pub fn with_start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout = timeout;
        self
    }

    /// Bring the process to the listening state, spawning it if needed.
    ///
    /// No-op when already listening. Otherwise this materializes the model
    /// file (bounded download when missing), spawns the server on
    /// [`AUX_PORT`], and blocks until the TCP connect probe succeeds or the
    /// startup bound elapses.
    pub async fn ensure_running(&self) -> Result<(), Error> {
        if self.process.state().await == ProcessState::Listening {
            return Ok(());
        }

        let model_path = self
            .catalog
            .ensure_local(&self.model)
            .await
            .map_err(Error::AuxiliaryUnavailable)?;
        let spec = LaunchSpec {
            executable: self.executable.clone(),
            model_path,
            port: AUX_PORT,
            gpu_layers: AUX_GPU_LAYERS,
            context_size: AUX_CONTEXT_SIZE,
        };
        let status = self.process.start(&spec).await;
        info!("auxiliary model: {status}");

        if self.process.wait_listening(self.start_timeout).await {
            Ok(())
        } else {
            // Don't leave a half-started process behind the port.
            let stop = self.process.stop().await;
            Err(Error::AuxiliaryUnavailable(format!(
                "not accepting connections on port {AUX_PORT} ({status}; {stop})"
            )))
        }
    }

    /// Tear the process down. Idempotent; returns the status string.
    pub async fn release(&self) -> String {
        let status = self.process.stop().await;
        debug!("auxiliary model released: {status}");
        status
    }
}

impl ChunkSummarizer for AuxiliaryModel {
    fn summarize<'a>(&'a self, text: &'a str) -> SummaryFuture<'a> {
        Box::pin(async move {
            self.ensure_running().await?;
            let prompt =
                ChatTemplate::ChatMl.render(&format!("{SUMMARIZE_INSTRUCTION}\n\n{text}"));
            let payload = self.sampling.to_payload(&prompt);
            let summary = self.client.generate(&payload).await?;
            Ok(summary.trim().to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn catalog_with(name: &str, dir: &std::path::Path) -> ModelCatalog {
        let mut entries = HashMap::new();
        entries.insert(
            name.to_string(),
            serde_json::from_value(serde_json::json!({
                "urls": [format!("http://127.0.0.1:1/{name}.gguf")],
            }))
            .unwrap(),
        );
        ModelCatalog::with_entries(entries, dir)
    }

    #[tokio::test]
    async fn missing_catalog_entry_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let aux =
            AuxiliaryModel::new("/no/such/koboldcpp", catalog_with("tiny", dir.path()), "ghost")
                .unwrap();
        let err = aux.ensure_running().await.unwrap_err();
        assert!(matches!(err, Error::AuxiliaryUnavailable(ref s) if s.contains("catalog")));
    }

    #[tokio::test]
    async fn failed_launch_is_unavailable_not_a_panic() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("tiny.gguf"), b"weights").unwrap();
        let aux =
            AuxiliaryModel::new("/no/such/koboldcpp", catalog_with("tiny", dir.path()), "tiny")
                .unwrap()
                .with_start_timeout(Duration::from_millis(50));

        let err = aux.ensure_running().await.unwrap_err();
        assert!(matches!(err, Error::AuxiliaryUnavailable(_)));
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let aux = AuxiliaryModel::new("/bin/true", catalog_with("tiny", dir.path()), "tiny")
            .unwrap();
        assert_eq!(aux.release().await, "not running");
        assert_eq!(aux.release().await, "not running");
    }
}
