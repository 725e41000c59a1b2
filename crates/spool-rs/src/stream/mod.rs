//! Poll-based delta streaming for one generation request.
//!
//! The backend only offers a blocking generate call plus a separate
//! progress-check endpoint. [`Generator`] turns that pair into a real-time
//! stream: the blocking call runs in a background task whose [`JoinHandle`]
//! is the single-writer completion future, while the calling context polls
//! the progress endpoint and emits [`StreamEvent`] deltas through a
//! callback.
//!
//! Reconciliation rules the consumer can rely on:
//!
//! - When the progress snapshot extends what was already emitted, only the
//!   new suffix is yielded.
//! - When it doesn't (format change or apparent rewind), the entire current
//!   value is yielded and the emitted text resynchronizes to it — a
//!   correction, not an append.
//! - At drain time the background task's final text is authoritative: a
//!   missing tail is flushed, and a divergent final text is re-yielded in
//!   full. Consumers must tolerate one trailing overlapping fragment; they
//!   will never see a silent strict-prefix stop without an error marker.
//!
//! A run of [`MAX_IDLE_POLLS`] polls with no progress abandons the loop —
//! the runaway guard for backends whose progress endpoint stops updating.

use crate::context::budget::BudgetOracle;
use crate::context::compress::{ChunkSummarizer, CompressionEngine, assemble};
use crate::template::ChatTemplate;
use crate::{Error, GenerationRequest, KoboldClient};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Sleep between progress polls.
pub const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Consecutive no-delta polls tolerated before the loop gives up.
pub const MAX_IDLE_POLLS: u32 = 200;

/// Bound on the final join with the background generate task.
pub const DRAIN_JOIN_TIMEOUT: Duration = Duration::from_millis(500);

/// A single event from a generation stream.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// Incremental text. Append it — or, after a rewind, replace with it.
    Delta(String),
    /// The prompt still exceeded the context budget after compression.
    /// Non-fatal; generation proceeds best-effort.
    BudgetNotice(String),
    /// Terminal failure, delivered after any partial deltas.
    Error(String),
    /// The stream is complete.
    Done,
}

/// Orchestrates one generation: template resolution, budget enforcement,
/// background submission, and the progress poll loop.
pub struct Generator<'a> {
    client: KoboldClient,
    oracle: &'a dyn BudgetOracle,
    summarizer: &'a dyn ChunkSummarizer,
    poll_interval: Duration,
}

impl<'a> Generator<'a> {
    pub fn new(
        client: KoboldClient,
        oracle: &'a dyn BudgetOracle,
        summarizer: &'a dyn ChunkSummarizer,
    ) -> Self {
        Self {
            client,
            oracle,
            summarizer,
            poll_interval: POLL_INTERVAL,
        }
    }

    /// Override the poll cadence (tests, slow links).
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Run a generation and collect the full event stream.
    pub async fn stream(&self, req: &GenerationRequest) -> Result<Vec<StreamEvent>, Error> {
        self.stream_live(req, |_| {}).await
    }

    /// Run a generation, invoking `on_event` for each event as it is
    /// discovered. The full event list is also returned.
    ///
    /// Errors before any delta has been produced (unreachable counting
    /// endpoint, failed summarization) return `Err`; errors after streaming
    /// has begun arrive as a trailing [`StreamEvent::Error`] so partial
    /// output is never discarded.
    pub async fn stream_live(
        &self,
        req: &GenerationRequest,
        mut on_event: impl FnMut(&StreamEvent),
    ) -> Result<Vec<StreamEvent>, Error> {
        // Template resolution: honor the override, otherwise route on the
        // backend's reported model name.
        let template = match req.template {
            Some(template) => template,
            None => match self.client.model_name().await {
                Ok(name) => {
                    let template = ChatTemplate::for_model_name(&name);
                    debug!("model {name:?} -> template {}", template.name());
                    template
                }
                Err(e) => {
                    warn!("model name lookup failed, using default template: {e}");
                    ChatTemplate::ChatMl
                }
            },
        };

        // Budget gate. Over-budget-after-compression is a notice, not an
        // abort.
        let engine = CompressionEngine::new(self.oracle, self.summarizer);
        let compressed = engine
            .compress(req.mode, &req.header, &req.body, &template, req.reserve)
            .await?;

        let mut events: Vec<StreamEvent> = Vec::new();
        if !compressed.fits {
            warn!("prompt still over budget after compression, proceeding anyway");
            let ev = StreamEvent::BudgetNotice(
                "prompt still exceeds the context budget after compression; \
                 the oldest context may be lost"
                    .to_string(),
            );
            on_event(&ev);
            events.push(ev);
        }

        // Submit in the background; the handle is the only place the final
        // text or error is ever written.
        let prompt = assemble(&template, &req.header, &compressed.body);
        let payload = req.sampling.to_payload(&prompt);
        let submit_client = self.client.clone();
        let mut handle: JoinHandle<Result<String, Error>> =
            tokio::spawn(async move { submit_client.generate(&payload).await });

        // Poll for progress until the background task completes or the
        // idle guard trips.
        let mut emitted = String::new();
        let mut idle: u32 = 0;
        while !handle.is_finished() {
            match self.client.check_progress().await {
                Ok(current) => match advance(&mut emitted, current) {
                    Some(delta) => {
                        idle = 0;
                        let ev = StreamEvent::Delta(delta);
                        on_event(&ev);
                        events.push(ev);
                    }
                    None => {
                        idle += 1;
                        if idle >= MAX_IDLE_POLLS {
                            warn!(
                                "no progress for {MAX_IDLE_POLLS} polls, abandoning the poll loop"
                            );
                            break;
                        }
                    }
                },
                // Transient: a missing or flaky check endpoint must not
                // kill the stream while the generate call is still running.
                Err(e) => trace!("progress poll failed: {e}"),
            }
            tokio::time::sleep(self.poll_interval).await;
        }

        // Drain: the background task's result is authoritative.
        match tokio::time::timeout(DRAIN_JOIN_TIMEOUT, &mut handle).await {
            Err(_) => {
                warn!("generate task still running at drain time, aborting it");
                handle.abort();
            }
            Ok(Err(join_err)) => {
                let ev = StreamEvent::Error(format!("generate task failed: {join_err}"));
                on_event(&ev);
                events.push(ev);
            }
            Ok(Ok(Err(e))) => {
                let ev = StreamEvent::Error(e.to_string());
                on_event(&ev);
                events.push(ev);
            }
            Ok(Ok(Ok(final_text))) => {
                if let Some(tail) = final_flush(&emitted, &final_text) {
                    let ev = StreamEvent::Delta(tail);
                    on_event(&ev);
                    events.push(ev);
                }
            }
        }

        let ev = StreamEvent::Done;
        on_event(&ev);
        events.push(ev);
        debug!("stream completed with {} events", events.len());
        Ok(events)
    }

    /// Best-effort cancellation; advisory only. The poll loop ends on its
    /// own terms — stop consuming the stream to stop the generation's
    /// effects.
    pub async fn abort(&self) {
        self.client.abort().await;
    }
}

/// Reconcile a progress snapshot against the text already emitted.
///
/// Extension yields only the new suffix; anything else yields the whole
/// snapshot and resynchronizes. An empty or unchanged snapshot yields
/// nothing and leaves `emitted` alone.
fn advance(emitted: &mut String, current: String) -> Option<String> {
    let delta = match current.strip_prefix(emitted.as_str()) {
        Some(suffix) => suffix.to_string(),
        None => current.clone(),
    };
    if delta.is_empty() {
        return None;
    }
    *emitted = current;
    Some(delta)
}

/// The corrective fragment owed at drain time, if any: the missing tail
/// when the final text extends `emitted`, the entire final text when it
/// diverges, nothing when it matches or is empty.
fn final_flush(emitted: &str, final_text: &str) -> Option<String> {
    match final_text.strip_prefix(emitted) {
        Some(tail) if tail.is_empty() => None,
        Some(tail) => Some(tail.to_string()),
        None if final_text.is_empty() => None,
        None => Some(final_text.to_string()),
    }
}

/// Assemble a complete text from a stream's delta events.
pub fn collect_text(events: &[StreamEvent]) -> String {
    let mut text = String::new();
    for event in events {
        if let StreamEvent::Delta(delta) = event {
            text.push_str(delta);
        }
    }
    text
}
