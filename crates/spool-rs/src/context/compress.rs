//! Two interchangeable strategies for bringing an over-budget prompt back
//! under the context limit.
//!
//! Both strategies treat the document body as an ordered sequence of
//! line-sentences and never reorder it. **Simple** drops sentences from the
//! front until the suffix fits — cheap, and semantics-preserving within the
//! kept window. **Summarize** folds the oldest sentences, twenty lines at a
//! time, into short summaries produced by a small auxiliary model while the
//! not-yet-processed tail stays verbatim — denser, at the cost of fidelity
//! in the oldest content. Either way recent text survives untouched, which
//! is what a continuation prompt cares about most.

use crate::context::budget::BudgetOracle;
use crate::template::ChatTemplate;
use crate::{CompressionMode, Error};
use std::future::Future;
use std::pin::Pin;
use tracing::{debug, trace, warn};

/// Lines per summarization chunk.
pub const CHUNK_LINES: usize = 20;

/// Fixed instruction sent to the auxiliary model for each chunk.
pub const SUMMARIZE_INSTRUCTION: &str =
    "Summarize the following text in at most three sentences.";

/// Boxed future returned by [`ChunkSummarizer::summarize`].
pub type SummaryFuture<'a> = Pin<Box<dyn Future<Output = Result<String, Error>> + Send + 'a>>;

/// The auxiliary-model seam: turn one chunk of document text into a short
/// summary. [`AuxiliaryModel`](crate::process::AuxiliaryModel) is the real
/// implementation; tests substitute a deterministic one.
pub trait ChunkSummarizer: Send + Sync {
    fn summarize<'a>(&'a self, text: &'a str) -> SummaryFuture<'a>;
}

/// Summarizer stand-in for configurations without an auxiliary model.
///
/// Every call reports [`Error::AuxiliaryUnavailable`], so selecting the
/// summarize strategy without wiring a model fails loudly instead of
/// quietly skipping compression.
pub struct UnavailableSummarizer;

impl ChunkSummarizer for UnavailableSummarizer {
    fn summarize<'a>(&'a self, _text: &'a str) -> SummaryFuture<'a> {
        Box::pin(async {
            Err(Error::AuxiliaryUnavailable(
                "no auxiliary model configured".to_string(),
            ))
        })
    }
}

/// Outcome of one compression pass.
#[derive(Clone, Debug)]
pub struct Compressed {
    /// The (possibly reduced) document body.
    pub body: String,
    /// Whether the assembled prompt now fits the budget. `false` is a
    /// best-effort result — callers warn and proceed rather than abort.
    pub fits: bool,
}

/// Render the full candidate prompt for budget checks: header + body,
/// wrapped in the chat template.
pub fn assemble(template: &ChatTemplate, header: &str, body: &str) -> String {
    template.render(&format!("{header}{body}"))
}

/// Compression dispatcher over a budget oracle and a chunk summarizer.
pub struct CompressionEngine<'a> {
    oracle: &'a dyn BudgetOracle,
    summarizer: &'a dyn ChunkSummarizer,
}

impl<'a> CompressionEngine<'a> {
    pub fn new(oracle: &'a dyn BudgetOracle, summarizer: &'a dyn ChunkSummarizer) -> Self {
        Self { oracle, summarizer }
    }

    /// Reduce `body` until `template(header + body)` plus `reserve` fits the
    /// backend's context length.
    ///
    /// Fast path: a single token-count probe; an in-budget body is returned
    /// unchanged. Over budget, dispatches to the strategy named by `mode`.
    pub async fn compress(
        &self,
        mode: CompressionMode,
        header: &str,
        body: &str,
        template: &ChatTemplate,
        reserve: u32,
    ) -> Result<Compressed, Error> {
        let max_context = self.oracle.max_context().await?;
        let over = self
            .overage_of(&assemble(template, header, body), reserve, max_context)
            .await?;
        if over <= 0 {
            trace!("prompt fits with {} tokens to spare", -over);
            return Ok(Compressed {
                body: body.to_string(),
                fits: true,
            });
        }

        debug!("prompt over budget by {over} tokens, compressing ({mode})");
        match mode {
            CompressionMode::Simple => {
                self.truncate_oldest(header, body, template, reserve, max_context, over)
                    .await
            }
            CompressionMode::Summarize => {
                self.summarize_fold(header, body, template, reserve, max_context)
                    .await
            }
        }
    }

    async fn overage_of(
        &self,
        prompt: &str,
        reserve: u32,
        max_context: u64,
    ) -> Result<i64, Error> {
        let needed = self.oracle.token_count(prompt).await? as i64;
        Ok(needed - max_context as i64 + i64::from(reserve))
    }

    /// Drop sentences from the front until the remaining suffix fits.
    ///
    /// The starting cut index is a proportional estimate assuming roughly
    /// uniform token density per line — an approximation, not exact — and
    /// the linear one-sentence-at-a-time correction afterwards is what makes
    /// the result authoritative. Probe count is O(k) in the correction
    /// distance from the estimate.
    async fn truncate_oldest(
        &self,
        header: &str,
        body: &str,
        template: &ChatTemplate,
        reserve: u32,
        max_context: u64,
        over: i64,
    ) -> Result<Compressed, Error> {
        let sentences: Vec<&str> = body.lines().collect();
        if sentences.is_empty() {
            // Nothing to drop; the header alone is over budget.
            warn!("over budget by {over} tokens with an empty body");
            return Ok(Compressed {
                body: String::new(),
                fits: false,
            });
        }

        let body_tokens = self.oracle.token_count(body).await?.max(1) as i64;
        let estimate = (sentences.len() as i64 * over) / body_tokens;
        let mut cut = estimate.clamp(0, sentences.len() as i64) as usize;
        trace!(
            "initial cut estimate: {cut} of {} sentences (overage {over} / {body_tokens} body tokens)",
            sentences.len()
        );

        loop {
            let suffix = sentences[cut..].join("\n");
            let remaining = self
                .overage_of(&assemble(template, header, &suffix), reserve, max_context)
                .await?;
            if remaining <= 0 {
                debug!(
                    "truncated {cut} of {} sentences, {} tokens to spare",
                    sentences.len(),
                    -remaining
                );
                return Ok(Compressed {
                    body: suffix,
                    fits: true,
                });
            }
            if cut == sentences.len() {
                warn!("still over budget by {remaining} tokens after dropping every sentence");
                return Ok(Compressed {
                    body: suffix,
                    fits: false,
                });
            }
            cut += 1;
        }
    }

    /// Fold the oldest chunks into summaries until the assembly fits.
    ///
    /// Chunks are processed strictly in order; after each one the candidate
    /// is re-assembled as summarized-prefix + verbatim-tail and re-probed,
    /// so the loop stops at the first chunk whose summary is enough. At most
    /// one summarizer call and one probe per chunk.
    async fn summarize_fold(
        &self,
        header: &str,
        body: &str,
        template: &ChatTemplate,
        reserve: u32,
        max_context: u64,
    ) -> Result<Compressed, Error> {
        let sentences: Vec<&str> = body.lines().collect();
        let chunks: Vec<String> = sentences
            .chunks(CHUNK_LINES)
            .map(|lines| lines.join("\n"))
            .collect();
        if chunks.is_empty() {
            warn!("over budget with an empty body; nothing to summarize");
            return Ok(Compressed {
                body: String::new(),
                fits: false,
            });
        }

        let mut summaries: Vec<String> = Vec::with_capacity(chunks.len());
        let mut folded = String::new();
        let mut remaining = 0;
        for index in 0..chunks.len() {
            let summary = self.summarizer.summarize(&chunks[index]).await?;
            trace!(
                "chunk {}/{}: {} chars folded to {}",
                index + 1,
                chunks.len(),
                chunks[index].len(),
                summary.len()
            );
            summaries.push(summary);

            folded = fold(&summaries, &chunks[index + 1..]);
            remaining = self
                .overage_of(&assemble(template, header, &folded), reserve, max_context)
                .await?;
            if remaining <= 0 {
                debug!(
                    "summarized {} of {} chunks, {} tokens to spare",
                    index + 1,
                    chunks.len(),
                    -remaining
                );
                return Ok(Compressed {
                    body: folded,
                    fits: true,
                });
            }
        }

        warn!("still over budget by {remaining} tokens with every chunk summarized");
        Ok(Compressed {
            body: folded,
            fits: false,
        })
    }
}

/// Assemble the summarized prefix and the untouched raw tail, in order.
fn fold(summaries: &[String], raw_tail: &[String]) -> String {
    let mut parts: Vec<&str> = summaries.iter().map(|s| s.as_str()).collect();
    parts.extend(raw_tail.iter().map(|s| s.as_str()));
    parts.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::budget::ProbeFuture;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// One token per whitespace-separated word, fixed limit, counted calls.
    struct WordOracle {
        max: u64,
        probes: AtomicU32,
    }

    impl WordOracle {
        fn new(max: u64) -> Self {
            Self {
                max,
                probes: AtomicU32::new(0),
            }
        }

        fn probe_count(&self) -> u32 {
            self.probes.load(Ordering::SeqCst)
        }
    }

    impl BudgetOracle for WordOracle {
        fn token_count<'a>(&'a self, text: &'a str) -> ProbeFuture<'a, u64> {
            self.probes.fetch_add(1, Ordering::SeqCst);
            let n = text.split_whitespace().count() as u64;
            Box::pin(async move { Ok(n) })
        }

        fn max_context<'a>(&'a self) -> ProbeFuture<'a, u64> {
            let max = self.max;
            Box::pin(async move { Ok(max) })
        }
    }

    /// Summarizer that folds any chunk to one fixed word.
    struct FixedSummarizer {
        calls: AtomicU32,
    }

    impl FixedSummarizer {
        fn new() -> Self {
            Self {
                calls: AtomicU32::new(0),
            }
        }
    }

    impl ChunkSummarizer for FixedSummarizer {
        fn summarize<'a>(&'a self, _text: &'a str) -> SummaryFuture<'a> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Ok("summary".to_string()) })
        }
    }

    fn numbered_lines(n: usize) -> String {
        (0..n)
            .map(|i| format!("line{i}"))
            .collect::<Vec<_>>()
            .join("\n")
    }

    #[tokio::test]
    async fn in_budget_body_unchanged_with_one_probe() {
        let oracle = WordOracle::new(100);
        let engine = CompressionEngine::new(&oracle, &UnavailableSummarizer);
        let body = numbered_lines(5);

        let result = engine
            .compress(CompressionMode::Simple, "", &body, &ChatTemplate::Plain, 0)
            .await
            .unwrap();

        assert!(result.fits);
        assert_eq!(result.body, body);
        assert_eq!(oracle.probe_count(), 1);
    }

    #[tokio::test]
    async fn truncation_drops_exactly_enough_leading_sentences() {
        // 25 one-token sentences, a two-token header, max context 20,
        // reserve 3: at most 15 sentences may survive.
        let oracle = WordOracle::new(20);
        let engine = CompressionEngine::new(&oracle, &UnavailableSummarizer);
        let header = "head head\n";
        let body = numbered_lines(25);

        let result = engine
            .compress(
                CompressionMode::Simple,
                header,
                &body,
                &ChatTemplate::Plain,
                3,
            )
            .await
            .unwrap();

        assert!(result.fits);
        assert_eq!(result.body.lines().count(), 15);
    }

    #[tokio::test]
    async fn truncation_keeps_a_contiguous_tail() {
        let oracle = WordOracle::new(12);
        let engine = CompressionEngine::new(&oracle, &UnavailableSummarizer);
        let body = numbered_lines(30);

        let result = engine
            .compress(CompressionMode::Simple, "", &body, &ChatTemplate::Plain, 2)
            .await
            .unwrap();

        assert!(result.fits);
        let original: Vec<&str> = body.lines().collect();
        let kept = result.body.lines().count();
        let expected = original[original.len() - kept..].join("\n");
        assert_eq!(result.body, expected);
    }

    #[tokio::test]
    async fn truncation_is_idempotent() {
        let oracle = WordOracle::new(12);
        let engine = CompressionEngine::new(&oracle, &UnavailableSummarizer);
        let body = numbered_lines(30);

        let first = engine
            .compress(CompressionMode::Simple, "", &body, &ChatTemplate::Plain, 2)
            .await
            .unwrap();
        let probes_after_first = oracle.probe_count();

        let second = engine
            .compress(
                CompressionMode::Simple,
                "",
                &first.body,
                &ChatTemplate::Plain,
                2,
            )
            .await
            .unwrap();

        assert_eq!(second.body, first.body);
        // Re-compressing an in-budget body is the fast path: one probe.
        assert_eq!(oracle.probe_count(), probes_after_first + 1);
    }

    #[tokio::test]
    async fn truncation_corrects_a_low_density_estimate() {
        // Front-loaded light lines make the uniform-density estimate
        // undershoot; the linear correction must walk forward to the fit.
        let light: Vec<String> = (0..5).map(|i| format!("w{i}")).collect();
        let heavy: Vec<String> = (0..5).map(|i| format!("a{i} b c d e")).collect();
        let body = light
            .iter()
            .chain(heavy.iter())
            .cloned()
            .collect::<Vec<_>>()
            .join("\n");

        let oracle = WordOracle::new(10);
        let engine = CompressionEngine::new(&oracle, &UnavailableSummarizer);
        let result = engine
            .compress(CompressionMode::Simple, "", &body, &ChatTemplate::Plain, 0)
            .await
            .unwrap();

        assert!(result.fits);
        // 30 body tokens against a limit of 10: only the last two heavy
        // lines (5 tokens each) can survive.
        assert_eq!(result.body, "a8 b c d e\na9 b c d e");
    }

    #[tokio::test]
    async fn header_alone_over_budget_is_best_effort() {
        let oracle = WordOracle::new(2);
        let engine = CompressionEngine::new(&oracle, &UnavailableSummarizer);

        let result = engine
            .compress(
                CompressionMode::Simple,
                "far too many header words here",
                "",
                &ChatTemplate::Plain,
                0,
            )
            .await
            .unwrap();

        assert!(!result.fits);
        assert!(result.body.is_empty());
    }

    #[tokio::test]
    async fn summarize_stops_at_first_fitting_chunk() {
        // 60 one-token lines = 3 chunks. Folding the first chunk to one
        // token leaves 41, under the limit of 45.
        let summarizer = FixedSummarizer::new();
        let oracle = WordOracle::new(45);
        let engine = CompressionEngine::new(&oracle, &summarizer);
        let body = numbered_lines(60);

        let result = engine
            .compress(CompressionMode::Summarize, "", &body, &ChatTemplate::Plain, 0)
            .await
            .unwrap();

        assert!(result.fits);
        assert_eq!(summarizer.calls.load(Ordering::SeqCst), 1);
        assert!(result.body.starts_with("summary\n"));
        // The raw tail stays verbatim and in order.
        let full = numbered_lines(60);
        let tail = full.lines().skip(20).collect::<Vec<_>>().join("\n");
        assert!(result.body.ends_with(&tail));
    }

    #[tokio::test]
    async fn summarize_terminates_within_chunk_count() {
        // Even a limit nothing can satisfy stops after every chunk has been
        // summarized once.
        let summarizer = FixedSummarizer::new();
        let oracle = WordOracle::new(1);
        let engine = CompressionEngine::new(&oracle, &summarizer);
        let body = numbered_lines(60);

        let result = engine
            .compress(CompressionMode::Summarize, "", &body, &ChatTemplate::Plain, 0)
            .await
            .unwrap();

        assert!(!result.fits);
        assert_eq!(summarizer.calls.load(Ordering::SeqCst), 3);
        assert_eq!(result.body, "summary\nsummary\nsummary");
    }

    #[tokio::test]
    async fn summarize_without_auxiliary_model_fails_loudly() {
        let oracle = WordOracle::new(1);
        let engine = CompressionEngine::new(&oracle, &UnavailableSummarizer);
        let body = numbered_lines(10);

        let err = engine
            .compress(CompressionMode::Summarize, "", &body, &ChatTemplate::Plain, 0)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::AuxiliaryUnavailable(_)));
    }
}
