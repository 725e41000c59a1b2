//! Context-budget enforcement: token probing and prompt compression.
//!
//! The backend can only process a bounded number of tokens per request —
//! prompt plus the budget reserved for the generation itself. This module
//! keeps composed prompts inside that bound:
//!
//! 1. **[`budget`]** — [`BudgetProbe`] asks the backend how many tokens a
//!    candidate prompt costs and what the true maximum context length is.
//!    The probe is the oracle, not an estimate; it is also a network round
//!    trip, so the compression search minimizes calls.
//!
//! 2. **[`compress`]** — [`CompressionEngine`] applies one of two strategies
//!    when a prompt is over budget: drop whole lines from the oldest content
//!    (semantics-preserving within the kept window), or fold the oldest
//!    content into short summaries produced by a small auxiliary model,
//!    keeping recent content verbatim.

pub mod budget;
pub mod compress;

// Re-export commonly used items at the module level.
pub use budget::{BudgetOracle, BudgetProbe, ProbeFuture, overage};
pub use compress::{
    CHUNK_LINES, ChunkSummarizer, Compressed, CompressionEngine, SummaryFuture,
    UnavailableSummarizer,
};
