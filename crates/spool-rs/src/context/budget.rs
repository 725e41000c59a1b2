//! Token-budget probing against the backend's counting endpoints.
//!
//! Token counts come from the server, never from a client-side tokenizer —
//! the numbers here are authoritative for the model that will actually run
//! the prompt. `overage` is the single budget question every caller asks:
//! by how many tokens does this prompt (plus the reserved generation budget)
//! exceed what the backend can take?

use crate::{Error, KoboldClient, MAX_CONTEXT_ENDPOINT, TOKEN_COUNT_ENDPOINT};
use std::future::Future;
use std::pin::Pin;
use tracing::trace;

/// Boxed future returned by [`BudgetOracle`] methods.
///
/// Type alias to keep trait signatures and implementations readable.
pub type ProbeFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, Error>> + Send + 'a>>;

/// The budget oracle: how many tokens a text costs and how many the backend
/// accepts. [`BudgetProbe`] is the real implementation; tests substitute a
/// deterministic one.
pub trait BudgetOracle: Send + Sync {
    /// Token count of `text` as the backend's tokenizer sees it.
    fn token_count<'a>(&'a self, text: &'a str) -> ProbeFuture<'a, u64>;

    /// The backend's maximum total context length. Constant for the life of
    /// a loaded model — fetch once per compression pass, not per iteration.
    fn max_context<'a>(&'a self) -> ProbeFuture<'a, u64>;
}

/// Signed overage of `text` against the oracle's limit with `reserve`
/// tokens held back for generation. Non-positive means the prompt fits.
pub async fn overage(oracle: &dyn BudgetOracle, text: &str, reserve: u32) -> Result<i64, Error> {
    let needed = oracle.token_count(text).await? as i64;
    let available = oracle.max_context().await? as i64;
    Ok(needed - available + i64::from(reserve))
}

/// Budget oracle backed by the real counting endpoints.
pub struct BudgetProbe {
    client: KoboldClient,
}

impl BudgetProbe {
    pub fn new(client: KoboldClient) -> Self {
        Self { client }
    }
}

impl BudgetOracle for BudgetProbe {
    fn token_count<'a>(&'a self, text: &'a str) -> ProbeFuture<'a, u64> {
        Box::pin(async move {
            let data = self
                .client
                .post_json(TOKEN_COUNT_ENDPOINT, &serde_json::json!({"prompt": text}))
                .await?;
            let value = data
                .get("value")
                .and_then(|v| v.as_u64())
                .ok_or_else(|| Error::ResponseShape(data.to_string()))?;
            trace!("token count: {value} for {} chars", text.len());
            Ok(value)
        })
    }

    fn max_context<'a>(&'a self) -> ProbeFuture<'a, u64> {
        Box::pin(async move {
            let data = self.client.get_json(MAX_CONTEXT_ENDPOINT).await?;
            data.get("value")
                .and_then(|v| v.as_u64())
                .ok_or_else(|| Error::ResponseShape(data.to_string()))
        })
    }
}
