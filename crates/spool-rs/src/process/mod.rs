//! Server process lifecycle: the main inference backend and the auxiliary
//! summarization model.
//!
//! Both are singleton handles — zero-or-one live child each, guarded by a
//! mutex so concurrent start/stop calls serialize instead of racing. The
//! layer reports status strings ("already running", "stopped", "failed to
//! launch ...") rather than raising: process facts are answers, and callers
//! check them.
//!
//! - [`server`] — generic spawn / TCP-probe / stop plumbing and the
//!   [`LaunchSpec`] argument builder.
//! - [`aux`] — the lazily-started summarization backend used by the
//!   summarize compression strategy.

pub mod aux;
pub mod server;

// Re-export commonly used items at the module level.
pub use aux::{AUX_PORT, AuxiliaryModel};
pub use server::{LaunchSpec, ProcessState, ServerProcess, is_listening};
