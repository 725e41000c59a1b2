//! Stream a continuation from a KoboldCpp-compatible backend and print it.
//!
//! The document body comes from a file or stdin; instruction sections are
//! flags. Deltas stream to stdout as they are discovered.
//!
//! # Examples
//!
//! ```sh
//! # Continue a story from a file
//! spool --body-file draft.txt --instructions "Continue in the same voice."
//!
//! # Pipe the document from stdin, compressing with the auxiliary model
//! cat draft.txt | spool --stdin --compress summarize \
//!   --aux-exe ./koboldcpp --aux-model tiny-summarizer
//!
//! # Best-effort abort of a running generation
//! spool --abort
//! ```

use clap::Parser;
use spool_rs::catalog::ModelCatalog;
use spool_rs::context::{BudgetProbe, UnavailableSummarizer};
use spool_rs::process::AuxiliaryModel;
use spool_rs::prompt::PromptSections;
use spool_rs::stream::{Generator, StreamEvent};
use spool_rs::{
    CompressionMode, DEFAULT_BASE_URL, GenerationRequest, KoboldClient, SamplingParams,
};
use std::io::{self, Read, Write};
use std::process;
use tracing::debug;

/// Stream a continuation from a KoboldCpp-compatible backend.
#[derive(Parser)]
#[command(name = "spool")]
struct Cli {
    // ── Backend ────────────────────────────────────────────────
    /// Backend base URL
    #[arg(long, default_value = DEFAULT_BASE_URL)]
    base_url: String,

    /// Send a best-effort abort to the backend and exit
    #[arg(long)]
    abort: bool,

    // ── Document body ──────────────────────────────────────────
    /// Read the document body from this file
    #[arg(long)]
    body_file: Option<String>,

    /// Read the document body from stdin
    #[arg(long)]
    stdin: bool,

    // ── Prompt sections ────────────────────────────────────────
    /// Free instructions placed ahead of the story
    #[arg(long)]
    instructions: Option<String>,

    /// Story title
    #[arg(long)]
    title: Option<String>,

    /// Genre
    #[arg(long)]
    genre: Option<String>,

    /// Cast of characters
    #[arg(long)]
    characters: Option<String>,

    /// Setting / backdrop
    #[arg(long)]
    setting: Option<String>,

    /// Additional notes
    #[arg(long)]
    notes: Option<String>,

    // ── Sampling parameters ────────────────────────────────────
    /// Sampling temperature
    #[arg(long, default_value_t = 0.7)]
    temperature: f32,

    /// Top-k sampling
    #[arg(long, default_value_t = 40)]
    top_k: u32,

    /// Nucleus sampling threshold
    #[arg(long, default_value_t = 0.95)]
    top_p: f32,

    /// Repetition penalty multiplier
    #[arg(long, default_value_t = 1.1)]
    repeat_penalty: f32,

    /// Maximum tokens to generate
    #[arg(long, default_value_t = 400)]
    max_new_tokens: u32,

    // ── Context budget ─────────────────────────────────────────
    /// Compression strategy for over-budget prompts
    #[arg(long, default_value = "simple")]
    compress: CompressionMode,

    /// Tokens reserved for the generation when checking the budget
    /// (defaults to --max-new-tokens)
    #[arg(long)]
    reserve: Option<u32>,

    // ── Auxiliary model ────────────────────────────────────────
    /// Server executable for the auxiliary summarization model
    #[arg(long)]
    aux_exe: Option<String>,

    /// Catalog name of the auxiliary summarization model
    #[arg(long, default_value = "tiny-summarizer")]
    aux_model: String,

    /// Model catalog path
    #[arg(long, default_value = "models/llm.json")]
    catalog: String,

    // ── Logging ────────────────────────────────────────────────
    /// Log filter, e.g. "debug" or "spool_rs=trace"
    #[arg(long, default_value = "warn")]
    log: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Logs go to stderr so the streamed text on stdout stays clean.
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(&cli.log))
        .with_writer(io::stderr)
        .init();

    if let Err(message) = run(cli).await {
        eprintln!("error: {message}");
        process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), String> {
    let client = KoboldClient::new(&cli.base_url).map_err(|e| e.to_string())?;

    if cli.abort {
        client.abort().await;
        println!("abort sent");
        return Ok(());
    }

    let body = if let Some(path) = &cli.body_file {
        std::fs::read_to_string(path).map_err(|e| format!("cannot read {path}: {e}"))?
    } else if cli.stdin {
        let mut buffer = String::new();
        io::stdin()
            .read_to_string(&mut buffer)
            .map_err(|e| format!("cannot read stdin: {e}"))?;
        buffer
    } else {
        String::new()
    };

    let header = PromptSections::default()
        .with_instructions(cli.instructions.unwrap_or_default())
        .with_title(cli.title.unwrap_or_default())
        .with_genre(cli.genre.unwrap_or_default())
        .with_characters(cli.characters.unwrap_or_default())
        .with_setting(cli.setting.unwrap_or_default())
        .with_addendum(cli.notes.unwrap_or_default())
        .header();

    let sampling = SamplingParams {
        temperature: cli.temperature,
        top_k: cli.top_k,
        top_p: cli.top_p,
        repeat_penalty: cli.repeat_penalty,
        max_new_tokens: cli.max_new_tokens,
    };
    let reserve = cli.reserve.unwrap_or(cli.max_new_tokens);
    let req = GenerationRequest::new(header, body)
        .with_sampling(sampling)
        .with_mode(cli.compress)
        .with_reserve(reserve);

    let probe = BudgetProbe::new(client.clone());
    let no_aux = UnavailableSummarizer;

    // The auxiliary model only exists when the summarize strategy can use
    // it; simple mode runs with the loud placeholder seam.
    let aux = match (&cli.aux_exe, cli.compress) {
        (Some(exe), CompressionMode::Summarize) => Some(
            AuxiliaryModel::new(exe, ModelCatalog::load(&cli.catalog), &cli.aux_model)
                .map_err(|e| e.to_string())?,
        ),
        _ => None,
    };

    let generator = match &aux {
        Some(aux_model) => Generator::new(client.clone(), &probe, aux_model),
        None => Generator::new(client.clone(), &probe, &no_aux),
    };

    let events = generator
        .stream_live(&req, |ev| match ev {
            StreamEvent::Delta(text) => {
                print!("{text}");
                let _ = io::stdout().flush();
            }
            StreamEvent::BudgetNotice(note) => eprintln!("[notice] {note}"),
            StreamEvent::Error(message) => eprintln!("\n[error] {message}"),
            StreamEvent::Done => println!(),
        })
        .await
        .map_err(|e| e.to_string())?;

    // One-shot run: the auxiliary process has no further use, release it.
    if let Some(aux_model) = &aux {
        let status = aux_model.release().await;
        debug!("auxiliary model: {status}");
    }

    if events
        .iter()
        .any(|ev| matches!(ev, StreamEvent::Error(_)))
    {
        return Err("generation ended with an error (partial output above)".to_string());
    }
    Ok(())
}
