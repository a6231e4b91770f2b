//! `dispute-arbiter` CLI.
//!
//! ```bash
//! # From a request file
//! dispute-arbiter --request dispute.json --pretty
//!
//! # From flags, transcript on stdin
//! cat chat.txt | dispute-arbiter \
//!     --person1-name Maya --person1-context "Feels unappreciated" \
//!     --person2-name Arjun --conversation -
//! ```
//!
//! The verdict is printed to stdout as JSON. Logs go to stderr and follow
//! `RUST_LOG`.

use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::info;

use dispute_arbiter::{ArbiterConfig, DisputeArbiter, DisputeRequest, Participant};

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML config file (defaults come from the environment)
    #[arg(long)]
    config: Option<PathBuf>,

    /// JSON request file with `person1`, `person2` and `conversation`
    #[arg(long, conflicts_with_all = ["person1_name", "person2_name"])]
    request: Option<PathBuf>,

    #[arg(long)]
    person1_name: Option<String>,

    #[arg(long, default_value = "")]
    person1_context: String,

    #[arg(long)]
    person2_name: Option<String>,

    #[arg(long, default_value = "")]
    person2_context: String,

    /// Transcript file, one message per line. `-` reads stdin.
    #[arg(long)]
    conversation: Option<PathBuf>,

    /// Directory of instruction templates (overrides ARBITER_PROMPTS_DIR)
    #[arg(long)]
    prompts_dir: Option<PathBuf>,

    /// Model name (overrides ARBITER_MODEL)
    #[arg(long)]
    model: Option<String>,

    /// Pretty-print the verdict
    #[arg(long, default_value_t = false)]
    pretty: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let mut config = match args.config.as_deref() {
        Some(path) => ArbiterConfig::from_file(path)?,
        None => ArbiterConfig::from_env(),
    };
    if let Some(dir) = args.prompts_dir.clone() {
        config.prompts_dir = Some(dir);
    }
    if let Some(model) = args.model.clone() {
        config.llm.model = model;
    }

    let request = load_request(&args)?;
    info!(
        model = %config.llm.model,
        person1 = %request.person1.name,
        person2 = %request.person2.name,
        "dispute-arbiter starting"
    );

    let arbiter = DisputeArbiter::from_config(&config).context("Failed to set up arbiter")?;
    let outcome = arbiter
        .arbitrate(&request.person1, &request.person2, &request.conversation)
        .await
        .context("Arbitration failed")?;

    let json = if args.pretty {
        serde_json::to_string_pretty(&outcome.result)?
    } else {
        serde_json::to_string(&outcome.result)?
    };
    println!("{json}");
    Ok(())
}

fn load_request(args: &Args) -> Result<DisputeRequest> {
    if let Some(path) = args.request.as_deref() {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read request file {}", path.display()))?;
        let mut request: DisputeRequest = serde_json::from_str(&raw)
            .with_context(|| format!("Invalid request JSON in {}", path.display()))?;
        if let Some(conv) = args.conversation.as_deref() {
            request.conversation = read_conversation(conv)?;
        }
        return Ok(request);
    }

    let (Some(name1), Some(name2)) = (args.person1_name.clone(), args.person2_name.clone()) else {
        bail!("either --request or both --person1-name and --person2-name are required");
    };
    let conversation = match args.conversation.as_deref() {
        Some(path) => read_conversation(path)?,
        None => String::new(),
    };

    Ok(DisputeRequest {
        person1: Participant::new(name1, args.person1_context.clone()),
        person2: Participant::new(name2, args.person2_context.clone()),
        conversation,
    })
}

fn read_conversation(path: &Path) -> Result<String> {
    if path == Path::new("-") {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("Failed to read conversation from stdin")?;
        return Ok(buf);
    }
    std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read conversation file {}", path.display()))
}
