use std::path::{Path, PathBuf};

use anyhow::bail;
use clap::{Parser, Subcommand};
use queryreplay::{
    canonical::{self, QueryValue},
    client::Client,
    config::Config,
    digest::{Operation, compute_digest},
    layout, logging,
    mock::MockClient,
    model::{self, Schema},
    storage::{RecordedEntry, RecordingStore, VerifyReport},
};
use serde_json::Value;

#[derive(Debug, Parser)]
#[command(name = "queryreplay")]
struct Cli {
    /// Optional path to config TOML.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Recording directory. Falls back to MONGO_RECORD_REPLAY_PATH, then the config file.
    #[arg(long, global = true)]
    path: Option<PathBuf>,
    /// Override log level (trace, debug, info, warn, error, off).
    #[arg(long, global = true)]
    log_level: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand, Clone, PartialEq, Eq)]
enum Command {
    /// List recorded queries.
    List,
    /// Print the digest and result file path a query would be recorded under.
    Digest {
        #[arg(long)]
        op: Operation,
        #[arg(long)]
        model: String,
        /// Query argument as JSON; strings of the form "__REGEXP /source/flags" are regexes.
        #[arg(long)]
        query: String,
    },
    /// Print one recorded entry.
    Show { digest: String },
    /// Replay a call from recordings and print its result.
    Replay {
        #[arg(long)]
        op: Operation,
        #[arg(long)]
        model: String,
        /// Call arguments as a JSON array.
        #[arg(long)]
        args: String,
    },
    /// Check every indexed entry against its result file.
    Verify,
}

#[derive(Debug, PartialEq)]
enum CommandOutcome {
    Listed(Vec<RecordedEntry>),
    Digest { digest: String, path: PathBuf },
    Shown(RecordedEntry),
    Replayed(Vec<Value>),
    Verified(VerifyReport),
}

fn parse_call_args(args: &str) -> anyhow::Result<Vec<QueryValue>> {
    match canonical::from_str(args)? {
        QueryValue::Array(args) => Ok(args),
        other => bail!(
            "call arguments must be a JSON array, got {}",
            canonical::to_string(&other)
        ),
    }
}

async fn run_command(root: &Path, command: Command) -> anyhow::Result<CommandOutcome> {
    let store = RecordingStore::new(root);

    match command {
        Command::List => {
            let index = store.load_index().await?;
            Ok(CommandOutcome::Listed(index.into_values().collect()))
        }
        Command::Digest { op, model, query } => {
            let query = canonical::from_str(&query)?;
            let digest = compute_digest(op, &model, &query);
            let path = store.entry_path(&digest);
            Ok(CommandOutcome::Digest { digest, path })
        }
        Command::Show { digest } => {
            layout::validate_digest(&digest)?;
            let mut index = store.load_index().await?;
            match index.remove(&digest) {
                Some(entry) => Ok(CommandOutcome::Shown(entry)),
                None => bail!("no recording with digest `{digest}` in {}", root.display()),
            }
        }
        Command::Replay { op, model, args } => {
            let args = parse_call_args(&args)?;
            let client = MockClient::new(store);
            let model = client.model(&model, Some(Schema::new(Value::Object(Default::default()))))?;
            let docs = model::invoke(model.as_ref(), op, args).await?;
            Ok(CommandOutcome::Replayed(docs))
        }
        Command::Verify => {
            let report = tokio::task::spawn_blocking(move || store.verify_blocking()).await??;
            Ok(CommandOutcome::Verified(report))
        }
    }
}

fn print_outcome(outcome: &CommandOutcome) -> anyhow::Result<()> {
    match outcome {
        CommandOutcome::Listed(entries) => {
            for entry in entries {
                println!("{}  {:<9} {}", entry.digest, entry.op, entry.name);
            }
        }
        CommandOutcome::Digest { digest, path } => {
            println!("{digest}");
            println!("{}", path.display());
        }
        CommandOutcome::Shown(entry) => println!("{}", serde_json::to_string_pretty(entry)?),
        CommandOutcome::Replayed(docs) => println!("{}", serde_json::to_string_pretty(docs)?),
        CommandOutcome::Verified(report) => {
            for issue in &report.issues {
                println!("{}  {}", issue.digest, issue.problem);
            }
            println!(
                "checked {} entries, {} issue(s)",
                report.entries_checked,
                report.issues.len()
            );
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = Config::load(cli.config.as_deref())?;
    logging::init(&config, cli.log_level.as_deref())?;
    let recording = config.recording_config(cli.path.as_deref(), None)?;

    let outcome = run_command(&recording.path, cli.command).await?;
    print_outcome(&outcome)?;

    if let CommandOutcome::Verified(report) = &outcome
        && !report.is_clean()
    {
        bail!(
            "{} recording(s) in {} failed verification",
            report.issues.len(),
            recording.path.display()
        );
    }

    Ok(())
}
