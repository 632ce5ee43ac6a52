use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::TryStreamExt;
use serde::{Serialize, Serializer};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use sourcelog_kernel::adapters::memory::{MemoryEngine, MemorySourceRepository};
use sourcelog_kernel::config::{RepositoryConfig, DEFAULT_NAME};
use sourcelog_kernel::envelope::{DataType, Delta, Payload};
use sourcelog_kernel::log::{
    DeltaRecord, Id, LeaseRecord, Source, SourceRepository, StatePointer, Tag,
};
use sourcelog_kernel::provision::ProvisionGuard;
use sourcelog_kernel::query::StateQuery;
use sourcelog_kernel::stream::{
    MultipleStreamRepository, SingleStreamRepository, StreamRepositoryFactory,
};

/// Sourcelog CLI
#[derive(Parser, Debug)]
#[command(name = "sourcelog")]
#[command(about = "Append to and inspect an event-sourced journal", long_about = None)]
struct Cli {
    /// Path to the journal JSON (created when missing)
    #[arg(long, global = true, default_value = "journal.json")]
    journal: PathBuf,

    /// Path to repository config JSON
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Agent configuration name
    #[arg(long, global = true, default_value = DEFAULT_NAME)]
    agent: String,

    /// Session configuration name
    #[arg(long, global = true, default_value = DEFAULT_NAME)]
    session: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Append one delta to a stream and commit it
    Append {
        #[arg(long)]
        stream: String,

        /// Delta type name
        #[arg(long = "type")]
        data_type: String,

        /// Delta payload as JSON
        #[arg(long)]
        data: String,

        /// Deduplication key; repeated keys are skipped
        #[arg(long)]
        message_key: Option<String>,

        /// Assume the stream does not exist yet
        #[arg(long, conflicts_with = "existing")]
        new: bool,

        /// Require the stream to exist already
        #[arg(long)]
        existing: bool,
    },

    /// List entity state pointers
    Pointers {
        #[arg(long)]
        lease_scope: Option<String>,

        /// Tag filter as label=value (repeatable)
        #[arg(long = "tag", value_parser = parse_tag)]
        tags: Vec<Tag>,

        #[arg(long)]
        newest_first: bool,
    },

    /// List live leases
    Leases {
        #[arg(long)]
        scope: Option<String>,
    },

    /// List committed deltas
    Deltas {
        #[arg(long)]
        stream_id: Option<Id>,
    },
}

fn parse_tag(raw: &str) -> Result<Tag, String> {
    raw.split_once('=')
        .map(|(label, value)| Tag::new(label, value))
        .ok_or_else(|| format!("expected label=value, got `{raw}`"))
}

/// Delta given on the command line: an arbitrary JSON payload under a
/// caller supplied type name.
#[derive(Debug)]
struct RawDelta {
    data_type: DataType,
    data: serde_json::Value,
    message_key: Option<String>,
}

impl Serialize for RawDelta {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.data.serialize(serializer)
    }
}

impl Payload for RawDelta {
    fn data_type(&self) -> DataType {
        self.data_type.clone()
    }
}

impl Delta for RawDelta {
    fn message_key(&self) -> Option<String> {
        self.message_key.clone()
    }
}

#[derive(Debug, Serialize)]
struct AppendOutput {
    stream_id: Id,
    is_new: bool,
    staged: bool,
    committed: bool,
    version: u64,
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("sourcelog=info,sourcelog_kernel=info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn load_journal(path: &Path) -> Result<Vec<Source>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let data = fs::read_to_string(path)
        .with_context(|| format!("reading journal {}", path.display()))?;
    Ok(serde_json::from_str(&data)?)
}

fn save_journal(path: &Path, sources: &[Source]) -> Result<()> {
    fs::write(path, serde_json::to_string_pretty(sources)?)
        .with_context(|| format!("writing journal {}", path.display()))?;
    Ok(())
}

/// Release a read session once its records are in hand.
async fn finish<R: SourceRepository, T>(
    repo: MultipleStreamRepository<R>,
    records: Vec<T>,
) -> Result<Vec<T>> {
    repo.dispose().await?;
    Ok(records)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    // ----------------------------
    // Load config and journal
    // ----------------------------
    let config = match &cli.config {
        Some(path) => RepositoryConfig::load(path)?,
        None => RepositoryConfig::default_config(),
    };

    let sources = load_journal(&cli.journal)?;
    tracing::debug!(sources = sources.len(), journal = %cli.journal.display(), "journal loaded");
    let engine = MemoryEngine::from_sources(sources)?;
    let factory =
        StreamRepositoryFactory::new(engine.clone(), config, Arc::new(ProvisionGuard::new()));

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        }
    });

    match cli.command {
        Command::Append {
            stream,
            data_type,
            data,
            message_key,
            new,
            existing,
        } => {
            let delta = RawDelta {
                data_type: DataType::rust(data_type),
                data: serde_json::from_str(&data).context("--data is not valid JSON")?,
                message_key,
            };

            let mut single: SingleStreamRepository<MemorySourceRepository> = if new {
                factory
                    .create_single_for_new(&cli.agent, &cli.session, &stream, &cancel)
                    .await?
            } else if existing {
                factory
                    .create_single_for_existing(&cli.agent, &cli.session, &stream, &cancel)
                    .await?
            } else {
                factory
                    .create_single(&cli.agent, &cli.session, &stream, &cancel)
                    .await?
            };

            let staged = if delta.message_key.is_some() {
                single.append_keyed(&delta, &cancel).await?
            } else {
                single.append(&delta)?;
                true
            };
            let committed = single.commit(&cancel).await?;
            if !committed {
                tracing::warn!(%stream, "commit rejected, journal left unchanged");
            }

            let output = AppendOutput {
                stream_id: single.stream().id(),
                is_new: single.is_new(),
                staged,
                committed,
                version: single.stream().version().0,
            };
            single.dispose().await?;

            if committed {
                save_journal(&cli.journal, &engine.sources().await)?;
            }
            print_json(&output)?;
        }

        Command::Pointers {
            lease_scope,
            tags,
            newest_first,
        } => {
            let repo = factory.create_multiple(&cli.agent, &cli.session).await?;
            let mut query = StateQuery::new();
            if let Some(scope) = lease_scope {
                query = query.lease_scope(scope);
            }
            for tag in tags {
                query = query.tag(tag);
            }

            let pointers: Vec<StatePointer> = if newest_first {
                repo.repository()
                    .enumerate_state_pointers(&query.reversed(), &cancel)
                    .try_collect()
                    .await?
            } else {
                repo.repository()
                    .enumerate_state_pointers(&query, &cancel)
                    .try_collect()
                    .await?
            };
            print_json(&finish(repo, pointers).await?)?;
        }

        Command::Leases { scope } => {
            let repo = factory.create_multiple(&cli.agent, &cli.session).await?;
            let mut query = StateQuery::new();
            if let Some(scope) = scope {
                query = query.lease_scope(scope);
            }

            let leases: Vec<LeaseRecord> = repo
                .repository()
                .enumerate_leases(&query, &cancel)
                .try_collect()
                .await?;
            print_json(&finish(repo, leases).await?)?;
        }

        Command::Deltas { stream_id } => {
            let repo = factory.create_multiple(&cli.agent, &cli.session).await?;
            let mut query = StateQuery::new();
            if let Some(id) = stream_id {
                query = query.state_id(id);
            }

            let deltas: Vec<DeltaRecord> = repo
                .repository()
                .enumerate_deltas(&query, &cancel)
                .try_collect()
                .await?;
            print_json(&finish(repo, deltas).await?)?;
        }
    }

    Ok(())
}
