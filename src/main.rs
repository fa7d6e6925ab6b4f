use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use projects_nlq::db::MemoryDataSource;
use projects_nlq::disambiguation::annotate;
use projects_nlq::resolver::{EntityKind, Resolution};
use projects_nlq::{init_tracing, ContextChain, EngineConfig, QueryEngine, QueryRequest, QueryResponse};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "projects-nlq")]
#[command(about = "Ask natural-language questions about the projects dataset")]
struct Args {
    /// JSON config file (overrides NLQ_CONFIG)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Serve rows from a JSON fixture instead of Postgres
    #[arg(short, long)]
    fixture: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Answer a question; further questions follow up on the same chain
    Ask {
        question: String,
        /// Follow-up questions asked in order after the first one
        #[arg(long = "then")]
        follow_ups: Vec<String>,
        /// Column to pick for an ambiguous term, as TERM=COLUMN
        #[arg(long = "choose")]
        choices: Vec<String>,
    },
    /// Run one term through the resolution cascade
    Resolve {
        term: String,
        #[arg(long, value_enum, default_value = "entity")]
        kind: KindArg,
    },
    /// Reload the column value index and print what changed
    Refresh,
}

#[derive(Clone, Copy, ValueEnum)]
enum KindArg {
    Entity,
    Status,
    Region,
}

impl From<KindArg> for EntityKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Entity => EntityKind::Entity,
            KindArg::Status => EntityKind::Status,
            KindArg::Region => EntityKind::Region,
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    let config = match path {
        Some(path) => {
            dotenv::dotenv().ok();
            let mut config = EngineConfig::from_file(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            config.apply_env(|key| std::env::var(key).ok())?;
            config.validate()?;
            config
        }
        None => EngineConfig::load()?,
    };
    Ok(config)
}

async fn build_engine(args: &Args) -> Result<QueryEngine> {
    let config = load_config(args.config.as_deref())?;
    match &args.fixture {
        Some(path) => {
            let source = MemoryDataSource::from_json_file(path, &config.table, &config.columns)
                .with_context(|| format!("loading fixture {}", path.display()))?;
            info!("Loaded {} fixture rows from {}", source.len(), path.display());
            Ok(QueryEngine::with_llm(config, Arc::new(source)))
        }
        None => Ok(QueryEngine::connect(config).await?),
    }
}

fn apply_choices(question: &str, choices: &[String]) -> Result<String> {
    let mut annotated = question.to_string();
    for choice in choices {
        let (term, column) = choice
            .split_once('=')
            .with_context(|| format!("--choose expects TERM=COLUMN, got '{}'", choice))?;
        annotated = annotate(&annotated, column.trim(), term.trim());
    }
    Ok(annotated)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let engine = build_engine(&args).await?;

    match &args.command {
        Command::Ask {
            question,
            follow_ups,
            choices,
        } => {
            let mut chain = ContextChain::default();
            let questions = std::iter::once(question).chain(follow_ups.iter());
            for (turn, question) in questions.enumerate() {
                let question = apply_choices(question, choices)?;
                let request = if turn == 0 {
                    QueryRequest::new(question)
                } else {
                    QueryRequest::following(question, &chain)
                };
                let outcome = engine.handle_with_timeout(request).await;
                println!("{}", serde_json::to_string_pretty(&outcome.to_api_json())?);
                if let Some(next) = outcome.next_context {
                    chain = next;
                }
                if matches!(outcome.response, QueryResponse::Error { .. }) {
                    break;
                }
            }
        }
        Command::Resolve { term, kind } => match engine.resolve(term, (*kind).into()).await {
            Resolution::Resolved(entity) => println!("{}", serde_json::to_string_pretty(&entity)?),
            Resolution::Ambiguous(choice) => {
                println!("'{}' is ambiguous:", choice.term);
                for option in choice.options {
                    println!("  {:<20} {}", option.display_name, option.count);
                }
            }
            Resolution::NoMatch => {
                println!("No match for '{}'", term);
                for similar in engine.index().similar_values(term, 5) {
                    println!("  did you mean {} ({})?", similar.value, similar.column);
                }
            }
        },
        Command::Refresh => {
            let report = engine.refresh_index().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}
