//! CLI binary for inspecting and steering Conveyor productions.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use conveyor_graph::{ExpandKind, Expanded, GraphView, ViewConfig};
use conveyor_sync::{
    BackoffPolicy, ChannelEvent, ChannelOptions, FeedConfig, HttpFeed, StatusChannel, StatusFeed,
    Workbench,
};
use conveyor_types::{AnswerValue, Answers, ConnectionState, PipelineSnapshot};
use tokio::sync::broadcast::error::RecvError;
use tokio_stream::StreamExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "conveyor",
    version,
    about = "Live view and controls for artifact production pipelines"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Production service URL (overrides CONVEYOR_BASE_URL)
    #[arg(long, global = true)]
    base_url: Option<String>,

    /// Bearer token for the production service (overrides CONVEYOR_API_TOKEN)
    #[arg(long, global = true)]
    token: Option<String>,

    /// View configuration file (classifier, sizing, layout)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the canonical state for one or more raw state tokens
    Classify {
        /// Raw tokens as reported by the producer
        #[arg(required = true)]
        tokens: Vec<String>,
    },

    /// Lay out a snapshot file and print the positioned graph as JSON
    Layout {
        /// Path to a pipeline snapshot (.json)
        snapshot: PathBuf,

        /// Artifact to render expanded
        #[arg(long)]
        expand: Option<String>,

        /// What the expanded artifact shows: questions, children, or document
        #[arg(long, default_value = "questions")]
        expand_type: ExpandKind,

        /// Pretty-print the JSON output
        #[arg(long)]
        pretty: bool,
    },

    /// Follow a project's pipeline and print a line per update
    Watch {
        /// Project id
        #[arg(short, long)]
        project: String,
    },

    /// Answer an open interrupt
    Answer {
        /// Project id
        #[arg(short, long)]
        project: String,

        /// Interrupt id
        #[arg(short, long)]
        interrupt: String,

        /// Answer as question=value; value is parsed as JSON, else taken as text
        #[arg(short = 'a', long = "answer", value_parser = parse_answer)]
        answers: Vec<(String, AnswerValue)>,

        /// Seconds to wait for the first snapshot
        #[arg(long, default_value = "30")]
        timeout: u64,
    },

    /// Start production of a ready artifact
    Start {
        /// Project id
        #[arg(short, long)]
        project: String,

        /// Artifact id
        #[arg(short, long)]
        artifact: String,

        /// Seconds to wait for the first snapshot
        #[arg(long, default_value = "30")]
        timeout: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .init();

    let view_config = load_view_config(cli.config.as_deref())?;
    let feed_config = feed_config(cli.base_url, cli.token);

    match cli.command {
        Commands::Classify { tokens } => {
            cmd_classify(&view_config, &tokens);
        }
        Commands::Layout {
            snapshot,
            expand,
            expand_type,
            pretty,
        } => {
            let expanded = expand.map(|id| Expanded::new(id, expand_type));
            cmd_layout(&view_config, &snapshot, expanded.as_ref(), pretty)?;
        }
        Commands::Watch { project } => {
            cmd_watch(&view_config, feed_config, &project).await?;
        }
        Commands::Answer {
            project,
            interrupt,
            answers,
            timeout,
        } => {
            let answers: Answers = answers.into_iter().collect();
            cmd_answer(&view_config, feed_config, &project, &interrupt, answers, timeout).await?;
        }
        Commands::Start {
            project,
            artifact,
            timeout,
        } => {
            cmd_start(&view_config, feed_config, &project, &artifact, timeout).await?;
        }
    }

    Ok(())
}

fn load_view_config(path: Option<&Path>) -> anyhow::Result<ViewConfig> {
    match path {
        Some(path) => Ok(ViewConfig::load(path)?),
        None => Ok(ViewConfig::default()),
    }
}

fn feed_config(base_url: Option<String>, token: Option<String>) -> FeedConfig {
    let mut config = FeedConfig::from_env();
    if let Some(url) = base_url {
        config = config.with_base_url(url);
    }
    if let Some(token) = token {
        config = config.with_api_token(token);
    }
    config
}

/// `question=value`. JSON values (`true`, `3`, `["a","b"]`, `"quoted"`) are
/// taken as typed answers; anything else is plain text.
fn parse_answer(raw: &str) -> Result<(String, AnswerValue), String> {
    let (question, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected question=value, got '{raw}'"))?;
    let question = question.trim();
    if question.is_empty() {
        return Err(format!("missing question id in '{raw}'"));
    }
    let value =
        serde_json::from_str::<AnswerValue>(value).unwrap_or_else(|_| AnswerValue::from(value));
    Ok((question.to_string(), value))
}

fn cmd_classify(config: &ViewConfig, tokens: &[String]) {
    let classifier = config.classifier();
    for token in tokens {
        println!("{token}\t{}", classifier.classify(token));
    }
}

fn cmd_layout(
    config: &ViewConfig,
    path: &Path,
    expanded: Option<&Expanded>,
    pretty: bool,
) -> anyhow::Result<()> {
    let source = std::fs::read_to_string(path)?;
    let snapshot: PipelineSnapshot = serde_json::from_str(&source)?;
    snapshot.validate()?;

    let graph = GraphView::new(config).render(&snapshot, expanded);
    tracing::debug!(
        nodes = graph.nodes.len(),
        edges = graph.edges.len(),
        layers = graph.layers.len(),
        "Laid out snapshot"
    );
    let json = if pretty {
        serde_json::to_string_pretty(&graph)?
    } else {
        serde_json::to_string(&graph)?
    };
    println!("{json}");
    Ok(())
}

async fn cmd_watch(config: &ViewConfig, feed: FeedConfig, project: &str) -> anyhow::Result<()> {
    let feed: Arc<dyn StatusFeed> = Arc::new(HttpFeed::new(feed)?);
    let mut workbench = Workbench::new(feed, config, BackoffPolicy::default());
    let channel = workbench.switch_project(project).clone();

    let mut updates = channel.updates();
    let mut events = channel.events();
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    let mut last: Option<(u64, ConnectionState)> = None;
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                println!("Stopping");
                break;
            }
            view = updates.next() => {
                let Some(view) = view else { break };
                if last == Some((view.revision, view.connection)) {
                    continue;
                }
                last = Some((view.revision, view.connection));

                let frame = workbench.render();
                let interrupts = view.snapshot.interrupts();
                println!(
                    "[rev {}] {} | {} artifacts, {} nodes, {} edges | {} open interrupt(s)",
                    frame.revision,
                    frame.connection,
                    view.snapshot.iter_all().count(),
                    frame.graph.nodes.len(),
                    frame.graph.edges.len(),
                    interrupts.len(),
                );
                for interrupt in &interrupts {
                    println!("  {} on {}", interrupt.id, interrupt.artifact_id);
                    for question in &interrupt.questions {
                        let required = if question.required { " (required)" } else { "" };
                        println!("    {}: {}{}", question.id, question.text, required);
                    }
                }
            }
            event = events.recv() => match event {
                Ok(event @ ChannelEvent::SnapshotRejected { .. })
                | Ok(event @ ChannelEvent::OverlayRolledBack { .. }) => {
                    tracing::warn!(?event, "Channel event");
                }
                Ok(event) => tracing::debug!(?event, "Channel event"),
                Err(RecvError::Lagged(missed)) => tracing::warn!(missed, "Dropped channel events"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    workbench.close();
    Ok(())
}

/// Open a channel and wait until the first snapshot has landed.
async fn synced_channel(
    config: &ViewConfig,
    feed: FeedConfig,
    project: &str,
    timeout: u64,
) -> anyhow::Result<StatusChannel> {
    let feed: Arc<dyn StatusFeed> = Arc::new(HttpFeed::new(feed)?);
    let channel = StatusChannel::open(
        project,
        feed,
        ChannelOptions {
            backoff: BackoffPolicy::default(),
            classifier: config.classifier(),
        },
    );

    let mut rx = channel.subscribe();
    let synced = tokio::time::timeout(
        Duration::from_secs(timeout),
        rx.wait_for(|v| v.last_synced.is_some()),
    )
    .await
    .map(|synced| synced.map(|_| ()));
    match synced {
        Ok(Ok(_)) => Ok(channel),
        Ok(Err(_)) => anyhow::bail!("Status channel for '{project}' closed before syncing"),
        Err(_) => {
            channel.shutdown();
            anyhow::bail!("No snapshot for '{project}' after {timeout}s")
        }
    }
}

async fn cmd_answer(
    config: &ViewConfig,
    feed: FeedConfig,
    project: &str,
    interrupt_id: &str,
    answers: Answers,
    timeout: u64,
) -> anyhow::Result<()> {
    let channel = synced_channel(config, feed, project, timeout).await?;
    let known = channel.snapshot().interrupt(interrupt_id).is_some();

    let result = channel.resolve_interrupt(interrupt_id, answers).await;
    channel.shutdown();
    result?;

    if known {
        println!("Submitted answers for {interrupt_id}");
    } else {
        println!("Interrupt {interrupt_id} is no longer open; nothing submitted");
    }
    Ok(())
}

async fn cmd_start(
    config: &ViewConfig,
    feed: FeedConfig,
    project: &str,
    artifact_id: &str,
    timeout: u64,
) -> anyhow::Result<()> {
    let channel = synced_channel(config, feed, project, timeout).await?;
    let result = channel.start_production(artifact_id).await;
    channel.shutdown();
    result?;
    println!("Requested production of {artifact_id}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn answer_values_parse_as_json_or_text() {
        assert_eq!(
            parse_answer("q1=true").unwrap(),
            ("q1".to_string(), AnswerValue::Bool(true))
        );
        assert_eq!(
            parse_answer("n=3").unwrap(),
            ("n".to_string(), AnswerValue::Number(3.0))
        );
        assert_eq!(
            parse_answer(r#"tags=["a","b"]"#).unwrap().1,
            AnswerValue::List(vec!["a".into(), "b".into()])
        );
        assert_eq!(
            parse_answer("who=engineers, mostly").unwrap().1,
            AnswerValue::Text("engineers, mostly".into())
        );
        assert_eq!(
            parse_answer("eq=a=b").unwrap(),
            ("eq".to_string(), AnswerValue::Text("a=b".into()))
        );
    }

    #[test]
    fn malformed_answers_are_rejected() {
        assert!(parse_answer("no-separator").is_err());
        assert!(parse_answer("=value").is_err());
    }

    #[test]
    fn cli_parses_layout_expansion() {
        let cli = Cli::try_parse_from([
            "conveyor",
            "layout",
            "snap.json",
            "--expand",
            "brief",
            "--expand-type",
            "document",
        ])
        .unwrap();
        match cli.command {
            Commands::Layout {
                expand, expand_type, ..
            } => {
                assert_eq!(expand.as_deref(), Some("brief"));
                assert_eq!(expand_type, ExpandKind::Document);
            }
            _ => panic!("expected layout"),
        }
    }

    #[test]
    fn flag_overrides_feed_environment() {
        let config = feed_config(Some("http://svc:9000".into()), Some("t0k".into()));
        assert_eq!(config.base_url, "http://svc:9000");
        assert_eq!(config.api_token.as_deref(), Some("t0k"));
    }
}
