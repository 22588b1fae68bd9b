use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use drb_adapters::remote::{RemoteClient, RemoteConfig};
use drb_adapters::{
    FixtureSource, JaroWinklerSimilarity, KeywordRelevance, TemplateComposer, TemplateEnhancer,
};
use drb_pipeline::{build_scheduler, Collaborators, Pipeline, PipelineConfig};
use drb_storage::{FileKv, KvBackend, MemoryKv};
use drb_web::AppState;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "drb-cli")]
#[command(about = "Daily Research Brief command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run every pipeline stage once.
    Run {
        /// Regenerate today's transcript even if one already exists.
        #[arg(long)]
        override_podcast: bool,
    },
    /// Compile today's episode from already-published stories.
    Podcast {
        /// Replace today's transcript if one already exists.
        #[arg(long)]
        override_existing: bool,
    },
    /// Delete research snapshots past the retention boundary.
    Cleanup,
    /// Serve the JSON API, with scheduled runs when enabled.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let cli = Cli::parse();
    let pipeline = Arc::new(build_pipeline()?);

    match cli.command.unwrap_or(Commands::Run {
        override_podcast: false,
    }) {
        Commands::Run { override_podcast } => {
            let summary = pipeline.run_once(override_podcast).await?;
            println!(
                "run complete: run_id={} captured={} accepted={} enhanced={} published={}",
                summary.run_id,
                summary.articles_captured,
                summary.filter.accepted,
                summary.enhanced,
                summary.published
            );
        }
        Commands::Podcast { override_existing } => {
            let outcome = pipeline.run_podcast(override_existing).await?;
            println!(
                "podcast {}: created={} stories={}",
                outcome.date, outcome.created, outcome.stories_covered
            );
        }
        Commands::Cleanup => {
            let removed = pipeline.run_research_cleanup().await?;
            println!("cleanup complete: removed {removed} stale snapshots");
        }
        Commands::Serve => {
            if let Some(scheduler) = build_scheduler(pipeline.clone()).await? {
                scheduler.start().await.context("starting scheduler")?;
                info!("scheduler started");
            }
            drb_web::serve(AppState::new(pipeline), drb_web::port_from_env()).await?;
        }
    }

    Ok(())
}

fn build_pipeline() -> Result<Pipeline> {
    let config = PipelineConfig::from_env();

    let backend: Arc<dyn KvBackend> = match std::env::var("DRB_DATA_DIR") {
        Ok(dir) => Arc::new(FileKv::new(PathBuf::from(dir))),
        Err(_) => {
            warn!("DRB_DATA_DIR not set; state will not survive this process");
            Arc::new(MemoryKv::new())
        }
    };

    let collaborators = match std::env::var("DRB_SERVICE_URL") {
        Ok(base_url) => {
            let client = RemoteClient::new(RemoteConfig::new(base_url))?;
            Collaborators {
                source: Box::new(client.clone()),
                relevance: Box::new(client.clone()),
                similarity: Box::new(client.clone()),
                enhancer: Box::new(client.clone()),
                composer: Box::new(client.clone()),
                voice: Some(Box::new(client)),
            }
        }
        Err(_) => {
            let batch_path = std::env::var("DRB_FIXTURE_BATCH")
                .unwrap_or_else(|_| "fixtures/research/sample-batch.json".to_string());
            let rules_path = std::env::var("DRB_TOPIC_RULES")
                .unwrap_or_else(|_| "rules/topics.yaml".to_string());
            Collaborators {
                source: Box::new(FixtureSource::from_path(&batch_path)?),
                relevance: Box::new(KeywordRelevance::from_path(&rules_path)?),
                similarity: Box::new(JaroWinklerSimilarity::default()),
                enhancer: Box::new(TemplateEnhancer::with_topic_rules(
                    KeywordRelevance::from_path(&rules_path)?,
                )),
                composer: Box::new(TemplateComposer::new(config.show_name.clone())),
                voice: None,
            }
        }
    };

    Ok(Pipeline::new(config, backend, collaborators))
}
