use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::classify::GeminiCategorizer;
use crate::cli::{Cli, Command};
use crate::config::{AppConfig, StoreBackend};
use crate::imap::ImapConnector;
use crate::notify::WebhookNotifier;
use crate::pipeline::Pipeline;
use crate::storage::{ElasticStore, IndexStore, SqliteStore};
use crate::supervisor::{Supervisor, SupervisorSettings};
use crate::sync::{SyncEngine, SyncOutcome, SyncSettings};
use crate::types::EmailDocument;

const NOTIFICATION_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn run(cli: Cli) -> Result<()> {
    let mut config = AppConfig::load().context("loading configuration")?;
    if let Some(days) = cli.backfill_days {
        config.backfill_days = days;
    }
    if let Some(store) = cli.store {
        config.store = store;
    }

    let store = open_store(&config).await?;

    match cli.command.unwrap_or(Command::Watch) {
        Command::Watch => watch(&config, store).await,
        Command::SyncOnce => sync_once(&config, store).await,
        Command::List { folder } => {
            let docs = store.list_all(config.account_id(), folder.as_deref()).await?;
            print_documents(&docs);
            Ok(())
        }
        Command::Search { query, folder } => {
            let docs = store
                .search(&query, config.account_id(), folder.as_deref())
                .await?;
            print_documents(&docs);
            Ok(())
        }
        Command::Show { id } => match store.get_by_id(&id).await? {
            Some(doc) => {
                println!("{}", serde_json::to_string_pretty(&doc)?);
                Ok(())
            }
            None => {
                warn!(id = %id, "No document with that id");
                Ok(())
            }
        },
    }
}

async fn open_store(config: &AppConfig) -> Result<Arc<dyn IndexStore>> {
    match config.store {
        StoreBackend::Elastic => {
            let store = ElasticStore::new(&config.elastic_host, &config.elastic_index)?;
            // Ingestion can start without the node; failed index calls leave
            // messages unseen for the next run.
            if let Err(e) = store.connect().await {
                warn!(host = %config.elastic_host, error = %e, "Elasticsearch unavailable at startup");
            }
            Ok(Arc::new(store))
        }
        StoreBackend::Sqlite => {
            let store = SqliteStore::new_default().await?;
            info!(path = %store.path().display(), "Using SQLite index");
            Ok(Arc::new(store))
        }
    }
}

fn build_supervisor(config: &AppConfig, store: Arc<dyn IndexStore>) -> Result<Supervisor> {
    let categorizer = GeminiCategorizer::new(
        &config.gemini_base_url,
        &config.gemini_model,
        config.gemini_api_key.clone(),
        config.classify_timeout,
    )?;
    if config.gemini_api_key.is_none() {
        warn!("GEMINI_API_KEY not set; every message will be Uncategorized");
    }
    let notifier = WebhookNotifier::new(
        config.slack_webhook_url.clone(),
        config.webhook_url.clone(),
    );

    let pipeline = Arc::new(Pipeline::new(
        store,
        Arc::new(categorizer),
        Arc::new(notifier),
        config.pipeline_concurrency,
    ));
    let engine = Arc::new(SyncEngine::new(
        SyncSettings {
            account_id: config.account_id().to_string(),
            folder: config.imap.folder.clone(),
            backfill_days: config.backfill_days,
        },
        pipeline,
    ));

    let connector = ImapConnector::new(
        &config.imap.host,
        config.imap.port,
        &config.imap.user,
        &config.imap.password,
    );

    Ok(Supervisor::new(
        Arc::new(connector),
        engine,
        SupervisorSettings {
            keepalive_interval: config.keepalive_interval,
            reconnect_delay: config.reconnect_delay,
        },
    ))
}

async fn watch(config: &AppConfig, store: Arc<dyn IndexStore>) -> Result<()> {
    let supervisor = build_supervisor(config, store)?;
    info!(
        account = %config.account_id(),
        folder = %config.imap.folder,
        backfill_days = config.backfill_days,
        "Starting mailbox watch"
    );

    tokio::select! {
        result = supervisor.run() => result.context("mail connection")?,
        _ = tokio::signal::ctrl_c() => info!("Shutdown requested"),
    }

    drain(&supervisor).await;
    Ok(())
}

async fn sync_once(config: &AppConfig, store: Arc<dyn IndexStore>) -> Result<()> {
    let supervisor = build_supervisor(config, store)?;
    match supervisor.run_once().await.context("single sync")? {
        SyncOutcome::Ran(report) => info!(
            matched = report.matched,
            ingested = report.ingested,
            failed = report.failed,
            marked_seen = report.marked_seen,
            error = ?report.error,
            "Sync complete"
        ),
        SyncOutcome::Skipped(reason) => warn!(?reason, "Sync skipped"),
    }
    drain(&supervisor).await;
    Ok(())
}

async fn drain(supervisor: &Supervisor) {
    let pipeline = supervisor.engine().pipeline();
    if tokio::time::timeout(NOTIFICATION_DRAIN_TIMEOUT, pipeline.drain_notifications())
        .await
        .is_err()
    {
        warn!("Pending notifications did not finish before shutdown");
    }
}

fn print_documents(docs: &[EmailDocument]) {
    if docs.is_empty() {
        println!("No messages found.");
        return;
    }

    for (i, doc) in docs.iter().enumerate() {
        let subject = if doc.subject.is_empty() {
            "(No Subject)"
        } else {
            doc.subject.as_str()
        };
        println!(
            "{}. [{}] [{}] {}",
            i + 1,
            doc.date.format("%Y-%m-%d %H:%M"),
            doc.ai_category,
            subject
        );
        println!("   From: {}", doc.from);
        println!("   Id: {}", doc.id);
    }
}
