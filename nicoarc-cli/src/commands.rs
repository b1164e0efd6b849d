use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use pipeline::{Orchestrator, TracingObserver};
use progress::{Report, Reporter};
use tasklog::{RedisStore, StreamStore, TaskLog};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::AppConfig;
use crate::error::Result;

pub async fn serve(config: &AppConfig) -> Result<()> {
    let store: Arc<dyn StreamStore> = Arc::new(RedisStore::connect(&config.redis.url).await?);
    let log = Arc::new(TaskLog::new(store, pipeline::TASK_SCOPE));

    let client = nicovideo::Client::new(config.client_config())?;

    let orchestrator = Arc::new(Orchestrator::new(
        log,
        client,
        Arc::new(TracingObserver),
        config.pipeline_config(),
    )?);

    let shutdown = orchestrator.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutting down");
            shutdown.cancel();
        }
    });

    info!(redis = %config.redis.url, "workers starting");
    orchestrator.run().await;

    Ok(())
}

pub async fn list(config: &AppConfig, url: &str) -> Result<()> {
    let client = nicovideo::Client::new(config.client_config())?;

    let (reporter, mut updates) = Reporter::channel(Duration::from_secs(1), 8);
    tokio::spawn(async move {
        while let Some(line) = updates.recv().await {
            eprintln!("{line}");
        }
    });

    let reporter: Arc<dyn Report> = Arc::new(reporter.with_stdin());
    let formats = client.list_formats(url, &reporter).await?;

    print!("{}", formats::render_table(&formats));

    Ok(())
}

pub async fn download(
    config: &AppConfig,
    url: &str,
    format: &str,
    output: Option<PathBuf>,
) -> Result<()> {
    let client = nicovideo::Client::new(config.client_config())?;

    let save_dir = output.unwrap_or_else(|| config.pipeline.save_dir.clone());
    tokio::fs::create_dir_all(&save_dir).await?;

    let out_path = nicovideo::save_filepath(&save_dir, url, format);

    let (reporter, mut updates) = Reporter::channel(Duration::from_secs(1), 8);
    tokio::spawn(async move {
        while let Some(line) = updates.recv().await {
            eprintln!("{line}");
        }
    });

    let token = CancellationToken::new();
    {
        let token = token.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                token.cancel();
            }
        });
    }

    let opts = nicovideo::SaveOptions {
        reporter: Arc::new(reporter.with_stdin()),
        subtitles: Vec::new(),
    };

    let saved = client
        .save_format(
            &token,
            url,
            format,
            &out_path.to_string_lossy(),
            true,
            None,
            &opts,
        )
        .await?;

    println!("{}", saved.display());

    Ok(())
}
