use daybrief::config::Config;
use daybrief::deliver::{Deliver, WebhookDelivery};
use daybrief::digest::DigestService;
use daybrief::fetch::HttpFetcher;
use daybrief::scheduler::DailyScheduler;
use daybrief::store::Store;
use daybrief::summarizer::OpenAiSummarizer;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    // Load configuration
    let config = Config::from_env()?;
    info!("Configuration loaded: {:?}", config);

    if let Some(dir) = Path::new(&config.database_url).parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)?;
        }
    }
    let store = Store::open(&config.database_url)?;
    store.init()?;

    let fetcher = Arc::new(HttpFetcher::new(&config)?);
    let summarizer = Arc::new(OpenAiSummarizer::new(&config));
    let digest = Arc::new(DigestService::new(
        store,
        summarizer,
        fetcher,
        &config,
    ));

    let delivery: Option<Arc<dyn Deliver>> = config
        .webhook_url
        .clone()
        .map(|url| Arc::new(WebhookDelivery::new(url)) as Arc<dyn Deliver>);
    if delivery.is_none() {
        info!("WEBHOOK_URL not set, summaries will be cached but not delivered");
    }

    let scheduler = Arc::new(DailyScheduler::new(digest, delivery, &config)?);
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let jobs = scheduler.start(shutdown_rx);

    info!("daybrief running, press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;

    info!("Shutting down, letting in-flight jobs finish");
    let _ = shutdown_tx.send(true);
    for job in jobs {
        let _ = job.await;
    }
    Ok(())
}
