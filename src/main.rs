//! ocr-worker: the distributed OCR worker pool daemon (§5).
//!
//! Wires configuration, a fixed-size worker pool round-robin-distributed
//! across the configured logical environments (§9's resolved Open Question
//! on multi-environment polling), the Pool Manager's rebalance loop, and the
//! Health Monitor, then drains cooperatively on SIGINT/SIGTERM.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::Mutex;

use registre_ocr_pool::capacity::{CapacityBudget, InMemoryCapacityBackend};
use registre_ocr_pool::config::{EnvironmentConfig, Settings};
use registre_ocr_pool::error::FatalStartupError;
use registre_ocr_pool::health_monitor::HealthMonitor;
use registre_ocr_pool::job_monitor::JobMonitor;
use registre_ocr_pool::logging;
use registre_ocr_pool::models::{DocumentSource, Worker, WorkerMode};
use registre_ocr_pool::pipeline::acte::{ActePipeline, ActeProviderHandle, ActePrompts, TextProviderHandle};
use registre_ocr_pool::pipeline::index::{IndexPipeline, IndexProviderHandle, IndexPrompts};
use registre_ocr_pool::pool_manager::{resolve_initial_mode, PoolManager};
use registre_ocr_pool::providers::file_api::HttpFileApiClient;
use registre_ocr_pool::providers::processor::StageBudgets;
use registre_ocr_pool::providers::vision::HttpVisionClient;
use registre_ocr_pool::providers::{CallOptions, FileApiProvider, Provider, VisionProvider};
use registre_ocr_pool::rate_limit::{InMemoryRateLimitBackend, RateBudget};
use registre_ocr_pool::repository;
use registre_ocr_pool::storage::{FsObjectStorage, HttpObjectStorage, ObjectStorage};

/// Worker pool daemon for the Quebec land-registry OCR queue.
#[derive(Parser)]
#[command(name = "ocr-worker")]
#[command(about = "Distributed OCR worker pool for Quebec land-registry PDFs")]
#[command(version)]
struct Cli {
    /// Path to a TOML settings file; layered defaults apply if omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the data directory (sqlite file, logs) from settings.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Enable verbose (debug-level) logging.
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// Check for `-v`/`--verbose` before clap has parsed anything, so logging
/// can be initialized ahead of argument-validation errors.
fn is_verbose() -> bool {
    std::env::args().any(|arg| arg == "-v" || arg == "--verbose")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let mut settings = Settings::load(cli.config.as_deref())?;
    if let Some(data_dir) = cli.data_dir {
        settings.data_dir = data_dir;
    }
    settings.ensure_directories()?;

    let _guard = logging::init(cli.verbose || is_verbose(), Some(&settings.data_dir));
    tracing::info!(
        data_dir = %settings.data_dir.display(),
        pool_size = settings.pool.pool_size,
        "starting ocr-worker"
    );

    let rate_backend = build_rate_limit_backend(&settings).await?;
    let capacity_backend = build_capacity_backend(&settings).await?;
    let rate_limits: HashMap<String, (u32, u32)> =
        settings.rate_limits.iter().map(|(k, v)| (k.clone(), (v.rpm_max, v.tpm_max))).collect();
    let rate_budget = RateBudget::new(rate_backend, rate_limits);
    let capacity_budget = CapacityBudget::new(capacity_backend, settings.capacity.clone());

    let storage = build_storage(&settings);
    let extract_budgets = StageBudgets {
        attempt_budget: settings.pipeline.extraction_attempt_budget,
        continuation_budget: settings.pipeline.continuation_retry_budget,
    };
    let boost_budgets = StageBudgets {
        attempt_budget: settings.pipeline.boost_attempt_budget,
        continuation_budget: settings.pipeline.continuation_retry_budget,
    };
    let index_pipeline = Arc::new(build_index_pipeline(&settings, storage.clone(), extract_budgets, boost_budgets, rate_budget.clone())?);
    let acte_pipeline = Arc::new(build_acte_pipeline(&settings, storage, extract_budgets, boost_budgets, rate_budget.clone())?);

    let environments = if settings.environments.is_empty() {
        vec![EnvironmentConfig { name: "default".to_string(), database_url: None }]
    } else {
        settings.environments.clone()
    };

    let mut conns = Vec::new();
    for env in &environments {
        let db_path = database_path(&settings, env)?;
        repository::run_migrations(&db_path)
            .map_err(|e| FatalStartupError::Database(format!("migrating {}: {e}", db_path.display())))?;
        let conn = repository::connect(&db_path)
            .map_err(|e| FatalStartupError::Database(format!("connecting to {}: {e}", db_path.display())))?;
        conns.push((env.name.clone(), Arc::new(Mutex::new(conn))));
    }

    let pool_manager = Arc::new(PoolManager::new(settings.pool.clone()));
    let allocation = pool_manager.initial_allocation();
    let mut remaining_index = allocation.index;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let mut tasks = Vec::new();

    for slot in 0..settings.pool.pool_size {
        let (env_name, conn) = &conns[slot as usize % conns.len()];
        let worker_id = format!("{env_name}-{slot}");

        let default_mode = if remaining_index > 0 {
            remaining_index -= 1;
            WorkerMode::Index
        } else {
            WorkerMode::Acte
        };
        let mode = {
            let c = conn.lock().await;
            resolve_initial_mode(&c, &worker_id, default_mode)
        };
        pool_manager.assign_mode(&worker_id, mode).await;

        let worker = Worker { worker_id, mode, temp_dir: std::env::temp_dir() };
        let monitor = JobMonitor::new(
            worker,
            conn.clone(),
            pool_manager.clone(),
            rate_budget.clone(),
            capacity_budget.clone(),
            index_pipeline.clone(),
            acte_pipeline.clone(),
            Duration::from_millis(settings.pool.poll_interval_ms),
            Duration::from_millis(settings.pool.idle_close_ms),
        );
        let rx = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move { monitor.run(rx).await }));
    }

    for (env_name, conn) in &conns {
        let monitor = HealthMonitor::new(conn.clone(), settings.health.clone());
        let rx = shutdown_rx.clone();
        let env_name = env_name.clone();
        tasks.push(tokio::spawn(async move {
            tracing::info!(environment = %env_name, "health monitor started");
            monitor.run(rx).await
        }));
    }

    tasks.push(spawn_rebalance_task(pool_manager.clone(), conns.clone(), settings.pool.rebalance_interval_ms, shutdown_rx.clone()));

    wait_for_shutdown_signal().await;
    tracing::info!("shutdown signal received, draining workers");
    let _ = shutdown_tx.send(true);

    for task in tasks {
        let _ = task.await;
    }
    tracing::info!("ocr-worker shut down cleanly");
    Ok(())
}

/// §5 ambient addition: cooperative drain on SIGINT or SIGTERM.
async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// §4.3 `rebalance`: periodically compare pending-job counts per class
/// across every configured environment and shift a flex worker if one class
/// is under sustained pressure.
fn spawn_rebalance_task(
    pool_manager: Arc<PoolManager>,
    conns: Vec<(String, Arc<Mutex<rusqlite::Connection>>)>,
    interval_ms: u64,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let interval = Duration::from_millis(interval_ms);
        while !*shutdown.borrow() {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => break,
            }

            let mut pending_index = 0u64;
            let mut pending_acte = 0u64;
            for (_, conn) in &conns {
                let c = conn.lock().await;
                pending_index += repository::queue::count_pending(&c, DocumentSource::Index).unwrap_or(0);
                pending_acte += repository::queue::count_pending(&c, DocumentSource::Acte).unwrap_or(0);
            }

            if let Some((worker_id, mode)) = pool_manager.rebalance(pending_index, pending_acte).await {
                tracing::info!(worker_id = %worker_id, new_mode = ?mode, pending_index, pending_acte, "rebalanced worker mode");
            }
        }
    })
}

async fn build_rate_limit_backend(
    settings: &Settings,
) -> Result<Arc<dyn registre_ocr_pool::rate_limit::RateLimitBackend>, FatalStartupError> {
    #[cfg(feature = "redis-backend")]
    if let Some(url) = &settings.rate_limit_backend {
        let backend = registre_ocr_pool::rate_limit::RedisRateLimitBackend::new(url)
            .await
            .map_err(|e| FatalStartupError::KvStore(e.to_string()))?;
        return Ok(Arc::new(backend));
    }
    let _ = settings;
    Ok(Arc::new(InMemoryRateLimitBackend::new()))
}

async fn build_capacity_backend(
    settings: &Settings,
) -> Result<Arc<dyn registre_ocr_pool::capacity::CapacityBackend>, FatalStartupError> {
    #[cfg(feature = "redis-backend")]
    if let Some(url) = &settings.rate_limit_backend {
        let backend = registre_ocr_pool::capacity::RedisCapacityBackend::new(url)
            .await
            .map_err(|e| FatalStartupError::KvStore(e.to_string()))?;
        return Ok(Arc::new(backend));
    }
    let _ = settings;
    Ok(Arc::new(InMemoryCapacityBackend::new()))
}

fn build_storage(settings: &Settings) -> Arc<dyn ObjectStorage> {
    match &settings.object_storage_base_url {
        Some(url) => Arc::new(HttpObjectStorage::new(url.clone())),
        None => Arc::new(FsObjectStorage::new(settings.data_dir.clone())),
    }
}

fn database_path(settings: &Settings, env: &EnvironmentConfig) -> Result<PathBuf, FatalStartupError> {
    let url = settings.database_url(env);
    url.strip_prefix("sqlite:")
        .map(PathBuf::from)
        .ok_or_else(|| FatalStartupError::Config(format!("unsupported database URL scheme: {url}")))
}

fn call_options(provider: &registre_ocr_pool::config::ProviderConfig) -> Result<CallOptions, FatalStartupError> {
    Ok(CallOptions {
        model: provider.model_name.clone(),
        temperature: provider.temperature,
        max_output_tokens: provider.max_output_tokens()?,
    })
}

fn build_index_pipeline(
    settings: &Settings,
    storage: Arc<dyn ObjectStorage>,
    extract_budgets: StageBudgets,
    boost_budgets: StageBudgets,
    rate_budget: RateBudget,
) -> Result<IndexPipeline, FatalStartupError> {
    let timeout = Duration::from_secs(settings.pipeline.provider_timeout_secs);
    let mut providers = Vec::new();
    for name in &settings.provider_order {
        let config = settings
            .providers
            .get(name)
            .ok_or_else(|| FatalStartupError::Config(format!("provider_order names unknown provider '{name}'")))?;
        let opts = call_options(config)?;
        let client: Arc<dyn VisionProvider> = Arc::new(
            HttpVisionClient::new(name.clone(), config.clone(), timeout)
                .map_err(|e| FatalStartupError::Config(e.to_string()))?,
        );
        providers.push(IndexProviderHandle { name: name.clone(), client, opts });
    }
    if providers.is_empty() {
        return Err(FatalStartupError::Config("no providers configured".to_string()));
    }

    Ok(IndexPipeline::new(
        storage,
        providers,
        settings.pipeline.pdf_dpi,
        extract_budgets,
        boost_budgets,
        IndexPrompts {
            extract: settings.prompts.index_extract.clone(),
            extract_continuation: settings.prompts.index_extract_continuation.clone(),
            boost: settings.prompts.index_boost.clone(),
            boost_continuation: settings.prompts.index_boost_continuation.clone(),
        },
        rate_budget,
    ))
}

fn build_acte_pipeline(
    settings: &Settings,
    storage: Arc<dyn ObjectStorage>,
    extract_budgets: StageBudgets,
    boost_budgets: StageBudgets,
    rate_budget: RateBudget,
) -> Result<ActePipeline, FatalStartupError> {
    let timeout = Duration::from_secs(settings.pipeline.provider_timeout_secs);
    let mut file_providers = Vec::new();
    let mut boost_providers = Vec::new();

    for name in &settings.provider_order {
        let config = settings
            .providers
            .get(name)
            .ok_or_else(|| FatalStartupError::Config(format!("provider_order names unknown provider '{name}'")))?;
        let opts = call_options(config)?;

        let boost_client: Arc<dyn Provider> = Arc::new(
            HttpVisionClient::new(name.clone(), config.clone(), timeout)
                .map_err(|e| FatalStartupError::Config(e.to_string()))?,
        );
        boost_providers.push(TextProviderHandle { name: name.clone(), client: boost_client, opts: opts.clone() });

        if config.supports_file_api {
            let file_client: Arc<dyn FileApiProvider> = Arc::new(
                HttpFileApiClient::new(name.clone(), config.clone(), timeout)
                    .map_err(|e| FatalStartupError::Config(e.to_string()))?,
            );
            file_providers.push(ActeProviderHandle { name: name.clone(), client: file_client, opts });
        }
    }

    if file_providers.is_empty() {
        return Err(FatalStartupError::Config(
            "no provider in provider_order has supports_file_api = true".to_string(),
        ));
    }

    Ok(ActePipeline::new(
        storage,
        file_providers,
        boost_providers,
        Duration::from_secs(settings.pipeline.file_api_readiness_timeout_secs),
        extract_budgets,
        boost_budgets,
        ActePrompts {
            extract: settings.prompts.acte_extract.clone(),
            extract_continuation: settings.prompts.acte_extract_continuation.clone(),
            boost: settings.prompts.acte_boost.clone(),
            boost_continuation: settings.prompts.acte_boost_continuation.clone(),
        },
        rate_budget,
    ))
}
