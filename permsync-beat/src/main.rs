//! permsync-beat: the Beat Scheduler process (spec.md §4.2). On a fixed
//! tick it evaluates which connector-credential pairs are due for a
//! permission sync, creates fenced generator tasks for them, runs the
//! Fence Validator, and drives the Progress Monitor over all live fences.
//!
//! Bootstrap mirrors `delicate-scheduler/src/main.rs`: `dotenv`, a
//! `flexi_logger` file writer plumbed into `tracing-subscriber`, and a
//! connection pool built once at startup and shared for the process
//! lifetime.

use std::env;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use diesel::r2d2::{ConnectionManager as DieselConnectionManager, Pool};
use diesel::MysqlConnection;
use flexi_logger::{Age, Cleanup, Criterion, FileSpec, Naming, WriteMode};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use permsync_core::beat::{check_for_doc_permissions_sync, BeatContext};
use permsync_core::config::{StaticRuntimeConfig, GLOBAL_SOURCE_REGISTRY};
use permsync_core::db::{DieselAclDatabase, DieselCcpRepository};
use permsync_core::fence::RedisFenceStore;
use permsync_core::lock::RedisDistributedLock;
use permsync_core::queue::RedisListTaskQueue;

fn init_logging() -> Result<flexi_logger::LoggerHandle> {
    let log_level: Level = FromStr::from_str(&env::var("LOG_LEVEL").unwrap_or_else(|_| String::from("info")))
        .context("invalid LOG_LEVEL")?;

    let (file_writer, handle) = flexi_logger::FileLogWriter::builder(FileSpec::default().basename("permsync-beat"))
        .rotate(
            Criterion::Age(Age::Day),
            Naming::Timestamps,
            Cleanup::KeepLogFiles(15),
        )
        .write_mode(WriteMode::Async)
        .try_build_with_handle()
        .context("flexi_logger init failed")?;

    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_thread_names(true)
        .with_writer(move || file_writer.clone())
        .init();

    Ok(handle)
}

fn build_diesel_pool(database_url: &str) -> Result<Pool<DieselConnectionManager<MysqlConnection>>> {
    Pool::builder()
        .build(DieselConnectionManager::<MysqlConnection>::new(database_url))
        .context("failed to build the MySQL connection pool")
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let _log_handle = init_logging()?;

    let redis_url = env::var("REDIS_URL").context("REDIS_URL must be set")?;
    let database_url = env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let tick_interval_secs: u64 = env::var("PERMSYNC_BEAT_INTERVAL_SECS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(20);

    let redis_client = redis::Client::open(redis_url).context("invalid REDIS_URL")?;
    let redis_conn = redis::aio::ConnectionManager::new(redis_client)
        .await
        .context("failed to connect to Redis")?;

    let pool = build_diesel_pool(&database_url)?;

    let fences = Arc::new(RedisFenceStore::new(redis_conn.clone()));
    let lock = Arc::new(RedisDistributedLock::new(redis_conn.clone()));
    let queue = Arc::new(RedisListTaskQueue::new(redis_conn));
    let ccp_repo = Arc::new(DieselCcpRepository::new(pool.clone()));
    let db = Arc::new(DieselAclDatabase::new(pool));
    let runtime_config = StaticRuntimeConfig::default();
    let no_other_lifecycle_fence = |_ccp_id: i64| false;

    info!(tick_interval_secs, "permsync-beat starting");

    let mut ticker = tokio::time::interval(tokio::time::Duration::from_secs(tick_interval_secs));
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received, stopping after the current tick");
                break;
            }
        }

        let ctx = BeatContext {
            fences: fences.as_ref(),
            lock: lock.as_ref(),
            queue: queue.as_ref(),
            ccp_repo: ccp_repo.as_ref(),
            db: db.as_ref(),
            registry: &GLOBAL_SOURCE_REGISTRY,
            runtime: &runtime_config,
            other_lifecycle_fenced: &no_other_lifecycle_fence,
        };

        check_for_doc_permissions_sync(&ctx).await;
    }

    Ok(())
}
