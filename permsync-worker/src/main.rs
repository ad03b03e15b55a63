//! permsync-worker: the Generator Worker process (spec.md §4.3). Each
//! invocation drains exactly one connector-credential pair's permission
//! sync — the unit of work a task broker would otherwise dispatch onto
//! `CONNECTOR_DOC_PERMISSIONS_SYNC`.
//!
//! Bootstrap mirrors `permsync-beat`'s, which in turn mirrors
//! `delicate-scheduler/src/main.rs`: `dotenv`, a `flexi_logger` file
//! writer plumbed into `tracing-subscriber`.

use std::env;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use diesel::r2d2::{ConnectionManager as DieselConnectionManager, Pool};
use diesel::MysqlConnection;
use flexi_logger::{Age, Cleanup, Criterion, FileSpec, Naming, WriteMode};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use permsync_core::config::GLOBAL_SOURCE_REGISTRY;
use permsync_core::db::{DieselAclDatabase, DieselCcpRepository};
use permsync_core::fence::RedisFenceStore;
use permsync_core::generator::{connector_permission_sync_generator_task, GeneratorContext};
use permsync_core::lock::RedisDistributedLock;
use permsync_core::model::{ConnectorCredentialPair, CredentialValidator, DocumentRow, SortOrder};

/// Stand-in for the out-of-scope credential-health subsystem (spec.md §1,
/// §4.3 step 4): a real deployment wires in whatever checks credential
/// usability; absent that, every credential is treated as valid.
struct AlwaysValidCredential;

impl CredentialValidator for AlwaysValidCredential {
    fn validate(&self, _cc_pair: &ConnectorCredentialPair) -> std::result::Result<(), String> {
        Ok(())
    }
}

fn init_logging() -> Result<flexi_logger::LoggerHandle> {
    let log_level: Level =
        FromStr::from_str(&env::var("LOG_LEVEL").unwrap_or_else(|_| String::from("info")))
            .context("invalid LOG_LEVEL")?;

    let (file_writer, handle) =
        flexi_logger::FileLogWriter::builder(FileSpec::default().basename("permsync-worker"))
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

/// `fetch_all_docs`/`fetch_all_doc_ids` (spec.md §4.3 step 7): the
/// document index is an out-of-scope external collaborator. A real
/// deployment wires these to its indexing subsystem; this binary's
/// default has nothing to offer a connector that actually needs them.
fn fetch_all_docs(_order: Option<SortOrder>) -> Vec<DocumentRow> {
    Vec::new()
}

fn fetch_all_doc_ids() -> Vec<String> {
    Vec::new()
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let _log_handle = init_logging()?;

    let ccp_id: i64 = match env::args().nth(1) {
        Some(raw) => raw.parse().context("argument must be a CCP id")?,
        None => bail!("usage: permsync-worker <ccp_id>"),
    };

    let redis_url = env::var("REDIS_URL").context("REDIS_URL must be set")?;
    let database_url = env::var("DATABASE_URL").context("DATABASE_URL must be set")?;

    let redis_client = redis::Client::open(redis_url).context("invalid REDIS_URL")?;
    let redis_conn = redis::aio::ConnectionManager::new(redis_client)
        .await
        .context("failed to connect to Redis")?;

    let pool = build_diesel_pool(&database_url)?;

    let fences = RedisFenceStore::new(redis_conn.clone());
    let lock = RedisDistributedLock::new(redis_conn);
    let ccp_repo = DieselCcpRepository::new(pool.clone());
    let db = DieselAclDatabase::new(pool);
    let credential_validator = AlwaysValidCredential;

    info!(ccp_id, "permsync-worker dispatched");

    let ctx = GeneratorContext {
        fences: &fences,
        lock: &lock,
        ccp_repo: &ccp_repo,
        registry: &GLOBAL_SOURCE_REGISTRY,
        credential_validator: &credential_validator,
        db: &db,
        fetch_all_docs: &fetch_all_docs,
        fetch_all_doc_ids: &fetch_all_doc_ids,
    };

    connector_permission_sync_generator_task(&ctx, ccp_id).await?;

    info!(ccp_id, "permsync-worker finished");
    Ok(())
}
