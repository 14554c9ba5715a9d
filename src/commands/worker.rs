//! `etlcore worker <kind>`: run a single worker class against a broker
//! reachable via the same `DATABASE_URL`-keyed state the serving process
//! uses. In this crate's shipped broker (in-process, lease-based) this is
//! mostly useful for local testing of one stage in isolation; a durable
//! broker backing multiple processes is a deployment choice left open by the
//! [`crate::queue::QueueBroker`] trait.

use std::sync::Arc;

use anyhow::Context;

use crate::config::Configuration;
use crate::db::{self, DbConnectionConfig};
use crate::progress::BroadcastProgressChannel;
use crate::queue::memory::{MemoryBroker, VisibilityTimeouts};
use crate::queue::QueueBroker;
use crate::vector::PostgresVectorStore;
use crate::workers::embed::EmbedWorker;
use crate::workers::extract::ExtractWorker;
use crate::workers::transform::TransformWorker;
use crate::workers::WorkerContext;

pub async fn run(kind: &str, config: Configuration) -> anyhow::Result<()> {
    let config = Arc::new(config);
    let conn_cfg = DbConnectionConfig::new(config.database_url().clone());
    let pool = db::build_pool(&conn_cfg)?;

    let broker: Arc<dyn QueueBroker> = Arc::new(MemoryBroker::new(
        VisibilityTimeouts {
            extract: config.visibility_timeout_extract(),
            transform: config.visibility_timeout_transform(),
            embed: config.visibility_timeout_embed(),
        },
        config.max_retries(),
    ));
    let progress = Arc::new(BroadcastProgressChannel::new(1024));

    let ctx = WorkerContext {
        pool: pool.clone(),
        broker,
        progress,
        config: config.clone(),
    };

    match kind {
        "extract" => Arc::new(ExtractWorker::new(ctx, super::build_adapters())).run().await.context("extract worker loop exited"),
        "transform" => Arc::new(TransformWorker::new(ctx)).run().await.context("transform worker loop exited"),
        "embed" => {
            let provider = super::build_embedding_provider();
            let store = Arc::new(PostgresVectorStore::new(pool));
            Arc::new(EmbedWorker::new(ctx, provider, store)).run().await.context("embed worker loop exited")
        }
        other => anyhow::bail!("unknown worker kind: {}", other),
    }
}
