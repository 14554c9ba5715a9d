//! `etlcore serve`: one process running the orchestrator, all three worker
//! classes, and the Control API, wired together with the in-memory broker and
//! broadcast progress channel.

use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use crate::api::{self, ApiState};
use crate::config::Configuration;
use crate::db::{self, DbConnectionConfig};
use crate::orchestrator::Orchestrator;
use crate::progress::BroadcastProgressChannel;
use crate::queue::memory::{MemoryBroker, VisibilityTimeouts};
use crate::queue::QueueBroker;
use crate::vector::PostgresVectorStore;
use crate::workers::embed::EmbedWorker;
use crate::workers::extract::ExtractWorker;
use crate::workers::transform::TransformWorker;
use crate::workers::WorkerContext;

pub async fn run(migrate: bool, config: Configuration) -> anyhow::Result<()> {
    let config = Arc::new(config);
    let conn_cfg = DbConnectionConfig::new(config.database_url().clone());
    let pool = db::build_pool(&conn_cfg)?;

    if migrate {
        let mut conn = pool.get().context("Checking out a connection to run migrations")?;
        db::run_pending_migrations(&mut conn)?;
    }

    let broker = Arc::new(MemoryBroker::new(
        VisibilityTimeouts {
            extract: config.visibility_timeout_extract(),
            transform: config.visibility_timeout_transform(),
            embed: config.visibility_timeout_embed(),
        },
        config.max_retries(),
    ));
    broker.clone().spawn_reaper(std::time::Duration::from_secs(30));

    let progress = Arc::new(BroadcastProgressChannel::new(1024));
    let vector_store = Arc::new(PostgresVectorStore::new(pool.clone()));
    let embedding_provider = super::build_embedding_provider();

    let ctx = WorkerContext {
        pool: pool.clone(),
        broker: broker.clone() as Arc<dyn QueueBroker>,
        progress: progress.clone() as Arc<dyn crate::progress::ProgressChannel>,
        config: config.clone(),
    };

    let extract_worker = Arc::new(ExtractWorker::new(ctx.clone(), super::build_adapters()));
    let transform_worker = Arc::new(TransformWorker::new(ctx.clone()));
    let embed_worker = Arc::new(EmbedWorker::new(ctx.clone(), embedding_provider, vector_store));

    let orchestrator = Arc::new(Orchestrator::new(
        pool.clone(),
        ctx.broker.clone(),
        ctx.progress.clone(),
        config.orchestrator_tick_interval(),
        config.runaway_threshold(),
        config.default_batch_size(),
        config.extract_queue_hwm(),
        config.extract_queue_lwm(),
    ));

    let api_state = ApiState {
        pool: pool.clone(),
        broker: ctx.broker.clone(),
        progress: ctx.progress.clone(),
    };
    let app = api::router(api_state).layer(tower_http::trace::TraceLayer::new_for_http());
    let listener = tokio::net::TcpListener::bind(config.api_bind_addr())
        .await
        .with_context(|| format!("Binding the Control API to {}", config.api_bind_addr()))?;

    info!(addr = %config.api_bind_addr(), "control API listening");

    tokio::try_join!(
        async { extract_worker.run().await.context("extract worker loop exited") },
        async { transform_worker.run().await.context("transform worker loop exited") },
        async { embed_worker.run().await.context("embed worker loop exited") },
        async { orchestrator.run().await.context("orchestrator loop exited") },
        async { axum::serve(listener, app).await.context("control API server exited") },
    )?;

    Ok(())
}
