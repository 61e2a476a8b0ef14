mod api;
mod auth;
mod config;
mod connector;
mod db;
mod error;
mod file_index;
mod file_references;
mod file_store;
mod folders;
mod foreign_keys;
mod http_client;
mod models;
mod pipeline;
mod pseudo_ref;
mod queue;
mod ref_cleaner;
mod schema_resolver;

use std::sync::Arc;

use anyhow::Result;
use axum::{
    routing::{delete, get, post, put},
    Router,
};
use config::Config;
use connector::AccountConnectorResolver;
use db::Database;
use file_index::FileIndex;
use file_store::ScratchGitClient;
use folders::FolderStore;
use pipeline::PublishPipeline;
use queue::PipelineJob;
use tokio::sync::mpsc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub pipeline: PublishPipeline,
    pub folders: FolderStore,
    pub file_index: FileIndex,
    pub queue_tx: mpsc::Sender<PipelineJob>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "workbook_publish_api=info,tower_http=info".into()),
        )
        .init();

    let config = Config::from_env()?;
    if config.api_key_is_fallback {
        warn!("Using a generated API key; set PUBLISH_API_KEY to fix it");
    }

    let db = Database::open(&config.database_path)?;
    let folders = FolderStore::new(db.clone());
    let file_index = FileIndex::new(db.clone());
    let files = Arc::new(ScratchGitClient::new(
        config.file_store_url.clone(),
        config.file_store_api_key.clone(),
        config.http_timeout_seconds,
    ));
    let connectors = Arc::new(AccountConnectorResolver::new(
        folders.clone(),
        config.http_timeout_seconds,
    ));
    let pipeline = PublishPipeline::new(db, files, connectors);

    let (queue_tx, queue_rx) = mpsc::channel(config.queue_capacity);
    let state = AppState {
        config: config.clone(),
        pipeline,
        folders,
        file_index,
        queue_tx,
    };

    queue::spawn_pipeline_worker(state.clone(), queue_rx);
    queue::spawn_cleanup_worker(state.clone());

    let app = Router::new()
        .route("/healthz", get(api::healthz))
        .route(
            "/v1/workbooks/{workbook_id}/publish-plans",
            post(api::create_plan).get(api::list_plans),
        )
        .route(
            "/v1/workbooks/{workbook_id}/data-folders",
            put(api::put_data_folders),
        )
        .route(
            "/v1/workbooks/{workbook_id}/data-folders/{folder_id}",
            delete(api::delete_data_folder),
        )
        .route("/v1/publish-plans/{plan_id}", get(api::get_plan))
        .route("/v1/publish-plans/{plan_id}/entries", get(api::list_entries))
        .route("/v1/publish-plans/{plan_id}/run", post(api::run_plan))
        .route("/v1/connector-accounts", put(api::put_connector_account))
        .route("/v1/file-index/stale", get(api::stale_file_index_entries))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    info!("workbook-publish-api listening on {}", config.bind_addr);
    axum::serve(listener, app).await?;
    Ok(())
}
