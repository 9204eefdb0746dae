mod api;
mod auth;
mod config;
mod db;
mod error;
mod services;
mod tasks;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::DefaultBodyLimit,
    middleware::from_fn_with_state,
    routing::{get, post},
    Router,
};
use sqlx::SqlitePool;
use tower_http::{services::ServeDir, trace::TraceLayer};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::auth::AuthFailureLimiter;
use crate::config::Config;
use crate::services::cache::{BoundedCache, Eviction};
use crate::services::cdn::CdnPurger;
use crate::services::chunks::ChunkCoordinator;
use crate::services::ids::IdStore;
use crate::services::paths::Paths;
use crate::services::retention::Retention;
use crate::services::scan::Scanner;
use crate::services::sweeper::RetentionSweeper;
use crate::services::zips::AlbumZipper;

/// Shared application state passed to every handler via Axum's `State`
/// extractor. Must be `Clone` — Axum clones it once per request, so the
/// heavier members sit behind `Arc`s.
#[derive(Clone)]
pub struct AppState {
    pub db: SqlitePool,
    pub config: Arc<Config>,
    pub paths: Paths,
    pub ids: IdStore,
    pub chunks: Arc<ChunkCoordinator>,
    pub zips: Arc<AlbumZipper>,
    pub sweeper: Arc<RetentionSweeper>,
    pub scanner: Option<Arc<Scanner>>,
    pub cdn: Option<CdnPurger>,
    pub retention: Retention,
    pub limiter: Arc<AuthFailureLimiter>,
    /// Public album renders, invalidated on any album mutation.
    pub render_cache: Arc<BoundedCache<serde_json::Value>>,
    /// name → original filename, for Content-Disposition when serving.
    pub disposition_cache: Arc<BoundedCache<String>>,
    /// Shared HTTP client for outbound requests (URL intake, CDN purge).
    pub http_client: reqwest::Client,
}

impl AppState {
    fn build(db: SqlitePool, config: Config) -> Self {
        let paths = Paths::new(&config.uploads_dir);
        let http_client = reqwest::Client::new();

        Self {
            ids: IdStore::new(
                config.max_tries,
                config.filesystem_identifier_check,
                &config.uploads_dir,
            ),
            chunks: Arc::new(ChunkCoordinator::new(
                paths.clone(),
                config.max_size_bytes(),
                config.max_chunks,
                Duration::from_secs(config.chunk_timeout_secs),
            )),
            zips: Arc::new(AlbumZipper::new()),
            sweeper: Arc::new(RetentionSweeper::new()),
            scanner: Scanner::from_config(&config).map(Arc::new),
            cdn: CdnPurger::from_config(&config, http_client.clone()),
            retention: Retention::from_config(&config),
            limiter: Arc::new(AuthFailureLimiter::new()),
            render_cache: Arc::new(BoundedCache::new(1000, Eviction::LastGetTime)),
            disposition_cache: Arc::new(BoundedCache::new(1000, Eviction::GetsCount)),
            paths,
            config: Arc::new(config),
            db,
            http_client,
        }
    }
}

#[tokio::main]
async fn main() {
    // Load .env before anything else so variables are available to both the
    // tracing filter and Config::from_env().
    dotenvy::dotenv().ok(); // .ok() — missing file is fine in production

    // Structured tracing. Level controlled via RUST_LOG env var; defaults to
    // "info" if unset.
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();

    let pool = db::open(&config.database_url)
        .await
        .expect("failed to open the database and run migrations");

    db::ensure_root_user(&pool)
        .await
        .expect("failed to bootstrap the root account");

    let state = AppState::build(pool, config);

    // Create the uploads tree (uploads/, chunks/, thumbs/, zips/) before
    // the server accepts its first request.
    state
        .paths
        .init()
        .expect("failed to create the uploads directory tree");

    tasks::spawn_background_tasks(state.clone());

    let app = router(state.clone());

    let addr = SocketAddr::from(([0, 0, 0, 0], state.config.port));
    info!("listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind TCP listener");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .expect("server error");
}

/// Builds the full route tree.
///
/// Splitting routes into groups keeps middleware application explicit and
/// makes it easy to see at a glance which routes are protected.
fn router(state: AppState) -> Router {
    // 1. Public routes — no authentication.
    let public_routes = Router::new()
        .route("/api/check", get(api::auth::check))
        .route("/api/login", post(api::auth::login))
        .route("/api/register", post(api::auth::register))
        .route("/api/tokens/verify", post(api::auth::verify_token))
        .route("/api/album/get/{identifier}", get(api::albums::get_public))
        .route("/api/album/zip/{identifier}", get(api::albums::download_zip));

    // 2. Upload routes — anonymous unless the instance is private; the
    //    handlers make that call, the middleware only resolves the token.
    //    Body limit: the per-file cap plus multipart framing headroom.
    let upload_routes = Router::new()
        .route("/api/upload", post(api::upload::upload))
        .route("/api/upload/finishchunks", post(api::upload::finish_chunks))
        .route("/api/upload/{albumid}", post(api::upload::upload_to_album))
        .layer(DefaultBodyLimit::max(
            (state.config.max_size_bytes() + 1024 * 1024) as usize,
        ))
        .layer(from_fn_with_state(
            state.clone(),
            auth::middleware::optional_auth,
        ));

    // 3. Authenticated routes.
    let user_routes = Router::new()
        .route("/api/password/change", post(api::auth::change_password))
        .route("/api/tokens/change", post(api::auth::change_token))
        .route("/api/uploads", get(api::list::list_uploads))
        .route("/api/uploads/{page}", get(api::list::list_uploads_page))
        .route("/api/album/{albumid}", get(api::list::list_album_uploads))
        .route(
            "/api/album/{albumid}/{page}",
            get(api::list::list_album_uploads_page),
        )
        .route("/api/upload/get/{identifier}", get(api::list::get_upload))
        .route("/api/upload/delete", post(api::upload::delete_single))
        .route("/api/upload/bulkdelete", post(api::upload::bulk_delete))
        .route(
            "/api/albums",
            get(api::albums::list).post(api::albums::create),
        )
        .route("/api/albums/{page}", get(api::albums::list_page))
        .route("/api/albums/edit", post(api::albums::edit))
        .route("/api/albums/rename", post(api::albums::edit))
        .route("/api/albums/disable", post(api::albums::disable))
        .route("/api/albums/delete", post(api::albums::delete))
        .route("/api/albums/addfiles", post(api::albums::add_files))
        .layer(from_fn_with_state(
            state.clone(),
            auth::middleware::require_auth,
        ));

    let mut app = Router::new()
        .merge(public_routes)
        .merge(upload_routes)
        .merge(user_routes);

    // 4. File serving — only when this process owns the uploads domain.
    //    Thumbnails have no disposition logic, so ServeDir does the work.
    if state.config.serve_files_with_server {
        app = app
            .nest_service(
                "/thumbs",
                ServeDir::new(state.paths.uploads().join("thumbs")),
            )
            .route("/{name}", get(api::files::serve_file));
    }

    app.fallback(|| async { error::AppError::NotFound })
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
impl AppState {
    /// In-memory database plus a throwaway uploads tree. The TempDir must
    /// outlive the state, so it is handed back to the caller.
    pub async fn for_tests() -> (Self, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = Config::test_defaults();
        config.uploads_dir = dir
            .path()
            .join("uploads")
            .to_string_lossy()
            .into_owned();

        let pool = db::test_pool().await;
        let state = Self::build(pool, config);
        state.paths.init().expect("test uploads tree");
        (state, dir)
    }
}
