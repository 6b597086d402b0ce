// quillstream-server: a collaboration server over one of three host
// runtimes, selected at startup. The adapter choice fixes the runtime
// (actix brings its own System), so `main` stays synchronous and hands
// off to the right executor.

mod config;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use quillstream_engine::{CollabHooks, DocumentRegistry};
use quillstream_transport::adapters::{ActixAdapter, AxumAdapter, TungsteniteAdapter};
use quillstream_transport::HookDispatcher;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::{AdapterKind, ServerConfig};

fn main() -> Result<()> {
    let config = ServerConfig::from_env().context("failed to load configuration")?;

    tracing_subscriber::fmt().with_env_filter(EnvFilter::new(&config.log_filter)).init();

    let registry = Arc::new(
        DocumentRegistry::new()
            .evict_when_idle(config.evict_idle)
            .persist_debounce(config.persist_debounce),
    );
    let hooks = Arc::new(HookDispatcher::new().with_hooks(Arc::new(CollabHooks::new(registry))));

    match config.adapter {
        AdapterKind::Actix => run_actix(config, hooks),
        AdapterKind::Axum | AdapterKind::Tungstenite => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("failed to start tokio runtime")?;
            runtime.block_on(async move {
                match config.adapter {
                    AdapterKind::Axum => run_axum(config, hooks).await,
                    AdapterKind::Tungstenite => run_tungstenite(config, hooks).await,
                    AdapterKind::Actix => unreachable!("dispatched above"),
                }
            })
        }
    }
}

async fn run_axum(config: ServerConfig, hooks: Arc<HookDispatcher>) -> Result<()> {
    use axum::extract::connect_info::ConnectInfo;
    use axum::extract::{State, WebSocketUpgrade};
    use axum::http::{HeaderMap, Uri};
    use axum::response::Response;
    use axum::routing::{any, get};
    use axum::Router;
    use quillstream_transport::adapters::axum::upgrade_request_from_parts;

    async fn ws_handler(
        State(adapter): State<Arc<AxumAdapter>>,
        ws: WebSocketUpgrade,
        uri: Uri,
        headers: HeaderMap,
        ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    ) -> Response {
        let request = upgrade_request_from_parts(&uri, &headers, Some(remote_addr));
        adapter.handle_upgrade(ws, request).await
    }

    let adapter = Arc::new(AxumAdapter::new(hooks));
    let app = Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/", any(ws_handler))
        .route("/{*doc}", any(ws_handler))
        .with_state(adapter);

    let listener = tokio::net::TcpListener::bind(config.bind_addr())
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr()))?;
    info!(addr = %listener.local_addr()?, adapter = "axum", "listening");

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")
}

async fn run_tungstenite(config: ServerConfig, hooks: Arc<HookDispatcher>) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(config.bind_addr())
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr()))?;
    info!(addr = %listener.local_addr()?, adapter = "tungstenite", "listening");

    let adapter = TungsteniteAdapter::new(hooks);
    tokio::select! {
        result = adapter.serve(listener) => result.context("listener failed"),
        _ = shutdown_signal() => {
            info!("shutting down");
            Ok(())
        }
    }
}

fn run_actix(config: ServerConfig, hooks: Arc<HookDispatcher>) -> Result<()> {
    use actix_web::{web, App, HttpRequest, HttpResponse, HttpServer};

    async fn ws_handler(
        req: HttpRequest,
        body: web::Payload,
        adapter: web::Data<ActixAdapter>,
    ) -> actix_web::Result<HttpResponse> {
        adapter.handle_upgrade(&req, body).await
    }

    async fn healthz() -> &'static str {
        "ok"
    }

    actix_web::rt::System::new().block_on(async move {
        let adapter = web::Data::new(ActixAdapter::new(hooks));
        let bind_addr = config.bind_addr();
        info!(addr = %bind_addr, adapter = "actix", "listening");

        // actix installs its own ctrl-c handling; run() returns once
        // the workers have drained.
        HttpServer::new(move || {
            App::new()
                .app_data(adapter.clone())
                .route("/healthz", web::get().to(healthz))
                .route("/{doc:.*}", web::get().to(ws_handler))
        })
        .bind((config.host.as_str(), config.port))
        .with_context(|| format!("failed to bind {bind_addr}"))?
        .run()
        .await
        .context("server error")
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("ctrl-c handler should install");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("sigterm handler should install")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
