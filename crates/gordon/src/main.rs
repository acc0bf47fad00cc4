//! Gordon - single-host container orchestration: an OCI Distribution
//! registry, an event-driven deployment controller, and a reverse proxy,
//! wired together by a lifecycle supervisor.

use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

mod cli;
mod config;
mod logging;
mod metrics;
mod pid;
mod route_sync;

use cli::{Cli, Command, GenerateWhat};
use config::{Config, ConfigManager};
use gordon_api::{create_router, AppState};
use gordon_auth::{ApiKeyAuthProvider, AuthProvider, AuthState, JwtAuthProvider, JwtManager};
use gordon_core::{
    ContainerManager, DeploymentController, EventBus, EventPayload, GarbageCollector, Route,
    RegistryService,
};
use gordon_proxy::{proxy_handler, ReverseProxy, RoutingTable, TableResolver};
use gordon_runtime::BollardRuntime;
use gordon_storage::{LocalBlobStore, LocalManifestStore};
use route_sync::RouteSyncHandler;

const PROXY_DRAIN_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);
const STOP_ALL_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("gordon: {err:#}");
            ExitCode::from(2)
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    match cli.command.unwrap_or(Command::Start) {
        Command::Version => {
            println!("gordon {}", env!("CARGO_PKG_VERSION"));
            Ok(ExitCode::SUCCESS)
        }
        Command::Reload => match pid::signal_reload() {
            Ok(()) => Ok(ExitCode::SUCCESS),
            Err(err) => {
                eprintln!("gordon: {err:#}");
                Ok(ExitCode::from(3))
            }
        },
        Command::Generate { what } => run_generate(cli.config.as_deref(), what),
        Command::Start => run_start(cli.config.as_deref()),
    }
}

fn run_generate(explicit_config: Option<&str>, what: GenerateWhat) -> Result<ExitCode> {
    match what {
        GenerateWhat::JwtSecret => {
            println!("{}", random_token());
            Ok(ExitCode::SUCCESS)
        }
        GenerateWhat::ApiKey => {
            println!("{}", random_token());
            Ok(ExitCode::SUCCESS)
        }
        GenerateWhat::JwtToken {
            subject,
            scopes,
            validity,
        } => {
            let config = load_config_for_generate(explicit_config)?;
            let validity = validity.unwrap_or(config.auth.token_validity);
            let jwt = JwtManager::new(&config.auth.jwt_secret, validity);
            let token = jwt
                .generate_token(&subject, &scopes)
                .context("failed to sign jwt")?;
            println!("{token}");
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// `generate jwt-token` needs the running instance's signing secret; reuse
/// the same search order as `start` rather than inventing a fresh one.
fn load_config_for_generate(explicit: Option<&str>) -> Result<Config> {
    match Config::locate(explicit) {
        Some(path) if path.exists() => Config::load(&path),
        _ => Ok(Config::default()),
    }
}

/// Two 128-bit UUIDs concatenated without hyphens: simplex, URL-safe, and
/// long enough for a bearer secret without reaching for a dedicated RNG
/// dependency this workspace otherwise has no use for.
fn random_token() -> String {
    format!(
        "{}{}",
        uuid::Uuid::new_v4().simple(),
        uuid::Uuid::new_v4().simple()
    )
}

fn run_start(explicit_config: Option<&str>) -> Result<ExitCode> {
    let config_path = Config::locate(explicit_config)
        .context("no configuration file found ($PWD/gordon.toml, $XDG_CONFIG_HOME/gordon, $HOME/.gordon, or /etc/gordon) and no --config given")?;

    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("gordon: {err:#}");
            return Ok(ExitCode::from(1));
        }
    };

    logging::init_logging(&config.logging);
    info!(version = env!("CARGO_PKG_VERSION"), "starting gordon");

    let runtime = tokio::runtime::Runtime::new().context("failed to start tokio runtime")?;
    match runtime.block_on(serve(config, config_path)) {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(err) => {
            error!(%err, "gordon exited with an error");
            Ok(ExitCode::from(3))
        }
    }
}

async fn serve(config: Config, config_path: std::path::PathBuf) -> Result<()> {
    let pid_guard = pid::write_pid_file().context("failed to write pid file")?;

    let config_manager = ConfigManager::new(config.clone(), config_path.clone());

    // Root cancellation context for the process: cancelled once, at
    // shutdown, before StopAllManagedContainers runs with its own bounded
    // context.
    let shutdown_ctx = tokio_util::sync::CancellationToken::new();

    // --- Event Bus ---
    let event_bus = EventBus::new();
    event_bus.start().await;

    // --- Container Manager ---
    let container_runtime = Arc::new(
        BollardRuntime::connect().context("failed to connect to the container runtime")?,
    );
    let container_manager = Arc::new(ContainerManager::new(container_runtime));
    container_manager
        .sync_containers(&shutdown_ctx)
        .await
        .context("failed to sync managed containers from the runtime")?;

    let data_root = std::path::PathBuf::from(&config.server.data_root);
    let blobs = Arc::new(
        LocalBlobStore::new(data_root.join("blobs"))
            .await
            .context("failed to open blob store")?,
    );
    let manifests = Arc::new(
        LocalManifestStore::new(data_root.join("repositories"))
            .await
            .context("failed to open manifest store")?,
    );
    let gc = Arc::new(GarbageCollector::new(blobs.clone(), manifests.clone()));
    let gc_task = gordon_core::gc::spawn_gc_task(gc.clone());

    let registry_domain = if config.auto_route.enabled {
        Some(config.server.registry_domain.clone())
    } else {
        None
    };
    let deployment_controller = Arc::new(DeploymentController::new(
        container_manager.clone(),
        gc,
        event_bus.clone(),
        config.auto_route.enabled,
        registry_domain,
    ));
    deployment_controller.set_routes(routes_from_config(&config));
    event_bus.subscribe(deployment_controller.clone());

    let watch_deployment_controller = deployment_controller.clone();
    let watch_event_bus = event_bus.clone();
    let _watcher = config::spawn_config_watch(
        config_manager.clone(),
        config_path,
        move |reloaded| {
            watch_deployment_controller.set_routes(routes_from_config(&reloaded));
            let event_bus = watch_event_bus.clone();
            tokio::spawn(async move {
                if let Err(err) = event_bus.publish(EventPayload::ConfigReload).await {
                    warn!(%err, "failed to publish config.reload after file watch");
                }
            });
        },
    )
    .context("failed to start config file watcher")?;

    let routing_resolver = Arc::new(TableResolver::new(RoutingTable::default()));
    let route_sync = Arc::new(RouteSyncHandler::new(
        container_manager.clone(),
        routing_resolver.clone(),
    ));
    event_bus.subscribe(route_sync.clone());

    container_manager
        .auto_start_containers(&shutdown_ctx, &deployment_controller.routes())
        .await
        .context("failed to auto-start configured containers")?;
    route_sync.refresh().await;

    let health_check_task = gordon_core::container_manager::spawn_health_check_task(
        container_manager.clone(),
        shutdown_ctx.clone(),
    );

    // --- Registry Service ---
    let registry = Arc::new(RegistryService::new(blobs, manifests, event_bus.clone()));

    let auth_provider = build_auth_provider(&config.auth);
    let auth_state = Arc::new(AuthState {
        provider: auth_provider,
        anonymous_pull: config.auth.anonymous_pull,
    });
    let app_state = AppState::new(registry, auth_state);

    let metrics_handle = metrics::init_metrics();
    let api_router =
        create_router(app_state, metrics_handle.map(Arc::new)).layer(TraceLayer::new_for_http());

    // --- Reverse Proxy ---
    let reverse_proxy = Arc::new(ReverseProxy::new(routing_resolver.clone()));
    let proxy_router = axum::Router::new()
        .fallback(proxy_handler)
        .with_state(reverse_proxy.clone())
        .layer(TraceLayer::new_for_http());

    let registry_addr: SocketAddr =
        format!("0.0.0.0:{}", config.server.registry_port).parse()?;
    let proxy_addr: SocketAddr = format!("0.0.0.0:{}", config.server.port).parse()?;

    let registry_listener = tokio::net::TcpListener::bind(registry_addr)
        .await
        .with_context(|| format!("failed to bind registry listener on {registry_addr}"))?;
    let proxy_listener = tokio::net::TcpListener::bind(proxy_addr)
        .await
        .with_context(|| format!("failed to bind proxy listener on {proxy_addr}"))?;

    info!(%registry_addr, "registry api listening");
    info!(%proxy_addr, "reverse proxy listening");

    let shutdown = shutdown_signal(
        event_bus.clone(),
        config_manager.clone(),
        deployment_controller.clone(),
    );

    let registry_serve = axum::serve(registry_listener, api_router);
    let proxy_serve = axum::serve(proxy_listener, proxy_router);

    tokio::select! {
        result = registry_serve => result.context("registry server failed")?,
        result = proxy_serve => result.context("proxy server failed")?,
        () = shutdown => {
            info!("shutdown requested, draining in-flight proxy requests");
        }
    }

    shutdown_ctx.cancel();
    deployment_controller.shutdown();

    if !reverse_proxy.drain(PROXY_DRAIN_TIMEOUT).await {
        warn!("proxy did not drain within the timeout, forcing shutdown");
    }

    // StopAllManagedContainers gets its own fresh, bounded context rather
    // than the now-cancelled root one, so it actually gets to run.
    let stop_all_ctx = tokio_util::sync::CancellationToken::new();
    let stop_all_deadline = stop_all_ctx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(STOP_ALL_TIMEOUT).await;
        stop_all_deadline.cancel();
    });
    container_manager.stop_all_managed_containers(&stop_all_ctx).await;

    health_check_task.abort();
    gc_task.abort();
    event_bus.stop().await.ok();
    drop(pid_guard);

    info!("gordon stopped");
    Ok(())
}

fn routes_from_config(config: &Config) -> Vec<Route> {
    config
        .routes
        .iter()
        .map(|(domain, image)| Route {
            domain: domain.clone(),
            image: image.clone(),
        })
        .collect()
}

fn build_auth_provider(auth: &config::AuthConfig) -> Option<Arc<dyn AuthProvider>> {
    if !auth.enabled {
        return None;
    }

    match auth.method.as_str() {
        "api_key" => auth.api_key.clone().map(|key| {
            Arc::new(ApiKeyAuthProvider::new(key)) as Arc<dyn AuthProvider>
        }),
        _ => {
            let jwt = Arc::new(JwtManager::new(&auth.jwt_secret, auth.token_validity));
            Some(Arc::new(JwtAuthProvider::new(jwt)) as Arc<dyn AuthProvider>)
        }
    }
}

/// Resolves once on SIGINT/SIGTERM; SIGUSR1 triggers a config reload and a
/// `ManualReload` publish (driving `DeploymentController::reconcile` plus a
/// gc pass) without itself causing shutdown.
async fn shutdown_signal(
    event_bus: EventBus,
    config_manager: ConfigManager,
    deployment_controller: Arc<DeploymentController>,
) {
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(err) => {
            warn!(%err, "failed to install SIGTERM handler");
            std::future::pending().await
        }
    };
    let mut sigusr1 = match signal(SignalKind::user_defined1()) {
        Ok(s) => s,
        Err(err) => {
            warn!(%err, "failed to install SIGUSR1 handler");
            std::future::pending().await
        }
    };

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received SIGINT");
                return;
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM");
                return;
            }
            _ = sigusr1.recv() => {
                info!("received SIGUSR1, reloading configuration");
                config_manager.reload();
                deployment_controller.set_routes(routes_from_config(&config_manager.get()));
                if let Err(err) = event_bus.publish(EventPayload::ManualReload).await {
                    warn!(%err, "failed to publish manual.reload event");
                }
            }
        }
    }
}
