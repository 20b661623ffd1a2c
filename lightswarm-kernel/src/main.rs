/**
 * LIGHTSWARM KERNEL - Point d'entrée du coordinateur
 *
 * RÔLE : Bootstrap : config, transport UDP, journal, workers d'affichage,
 * API REST, health MQTT optionnel, puis boucle de l'essaim jusqu'à ctrl-c.
 * Un échec de bind UDP est fatal ; le reste dégrade avec un warning.
 */

use anyhow::Context;
use lightswarm_kernel::config::{load_config, KernelConfig};
use lightswarm_kernel::coordinator::SwarmCoordinator;
use lightswarm_kernel::display::SurfaceWorkers;
use lightswarm_kernel::health::HealthTracker;
use lightswarm_kernel::http::{self, AppState};
use lightswarm_kernel::journal::{JsonlFileSink, LogSink, TracingSink};
use lightswarm_kernel::runtime::{self, KernelChannels};
use lightswarm_kernel::transport::UdpTransport;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn open_journal(cfg: &KernelConfig) -> Box<dyn LogSink> {
    match &cfg.log_dir {
        Some(dir) => match JsonlFileSink::open(dir) {
            Ok(sink) => Box::new(sink),
            Err(e) => {
                warn!(dir = %dir.display(), "[kernel] cannot open journal, falling back to tracing: {e}");
                Box::new(TracingSink::new())
            }
        },
        None => Box::new(TracingSink::new()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Charger les variables d'environnement depuis .env (si présent)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = load_config().await;
    let advertise = cfg.resolve_advertise();
    let settings = cfg.swarm_settings(advertise);

    let transport = UdpTransport::bind(cfg.bind, cfg.broadcast)
        .await
        .with_context(|| format!("cannot open swarm port {}", cfg.bind))?;

    // workers d'affichage : complétions renvoyées à la boucle
    let (done_tx, done_rx) = mpsc::unbounded_channel();
    let display = Arc::new(SurfaceWorkers::spawn(Arc::new(cfg.renderer()), done_tx));

    let mut coordinator = SwarmCoordinator::new(settings, display, open_journal(&cfg), Instant::now());
    coordinator.record_startup(cfg.bind);

    let (snap_tx, snap_rx) = watch::channel(coordinator.snapshot(Instant::now()));
    let (cmd_tx, cmd_rx) = mpsc::channel(16);

    let health_tracker = HealthTracker::new();
    if let Some(mqtt) = cfg.mqtt.clone() {
        health_tracker.spawn_health_publisher(mqtt, snap_rx.clone());
    }

    #[cfg(unix)]
    if let Err(e) = runtime::spawn_reset_signal(cmd_tx.clone()) {
        warn!("[kernel] SIGUSR1 reset unavailable: {e}");
    }

    if let Some(http_cfg) = cfg.http.clone() {
        let app = http::build_router(AppState {
            snapshots: snap_rx,
            commands: cmd_tx,
            health_tracker,
        });
        let listener = TcpListener::bind(http_cfg.listen)
            .await
            .with_context(|| format!("cannot bind HTTP API on {}", http_cfg.listen))?;
        info!("[kernel] listening on http://{}", http_cfg.listen);
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                error!("[kernel] HTTP server stopped: {e}");
            }
        });
    }

    let channels = KernelChannels {
        completions: done_rx,
        commands: cmd_rx,
        snapshots: snap_tx,
    };
    runtime::run_kernel(
        transport,
        coordinator,
        channels,
        cfg.announce_interval(),
        runtime::shutdown_signal(),
    )
    .await
}
