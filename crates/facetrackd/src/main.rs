use anyhow::{Context, Result};
use facetrack_core::{MatchResolver, OnnxEmbedder, OnnxEmbedderConfig, RecencyCache, ResolverConfig};
use facetrack_hw::{Camera, CameraConfig, FrameSource};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod events;
mod store;
mod worker;

use config::{BusKind, Config};
use dbus_interface::{RecognitionService, BUS_NAME, OBJECT_PATH};
use events::EventBus;
use store::SqliteStore;
use worker::{Pipeline, WorkerController, WorkerSettings};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("facetrackd starting");

    let config = Config::load().context("failed to load configuration")?;
    tracing::info!(
        camera = %config.camera_device,
        db = %config.db_path.display(),
        models = %config.model_dir.display(),
        "configuration loaded"
    );

    let store = SqliteStore::open(&config.db_path).context("failed to open identity database")?;
    let embedder = OnnxEmbedder::load(OnnxEmbedderConfig::in_dir(
        &config.model_dir,
        config.embedding_dim,
    ))
    .context("failed to load face models")?;

    let cache = Arc::new(RecencyCache::new(config.cache_capacity, config.cache_ttl()));
    let resolver = MatchResolver::new(
        Box::new(store),
        cache,
        ResolverConfig::with_tolerance(config.embedding_dim, config.match_tolerance),
    );
    let pipeline = Pipeline {
        embedder: Box::new(embedder),
        resolver,
    };

    let camera_config = CameraConfig {
        device: config.camera_device.clone(),
        ..CameraConfig::default()
    };
    let open_camera = move || {
        Camera::open(&camera_config).map(|camera| Box::new(camera) as Box<dyn FrameSource>)
    };

    let bus = Arc::new(EventBus::new(config.event_capacity));
    let controller = Arc::new(WorkerController::new(
        pipeline,
        open_camera,
        bus.clone(),
        WorkerSettings::from(&config),
    ));

    let builder = match config.bus {
        BusKind::Session => zbus::connection::Builder::session()?,
        BusKind::System => zbus::connection::Builder::system()?,
    };
    let conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, RecognitionService::new(controller.clone()))?
        .build()
        .await
        .context("failed to register on D-Bus")?;

    let forwarder = tokio::spawn(dbus_interface::forward_events(conn.clone(), bus.subscribe()));

    tracing::info!(bus = ?config.bus, name = BUS_NAME, "facetrackd ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("facetrackd shutting down");

    if controller.status().running {
        let stopper = controller.clone();
        match tokio::task::spawn_blocking(move || stopper.stop()).await? {
            Ok(outcome) if !outcome.exited => {
                tracing::warn!("worker still running at shutdown")
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "stop during shutdown failed"),
        }
    }
    forwarder.abort();

    Ok(())
}
