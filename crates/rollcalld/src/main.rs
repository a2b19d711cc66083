use anyhow::{Context, Result};
use rollcall_core::{DecisionEngine, PopulationSnapshot};
use rollcall_store::SqliteStore;
use rollcall_vision::FaceExtractor;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;
mod probes;

use config::Config;
use dbus_interface::KioskService;
use engine::{spawn_engine, Engine};
use probes::ProbeArchive;

const BUS_NAME: &str = "org.rollcall.Kiosk1";
const OBJECT_PATH: &str = "/org/rollcall/Kiosk1";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");

    let config = Config::from_env();
    tracing::info!(?config, "configuration loaded");

    let store = Arc::new(
        SqliteStore::open(&config.db_path, config.embedding_dim)
            .with_context(|| format!("opening database {}", config.db_path.display()))?,
    );
    let snapshot = Arc::new(PopulationSnapshot::new(store.load_population()?));
    let decider = DecisionEngine::new(config.similarity_threshold)?;

    let extractor = FaceExtractor::load(
        &config.detector_model_path(),
        &config.recognizer_model_path(),
        config.min_face_size,
    )
    .context("loading face models")?
    .with_enroll_min_face_size(config.enroll_min_face_size);
    anyhow::ensure!(
        extractor.embedding_dim() == config.embedding_dim,
        "model produces {}-dim embeddings but ROLLCALL_EMBEDDING_DIM is {}",
        extractor.embedding_dim(),
        config.embedding_dim
    );

    let engine = spawn_engine(Engine {
        extractor,
        decider,
        store: Arc::clone(&store),
        snapshot: Arc::clone(&snapshot),
        archive: ProbeArchive::new(config.probes_dir.clone()),
        max_frames: config.max_frames,
        min_samples: config.min_samples,
    })?;

    spawn_refresh(
        Arc::clone(&store),
        Arc::clone(&snapshot),
        Duration::from_secs(config.refresh_secs.max(1)),
    );

    let service = KioskService {
        engine,
        store,
        snapshot,
        timeout: Duration::from_secs(config.decide_timeout_secs),
        threshold: config.similarity_threshold,
    };

    let builder = if config.session_bus {
        zbus::connection::Builder::session()?
    } else {
        zbus::connection::Builder::system()?
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .with_context(|| format!("registering {BUS_NAME} on the D-Bus"))?;

    tracing::info!(bus = BUS_NAME, path = OBJECT_PATH, "rollcalld ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");

    Ok(())
}

/// Periodically reload the enrolled population so admin changes made by
/// other processes become visible.
fn spawn_refresh(store: Arc<SqliteStore>, snapshot: Arc<PopulationSnapshot>, every: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        // The first tick completes immediately; startup already loaded.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let store = Arc::clone(&store);
            match tokio::task::spawn_blocking(move || store.load_population()).await {
                Ok(Ok(population)) => snapshot.replace(population),
                Ok(Err(e)) => tracing::warn!(error = %e, "population refresh failed"),
                Err(e) => tracing::warn!(error = %e, "population refresh task panicked"),
            }
        }
    });
}
