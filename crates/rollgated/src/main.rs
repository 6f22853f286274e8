use anyhow::{Context, Result};
use rollgate_core::DistanceMatcher;
use rollgate_hw::{Camera, CardReader, FrameSource};
use rollgate_models::OnnxEmbedder;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

mod clock;
mod config;
mod dbus_interface;
mod directory;
mod evidence;
mod ledger;
mod queue;
mod retry;
mod session;
mod station;
mod store;
#[cfg(test)]
mod testing;

use clock::{Clock, SystemClock};
use config::Config;
use directory::IdentityDirectory;
use evidence::EvidenceRecorder;
use ledger::AttendanceLedger;
use queue::DurableQueue;
use session::{SessionController, SessionSettings};
use station::StationHandle;
use store::SqliteStore;

const BUS_NAME: &str = "org.rollgate.Station1";
const OBJECT_PATH: &str = "/org/rollgate/Station1";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::load().context("failed to load configuration")?;
    tracing::info!(station = %config.station_id, "rollgated starting");

    let store = Arc::new(
        SqliteStore::open(&config.db_path, &config.evidence_dir)
            .await
            .context("failed to open attendance store")?,
    );
    tracing::info!(path = %config.db_path.display(), "attendance store opened");

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let ledger = Arc::new(AttendanceLedger::new(
        store.clone(),
        Arc::new(DurableQueue::open(&config.ledger_queue_path())?),
        config.store_timeout(),
    ));
    let evidence = Arc::new(EvidenceRecorder::spawn(
        &config,
        clock.clone(),
        store.clone(),
        Arc::new(DurableQueue::open(&config.evidence_queue_path())?),
    ));
    let directory = Arc::new(IdentityDirectory::new(
        store.clone(),
        config.directory_ttl(),
        config.store_timeout(),
    ));
    match directory.warm().await {
        Ok(count) => tracing::info!(cards = count, "identity directory warmed"),
        Err(e) => tracing::warn!(error = %e, "directory warm-up failed, lookups will fetch on demand"),
    }

    // Fail fast on missing models or camera.
    let embedder = OnnxEmbedder::load(&config.model_dir).context("failed to load face models")?;
    tracing::info!(dir = %config.model_dir.display(), "face models loaded");
    let camera = Camera::open(&config.camera_device, config.camera_width, config.camera_height)
        .context("failed to open camera")?;
    let camera: Box<dyn FrameSource> = Box::new(camera);
    tracing::info!(source = %camera.describe(), "frame source ready");

    let (stop_tx, stop_rx) = watch::channel(false);
    let workers = [
        ledger.relay(&config.retry_backoff).spawn(stop_rx.clone()),
        evidence.relay(&config.retry_backoff).spawn(stop_rx),
    ];

    let controller = SessionController {
        settings: SessionSettings::from(&config),
        clock,
        directory: directory.clone(),
        ledger,
        evidence: evidence.clone(),
        embedder: Arc::new(embedder),
        matcher: Arc::new(DistanceMatcher::new(config.distance_metric, config.match_threshold)),
        camera: Arc::new(Mutex::new(camera)),
    };
    let (handle, station_task) = station::spawn(
        controller,
        config.conflict_policy,
        config.scan_queue_depth,
        config.verdict_history,
    );

    if let Some(device) = &config.reader_device {
        spawn_reader(device.clone(), handle.clone())?;
    } else {
        tracing::info!("no card reader configured, accepting scans over D-Bus only");
    }

    let service = dbus_interface::StationService {
        handle: handle.clone(),
        directory,
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
        .context("failed to register on D-Bus")?;

    tracing::info!(bus = BUS_NAME, path = OBJECT_PATH, "rollgated ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("rollgated shutting down");

    handle.shutdown().await;
    if let Err(e) = station_task.await {
        tracing::error!(error = %e, "station task panicked");
    }
    evidence.flush().await;
    let _ = stop_tx.send(true);
    for worker in workers {
        let _ = worker.await;
    }

    Ok(())
}

/// Read scans from a keyboard-wedge reader on a dedicated thread.
///
/// A reader failure faults the station; scans then only arrive over D-Bus
/// until the reader is back and the operator resumes.
fn spawn_reader(device: String, handle: StationHandle) -> Result<()> {
    let mut reader = CardReader::open(&device)?;
    let rt = tokio::runtime::Handle::current();
    std::thread::Builder::new()
        .name("card-reader".into())
        .spawn(move || loop {
            match reader.next_scan() {
                Ok(card_id) => {
                    let handle = handle.clone();
                    rt.spawn(async move {
                        match handle.scan(card_id.as_str()).await {
                            Ok(report) => tracing::debug!(verdict = report.verdict.as_str(), "reader scan resolved"),
                            Err(e) => tracing::warn!(card = %card_id, error = %e, "reader scan refused"),
                        }
                    });
                }
                Err(e) => {
                    tracing::error!(device = %device, error = %e, "card reader failed");
                    handle.fault(&format!("card reader: {e}"));
                    break;
                }
            }
        })?;
    Ok(())
}
