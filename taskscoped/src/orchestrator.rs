//! Orchestrator / shutdown coordinator (C10): the single owner of every stop
//! signal, wiring C4 -> C5 -> C6 -> {C2, C7} and sequencing the
//! Init -> Attached -> Running -> Draining -> Stopped state machine.
//! Grounded on `cognitod/src/main.rs`'s startup sequence (probe/BPF init,
//! handler wiring, graceful shutdown), generalized to an explicit state
//! machine, with `ctrlc` wired to the Running -> Draining transition in
//! place of `cognitod`'s ad hoc signal handling.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{info, warn};
use tokio::sync::Notify;
use uuid::Uuid;

use crate::api::{self, AppState};
use crate::config::Config;
use crate::error::CoreError;
use crate::hub::BroadcastHub;
use crate::metrics::{self, Metrics};
use crate::pipeline::processor::{ProcessorConfig, ProcessorPool};
use crate::pipeline::queue::BoundedQueue;
use crate::pipeline::reader::ReaderPool;
use crate::probe;
use crate::session::manager::SessionManager;
use crate::session::SessionStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Init,
    Attached,
    Running,
    Draining,
    Stopped,
}

fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Runs one full monitoring session end to end: attach, run until a stop
/// signal arrives, drain, and report a clean shutdown. Returns `Ok(())` on a
/// normal Stopped transition; any `Err` here is a `FatalInit` failure the
/// caller (`main`) converts into a nonzero process exit.
pub async fn run(config: Config) -> Result<(), CoreError> {
    let mut state = State::Init;
    config
        .validate()
        .map_err(|e| CoreError::fatal_init(e.to_string()))?;

    // Init -> Attached: open the record source(s) and, if configured,
    // relay sampling rates to the kernel map. The probe program's own
    // attach logic and sampling decision remain an external collaborator's
    // job; this process only opens what's already there.
    let sources = probe::build_sources(&config)?;
    if !config.sampling.rates.is_empty() {
        info!(
            "relaying {} sampling rate(s) to the kernel sampling map",
            config.sampling.rates.len()
        );
    }
    let attached_at = now_unix_ms();
    state = State::Attached;
    info!("state: {state:?}, attached at {attached_at}");

    let manager = Arc::new(SessionManager::new(config.storage.dir.clone()));
    tokio::fs::create_dir_all(&config.storage.dir)
        .await
        .map_err(|e| CoreError::fatal_init(format!("create storage dir: {e}")))?;
    let session_id = Uuid::new_v4().to_string();
    let origin = format!("pid:{}", std::process::id());
    let (store, writer_guard) = manager
        .create(&session_id, &config.storage.format, origin, attached_at)
        .await
        .map_err(|e| CoreError::fatal_init(format!("create session {session_id}: {e}")))?;
    let store: Arc<dyn SessionStore> = Arc::from(store);
    info!("session {session_id} created under {:?}", config.storage.dir);

    // Attached -> Running: spawn the pools.
    let queue = BoundedQueue::new(config.pipeline.queue_capacity);
    let hub = Arc::new(BroadcastHub::new());
    let depth_counter: Arc<AtomicUsize> = queue.depth_counter();
    let metrics = Metrics::new(move || depth_counter.load(Ordering::Relaxed));

    let reader_pool = ReaderPool::spawn(sources, queue.producer(), metrics.clone());
    let processor_pool = ProcessorPool::spawn(
        config.pipeline.process_workers,
        queue.consumer(),
        store.clone(),
        hub.clone(),
        metrics.clone(),
        ProcessorConfig {
            batch_size: config.pipeline.batch_size,
            flush_interval: Duration::from_millis(config.pipeline.batch_flush_interval_ms),
        },
        tokio::runtime::Handle::current(),
    );

    let (sampler_stop_tx, sampler_stop_rx) = crossbeam_channel::bounded::<()>(0);
    let sampler_metrics = metrics.clone();
    let sampler_cadence = Duration::from_millis(config.metrics.cadence_ms);
    let sampler_handle = std::thread::Builder::new()
        .name("taskscoped-metrics-sampler".to_string())
        .spawn(move || metrics::run_sampler(sampler_metrics, sampler_cadence, sampler_stop_rx))
        .expect("failed to spawn metrics sampler thread");

    let http_shutdown = Arc::new(Notify::new());
    let http_handle = if config.web.enabled {
        let addr = SocketAddr::from(([127, 0, 0, 1], config.web.port));
        let app_state = Arc::new(AppState {
            manager: manager.clone(),
            hub: hub.clone(),
            metrics: metrics.clone(),
            viewer_config_path: config.storage.dir.join("viewer_config.json"),
        });
        let shutdown_signal = http_shutdown.clone();
        info!("HTTP surface listening on http://{addr}");
        Some(tokio::spawn(async move {
            if let Err(e) = api::serve(addr, app_state, async move {
                shutdown_signal.notified().await;
            })
            .await
            {
                warn!("HTTP server error: {e}");
            }
        }))
    } else {
        None
    };

    state = State::Running;
    info!("state: {state:?}");

    let stop_signal = Arc::new(Notify::new());
    {
        let stop_signal = stop_signal.clone();
        ctrlc::set_handler(move || stop_signal.notify_one())
            .map_err(|e| CoreError::fatal_init(format!("install signal handler: {e}")))?;
    }
    stop_signal.notified().await;

    // Running -> Draining: close the ringbuffer side first, which wakes C4
    // with EOF; everything downstream drains naturally from there.
    state = State::Draining;
    info!("state: {state:?}");
    reader_pool.stop();
    tokio::task::spawn_blocking(move || reader_pool.join())
        .await
        .expect("reader pool join panicked");

    queue.close();
    tokio::task::spawn_blocking(move || processor_pool.join())
        .await
        .expect("processor pool join panicked");

    store.close().await?;
    drop(writer_guard);

    let stopped_at = now_unix_ms();
    let event_count = store.event_count();
    if let Err(e) = manager
        .finalize(&session_id, stopped_at, event_count)
        .await
    {
        warn!("failed to finalize session {session_id} metadata: {e}");
    }

    let _ = sampler_stop_tx.send(());
    tokio::task::spawn_blocking(move || sampler_handle.join())
        .await
        .expect("metrics sampler join panicked");

    if let Some(handle) = http_handle {
        http_shutdown.notify_one();
        // 5-second deadline on HTTP graceful shutdown.
        if tokio::time::timeout(Duration::from_secs(5), handle).await.is_err() {
            warn!("HTTP server graceful shutdown exceeded 5s deadline");
        }
    }

    write_metrics_file(&metrics, &config.storage.dir, config.metrics.file_suffix.as_deref())
        .await?;

    state = State::Stopped;
    info!("state: {state:?}, {event_count} events recorded in session {session_id}");
    Ok(())
}

async fn write_metrics_file(
    metrics: &Metrics,
    storage_dir: &PathBuf,
    suffix: Option<&str>,
) -> Result<(), CoreError> {
    let snapshot = metrics.final_dump();
    let timestamp = chrono::Utc::now().format("%Y%m%dT%H%M%SZ");
    let filename = match suffix {
        Some(suffix) => format!("metrics_{timestamp}_{suffix}.json"),
        None => format!("metrics_{timestamp}.json"),
    };
    let path = storage_dir.join(filename);
    let body = serde_json::to_vec_pretty(&snapshot)
        .map_err(|e| CoreError::protocol(format!("encode metrics snapshot: {e}")))?;
    tokio::fs::write(&path, body).await?;
    info!("metrics snapshot written to {path:?}");
    Ok(())
}
