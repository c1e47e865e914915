//! The kernel-probe-facing collaborator boundary (C1's consumer side).
//!
//! Everything about *which* runtime symbols get probed and how sampling is
//! decided lives outside this crate — that is the out-of-scope kernel probe
//! program and its per-symbol attach logic. What lives here is just the
//! consumer side of the ringbuffer handle (`RecordSource`, defined alongside
//! the reader pool in [`crate::pipeline::reader`] since the two are tightly
//! coupled) plus the glue that opens a precompiled probe object and the
//! synthetic source used when no such object is available.
//!
//! Grounded on `main.rs::read_bpf_bytes`/`EbpfLoader` usage in `cognitod`,
//! generalized from a single perf buffer to one `RingBuf` per online CPU so
//! the per-CPU production-order invariant holds by construction: each CPU's
//! ring buffer has exactly one reader.

use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::error::CoreError;
use crate::pipeline::reader::RecordSource;

pub use crate::pipeline::reader::{QueuedEvent, ReadOutcome};

#[cfg(feature = "linux-probe")]
pub use crate::pipeline::reader::AyaRingbufferSource;
pub use crate::pipeline::reader::SyntheticSource;

const ENV_PROBE_OBJECT: &str = "TASKSCOPED_PROBE_OBJECT";
const DEFAULT_PROBE_OBJECT: &str = "/usr/lib/taskscoped/probe.o";

pub fn probe_object_path() -> PathBuf {
    std::env::var(ENV_PROBE_OBJECT)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_PROBE_OBJECT))
}

/// Opens one `RingBuf` per online CPU from a precompiled probe object.
/// Per-symbol attach is the external collaborator's job; this only opens
/// the already-populated ring buffer maps, named `EVENTS_<cpu>` by
/// convention with the probe program.
#[cfg(feature = "linux-probe")]
pub fn open_ringbuffers(object_path: &Path) -> Result<Vec<Box<dyn RecordSource>>, CoreError> {
    let bytes = std::fs::read(object_path)
        .map_err(|e| CoreError::fatal_init(format!("read probe object {object_path:?}: {e}")))?;
    let mut ebpf = aya::EbpfLoader::new()
        .load(&bytes)
        .map_err(|e| CoreError::fatal_init(format!("load probe object: {e}")))?;

    // Kept alive for the process lifetime: dropping it stops forwarding the
    // probe's own internal log records to this process's `log` backend.
    match aya_log::EbpfLogger::init(&mut ebpf) {
        Ok(logger) => {
            log::info!("BPF logger initialized");
            std::mem::forget(logger);
        }
        Err(e) => log::warn!("BPF logger not active: {e}"),
    }

    let cpus = aya::util::online_cpus()
        .map_err(|(msg, e)| CoreError::fatal_init(format!("online_cpus {msg}: {e}")))?;

    let mut sources: Vec<Box<dyn RecordSource>> = Vec::with_capacity(cpus.len());
    for cpu in cpus {
        let map_name = format!("EVENTS_{cpu}");
        let map = ebpf
            .take_map(&map_name)
            .ok_or_else(|| CoreError::fatal_init(format!("missing ring buffer map {map_name}")))?;
        let ring = aya::maps::ring_buf::RingBuf::try_from(map)
            .map_err(|e| CoreError::fatal_init(format!("open ring buffer {map_name}: {e}")))?;
        sources.push(Box::new(AyaRingbufferSource::new(ring)));
    }
    Ok(sources)
}

/// Builds one `RecordSource` per configured reader worker. Prefers a real
/// probe object when the `linux-probe` feature is compiled in and the
/// object is present on disk; otherwise falls back to the synthetic
/// generator, which is also what every test in this crate uses.
pub fn build_sources(config: &Config) -> Result<Vec<Box<dyn RecordSource>>, CoreError> {
    let object_path = probe_object_path();

    #[cfg(feature = "linux-probe")]
    {
        if object_path.exists() {
            return open_ringbuffers(&object_path);
        }
    }

    let workers = config.pipeline.read_workers;
    Ok((0..workers)
        .map(|_| -> Box<dyn RecordSource> { Box::new(crate::demo::generator()) })
        .collect())
}
