use std::sync::atomic::Ordering;
use std::sync::Arc;

use aya::maps::perf::{AsyncPerfEventArray, PerfBufferError};
use aya::util::online_cpus;
use aya::Ebpf;
use bytes::BytesMut;
use tcwatch_common::Record;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::config::CaptureConfig;
use crate::ebpf::MAP_EVENTS;
use crate::event::{self, DecodeError, TrafficEvent};
use crate::iface::NetInterface;
use crate::stats::Stats;

/// Pages per CPU ring. The kernel drops (and counts) samples when a ring
/// overflows, so this only needs to absorb bursts.
const PERF_PAGES: usize = 16;
/// Samples drained per read.
const READ_BATCH: usize = 64;
/// Per-sample buffer capacity: the record plus perf alignment padding.
const SAMPLE_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("map {MAP_EVENTS} missing from the classifier object")]
    MissingMap,
    #[error("failed to open the events map: {0}")]
    Map(#[from] aya::maps::MapError),
    #[error("failed to open a perf buffer: {0}")]
    Perf(#[from] PerfBufferError),
    #[error("failed to enumerate online CPUs: {0}")]
    OnlineCpus(#[source] std::io::Error),
}

/// Decode one perf sample and apply the stateless filter. `Ok(None)` means
/// the record was filtered out; decode failures surface for the caller to
/// log and skip.
fn process_sample(buf: &[u8], loopback_filter: bool) -> Result<Option<Record>, DecodeError> {
    let record = event::decode(buf)?;
    if loopback_filter && event::should_drop(&record) {
        return Ok(None);
    }
    Ok(Some(record))
}

/// Add the kernel's lost-sample count for one read to the drop counter.
fn account_lost(stats: &Stats, lost: usize) {
    if lost > 0 {
        stats.packets_dropped.fetch_add(lost as u64, Ordering::Relaxed);
    }
}

/// Non-blocking submit: a full or closed channel drops the envelope and
/// counts it. The consumer never waits on downstream pressure.
fn submit(events_tx: &mpsc::Sender<TrafficEvent>, envelope: TrafficEvent, stats: &Stats) {
    if events_tx.try_send(envelope).is_err() {
        stats.packets_dropped.fetch_add(1, Ordering::Relaxed);
    }
}

/// Spawn the ring consumers for one interface: one task per online CPU,
/// each draining that CPU's perf ring of this interface's events map.
pub fn spawn_consumers(
    tracker: &TaskTracker,
    token: &CancellationToken,
    bpf: &mut Ebpf,
    iface: &NetInterface,
    config: &CaptureConfig,
    events_tx: mpsc::Sender<TrafficEvent>,
    stats: Arc<Stats>,
) -> Result<(), ConsumerError> {
    let map = bpf.take_map(MAP_EVENTS).ok_or(ConsumerError::MissingMap)?;
    let mut perf = AsyncPerfEventArray::try_from(map)?;
    let cpus = online_cpus().map_err(|(_, err)| ConsumerError::OnlineCpus(err))?;

    let iface_name: Arc<str> = Arc::from(iface.name.as_str());
    let loopback_filter = config.loopback_filter;

    for cpu_id in cpus {
        let mut ring = perf.open(cpu_id, Some(PERF_PAGES))?;
        let token = token.clone();
        let events_tx = events_tx.clone();
        let stats = stats.clone();
        let iface_name = iface_name.clone();

        tracker.spawn(async move {
            let mut buffers = (0..READ_BATCH)
                .map(|_| BytesMut::with_capacity(SAMPLE_CAPACITY))
                .collect::<Vec<_>>();

            loop {
                let events = tokio::select! {
                    _ = token.cancelled() => break,
                    result = ring.read_events(&mut buffers) => match result {
                        Ok(events) => events,
                        Err(err) => {
                            if token.is_cancelled() {
                                break;
                            }
                            warn!("perf read error on {iface_name} (cpu {cpu_id}): {err}");
                            continue;
                        }
                    },
                };

                if events.lost > 0 {
                    warn!("lost {} samples on {iface_name}", events.lost);
                    account_lost(&stats, events.lost);
                }

                for buffer in buffers.iter_mut().take(events.read) {
                    match process_sample(buffer, loopback_filter) {
                        Ok(Some(record)) => submit(
                            &events_tx,
                            TrafficEvent {
                                iface: iface_name.clone(),
                                record,
                            },
                            &stats,
                        ),
                        Ok(None) => {}
                        Err(err) => warn!("decode error on {iface_name}: {err}"),
                    }
                }
            }

            debug!("ring consumer for {iface_name} (cpu {cpu_id}) stopped");
        });
    }

    Ok(())
}
