//! The bounded fabric between the ring consumers and the worker pool.
//!
//! Ring consumers try-send into one shared bounded channel. A dispatcher
//! task fans envelopes out to per-worker bounded queues; a full worker
//! queue means the envelope is dropped and counted, never waited on.
//! Workers batch their queue and flush on size, on a 10 ms tick, or on
//! shutdown.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use crate::config::CaptureConfig;
use crate::dns::DnsResolver;
use crate::event::{record_ipv4, SinkEvent, TrafficEvent};
use crate::sink::EventSink;
use crate::stats::Stats;

const FLUSH_INTERVAL: Duration = Duration::from_millis(10);

/// Spawn the worker pool and the dispatcher feeding it.
pub fn spawn(
    tracker: &TaskTracker,
    token: &CancellationToken,
    config: &CaptureConfig,
    events_rx: mpsc::Receiver<TrafficEvent>,
    resolver: Arc<DnsResolver>,
    sink: Arc<dyn EventSink>,
    stats: Arc<Stats>,
) {
    let mut worker_txs = Vec::with_capacity(config.worker_count);
    for id in 0..config.worker_count {
        let (jobs_tx, jobs_rx) = mpsc::channel(config.worker_batch_size);
        worker_txs.push(jobs_tx);
        tracker.spawn(worker_loop(
            id,
            jobs_rx,
            config.worker_batch_size,
            resolver.clone(),
            sink.clone(),
            stats.clone(),
            token.clone(),
        ));
    }
    info!("started {} packet workers", config.worker_count);

    tracker.spawn(dispatch_loop(events_rx, worker_txs, stats.clone()));
}

/// Fan envelopes out round-robin. Runs until the event channel is closed
/// (all ring consumers gone), then drops the worker senders so the workers
/// drain their queues and exit.
async fn dispatch_loop(
    mut events_rx: mpsc::Receiver<TrafficEvent>,
    worker_txs: Vec<mpsc::Sender<TrafficEvent>>,
    stats: Arc<Stats>,
) {
    let mut next = 0usize;
    while let Some(envelope) = events_rx.recv().await {
        if worker_txs[next].try_send(envelope).is_err() {
            stats.worker_queue_full.fetch_add(1, Ordering::Relaxed);
            stats.packets_dropped.fetch_add(1, Ordering::Relaxed);
        }
        next = (next + 1) % worker_txs.len();
    }
    debug!("dispatcher stopped");
}

async fn worker_loop(
    id: usize,
    mut jobs_rx: mpsc::Receiver<TrafficEvent>,
    batch_size: usize,
    resolver: Arc<DnsResolver>,
    sink: Arc<dyn EventSink>,
    stats: Arc<Stats>,
    token: CancellationToken,
) {
    let mut batch: Vec<TrafficEvent> = Vec::with_capacity(batch_size);
    let mut flush_tick = tokio::time::interval(FLUSH_INTERVAL);
    flush_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                flush(&mut batch, &resolver, &*sink, &stats).await;
                break;
            }
            _ = flush_tick.tick() => {
                if !batch.is_empty() {
                    flush(&mut batch, &resolver, &*sink, &stats).await;
                }
            }
            job = jobs_rx.recv() => match job {
                Some(envelope) => {
                    batch.push(envelope);
                    if batch.len() >= batch_size {
                        flush(&mut batch, &resolver, &*sink, &stats).await;
                    }
                }
                None => {
                    flush(&mut batch, &resolver, &*sink, &stats).await;
                    break;
                }
            }
        }
    }
    debug!("worker {id} stopped");
}

/// Enrich and emit every batched envelope in reception order.
async fn flush(
    batch: &mut Vec<TrafficEvent>,
    resolver: &DnsResolver,
    sink: &dyn EventSink,
    stats: &Stats,
) {
    for envelope in batch.drain(..) {
        let record = envelope.record;
        let src_ip = record.src_ip;
        let dst_ip = record.dst_ip;
        let src_domain = resolver.resolve(record_ipv4(src_ip)).await;
        let dst_domain = resolver.resolve(record_ipv4(dst_ip)).await;
        sink.publish(&SinkEvent {
            iface: envelope.iface,
            record,
            src_domain,
            dst_domain,
        });
        stats.packets_processed.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::CollectSink;
    use std::net::SocketAddr;
    use tcwatch_common::{Record, DIR_EGRESS, PROTO_TCP, TCP_SYN};

    fn test_config(workers: usize, batch: usize) -> CaptureConfig {
        CaptureConfig {
            interface: "lo".to_string(),
            all_interfaces: false,
            loopback_filter: true,
            worker_count: workers,
            event_buffer_size: 1024,
            worker_batch_size: batch,
            dns_enabled: false,
            dns_timeout: Duration::from_millis(500),
            dns_cache_size: 16,
            dns_cache_ttl: Duration::from_secs(300),
            dns_servers: vec!["8.8.8.8:53".parse::<SocketAddr>().unwrap()],
        }
    }

    fn envelope(src_port: u16) -> TrafficEvent {
        TrafficEvent {
            iface: Arc::from("eth0"),
            record: Record {
                src_ip: 0x0101_A8C0,
                dst_ip: 0x0808_0808,
                src_port,
                dst_port: 443,
                protocol: PROTO_TCP,
                direction: DIR_EGRESS,
                tcp_flags: TCP_SYN,
            },
        }
    }

    #[tokio::test]
    async fn pool_processes_every_event() {
        let config = test_config(2, 100);
        let token = CancellationToken::new();
        let tracker = TaskTracker::new();
        let (events_tx, events_rx) = mpsc::channel(64);
        let sink = Arc::new(CollectSink::default());
        let stats = Arc::new(Stats::default());
        let resolver = Arc::new(DnsResolver::new(&config));

        spawn(
            &tracker,
            &token,
            &config,
            events_rx,
            resolver,
            sink.clone(),
            stats.clone(),
        );

        for port in 0..10u16 {
            events_tx.send(envelope(40_000 + port)).await.unwrap();
        }
        drop(events_tx);

        tracker.close();
        tracker.wait().await;

        assert_eq!(stats.packets_processed.load(Ordering::Relaxed), 10);
        let events = sink.events.lock().unwrap();
        assert_eq!(events.len(), 10);
        // DNS is disabled, so every domain is the sentinel.
        assert!(events
            .iter()
            .all(|event| event.src_domain == "-" && event.dst_domain == "-"));
    }

    #[tokio::test]
    async fn single_worker_preserves_reception_order() {
        let config = test_config(1, 100);
        let token = CancellationToken::new();
        let tracker = TaskTracker::new();
        let (events_tx, events_rx) = mpsc::channel(64);
        let sink = Arc::new(CollectSink::default());
        let stats = Arc::new(Stats::default());
        let resolver = Arc::new(DnsResolver::new(&config));

        spawn(
            &tracker,
            &token,
            &config,
            events_rx,
            resolver,
            sink.clone(),
            stats.clone(),
        );

        for port in 0..20u16 {
            events_tx.send(envelope(port)).await.unwrap();
        }
        drop(events_tx);

        tracker.close();
        tracker.wait().await;

        let events = sink.events.lock().unwrap();
        let ports: Vec<u16> = events
            .iter()
            .map(|event| {
                let src_port = event.record.src_port;
                src_port
            })
            .collect();
        assert_eq!(ports, (0..20u16).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn cancellation_flushes_and_stops_workers() {
        let config = test_config(1, 100);
        let token = CancellationToken::new();
        let tracker = TaskTracker::new();
        let (events_tx, events_rx) = mpsc::channel(64);
        let sink = Arc::new(CollectSink::default());
        let stats = Arc::new(Stats::default());
        let resolver = Arc::new(DnsResolver::new(&config));

        spawn(
            &tracker,
            &token,
            &config,
            events_rx,
            resolver,
            sink.clone(),
            stats.clone(),
        );

        for port in 0..5u16 {
            events_tx.send(envelope(port)).await.unwrap();
        }
        // Give the pipeline a moment to pull the events through.
        tokio::time::sleep(Duration::from_millis(50)).await;

        token.cancel();
        drop(events_tx);
        tracker.close();
        tracker.wait().await;

        assert_eq!(stats.packets_processed.load(Ordering::Relaxed), 5);
    }
}
