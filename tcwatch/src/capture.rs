//! Capture supervisor: wires the pipeline together, blocks on a
//! termination signal, and unwinds everything in order.
//!
//! Shutdown discipline: cancel the shared token, delete the kernel hook
//! state, then wait for every task with a bounded join. The qdisc teardown
//! runs on every exit path, including a partial attach.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use aya::Ebpf;
use thiserror::Error;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::config::CaptureConfig;
use crate::dispatch;
use crate::dns::{self, DnsResolver};
use crate::ebpf;
use crate::event::TrafficEvent;
use crate::iface::{InterfaceManager, NetInterface};
use crate::ring::{self, ConsumerError};
use crate::sink::EventSink;
use crate::stats::{self, Stats};
use crate::tc::{AttachError, AttachedHooks, HookAttacher};

/// Bound on waiting for tasks to finish after cancellation.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
enum SetupError {
    #[error(transparent)]
    Attach(#[from] AttachError),
    #[error(transparent)]
    Consumer(#[from] ConsumerError),
}

/// Run the capture pipeline until an interrupt or termination signal.
pub async fn run(config: CaptureConfig, sink: Arc<dyn EventSink>) -> anyhow::Result<()> {
    ebpf::raise_memlock_limit()?;
    let object_path = ebpf::object_path()?;

    let config = Arc::new(config);
    let stats = Arc::new(Stats::default());
    let resolver = Arc::new(DnsResolver::new(&config));
    if resolver.enabled() {
        info!("reverse DNS resolution enabled");
    }

    let token = CancellationToken::new();
    let tracker = TaskTracker::new();

    let (events_tx, events_rx) = mpsc::channel::<TrafficEvent>(config.event_buffer_size);
    dispatch::spawn(
        &tracker,
        &token,
        &config,
        events_rx,
        resolver.clone(),
        sink,
        stats.clone(),
    );
    stats::spawn_reporter(&tracker, &token, stats.clone());
    if resolver.enabled() {
        dns::spawn_sweeper(resolver.clone(), &tracker, token.clone());
    }

    let manager = InterfaceManager::new().context("failed to open the netlink connection")?;
    let interfaces = monitored_interfaces(&manager, &config).await?;
    info!(
        "monitoring interfaces: {:?}",
        interfaces
            .iter()
            .map(|iface| iface.name.as_str())
            .collect::<Vec<_>>()
    );

    // A load failure here means the artifact itself is unusable, which is
    // fatal; later per-interface failures only skip that interface.
    let mut preloaded = Some(
        ebpf::load_classifier(&object_path)
            .with_context(|| format!("failed to load {}", object_path.display()))?,
    );

    let attacher = HookAttacher::new(manager.handle());
    let mut attached: Vec<AttachedHooks> = Vec::new();
    // The Ebpf handles own the loaded programs and maps; keep them alive
    // for the lifetime of the capture.
    let mut loaded: Vec<Ebpf> = Vec::new();

    for iface in &interfaces {
        let bpf = match preloaded.take() {
            Some(bpf) => bpf,
            None => match ebpf::load_classifier(&object_path) {
                Ok(bpf) => bpf,
                Err(err) => {
                    warn!("skipping {}: {err}", iface.name);
                    continue;
                }
            },
        };
        match setup_interface(
            bpf,
            &attacher,
            iface,
            &config,
            &tracker,
            &token,
            events_tx.clone(),
            stats.clone(),
        )
        .await
        {
            Ok((bpf, hooks)) => {
                info!("capture started on {}", iface.name);
                loaded.push(bpf);
                attached.push(hooks);
            }
            Err(err) => warn!("skipping {}: {err}", iface.name),
        }
    }
    // Ring consumers hold their own sender clones; dropping this one lets
    // the channel close once every consumer has exited.
    drop(events_tx);

    wait_for_signal().await?;
    info!("shutting down");
    token.cancel();

    for hooks in attached {
        hooks.teardown().await;
    }

    tracker.close();
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, tracker.wait())
        .await
        .is_err()
    {
        warn!("timeout waiting for tasks to finish");
    }
    drop(loaded);

    info!("shutdown complete");
    Ok(())
}

async fn monitored_interfaces(
    manager: &InterfaceManager,
    config: &CaptureConfig,
) -> anyhow::Result<Vec<NetInterface>> {
    if config.all_interfaces {
        let interfaces = manager
            .up_interfaces()
            .await
            .context("failed to enumerate interfaces")?;
        if interfaces.is_empty() {
            warn!("no interfaces are up");
        }
        return Ok(interfaces);
    }

    match manager.resolve(&config.interface).await {
        Ok(iface) => Ok(vec![iface]),
        Err(err) => {
            warn!("skipping interface {}: {err}", config.interface);
            Ok(Vec::new())
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn setup_interface(
    mut bpf: Ebpf,
    attacher: &HookAttacher,
    iface: &NetInterface,
    config: &CaptureConfig,
    tracker: &TaskTracker,
    token: &CancellationToken,
    events_tx: mpsc::Sender<TrafficEvent>,
    stats: Arc<Stats>,
) -> Result<(Ebpf, AttachedHooks), SetupError> {
    let hooks = attacher.attach(&mut bpf, iface).await?;
    if let Err(err) = ring::spawn_consumers(tracker, token, &mut bpf, iface, config, events_tx, stats)
    {
        hooks.teardown().await;
        return Err(err.into());
    }
    Ok((bpf, hooks))
}

async fn wait_for_signal() -> std::io::Result<()> {
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = terminate.recv() => {}
    }
    Ok(())
}
