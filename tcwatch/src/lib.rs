//! Per-interface network traffic observer.
//!
//! tcwatch attaches precompiled TC classifier programs at the ingress and
//! egress hooks of one or more network devices, drains the per-CPU perf
//! rings they feed, and delivers a filtered, DNS-enriched stream of packet
//! summaries to a pluggable sink.
//!
//! Pipeline: classifier -> per-CPU perf ring -> ring consumer -> codec ->
//! filter -> bounded event channel -> worker -> DNS cache -> sink. A shared
//! cancellation token unwinds every stage, and the clsact qdisc installed
//! on each device is removed on every exit path.

pub mod capture;
pub mod config;
pub mod dispatch;
pub mod dns;
pub mod ebpf;
pub mod event;
pub mod iface;
pub mod logging;
pub mod ring;
pub mod sink;
pub mod stats;
pub mod tc;
