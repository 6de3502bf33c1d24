use std::net::Ipv4Addr;
use std::sync::Arc;

use thiserror::Error;

use tcwatch_common::{
    Record, DIR_EGRESS, LOOPBACK_ADDR, PROTO_ICMP, PROTO_TCP, PROTO_UDP, TCP_ACK, TCP_CWR,
    TCP_ECE, TCP_FIN, TCP_PSH, TCP_RST, TCP_SYN, TCP_URG,
};

/// A decoded record tagged with the interface it was captured on.
///
/// Envelopes are immutable once the ring consumer produces them.
#[derive(Debug, Clone)]
pub struct TrafficEvent {
    pub iface: Arc<str>,
    pub record: Record,
}

/// An envelope enriched by a worker, ready for presentation.
#[derive(Debug, Clone)]
pub struct SinkEvent {
    pub iface: Arc<str>,
    pub record: Record,
    pub src_domain: String,
    pub dst_domain: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("record truncated: got {0} bytes, need {len}", len = Record::LEN)]
    Truncated(usize),
}

/// Decode a raw perf sample into a [`Record`].
///
/// The sample must carry at least [`Record::LEN`] little-endian bytes;
/// trailing perf padding is ignored.
pub fn decode(buf: &[u8]) -> Result<Record, DecodeError> {
    if buf.len() < Record::LEN {
        return Err(DecodeError::Truncated(buf.len()));
    }
    Ok(Record {
        src_ip: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
        dst_ip: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
        src_port: u16::from_le_bytes([buf[8], buf[9]]),
        dst_port: u16::from_le_bytes([buf[10], buf[11]]),
        protocol: buf[12],
        direction: buf[13],
        tcp_flags: buf[14],
    })
}

/// Encode a [`Record`] into its wire form. The inverse of [`decode`].
pub fn encode(record: &Record) -> [u8; Record::LEN] {
    let Record {
        src_ip,
        dst_ip,
        src_port,
        dst_port,
        protocol,
        direction,
        tcp_flags,
    } = *record;

    let mut buf = [0u8; Record::LEN];
    buf[0..4].copy_from_slice(&src_ip.to_le_bytes());
    buf[4..8].copy_from_slice(&dst_ip.to_le_bytes());
    buf[8..10].copy_from_slice(&src_port.to_le_bytes());
    buf[10..12].copy_from_slice(&dst_port.to_le_bytes());
    buf[12] = protocol;
    buf[13] = direction;
    buf[14] = tcp_flags;
    buf
}

/// Convert a record address (low byte first octet) to an [`Ipv4Addr`].
pub fn record_ipv4(addr: u32) -> Ipv4Addr {
    let [a, b, c, d] = addr.to_le_bytes();
    Ipv4Addr::new(a, b, c, d)
}

pub fn is_localhost(addr: u32) -> bool {
    addr == LOOPBACK_ADDR
}

/// Stateless drop predicate applied by the ring consumer before dispatch.
pub fn should_drop(record: &Record) -> bool {
    let src_ip = record.src_ip;
    is_localhost(src_ip)
}

pub fn direction_label(direction: u8) -> &'static str {
    if direction == DIR_EGRESS {
        "Egress"
    } else {
        "Ingress"
    }
}

const FLAG_NAMES: [(u8, &str); 8] = [
    (TCP_FIN, "FIN"),
    (TCP_SYN, "SYN"),
    (TCP_RST, "RST"),
    (TCP_PSH, "PSH"),
    (TCP_ACK, "ACK"),
    (TCP_URG, "URG"),
    (TCP_ECE, "ECE"),
    (TCP_CWR, "CWR"),
];

/// Render a TCP flag bitmask as `0x<hex>(<names>)`, names comma-joined in
/// FIN,SYN,RST,PSH,ACK,URG,ECE,CWR order. Zero renders as `NONE`.
pub fn tcp_flags_to_string(flags: u8) -> String {
    if flags == 0 {
        return "NONE".to_string();
    }
    let names: Vec<&str> = FLAG_NAMES
        .iter()
        .filter(|(mask, _)| flags & mask != 0)
        .map(|(_, name)| *name)
        .collect();
    format!("0x{flags:02x}({})", names.join(","))
}

/// Format one enriched record as a single output line.
pub fn format_line(event: &SinkEvent) -> String {
    let Record {
        src_ip,
        dst_ip,
        src_port,
        dst_port,
        protocol,
        direction,
        tcp_flags,
    } = event.record;

    let dir = direction_label(direction);
    let src = record_ipv4(src_ip);
    let dst = record_ipv4(dst_ip);
    let flags = tcp_flags_to_string(tcp_flags);
    let (src_domain, dst_domain) = (&event.src_domain, &event.dst_domain);
    let iface = &event.iface;

    match protocol {
        PROTO_TCP => format!(
            "{dir} TCP: src={src}({src_domain}):{src_port} -> dst={dst}({dst_domain}):{dst_port} | flags={flags} | iface={iface}"
        ),
        PROTO_UDP => format!(
            "{dir} UDP: src={src}({src_domain}):{src_port} -> dst={dst}({dst_domain}):{dst_port} | flags={flags} | iface={iface}"
        ),
        PROTO_ICMP => format!(
            "{dir} ICMP: src={src}({src_domain}) -> dst={dst}({dst_domain}) | flags={flags} | iface={iface}"
        ),
        other => format!(
            "{dir} PROTO_{other}: src={src}({src_domain}) -> dst={dst}({dst_domain}) | flags={flags} | iface={iface}"
        ),
    }
}
