//! Link, IP and TCP header decoding.
//!
//! Just enough of each layer to recover the directed flow key, the TCP
//! sequence position and the payload bytes.  Anything that is not TCP (or
//! that this decoder does not understand) yields `None` and is skipped by
//! the assembler.

use crate::flow::FlowKey;
use crate::pcap::LinkType;
use bytes::Bytes;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_IPV6: u16 = 0x86dd;
const ETHERTYPE_VLAN: u16 = 0x8100;
const ETHERTYPE_QINQ: u16 = 0x88a8;

const TCP_FIN: u8 = 0x01;
const TCP_SYN: u8 = 0x02;
const TCP_RST: u8 = 0x04;

/// A decoded TCP segment, ready for reassembly.
#[derive(Debug, Clone)]
pub struct TcpPacket {
    pub key: FlowKey,
    pub seq: u32,
    pub syn: bool,
    pub fin: bool,
    pub rst: bool,
    pub payload: Bytes,
}

/// Decode one captured frame down to its TCP segment, if it has one.
pub fn decode_packet(link: LinkType, data: &Bytes) -> Option<TcpPacket> {
    match link {
        LinkType::Ethernet => decode_ethernet(data),
        LinkType::LinuxSll => decode_sll(data),
        LinkType::Null | LinkType::Loop => decode_null(data),
        LinkType::RawIp => decode_ip(data, 0),
        LinkType::Other(_) => None,
    }
}

fn decode_ethernet(data: &Bytes) -> Option<TcpPacket> {
    if data.len() < 14 {
        return None;
    }
    let mut off = 12;
    let mut ethertype = u16::from_be_bytes([data[off], data[off + 1]]);
    off += 2;
    // Unwrap VLAN tags (single or stacked).
    while ethertype == ETHERTYPE_VLAN || ethertype == ETHERTYPE_QINQ {
        if data.len() < off + 4 {
            return None;
        }
        ethertype = u16::from_be_bytes([data[off + 2], data[off + 3]]);
        off += 4;
    }
    match ethertype {
        ETHERTYPE_IPV4 => decode_ipv4(data, off),
        ETHERTYPE_IPV6 => decode_ipv6(data, off),
        _ => None,
    }
}

fn decode_sll(data: &Bytes) -> Option<TcpPacket> {
    if data.len() < 16 {
        return None;
    }
    let proto = u16::from_be_bytes([data[14], data[15]]);
    match proto {
        ETHERTYPE_IPV4 => decode_ipv4(data, 16),
        ETHERTYPE_IPV6 => decode_ipv6(data, 16),
        _ => None,
    }
}

/// BSD loopback: 4-byte protocol family in host byte order of the capturing
/// machine, so try both.
fn decode_null(data: &Bytes) -> Option<TcpPacket> {
    if data.len() < 4 {
        return None;
    }
    let le = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
    let be = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
    for family in [le, be] {
        match family {
            2 => return decode_ipv4(data, 4),
            24 | 28 | 30 => return decode_ipv6(data, 4),
            _ => {}
        }
    }
    None
}

/// Raw IP link type: sniff the version nibble.
fn decode_ip(data: &Bytes, off: usize) -> Option<TcpPacket> {
    match data.get(off)? >> 4 {
        4 => decode_ipv4(data, off),
        6 => decode_ipv6(data, off),
        _ => None,
    }
}

fn decode_ipv4(data: &Bytes, off: usize) -> Option<TcpPacket> {
    if data.len() < off + 20 {
        return None;
    }
    let b = &data[off..];
    if b[0] >> 4 != 4 {
        return None;
    }
    let ihl = usize::from(b[0] & 0x0f) * 4;
    if ihl < 20 || data.len() < off + ihl {
        return None;
    }
    let total_len = usize::from(u16::from_be_bytes([b[2], b[3]]));
    // Non-first fragments cannot be mapped onto the TCP stream.
    let frag = u16::from_be_bytes([b[6], b[7]]);
    if frag & 0x1fff != 0 {
        return None;
    }
    if b[9] != 6 {
        return None;
    }
    let src = IpAddr::V4(Ipv4Addr::new(b[12], b[13], b[14], b[15]));
    let dst = IpAddr::V4(Ipv4Addr::new(b[16], b[17], b[18], b[19]));
    let end = if total_len >= ihl && off + total_len <= data.len() {
        off + total_len
    } else {
        data.len()
    };
    decode_tcp(data, off + ihl, end, src, dst)
}

fn decode_ipv6(data: &Bytes, off: usize) -> Option<TcpPacket> {
    if data.len() < off + 40 {
        return None;
    }
    let b = &data[off..];
    if b[0] >> 4 != 6 {
        return None;
    }
    let payload_len = usize::from(u16::from_be_bytes([b[4], b[5]]));
    let src = IpAddr::V6(Ipv6Addr::from(<[u8; 16]>::try_from(&b[8..24]).ok()?));
    let dst = IpAddr::V6(Ipv6Addr::from(<[u8; 16]>::try_from(&b[24..40]).ok()?));
    let end = (off + 40 + payload_len).min(data.len());

    let mut next = b[6];
    let mut pos = off + 40;
    // Walk extension headers until the TCP header (bounded walk).
    for _ in 0..8 {
        match next {
            6 => return decode_tcp(data, pos, end, src, dst),
            // hop-by-hop, routing, destination options
            0 | 43 | 60 => {
                if data.len() < pos + 2 {
                    return None;
                }
                next = data[pos];
                pos += (usize::from(data[pos + 1]) + 1) * 8;
            }
            // fragment header: only offset zero is usable
            44 => {
                if data.len() < pos + 8 {
                    return None;
                }
                let fo = u16::from_be_bytes([data[pos + 2], data[pos + 3]]);
                if fo & 0xfff8 != 0 {
                    return None;
                }
                next = data[pos];
                pos += 8;
            }
            _ => return None,
        }
        if pos >= data.len() {
            return None;
        }
    }
    None
}

fn decode_tcp(
    data: &Bytes,
    off: usize,
    end: usize,
    src_ip: IpAddr,
    dst_ip: IpAddr,
) -> Option<TcpPacket> {
    let end = end.clamp(off, data.len());
    if end < off + 20 {
        return None;
    }
    let b = &data[off..];
    let src_port = u16::from_be_bytes([b[0], b[1]]);
    let dst_port = u16::from_be_bytes([b[2], b[3]]);
    let seq = u32::from_be_bytes([b[4], b[5], b[6], b[7]]);
    let data_off = usize::from(b[12] >> 4) * 4;
    if data_off < 20 || off + data_off > end {
        return None;
    }
    let flags = b[13];
    Some(TcpPacket {
        key: FlowKey::new(src_ip, src_port, dst_ip, dst_port),
        seq,
        syn: flags & TCP_SYN != 0,
        fin: flags & TCP_FIN != 0,
        rst: flags & TCP_RST != 0,
        payload: data.slice(off + data_off..end),
    })
}
