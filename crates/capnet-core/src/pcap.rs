//! pcap and pcapng file reading.
//!
//! Both container formats are parsed from an in-memory buffer; offline
//! captures are small enough that streaming parse buys nothing.  The format
//! is sniffed from the first four bytes.
//!
//! pcapng support covers the blocks real captures contain: Section Header,
//! Interface Description (with `if_tsresol`), Enhanced Packet and Simple
//! Packet.  Every other block type is skipped.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::path::Path;

const PCAP_MAGIC_USEC: u32 = 0xa1b2_c3d4;
const PCAP_MAGIC_USEC_SWAPPED: u32 = 0xd4c3_b2a1;
const PCAP_MAGIC_NSEC: u32 = 0xa1b2_3c4d;
const PCAP_MAGIC_NSEC_SWAPPED: u32 = 0x4d3c_b2a1;
const PCAPNG_SHB: u32 = 0x0a0d_0d0a;
const PCAPNG_BYTE_ORDER: u32 = 0x1a2b_3c4d;

const BLOCK_INTERFACE: u32 = 0x0000_0001;
const BLOCK_SIMPLE_PACKET: u32 = 0x0000_0003;
const BLOCK_ENHANCED_PACKET: u32 = 0x0000_0006;

const OPT_END: u16 = 0;
const OPT_IF_TSRESOL: u16 = 9;

#[derive(Debug, thiserror::Error)]
pub enum PcapError {
    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("not a capture file (magic {0:#010x})")]
    UnknownMagic(u32),
    #[error("truncated capture file")]
    Truncated,
    #[error("invalid capture file: {0}")]
    Invalid(&'static str),
}

/// Link-layer type from the capture header, per the tcpdump registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    Null,
    Ethernet,
    RawIp,
    Loop,
    LinuxSll,
    Other(u32),
}

impl From<u32> for LinkType {
    fn from(v: u32) -> LinkType {
        match v {
            0 => LinkType::Null,
            1 => LinkType::Ethernet,
            12 | 101 => LinkType::RawIp,
            108 => LinkType::Loop,
            113 => LinkType::LinuxSll,
            other => LinkType::Other(other),
        }
    }
}

/// One captured frame, still carrying its link-layer framing.
#[derive(Debug, Clone)]
pub struct RawPacket {
    pub link: LinkType,
    pub ts: DateTime<Utc>,
    pub data: Bytes,
}

// ---------------------------------------------------------------------------
// Byte cursor
// ---------------------------------------------------------------------------

/// Bounds-checked cursor with switchable endianness (pcapng sections choose
/// their own byte order).
struct Cursor {
    data: Bytes,
    pos: usize,
    big_endian: bool,
}

impl Cursor {
    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn need(&self, n: usize) -> Result<(), PcapError> {
        if self.remaining() < n {
            Err(PcapError::Truncated)
        } else {
            Ok(())
        }
    }

    fn u16(&mut self) -> Result<u16, PcapError> {
        self.need(2)?;
        let b = [self.data[self.pos], self.data[self.pos + 1]];
        self.pos += 2;
        Ok(if self.big_endian {
            u16::from_be_bytes(b)
        } else {
            u16::from_le_bytes(b)
        })
    }

    fn u32(&mut self) -> Result<u32, PcapError> {
        self.need(4)?;
        let b = [
            self.data[self.pos],
            self.data[self.pos + 1],
            self.data[self.pos + 2],
            self.data[self.pos + 3],
        ];
        self.pos += 4;
        Ok(if self.big_endian {
            u32::from_be_bytes(b)
        } else {
            u32::from_le_bytes(b)
        })
    }

    fn take(&mut self, n: usize) -> Result<Bytes, PcapError> {
        self.need(n)?;
        let out = self.data.slice(self.pos..self.pos + n);
        self.pos += n;
        Ok(out)
    }

    fn skip(&mut self, n: usize) -> Result<(), PcapError> {
        self.need(n)?;
        self.pos += n;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// CaptureReader
// ---------------------------------------------------------------------------

/// Iterator-style reader over the packets of one capture file.
pub struct CaptureReader {
    cur: Cursor,
    format: Format,
}

enum Format {
    Pcap {
        nanos: bool,
        link: LinkType,
    },
    Pcapng {
        interfaces: Vec<Interface>,
    },
}

struct Interface {
    link: LinkType,
    /// Timestamp ticks per second (pcapng `if_tsresol`, default 1 µs).
    ticks_per_sec: u64,
}

impl CaptureReader {
    pub fn open(path: &Path) -> Result<CaptureReader, PcapError> {
        CaptureReader::from_bytes(std::fs::read(path)?.into())
    }

    pub fn from_bytes(data: Bytes) -> Result<CaptureReader, PcapError> {
        if data.len() < 4 {
            return Err(PcapError::Truncated);
        }
        let magic = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        let mut cur = Cursor {
            data,
            pos: 0,
            big_endian: false,
        };
        match magic {
            PCAP_MAGIC_USEC | PCAP_MAGIC_NSEC => {
                let format = read_pcap_header(&mut cur, magic == PCAP_MAGIC_NSEC)?;
                Ok(CaptureReader { cur, format })
            }
            PCAP_MAGIC_USEC_SWAPPED | PCAP_MAGIC_NSEC_SWAPPED => {
                cur.big_endian = true;
                let format = read_pcap_header(&mut cur, magic == PCAP_MAGIC_NSEC_SWAPPED)?;
                Ok(CaptureReader { cur, format })
            }
            PCAPNG_SHB => Ok(CaptureReader {
                cur,
                format: Format::Pcapng {
                    interfaces: Vec::new(),
                },
            }),
            other => Err(PcapError::UnknownMagic(other)),
        }
    }

    /// The next packet, or `None` at end of file.
    pub fn next_packet(&mut self) -> Result<Option<RawPacket>, PcapError> {
        match &mut self.format {
            Format::Pcap { nanos, link } => next_pcap_packet(&mut self.cur, *nanos, *link),
            Format::Pcapng { interfaces } => next_pcapng_packet(&mut self.cur, interfaces),
        }
    }
}

fn read_pcap_header(cur: &mut Cursor, nanos: bool) -> Result<Format, PcapError> {
    cur.skip(4)?; // magic
    let _major = cur.u16()?;
    let _minor = cur.u16()?;
    cur.skip(8)?; // thiszone + sigfigs
    let _snaplen = cur.u32()?;
    let link = LinkType::from(cur.u32()? & 0x0fff_ffff);
    Ok(Format::Pcap { nanos, link })
}

fn next_pcap_packet(
    cur: &mut Cursor,
    nanos: bool,
    link: LinkType,
) -> Result<Option<RawPacket>, PcapError> {
    if cur.remaining() == 0 {
        return Ok(None);
    }
    let sec = cur.u32()?;
    let frac = cur.u32()?;
    let incl_len = cur.u32()? as usize;
    let _orig_len = cur.u32()?;
    let data = cur.take(incl_len)?;
    let nsec = if nanos { frac } else { frac.saturating_mul(1000) };
    let ts = timestamp(i64::from(sec), nsec);
    Ok(Some(RawPacket { link, ts, data }))
}

fn next_pcapng_packet(
    cur: &mut Cursor,
    interfaces: &mut Vec<Interface>,
) -> Result<Option<RawPacket>, PcapError> {
    loop {
        if cur.remaining() == 0 {
            return Ok(None);
        }
        cur.need(8)?;
        let block_start = cur.pos;
        let block_type = cur.u32()?;

        if block_type == PCAPNG_SHB {
            // A new section resets the interface table and may flip the
            // byte order; the byte-order magic sits after the length field.
            cur.need(8)?;
            let magic_bytes = [
                cur.data[cur.pos + 4],
                cur.data[cur.pos + 5],
                cur.data[cur.pos + 6],
                cur.data[cur.pos + 7],
            ];
            if u32::from_le_bytes(magic_bytes) == PCAPNG_BYTE_ORDER {
                cur.big_endian = false;
            } else if u32::from_be_bytes(magic_bytes) == PCAPNG_BYTE_ORDER {
                cur.big_endian = true;
            } else {
                return Err(PcapError::Invalid("bad pcapng byte-order magic"));
            }
            interfaces.clear();
        }

        let total_len = cur.u32()? as usize;
        if total_len < 12 || total_len % 4 != 0 {
            return Err(PcapError::Invalid("bad pcapng block length"));
        }
        let block_end = block_start + total_len;
        if block_end > cur.data.len() {
            return Err(PcapError::Truncated);
        }

        match block_type {
            BLOCK_INTERFACE => {
                let link = LinkType::from(u32::from(cur.u16()?));
                cur.skip(2)?; // reserved
                let _snaplen = cur.u32()?;
                let ticks_per_sec = read_tsresol(cur, block_end)?;
                interfaces.push(Interface {
                    link,
                    ticks_per_sec,
                });
            }
            BLOCK_ENHANCED_PACKET => {
                let iface = cur.u32()? as usize;
                let ts_high = cur.u32()?;
                let ts_low = cur.u32()?;
                let caplen = cur.u32()? as usize;
                let _origlen = cur.u32()?;
                let data = cur.take(caplen)?;
                cur.pos = block_end;
                let Some(intf) = interfaces.get(iface) else {
                    tracing::debug!(iface, "packet references unknown interface, skipping");
                    continue;
                };
                let ticks = (u64::from(ts_high) << 32) | u64::from(ts_low);
                let ts = ticks_to_timestamp(ticks, intf.ticks_per_sec);
                return Ok(Some(RawPacket {
                    link: intf.link,
                    ts,
                    data,
                }));
            }
            BLOCK_SIMPLE_PACKET => {
                let origlen = cur.u32()? as usize;
                let caplen = origlen.min((block_end - cur.pos).saturating_sub(4));
                let data = cur.take(caplen)?;
                cur.pos = block_end;
                let Some(intf) = interfaces.first() else {
                    continue;
                };
                // Simple Packet Blocks carry no timestamp.
                return Ok(Some(RawPacket {
                    link: intf.link,
                    ts: DateTime::UNIX_EPOCH,
                    data,
                }));
            }
            _ => {
                cur.pos = block_end;
            }
        }
        cur.pos = block_end;
    }
}

/// Walk interface options looking for `if_tsresol`; positions the cursor is
/// left at are irrelevant because the caller jumps to the block end.
fn read_tsresol(cur: &mut Cursor, block_end: usize) -> Result<u64, PcapError> {
    let options_end = block_end.saturating_sub(4);
    while cur.pos + 4 <= options_end {
        let code = cur.u16()?;
        let len = cur.u16()? as usize;
        if code == OPT_END {
            break;
        }
        let padded = len.div_ceil(4) * 4;
        if cur.pos + padded > options_end {
            break;
        }
        if code == OPT_IF_TSRESOL && len >= 1 {
            let v = cur.data[cur.pos];
            let ticks = if v & 0x80 != 0 {
                2u64.saturating_pow(u32::from(v & 0x7f))
            } else {
                10u64.saturating_pow(u32::from(v))
            };
            return Ok(ticks.max(1));
        }
        cur.skip(padded)?;
    }
    Ok(1_000_000)
}

fn ticks_to_timestamp(ticks: u64, ticks_per_sec: u64) -> DateTime<Utc> {
    let sec = ticks / ticks_per_sec;
    let frac = ticks % ticks_per_sec;
    let nsec = (u128::from(frac) * 1_000_000_000 / u128::from(ticks_per_sec)) as u32;
    timestamp(sec as i64, nsec)
}

fn timestamp(sec: i64, nsec: u32) -> DateTime<Utc> {
    DateTime::from_timestamp(sec, nsec).unwrap_or(DateTime::UNIX_EPOCH)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classic_pcap(records: &[(u32, u32, &[u8])], nanos: bool, big_endian: bool) -> Vec<u8> {
        let magic: u32 = if nanos { PCAP_MAGIC_NSEC } else { PCAP_MAGIC_USEC };
        let put32 = |out: &mut Vec<u8>, v: u32| {
            if big_endian {
                out.extend_from_slice(&v.to_be_bytes());
            } else {
                out.extend_from_slice(&v.to_le_bytes());
            }
        };
        let put16 = |out: &mut Vec<u8>, v: u16| {
            if big_endian {
                out.extend_from_slice(&v.to_be_bytes());
            } else {
                out.extend_from_slice(&v.to_le_bytes());
            }
        };
        let mut out = Vec::new();
        put32(&mut out, magic);
        put16(&mut out, 2);
        put16(&mut out, 4);
        put32(&mut out, 0);
        put32(&mut out, 0);
        put32(&mut out, 65535);
        put32(&mut out, 1); // Ethernet
        for (sec, frac, data) in records {
            put32(&mut out, *sec);
            put32(&mut out, *frac);
            put32(&mut out, data.len() as u32);
            put32(&mut out, data.len() as u32);
            out.extend_from_slice(data);
        }
        out
    }

    #[test]
    fn classic_pcap_microseconds() {
        let bytes = classic_pcap(&[(100, 250_000, b"abcd")], false, false);
        let mut r = CaptureReader::from_bytes(bytes.into()).expect("valid header");
        let pkt = r.next_packet().expect("read ok").expect("one packet");
        assert_eq!(pkt.link, LinkType::Ethernet);
        assert_eq!(&pkt.data[..], b"abcd");
        assert_eq!(pkt.ts.timestamp(), 100);
        assert_eq!(pkt.ts.timestamp_subsec_millis(), 250);
        assert!(r.next_packet().expect("read ok").is_none());
    }

    #[test]
    fn classic_pcap_big_endian_nanoseconds() {
        let bytes = classic_pcap(&[(7, 123_456_789, b"xy")], true, true);
        let mut r = CaptureReader::from_bytes(bytes.into()).expect("valid header");
        let pkt = r.next_packet().expect("read ok").expect("one packet");
        assert_eq!(pkt.ts.timestamp(), 7);
        assert_eq!(pkt.ts.timestamp_subsec_nanos(), 123_456_789);
    }

    #[test]
    fn unknown_magic_is_rejected() {
        let err = CaptureReader::from_bytes(vec![0xde, 0xad, 0xbe, 0xef, 0, 0].into());
        assert!(matches!(err, Err(PcapError::UnknownMagic(_))));
    }

    #[test]
    fn truncated_record_is_an_error() {
        let mut bytes = classic_pcap(&[(1, 0, b"abcdef")], false, false);
        bytes.truncate(bytes.len() - 3);
        let mut r = CaptureReader::from_bytes(bytes.into()).expect("valid header");
        assert!(matches!(r.next_packet(), Err(PcapError::Truncated)));
    }

    fn png_block(block_type: u32, body: &[u8]) -> Vec<u8> {
        let total = 12 + body.len().div_ceil(4) * 4;
        let mut out = Vec::new();
        out.extend_from_slice(&block_type.to_le_bytes());
        out.extend_from_slice(&(total as u32).to_le_bytes());
        out.extend_from_slice(body);
        out.resize(out.len() + (total - 12 - body.len()), 0);
        out.extend_from_slice(&(total as u32).to_le_bytes());
        out
    }

    fn pcapng_blocks() -> (Vec<u8>, Vec<u8>, Vec<u8>) {
        let mut shb_body = Vec::new();
        shb_body.extend_from_slice(&PCAPNG_BYTE_ORDER.to_le_bytes());
        shb_body.extend_from_slice(&1u16.to_le_bytes());
        shb_body.extend_from_slice(&0u16.to_le_bytes());
        shb_body.extend_from_slice(&u64::MAX.to_le_bytes()); // section length unknown

        let mut idb_body = Vec::new();
        idb_body.extend_from_slice(&1u16.to_le_bytes()); // Ethernet
        idb_body.extend_from_slice(&0u16.to_le_bytes());
        idb_body.extend_from_slice(&65535u32.to_le_bytes());

        // 1 µs ticks, ts = 5.000001s
        let ticks: u64 = 5_000_001;
        let mut epb_body = Vec::new();
        epb_body.extend_from_slice(&0u32.to_le_bytes());
        epb_body.extend_from_slice(&((ticks >> 32) as u32).to_le_bytes());
        epb_body.extend_from_slice(&((ticks & 0xffff_ffff) as u32).to_le_bytes());
        epb_body.extend_from_slice(&3u32.to_le_bytes());
        epb_body.extend_from_slice(&3u32.to_le_bytes());
        epb_body.extend_from_slice(b"pkt");

        (
            png_block(PCAPNG_SHB, &shb_body),
            png_block(BLOCK_INTERFACE, &idb_body),
            png_block(BLOCK_ENHANCED_PACKET, &epb_body),
        )
    }

    fn pcapng_with_one_packet() -> Vec<u8> {
        let (shb, idb, epb) = pcapng_blocks();
        [shb, idb, epb].concat()
    }

    #[test]
    fn pcapng_enhanced_packet() {
        let mut r = CaptureReader::from_bytes(pcapng_with_one_packet().into()).expect("valid");
        let pkt = r.next_packet().expect("read ok").expect("one packet");
        assert_eq!(pkt.link, LinkType::Ethernet);
        assert_eq!(&pkt.data[..], b"pkt");
        assert_eq!(pkt.ts.timestamp(), 5);
        assert_eq!(pkt.ts.timestamp_subsec_nanos(), 1000);
        assert!(r.next_packet().expect("read ok").is_none());
    }

    #[test]
    fn pcapng_skips_unknown_blocks() {
        let (shb, idb, epb) = pcapng_blocks();
        let unknown = png_block(0x0000_000a, &[1, 2, 3, 4]);
        let bytes = [shb, idb, unknown, epb].concat();
        let mut r = CaptureReader::from_bytes(bytes.into()).expect("valid");
        let pkt = r.next_packet().expect("read ok").expect("one packet");
        assert_eq!(&pkt.data[..], b"pkt");
    }
}
