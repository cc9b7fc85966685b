//! Byte-stream traits and the readers that feed the decoders.
//!
//! Everything downstream of reassembly consumes bytes through [`ByteStream`];
//! the speculative decoders additionally need wire timestamps, which
//! [`WireSource`] exposes and [`TimeCaptureReader`] accumulates per message.

use capnet_core::Segment;
use chrono::{DateTime, Utc};
use std::io;
use tokio::sync::mpsc;

/// A forward-only source of bytes.  `Ok(0)` means end of stream.
#[allow(async_fn_in_trait)]
pub trait ByteStream {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// A byte source that knows when its most recent bytes crossed the wire.
pub trait WireSource: ByteStream {
    /// Wire timestamp of the batch the last `read` drew from, if any.
    fn seen(&self) -> Option<DateTime<Utc>>;
}

/// Read until EOF, appending to `out`.
pub async fn read_to_end<S: ByteStream>(src: &mut S, out: &mut Vec<u8>) -> io::Result<usize> {
    let mut buf = [0u8; 4096];
    let mut total = 0;
    loop {
        let n = src.read(&mut buf).await?;
        if n == 0 {
            return Ok(total);
        }
        out.extend_from_slice(&buf[..n]);
        total += n;
    }
}

// ---------------------------------------------------------------------------
// FlowReader
// ---------------------------------------------------------------------------

/// Channel-backed reader over one reassembled flow direction.
pub struct FlowReader {
    rx: mpsc::Receiver<Segment>,
    current: Option<Segment>,
    offset: usize,
    last_seen: Option<DateTime<Utc>>,
}

impl FlowReader {
    pub fn new(rx: mpsc::Receiver<Segment>) -> FlowReader {
        FlowReader {
            rx,
            current: None,
            offset: 0,
            last_seen: None,
        }
    }
}

impl ByteStream for FlowReader {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            if let Some(seg) = &self.current {
                let rest = &seg.data[self.offset..];
                if !rest.is_empty() {
                    let n = rest.len().min(buf.len());
                    buf[..n].copy_from_slice(&rest[..n]);
                    self.offset += n;
                    self.last_seen = Some(seg.seen);
                    return Ok(n);
                }
                self.current = None;
                self.offset = 0;
            }
            match self.rx.recv().await {
                Some(seg) => self.current = Some(seg),
                None => return Ok(0),
            }
        }
    }
}

impl WireSource for FlowReader {
    fn seen(&self) -> Option<DateTime<Utc>> {
        self.last_seen
    }
}

// ---------------------------------------------------------------------------
// TimeCaptureReader
// ---------------------------------------------------------------------------

/// Records the wire timestamp of every successful read so a decoder can
/// attach first/last-seen times to the message it just consumed.
pub struct TimeCaptureReader<S> {
    inner: S,
    times: Vec<DateTime<Utc>>,
}

impl<S: WireSource> TimeCaptureReader<S> {
    pub fn new(inner: S) -> TimeCaptureReader<S> {
        TimeCaptureReader {
            inner,
            times: Vec::new(),
        }
    }

    /// The timestamps observed since the last `reset`.
    pub fn seen(&self) -> &[DateTime<Utc>] {
        &self.times
    }

    /// Clear the observed timestamps.
    pub fn reset(&mut self) {
        self.times.clear();
    }
}

impl<S: WireSource> ByteStream for TimeCaptureReader<S> {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf).await?;
        if n > 0
            && let Some(t) = self.inner.seen()
        {
            self.times.push(t);
        }
        Ok(n)
    }
}

// ---------------------------------------------------------------------------
// BufSource
// ---------------------------------------------------------------------------

/// In-memory byte source with no timestamps.  Used by `fcgi-dump` and by
/// tests that feed literal streams through the decoders.
pub struct BufSource {
    data: Vec<u8>,
    pos: usize,
}

impl BufSource {
    pub fn new(data: impl Into<Vec<u8>>) -> BufSource {
        BufSource {
            data: data.into(),
            pos: 0,
        }
    }
}

impl ByteStream for BufSource {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let rest = &self.data[self.pos..];
        let n = rest.len().min(buf.len());
        buf[..n].copy_from_slice(&rest[..n]);
        self.pos += n;
        Ok(n)
    }
}

impl WireSource for BufSource {
    fn seen(&self) -> Option<DateTime<Utc>> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn seg(data: &[u8], sec: i64) -> Segment {
        Segment {
            data: Bytes::copy_from_slice(data),
            seen: DateTime::from_timestamp(sec, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn flow_reader_concatenates_segments() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(seg(b"ab", 1)).await.unwrap();
        tx.send(seg(b"cd", 2)).await.unwrap();
        drop(tx);

        let mut r = FlowReader::new(rx);
        let mut out = Vec::new();
        read_to_end(&mut r, &mut out).await.unwrap();
        assert_eq!(out, b"abcd");
        assert_eq!(r.seen(), Some(DateTime::from_timestamp(2, 0).unwrap()));
    }

    #[tokio::test]
    async fn flow_reader_reports_batch_timestamps() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(seg(b"abcd", 5)).await.unwrap();
        drop(tx);

        let mut r = FlowReader::new(rx);
        let mut buf = [0u8; 2];
        assert_eq!(r.read(&mut buf).await.unwrap(), 2);
        assert_eq!(r.seen(), Some(DateTime::from_timestamp(5, 0).unwrap()));
    }

    #[tokio::test]
    async fn time_capture_records_and_resets() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(seg(b"ab", 1)).await.unwrap();
        tx.send(seg(b"cd", 2)).await.unwrap();
        drop(tx);

        let mut t = TimeCaptureReader::new(FlowReader::new(rx));
        let mut out = Vec::new();
        read_to_end(&mut t, &mut out).await.unwrap();
        assert_eq!(t.seen().len(), 2);
        assert_eq!(t.seen()[0], DateTime::from_timestamp(1, 0).unwrap());
        t.reset();
        assert!(t.seen().is_empty());
    }

    #[tokio::test]
    async fn buf_source_reads_out() {
        let mut src = BufSource::new(&b"xyz"[..]);
        let mut out = Vec::new();
        read_to_end(&mut src, &mut out).await.unwrap();
        assert_eq!(out, b"xyz");
        assert_eq!(src.read(&mut [0u8; 4]).await.unwrap(), 0);
    }
}
