//! Single-producer single-consumer byte pipe.
//!
//! Connects the FastCGI record loop (producer) to the embedded HTTP parser
//! task for one request id (consumer).  Close is idempotent on both ends and
//! safe against the record loop and connection-teardown racing to close the
//! same pipe.

use crate::stream::{ByteStream, WireSource};
use chrono::{DateTime, Utc};
use std::io;
use tokio::sync::mpsc;

/// Bounded so a parser that stops reading backpressures the record loop
/// instead of buffering a whole stdout stream.
const PIPE_CAPACITY: usize = 8;

pub fn pipe() -> (PipeWriter, PipeReader) {
    let (tx, rx) = mpsc::channel(PIPE_CAPACITY);
    (
        PipeWriter { tx: Some(tx) },
        PipeReader {
            rx,
            current: Vec::new(),
            pos: 0,
        },
    )
}

pub struct PipeWriter {
    tx: Option<mpsc::Sender<Vec<u8>>>,
}

impl PipeWriter {
    /// Write a chunk to the pipe; blocks while the consumer is behind.
    /// Writing after the reader is gone is a no-op.
    pub async fn write(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        if let Some(tx) = &self.tx
            && tx.send(data.to_vec()).await.is_err()
        {
            self.tx = None;
        }
    }

    /// Close the write end; the reader sees EOF once it drains.  Idempotent.
    pub fn close(&mut self) {
        self.tx = None;
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_none()
    }
}

pub struct PipeReader {
    rx: mpsc::Receiver<Vec<u8>>,
    current: Vec<u8>,
    pos: usize,
}

impl ByteStream for PipeReader {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            let rest = &self.current[self.pos..];
            if !rest.is_empty() {
                let n = rest.len().min(buf.len());
                buf[..n].copy_from_slice(&rest[..n]);
                self.pos += n;
                return Ok(n);
            }
            match self.rx.recv().await {
                Some(chunk) => {
                    self.current = chunk;
                    self.pos = 0;
                }
                None => return Ok(0),
            }
        }
    }
}

impl WireSource for PipeReader {
    fn seen(&self) -> Option<DateTime<Utc>> {
        None
    }
}
