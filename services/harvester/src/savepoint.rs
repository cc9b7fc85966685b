//! Mark/rollback over a forward-only byte stream.
//!
//! A parser can arm a save point, read ahead, and on a dead end have the
//! bytes replayed so the next parser sees the stream from the same position.
//! The underlying source is never seeked: replay works by prepending the
//! recorded bytes back in front of it.

use crate::stream::ByteStream;
use std::io;

/// Reader with a single active save point.
///
/// While a save point is armed every delivered byte is also copied into a
/// record buffer; `restore` splices that buffer back in front of the
/// underlying stream.  Arming a new save point drops the previous record but
/// never loses bytes still queued for replay.
pub struct SavePointReader<R> {
    inner: R,
    /// Bytes queued to replay before the underlying stream, from `pos` on.
    pending: Vec<u8>,
    pos: usize,
    /// Bytes delivered since the active save point was armed.
    record: Vec<u8>,
    saving: bool,
}

impl<R: ByteStream> SavePointReader<R> {
    pub fn new(inner: R) -> SavePointReader<R> {
        SavePointReader {
            inner,
            pending: Vec::new(),
            pos: 0,
            record: Vec::new(),
            saving: false,
        }
    }

    pub fn inner(&self) -> &R {
        &self.inner
    }

    pub fn inner_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    /// Mark the current position as the rollback target.  Replaces any
    /// previously armed save point.
    pub fn save_point(&mut self) {
        self.record.clear();
        self.saving = true;
    }

    /// Roll back to the save point: everything read since it was armed will
    /// be delivered again.  With `discard` the save point is dropped;
    /// otherwise a fresh one is armed at the rolled-back position, so the
    /// replayed bytes are recorded again and a later `restore` repeats them.
    pub fn restore(&mut self, discard: bool) {
        let mut replay = std::mem::take(&mut self.record);
        replay.extend_from_slice(&self.pending[self.pos..]);
        self.pending = replay;
        self.pos = 0;
        self.saving = !discard;
    }

    /// Drop the save point without replaying.  Bytes already queued for
    /// replay are still delivered; recording stops.
    pub fn reset(&mut self) {
        self.record.clear();
        self.saving = false;
    }

    /// Push bytes a parser over-read back in front of the stream.  Callers
    /// arm a new save point afterwards; pushing back while an old save point
    /// stays armed would record these bytes twice.
    pub fn unread(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        let mut replay = bytes.to_vec();
        replay.extend_from_slice(&self.pending[self.pos..]);
        self.pending = replay;
        self.pos = 0;
    }
}

impl<R: ByteStream> ByteStream for SavePointReader<R> {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = if self.pos < self.pending.len() {
            let rest = &self.pending[self.pos..];
            let n = rest.len().min(buf.len());
            buf[..n].copy_from_slice(&rest[..n]);
            self.pos += n;
            if self.pos == self.pending.len() {
                self.pending.clear();
                self.pos = 0;
            }
            n
        } else {
            self.inner.read(buf).await?
        };
        if self.saving && n > 0 {
            self.record.extend_from_slice(&buf[..n]);
        }
        Ok(n)
    }
}
