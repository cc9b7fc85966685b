//! Speculative decoding of one reassembled flow direction.
//!
//! A capture contains arbitrary TCP flows, so no pre-classification by port:
//! each flow is offered to a prioritized list of decoders, and a decoder
//! that does not recognize the stream has its bytes rolled back before the
//! next one tries.  The terminal drain decoder discards to EOF, so every
//! flow task terminates.

use std::sync::Arc;

use capnet_core::FlowKey;
use tracing::{debug, trace};

use crate::conversation::ConversationStore;
use crate::fcgi;
use crate::http;
use crate::savepoint::SavePointReader;
use crate::stream::{ByteStream, FlowReader, TimeCaptureReader, WireSource, read_to_end};

/// Why a decoder declined the stream.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// Clean end of stream: the flow task is done.
    #[error("end of stream")]
    Eof,
    /// The stream is not this decoder's protocol; roll back and try the
    /// next one.  Never logged as a failure.
    #[error("{0}")]
    Rejected(&'static str),
}

/// The reader stack every speculative decoder works against.
pub type FlowSource<S> = SavePointReader<TimeCaptureReader<S>>;

/// Decode one flow direction until EOF, committing conversations to the
/// store.  This is the whole lifetime of a flow task.
pub async fn run_flow(reader: FlowReader, flow: FlowKey, store: Arc<ConversationStore>) {
    decode_stream(TimeCaptureReader::new(reader), flow, store).await;
}

/// Generic over the wire source so tests can feed literal byte streams.
pub async fn decode_stream<S: WireSource>(
    source: TimeCaptureReader<S>,
    flow: FlowKey,
    store: Arc<ConversationStore>,
) {
    let mut spr: FlowSource<S> = SavePointReader::new(source);
    loop {
        // Priority order: request, response, FastCGI, drain.  The index of
        // the attempt decides the restore mode: before falling through to
        // the terminal drain there is no point keeping the replay copy.
        for attempt in 0..4u8 {
            let outcome = match attempt {
                0 => decode_request(&mut spr, &flow, &store).await,
                1 => decode_response(&mut spr, &flow, &store).await,
                2 => fcgi::decode(&mut spr, &flow, &store).await,
                _ => drain(&mut spr).await,
            };
            match outcome {
                Ok(()) => break,
                Err(DecodeError::Eof) => {
                    trace!(flow = %flow, "flow finished");
                    return;
                }
                Err(DecodeError::Rejected(reason)) => {
                    trace!(flow = %flow, attempt, reason, "decoder declined");
                    if attempt < 3 {
                        spr.restore(attempt == 2);
                    }
                }
            }
        }
        spr.inner_mut().reset();
    }
}

/// Try to consume one HTTP request (head + framed body).  A head that parses
/// but whose body ends early commits with the remainder read raw.
async fn decode_request<S: WireSource>(
    spr: &mut FlowSource<S>,
    flow: &FlowKey,
    store: &ConversationStore,
) -> Result<(), DecodeError> {
    spr.save_point();
    let parsed = http::read_request_head(spr).await?;
    let framing = http::request_framing(&parsed.head.headers)?;

    // Re-arm at the post-head position so a body dead end only rolls back
    // the body bytes.
    spr.unread(&parsed.leftover);
    spr.save_point();

    let body = match http::read_body(spr, Vec::new(), framing).await {
        Ok((body, leftover)) => {
            spr.unread(&leftover);
            body
        }
        Err(_) => {
            debug!(flow = %flow, "request body ended early, reading remainder raw");
            spr.restore(true);
            let mut raw = Vec::new();
            let _ = read_to_end(spr, &mut raw).await;
            raw
        }
    };

    let seen = spr.inner().seen().to_vec();
    store.add_request(flow, parsed.head, body, seen);
    Ok(())
}

/// Try to consume one HTTP response; commits under the reversed flow.
async fn decode_response<S: WireSource>(
    spr: &mut FlowSource<S>,
    flow: &FlowKey,
    store: &ConversationStore,
) -> Result<(), DecodeError> {
    spr.save_point();
    let parsed = http::read_response_head(spr).await?;
    let framing = http::response_framing(parsed.head.status, &parsed.head.headers)?;

    spr.unread(&parsed.leftover);
    spr.save_point();

    let body = match http::read_body(spr, Vec::new(), framing).await {
        Ok((body, leftover)) => {
            spr.unread(&leftover);
            body
        }
        Err(_) => {
            debug!(flow = %flow, "response body ended early, reading remainder raw");
            spr.restore(true);
            let mut raw = Vec::new();
            let _ = read_to_end(spr, &mut raw).await;
            raw
        }
    };
    let body = http::decode_content(&parsed.head.headers, body);

    let seen = spr.inner().seen().to_vec();
    store.add_response(flow, parsed.head, body, seen);
    Ok(())
}

/// Terminal decoder: discard the remainder so the flow always makes
/// progress.  Never declines.
async fn drain<S: WireSource>(spr: &mut FlowSource<S>) -> Result<(), DecodeError> {
    spr.reset();
    let mut buf = [0u8; 4096];
    let mut discarded = 0usize;
    loop {
        match spr.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => discarded += n,
        }
    }
    debug!(bytes = discarded, "drained unrecognized stream");
    Ok(())
}
