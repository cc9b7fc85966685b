//! FastCGI record demultiplexer.
//!
//! Implements the responder role as an observer: records are consumed from a
//! captured stream and reassembled into the HTTP exchanges they carry, but
//! nothing is ever written back — this is an analyzer, not a server.
//!
//! Per request id, stdin bytes stream through a pipe into a task that
//! commits the embedded request (its head reconstructed from CGI
//! parameters), and stdout bytes stream through a second pipe into a task
//! that parses the embedded response.  CGI stdout has no status line, so the
//! demuxer buffers stdout up to the header terminator and prepends a
//! synthetic `HTTP/1.0 <status>` line exactly once per request id before any
//! byte reaches the response parser.
//!
//! The record loop joins every spawned task before returning, so when
//! control comes back all conversations from this flow are committed.

use std::collections::HashMap;
use std::sync::Arc;

use capnet_core::FlowKey;
use chrono::{DateTime, Utc};
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tracing::debug;

use crate::conversation::ConversationStore;
use crate::decoder::{DecodeError, FlowSource};
use crate::http::{self, Header, RequestHead};
use crate::pipe::{PipeWriter, pipe};
use crate::stream::{ByteStream, WireSource, read_to_end};

pub const VERSION: u8 = 1;
const ROLE_RESPONDER: u16 = 1;
const FLAG_KEEP_CONN: u8 = 1;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    BeginRequest,
    AbortRequest,
    EndRequest,
    Params,
    Stdin,
    Stdout,
    Stderr,
    Data,
    GetValues,
    Unknown(u8),
}

impl From<u8> for RecordType {
    fn from(v: u8) -> RecordType {
        match v {
            1 => RecordType::BeginRequest,
            2 => RecordType::AbortRequest,
            3 => RecordType::EndRequest,
            4 => RecordType::Params,
            5 => RecordType::Stdin,
            6 => RecordType::Stdout,
            7 => RecordType::Stderr,
            8 => RecordType::Data,
            9 => RecordType::GetValues,
            other => RecordType::Unknown(other),
        }
    }
}

/// One complete FastCGI record, padding already discarded.
#[derive(Debug, Clone)]
pub struct Record {
    pub rtype: RecordType,
    pub request_id: u16,
    pub payload: Vec<u8>,
}

#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error("stream ended inside a record")]
    Truncated,
    #[error("unsupported FastCGI version {0}")]
    BadVersion(u8),
}

async fn read_full<S: ByteStream>(src: &mut S, buf: &mut [u8]) -> usize {
    let mut got = 0;
    while got < buf.len() {
        match src.read(&mut buf[got..]).await {
            Ok(0) | Err(_) => break,
            Ok(n) => got += n,
        }
    }
    got
}

/// Read one record header + body.  `Ok(None)` on clean EOF at a record
/// boundary; only `version == 1` is accepted.
pub async fn read_record<S: ByteStream>(src: &mut S) -> Result<Option<Record>, RecordError> {
    let mut header = [0u8; 8];
    let got = read_full(src, &mut header).await;
    if got == 0 {
        return Ok(None);
    }
    if got < header.len() {
        return Err(RecordError::Truncated);
    }
    let [version, rtype, id1, id0, len1, len0, padding, _reserved] = header;
    if version != VERSION {
        return Err(RecordError::BadVersion(version));
    }
    let content_length = usize::from(u16::from_be_bytes([len1, len0]));
    let total = content_length + usize::from(padding);
    let mut payload = vec![0u8; total];
    if read_full(src, &mut payload).await < total {
        return Err(RecordError::Truncated);
    }
    payload.truncate(content_length);
    Ok(Some(Record {
        rtype: RecordType::from(rtype),
        request_id: u16::from_be_bytes([id1, id0]),
        payload,
    }))
}

// ---------------------------------------------------------------------------
// Name-value pair codec
// ---------------------------------------------------------------------------

/// Decode FastCGI name-value pairs.  Lengths under 128 take one byte;
/// longer ones take four bytes big-endian with the top bit set.  Keys and
/// values use the codec independently.  Malformed trailing data is dropped
/// rather than failing the record.
pub fn parse_pairs(mut data: &[u8]) -> Vec<(String, String)> {
    let mut out = Vec::new();
    loop {
        let Some((key_len, n)) = read_size(data) else {
            return out;
        };
        data = &data[n..];
        let Some((val_len, n)) = read_size(data) else {
            return out;
        };
        data = &data[n..];
        if key_len + val_len > data.len() {
            return out;
        }
        let key = String::from_utf8_lossy(&data[..key_len]).into_owned();
        let val = String::from_utf8_lossy(&data[key_len..key_len + val_len]).into_owned();
        data = &data[key_len + val_len..];
        out.push((key, val));
    }
}

fn read_size(data: &[u8]) -> Option<(usize, usize)> {
    let first = *data.first()?;
    if first & 0x80 == 0 {
        return Some((usize::from(first), 1));
    }
    if data.len() < 4 {
        return None;
    }
    let v = u32::from_be_bytes([data[0] & 0x7f, data[1], data[2], data[3]]);
    Some((v as usize, 4))
}

/// Encode name-value pairs with the same codec; the inverse of
/// [`parse_pairs`] for canonical inputs.
pub fn encode_pairs(pairs: &[(String, String)]) -> Vec<u8> {
    let mut out = Vec::new();
    for (k, v) in pairs {
        write_size(&mut out, k.len());
        write_size(&mut out, v.len());
        out.extend_from_slice(k.as_bytes());
        out.extend_from_slice(v.as_bytes());
    }
    out
}

fn write_size(out: &mut Vec<u8>, len: usize) {
    if len < 128 {
        out.push(len as u8);
    } else {
        out.extend_from_slice(&((len as u32) | 0x8000_0000).to_be_bytes());
    }
}

// ---------------------------------------------------------------------------
// CGI-to-HTTP request mapping
// ---------------------------------------------------------------------------

/// `HTTP_ACCEPT_ENCODING` -> `Accept-Encoding`.
fn canonical_header_name(cgi: &str) -> String {
    cgi.split('_')
        .filter(|s| !s.is_empty())
        .map(|seg| {
            let mut out = String::with_capacity(seg.len());
            let mut chars = seg.chars();
            if let Some(c) = chars.next() {
                out.push(c.to_ascii_uppercase());
            }
            out.extend(chars.map(|c| c.to_ascii_lowercase()));
            out
        })
        .collect::<Vec<_>>()
        .join("-")
}

fn non_empty<'a>(params: &'a HashMap<String, String>, key: &str) -> Option<&'a String> {
    params.get(key).filter(|v| !v.is_empty())
}

/// Reconstruct the request head a web server translated into CGI variables.
pub fn request_from_params(params: &HashMap<String, String>) -> Result<RequestHead, &'static str> {
    let method = non_empty(params, "REQUEST_METHOD").ok_or("missing REQUEST_METHOD")?;

    let target = match non_empty(params, "REQUEST_URI") {
        Some(uri) => uri.clone(),
        None => {
            let mut t = params.get("SCRIPT_NAME").cloned().unwrap_or_default();
            if let Some(info) = params.get("PATH_INFO") {
                t.push_str(info);
            }
            if t.is_empty() {
                t.push('/');
            }
            if let Some(q) = non_empty(params, "QUERY_STRING") {
                t.push('?');
                t.push_str(q);
            }
            t
        }
    };

    let proto = non_empty(params, "SERVER_PROTOCOL")
        .filter(|p| p.starts_with("HTTP/"))
        .cloned()
        .unwrap_or_else(|| "HTTP/1.1".to_owned());

    let tls = matches!(
        params.get("HTTPS").map(String::as_str),
        Some("on" | "ON" | "1")
    );

    let host = non_empty(params, "HTTP_HOST")
        .or_else(|| non_empty(params, "SERVER_NAME"))
        .cloned();

    let mut headers = Vec::new();
    if let Some(ct) = non_empty(params, "CONTENT_TYPE") {
        headers.push(Header::new("Content-Type", ct.clone()));
    }
    if let Some(cl) = non_empty(params, "CONTENT_LENGTH") {
        headers.push(Header::new("Content-Length", cl.clone()));
    }
    // Param order is lost in the map; emit a stable header order instead.
    let mut http_vars: Vec<(&String, &String)> = params
        .iter()
        .filter(|(k, _)| k.starts_with("HTTP_") && k.as_str() != "HTTP_HOST")
        .collect();
    http_vars.sort_by_key(|(k, _)| k.as_str());
    for (k, v) in http_vars {
        headers.push(Header::new(canonical_header_name(&k["HTTP_".len()..]), v.clone()));
    }

    Ok(RequestHead {
        method: method.clone(),
        target,
        proto,
        headers,
        host,
        tls,
        head_size: None,
    })
}

// ---------------------------------------------------------------------------
// Demultiplexer
// ---------------------------------------------------------------------------

/// Decoder-loop entry: consume a FastCGI stream from the current position.
///
/// Declines (for rollback to the drain decoder) when the first record does
/// not parse, or when framing breaks mid-stream — bad framing is fatal to
/// this decoder, never silently skipped.
pub async fn decode<S: WireSource>(
    spr: &mut FlowSource<S>,
    flow: &FlowKey,
    store: &Arc<ConversationStore>,
) -> Result<(), DecodeError> {
    spr.save_point();
    let mut session = Session::new(*flow, Arc::clone(store));
    let mut records = 0usize;
    let outcome = loop {
        match read_record(spr).await {
            Ok(None) => {
                break if records == 0 {
                    Err(DecodeError::Eof)
                } else {
                    Ok(())
                };
            }
            Ok(Some(rec)) => {
                records += 1;
                let seen = spr.inner().seen().to_vec();
                if session.handle(rec, &seen).await == Control::EndOfSession {
                    break Ok(());
                }
            }
            Err(err) => {
                debug!(%err, records, "FastCGI framing error");
                break Err(DecodeError::Rejected("invalid FastCGI framing"));
            }
        }
    };
    let final_seen = spr.inner().seen().to_vec();
    session.finish(&final_seen).await;
    outcome
}

#[derive(Debug, PartialEq, Eq)]
enum Control {
    Continue,
    /// EndRequest without keep-conn: the application channel is done.
    EndOfSession,
}

type SeenSender = oneshot::Sender<Vec<DateTime<Utc>>>;

/// State for one in-flight request id.
struct InFlight {
    params_raw: Vec<u8>,
    params: HashMap<String, String>,
    keep_conn: bool,
    stdin: Option<PipeWriter>,
    stdin_started: bool,
    stdin_seen: Option<SeenSender>,
    stdout: Option<PipeWriter>,
    stdout_started: bool,
    stdout_seen: Option<SeenSender>,
    /// Stdout bytes held back until the CGI header terminator is seen and
    /// the synthetic status line can go first.
    stdout_buffer: Vec<u8>,
    stdout_open: bool,
}

impl InFlight {
    fn new(keep_conn: bool) -> InFlight {
        InFlight {
            params_raw: Vec::new(),
            params: HashMap::new(),
            keep_conn,
            stdin: None,
            stdin_started: false,
            stdin_seen: None,
            stdout: None,
            stdout_started: false,
            stdout_seen: None,
            stdout_buffer: Vec::new(),
            stdout_open: false,
        }
    }
}

struct Session {
    flow: FlowKey,
    store: Arc<ConversationStore>,
    entries: HashMap<u16, InFlight>,
    tasks: JoinSet<()>,
}

impl Session {
    fn new(flow: FlowKey, store: Arc<ConversationStore>) -> Session {
        Session {
            flow,
            store,
            entries: HashMap::new(),
            tasks: JoinSet::new(),
        }
    }

    async fn handle(&mut self, rec: Record, seen: &[DateTime<Utc>]) -> Control {
        match rec.rtype {
            RecordType::BeginRequest => self.on_begin(rec),
            RecordType::Params => self.on_params(rec),
            RecordType::Stdin => self.on_stdin(rec, seen).await,
            RecordType::Stdout => self.on_stdout(rec, seen).await,
            RecordType::Stderr => self.on_stderr(&rec),
            RecordType::EndRequest | RecordType::AbortRequest => self.on_end(&rec, seen).await,
            // Management traffic and the filter-role data stream carry no
            // HTTP; unknown types are ignored like unknown request ids.
            RecordType::GetValues | RecordType::Data | RecordType::Unknown(_) => Control::Continue,
        }
    }

    fn on_begin(&mut self, rec: Record) -> Control {
        if rec.payload.len() != 8 {
            debug!(id = rec.request_id, "malformed BeginRequest body, ignoring");
            return Control::Continue;
        }
        let role = u16::from_be_bytes([rec.payload[0], rec.payload[1]]);
        let flags = rec.payload[2];
        if role != ROLE_RESPONDER {
            debug!(id = rec.request_id, role, "non-responder role, ignoring");
            return Control::Continue;
        }
        if self.entries.contains_key(&rec.request_id) {
            debug!(id = rec.request_id, "BeginRequest for in-flight id, ignoring");
            return Control::Continue;
        }
        self.entries
            .insert(rec.request_id, InFlight::new(flags & FLAG_KEEP_CONN != 0));
        Control::Continue
    }

    fn on_params(&mut self, rec: Record) -> Control {
        let Some(entry) = self.entries.get_mut(&rec.request_id) else {
            return Control::Continue;
        };
        if rec.payload.is_empty() {
            // A pair can straddle record boundaries, so parsing waits for
            // the empty terminator record.
            let raw = std::mem::take(&mut entry.params_raw);
            for (k, v) in parse_pairs(&raw) {
                entry.params.insert(k, v);
            }
        } else {
            entry.params_raw.extend_from_slice(&rec.payload);
        }
        Control::Continue
    }

    async fn on_stdin(&mut self, rec: Record, seen: &[DateTime<Utc>]) -> Control {
        let Session {
            entries,
            tasks,
            store,
            flow,
            ..
        } = self;
        let Some(entry) = entries.get_mut(&rec.request_id) else {
            return Control::Continue;
        };

        if !entry.stdin_started {
            entry.stdin_started = true;
            let head = request_from_params(&entry.params);
            let (writer, mut reader) = pipe();
            let (seen_tx, seen_rx) = oneshot::channel();
            entry.stdin = Some(writer);
            entry.stdin_seen = Some(seen_tx);
            let store = Arc::clone(store);
            let flow = *flow;
            tasks.spawn(async move {
                let mut body = Vec::new();
                let _ = read_to_end(&mut reader, &mut body).await;
                let seen = seen_rx.await.unwrap_or_default();
                match head {
                    Ok(head) => store.add_request(&flow, head, body, seen),
                    Err(reason) => debug!(reason, "unusable CGI parameters, dropping request"),
                }
            });
        }

        if rec.payload.is_empty() {
            close_stdin(entry, seen);
        } else if let Some(writer) = &mut entry.stdin {
            writer.write(&rec.payload).await;
        }
        Control::Continue
    }

    async fn on_stdout(&mut self, rec: Record, seen: &[DateTime<Utc>]) -> Control {
        let Session {
            entries,
            tasks,
            store,
            flow,
            ..
        } = self;
        let Some(entry) = entries.get_mut(&rec.request_id) else {
            return Control::Continue;
        };

        if !entry.stdout_started {
            entry.stdout_started = true;
            let (writer, mut reader) = pipe();
            let (seen_tx, seen_rx) = oneshot::channel();
            entry.stdout = Some(writer);
            entry.stdout_seen = Some(seen_tx);
            let store = Arc::clone(store);
            let flow = *flow;
            tasks.spawn(async move {
                let parsed = http::read_piped_response(&mut reader).await;
                // Keep draining so the record loop never blocks on the pipe.
                let mut rest = Vec::new();
                let _ = read_to_end(&mut reader, &mut rest).await;
                let seen = seen_rx.await.unwrap_or_default();
                match parsed {
                    Ok((head, body)) => store.add_response(&flow.reverse(), head, body, seen),
                    Err(err) => debug!(%err, "embedded response did not parse"),
                }
            });
        }

        if rec.payload.is_empty() {
            close_stdout(entry, seen).await;
        } else if entry.stdout_open {
            if let Some(writer) = &mut entry.stdout {
                writer.write(&rec.payload).await;
            }
        } else {
            entry.stdout_buffer.extend_from_slice(&rec.payload);
            if find_cgi_header_end(&entry.stdout_buffer).is_some() {
                open_stdout(entry).await;
            }
        }
        Control::Continue
    }

    fn on_stderr(&mut self, rec: &Record) -> Control {
        if !self.entries.contains_key(&rec.request_id) || rec.payload.is_empty() {
            return Control::Continue;
        }
        let text = String::from_utf8_lossy(&rec.payload).into_owned();
        self.store.add_error(&self.flow.reverse(), text);
        Control::Continue
    }

    async fn on_end(&mut self, rec: &Record, seen: &[DateTime<Utc>]) -> Control {
        let Some(mut entry) = self.entries.remove(&rec.request_id) else {
            return Control::Continue;
        };
        close_stdin(&mut entry, seen);
        close_stdout(&mut entry, seen).await;
        if entry.keep_conn {
            Control::Continue
        } else {
            Control::EndOfSession
        }
    }

    /// Connection teardown: close every pipe (idempotent with the closes the
    /// record loop already did) and wait for all embedded parsers.
    async fn finish(mut self, seen: &[DateTime<Utc>]) {
        for (_, mut entry) in self.entries.drain() {
            close_stdin(&mut entry, seen);
            close_stdout(&mut entry, seen).await;
        }
        while self.tasks.join_next().await.is_some() {}
    }
}

fn close_stdin(entry: &mut InFlight, seen: &[DateTime<Utc>]) {
    if let Some(mut writer) = entry.stdin.take() {
        writer.close();
    }
    if let Some(tx) = entry.stdin_seen.take() {
        let _ = tx.send(seen.to_vec());
    }
}

/// Release buffered stdout through the synthetic status line.  CGI gives
/// the status in a `Status:` header; with none present the response is 200.
async fn open_stdout(entry: &mut InFlight) {
    entry.stdout_open = true;
    let status = scan_cgi_status(&entry.stdout_buffer).unwrap_or_else(|| "200 OK".to_owned());
    let buffered = std::mem::take(&mut entry.stdout_buffer);
    if let Some(writer) = &mut entry.stdout {
        writer.write(format!("HTTP/1.0 {status}\r\n").as_bytes()).await;
        writer.write(&buffered).await;
    }
}

async fn close_stdout(entry: &mut InFlight, seen: &[DateTime<Utc>]) {
    if !entry.stdout_open && !entry.stdout_buffer.is_empty() {
        // Stream ended before the header terminator; flush what there is.
        open_stdout(entry).await;
    }
    if let Some(mut writer) = entry.stdout.take() {
        writer.close();
    }
    if let Some(tx) = entry.stdout_seen.take() {
        let _ = tx.send(seen.to_vec());
    }
}

fn find_cgi_header_end(buf: &[u8]) -> Option<usize> {
    memchr::memmem::find(buf, b"\r\n\r\n")
        .map(|i| i + 4)
        .or_else(|| memchr::memmem::find(buf, b"\n\n").map(|i| i + 2))
}

/// First `Status:` header value in the CGI header block, e.g. `201 Created`.
fn scan_cgi_status(buf: &[u8]) -> Option<String> {
    let end = find_cgi_header_end(buf).unwrap_or(buf.len());
    for line in buf[..end].split(|&b| b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.len() >= 7 && line[..7].eq_ignore_ascii_case(b"status:") {
            let value = String::from_utf8_lossy(&line[7..]).trim().to_owned();
            if !value.is_empty() {
                return Some(value);
            }
        }
    }
    None
}


#[cfg(test)]
mod tests {
    use super::testutil::{begin_request, end_request, record};
    use super::*;
    use crate::stream::{BufSource, TimeCaptureReader};
    use crate::savepoint::SavePointReader;

    fn pairs(kv: &[(&str, &str)]) -> Vec<(String, String)> {
        kv.iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    #[test]
    fn pair_codec_round_trips() {
        let long_value = "v".repeat(300);
        let cases = vec![
            pairs(&[]),
            pairs(&[("REQUEST_METHOD", "GET")]),
            pairs(&[("A", ""), ("", "B")]),
            pairs(&[("HTTP_ACCEPT", "*/*"), ("LONG", &long_value)]),
        ];
        for case in cases {
            let encoded = encode_pairs(&case);
            assert_eq!(parse_pairs(&encoded), case);
            // parse -> encode is the identity on canonical wire bytes
            assert_eq!(encode_pairs(&parse_pairs(&encoded)), encoded);
        }
    }

    #[test]
    fn four_byte_lengths_use_the_top_bit() {
        let long_key = "k".repeat(200);
        let encoded = encode_pairs(&pairs(&[(&long_key, "v")]));
        assert_eq!(encoded[0] & 0x80, 0x80);
        assert_eq!(parse_pairs(&encoded)[0].0.len(), 200);
    }

    #[test]
    fn malformed_pair_tail_is_dropped() {
        let mut encoded = encode_pairs(&pairs(&[("GOOD", "yes")]));
        encoded.extend_from_slice(&[0x05, 0x05, b'x']); // promises more than present
        assert_eq!(parse_pairs(&encoded), pairs(&[("GOOD", "yes")]));
    }

    #[tokio::test]
    async fn record_reader_rejects_bad_version() {
        let mut bytes = record(RecordType::Stdin, 1, b"data");
        bytes[0] = 2;
        let mut src = BufSource::new(bytes);
        assert!(matches!(
            read_record(&mut src).await,
            Err(RecordError::BadVersion(2))
        ));
    }

    #[tokio::test]
    async fn record_reader_handles_padding_and_eof() {
        let mut bytes = record(RecordType::Stdin, 7, b"abc");
        bytes.extend_from_slice(&record(RecordType::Stdin, 7, b""));
        let mut src = BufSource::new(bytes);
        let first = read_record(&mut src).await.unwrap().unwrap();
        assert_eq!(first.rtype, RecordType::Stdin);
        assert_eq!(first.request_id, 7);
        assert_eq!(first.payload, b"abc");
        let second = read_record(&mut src).await.unwrap().unwrap();
        assert!(second.payload.is_empty());
        assert!(read_record(&mut src).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn truncated_record_is_an_error() {
        let bytes = record(RecordType::Stdin, 1, b"full payload");
        let mut src = BufSource::new(bytes[..10].to_vec());
        assert!(matches!(
            read_record(&mut src).await,
            Err(RecordError::Truncated)
        ));
    }

    #[test]
    fn header_names_are_canonicalized() {
        assert_eq!(canonical_header_name("ACCEPT_ENCODING"), "Accept-Encoding");
        assert_eq!(canonical_header_name("X_FORWARDED_FOR"), "X-Forwarded-For");
        assert_eq!(canonical_header_name("COOKIE"), "Cookie");
    }

    #[test]
    fn cgi_params_reconstruct_a_request() {
        let params: HashMap<String, String> = [
            ("REQUEST_METHOD", "POST"),
            ("REQUEST_URI", "/api/items?page=2"),
            ("SERVER_PROTOCOL", "HTTP/1.1"),
            ("HTTP_HOST", "api.example.com"),
            ("HTTP_ACCEPT", "application/json"),
            ("CONTENT_TYPE", "application/json"),
            ("CONTENT_LENGTH", "2"),
            ("HTTPS", "on"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_owned(), v.to_owned()))
        .collect();

        let head = request_from_params(&params).expect("parses");
        assert_eq!(head.method, "POST");
        assert_eq!(head.target, "/api/items?page=2");
        assert_eq!(head.proto, "HTTP/1.1");
        assert_eq!(head.host.as_deref(), Some("api.example.com"));
        assert!(head.tls);
        assert!(
            head.headers
                .contains(&Header::new("Accept", "application/json"))
        );
        assert!(
            head.headers
                .contains(&Header::new("Content-Type", "application/json"))
        );
        assert!(head.head_size.is_none());
    }

    #[test]
    fn request_target_falls_back_to_script_name() {
        let params: HashMap<String, String> = [
            ("REQUEST_METHOD", "GET"),
            ("SCRIPT_NAME", "/cgi-bin/app"),
            ("PATH_INFO", "/extra"),
            ("QUERY_STRING", "a=1"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_owned(), v.to_owned()))
        .collect();
        let head = request_from_params(&params).expect("parses");
        assert_eq!(head.target, "/cgi-bin/app/extra?a=1");
    }

    #[test]
    fn missing_method_is_unusable() {
        assert!(request_from_params(&HashMap::new()).is_err());
    }

    #[test]
    fn status_scan_finds_the_cgi_status() {
        assert_eq!(
            scan_cgi_status(b"Status: 201 Created\r\nContent-Type: a/b\r\n\r\nbody"),
            Some("201 Created".to_owned())
        );
        assert_eq!(
            scan_cgi_status(b"Content-Type: a/b\r\n\r\nStatus: 999 Not A Header"),
            None
        );
        assert_eq!(scan_cgi_status(b"no headers here"), None);
    }

    // -----------------------------------------------------------------------
    // Whole-stream decoding
    // -----------------------------------------------------------------------

    fn flow() -> FlowKey {
        FlowKey::new(
            "192.168.1.10".parse().unwrap(),
            51000,
            "192.168.1.20".parse().unwrap(),
            9000,
        )
    }

    fn get_api_params() -> Vec<u8> {
        encode_pairs(&pairs(&[
            ("REQUEST_METHOD", "GET"),
            ("REQUEST_URI", "/api"),
            ("SERVER_PROTOCOL", "HTTP/1.1"),
            ("HTTP_HOST", "app.internal"),
        ]))
    }

    async fn run_decode(stream: Vec<u8>, store: &Arc<ConversationStore>) -> Result<(), DecodeError> {
        let mut spr = SavePointReader::new(TimeCaptureReader::new(BufSource::new(stream)));
        decode(&mut spr, &flow(), store).await
    }

    #[tokio::test]
    async fn responder_exchange_produces_a_conversation() {
        let mut stream = Vec::new();
        stream.extend(begin_request(1, ROLE_RESPONDER, false));
        stream.extend(record(RecordType::Params, 1, &get_api_params()));
        stream.extend(record(RecordType::Params, 1, b""));
        stream.extend(record(RecordType::Stdin, 1, b""));
        stream.extend(record(
            RecordType::Stdout,
            1,
            b"Status: 201 Created\r\nContent-Type: text/plain\r\n\r\nok",
        ));
        stream.extend(record(RecordType::Stdout, 1, b""));
        stream.extend(end_request(1));

        let store = Arc::new(ConversationStore::new());
        run_decode(stream, &store).await.expect("decodes");

        let convs = store.take_conversations();
        assert_eq!(convs.len(), 1);
        let req = convs[0].request.as_ref().expect("request committed");
        assert_eq!(req.method, "GET");
        assert_eq!(req.target, "/api");
        assert_eq!(req.host.as_deref(), Some("app.internal"));
        let resp = convs[0].response.as_ref().expect("response committed");
        assert_eq!(resp.status, 201);
        assert_eq!(resp.reason, "Created");
        assert_eq!(convs[0].response_body, b"ok");
    }

    #[tokio::test]
    async fn status_header_straddling_records_still_gets_one_status_line() {
        // The Status header is split across three stdout records; the
        // synthetic line must still be emitted exactly once, first.
        let mut stream = Vec::new();
        stream.extend(begin_request(5, ROLE_RESPONDER, false));
        stream.extend(record(RecordType::Params, 5, &get_api_params()));
        stream.extend(record(RecordType::Params, 5, b""));
        stream.extend(record(RecordType::Stdin, 5, b""));
        stream.extend(record(RecordType::Stdout, 5, b"Stat"));
        stream.extend(record(RecordType::Stdout, 5, b"us: 202 Accepted\r\nContent-"));
        stream.extend(record(RecordType::Stdout, 5, b"Type: text/plain\r\n\r\npayload"));
        stream.extend(record(RecordType::Stdout, 5, b""));
        stream.extend(end_request(5));

        let store = Arc::new(ConversationStore::new());
        run_decode(stream, &store).await.expect("decodes");

        let convs = store.take_conversations();
        let resp = convs[0].response.as_ref().expect("response committed");
        assert_eq!(resp.status, 202);
        assert_eq!(convs[0].response_body, b"payload");
    }

    #[tokio::test]
    async fn request_body_streams_through_stdin() {
        let params = encode_pairs(&pairs(&[
            ("REQUEST_METHOD", "POST"),
            ("REQUEST_URI", "/submit"),
            ("CONTENT_LENGTH", "9"),
        ]));
        let mut stream = Vec::new();
        stream.extend(begin_request(2, ROLE_RESPONDER, false));
        stream.extend(record(RecordType::Params, 2, &params));
        stream.extend(record(RecordType::Params, 2, b""));
        stream.extend(record(RecordType::Stdin, 2, b"name="));
        stream.extend(record(RecordType::Stdin, 2, b"fred"));
        stream.extend(record(RecordType::Stdin, 2, b""));
        stream.extend(end_request(2));

        let store = Arc::new(ConversationStore::new());
        run_decode(stream, &store).await.expect("decodes");

        let convs = store.take_conversations();
        assert_eq!(convs[0].request_body, b"name=fred");
    }

    #[tokio::test]
    async fn stderr_text_is_attached_to_the_conversation() {
        let mut stream = Vec::new();
        stream.extend(begin_request(3, ROLE_RESPONDER, false));
        stream.extend(record(RecordType::Params, 3, &get_api_params()));
        stream.extend(record(RecordType::Params, 3, b""));
        stream.extend(record(RecordType::Stdin, 3, b""));
        stream.extend(record(RecordType::Stderr, 3, b"Warning: deprecated call"));
        stream.extend(record(RecordType::Stdout, 3, b"Status: 500 Oops\r\n\r\n"));
        stream.extend(record(RecordType::Stdout, 3, b""));
        stream.extend(end_request(3));

        let store = Arc::new(ConversationStore::new());
        run_decode(stream, &store).await.expect("decodes");

        let convs = store.take_conversations();
        assert_eq!(convs[0].errors, vec!["Warning: deprecated call".to_owned()]);
        assert_eq!(convs[0].response.as_ref().unwrap().status, 500);
    }

    #[tokio::test]
    async fn non_responder_roles_are_ignored() {
        let mut stream = Vec::new();
        stream.extend(begin_request(4, 2, false)); // authorizer
        stream.extend(record(RecordType::Params, 4, &get_api_params()));
        stream.extend(record(RecordType::Params, 4, b""));
        stream.extend(record(RecordType::Stdin, 4, b""));
        stream.extend(end_request(4));

        let store = Arc::new(ConversationStore::new());
        run_decode(stream, &store).await.expect("decodes");
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn records_for_unknown_ids_are_ignored() {
        let mut stream = Vec::new();
        stream.extend(record(RecordType::Stdout, 9, b"orphan"));
        stream.extend(record(RecordType::Stderr, 9, b"orphan"));
        stream.extend(begin_request(1, ROLE_RESPONDER, false));
        stream.extend(record(RecordType::Params, 1, &get_api_params()));
        stream.extend(record(RecordType::Params, 1, b""));
        stream.extend(record(RecordType::Stdin, 1, b""));
        stream.extend(end_request(1));

        let store = Arc::new(ConversationStore::new());
        run_decode(stream, &store).await.expect("decodes");
        let convs = store.take_conversations();
        assert_eq!(convs.len(), 1);
        assert!(convs[0].errors.is_empty());
    }

    #[tokio::test]
    async fn garbage_first_record_declines_the_stream() {
        let store = Arc::new(ConversationStore::new());
        let result = run_decode(b"\x09not fastcgi at all".to_vec(), &store).await;
        assert!(matches!(result, Err(DecodeError::Rejected(_))));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn empty_stream_is_eof() {
        let store = Arc::new(ConversationStore::new());
        assert!(matches!(
            run_decode(Vec::new(), &store).await,
            Err(DecodeError::Eof)
        ));
    }

    #[tokio::test]
    async fn connection_teardown_closes_open_requests() {
        // No EndRequest and no empty stdout record: finish() must close the
        // pipes so the embedded parsers still complete and commit.
        let mut stream = Vec::new();
        stream.extend(begin_request(6, ROLE_RESPONDER, true));
        stream.extend(record(RecordType::Params, 6, &get_api_params()));
        stream.extend(record(RecordType::Params, 6, b""));
        stream.extend(record(RecordType::Stdin, 6, b""));
        stream.extend(record(
            RecordType::Stdout,
            6,
            b"Status: 200 OK\r\n\r\npartial",
        ));

        let store = Arc::new(ConversationStore::new());
        run_decode(stream, &store).await.expect("decodes");
        let convs = store.take_conversations();
        assert_eq!(convs.len(), 1);
        assert_eq!(convs[0].response.as_ref().unwrap().status, 200);
        assert_eq!(convs[0].response_body, b"partial");
    }
}
