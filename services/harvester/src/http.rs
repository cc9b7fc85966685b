//! HTTP/1.x message reading over a [`ByteStream`].
//!
//! `httparse` handles the request/status line and header grammar; body
//! framing lives here because its edge cases are load-bearing for capture
//! analysis: truncated chunked trailers count as a complete body, and a body
//! that ends early surfaces the partial bytes so the caller can fall back to
//! reading the remainder raw.

use crate::decoder::DecodeError;
use crate::stream::{ByteStream, read_to_end};
use std::io::Read;

const MAX_HEAD: usize = 64 * 1024;
const MAX_HEADERS: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: String,
}

impl Header {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Header {
        Header {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Parsed request line and headers.
///
/// `Host` is promoted out of the header list (reassembled request targets
/// rarely carry an authority); the HAR builder re-appends it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub proto: String,
    pub headers: Vec<Header>,
    pub host: Option<String>,
    /// Whether the exchange was carried over TLS (only knowable for
    /// FastCGI-embedded requests, via the `HTTPS` CGI variable).
    pub tls: bool,
    /// Size of the head in bytes as it appeared on the wire; `None` for
    /// heads synthesized from CGI parameters.
    pub head_size: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub proto: String,
    pub status: u16,
    pub reason: String,
    pub headers: Vec<Header>,
    pub head_size: Option<usize>,
}

/// First value of the named header, case-insensitively.
pub fn header_value<'a>(headers: &'a [Header], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| h.value.as_str())
}

// ---------------------------------------------------------------------------
// Head reading
// ---------------------------------------------------------------------------

/// Accumulate bytes until the blank line ending the head.  Returns the
/// buffer and the offset one past `\r\n\r\n`; bytes beyond that offset were
/// over-read and belong to the body.
async fn read_head<S: ByteStream>(src: &mut S) -> Result<(Vec<u8>, usize), DecodeError> {
    let mut acc = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let search_from = acc.len().saturating_sub(3);
        let n = src.read(&mut chunk).await.map_err(|_| DecodeError::Eof)?;
        if n == 0 {
            return Err(if acc.is_empty() {
                DecodeError::Eof
            } else {
                DecodeError::Rejected("stream ended inside a message head")
            });
        }
        acc.extend_from_slice(&chunk[..n]);
        if let Some(i) = memchr::memmem::find(&acc[search_from..], b"\r\n\r\n") {
            return Ok((acc, search_from + i + 4));
        }
        if acc.len() > MAX_HEAD {
            return Err(DecodeError::Rejected("head exceeds size cap"));
        }
    }
}

#[derive(Debug)]
pub struct ParsedRequest {
    pub head: RequestHead,
    /// Body bytes read past the head.
    pub leftover: Vec<u8>,
}

pub async fn read_request_head<S: ByteStream>(src: &mut S) -> Result<ParsedRequest, DecodeError> {
    let (acc, head_end) = read_head(src).await?;
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    let head_len = match req
        .parse(&acc[..head_end])
        .map_err(|_| DecodeError::Rejected("not an HTTP request head"))?
    {
        httparse::Status::Complete(n) => n,
        httparse::Status::Partial => {
            return Err(DecodeError::Rejected("malformed HTTP request head"));
        }
    };
    let (method, target, minor) = match (req.method, req.path, req.version) {
        (Some(m), Some(p), Some(v)) => (m.to_owned(), p.to_owned(), v),
        _ => return Err(DecodeError::Rejected("incomplete request line")),
    };

    let mut out = Vec::with_capacity(req.headers.len());
    let mut host = None;
    for h in req.headers.iter() {
        let value = String::from_utf8_lossy(h.value).into_owned();
        if h.name.eq_ignore_ascii_case("host") {
            if host.is_none() {
                host = Some(value);
            }
            continue;
        }
        out.push(Header::new(h.name, value));
    }

    Ok(ParsedRequest {
        head: RequestHead {
            method,
            target,
            proto: format!("HTTP/1.{minor}"),
            headers: out,
            host,
            tls: false,
            head_size: Some(head_len),
        },
        leftover: acc[head_len..].to_vec(),
    })
}

pub struct ParsedResponse {
    pub head: ResponseHead,
    pub leftover: Vec<u8>,
}

pub async fn read_response_head<S: ByteStream>(src: &mut S) -> Result<ParsedResponse, DecodeError> {
    let (acc, head_end) = read_head(src).await?;
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut res = httparse::Response::new(&mut headers);
    let head_len = match res
        .parse(&acc[..head_end])
        .map_err(|_| DecodeError::Rejected("not an HTTP response head"))?
    {
        httparse::Status::Complete(n) => n,
        httparse::Status::Partial => {
            return Err(DecodeError::Rejected("malformed HTTP response head"));
        }
    };
    let (status, minor) = match (res.code, res.version) {
        (Some(c), Some(v)) => (c, v),
        _ => return Err(DecodeError::Rejected("incomplete status line")),
    };

    let out = res
        .headers
        .iter()
        .map(|h| Header::new(h.name, String::from_utf8_lossy(h.value).into_owned()))
        .collect();

    Ok(ParsedResponse {
        head: ResponseHead {
            proto: format!("HTTP/1.{minor}"),
            status,
            reason: res.reason.unwrap_or_default().to_owned(),
            headers: out,
            head_size: Some(head_len),
        },
        leftover: acc[head_len..].to_vec(),
    })
}

// ---------------------------------------------------------------------------
// Body framing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    Empty,
    Length(usize),
    Chunked,
    ToEof,
}

/// Requests without explicit framing carry no body.
pub fn request_framing(headers: &[Header]) -> Result<BodyFraming, DecodeError> {
    explicit_framing(headers).map(|f| f.unwrap_or(BodyFraming::Empty))
}

/// Responses without explicit framing are delimited by connection close,
/// except for statuses that never carry a body.
pub fn response_framing(status: u16, headers: &[Header]) -> Result<BodyFraming, DecodeError> {
    if (100..200).contains(&status) || status == 204 || status == 304 {
        return Ok(BodyFraming::Empty);
    }
    explicit_framing(headers).map(|f| f.unwrap_or(BodyFraming::ToEof))
}

fn explicit_framing(headers: &[Header]) -> Result<Option<BodyFraming>, DecodeError> {
    if let Some(te) = header_value(headers, "transfer-encoding")
        && te.to_ascii_lowercase().contains("chunked")
    {
        return Ok(Some(BodyFraming::Chunked));
    }
    if let Some(cl) = header_value(headers, "content-length") {
        let n = cl
            .trim()
            .parse::<usize>()
            .map_err(|_| DecodeError::Rejected("unparseable content-length"))?;
        return Ok(Some(BodyFraming::Length(n)));
    }
    Ok(None)
}

/// The stream ended before the framed body did.  `partial` holds what was
/// read; callers decide whether to roll back or keep it.
#[derive(Debug)]
pub struct BodyError {
    pub partial: Vec<u8>,
}

/// Read one message body.  `prefix` is over-read head bytes, consumed before
/// the stream.  On success returns `(body, leftover)` where `leftover` are
/// bytes past the body (the start of the next pipelined message).
pub async fn read_body<S: ByteStream>(
    src: &mut S,
    prefix: Vec<u8>,
    framing: BodyFraming,
) -> Result<(Vec<u8>, Vec<u8>), BodyError> {
    match framing {
        BodyFraming::Empty => Ok((Vec::new(), prefix)),
        BodyFraming::Length(n) => read_sized_body(src, prefix, n).await,
        BodyFraming::ToEof => {
            let mut body = prefix;
            let _ = read_to_end(src, &mut body).await;
            Ok((body, Vec::new()))
        }
        BodyFraming::Chunked => read_chunked_body(src, prefix).await,
    }
}

async fn read_sized_body<S: ByteStream>(
    src: &mut S,
    prefix: Vec<u8>,
    n: usize,
) -> Result<(Vec<u8>, Vec<u8>), BodyError> {
    if prefix.len() >= n {
        let leftover = prefix[n..].to_vec();
        let mut body = prefix;
        body.truncate(n);
        return Ok((body, leftover));
    }
    let mut body = prefix;
    let mut chunk = [0u8; 4096];
    while body.len() < n {
        let want = (n - body.len()).min(chunk.len());
        match src.read(&mut chunk[..want]).await {
            Ok(0) | Err(_) => return Err(BodyError { partial: body }),
            Ok(k) => body.extend_from_slice(&chunk[..k]),
        }
    }
    Ok((body, Vec::new()))
}

/// Buffered scanner over `prefix` + the stream, for chunked decoding.
struct ChunkScanner<'a, S> {
    src: &'a mut S,
    buf: Vec<u8>,
    pos: usize,
}

impl<'a, S: ByteStream> ChunkScanner<'a, S> {
    fn new(src: &'a mut S, prefix: Vec<u8>) -> ChunkScanner<'a, S> {
        ChunkScanner {
            src,
            buf: prefix,
            pos: 0,
        }
    }

    /// Pull more bytes into the buffer; false at EOF.
    async fn fill(&mut self) -> bool {
        let mut chunk = [0u8; 4096];
        match self.src.read(&mut chunk).await {
            Ok(0) | Err(_) => false,
            Ok(n) => {
                self.buf.extend_from_slice(&chunk[..n]);
                true
            }
        }
    }

    /// Next line without its terminator; `None` at EOF.
    async fn read_line(&mut self) -> Option<String> {
        loop {
            if let Some(i) = memchr::memchr(b'\n', &self.buf[self.pos..]) {
                let line = &self.buf[self.pos..self.pos + i];
                let line = line.strip_suffix(b"\r").unwrap_or(line);
                let out = String::from_utf8_lossy(line).into_owned();
                self.pos += i + 1;
                return Some(out);
            }
            if !self.fill().await {
                return None;
            }
        }
    }

    /// Exactly `n` bytes appended to `out`; false at EOF.
    async fn read_exact_into(&mut self, n: usize, out: &mut Vec<u8>) -> bool {
        while self.buf.len() - self.pos < n {
            if !self.fill().await {
                return false;
            }
        }
        out.extend_from_slice(&self.buf[self.pos..self.pos + n]);
        self.pos += n;
        true
    }

    fn leftover(self) -> Vec<u8> {
        self.buf[self.pos..].to_vec()
    }
}

async fn read_chunked_body<S: ByteStream>(
    src: &mut S,
    prefix: Vec<u8>,
) -> Result<(Vec<u8>, Vec<u8>), BodyError> {
    let mut scan = ChunkScanner::new(src, prefix);
    let mut body = Vec::new();
    loop {
        let Some(line) = scan.read_line().await else {
            return Err(BodyError { partial: body });
        };
        let size_part = line.split(';').next().unwrap_or("").trim();
        let Ok(size) = usize::from_str_radix(size_part, 16) else {
            return Err(BodyError { partial: body });
        };
        if size == 0 {
            break;
        }
        if !scan.read_exact_into(size, &mut body).await {
            return Err(BodyError { partial: body });
        }
        // Chunk data is followed by its own CRLF.
        if scan.read_line().await.is_none() {
            return Err(BodyError { partial: body });
        }
    }
    // Trailer section: header lines up to a blank line.  A stream that is
    // cut off here still produced the whole body, so truncation is success.
    loop {
        match scan.read_line().await {
            None => return Ok((body, Vec::new())),
            Some(line) if line.is_empty() => break,
            Some(_) => {}
        }
    }
    Ok((body, scan.leftover()))
}

// ---------------------------------------------------------------------------
// Content decoding
// ---------------------------------------------------------------------------

/// Undo `Content-Encoding: gzip`; anything that fails to inflate is returned
/// as-is.
pub fn decode_content(headers: &[Header], body: Vec<u8>) -> Vec<u8> {
    let Some(enc) = header_value(headers, "content-encoding") else {
        return body;
    };
    if !enc.to_ascii_lowercase().contains("gzip") {
        return body;
    }
    let mut decoded = Vec::new();
    let inflated = flate2::read::GzDecoder::new(&body[..]).read_to_end(&mut decoded);
    match inflated {
        Ok(_) => decoded,
        Err(_) => body,
    }
}

/// Read a complete response from a non-rewindable source (a FastCGI stdout
/// pipe).  A body that ends early keeps the partial bytes plus whatever else
/// the stream still holds.
pub async fn read_piped_response<S: ByteStream>(
    src: &mut S,
) -> Result<(ResponseHead, Vec<u8>), DecodeError> {
    let parsed = read_response_head(src).await?;
    let framing = response_framing(parsed.head.status, &parsed.head.headers)?;
    let body = match read_body(src, parsed.leftover, framing).await {
        Ok((body, _leftover)) => body,
        Err(e) => {
            let mut body = e.partial;
            let _ = read_to_end(src, &mut body).await;
            body
        }
    };
    let body = decode_content(&parsed.head.headers, body);
    Ok((parsed.head, body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::BufSource;
    use flate2::write::GzEncoder;
    use std::io::Write;

    #[tokio::test]
    async fn request_head_promotes_host() {
        let mut src = BufSource::new(
            &b"GET /index.html?q=1 HTTP/1.1\r\nHost: example.com\r\nAccept: */*\r\n\r\n"[..],
        );
        let parsed = read_request_head(&mut src).await.expect("parses");
        assert_eq!(parsed.head.method, "GET");
        assert_eq!(parsed.head.target, "/index.html?q=1");
        assert_eq!(parsed.head.proto, "HTTP/1.1");
        assert_eq!(parsed.head.host.as_deref(), Some("example.com"));
        assert_eq!(parsed.head.headers, vec![Header::new("Accept", "*/*")]);
        assert!(parsed.leftover.is_empty());
    }

    #[tokio::test]
    async fn over_read_bytes_come_back_as_leftover() {
        let mut src = BufSource::new(&b"GET / HTTP/1.0\r\n\r\nEXTRA"[..]);
        let parsed = read_request_head(&mut src).await.expect("parses");
        assert_eq!(parsed.head.head_size, Some(18));
        assert_eq!(parsed.leftover, b"EXTRA");
    }

    #[tokio::test]
    async fn binary_noise_is_rejected_not_eof() {
        let mut src = BufSource::new(&[0u8, 159, 146, 150, 13, 10, 13, 10][..]);
        match read_request_head(&mut src).await {
            Err(DecodeError::Rejected(_)) => {}
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_stream_is_eof() {
        let mut src = BufSource::new(Vec::new());
        assert!(matches!(
            read_request_head(&mut src).await,
            Err(DecodeError::Eof)
        ));
    }

    #[tokio::test]
    async fn response_head_parses_status() {
        let mut src = BufSource::new(&b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n"[..]);
        let parsed = read_response_head(&mut src).await.expect("parses");
        assert_eq!(parsed.head.status, 404);
        assert_eq!(parsed.head.reason, "Not Found");
        assert_eq!(
            response_framing(parsed.head.status, &parsed.head.headers).unwrap(),
            BodyFraming::Length(0)
        );
    }

    #[tokio::test]
    async fn content_length_body_with_pipelined_leftover() {
        let mut src = BufSource::new(&b"{}NEXT"[..]);
        let (body, leftover) = read_body(&mut src, Vec::new(), BodyFraming::Length(2))
            .await
            .expect("body reads");
        assert_eq!(body, b"{}");
        // Everything past the framed body stays in the stream for the next
        // message; nothing extra is consumed beyond read granularity.
        let mut rest = leftover;
        read_to_end(&mut src, &mut rest).await.unwrap();
        assert_eq!(rest, b"NEXT");
    }

    #[tokio::test]
    async fn short_content_length_reports_partial() {
        let mut src = BufSource::new(&b"abc"[..]);
        let err = read_body(&mut src, Vec::new(), BodyFraming::Length(10))
            .await
            .expect_err("body is short");
        assert_eq!(err.partial, b"abc");
    }

    #[tokio::test]
    async fn chunked_body_round_trip() {
        let raw = b"4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\nTAIL";
        let mut src = BufSource::new(&raw[..]);
        let (body, leftover) = read_body(&mut src, Vec::new(), BodyFraming::Chunked)
            .await
            .expect("chunked body reads");
        assert_eq!(body, b"Wikipedia");
        assert_eq!(leftover, b"TAIL");
    }

    #[tokio::test]
    async fn truncated_chunked_trailer_is_success() {
        // Terminal chunk present but the stream dies before the blank line.
        let raw = b"4\r\nWiki\r\n0\r\nX-Trailer: yes";
        let mut src = BufSource::new(&raw[..]);
        let (body, _) = read_body(&mut src, Vec::new(), BodyFraming::Chunked)
            .await
            .expect("truncated trailer still succeeds");
        assert_eq!(body, b"Wiki");
    }

    #[tokio::test]
    async fn truncated_chunk_data_is_an_error() {
        let raw = b"a\r\nWiki";
        let mut src = BufSource::new(&raw[..]);
        let err = read_body(&mut src, Vec::new(), BodyFraming::Chunked)
            .await
            .expect_err("mid-chunk EOF fails");
        assert_eq!(err.partial, b"");
    }

    #[test]
    fn gzip_content_is_decoded() {
        let mut enc = GzEncoder::new(Vec::new(), flate2::Compression::default());
        enc.write_all(b"inflate me").unwrap();
        let gz = enc.finish().unwrap();
        let headers = vec![Header::new("Content-Encoding", "gzip")];
        assert_eq!(decode_content(&headers, gz), b"inflate me");
    }

    #[test]
    fn corrupt_gzip_falls_back_to_raw() {
        let headers = vec![Header::new("Content-Encoding", "gzip")];
        let raw = b"definitely not gzip".to_vec();
        assert_eq!(decode_content(&headers, raw.clone()), raw);
    }

    #[tokio::test]
    async fn piped_response_reads_to_eof_without_framing() {
        let mut src = BufSource::new(&b"HTTP/1.0 200 OK\r\nX-A: b\r\n\r\nall the rest"[..]);
        let (head, body) = read_piped_response(&mut src).await.expect("parses");
        assert_eq!(head.status, 200);
        assert_eq!(body, b"all the rest");
    }

    #[tokio::test]
    async fn no_body_statuses_have_empty_framing() {
        assert_eq!(response_framing(204, &[]).unwrap(), BodyFraming::Empty);
        assert_eq!(response_framing(304, &[]).unwrap(), BodyFraming::Empty);
        assert_eq!(response_framing(101, &[]).unwrap(), BodyFraming::Empty);
    }
}
