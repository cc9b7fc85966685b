//! Projecting finalized conversations into the HAR 1.2 document.
//!
//! Conversations that never saw a request are dropped.  Everything here is
//! best-effort: a body that fails to decode as a form still ships as raw
//! text, and a URL that cannot be reconstructed ships as the bare target.

use chrono::{DateTime, Utc};
use har_model::{
    Cache, Content, Cookie, Creator, Entry, Har, KeyValue, Page, PageTimings, PostData, PostParam,
    Request, Response, Timings,
};
use tracing::debug;

use crate::conversation::Conversation;
use crate::http::{Header, RequestHead, ResponseHead, header_value};

/// Build the HAR document: one entry per request-bearing conversation,
/// sorted by start time, with one synthetic page per entry.
pub fn build(conversations: Vec<Conversation>) -> Har {
    let mut har = Har::default();
    har.log.version = "1.2".to_owned();
    har.log.creator = Creator {
        name: env!("CARGO_PKG_NAME").to_owned(),
        version: env!("CARGO_PKG_VERSION").to_owned(),
    };

    let mut entries: Vec<Entry> = Vec::new();
    for conv in conversations {
        let Some(req_head) = &conv.request else {
            debug!(flow = %conv.address, "dropping conversation with no request");
            continue;
        };
        entries.push(build_entry(&conv, req_head));
    }

    entries.sort_by_key(|e| e.started_date_time);
    for (i, entry) in entries.iter_mut().enumerate() {
        let id = format!("page_{}", i + 1);
        entry.pageref = id.clone();
        har.log.pages.push(Page {
            started_date_time: entry.started_date_time,
            id,
            title: entry.request.url.clone(),
            page_timings: PageTimings::default(),
        });
    }
    har.log.entries = entries;
    har
}

fn build_entry(conv: &Conversation, head: &RequestHead) -> Entry {
    let (started, time) = entry_times(&conv.request_seen, &conv.response_seen);
    Entry {
        pageref: String::new(),
        started_date_time: started,
        time,
        request: build_request(head, &conv.request_body),
        response: conv
            .response
            .as_ref()
            .map(|r| build_response(r, &conv.response_body))
            .unwrap_or_default(),
        cache: Cache::default(),
        timings: Timings::default(),
        server_ip_address: conv.address.server_ip().to_string(),
        connection: String::new(),
        fcgi_errors: if conv.errors.is_empty() {
            None
        } else {
            Some(conv.errors.clone())
        },
    }
}

/// `startedDateTime` is the first wire timestamp of the request bytes;
/// duration runs to the last response byte, or the last request byte when no
/// response was captured.
fn entry_times(
    request_seen: &[DateTime<Utc>],
    response_seen: &[DateTime<Utc>],
) -> (DateTime<Utc>, f64) {
    let started = request_seen
        .first()
        .or(response_seen.first())
        .copied()
        .unwrap_or(DateTime::UNIX_EPOCH);
    let ended = response_seen
        .last()
        .or(request_seen.last())
        .copied()
        .unwrap_or(started);
    let millis = (ended - started)
        .num_nanoseconds()
        .map_or(0.0, |ns| ns as f64 / 1_000_000.0);
    (started, millis.max(0.0))
}

fn build_request(head: &RequestHead, body: &[u8]) -> Request {
    let url = reconstruct_url(head);
    let mut headers: Vec<KeyValue> = head
        .headers
        .iter()
        .map(|h| KeyValue {
            name: h.name.clone(),
            value: h.value.clone(),
        })
        .collect();
    // Host was promoted off the header list during parsing; surface it the
    // way a browser-recorded HAR would.
    if let Some(host) = &head.host {
        headers.push(KeyValue {
            name: "Host".to_owned(),
            value: host.clone(),
        });
    }

    Request {
        method: head.method.clone(),
        url: url.clone(),
        http_version: head.proto.clone(),
        cookies: parse_cookies(&head.headers),
        headers,
        query_string: query_pairs(&head.target),
        post_data: build_post_data(&head.headers, body),
        headers_size: head.head_size.map_or(-1, |s| s as i64),
        body_size: body.len() as i64,
    }
}

fn build_response(head: &ResponseHead, body: &[u8]) -> Response {
    Response {
        status: i64::from(head.status),
        status_text: head.reason.clone(),
        http_version: head.proto.clone(),
        cookies: Vec::new(),
        headers: head
            .headers
            .iter()
            .map(|h| KeyValue {
                name: h.name.clone(),
                value: h.value.clone(),
            })
            .collect(),
        content: Content {
            size: body.len() as i64,
            mime_type: header_value(&head.headers, "content-type")
                .unwrap_or_default()
                .to_owned(),
            text: String::from_utf8_lossy(body).into_owned(),
        },
        redirect_url: header_value(&head.headers, "location")
            .unwrap_or_default()
            .to_owned(),
        headers_size: head.head_size.map_or(-1, |s| s as i64),
        body_size: body.len() as i64,
        transfer_size: body.len() as i64,
    }
}

/// Reassembled request targets rarely carry an authority; put one back from
/// the Host header, with the scheme chosen by the TLS marker.
fn reconstruct_url(head: &RequestHead) -> String {
    if head.target.starts_with("http://") || head.target.starts_with("https://") {
        return head.target.clone();
    }
    let Some(host) = &head.host else {
        return head.target.clone();
    };
    if !head.target.starts_with('/') {
        return head.target.clone();
    }
    let scheme = if head.tls { "https" } else { "http" };
    format!("{scheme}://{host}{}", head.target)
}

fn query_pairs(target: &str) -> Vec<KeyValue> {
    let Some((_, query)) = target.split_once('?') else {
        return Vec::new();
    };
    form_urlencoded::parse(query.as_bytes())
        .map(|(name, value)| KeyValue {
            name: name.into_owned(),
            value: value.into_owned(),
        })
        .collect()
}

fn parse_cookies(headers: &[Header]) -> Vec<Cookie> {
    let Some(cookie) = header_value(headers, "cookie") else {
        return Vec::new();
    };
    cookie
        .split(';')
        .filter_map(|part| {
            let (name, value) = part.trim().split_once('=')?;
            Some(Cookie {
                name: name.trim().to_owned(),
                value: value.trim().to_owned(),
            })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Request bodies
// ---------------------------------------------------------------------------

fn build_post_data(headers: &[Header], body: &[u8]) -> Option<PostData> {
    if body.is_empty() {
        return None;
    }
    let mime_type = header_value(headers, "content-type")
        .unwrap_or_default()
        .to_owned();
    let base = mime_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();

    let params = match base.as_str() {
        "application/x-www-form-urlencoded" => form_urlencoded::parse(body)
            .map(|(name, value)| PostParam {
                name: name.into_owned(),
                value: Some(value.into_owned()),
                file_name: None,
                content_type: None,
            })
            .collect(),
        "multipart/form-data" => boundary_of(&mime_type)
            .and_then(|b| parse_multipart(body, &b))
            .unwrap_or_default(),
        _ => Vec::new(),
    };

    Some(PostData {
        mime_type,
        text: String::from_utf8_lossy(body).into_owned(),
        params,
    })
}

fn boundary_of(content_type: &str) -> Option<String> {
    for param in content_type.split(';').skip(1) {
        if let Some((key, value)) = param.trim().split_once('=')
            && key.trim().eq_ignore_ascii_case("boundary")
        {
            return Some(value.trim_matches('"').to_owned());
        }
    }
    None
}

/// Decode `multipart/form-data` parts into post params.  Any structural
/// surprise aborts to `None`; the caller keeps the raw body text.
fn parse_multipart(body: &[u8], boundary: &str) -> Option<Vec<PostParam>> {
    let delimiter = format!("--{boundary}");
    let mut params = Vec::new();
    let mut rest = body;

    let start = memchr::memmem::find(rest, delimiter.as_bytes())?;
    rest = &rest[start + delimiter.len()..];

    loop {
        if rest.starts_with(b"--") {
            break; // close delimiter
        }
        rest = rest.strip_prefix(b"\r\n").unwrap_or(rest);
        let end = memchr::memmem::find(rest, delimiter.as_bytes())?;
        let part = &rest[..end];
        rest = &rest[end + delimiter.len()..];

        let header_end = memchr::memmem::find(part, b"\r\n\r\n")?;
        let (head, content) = part.split_at(header_end + 4);
        let content = content.strip_suffix(b"\r\n").unwrap_or(content);

        let mut name = None;
        let mut file_name = None;
        let mut content_type = None;
        for line in head.split(|&b| b == b'\n') {
            let line = String::from_utf8_lossy(line);
            let line = line.trim();
            if let Some(disposition) = line
                .strip_prefix("Content-Disposition:")
                .or_else(|| line.strip_prefix("content-disposition:"))
            {
                for attr in disposition.split(';').skip(1) {
                    if let Some((key, value)) = attr.trim().split_once('=') {
                        let value = value.trim_matches('"').to_owned();
                        match key.trim() {
                            "name" => name = Some(value),
                            "filename" => file_name = Some(value),
                            _ => {}
                        }
                    }
                }
            } else if let Some(ct) = line
                .strip_prefix("Content-Type:")
                .or_else(|| line.strip_prefix("content-type:"))
            {
                content_type = Some(ct.trim().to_owned());
            }
        }

        params.push(PostParam {
            name: name?,
            value: Some(String::from_utf8_lossy(content).into_owned()),
            file_name,
            content_type,
        });
    }
    Some(params)
}
