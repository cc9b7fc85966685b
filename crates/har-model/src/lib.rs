// har-model: HAR 1.2 wire schema.
//
// Pure serde types for the output document.  Field names follow the HAR 1.2
// draft exactly (camelCase on the wire); extension fields carry the usual
// underscore prefix.  Values the analyzer cannot compute are emitted as -1
// per the HAR convention for "unknown".

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Document root
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Har {
    pub log: Log,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Log {
    pub version: String,
    pub creator: Creator,
    pub pages: Vec<Page>,
    pub entries: Vec<Entry>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Creator {
    pub name: String,
    pub version: String,
}

// ---------------------------------------------------------------------------
// Pages
// ---------------------------------------------------------------------------

/// One synthetic page per entry; the analyzer has no notion of page loads,
/// so timings are unknown (-1).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page {
    pub started_date_time: DateTime<Utc>,
    pub id: String,
    pub title: String,
    pub page_timings: PageTimings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageTimings {
    pub on_content_load: f64,
    pub on_load: f64,
}

impl Default for PageTimings {
    fn default() -> Self {
        PageTimings {
            on_content_load: -1.0,
            on_load: -1.0,
        }
    }
}

// ---------------------------------------------------------------------------
// Entries
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    pub pageref: String,
    pub started_date_time: DateTime<Utc>,
    /// Total elapsed time in milliseconds.
    pub time: f64,
    pub request: Request,
    pub response: Response,
    pub cache: Cache,
    pub timings: Timings,
    #[serde(rename = "serverIPAddress")]
    pub server_ip_address: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub connection: String,
    /// FastCGI stderr output observed for this exchange, when any.
    #[serde(rename = "_fcgiErrors", skip_serializing_if = "Option::is_none", default)]
    pub fcgi_errors: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub method: String,
    pub url: String,
    pub http_version: String,
    pub cookies: Vec<Cookie>,
    pub headers: Vec<KeyValue>,
    pub query_string: Vec<KeyValue>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub post_data: Option<PostData>,
    pub headers_size: i64,
    pub body_size: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub status: i64,
    pub status_text: String,
    pub http_version: String,
    pub cookies: Vec<Cookie>,
    pub headers: Vec<KeyValue>,
    pub content: Content,
    #[serde(rename = "redirectURL")]
    pub redirect_url: String,
    pub headers_size: i64,
    pub body_size: i64,
    #[serde(rename = "_transferSize")]
    pub transfer_size: i64,
}

impl Default for Response {
    fn default() -> Self {
        Response {
            status: 0,
            status_text: String::new(),
            http_version: String::new(),
            cookies: Vec::new(),
            headers: Vec::new(),
            content: Content::default(),
            redirect_url: String::new(),
            headers_size: -1,
            body_size: -1,
            transfer_size: -1,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Content {
    pub size: i64,
    pub mime_type: String,
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeyValue {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Cookie {
    pub name: String,
    pub value: String,
}

/// Decoded request body.  `params` is populated for form-encoded and
/// multipart bodies; `text` always retains the raw bytes (lossily decoded).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostData {
    pub mime_type: String,
    pub text: String,
    pub params: Vec<PostParam>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostParam {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub file_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub content_type: Option<String>,
}

/// HAR requires the cache object even when nothing is known about caching.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Cache {}

/// Phase timings are unobservable from a capture; every field is -1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Timings {
    pub blocked: f64,
    pub dns: f64,
    pub connect: f64,
    pub send: f64,
    pub wait: f64,
    pub receive: f64,
    pub ssl: f64,
    #[serde(rename = "_blocked_queueing")]
    pub blocked_queueing: f64,
}

impl Default for Timings {
    fn default() -> Self {
        Timings {
            blocked: -1.0,
            dns: -1.0,
            connect: -1.0,
            send: -1.0,
            wait: -1.0,
            receive: -1.0,
            ssl: -1.0,
            blocked_queueing: -1.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_shape() {
        let har = Har::default();
        let json = serde_json::to_value(&har).expect("serializable");
        assert_eq!(json["log"]["version"], "");
        assert_eq!(json["log"]["pages"], serde_json::json!([]));
        assert_eq!(json["log"]["entries"], serde_json::json!([]));
    }

    #[test]
    fn timings_serialize_as_unknown() {
        let json = serde_json::to_value(Timings::default()).expect("serializable");
        assert_eq!(json["blocked"], -1.0);
        assert_eq!(json["ssl"], -1.0);
        assert_eq!(json["_blocked_queueing"], -1.0);
    }

    #[test]
    fn entry_round_trips() {
        let entry = Entry {
            pageref: "page_1".into(),
            started_date_time: Utc::now(),
            time: 12.5,
            request: Request {
                method: "GET".into(),
                url: "http://example.com/".into(),
                http_version: "HTTP/1.1".into(),
                headers: vec![KeyValue {
                    name: "Host".into(),
                    value: "example.com".into(),
                }],
                ..Request::default()
            },
            response: Response::default(),
            cache: Cache::default(),
            timings: Timings::default(),
            server_ip_address: "10.0.0.2".into(),
            connection: String::new(),
            fcgi_errors: None,
        };
        let json = serde_json::to_string(&entry).expect("serializable");
        let back: Entry = serde_json::from_str(&json).expect("deserializable");
        assert_eq!(back, entry);
        // extension fields keep their wire names
        assert!(json.contains("serverIPAddress"));
        assert!(!json.contains("_fcgiErrors"));
    }
}
