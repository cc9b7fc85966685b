//! Correlating request and response streams into conversations.
//!
//! Conversations are keyed by the request-direction flow; response-direction
//! traffic is rekeyed by reversing its flow.  Within one bucket pairing is
//! FIFO, which matches HTTP/1.1 pipelining: the first entry missing a
//! response is the target for the next response, and the first entry missing
//! a request is the target for the next request (the FastCGI path can create
//! response-first entries).

use capnet_core::FlowKey;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

use crate::http::{RequestHead, ResponseHead};

/// One logical HTTP exchange plus its timing and any FastCGI stderr text.
#[derive(Debug, Clone)]
pub struct Conversation {
    pub address: FlowKey,
    pub request: Option<RequestHead>,
    pub request_body: Vec<u8>,
    pub response: Option<ResponseHead>,
    pub response_body: Vec<u8>,
    pub request_seen: Vec<DateTime<Utc>>,
    pub response_seen: Vec<DateTime<Utc>>,
    pub errors: Vec<String>,
}

impl Conversation {
    fn empty(address: FlowKey) -> Conversation {
        Conversation {
            address,
            request: None,
            request_body: Vec::new(),
            response: None,
            response_body: Vec::new(),
            request_seen: Vec::new(),
            response_seen: Vec::new(),
            errors: Vec::new(),
        }
    }
}

/// Shared store of all conversations, bucketed by canonical flow.
///
/// Flow tasks mutate it only through these methods; each takes the lock for
/// the duration of one bucket scan.  Readers run after every flow task has
/// joined.
#[derive(Debug, Default)]
pub struct ConversationStore {
    buckets: Mutex<HashMap<FlowKey, Vec<Conversation>>>,
}

impl ConversationStore {
    pub fn new() -> ConversationStore {
        ConversationStore::default()
    }

    /// Record a request observed on `flow`.  Completes the first entry still
    /// missing a request, otherwise appends (pipelining).
    pub fn add_request(
        &self,
        flow: &FlowKey,
        head: RequestHead,
        body: Vec<u8>,
        seen: Vec<DateTime<Utc>>,
    ) {
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        let bucket = buckets.entry(*flow).or_default();
        if let Some(c) = bucket.iter_mut().find(|c| c.request.is_none()) {
            c.request = Some(head);
            c.request_body = body;
            c.request_seen = seen;
            return;
        }
        let mut c = Conversation::empty(*flow);
        c.request = Some(head);
        c.request_body = body;
        c.request_seen = seen;
        bucket.push(c);
    }

    /// Record a response observed on `flow` (the response direction); it is
    /// paired under the reversed key.  With no bucket yet, a response-only
    /// entry is created to be completed later; a bucket whose entries all
    /// have responses drops the extra response.
    pub fn add_response(
        &self,
        flow: &FlowKey,
        head: ResponseHead,
        body: Vec<u8>,
        seen: Vec<DateTime<Utc>>,
    ) {
        let key = flow.reverse();
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        let bucket = buckets.entry(key).or_default();
        if let Some(c) = bucket.iter_mut().find(|c| c.response.is_none()) {
            c.response = Some(head);
            c.response_body = body;
            c.response_seen = seen;
            return;
        }
        if bucket.is_empty() {
            let mut c = Conversation::empty(key);
            c.response = Some(head);
            c.response_body = body;
            c.response_seen = seen;
            bucket.push(c);
        } else {
            debug!(flow = %key, "response with no open request slot, dropping");
        }
    }

    /// Attach FastCGI stderr text; targets the same entry the next response
    /// would complete.
    pub fn add_error(&self, flow: &FlowKey, text: String) {
        let key = flow.reverse();
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        let bucket = buckets.entry(key).or_default();
        if let Some(c) = bucket.iter_mut().find(|c| c.response.is_none()) {
            c.errors.push(text);
            return;
        }
        if bucket.is_empty() {
            let mut c = Conversation::empty(key);
            c.errors.push(text);
            bucket.push(c);
        }
    }

    pub fn len(&self) -> usize {
        self.buckets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(Vec::len)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drain every bucket, preserving arrival order within each.  Called
    /// once, after all flow tasks have joined.
    pub fn take_conversations(&self) -> Vec<Conversation> {
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut *buckets).into_values().flatten().collect()
    }
}
