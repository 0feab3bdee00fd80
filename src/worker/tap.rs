//! Per-tab network capture
//!
//! Listens to CDP network events on one page, pairs outgoing stats-API
//! requests with their responses, pulls the response body once loading
//! finishes, and pushes every successfully decoded record into the tab's
//! channel. Everything that cannot be captured or decoded is dropped
//! silently; a missed response just leaves its phrase unresolved.

use std::collections::HashMap;
use std::sync::Arc;

use base64::Engine;
use chromiumoxide::cdp::browser_protocol::network::{
    EnableParams, EventLoadingFailed, EventLoadingFinished, EventRequestWillBeSent,
    EventResponseReceived, GetResponseBodyParams, PostDataEntry, RequestId, Response,
};
use chromiumoxide::page::Page;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::decode::{Decoded, Decoder, RawResponse};
use crate::error::ScrapeError;

/// In-flight request bookkeeping keyed by CDP request id.
struct PendingExchange {
    request_body: Option<String>,
    response: Option<(String, i64, Option<String>)>,
}

/// A running capture bound to one page. Aborts its event task on drop.
pub struct NetworkTap {
    task: JoinHandle<()>,
}

impl NetworkTap {
    /// Enable the Network domain on `page` and start capturing.
    pub async fn attach(
        page: &Page,
        decoder: Arc<Decoder>,
        tx: mpsc::UnboundedSender<Decoded>,
    ) -> Result<Self, ScrapeError> {
        page.execute(EnableParams::default())
            .await
            .map_err(|e| ScrapeError::ConnectionLost(e.to_string()))?;

        let mut requests = page
            .event_listener::<EventRequestWillBeSent>()
            .await
            .map_err(|e| ScrapeError::ConnectionLost(e.to_string()))?;
        let mut responses = page
            .event_listener::<EventResponseReceived>()
            .await
            .map_err(|e| ScrapeError::ConnectionLost(e.to_string()))?;
        let mut finished = page
            .event_listener::<EventLoadingFinished>()
            .await
            .map_err(|e| ScrapeError::ConnectionLost(e.to_string()))?;
        let mut failed = page
            .event_listener::<EventLoadingFailed>()
            .await
            .map_err(|e| ScrapeError::ConnectionLost(e.to_string()))?;

        let page = page.clone();
        let task = tokio::spawn(async move {
            let mut pending: HashMap<RequestId, PendingExchange> = HashMap::new();

            loop {
                tokio::select! {
                    event = requests.next() => {
                        let Some(event) = event else { break };
                        if !decoder.adapter().matches_api(&event.request.url) {
                            continue;
                        }
                        // Stale entries pile up only if the page dies mid-request
                        if pending.len() > 256 {
                            debug!("Dropping {} stale in-flight requests", pending.len());
                            pending.clear();
                        }
                        pending.insert(
                            event.request_id.clone(),
                            PendingExchange {
                                request_body: event
                                    .request
                                    .post_data_entries
                                    .as_deref()
                                    .and_then(body_from_entries),
                                response: None,
                            },
                        );
                    }
                    event = responses.next() => {
                        let Some(event) = event else { break };
                        if let Some(entry) = pending.get_mut(&event.request_id) {
                            entry.response = Some((
                                event.response.url.clone(),
                                event.response.status,
                                content_type_of(&event.response),
                            ));
                        }
                    }
                    event = finished.next() => {
                        let Some(event) = event else { break };
                        let Some(entry) = pending.remove(&event.request_id) else {
                            continue;
                        };
                        let Some((url, status, content_type)) = entry.response else {
                            continue;
                        };

                        let body = match page
                            .execute(GetResponseBodyParams::new(event.request_id.clone()))
                            .await
                        {
                            Ok(reply) => {
                                if reply.result.base64_encoded {
                                    match base64::engine::general_purpose::STANDARD
                                        .decode(reply.result.body.as_bytes())
                                    {
                                        Ok(bytes) => bytes,
                                        Err(_) => continue,
                                    }
                                } else {
                                    reply.result.body.clone().into_bytes()
                                }
                            }
                            Err(e) => {
                                trace!("Response body unavailable for {}: {}", url, e);
                                continue;
                            }
                        };

                        let raw = RawResponse {
                            url,
                            status,
                            content_type,
                            body,
                            request_body: entry.request_body,
                        };
                        if let Some(decoded) = decoder.on_response(&raw) {
                            if tx.send(decoded).is_err() {
                                break;
                            }
                        }
                    }
                    event = failed.next() => {
                        let Some(event) = event else { break };
                        pending.remove(&event.request_id);
                    }
                }
            }
            trace!("Network tap finished");
        });

        Ok(Self { task })
    }

    pub fn shutdown(&self) {
        self.task.abort();
    }
}

impl Drop for NetworkTap {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Reassembles a request body from the base64 chunks CDP delivers with
/// requestWillBeSent. Entries without bytes (blob parts) are skipped.
fn body_from_entries(entries: &[PostDataEntry]) -> Option<String> {
    let mut bytes = Vec::new();
    for entry in entries {
        let Some(chunk) = entry.bytes.as_ref() else {
            continue;
        };
        let decoded: &str = chunk.as_ref();
        match base64::engine::general_purpose::STANDARD.decode(decoded.as_bytes()) {
            Ok(part) => bytes.extend_from_slice(&part),
            Err(_) => return None,
        }
    }
    if bytes.is_empty() {
        None
    } else {
        Some(String::from_utf8_lossy(&bytes).into_owned())
    }
}

/// Content-Type from the response headers, falling back to the mime type
/// CDP already extracted.
fn content_type_of(response: &Response) -> Option<String> {
    if let Ok(Value::Object(map)) = serde_json::to_value(&response.headers) {
        for (key, value) in map {
            if key.eq_ignore_ascii_case("content-type") {
                if let Some(s) = value.as_str() {
                    return Some(s.to_string());
                }
            }
        }
    }
    if response.mime_type.is_empty() {
        None
    } else {
        Some(response.mime_type.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(b64: &str) -> PostDataEntry {
        PostDataEntry::builder().bytes(b64.to_string()).build()
    }

    #[test]
    fn test_body_reassembled_from_chunks() {
        let entries = vec![entry("eyJzZWFyY2hWYWx1ZSI6ImRvZyBmb29kIn0=")];
        assert_eq!(
            body_from_entries(&entries).as_deref(),
            Some(r#"{"searchValue":"dog food"}"#)
        );

        // Chrome may split one body over several entries
        let split = vec![entry("c2VhcmNoVmFsdWU9"), entry("dGVsZXBob25l")];
        assert_eq!(
            body_from_entries(&split).as_deref(),
            Some("searchValue=telephone")
        );
    }

    #[test]
    fn test_body_absent_when_entries_empty_or_opaque() {
        assert_eq!(body_from_entries(&[]), None);
        // Blob parts carry no bytes
        assert_eq!(body_from_entries(&[PostDataEntry::builder().build()]), None);
        assert_eq!(body_from_entries(&[entry("not-base64!!")]), None);
    }
}
