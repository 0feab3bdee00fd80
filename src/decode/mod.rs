//! Response correlation and decoding
//!
//! Takes raw API response bytes captured from the browser's network layer,
//! decodes them through an ordered list of candidate charsets, normalizes the
//! service's several historical payload shapes into one canonical record
//! type, and correlates each response back to the phrase that produced it.

use std::sync::Arc;
use encoding_rs::{Encoding, KOI8_R, UTF_8, WINDOWS_1251};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, trace};

use crate::site::SiteAdapter;

/// A response captured off the wire, before any interpretation.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub url: String,
    pub status: i64,
    /// Content-Type header as sent, if any
    pub content_type: Option<String>,
    pub body: Vec<u8>,
    /// Body of the request that produced this response, if captured
    pub request_body: Option<String>,
}

/// One phrase/count pair in canonical form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreqEntry {
    pub phrase: String,
    pub count: u64,
}

/// Canonical payload shape every historical response format maps into.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Payload {
    pub items: Vec<FreqEntry>,
    pub related: Vec<FreqEntry>,
    pub total: Option<u64>,
}

/// A response successfully tied back to its query.
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded {
    pub phrase: String,
    pub frequency: u64,
}

/// Decoder bound to one site adapter.
pub struct Decoder {
    adapter: Arc<SiteAdapter>,
}

impl Decoder {
    pub fn new(adapter: Arc<SiteAdapter>) -> Self {
        Self { adapter }
    }

    pub fn adapter(&self) -> &SiteAdapter {
        &self.adapter
    }

    /// Process one captured response. Returns None for responses that are
    /// not the stats API, failed, cannot be decoded, or cannot be
    /// correlated; none of those are errors, just missed samples.
    pub fn on_response(&self, raw: &RawResponse) -> Option<Decoded> {
        if !self.adapter.matches_api(&raw.url) {
            return None;
        }
        if !(200..300).contains(&raw.status) {
            trace!("Ignoring non-success response {} for {}", raw.status, raw.url);
            return None;
        }

        let value = decode_body(&raw.body, raw.content_type.as_deref())?;
        let payload = Payload::normalize(&value);

        let phrase = self
            .phrase_from_request(raw.request_body.as_deref())
            .or_else(|| payload.items.first().map(|e| e.phrase.clone()))?;

        let frequency = payload
            .total
            .or_else(|| payload.items.first().map(|e| e.count))
            .unwrap_or(0);

        debug!("Correlated response for '{}' (frequency {})", phrase, frequency);
        Some(Decoded { phrase, frequency })
    }

    /// Pull the search term out of the outgoing request payload. Accepts
    /// JSON bodies first, then form-encoded ones.
    fn phrase_from_request(&self, body: Option<&str>) -> Option<String> {
        let body = body?;
        let field = self.adapter.search_term_field.as_str();

        if let Ok(value) = serde_json::from_str::<Value>(body) {
            if let Some(term) = value.get(field).and_then(|v| v.as_str()) {
                let term = term.trim();
                if !term.is_empty() {
                    return Some(term.to_string());
                }
            }
            return None;
        }

        // Form-encoded fallback. Valueless pairs (bare flags) are legal and
        // skipped; '+' means space and must be mapped before percent-decoding
        // so an escaped %2B survives as a literal plus.
        for pair in body.split('&') {
            let Some((key, val)) = pair.split_once('=') else {
                continue;
            };
            if key == field {
                let spaced = val.replace('+', " ");
                let Ok(decoded) = urlencoding::decode(&spaced) else {
                    continue;
                };
                let decoded = decoded.trim();
                if !decoded.is_empty() {
                    return Some(decoded.to_string());
                }
            }
        }
        None
    }
}

/// Decode body bytes into parsed JSON, trying candidate encodings in order:
/// the declared charset first, then UTF-8 and the legacy single-byte
/// fallbacks. The first candidate that decodes cleanly *and* parses wins.
pub fn decode_body(body: &[u8], content_type: Option<&str>) -> Option<Value> {
    for encoding in charset_candidates(content_type) {
        let (text, _, had_errors) = encoding.decode(body);
        if had_errors {
            continue;
        }
        if let Ok(value) = serde_json::from_str::<Value>(&text) {
            return Some(value);
        }
    }
    None
}

fn charset_candidates(content_type: Option<&str>) -> Vec<&'static Encoding> {
    let mut out: Vec<&'static Encoding> = Vec::with_capacity(4);

    if let Some(ct) = content_type {
        if let Some(label) = ct
            .split(';')
            .filter_map(|part| part.trim().strip_prefix("charset="))
            .next()
        {
            let label = label.trim().trim_matches('"');
            if let Some(enc) = Encoding::for_label(label.as_bytes()) {
                out.push(enc);
            }
        }
    }

    for enc in [UTF_8, WINDOWS_1251, KOI8_R] {
        if !out.iter().any(|e| *e == enc) {
            out.push(enc);
        }
    }
    out
}

impl Payload {
    /// Map any historical payload shape into the canonical one.
    ///
    /// Idempotent: normalizing an already-canonical payload reproduces it.
    pub fn normalize(value: &Value) -> Payload {
        // Flat shape wins when present
        if let Some(items) = value.get("items").and_then(Value::as_array) {
            return Payload {
                items: entries(items),
                related: value
                    .get("related")
                    .and_then(Value::as_array)
                    .map(|a| entries(a))
                    .unwrap_or_default(),
                total: total_of(value),
            };
        }

        // Legacy nested table-data shape
        if let Some(data) = value.get("data") {
            if let Some(rows) = data.as_array() {
                return Payload {
                    items: entries(rows),
                    related: Vec::new(),
                    total: total_of(value),
                };
            }
            if data.is_object() {
                let items = ["items", "popular", "table"]
                    .iter()
                    .find_map(|k| data.get(*k).and_then(Value::as_array))
                    .map(|a| entries(a))
                    .unwrap_or_default();
                let related = ["related", "assoc", "associations"]
                    .iter()
                    .find_map(|k| data.get(*k).and_then(Value::as_array))
                    .map(|a| entries(a))
                    .unwrap_or_default();
                return Payload {
                    items,
                    related,
                    total: total_of(value).or_else(|| total_of(data)),
                };
            }
        }

        Payload {
            items: Vec::new(),
            related: Vec::new(),
            total: total_of(value),
        }
    }
}

fn entries(rows: &[Value]) -> Vec<FreqEntry> {
    rows.iter().filter_map(entry).collect()
}

/// One entry in any of its historical shapes: a bare phrase, a
/// `[phrase, count]` pair, or an object with drifting field names.
fn entry(row: &Value) -> Option<FreqEntry> {
    match row {
        Value::String(s) => {
            let s = s.trim();
            (!s.is_empty()).then(|| FreqEntry {
                phrase: s.to_string(),
                count: 0,
            })
        }
        Value::Array(pair) => {
            let phrase = pair.first().and_then(Value::as_str)?.trim().to_string();
            if phrase.is_empty() {
                return None;
            }
            let count = pair.get(1).map(count_of).unwrap_or(0);
            Some(FreqEntry { phrase, count })
        }
        Value::Object(map) => {
            let phrase = ["phrase", "text", "word", "key", "name"]
                .iter()
                .find_map(|k| map.get(*k).and_then(Value::as_str))?
                .trim()
                .to_string();
            if phrase.is_empty() {
                return None;
            }
            let count = ["count", "value", "freq", "cnt", "shows"]
                .iter()
                .find_map(|k| map.get(*k))
                .map(count_of)
                .unwrap_or(0);
            Some(FreqEntry { phrase, count })
        }
        _ => None,
    }
}

/// Counts arrive as numbers or as display strings with separator junk.
/// Anything unparsable is 0, never an error.
fn count_of(value: &Value) -> u64 {
    match value {
        Value::Number(n) => n.as_u64().unwrap_or_else(|| {
            n.as_f64().map(|f| if f > 0.0 { f as u64 } else { 0 }).unwrap_or(0)
        }),
        Value::String(s) => {
            let cleaned: String = s
                .chars()
                .filter(|c| c.is_ascii_digit())
                .collect();
            cleaned.parse().unwrap_or(0)
        }
        _ => 0,
    }
}

fn total_of(value: &Value) -> Option<u64> {
    ["total", "totalCount", "total_count"]
        .iter()
        .find_map(|k| value.get(*k))
        .filter(|v| !v.is_null())
        .map(count_of)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decoder() -> Decoder {
        Decoder::new(Arc::new(SiteAdapter::default()))
    }

    fn api_response(body: &str) -> RawResponse {
        RawResponse {
            url: "https://wordstat.yandex.ru/stat/words".into(),
            status: 200,
            content_type: Some("application/json; charset=utf-8".into()),
            body: body.as_bytes().to_vec(),
            request_body: None,
        }
    }

    #[test]
    fn test_normalize_flat_shape() {
        let payload = Payload::normalize(&json!({
            "items": [{"phrase": "ab", "count": 10}, {"phrase": "cd", "count": 5}],
            "related": [{"phrase": "ef", "count": 2}],
            "total": 17
        }));
        assert_eq!(payload.items.len(), 2);
        assert_eq!(payload.related.len(), 1);
        assert_eq!(payload.total, Some(17));
    }

    #[test]
    fn test_normalize_legacy_rows_and_shapes() {
        let payload = Payload::normalize(&json!({
            "data": {
                "popular": [
                    "bare phrase",
                    ["pair phrase", 42],
                    {"text": "obj phrase", "value": "1 234"},
                    {"word": "freq phrase", "freq": 7}
                ],
                "assoc": [["rel", 3]],
                "totalCount": "2 000"
            }
        }));
        assert_eq!(payload.items.len(), 4);
        assert_eq!(payload.items[0], FreqEntry { phrase: "bare phrase".into(), count: 0 });
        assert_eq!(payload.items[1].count, 42);
        assert_eq!(payload.items[2].count, 1234);
        assert_eq!(payload.items[3].count, 7);
        assert_eq!(payload.related, vec![FreqEntry { phrase: "rel".into(), count: 3 }]);
        assert_eq!(payload.total, Some(2000));
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let legacy = json!({
            "data": {"items": [["a", 1], "b"], "related": [{"phrase": "c", "count": 2}]},
            "total": 3
        });
        let once = Payload::normalize(&legacy);
        let twice = Payload::normalize(&serde_json::to_value(&once).unwrap());
        assert_eq!(once, twice);

        // And a canonical payload with no total survives the round trip
        let canonical = Payload {
            items: vec![FreqEntry { phrase: "x".into(), count: 9 }],
            related: Vec::new(),
            total: None,
        };
        let again = Payload::normalize(&serde_json::to_value(&canonical).unwrap());
        assert_eq!(canonical, again);
    }

    #[test]
    fn test_charset_declared_first_then_fallbacks() {
        let candidates = charset_candidates(Some("text/html; charset=koi8-r"));
        assert_eq!(candidates[0], KOI8_R);
        assert_eq!(candidates[1], UTF_8);
        assert_eq!(candidates[2], WINDOWS_1251);
        assert_eq!(candidates.len(), 3);

        assert_eq!(charset_candidates(None), vec![UTF_8, WINDOWS_1251, KOI8_R]);
    }

    #[test]
    fn test_decode_cp1251_body() {
        // {"items":[{"phrase":"москва","count":5}]} encoded in windows-1251
        let text = r#"{"items":[{"phrase":"москва","count":5}]}"#;
        let (bytes, _, had_errors) = WINDOWS_1251.encode(text);
        assert!(!had_errors);

        let value = decode_body(&bytes, Some("application/json; charset=windows-1251")).unwrap();
        let payload = Payload::normalize(&value);
        assert_eq!(payload.items[0].phrase, "москва");
        assert_eq!(payload.items[0].count, 5);
    }

    #[test]
    fn test_same_payload_in_each_encoding_decodes_identically() {
        let text = r#"{"items":[["тест",7]],"total":7}"#;
        let mut results = Vec::new();
        for (encoding, label) in [
            (UTF_8, "utf-8"),
            (WINDOWS_1251, "windows-1251"),
            (KOI8_R, "koi8-r"),
        ] {
            let (bytes, _, had_errors) = encoding.encode(text);
            assert!(!had_errors, "{} could not represent the payload", label);
            let ct = format!("application/json; charset={}", label);
            let value = decode_body(&bytes, Some(&ct)).unwrap();
            results.push(Payload::normalize(&value));
        }
        assert_eq!(results[0], results[1]);
        assert_eq!(results[1], results[2]);
        assert_eq!(results[0].items[0].phrase, "тест");
    }

    #[test]
    fn test_undecodable_body_is_dropped() {
        // Bytes that are not valid JSON under any candidate
        let raw = RawResponse {
            body: b"<html>not json</html>".to_vec(),
            ..api_response("")
        };
        assert!(decoder().on_response(&raw).is_none());
    }

    #[test]
    fn test_correlation_prefers_request_payload() {
        let mut raw = api_response(r#"{"items":[["from body",10]],"total":10}"#);
        raw.request_body = Some(r#"{"searchValue":"from request"}"#.into());
        let decoded = decoder().on_response(&raw).unwrap();
        assert_eq!(decoded.phrase, "from request");
        assert_eq!(decoded.frequency, 10);
    }

    #[test]
    fn test_correlation_form_encoded_request() {
        let mut raw = api_response(r#"{"items":[["x",1]]}"#);
        raw.request_body = Some("page=1&searchValue=two+%D1%81%D0%BB%D0%BE%D0%B2%D0%B0".into());
        let decoded = decoder().on_response(&raw).unwrap();
        assert_eq!(decoded.phrase, "two слова");
    }

    #[test]
    fn test_form_encoded_flag_pairs_are_skipped() {
        // Pairs without '=' are legal form syntax and must not end the scan
        let mut raw = api_response(r#"{"items":[["x",1]]}"#);
        raw.request_body = Some("fresh&searchValue=dog+food&debug".into());
        let decoded = decoder().on_response(&raw).unwrap();
        assert_eq!(decoded.phrase, "dog food");
    }

    #[test]
    fn test_form_encoded_escaped_plus_is_literal() {
        // '+' is a space, %2B is a plus sign; decoding order matters
        let mut raw = api_response(r#"{"items":[["x",1]]}"#);
        raw.request_body = Some("searchValue=c%2B%2B+compiler".into());
        let decoded = decoder().on_response(&raw).unwrap();
        assert_eq!(decoded.phrase, "c++ compiler");
    }

    #[test]
    fn test_correlation_falls_back_to_first_item() {
        let raw = api_response(r#"{"items":[{"phrase":"fallback","count":3}]}"#);
        let decoded = decoder().on_response(&raw).unwrap();
        assert_eq!(decoded.phrase, "fallback");
        assert_eq!(decoded.frequency, 3);
    }

    #[test]
    fn test_no_phrase_anywhere_drops_response() {
        let raw = api_response(r#"{"total": 5}"#);
        assert!(decoder().on_response(&raw).is_none());
    }

    #[test]
    fn test_total_beats_first_item_count() {
        let raw = api_response(r#"{"items":[["a",1]],"total":999}"#);
        assert_eq!(decoder().on_response(&raw).unwrap().frequency, 999);
    }

    #[test]
    fn test_non_numeric_count_is_zero() {
        let raw = api_response(r#"{"items":[{"phrase":"a","count":"n/a"}]}"#);
        let decoded = decoder().on_response(&raw).unwrap();
        assert_eq!(decoded.frequency, 0);
    }

    #[test]
    fn test_ignores_foreign_urls_and_error_statuses() {
        let d = decoder();

        let mut foreign = api_response(r#"{"items":[["a",1]]}"#);
        foreign.url = "https://wordstat.yandex.ru/static/app.js".into();
        assert!(d.on_response(&foreign).is_none());

        let mut failed = api_response(r#"{"items":[["a",1]]}"#);
        failed.status = 500;
        assert!(d.on_response(&failed).is_none());
    }
}
