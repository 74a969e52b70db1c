//! Provider output normalization.
//!
//! Image providers do not agree on a response shape, and the same provider
//! changes shape between model versions. Everything that tolerates that
//! variability lives here: [`normalize`] flattens any [`ProviderOutput`] into
//! a list of [`NormalizedItem`]s and never fails. An empty list means
//! "nothing recognisable"; the caller decides whether that is an error.
//!
//! Recognised shapes, tried in this order:
//!
//! 1. A string holding an `http(s)` URL or a base64 `data:` URI.
//! 2. An array (or [`ProviderOutput::List`]) of any recognised shape.
//! 3. An object whose image sits under one of [`URL_FIELDS`] (recursively),
//!    or whose base64 payload sits under one of [`BASE64_FIELDS`].
//! 4. A [`DeferredUrl`] file handle, resolved at most once.
//! 5. Last resort: URL and data-URI substrings found in the serialized form
//!    of an otherwise unrecognised object. This path logs a warning.

use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, LazyLock, OnceLock};

/// Fields that historically carried an image URL or a nested image object.
pub const URL_FIELDS: &[&str] = &["url", "image", "images", "output", "result", "data"];

/// Fields that historically carried raw base64 image data.
pub const BASE64_FIELDS: &[&str] = &["b64_json", "base64", "b64"];

/// Shortest bare string accepted as raw base64 under an image field.
const MIN_RAW_BASE64_LEN: usize = 64;

static URL_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"https?://[^\s"'<>\\]+"#).expect("valid url pattern")
});

static DATA_URI_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"data:image/[A-Za-z0-9.+-]+;base64,[A-Za-z0-9+/=]+").expect("valid data uri pattern")
});

/// One image extracted from a provider response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NormalizedItem {
    RemoteUrl { url: String },
    DataUri { mime: String, base64: String },
    Base64 { data: String },
}

impl NormalizedItem {
    /// Where the bytes came from, for provenance metadata. Inline payloads are
    /// summarised rather than copied.
    pub fn source_locator(&self) -> String {
        match self {
            NormalizedItem::RemoteUrl { url } => url.clone(),
            NormalizedItem::DataUri { mime, .. } => format!("inline:{mime}"),
            NormalizedItem::Base64 { .. } => "inline:base64".to_string(),
        }
    }
}

/// A lazily resolved URL, as handed out by provider SDK file outputs.
#[derive(Clone)]
pub struct DeferredUrl {
    resolver: Arc<dyn Fn() -> Option<String> + Send + Sync>,
    resolved: Arc<OnceLock<Option<String>>>,
}

impl DeferredUrl {
    pub fn new(resolver: impl Fn() -> Option<String> + Send + Sync + 'static) -> Self {
        Self {
            resolver: Arc::new(resolver),
            resolved: Arc::new(OnceLock::new()),
        }
    }

    /// A handle whose URL is already known.
    pub fn ready(url: impl Into<String>) -> Self {
        let url = url.into();
        Self::new(move || Some(url.clone()))
    }

    /// Resolve the URL. The resolver runs at most once per handle (and its
    /// clones); later calls return the cached value.
    pub fn resolve(&self) -> Option<&str> {
        self.resolved.get_or_init(|| (self.resolver)()).as_deref()
    }
}

impl fmt::Debug for DeferredUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.resolved.get() {
            Some(url) => f.debug_tuple("DeferredUrl").field(url).finish(),
            None => f.write_str("DeferredUrl(<unresolved>)"),
        }
    }
}

/// Untrusted provider response.
#[derive(Debug, Clone)]
pub enum ProviderOutput {
    Json(Value),
    List(Vec<ProviderOutput>),
    Record(BTreeMap<String, ProviderOutput>),
    File(DeferredUrl),
}

impl From<Value> for ProviderOutput {
    fn from(value: Value) -> Self {
        ProviderOutput::Json(value)
    }
}

impl ProviderOutput {
    /// Plain JSON view, resolving file handles to their URL strings.
    pub fn to_json(&self) -> Value {
        match self {
            ProviderOutput::Json(value) => value.clone(),
            ProviderOutput::List(items) => Value::Array(items.iter().map(Self::to_json).collect()),
            ProviderOutput::Record(fields) => Value::Object(
                fields
                    .iter()
                    .map(|(key, value)| (key.clone(), value.to_json()))
                    .collect(),
            ),
            ProviderOutput::File(file) => file
                .resolve()
                .map(|url| Value::String(url.to_string()))
                .unwrap_or(Value::Null),
        }
    }
}

/// Flatten a provider response into image items, preserving order and
/// dropping exact duplicates.
pub fn normalize(raw: &ProviderOutput) -> Vec<NormalizedItem> {
    let mut items = Vec::new();
    collect_output(raw, false, &mut items);

    let mut unique: Vec<NormalizedItem> = Vec::with_capacity(items.len());
    for item in items {
        if !unique.contains(&item) {
            unique.push(item);
        }
    }
    unique
}

/// Convenience for callers holding plain JSON.
pub fn normalize_json(raw: &Value) -> Vec<NormalizedItem> {
    normalize(&ProviderOutput::Json(raw.clone()))
}

fn collect_output(raw: &ProviderOutput, under_image_field: bool, out: &mut Vec<NormalizedItem>) {
    match raw {
        ProviderOutput::Json(value) => collect_value(value, under_image_field, out),
        ProviderOutput::List(items) => {
            for item in items {
                collect_output(item, under_image_field, out);
            }
        }
        ProviderOutput::Record(fields) => {
            if collect_aliases(|key| fields.get(key).map(FieldRef::Output), out) {
                return;
            }
            scan_serialized(&raw.to_json(), out);
        }
        ProviderOutput::File(file) => {
            if let Some(url) = file.resolve() {
                if let Some(item) = classify_str(url, false) {
                    out.push(item);
                }
            }
        }
    }
}

fn collect_value(value: &Value, under_image_field: bool, out: &mut Vec<NormalizedItem>) {
    match value {
        Value::String(s) => {
            if let Some(item) = classify_str(s, under_image_field) {
                out.push(item);
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_value(item, under_image_field, out);
            }
        }
        Value::Object(fields) => {
            if collect_aliases(|key| fields.get(key).map(FieldRef::Json), out) {
                return;
            }
            scan_serialized(value, out);
        }
        Value::Null | Value::Bool(_) | Value::Number(_) => {}
    }
}

enum FieldRef<'a> {
    Json(&'a Value),
    Output(&'a ProviderOutput),
}

/// Try the known image fields of an object. Returns true once any field
/// yields at least one item.
fn collect_aliases<'a>(
    lookup: impl Fn(&str) -> Option<FieldRef<'a>>,
    out: &mut Vec<NormalizedItem>,
) -> bool {
    for key in URL_FIELDS {
        let Some(field) = lookup(*key) else { continue };
        let before = out.len();
        match field {
            FieldRef::Json(value) => collect_value(value, true, out),
            FieldRef::Output(output) => collect_output(output, true, out),
        }
        if out.len() > before {
            return true;
        }
    }

    for key in BASE64_FIELDS {
        let Some(field) = lookup(*key) else { continue };
        let text = match field {
            FieldRef::Json(Value::String(s)) => Some(s.clone()),
            FieldRef::Output(ProviderOutput::Json(Value::String(s))) => Some(s.clone()),
            _ => None,
        };
        if let Some(item) = text.as_deref().and_then(classify_base64_field) {
            out.push(item);
            return true;
        }
    }

    false
}

fn classify_str(raw: &str, under_image_field: bool) -> Option<NormalizedItem> {
    let trimmed = raw.trim();
    if trimmed.starts_with("data:") {
        return parse_data_uri(trimmed);
    }
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        return Some(NormalizedItem::RemoteUrl {
            url: trimmed.to_string(),
        });
    }
    if under_image_field && looks_like_base64(trimmed) {
        return Some(NormalizedItem::Base64 {
            data: trimmed.to_string(),
        });
    }
    None
}

fn classify_base64_field(raw: &str) -> Option<NormalizedItem> {
    let trimmed = raw.trim();
    if trimmed.starts_with("data:") {
        return parse_data_uri(trimmed);
    }
    if trimmed.is_empty() {
        return None;
    }
    Some(NormalizedItem::Base64 {
        data: trimmed.to_string(),
    })
}

/// Parse `data:<mime>;base64,<payload>`. Non-base64 data URIs are ignored.
fn parse_data_uri(raw: &str) -> Option<NormalizedItem> {
    let (meta, payload) = raw.strip_prefix("data:")?.split_once(',')?;
    let mut parts = meta.split(';');
    let mime = parts.next().map(str::trim).filter(|m| !m.is_empty());
    if !parts.any(|p| p.trim().eq_ignore_ascii_case("base64")) {
        return None;
    }
    let payload = payload.trim();
    if payload.is_empty() {
        return None;
    }
    Some(NormalizedItem::DataUri {
        mime: mime.unwrap_or("image/png").to_string(),
        base64: payload.to_string(),
    })
}

fn looks_like_base64(s: &str) -> bool {
    s.len() >= MIN_RAW_BASE64_LEN
        && s.bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'+' | b'/' | b'=' | b'-' | b'_'))
}

fn scan_serialized(value: &Value, out: &mut Vec<NormalizedItem>) {
    let serialized = value.to_string();
    let before = out.len();

    for found in DATA_URI_PATTERN.find_iter(&serialized) {
        if let Some(item) = parse_data_uri(found.as_str()) {
            out.push(item);
        }
    }
    for found in URL_PATTERN.find_iter(&serialized) {
        out.push(NormalizedItem::RemoteUrl {
            url: found.as_str().to_string(),
        });
    }

    if out.len() > before {
        tracing::warn!(
            recovered = out.len() - before,
            "Provider output had no recognised image field, recovered items by scanning serialized response"
        );
    }
}
