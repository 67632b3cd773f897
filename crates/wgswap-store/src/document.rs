//! Outbound Settings Document
//!
//! Pure mutation of the proxy's JSON configuration document. The same
//! function backs the dry run and the real write; persistence lives in
//! [`crate::store`].
//!
//! Only the settings object of the outbound whose `tag` matches is touched,
//! and only the fields the payload provides are written into it (field-level
//! merge). Every other key keeps its value and position.
//!
//! [`rewrite_document`] splices the merged settings back into the stored
//! text. Bytes outside the target `settings` object are copied through
//! unchanged, so sibling outbounds keep their exact number spellings,
//! escapes and indentation.

use serde::{Deserialize, Serialize};
use serde_json::ser::{PrettyFormatter, Serializer};
use serde_json::value::RawValue;
use serde_json::{Map, Value};
use std::fmt;

/// Document errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DocumentError {
    #[error("Failed to parse config JSON: {0}")]
    Parse(String),

    #[error("Invalid or missing 'outbounds' field in config")]
    MissingOutbounds,

    #[error("Tag '{0}' not found in 'outbounds'")]
    TagNotFound(String),

    #[error("Tag '{0}' matches more than one outbound")]
    DuplicateTag(String),

    #[error("Invalid settings format for '{tag}': {reason}")]
    InvalidSettings { tag: String, reason: String },

    #[error("Failed to serialize config JSON: {0}")]
    Serialize(String),
}

/// One WireGuard peer of an outbound
#[derive(Clone, PartialEq, Eq)]
pub struct PeerSettings {
    /// Server public key (base64)
    pub public_key: String,
    /// `ip:port`
    pub endpoint: String,
    /// Persistent keep-alive (seconds); left untouched when `None`
    pub keep_alive: Option<u32>,
}

/// Replacement values for an outbound's `settings` object
#[derive(Clone, PartialEq, Eq)]
pub struct OutboundSettings {
    /// Client private key (base64)
    pub secret_key: String,
    /// Client addresses (CIDR)
    pub address: Vec<String>,
    /// Peers, merged by position
    pub peers: Vec<PeerSettings>,
    /// Interface MTU
    pub mtu: Option<u32>,
    /// Worker count
    pub workers: Option<u32>,
    /// Domain resolution strategy
    pub domain_strategy: Option<String>,
}

impl OutboundSettings {
    /// Placeholder payload carrying only the real secret key.
    ///
    /// Used for the dry run before any peer is known.
    pub fn placeholder(secret_key: impl Into<String>) -> Self {
        Self {
            secret_key: secret_key.into(),
            address: vec!["simulate".to_string()],
            peers: vec![PeerSettings {
                public_key: "simulate".to_string(),
                endpoint: "simulate".to_string(),
                keep_alive: None,
            }],
            mtu: None,
            workers: None,
            domain_strategy: None,
        }
    }

    fn merge_into(&self, tag: &str, settings: &mut Map<String, Value>) -> Result<(), DocumentError> {
        let invalid = |reason: &str| DocumentError::InvalidSettings {
            tag: tag.to_string(),
            reason: reason.to_string(),
        };

        settings.insert("secretKey".into(), Value::String(self.secret_key.clone()));
        settings.insert(
            "address".into(),
            Value::Array(self.address.iter().cloned().map(Value::String).collect()),
        );
        if let Some(mtu) = self.mtu {
            settings.insert("mtu".into(), Value::from(mtu));
        }
        if let Some(workers) = self.workers {
            settings.insert("workers".into(), Value::from(workers));
        }
        if let Some(strategy) = &self.domain_strategy {
            settings.insert("domainStrategy".into(), Value::String(strategy.clone()));
        }

        if self.peers.is_empty() {
            return Ok(());
        }

        let peers = settings
            .entry("peers")
            .or_insert_with(|| Value::Array(Vec::new()))
            .as_array_mut()
            .ok_or_else(|| invalid("'peers' is not an array"))?;

        for (i, peer) in self.peers.iter().enumerate() {
            if peers.len() <= i {
                peers.push(Value::Object(Map::new()));
            }
            let existing = peers[i]
                .as_object_mut()
                .ok_or_else(|| invalid("peer entry is not an object"))?;

            existing.insert("publicKey".into(), Value::String(peer.public_key.clone()));
            existing.insert("endpoint".into(), Value::String(peer.endpoint.clone()));
            if let Some(keep_alive) = peer.keep_alive {
                existing.insert("keepAlive".into(), Value::from(keep_alive));
            }
        }

        Ok(())
    }
}

impl fmt::Debug for OutboundSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutboundSettings")
            .field("secret_key", &"[redacted]")
            .field("address", &self.address)
            .field("peers", &self.peers)
            .field("mtu", &self.mtu)
            .field("workers", &self.workers)
            .field("domain_strategy", &self.domain_strategy)
            .finish()
    }
}

impl fmt::Debug for PeerSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerSettings")
            .field("public_key", &self.public_key)
            .field("endpoint", &self.endpoint)
            .field("keep_alive", &self.keep_alive)
            .finish()
    }
}

/// Parse the stored document text
pub fn parse_document(raw: &str) -> Result<Value, DocumentError> {
    serde_json::from_str(raw).map_err(|e| DocumentError::Parse(e.to_string()))
}

/// Serialize a document, pretty-printed if `pretty`
pub fn render_document(document: &Value, pretty: bool) -> Result<String, DocumentError> {
    let rendered = if pretty {
        serde_json::to_string_pretty(document)
    } else {
        serde_json::to_string(document)
    };
    rendered.map_err(|e| DocumentError::Serialize(e.to_string()))
}

/// Compute the document with `tag`'s settings merged with `settings`.
///
/// The input is not modified. Exactly one outbound must carry `tag`.
pub fn compute_new_document(
    document: &Value,
    tag: &str,
    settings: &OutboundSettings,
) -> Result<Value, DocumentError> {
    let mut updated = document.clone();

    let outbounds = updated
        .get_mut("outbounds")
        .and_then(Value::as_array_mut)
        .ok_or(DocumentError::MissingOutbounds)?;

    let mut matching = outbounds
        .iter_mut()
        .filter_map(Value::as_object_mut)
        .filter(|entry| entry.get("tag").and_then(Value::as_str) == Some(tag));

    let entry = matching.next()
        .ok_or_else(|| DocumentError::TagNotFound(tag.to_string()))?;
    if matching.next().is_some() {
        return Err(DocumentError::DuplicateTag(tag.to_string()));
    }

    let existing = entry
        .get_mut("settings")
        .and_then(Value::as_object_mut)
        .ok_or_else(|| DocumentError::InvalidSettings {
            tag: tag.to_string(),
            reason: "'settings' is missing or not an object".to_string(),
        })?;

    settings.merge_into(tag, existing)?;

    Ok(updated)
}

/// Top level of the stored text, borrowing each outbound verbatim
#[derive(Deserialize)]
struct RawDocument<'a> {
    #[serde(borrow, default)]
    outbounds: Option<Vec<&'a RawValue>>,
}

#[derive(Deserialize)]
struct RawOutbound<'a> {
    #[serde(default)]
    tag: Option<Value>,
    #[serde(borrow, default)]
    settings: Option<&'a RawValue>,
}

/// Rewrite the stored text with `tag`'s settings merged with `settings`.
///
/// Only the target `settings` object is re-serialized. It is written
/// compact if it was on one line, otherwise pretty-printed with the
/// indentation it was stored with.
pub fn rewrite_document(
    raw: &str,
    tag: &str,
    settings: &OutboundSettings,
) -> Result<String, DocumentError> {
    let updated = compute_new_document(&parse_document(raw)?, tag, settings)?;

    let (index, span) = locate_settings(raw, tag)?;
    let start = offset_within(raw, span.get());
    let end = start + span.get().len();

    let replacement = render_settings(&updated["outbounds"][index]["settings"], raw, start, span.get())?;

    let mut text = String::with_capacity(raw.len() - span.get().len() + replacement.len());
    text.push_str(&raw[..start]);
    text.push_str(&replacement);
    text.push_str(&raw[end..]);
    Ok(text)
}

/// Index of the outbound carrying `tag` and its raw `settings` value
fn locate_settings<'a>(raw: &'a str, tag: &str) -> Result<(usize, &'a RawValue), DocumentError> {
    let invalid = |reason: String| DocumentError::InvalidSettings {
        tag: tag.to_string(),
        reason,
    };

    let document: RawDocument<'a> =
        serde_json::from_str(raw).map_err(|e| DocumentError::Parse(e.to_string()))?;
    let outbounds = document.outbounds.ok_or(DocumentError::MissingOutbounds)?;

    for (index, entry) in outbounds.into_iter().enumerate() {
        if !entry.get().starts_with('{') {
            continue;
        }
        let outbound: RawOutbound<'a> =
            serde_json::from_str(entry.get()).map_err(|e| invalid(e.to_string()))?;
        if outbound.tag.as_ref().and_then(Value::as_str) == Some(tag) {
            let settings = outbound.settings
                .ok_or_else(|| invalid("'settings' is missing".to_string()))?;
            return Ok((index, settings));
        }
    }

    Err(DocumentError::TagNotFound(tag.to_string()))
}

/// Byte offset of `inner`, a slice borrowed from `outer`
fn offset_within(outer: &str, inner: &str) -> usize {
    inner.as_ptr() as usize - outer.as_ptr() as usize
}

fn render_settings(
    value: &Value,
    raw: &str,
    start: usize,
    original: &str,
) -> Result<String, DocumentError> {
    if !original.contains('\n') {
        return render_document(value, false);
    }

    // Indentation of the line the object opens on, and one level below it
    let line_start = raw[..start].rfind('\n').map_or(0, |i| i + 1);
    let base = leading_whitespace(&raw[line_start..]);
    let indent = original
        .lines()
        .nth(1)
        .map(leading_whitespace)
        .and_then(|inner| inner.strip_prefix(base))
        .filter(|unit| !unit.is_empty())
        .unwrap_or("  ");

    let mut buf = Vec::new();
    let mut serializer = Serializer::with_formatter(&mut buf, PrettyFormatter::with_indent(indent.as_bytes()));
    value
        .serialize(&mut serializer)
        .map_err(|e| DocumentError::Serialize(e.to_string()))?;
    let rendered = String::from_utf8(buf).map_err(|e| DocumentError::Serialize(e.to_string()))?;

    Ok(rendered.replace('\n', &format!("\n{}", base)))
}

fn leading_whitespace(line: &str) -> &str {
    let trimmed = line.trim_start_matches([' ', '\t']);
    &line[..line.len() - trimmed.len()]
}
