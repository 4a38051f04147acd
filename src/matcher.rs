//! Read-stream matchers and their persisted, HMAC-fingerprinted form.
//!
//! A matcher decides whether a committed document belongs in a secondary
//! index. Object-equality matchers round-trip through the catalog file
//! directly as JSON; predicate matchers are stored as source text plus an
//! HMAC fingerprint, since source text re-evaluated on reopen is a code
//! injection risk if the fingerprint can't be trusted.

use std::path::PathBuf;
use std::sync::Arc;

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::Sha256;

use crate::error::{Result, StoreError};
use crate::partition::hash32;

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone)]
pub enum Matcher {
    /// Metadata subset equality: every named field must equal the given value.
    MetadataEquals(Map<String, Value>),
    /// An arbitrary predicate, persisted as source text plus its fingerprint.
    Predicate {
        source: String,
        func: Arc<dyn Fn(&Value) -> bool + Send + Sync>,
    },
    /// The implicit read stream every write stream carries: "documents in
    /// partition p" (spec.md §3). Never matched through [`Self::matches`] —
    /// the storage coordinator feeds this stream's index directly off the
    /// partition it shadows, since content matching is meaningless here.
    WritePartition(u32),
}

impl Matcher {
    pub fn matches(&self, document: &Value) -> bool {
        match self {
            Matcher::MetadataEquals(fields) => {
                let metadata = document.get("metadata");
                fields.iter().all(|(key, expected)| {
                    metadata.and_then(|m| m.get(key)) == Some(expected)
                })
            }
            Matcher::Predicate { func, .. } => func(document),
            Matcher::WritePartition(_) => false,
        }
    }

    fn source_text(&self) -> String {
        match self {
            Matcher::MetadataEquals(fields) => {
                serde_json::to_string(fields).unwrap_or_default()
            }
            Matcher::Predicate { source, .. } => source.clone(),
            Matcher::WritePartition(_) => String::new(),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Matcher::MetadataEquals(_) => "metadata-equals",
            Matcher::Predicate { .. } => "predicate",
            Matcher::WritePartition(_) => "write-partition",
        }
    }
}

/// On-disk form of a matcher, as stored in `<storage>.streams`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamCatalogEntry {
    pub stream_name: String,
    pub matcher_kind: String,
    pub matcher_source: String,
    pub matcher_hmac: String,
    pub write_partition: Option<String>,
}

pub fn fingerprint(secret: &[u8], source: &str) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|e| StoreError::InvalidArgument(format!("invalid HMAC secret: {e}")))?;
    mac.update(source.as_bytes());
    Ok(hex_encode(&mac.finalize().into_bytes()))
}

pub fn persist_entry(
    stream_name: &str,
    matcher: &Matcher,
    write_partition: Option<String>,
    secret: Option<&[u8]>,
) -> Result<StreamCatalogEntry> {
    let source = matcher.source_text();
    let matcher_hmac = match (matcher, secret) {
        (Matcher::Predicate { .. }, Some(secret)) => fingerprint(secret, &source)?,
        (Matcher::Predicate { .. }, None) => {
            return Err(StoreError::InvalidArgument(
                "predicate matchers require an HMAC secret to persist safely".to_string(),
            ));
        }
        (Matcher::MetadataEquals(_), Some(secret)) => fingerprint(secret, &source)?,
        (Matcher::MetadataEquals(_), None) => String::new(),
        (Matcher::WritePartition(_), _) => String::new(),
    };
    Ok(StreamCatalogEntry {
        stream_name: stream_name.to_string(),
        matcher_kind: matcher.kind().to_string(),
        matcher_source: source,
        matcher_hmac,
        write_partition,
    })
}

/// Verifies a catalog entry's fingerprint before its matcher may be
/// reconstituted. Object-equality matchers without a secret are always
/// trusted (there is no code to inject); predicate matchers without a
/// verifiable fingerprint are rejected outright.
pub fn verify_entry(entry: &StreamCatalogEntry, secret: Option<&[u8]>) -> Result<()> {
    if entry.matcher_kind == "predicate" {
        let secret = secret.ok_or_else(|| {
            StoreError::InvalidArgument(format!(
                "stream {:?} has a predicate matcher but no HMAC secret was provided",
                entry.stream_name
            ))
        })?;
        let expected = fingerprint(secret, &entry.matcher_source)?;
        if expected != entry.matcher_hmac {
            return Err(StoreError::InvalidArgument(format!(
                "matcher fingerprint mismatch for stream {:?}",
                entry.stream_name
            )));
        }
    }
    Ok(())
}

pub fn metadata_equals_from_entry(entry: &StreamCatalogEntry) -> Result<Matcher> {
    let fields: Map<String, Value> = serde_json::from_str(&entry.matcher_source).map_err(|e| {
        StoreError::CorruptFile {
            path: std::path::PathBuf::new(),
            reason: format!("catalog entry {:?} has invalid matcher source: {e}", entry.stream_name),
        }
    })?;
    Ok(Matcher::MetadataEquals(fields))
}

/// Reconstructs a catalog entry's matcher, branching on `matcher_kind`
/// rather than assuming every entry is object-equality. Predicate matchers
/// carry no executable code in the catalog (only their source text and
/// fingerprint), so they can't be reconstructed from a reopen alone; this
/// returns `Ok(None)` for them rather than failing the whole catalog load —
/// the caller re-supplies the closure via `create_stream` if it needs that
/// stream back.
pub fn matcher_from_entry(entry: &StreamCatalogEntry) -> Result<Option<Matcher>> {
    match entry.matcher_kind.as_str() {
        "metadata-equals" => Ok(Some(metadata_equals_from_entry(entry)?)),
        "write-partition" => {
            let name = entry.write_partition.as_deref().ok_or_else(|| StoreError::CorruptFile {
                path: PathBuf::new(),
                reason: format!(
                    "write-partition catalog entry {:?} is missing its write_partition name",
                    entry.stream_name
                ),
            })?;
            Ok(Some(Matcher::WritePartition(hash32(name))))
        }
        "predicate" => Ok(None),
        other => Err(StoreError::CorruptFile {
            path: PathBuf::new(),
            reason: format!("unknown matcher kind {other:?} for stream {:?}", entry.stream_name),
        }),
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push(HEX[(byte >> 4) as usize] as char);
        out.push(HEX[(byte & 0x0f) as usize] as char);
    }
    out
}
