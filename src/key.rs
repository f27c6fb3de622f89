//! Cache key descriptors.
//!
//! A key is a namespace plus an ordered list of identifier segments. The
//! canonical string form is deterministic: the same logical key always
//! serializes to the same bytes, which is what the memory map, the dedup
//! map, and the disk filenames all hash or compare against.

use std::fmt;

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Cache-key category. Each namespace carries its own TTL policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Namespace {
    DataSource,
    Database,
    User,
    Page,
    Block,
    Search,
    Comment,
}

impl Namespace {
    pub fn as_str(self) -> &'static str {
        match self {
            Namespace::DataSource => "data_source",
            Namespace::Database => "database",
            Namespace::User => "user",
            Namespace::Page => "page",
            Namespace::Block => "block",
            Namespace::Search => "search",
            Namespace::Comment => "comment",
        }
    }

    /// Recover the namespace from a canonical key string.
    pub fn of_canonical(canonical: &str) -> Option<Namespace> {
        let prefix = canonical.split(':').next().unwrap_or(canonical);
        Namespace::all().iter().copied().find(|ns| ns.as_str() == prefix)
    }

    pub fn all() -> &'static [Namespace] {
        &[
            Namespace::DataSource,
            Namespace::Database,
            Namespace::User,
            Namespace::Page,
            Namespace::Block,
            Namespace::Search,
            Namespace::Comment,
        ]
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Descriptor addressing one cached slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    namespace: Namespace,
    identifiers: Vec<String>,
}

impl CacheKey {
    /// Key with plain identifier segments. An empty list is valid and
    /// addresses a single namespace-wide slot.
    pub fn new<I, S>(namespace: Namespace, identifiers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { namespace, identifiers: identifiers.into_iter().map(Into::into).collect() }
    }

    /// Namespace-wide key with no identifiers.
    pub fn bare(namespace: Namespace) -> Self {
        Self { namespace, identifiers: Vec::new() }
    }

    /// Append a composite segment in canonical JSON form (object keys
    /// sorted), so structurally equal values produce equal keys.
    pub fn push_json(mut self, value: &Value) -> Self {
        self.identifiers.push(canonical_json(value));
        self
    }

    pub fn push(mut self, segment: impl Into<String>) -> Self {
        self.identifiers.push(segment.into());
        self
    }

    pub fn namespace(&self) -> Namespace {
        self.namespace
    }

    pub fn identifiers(&self) -> &[String] {
        &self.identifiers
    }

    /// Deterministic string form: `namespace` or `namespace:id1:id2:…`.
    pub fn canonical(&self) -> String {
        if self.identifiers.is_empty() {
            self.namespace.as_str().to_string()
        } else {
            let mut out = String::from(self.namespace.as_str());
            for id in &self.identifiers {
                out.push(':');
                out.push_str(id);
            }
            out
        }
    }

    /// Filename stem for the disk tier: first 16 hex chars of the SHA-256
    /// of the canonical form.
    pub fn file_stem(&self) -> String {
        hash_key(&self.canonical())
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())
    }
}

/// Short fixed-length hash of an already-canonical key string.
pub fn hash_key(canonical: &str) -> String {
    let digest = Sha256::digest(canonical.as_bytes());
    hex::encode(&digest[..8])
}

/// JSON with object keys recursively sorted. Arrays keep their order;
/// identifier sequences are ordered by definition.
pub fn canonical_json(value: &Value) -> String {
    fn write(value: &Value, out: &mut String) {
        match value {
            Value::Object(map) => {
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                out.push('{');
                for (i, k) in keys.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    out.push_str(&Value::String((*k).clone()).to_string());
                    out.push(':');
                    write(&map[*k], out);
                }
                out.push('}');
            }
            Value::Array(items) => {
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    write(item, out);
                }
                out.push(']');
            }
            other => out.push_str(&other.to_string()),
        }
    }
    let mut out = String::new();
    write(value, &mut out);
    out
}
