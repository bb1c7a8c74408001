//! Schema-Aware Payload Compression
//!
//! Reversible compression tuned for catalog JSON. Three passes run at `set`
//! time and are undone in reverse order on read:
//!
//! ```text
//!   compress:   collapse whitespace → alias keys → intern URL bases
//!   decompress: restore table → expand tokens → restore keys
//! ```
//!
//! # Example
//!
//! ```
//! use iptv_cache::cache::compression::SchemaCodec;
//!
//! let codec = SchemaCodec::standard();
//! let plain = r#"[{"name":"A","url":"http://cdn.example.tv/live/1.ts"},{"name":"B","url":"http://cdn.example.tv/live/2.ts"}]"#;
//!
//! let packed = codec.compress(plain).unwrap();
//! assert!(packed.len() < plain.len());
//! assert_eq!(codec.decompress("doc", &packed).unwrap(), plain);
//! ```
//!
//! # Envelope
//!
//! Compressed payloads are `{"r":[<interned bases>],"d":<aliased document>}`.
//! Whether a payload is compressed is recorded in the entry metadata and
//! never sniffed from the bytes, so compressing twice is harmless.

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use once_cell::sync::Lazy;
use serde::Serialize;
use serde_json::{Map, Value};

use super::entry::ContentType;
use super::policy::CompressionPolicy;
use crate::error::{Error, Result};

/// Prefix marking a literal key that must not be alias-expanded
pub const ALIAS_ESCAPE: char = '~';

/// Prefix of an interned-string reference token
pub const TOKEN_MARK: char = '@';

/// Terminates the index part of a reference token
pub const TOKEN_END: char = '|';

/// Shortest URL base worth interning
pub const MIN_INTERN_LEN: usize = 12;

/// A base must repeat at least this often to be interned
pub const MIN_INTERN_OCCURRENCES: usize = 2;

/// Field aliases for M3U, Xtream and internal catalog fields
pub const DEFAULT_ALIASES: &[(&str, &str)] = &[
    ("name", "n"),
    ("url", "u"),
    ("logo", "l"),
    ("group", "g"),
    ("tvg_id", "ti"),
    ("type", "t"),
    ("seq", "q"),
    ("category", "c"),
    ("has_logo", "hl"),
    ("stream_id", "si"),
    ("stream_icon", "sc"),
    ("stream_type", "st"),
    ("category_id", "ci"),
    ("category_name", "cn"),
    ("epg_channel_id", "ei"),
    ("added", "a"),
    ("is_adult", "ad"),
    ("direct_source", "ds"),
    ("custom_sid", "cs"),
    ("tv_archive", "ta"),
];

static STANDARD_ALIASES: Lazy<AliasTable> = Lazy::new(|| {
    AliasTable::new(DEFAULT_ALIASES.iter().copied()).unwrap_or_else(|e| {
        tracing::error!("Default alias table rejected, key aliasing disabled: {}", e);
        AliasTable::default()
    })
});

// =============================================================================
// Key Aliases
// =============================================================================

/// Bidirectional, one-to-one field alias table
#[derive(Debug, Clone, Default)]
pub struct AliasTable {
    forward: HashMap<String, String>,
    inverse: HashMap<String, String>,
}

impl AliasTable {
    /// Build a table, rejecting anything that would make decoding ambiguous
    pub fn new<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Result<Self> {
        let mut table = Self::default();
        for (full, alias) in pairs {
            if full.is_empty() || alias.is_empty() {
                return Err(Error::Config("alias pairs must be non-empty".into()));
            }
            if full.starts_with(ALIAS_ESCAPE) || alias.starts_with(ALIAS_ESCAPE) {
                return Err(Error::Config(format!(
                    "alias pair {full}->{alias} uses the escape prefix"
                )));
            }
            if table.forward.contains_key(full) {
                return Err(Error::Config(format!("duplicate field '{full}'")));
            }
            if let Some(prev) = table.inverse.get(alias) {
                return Err(Error::Config(format!(
                    "alias '{alias}' maps both '{prev}' and '{full}'"
                )));
            }
            table.forward.insert(full.to_string(), alias.to_string());
            table.inverse.insert(alias.to_string(), full.to_string());
        }

        if let Some(clash) = table.inverse.keys().find(|a| table.forward.contains_key(*a)) {
            return Err(Error::Config(format!(
                "alias '{clash}' is also a full field name"
            )));
        }
        Ok(table)
    }

    /// Table built from [`DEFAULT_ALIASES`]
    pub fn standard() -> &'static AliasTable {
        &STANDARD_ALIASES
    }

    /// Number of alias pairs
    pub fn len(&self) -> usize {
        self.forward.len()
    }

    /// True when no aliases are defined
    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }

    /// Alias a key; literal keys that look like aliases are escaped
    pub fn encode_key<'k>(&self, key: &'k str) -> Cow<'k, str> {
        if let Some(alias) = self.forward.get(key) {
            Cow::Owned(alias.clone())
        } else if key.starts_with(ALIAS_ESCAPE) || self.inverse.contains_key(key) {
            Cow::Owned(format!("{ALIAS_ESCAPE}{key}"))
        } else {
            Cow::Borrowed(key)
        }
    }

    /// Invert [`encode_key`](Self::encode_key)
    pub fn decode_key<'k>(&self, key: &'k str) -> Cow<'k, str> {
        if let Some(literal) = key.strip_prefix(ALIAS_ESCAPE) {
            Cow::Borrowed(literal)
        } else if let Some(full) = self.inverse.get(key) {
            Cow::Owned(full.clone())
        } else {
            Cow::Borrowed(key)
        }
    }
}

// =============================================================================
// String Interning
// =============================================================================

/// Repeated-prefix table for URL-like strings
#[derive(Debug, Default)]
struct Interner {
    bases: Vec<String>,
    index: HashMap<String, usize>,
}

impl Interner {
    /// Scan a document and intern every URL base that repeats
    fn scan(doc: &Value) -> Self {
        let mut counts: HashMap<&str, usize> = HashMap::new();
        let mut order: Vec<&str> = Vec::new();
        collect_bases(doc, &mut counts, &mut order);

        let mut interner = Self::default();
        for base in order {
            if counts.get(base).copied().unwrap_or(0) >= MIN_INTERN_OCCURRENCES {
                interner.index.insert(base.to_string(), interner.bases.len());
                interner.bases.push(base.to_string());
            }
        }
        interner
    }

    fn encode(&self, s: &str) -> String {
        if let Some(base) = url_base(s) {
            if let Some(idx) = self.index.get(base) {
                return format!("{TOKEN_MARK}{idx}{TOKEN_END}{}", &s[base.len()..]);
            }
        }
        if s.starts_with(TOKEN_MARK) {
            format!("{TOKEN_MARK}{s}")
        } else {
            s.to_string()
        }
    }
}

fn collect_bases<'a>(v: &'a Value, counts: &mut HashMap<&'a str, usize>, order: &mut Vec<&'a str>) {
    match v {
        Value::String(s) => {
            if let Some(base) = url_base(s) {
                let count = counts.entry(base).or_insert(0);
                if *count == 0 {
                    order.push(base);
                }
                *count += 1;
            }
        }
        Value::Array(items) => items.iter().for_each(|i| collect_bases(i, counts, order)),
        Value::Object(map) => map.values().for_each(|i| collect_bases(i, counts, order)),
        _ => {}
    }
}

/// Everything up to and including the last `/` of a URL-like string
fn url_base(s: &str) -> Option<&str> {
    if !s.contains("://") {
        return None;
    }
    let cut = s.rfind('/')? + 1;
    (cut >= MIN_INTERN_LEN).then(|| &s[..cut])
}

fn decode_string(key: &str, s: String, table: &[String]) -> Result<String> {
    let Some(rest) = s.strip_prefix(TOKEN_MARK) else {
        return Ok(s);
    };
    if rest.starts_with(TOKEN_MARK) {
        return Ok(rest.to_string());
    }
    let (idx, tail) = rest
        .split_once(TOKEN_END)
        .ok_or_else(|| Error::corrupt(key, format!("unterminated reference token in {s:?}")))?;
    let idx: usize = idx
        .parse()
        .map_err(|_| Error::corrupt(key, format!("bad reference index in {s:?}")))?;
    let base = table
        .get(idx)
        .ok_or_else(|| Error::corrupt(key, format!("reference {idx} outside table")))?;
    Ok(format!("{base}{tail}"))
}

// =============================================================================
// Schema Codec
// =============================================================================

/// Reversible schema-aware codec
#[derive(Debug, Clone)]
pub struct SchemaCodec {
    aliases: AliasTable,
}

impl Default for SchemaCodec {
    fn default() -> Self {
        Self::standard()
    }
}

impl SchemaCodec {
    /// Codec using the standard alias table
    pub fn standard() -> Self {
        Self::with_aliases(AliasTable::standard().clone())
    }

    /// Codec using a custom alias table
    pub fn with_aliases(aliases: AliasTable) -> Self {
        Self { aliases }
    }

    /// Alias table in use
    pub fn aliases(&self) -> &AliasTable {
        &self.aliases
    }

    /// Compress a JSON document
    ///
    /// Fails only when `plain` is not valid JSON.
    pub fn compress(&self, plain: &str) -> Result<String> {
        let doc: Value = serde_json::from_str(plain)?;
        let interner = Interner::scan(&doc);
        let data = self.encode_value(doc, &interner);

        let mut envelope = Map::new();
        envelope.insert(
            "r".to_string(),
            Value::Array(interner.bases.into_iter().map(Value::String).collect()),
        );
        envelope.insert("d".to_string(), data);
        Ok(serde_json::to_string(&Value::Object(envelope))?)
    }

    /// Decompress a payload produced by [`compress`](Self::compress)
    ///
    /// The result is the compact serialization of the original document.
    pub fn decompress(&self, key: &str, packed: &str) -> Result<String> {
        let envelope: Value =
            serde_json::from_str(packed).map_err(|e| Error::corrupt(key, e))?;
        let Value::Object(mut envelope) = envelope else {
            return Err(Error::corrupt(key, "compressed envelope is not an object"));
        };

        let table = match envelope.remove("r") {
            Some(Value::Array(items)) => items
                .into_iter()
                .map(|v| match v {
                    Value::String(s) => Ok(s),
                    other => Err(Error::corrupt(key, format!("non-string reference {other}"))),
                })
                .collect::<Result<Vec<_>>>()?,
            _ => return Err(Error::corrupt(key, "missing reference table")),
        };
        let data = envelope
            .remove("d")
            .ok_or_else(|| Error::corrupt(key, "missing document"))?;

        let doc = self.decode_value(key, data, &table)?;
        Ok(serde_json::to_string(&doc)?)
    }

    fn encode_value(&self, v: Value, interner: &Interner) -> Value {
        match v {
            Value::Object(map) => Value::Object(
                map.into_iter()
                    .map(|(k, v)| {
                        (
                            self.aliases.encode_key(&k).into_owned(),
                            self.encode_value(v, interner),
                        )
                    })
                    .collect(),
            ),
            Value::Array(items) => Value::Array(
                items
                    .into_iter()
                    .map(|v| self.encode_value(v, interner))
                    .collect(),
            ),
            Value::String(s) => Value::String(interner.encode(&s)),
            other => other,
        }
    }

    fn decode_value(&self, key: &str, v: Value, table: &[String]) -> Result<Value> {
        Ok(match v {
            Value::Object(map) => Value::Object(
                map.into_iter()
                    .map(|(k, v)| {
                        Ok((
                            self.aliases.decode_key(&k).into_owned(),
                            self.decode_value(key, v, table)?,
                        ))
                    })
                    .collect::<Result<Map<String, Value>>>()?,
            ),
            Value::Array(items) => Value::Array(
                items
                    .into_iter()
                    .map(|v| self.decode_value(key, v, table))
                    .collect::<Result<Vec<_>>>()?,
            ),
            Value::String(s) => Value::String(decode_string(key, s, table)?),
            other => other,
        })
    }
}

// =============================================================================
// Compression Manager
// =============================================================================

/// Compression statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CompressionStats {
    /// Payloads stored compressed
    pub compressed: u64,
    /// Payloads below threshold or not smaller after compression
    pub skipped: u64,
    /// Payloads stored plain because compression failed
    pub fallbacks: u64,
    /// Plain bytes fed into successful compressions
    pub bytes_in: u64,
    /// Compressed bytes produced
    pub bytes_out: u64,
}

impl CompressionStats {
    /// Compressed-to-plain ratio (1.0 when nothing was compressed)
    pub fn ratio(&self) -> f64 {
        if self.bytes_in == 0 {
            1.0
        } else {
            self.bytes_out as f64 / self.bytes_in as f64
        }
    }
}

/// Applies the codec according to policy, falling back to plain storage
#[derive(Debug)]
pub struct CompressionManager {
    policy: CompressionPolicy,
    codec: SchemaCodec,
    compressed: AtomicU64,
    skipped: AtomicU64,
    fallbacks: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
}

impl CompressionManager {
    /// Create with default policy and the standard codec
    pub fn new() -> Self {
        Self::with_policy(CompressionPolicy::default())
    }

    /// Create with a custom policy
    pub fn with_policy(policy: CompressionPolicy) -> Self {
        Self {
            policy,
            codec: SchemaCodec::standard(),
            compressed: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            fallbacks: AtomicU64::new(0),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
        }
    }

    /// Policy in use
    pub fn policy(&self) -> &CompressionPolicy {
        &self.policy
    }

    /// Compress `plain` if policy says so
    ///
    /// Returns `(stored, compressed)`. The compressed form is only kept when
    /// it is actually smaller.
    pub fn compress(&self, content_type: ContentType, plain: &str) -> (String, bool) {
        if !self.policy.should_compress(content_type, plain.len()) {
            self.skipped.fetch_add(1, Ordering::Relaxed);
            return (plain.to_string(), false);
        }

        match self.codec.compress(plain) {
            Ok(packed) if packed.len() < plain.len() => {
                self.compressed.fetch_add(1, Ordering::Relaxed);
                self.bytes_in.fetch_add(plain.len() as u64, Ordering::Relaxed);
                self.bytes_out.fetch_add(packed.len() as u64, Ordering::Relaxed);
                (packed, true)
            }
            Ok(_) => {
                self.skipped.fetch_add(1, Ordering::Relaxed);
                (plain.to_string(), false)
            }
            Err(e) => {
                tracing::warn!("Compression failed, storing uncompressed: {}", e);
                self.fallbacks.fetch_add(1, Ordering::Relaxed);
                (plain.to_string(), false)
            }
        }
    }

    /// Undo [`compress`](Self::compress) given the out-of-band flag
    pub fn decompress(&self, key: &str, stored: String, compressed: bool) -> Result<String> {
        if compressed {
            self.codec.decompress(key, &stored)
        } else {
            Ok(stored)
        }
    }

    /// Snapshot of counters
    pub fn stats(&self) -> CompressionStats {
        CompressionStats {
            compressed: self.compressed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
        }
    }
}

impl Default for CompressionManager {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    fn roundtrip(plain: &str) -> String {
        let codec = SchemaCodec::standard();
        let packed = codec.compress(plain).unwrap();
        codec.decompress("test", &packed).unwrap()
    }

    #[test]
    fn test_standard_table_is_valid() {
        let table = AliasTable::new(DEFAULT_ALIASES.iter().copied()).unwrap();
        assert_eq!(table.len(), DEFAULT_ALIASES.len());
        assert_eq!(AliasTable::standard().len(), DEFAULT_ALIASES.len());
    }

    #[test]
    fn test_alias_table_rejects_collisions() {
        // stream_id and stream_icon both claiming "si"
        assert_matches!(
            AliasTable::new([("stream_id", "si"), ("stream_icon", "si")]),
            Err(Error::Config(_))
        );
        assert_matches!(
            AliasTable::new([("name", "n"), ("name", "nm")]),
            Err(Error::Config(_))
        );
        // alias equal to another full name
        assert_matches!(
            AliasTable::new([("name", "url"), ("url", "u")]),
            Err(Error::Config(_))
        );
        assert_matches!(AliasTable::new([("~x", "x")]), Err(Error::Config(_)));
    }

    #[test]
    fn test_key_escape_roundtrip() {
        let table = AliasTable::standard();
        for key in ["name", "n", "~n", "~", "", "unknown", "si", "stream_icon"] {
            let encoded = table.encode_key(key);
            assert_eq!(table.decode_key(&encoded), key, "key {key:?}");
        }
        assert_eq!(table.encode_key("name"), "n");
        assert_eq!(table.encode_key("n"), "~n");
    }

    #[test]
    fn test_collapses_whitespace() {
        let pretty = "[\n  {\n    \"name\": \"A\",\n    \"id\": \"1\"\n  }\n]";
        assert_eq!(roundtrip(pretty), r#"[{"name":"A","id":"1"}]"#);
    }

    #[test]
    fn test_preserves_key_order_and_literals() {
        let plain = r#"{"z":1,"n":"literal alias","name":"x","@":"@0|not a token","~k":[true,null,-3]}"#;
        assert_eq!(roundtrip(plain), plain);
    }

    #[test]
    fn test_interns_repeated_bases() {
        let doc = json!([
            {"url": "http://provider.example.com:8080/live/u/p/1.ts"},
            {"url": "http://provider.example.com:8080/live/u/p/2.ts"},
            {"url": "http://other.example.org/single/3.ts"}
        ]);
        let plain = doc.to_string();
        let packed = SchemaCodec::standard().compress(&plain).unwrap();

        let envelope: Value = serde_json::from_str(&packed).unwrap();
        assert_eq!(
            envelope["r"],
            json!(["http://provider.example.com:8080/live/u/p/"])
        );
        assert_eq!(envelope["d"][0]["u"], json!("@0|1.ts"));
        // singletons are left alone
        assert_eq!(envelope["d"][2]["u"], json!("http://other.example.org/single/3.ts"));
        assert_eq!(roundtrip(&plain), plain);
    }

    #[test]
    fn test_double_compression_is_safe() {
        let codec = SchemaCodec::standard();
        let plain = r#"[{"name":"A","url":"http://cdn.example.tv/live/1.ts"},{"name":"B","url":"http://cdn.example.tv/live/2.ts"}]"#;
        let once = codec.compress(plain).unwrap();
        let twice = codec.compress(&once).unwrap();
        let back_once = codec.decompress("k", &twice).unwrap();
        assert_eq!(back_once, once);
        assert_eq!(codec.decompress("k", &back_once).unwrap(), plain);
    }

    #[test]
    fn test_corrupt_payloads() {
        let codec = SchemaCodec::standard();
        for bad in [
            "not json",
            "[1,2]",
            r#"{"d":1}"#,
            r#"{"r":[1],"d":1}"#,
            r#"{"r":[],"d":"@0|x"}"#,
            r#"{"r":[],"d":"@x"}"#,
            r#"{"r":[],"d":"@12"}"#,
        ] {
            assert_matches!(
                codec.decompress("k", bad),
                Err(Error::CorruptEntry { .. }),
                "payload {bad}"
            );
        }
    }

    #[test]
    fn test_manager_threshold_and_fallback() {
        let manager = CompressionManager::new();

        let (stored, compressed) = manager.compress(ContentType::Channels, "[1]");
        assert_eq!(stored, "[1]");
        assert!(!compressed);

        // not JSON: codec fails, stored plain
        let garbage = "x".repeat(2048);
        let (stored, compressed) = manager.compress(ContentType::Channels, &garbage);
        assert_eq!(stored, garbage);
        assert!(!compressed);

        let channels: Vec<Value> = (0..40)
            .map(|i| json!({"name": format!("Channel {i}"), "url": format!("http://cdn.example.tv/live/{i}.ts")}))
            .collect();
        let plain = serde_json::to_string(&channels).unwrap();
        let (stored, compressed) = manager.compress(ContentType::Channels, &plain);
        assert!(compressed);
        assert!(stored.len() < plain.len());
        assert_eq!(manager.decompress("k", stored, true).unwrap(), plain);

        let stats = manager.stats();
        assert_eq!(stats.compressed, 1);
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.fallbacks, 1);
        assert!(stats.ratio() < 1.0);
    }
}
