//! Property-Based Tests for the Cache Codec and Chunk Windows
//!
//! # Test Properties
//!
//! 1. **Codec Roundtrip**: decompress(compress(doc)) = doc for any JSON
//!    document, including keys that collide with aliases and strings that
//!    look like intern tokens
//! 2. **Policy Roundtrip**: the compression manager returns the exact
//!    serialized text for every content type
//! 3. **Chunk Windows**: the covering chunk range of a window contains every
//!    requested index and nothing outside the first and last chunk
//! 4. **Volatile Bounds**: any write sequence leaves the volatile tier within
//!    its entry and byte limits, holding the most recent key

#![cfg(test)]

use std::sync::Arc;

use proptest::prelude::*;
use serde_json::{json, Map, Value};

use super::clock::ManualClock;
use super::compression::{CompressionManager, SchemaCodec};
use super::entry::{CacheEntry, ContentType};
use super::policy::{Freshness, TtlPolicy};
use super::tier::TierStore;
use super::volatile::{VolatileConfig, VolatileTier};
use crate::partition::chunked::chunk_span;

// =============================================================================
// Property Strategies
// =============================================================================

/// Keys mixing real field names, aliases and escape-prefixed literals
fn key_strategy() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("name".to_string()),
        Just("url".to_string()),
        Just("stream_icon".to_string()),
        Just("n".to_string()),
        Just("si".to_string()),
        Just("~n".to_string()),
        Just("~".to_string()),
        "[a-z_]{1,8}",
    ]
}

/// Strings including shared URL bases and token look-alikes
fn string_strategy() -> impl Strategy<Value = String> {
    prop_oneof![
        "[a-zA-Z0-9 ]{0,20}",
        "\\PC{0,12}",
        "@[a-z0-9|@]{0,10}",
        "@@?[0-9]{1,3}\\|",
        (0u32..3, "[a-z0-9]{1,6}")
            .prop_map(|(host, tail)| format!("http://cdn{host}.example.tv/live/user/pass/{tail}.ts")),
    ]
}

fn value_strategy() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(|n| json!(n)),
        string_strategy().prop_map(Value::String),
    ];
    leaf.prop_recursive(3, 64, 8, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..8).prop_map(Value::Array),
            prop::collection::vec((key_strategy(), inner), 0..8)
                .prop_map(|pairs| Value::Object(pairs.into_iter().collect::<Map<_, _>>())),
        ]
    })
}

/// A channel list shaped like real fragments
fn channel_list_strategy() -> impl Strategy<Value = Value> {
    prop::collection::vec(
        (0u32..50_000, "[A-Za-z ]{1,16}", string_strategy(), any::<bool>()),
        0..40,
    )
    .prop_map(|rows| {
        Value::Array(
            rows.into_iter()
                .map(|(id, name, url, fav)| {
                    json!({"id": id.to_string(), "name": name, "url": url, "group": "News", "fav": fav})
                })
                .collect(),
        )
    })
}

fn content_type_strategy() -> impl Strategy<Value = ContentType> {
    prop_oneof![
        Just(ContentType::Channels),
        Just(ContentType::Metadata),
        Just(ContentType::Epg),
    ]
}

// =============================================================================
// Codec Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Property: the schema codec is lossless on arbitrary documents.
    #[test]
    fn prop_codec_roundtrip(doc in value_strategy()) {
        let codec = SchemaCodec::standard();
        let plain = serde_json::to_string(&doc)?;

        let packed = codec.compress(&plain)?;
        let restored = codec.decompress("k", &packed)?;

        prop_assert_eq!(restored, plain);
    }

    /// Property: the manager returns the exact text whether or not it compressed.
    #[test]
    fn prop_policy_roundtrip(
        doc in channel_list_strategy(),
        content_type in content_type_strategy(),
    ) {
        let manager = CompressionManager::new();
        let plain = serde_json::to_string(&doc)?;

        let (stored, compressed) = manager.compress(content_type, &plain);
        if compressed {
            prop_assert!(stored.len() < plain.len());
        }
        let restored = manager.decompress("k", stored, compressed)?;

        prop_assert_eq!(restored, plain);
    }
}

// =============================================================================
// Chunk Window Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    /// Property: the covering chunks contain the whole window and no extra chunk.
    #[test]
    fn prop_chunk_span_covers_window(
        total in 1usize..50_000,
        chunk_size in 1usize..2_000,
        offset in 0usize..50_000,
        limit in 1usize..5_000,
    ) {
        let end = (offset + limit).min(total);
        match chunk_span(offset, limit, total, chunk_size) {
            None => prop_assert!(offset >= total),
            Some((first, last)) => {
                prop_assert!(offset < total);
                prop_assert!(first <= last);
                prop_assert!(first * chunk_size <= offset);
                prop_assert!((last + 1) * chunk_size >= end);
                prop_assert!(first * chunk_size + chunk_size > offset);
                prop_assert!(last * chunk_size < end);
            }
        }
    }
}

// =============================================================================
// Volatile Tier Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Property: the tier never exceeds its limits and keeps the last write.
    #[test]
    fn prop_volatile_stays_within_limits(
        max_entries in 1usize..20,
        max_bytes in 64u64..2_048,
        writes in prop::collection::vec((0u8..40, 1usize..200), 1..120),
    ) {
        let clock = Arc::new(ManualClock::new(1_000));
        let tier = VolatileTier::with_config(
            VolatileConfig { max_entries, max_bytes },
            Freshness::new(TtlPolicy::default(), clock),
        );

        let mut last_stored = None;
        for (id, len) in &writes {
            let key = format!("k{id}");
            let entry = CacheEntry::new(&key, "x".repeat(*len), ContentType::Metadata, false, 1_000);
            if tokio_test::block_on(tier.set(entry)) {
                last_stored = Some(key);
            }
            let stats = tier.stats();
            prop_assert!(stats.entries <= max_entries);
            prop_assert!(stats.total_bytes <= max_bytes);
        }

        if let (Some(key), Some((id, _))) = (&last_stored, writes.last()) {
            if *key == format!("k{id}") {
                prop_assert!(tokio_test::block_on(tier.has(key)));
            }
        }
    }
}
