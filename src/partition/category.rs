//! By-Category Partitioning
//!
//! One group of fragments per category, in first-appearance order. A
//! single-category read touches only that category's fragments.

use std::collections::HashMap;

use super::{
    into_source_order, CategoryIndex, Fragments, PartitionLayout, SequencedChannel, StrategyKind,
    WindowRequest,
};
use crate::catalog::Channel;
use crate::error::Result;

/// Longest slug kept in metadata
pub const MAX_SLUG_LEN: usize = 30;

pub fn category_key(index: usize, sub: usize) -> String {
    format!("cat_{index}_{sub}")
}

/// `[A-Za-z0-9_]` only, runs of `_` collapsed, at most 30 chars
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len().min(MAX_SLUG_LEN));
    for c in name.chars() {
        let c = if c.is_ascii_alphanumeric() { c } else { '_' };
        if c == '_' && slug.ends_with('_') {
            continue;
        }
        slug.push(c);
        if slug.len() == MAX_SLUG_LEN {
            break;
        }
    }
    slug
}

/// Group channels by category label, keeping first-appearance order
fn group(channels: &[Channel]) -> Vec<(String, Vec<SequencedChannel>)> {
    let mut positions: HashMap<&str, usize> = HashMap::new();
    let mut groups: Vec<(String, Vec<SequencedChannel>)> = Vec::new();

    for (seq, channel) in channels.iter().enumerate() {
        let label = channel.category();
        let pos = *positions.entry(label).or_insert_with(|| {
            groups.push((label.to_string(), Vec::new()));
            groups.len() - 1
        });
        groups[pos].1.push(SequencedChannel {
            seq,
            channel: channel.clone(),
        });
    }
    groups
}

pub(crate) async fn write(fragments: &Fragments<'_>, channels: &[Channel]) -> Result<PartitionLayout> {
    let sub_size = fragments.config.category_chunk_size.max(1);
    let groups = group(channels);

    let mut categories = Vec::with_capacity(groups.len());
    let mut pending = Vec::new();
    for (index, (name, members)) in groups.iter().enumerate() {
        let mut written = 0;
        for (sub, fragment) in members.chunks(sub_size).enumerate() {
            pending.push((fragments.key(&category_key(index, sub)), fragment));
            written += 1;
        }
        categories.push(CategoryIndex {
            index,
            name: name.clone(),
            slug: slugify(name),
            count: members.len(),
            fragments: written,
        });
    }

    let items = fragments.encode(StrategyKind::Category, pending)?;
    fragments.write_all(StrategyKind::Category, items).await?;

    tracing::debug!(
        catalog = %fragments.catalog_id,
        categories = categories.len(),
        "Wrote category fragments"
    );
    Ok(PartitionLayout::Category {
        total_channels: channels.len(),
        categories,
    })
}

async fn read_category(fragments: &Fragments<'_>, index: &CategoryIndex) -> Option<Vec<SequencedChannel>> {
    let keys: Vec<String> = (0..index.fragments)
        .map(|sub| fragments.key(&category_key(index.index, sub)))
        .collect();
    let parts: Vec<Vec<SequencedChannel>> = fragments.read_many(&keys).await?;
    Some(parts.into_iter().flatten().collect())
}

pub(crate) async fn read(
    fragments: &Fragments<'_>,
    categories: &[CategoryIndex],
    request: &WindowRequest,
) -> Option<Vec<Channel>> {
    if let Some(name) = &request.category {
        let Some(index) = categories.iter().find(|c| &c.name == name) else {
            return Some(Vec::new());
        };
        let members = read_category(fragments, index).await?;
        return Some(request.slice(into_source_order(members)));
    }

    let mut all = Vec::new();
    for index in categories {
        all.extend(read_category(fragments, index).await?);
    }
    Some(request.slice(into_source_order(all)))
}

// =============================================================================
// Tests
// =============================================================================
