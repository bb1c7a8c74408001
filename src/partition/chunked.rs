//! Chunked Partitioning
//!
//! Fixed-size chunks in source order. Window reads fetch only the chunks
//! covering the window.

use super::{Fragments, PartitionLayout, StrategyKind, WindowRequest};
use crate::catalog::Channel;
use crate::error::Result;

pub fn chunk_key(n: usize) -> String {
    format!("chunk_{n}")
}

/// Inclusive range of chunks covering `[offset, offset + limit)`
///
/// `None` when the window is empty or starts past the end.
pub fn chunk_span(offset: usize, limit: usize, total: usize, chunk_size: usize) -> Option<(usize, usize)> {
    if chunk_size == 0 || limit == 0 || offset >= total {
        return None;
    }
    let end = offset.saturating_add(limit).min(total);
    Some((offset / chunk_size, (end - 1) / chunk_size))
}

pub(crate) async fn write(fragments: &Fragments<'_>, channels: &[Channel]) -> Result<PartitionLayout> {
    let chunk_size = fragments.config.chunk_size.max(1);
    let items = fragments.encode(
        StrategyKind::Chunked,
        channels
            .chunks(chunk_size)
            .enumerate()
            .map(|(n, chunk)| (fragments.key(&chunk_key(n)), chunk)),
    )?;
    let chunk_count = items.len();

    fragments.write_all(StrategyKind::Chunked, items).await?;
    Ok(PartitionLayout::Chunked {
        total_channels: channels.len(),
        chunk_size,
        chunk_count,
    })
}

pub(crate) async fn read(
    fragments: &Fragments<'_>,
    total: usize,
    chunk_size: usize,
    chunk_count: usize,
    request: &WindowRequest,
) -> Option<Vec<Channel>> {
    if let Some(category) = &request.category {
        let keys: Vec<String> = (0..chunk_count).map(|n| fragments.key(&chunk_key(n))).collect();
        let chunks: Vec<Vec<Channel>> = fragments.read_many(&keys).await?;
        let matching = chunks
            .into_iter()
            .flatten()
            .filter(|c| c.category() == category)
            .collect();
        return Some(request.slice(matching));
    }

    let limit = request.limit.unwrap_or(total);
    let Some((first, last)) = chunk_span(request.offset, limit, total, chunk_size) else {
        return Some(Vec::new());
    };

    let keys: Vec<String> = (first..=last).map(|n| fragments.key(&chunk_key(n))).collect();
    let chunks: Vec<Vec<Channel>> = fragments.read_many(&keys).await?;

    let skip = request.offset - first * chunk_size;
    let take = limit.min(total - request.offset);
    let window: Vec<Channel> = chunks.into_iter().flatten().skip(skip).take(take).collect();
    tracing::debug!(
        catalog = %fragments.catalog_id,
        first_chunk = first,
        last_chunk = last,
        returned = window.len(),
        "Read chunk window"
    );
    Some(window)
}

// =============================================================================
// Tests
// =============================================================================
