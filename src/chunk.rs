//! Paginated fetch-and-process for bulk sweeps.
//!
//! The periodic sync jobs walk large datasets a page at a time instead of
//! loading everything into memory, with an optional pause between pages for
//! rate-limited downstreams.

use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Sweep tuning.
#[derive(Debug, Clone)]
pub struct ChunkConfig {
    pub chunk_size: usize,
    /// Pause between full pages. None = no pause.
    pub inter_chunk_delay: Option<Duration>,
}

impl ChunkConfig {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            inter_chunk_delay: None,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.inter_chunk_delay = Some(delay);
        self
    }
}

/// What a sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkStats {
    pub pages: usize,
    pub processed: usize,
    /// Items whose processing failed and were skipped.
    pub failed: usize,
}

/// Fetch pages of `(skip, take)` and process every item sequentially until a
/// page comes back short (or empty).
///
/// A failing item is logged and skipped — one bad record must not abort the
/// sweep. A failing *fetch* does abort: without the page there is nothing to
/// skip past.
pub async fn for_each_chunk<T, FetchFn, FetchFut, FetchErr, ProcFn, ProcFut, ProcErr>(
    config: &ChunkConfig,
    mut fetch_page: FetchFn,
    mut process_item: ProcFn,
) -> Result<ChunkStats>
where
    FetchFn: FnMut(usize, usize) -> FetchFut,
    FetchFut: Future<Output = std::result::Result<Vec<T>, FetchErr>>,
    FetchErr: std::fmt::Display,
    ProcFn: FnMut(T) -> ProcFut,
    ProcFut: Future<Output = std::result::Result<(), ProcErr>>,
    ProcErr: std::fmt::Display,
{
    let mut stats = ChunkStats::default();
    let mut skip = 0usize;

    loop {
        let items = fetch_page(skip, config.chunk_size)
            .await
            .map_err(|e| Error::Other(format!("fetch page at offset {skip}: {e}")))?;
        if items.is_empty() {
            break;
        }

        stats.pages += 1;
        let page_len = items.len();
        debug!(skip, take = config.chunk_size, got = page_len, "processing chunk");

        for (i, item) in items.into_iter().enumerate() {
            match process_item(item).await {
                Ok(()) => stats.processed += 1,
                Err(e) => {
                    warn!(index = skip + i, error = %e, "item failed, continuing sweep");
                    stats.failed += 1;
                }
            }
        }

        // A short page means end of data — no extra fetch to confirm.
        if page_len < config.chunk_size {
            break;
        }
        skip += config.chunk_size;

        if let Some(delay) = config.inter_chunk_delay {
            tokio::time::sleep(delay).await;
        }
    }

    Ok(stats)
}
