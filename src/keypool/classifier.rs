// KeyMux — derived key status and operator-facing listings.
//
// Status is computed on demand, never stored:
//   frozen  ⇔ manually frozen ∨ (deadline set ∧ now < deadline)
//   valid   ⇔ ¬frozen ∧ fail_count < MAX_FAILURES
//   invalid ⇔ ¬frozen ∧ fail_count ≥ MAX_FAILURES
//
// Listings are sorted by key string so pagination stays stable between
// calls; traversal expires stale auto-freeze deadlines as it goes.

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::Serialize;
use utoipa::ToSchema;

use crate::keypool::pool::Pool;

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct KeyInfo {
    pub fail_count: u32,
    pub frozen: bool,
    pub manually_frozen: bool,
    pub freeze_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct StatusSnapshot {
    pub valid_keys: BTreeMap<String, KeyInfo>,
    pub invalid_keys: BTreeMap<String, KeyInfo>,
    pub frozen_keys: BTreeMap<String, KeyInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusFilter {
    Valid,
    Invalid,
    Frozen,
}

impl StatusFilter {
    pub fn as_str(self) -> &'static str {
        match self {
            StatusFilter::Valid => "valid",
            StatusFilter::Invalid => "invalid",
            StatusFilter::Frozen => "frozen",
        }
    }
}

impl FromStr for StatusFilter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "valid" => Ok(StatusFilter::Valid),
            "invalid" => Ok(StatusFilter::Invalid),
            // "disabled" is the legacy operator-UI name for the frozen list
            "frozen" | "disabled" => Ok(StatusFilter::Frozen),
            other => Err(format!("invalid key type: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct PaginatedKeys {
    pub keys: BTreeMap<String, KeyInfo>,
    pub total_count: usize,
    pub page: usize,
    pub page_size: usize,
    pub total_pages: usize,
    pub has_next: bool,
    pub has_prev: bool,
}

pub const MAX_PAGE_SIZE: usize = 1000;
const DEFAULT_PAGE_SIZE: usize = 10;

/// One row of the intermediate listing, before pagination slicing.
struct Entry {
    key: String,
    info: KeyInfo,
}

/// Collect every key with its derived status. Takes the failure-count and
/// freeze snapshots sequentially — no nested locks.
async fn collect_entries(pool: &Pool) -> Vec<(Entry, StatusFilter)> {
    let max_failures = pool.settings().read().await.max_failures;
    let counts = pool.failure_counts_snapshot().await;
    let (frozen_until, manually_frozen) = pool.freeze_snapshot().await;

    pool.keys()
        .iter()
        .map(|key| {
            let fail_count = counts.get(key).copied().unwrap_or(0);
            let manual = manually_frozen.contains(key);
            let deadline = frozen_until.get(key).copied();
            let frozen = manual || deadline.is_some();

            let status = if frozen {
                StatusFilter::Frozen
            } else if fail_count < max_failures {
                StatusFilter::Valid
            } else {
                StatusFilter::Invalid
            };

            let entry = Entry {
                key: key.clone(),
                info: KeyInfo {
                    fail_count,
                    frozen,
                    manually_frozen: manual,
                    freeze_until: deadline,
                },
            };
            (entry, status)
        })
        .collect()
}

/// Full three-way snapshot. O(N) in pool size.
pub async fn status_snapshot(pool: &Pool) -> StatusSnapshot {
    let mut snapshot = StatusSnapshot {
        valid_keys: BTreeMap::new(),
        invalid_keys: BTreeMap::new(),
        frozen_keys: BTreeMap::new(),
    };

    for (entry, status) in collect_entries(pool).await {
        let bucket = match status {
            StatusFilter::Valid => &mut snapshot.valid_keys,
            StatusFilter::Invalid => &mut snapshot.invalid_keys,
            StatusFilter::Frozen => &mut snapshot.frozen_keys,
        };
        bucket.insert(entry.key, entry.info);
    }

    snapshot
}

/// Filtered, paginated listing.
///
/// - `search` matches as a case-insensitive substring of the key.
/// - `fail_count_threshold` keeps only keys with `fail_count >= threshold`
///   (valid listing only).
/// - `page` is clamped to `[1, max(1, total_pages)]`; `page_size` to
///   `[1, MAX_PAGE_SIZE]` (out-of-range values fall back to the default).
pub async fn paginated(
    pool: &Pool,
    filter: StatusFilter,
    page: usize,
    page_size: usize,
    search: Option<&str>,
    fail_count_threshold: u32,
) -> PaginatedKeys {
    let page_size = if page_size == 0 || page_size > MAX_PAGE_SIZE {
        DEFAULT_PAGE_SIZE
    } else {
        page_size
    };
    let needle = search.map(str::to_lowercase).filter(|s| !s.is_empty());

    let mut rows: Vec<Entry> = collect_entries(pool)
        .await
        .into_iter()
        .filter(|(_, status)| *status == filter)
        .map(|(entry, _)| entry)
        .filter(|e| match &needle {
            Some(n) => e.key.to_lowercase().contains(n),
            None => true,
        })
        .filter(|e| {
            filter != StatusFilter::Valid
                || fail_count_threshold == 0
                || e.info.fail_count >= fail_count_threshold
        })
        .collect();

    rows.sort_by(|a, b| a.key.cmp(&b.key));

    let total_count = rows.len();
    let total_pages = total_count.div_ceil(page_size);
    let page = page.clamp(1, total_pages.max(1));

    let start = (page - 1) * page_size;
    let keys: BTreeMap<String, KeyInfo> = rows
        .into_iter()
        .skip(start)
        .take(page_size)
        .map(|e| (e.key, e.info))
        .collect();

    PaginatedKeys {
        keys,
        total_count,
        page,
        page_size,
        total_pages,
        has_next: page < total_pages,
        has_prev: page > 1,
    }
}
