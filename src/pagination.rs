//! Cursor pagination over filtered, sorted record collections.
//!
//! Both registries list their records through [`paginate`]. A cursor is the
//! ID of a record; the page starts right after it (forward) or ends right
//! before it (backward) in the requested sort order. The cursor record is
//! looked up in the whole collection, not only among filtered records, so a
//! record that stopped matching the filter between two calls still anchors
//! the next page.
//!
//! Ordering is the sort key in the requested direction, with ties always
//! broken by ascending ID. Records are never deleted, so following `next`
//! cursors from the first page visits every matching record exactly once as
//! long as the cursor record keeps its sort key. Other records inserted or
//! re-keyed meanwhile may or may not show up depending on where they land
//! relative to the cursor.
//!
//! The cursor is positioned by the cursor record's sort key at the time of
//! the call. When the cursor record itself is re-keyed between two calls
//! (a status change under a status sort, an update under an updated-date
//! sort) the page window moves with it: records between its old and new
//! position are skipped or repeated. Sorting by ID is immune.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WelesError};

/// A record with a numeric primary key.
pub trait Record {
    fn id(&self) -> u64;
}

pub trait Filter<R> {
    fn matches(&self, record: &R) -> bool;
}

/// Filter accepting every record.
#[derive(Debug, Clone, Copy, Default)]
pub struct MatchAll;

impl<R> Filter<R> for MatchAll {
    fn matches(&self, _record: &R) -> bool {
        true
    }
}

/// A sortable field of `R`.
pub trait SortKey<R>: Copy {
    /// Compare two records by this field only, in ascending order.
    fn compare(self, a: &R, b: &R) -> Ordering;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sorter<K> {
    pub key: K,
    pub order: SortOrder,
}

impl<K> Sorter<K> {
    pub fn new(key: K, order: SortOrder) -> Self {
        Self { key, order }
    }

    pub fn ascending(key: K) -> Self {
        Self::new(key, SortOrder::Ascending)
    }

    pub fn descending(key: K) -> Self {
        Self::new(key, SortOrder::Descending)
    }

    fn compare<R>(&self, a: &R, b: &R) -> Ordering
    where
        K: SortKey<R>,
        R: Record,
    {
        let primary = match self.order {
            SortOrder::Ascending => self.key.compare(a, b),
            SortOrder::Descending => self.key.compare(a, b).reverse(),
        };
        primary.then_with(|| a.id().cmp(&b.id()))
    }
}

/// Position and size of the requested page.
///
/// `id` is the cursor record; `forward` selects records after it (`true`) or
/// before it (`false`). A `limit` of zero means no limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Paginator {
    pub id: Option<u64>,
    pub forward: bool,
    pub limit: usize,
}

impl Default for Paginator {
    fn default() -> Self {
        Self {
            id: None,
            forward: true,
            limit: 0,
        }
    }
}

impl Paginator {
    /// First page with up to `limit` records.
    pub fn first(limit: usize) -> Self {
        Self {
            limit,
            ..Self::default()
        }
    }

    pub fn after(id: u64, limit: usize) -> Self {
        Self {
            id: Some(id),
            forward: true,
            limit,
        }
    }

    pub fn before(id: u64, limit: usize) -> Self {
        Self {
            id: Some(id),
            forward: false,
            limit,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListInfo {
    /// Number of records matching the filter.
    pub total_records: usize,
    /// Matching records not returned on the far side of the page. `None` when
    /// the page was not truncated by the limit.
    pub remaining_records: Option<usize>,
    /// Cursor for the page before this one (use with `forward = false`).
    pub previous: Option<u64>,
    /// Cursor for the page after this one (use with `forward = true`).
    pub next: Option<u64>,
}

impl ListInfo {
    pub fn is_partial(&self) -> bool {
        self.remaining_records.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page<R> {
    pub records: Vec<R>,
    pub info: ListInfo,
}

/// Select one page of `records`.
///
/// Fails with [`WelesError::InvalidCursor`] if the cursor ID does not belong
/// to any record in the collection.
pub fn paginate<'a, R, K, F>(
    records: impl IntoIterator<Item = &'a R>,
    filter: &F,
    sorter: &Sorter<K>,
    paginator: &Paginator,
) -> Result<Page<R>>
where
    R: Record + Clone + 'a,
    K: SortKey<R>,
    F: Filter<R> + ?Sized,
{
    let all: Vec<&R> = records.into_iter().collect();

    let cursor = match paginator.id {
        Some(id) => Some(
            all.iter()
                .copied()
                .find(|r| r.id() == id)
                .ok_or(WelesError::InvalidCursor(id))?,
        ),
        None => None,
    };

    let mut matching: Vec<&R> = all.into_iter().filter(|r| filter.matches(r)).collect();
    matching.sort_by(|a, b| sorter.compare(*a, *b));
    let total = matching.len();

    // Records strictly before / strictly after the cursor in sort order. The
    // cursor itself, if it matches, belongs to neither side.
    let (before_end, after_start) = match cursor {
        Some(c) => (
            matching.partition_point(|r| sorter.compare(*r, c) == Ordering::Less),
            matching.partition_point(|r| sorter.compare(*r, c) != Ordering::Greater),
        ),
        None => (total, 0),
    };
    let limit = if paginator.limit == 0 {
        total
    } else {
        paginator.limit
    };

    let (page, remaining, has_before, has_after) = if paginator.forward {
        let candidates = &matching[after_start..];
        let taken = candidates.len().min(limit);
        (
            &candidates[..taken],
            candidates.len() - taken,
            after_start > 0,
            taken < candidates.len(),
        )
    } else {
        let candidates = &matching[..before_end];
        let taken = candidates.len().min(limit);
        let start = candidates.len() - taken;
        (
            &candidates[start..],
            start,
            start > 0,
            before_end < total,
        )
    };

    let cursor_id = cursor.map(|c| c.id());
    let previous = if has_before {
        page.first().map(|r| r.id()).or(cursor_id)
    } else {
        None
    };
    let next = if has_after {
        page.last().map(|r| r.id()).or(cursor_id)
    } else {
        None
    };

    Ok(Page {
        records: page.iter().map(|r| (*r).clone()).collect(),
        info: ListInfo {
            total_records: total,
            remaining_records: (remaining > 0).then_some(remaining),
            previous,
            next,
        },
    })
}
