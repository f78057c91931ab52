/// Shapes of cached list queries and re-pagination after local edits
use serde::{Deserialize, Serialize};

/// One page (or the whole result) of a list query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryData<T> {
    pub items: Vec<T>,
    pub total: i64,
}

/// Paginated list query; `page_params` are item offsets of each page
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InfiniteQueryData<T> {
    pub pages: Vec<QueryData<T>>,
    pub page_params: Vec<usize>,
}

/// A cache entry: either shape
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CachedQuery<T> {
    Infinite(InfiniteQueryData<T>),
    Single(QueryData<T>),
}

impl<T: Clone> CachedQuery<T> {
    /// Every cached item, pages concatenated
    pub fn flatten(&self) -> Vec<T> {
        match self {
            CachedQuery::Single(data) => data.items.clone(),
            CachedQuery::Infinite(data) => data
                .pages
                .iter()
                .flat_map(|page| page.items.iter().cloned())
                .collect(),
        }
    }

    pub fn total(&self) -> i64 {
        match self {
            CachedQuery::Single(data) => data.total,
            CachedQuery::Infinite(data) => data.pages.first().map_or(0, |page| page.total),
        }
    }

    /// Mutable access to every cached item, page by page
    pub fn items_mut(&mut self) -> Box<dyn Iterator<Item = &mut T> + '_> {
        match self {
            CachedQuery::Single(data) => Box::new(data.items.iter_mut()),
            CachedQuery::Infinite(data) => {
                Box::new(data.pages.iter_mut().flat_map(|page| page.items.iter_mut()))
            }
        }
    }
}

/// Rebuild `prev`'s shape around the full new item list.
///
/// Paginated data is re-chunked rather than patched page by page, so no page
/// exceeds the page size and offsets stay contiguous. The page size is
/// `limit`, else the first page's size when several pages were loaded, else
/// everything stays on one page.
pub fn format_updated_data<T: Clone>(
    prev: &CachedQuery<T>,
    items: Vec<T>,
    limit: Option<usize>,
    add_to_total: i64,
) -> CachedQuery<T> {
    let total = (prev.total() + add_to_total).max(0);

    let prev_pages = match prev {
        CachedQuery::Single(_) => return CachedQuery::Single(QueryData { items, total }),
        CachedQuery::Infinite(data) => &data.pages,
    };

    if items.is_empty() {
        return CachedQuery::Infinite(InfiniteQueryData {
            pages: vec![QueryData {
                items: Vec::new(),
                total,
            }],
            page_params: vec![0],
        });
    }

    let page_size = limit
        .or_else(|| {
            (prev_pages.len() > 1)
                .then(|| prev_pages[0].items.len())
                .filter(|size| *size > 0)
        })
        .unwrap_or(items.len())
        .max(1);

    let mut pages = Vec::with_capacity(items.len().div_ceil(page_size));
    let mut page_params = Vec::with_capacity(pages.capacity());
    for (index, chunk) in items.chunks(page_size).enumerate() {
        page_params.push(index * page_size);
        pages.push(QueryData {
            items: chunk.to_vec(),
            total,
        });
    }

    CachedQuery::Infinite(InfiniteQueryData { pages, page_params })
}
