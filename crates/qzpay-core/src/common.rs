use serde::{Deserialize, Serialize};

/// Pagination parameters for list queries
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Pagination {
    pub limit: i64,
    pub offset: i64,
}

impl Default for Pagination {
    fn default() -> Self {
        Self { limit: 20, offset: 0 }
    }
}

impl Pagination {
    pub fn new(limit: i64, offset: i64) -> Self {
        Self {
            limit: limit.clamp(1, 100),
            offset: offset.max(0),
        }
    }
}

/// A single page of results.
///
/// `has_more` is true when `offset + data.len() < total`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub data: Vec<T>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
    pub has_more: bool,
}

impl<T> Page<T> {
    pub fn new(data: Vec<T>, total: i64, pagination: Pagination) -> Self {
        let has_more = (pagination.offset + data.len() as i64) < total;
        Self {
            data,
            total,
            limit: pagination.limit,
            offset: pagination.offset,
            has_more,
        }
    }

    pub fn empty(pagination: Pagination) -> Self {
        Self::new(Vec::new(), 0, pagination)
    }
}

/// Sort direction for list queries
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    Asc,
    Desc,
}

impl Default for SortDirection {
    fn default() -> Self {
        SortDirection::Desc
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_has_more() {
        let page = Page::new(vec![1, 2, 3], 10, Pagination::new(3, 0));
        assert!(page.has_more);

        let last = Page::new(vec![1], 10, Pagination::new(3, 9));
        assert!(!last.has_more);
    }

    #[test]
    fn test_pagination_clamps() {
        let p = Pagination::new(0, -5);
        assert_eq!(p.limit, 1);
        assert_eq!(p.offset, 0);

        let p = Pagination::new(500, 10);
        assert_eq!(p.limit, 100);
    }
}
