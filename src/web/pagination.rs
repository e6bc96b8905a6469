use serde::{Deserialize, Serialize};

const MAX_PAGE_SIZE: u64 = 100;

/// 1-based page of a listing.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Pagination {
    pub index: u64,
    pub size: u64,
}

impl Default for Pagination {
    fn default() -> Self {
        Self { index: 1, size: 20 }
    }
}

impl Pagination {
    pub fn new(index: Option<u64>, size: Option<u64>) -> Self {
        let default = Self::default();
        Self {
            index: index.unwrap_or(default.index),
            size: size.unwrap_or(default.size),
        }
        .check()
    }

    pub fn offset(&self) -> u64 {
        self.index.saturating_sub(1).saturating_mul(self.size)
    }

    pub fn limit(&self) -> u64 {
        self.size
    }

    /// Falls back to the default page for a zero index or size and caps the page size.
    pub fn check(&self) -> Self {
        if self.index < 1 || self.size < 1 {
            return Self::default();
        }
        Self {
            index: self.index,
            size: self.size.min(MAX_PAGE_SIZE),
        }
    }
}
