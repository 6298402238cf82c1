//! The tradable universe.

use crate::config::CatalogEntry;
use crate::types::{resolve_listing, Exchange};

#[derive(Debug, Clone, Default)]
pub struct Catalog {
    entries: Vec<CatalogEntry>,
}

impl Catalog {
    pub fn new(entries: Vec<CatalogEntry>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[CatalogEntry] {
        &self.entries
    }

    /// Entries that get technical signals (everything but funds).
    pub fn stocks(&self) -> impl Iterator<Item = &CatalogEntry> {
        self.entries.iter().filter(|e| !e.etf)
    }

    pub fn find(&self, ticker: &str) -> Option<&CatalogEntry> {
        self.entries.iter().find(|e| e.ticker == ticker)
    }

    /// Look up an entry by the bare symbol the brokerage reports.
    pub fn find_by_symbol(&self, symbol: &str) -> Option<&CatalogEntry> {
        self.entries
            .iter()
            .find(|e| resolve_listing(&e.ticker).0 == symbol)
    }

    /// Display name, falling back to the ticker itself.
    pub fn name_of(&self, ticker: &str) -> String {
        self.find(ticker)
            .map(|e| e.name.clone())
            .unwrap_or_else(|| ticker.to_string())
    }

    /// Bare symbol and venue for a catalog ticker.
    pub fn listing(ticker: &str) -> (String, Exchange) {
        resolve_listing(ticker)
    }
}
