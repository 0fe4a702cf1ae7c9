use std::collections::HashMap;

use crate::{
    errors::{SyncError, SyncResult},
    types::{MarketId, Symbol},
};

/// Maps unified symbols to venue market ids and back.
///
/// Entries inserted explicitly always win. With a separator configured,
/// unknown symbols derive their id as lowercase `base<sep>quote`, and ids
/// containing the separator map back to `BASE/QUOTE`.
#[derive(Debug, Clone, Default)]
pub struct MarketTable {
    by_symbol: HashMap<Symbol, MarketId>,
    by_id: HashMap<MarketId, Symbol>,
    separator: Option<&'static str>,
}

impl MarketTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_separator(separator: &'static str) -> Self {
        Self {
            separator: Some(separator),
            ..Self::default()
        }
    }

    pub fn insert(&mut self, symbol: impl Into<Symbol>, id: impl Into<MarketId>) {
        let symbol = symbol.into();
        let id = id.into();
        self.by_id.insert(id.clone(), symbol.clone());
        self.by_symbol.insert(symbol, id);
    }

    pub fn with(mut self, symbol: impl Into<Symbol>, id: impl Into<MarketId>) -> Self {
        self.insert(symbol, id);
        self
    }

    pub fn market_id(&self, symbol: &Symbol) -> SyncResult<MarketId> {
        if let Some(id) = self.by_symbol.get(symbol) {
            return Ok(id.clone());
        }
        match (self.separator, symbol.split_pair()) {
            (Some(separator), Some((base, quote))) => Ok(MarketId::new(format!(
                "{}{}{}",
                base.to_ascii_lowercase(),
                separator,
                quote.to_ascii_lowercase()
            ))),
            _ => Err(SyncError::InvalidMarket(symbol.to_string())),
        }
    }

    pub fn symbol(&self, id: &str) -> Option<Symbol> {
        if let Some(symbol) = self.by_id.get(&MarketId::from(id)) {
            return Some(symbol.clone());
        }
        let separator = self.separator.filter(|separator| !separator.is_empty())?;
        let (base, quote) = id.split_once(separator)?;
        if base.is_empty() || quote.is_empty() {
            return None;
        }
        Some(Symbol::new(format!(
            "{}/{}",
            base.to_ascii_uppercase(),
            quote.to_ascii_uppercase()
        )))
    }
}
