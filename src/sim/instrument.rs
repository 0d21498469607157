//! Instrument definitions for the simulator
//!
//! Loaded from a JSON array at worker start. Quote fields may be absent or
//! `null`; both mean "no valid price" and are held as NaN.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use super::model::{nan, nan_or_null};
use crate::core::types::ProductClass;
use crate::core::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instrument {
    /// `EXCHANGE.INSTRUMENT`, e.g. `SHFE.cu2501`
    pub symbol: String,

    #[serde(default = "default_product_class")]
    pub product_class: ProductClass,

    pub price_tick: f64,

    #[serde(default = "default_volume_multiple")]
    pub volume_multiple: f64,

    /// Margin per lot
    #[serde(default)]
    pub margin: f64,

    /// Commission per lot
    #[serde(default)]
    pub commission: f64,

    #[serde(default = "nan", deserialize_with = "nan_or_null")]
    pub upper_limit: f64,
    #[serde(default = "nan", deserialize_with = "nan_or_null")]
    pub lower_limit: f64,
    #[serde(default = "nan", deserialize_with = "nan_or_null")]
    pub pre_settlement: f64,
    #[serde(default = "nan", deserialize_with = "nan_or_null")]
    pub last_price: f64,
    #[serde(default = "nan", deserialize_with = "nan_or_null")]
    pub ask_price1: f64,
    #[serde(default = "nan", deserialize_with = "nan_or_null")]
    pub bid_price1: f64,

    /// Row in the shared quote matrix, if the market-data service feeds it
    #[serde(default)]
    pub md_slot: Option<u16>,
}

fn default_product_class() -> ProductClass {
    ProductClass::Futures
}

fn default_volume_multiple() -> f64 {
    1.0
}

impl Instrument {
    /// Price used to value open positions: last, else pre-settlement.
    pub fn mark_price(&self) -> f64 {
        if self.last_price.is_finite() {
            self.last_price
        } else {
            self.pre_settlement
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct InstrumentTable {
    instruments: BTreeMap<String, Instrument>,
}

impl InstrumentTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("instrument file {}: {}", path.display(), e)))?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let list: Vec<Instrument> = serde_json::from_str(content)?;
        Ok(list.into_iter().collect())
    }

    pub fn insert(&mut self, instrument: Instrument) {
        self.instruments.insert(instrument.symbol.clone(), instrument);
    }

    pub fn get(&self, symbol: &str) -> Option<&Instrument> {
        self.instruments.get(symbol)
    }

    pub fn get_mut(&mut self, symbol: &str) -> Option<&mut Instrument> {
        self.instruments.get_mut(symbol)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Instrument> {
        self.instruments.values_mut()
    }

    pub fn len(&self) -> usize {
        self.instruments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instruments.is_empty()
    }
}

impl FromIterator<Instrument> for InstrumentTable {
    fn from_iter<I: IntoIterator<Item = Instrument>>(iter: I) -> Self {
        let mut table = Self::new();
        for instrument in iter {
            table.insert(instrument);
        }
        table
    }
}
