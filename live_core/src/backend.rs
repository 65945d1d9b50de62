//! The brokerage contract the runtime is written against.
pub mod sim;

use std::{path::Path, str::FromStr, sync::Arc};

use chrono::TimeDelta;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::{
    DataFrequency, Timestamp,
    asset::{Asset, Sid},
    data::Series,
    error::{Error, Result},
    order::{Order, OrderId, OrderStatus, OrderStyle},
    portfolio::{Account, Portfolio, Position},
};

pub use sim::{FillMode, SimBackend, SimConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Open,
    High,
    Low,
    Close,
    Volume,
    Price,
    LastTraded,
}

impl FromStr for Field {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "open" => Field::Open,
            "high" => Field::High,
            "low" => Field::Low,
            "close" => Field::Close,
            "volume" => Field::Volume,
            "price" => Field::Price,
            "last_traded" => Field::LastTraded,
            other => return Err(Error::Config(format!("unknown field '{other}'"))),
        })
    }
}

/// A point-in-time value. NaN and `Time(None)` mean no data.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SpotValue {
    Number(f64),
    Time(Option<Timestamp>),
}

impl SpotValue {
    pub const MISSING: SpotValue = SpotValue::Number(f64::NAN);

    pub fn as_f64(&self) -> f64 {
        match self {
            SpotValue::Number(v) => *v,
            SpotValue::Time(_) => f64::NAN,
        }
    }

    pub fn as_time(&self) -> Option<Timestamp> {
        match self {
            SpotValue::Time(t) => *t,
            SpotValue::Number(_) => None,
        }
    }

    pub fn is_missing(&self) -> bool {
        match self {
            SpotValue::Number(v) => v.is_nan(),
            SpotValue::Time(t) => t.is_none(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    #[serde(rename = "timestamp")]
    pub dt: Timestamp,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Bar {
    pub fn field(&self, field: Field) -> f64 {
        match field {
            Field::Open => self.open,
            Field::High => self.high,
            Field::Low => self.low,
            Field::Close | Field::Price => self.close,
            Field::Volume => self.volume,
            Field::LastTraded => f64::NAN,
        }
    }
}

/// Time indexed bars per asset, oldest first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BarTable {
    bars: FxHashMap<Sid, Vec<Bar>>,
}

impl BarTable {
    pub fn insert(&mut self, sid: Sid, bars: Vec<Bar>) {
        self.bars.insert(sid, bars);
    }

    pub fn get(&self, sid: Sid) -> &[Bar] {
        self.bars.get(&sid).map_or(&[], Vec::as_slice)
    }

    pub fn column(&self, sid: Sid, field: Field) -> Series {
        let bars = self.get(sid);
        Series {
            index: bars.iter().map(|b| b.dt).collect(),
            values: bars.iter().map(|b| b.field(field)).collect(),
        }
    }

    /// True when `sid` has no usable `field` value, including when it has no bars.
    pub fn all_nan(&self, sid: Sid, field: Field) -> bool {
        self.get(sid).iter().all(|b| b.field(field).is_nan())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TradeEvent {
    New,
    PartialFill,
    Fill,
    Canceled,
    Rejected,
    Held,
}

impl TradeEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TradeEvent::Fill | TradeEvent::Canceled | TradeEvent::Rejected)
    }
}

/// One message of the broker's trade update stream.
#[derive(Debug, Clone)]
pub struct TradeUpdate {
    pub event: TradeEvent,
    pub order: Order,
}

/// Everything the runtime needs from a brokerage.
///
/// Calls are blocking; the data layer fans them out on its own pool.
pub trait Backend: Send + Sync {
    fn get_equities(&self) -> Result<Vec<Asset>>;
    fn positions(&self) -> Result<FxHashMap<Sid, Position>>;
    fn portfolio(&self) -> Result<Portfolio>;
    fn account(&self) -> Result<Account>;

    /// `None` when the broker refused the order; the reason is logged.
    fn order(&self, asset: &Asset, amount: i64, style: &OrderStyle, flip_compatible: bool) -> Option<Order>;

    fn batch_order(&self, orders: &[(Asset, i64, OrderStyle)]) -> Vec<Option<Order>> {
        orders
            .iter()
            .map(|(asset, amount, style)| self.order(asset, *amount, style, false))
            .collect()
    }

    fn all_orders(
        &self,
        before: Option<Timestamp>,
        status: Option<OrderStatus>,
        days_back: Option<i64>,
    ) -> Result<FxHashMap<OrderId, Order>>;

    /// The local open-orders table.
    fn open_orders(&self) -> FxHashMap<OrderId, Order>;
    fn get_order(&self, id: &OrderId) -> Option<Order>;
    /// Best effort, failures are logged.
    fn cancel_order(&self, id: &OrderId);

    fn get_spot_value(
        &self,
        assets: &[Asset],
        field: Field,
        dt: Timestamp,
        frequency: DataFrequency,
        compat: bool,
    ) -> Result<Vec<SpotValue>>;

    fn get_bars(
        &self,
        assets: &[Asset],
        frequency: DataFrequency,
        bar_count: usize,
        end_dt: Timestamp,
    ) -> Result<BarTable>;

    fn get_last_traded_dt(&self, asset: &Asset) -> Result<Option<Timestamp>>;

    fn is_tradable(&self, asset: &Asset) -> bool {
        asset.tradable
    }

    /// Broker clock minus local clock.
    fn time_skew(&self) -> TimeDelta {
        TimeDelta::zero()
    }

    /// Called once before the control loop starts.
    fn initialize_data(&self) -> Result<()> {
        Ok(())
    }

    /// Re-reads open orders from the broker into the local table.
    fn sync_open_orders(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Simulated broker filling at the last known close.
    Paper,
    /// Simulated broker that fills only when told to.
    Fixture,
}

impl FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "paper" => Ok(BackendKind::Paper),
            "fixture" => Ok(BackendKind::Fixture),
            other => Err(Error::UnknownBackend(other.to_string())),
        }
    }
}

pub fn build_backend(name: &str, config_path: Option<&Path>) -> Result<Arc<dyn Backend>> {
    let kind: BackendKind = name.parse()?;
    let mut config = match config_path {
        Some(path) => SimConfig::from_file(path)?,
        None => SimConfig::default(),
    };
    config.fill_mode = match kind {
        BackendKind::Paper => FillMode::Immediate,
        BackendKind::Fixture => FillMode::Manual,
    };
    tracing::info!("Using {kind:?} backend with {} assets", config.assets.len());
    Ok(Arc::new(SimBackend::from_config(config)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn bar(minute: u32, close: f64, volume: f64) -> Bar {
        Bar {
            dt: Utc.with_ymd_and_hms(2024, 3, 5, 15, minute, 0).unwrap(),
            open: close,
            high: close,
            low: close,
            close,
            volume,
        }
    }

    #[test]
    fn test_unknown_backend_is_config_error() {
        assert!(matches!(build_backend("alpaca-live", None), Err(Error::UnknownBackend(name)) if name == "alpaca-live"));
        assert!(build_backend("fixture", None).is_ok());
    }

    #[test]
    fn test_field_parsing() {
        assert_eq!("last_traded".parse::<Field>().unwrap(), Field::LastTraded);
        assert!("vwap".parse::<Field>().is_err());
    }

    #[test]
    fn test_bar_table_columns() {
        let mut table = BarTable::default();
        table.insert(1, vec![bar(0, 10., 5.), bar(1, f64::NAN, 0.)]);
        let closes = table.column(1, Field::Price);
        assert_eq!(closes.values[0], 10.);
        assert!(closes.values[1].is_nan());
        assert!(!table.all_nan(1, Field::Close));
        assert!(table.get(2).is_empty());
        assert!(table.all_nan(2, Field::Close));

        table.insert(3, vec![bar(0, f64::NAN, 0.)]);
        assert!(table.all_nan(3, Field::Close));
        assert!(!table.all_nan(1, Field::Close));
    }

    #[test]
    fn test_spot_value_sentinels() {
        assert!(SpotValue::MISSING.is_missing());
        assert!(SpotValue::Time(None).is_missing());
        assert!(!SpotValue::Number(0.).is_missing());
        assert!(SpotValue::Time(None).as_f64().is_nan());
    }
}
