use std::fmt;

use serde::{Deserialize, Serialize};
use smartstring::alias::String;

use crate::{Timestamp, asset::Asset};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OrderId(pub String);

impl OrderId {
    /// A fresh client order id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string().into())
    }
}

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OrderId {
    fn from(s: &str) -> Self {
        Self(s.into())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum OrderStyle {
    Market,
    Limit(f64),
    Stop(f64),
    StopLimit { limit: f64, stop: f64 },
}

impl OrderStyle {
    pub fn from_prices(limit: Option<f64>, stop: Option<f64>) -> Self {
        match (limit, stop) {
            (Some(limit), Some(stop)) => OrderStyle::StopLimit { limit, stop },
            (Some(limit), None) => OrderStyle::Limit(limit),
            (None, Some(stop)) => OrderStyle::Stop(stop),
            (None, None) => OrderStyle::Market,
        }
    }

    pub fn limit_price(&self) -> Option<f64> {
        match *self {
            OrderStyle::Limit(p) | OrderStyle::StopLimit { limit: p, .. } => Some(p),
            _ => None,
        }
    }

    pub fn stop_price(&self) -> Option<f64> {
        match *self {
            OrderStyle::Stop(p) | OrderStyle::StopLimit { stop: p, .. } => Some(p),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderStatus {
    Open,
    Filled,
    Cancelled,
    Rejected,
    Held,
}

/// One brokerage order. The status reported to algorithms is derived from
/// the fill progress and the last status the broker sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub created: Timestamp,
    pub asset: Asset,
    /// Signed: positive buys, negative sells.
    pub amount: i64,
    pub filled: i64,
    pub style: OrderStyle,
    broker_status: OrderStatus,
}

impl Order {
    pub fn new(id: OrderId, created: Timestamp, asset: Asset, amount: i64, style: OrderStyle) -> Self {
        Self {
            id,
            created,
            asset,
            amount,
            filled: 0,
            style,
            broker_status: OrderStatus::Open,
        }
    }

    pub fn limit(&self) -> Option<f64> {
        self.style.limit_price()
    }

    pub fn stop(&self) -> Option<f64> {
        self.style.stop_price()
    }

    pub fn open_amount(&self) -> i64 {
        self.amount - self.filled
    }

    pub fn status(&self) -> OrderStatus {
        if self.open_amount() == 0 {
            return OrderStatus::Filled;
        }
        match self.broker_status {
            OrderStatus::Held if self.filled != 0 => OrderStatus::Open,
            status => status,
        }
    }

    pub fn open(&self) -> bool {
        matches!(self.status(), OrderStatus::Open | OrderStatus::Held)
    }

    /// Records `qty` more shares filled, clamped to the unfilled remainder.
    /// `qty` is unsigned; the sign of `amount` is applied.
    pub fn apply_fill(&mut self, qty: u64) -> i64 {
        let remaining = self.open_amount().unsigned_abs();
        let qty = qty.min(remaining) as i64;
        let signed = if self.amount < 0 { -qty } else { qty };
        self.filled += signed;
        signed
    }

    pub fn set_broker_status(&mut self, status: OrderStatus) {
        self.broker_status = status;
    }
}
