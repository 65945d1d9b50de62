//! Pre-trade and account-level guards registered by algorithms.
use std::fmt;

use chrono::NaiveDate;
use rustc_hash::FxHashSet;

use crate::{
    Timestamp,
    asset::{Asset, Sid},
    error::{Error, Result},
    portfolio::Account,
};

/// What a violated control does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OnError {
    /// Abort the order with an error.
    #[default]
    Fail,
    /// Log the violation and let the order through.
    Log,
}

/// A proposed order as seen by the trading controls.
#[derive(Debug, Clone)]
pub struct ControlInput<'a> {
    pub asset: &'a Asset,
    pub amount: i64,
    /// Current position in the asset.
    pub position: i64,
    /// Latest price, NaN when unknown.
    pub price: f64,
    pub session: NaiveDate,
}

#[derive(Debug, Clone)]
pub enum TradingControl {
    MaxOrderSize {
        asset: Option<Asset>,
        max_shares: Option<u64>,
        max_notional: Option<f64>,
        on_error: OnError,
    },
    MaxPositionSize {
        asset: Option<Asset>,
        max_shares: Option<u64>,
        max_notional: Option<f64>,
        on_error: OnError,
    },
    MaxOrderCount {
        max_count: usize,
        session: Option<NaiveDate>,
        placed: usize,
        on_error: OnError,
    },
    LongOnly {
        on_error: OnError,
    },
    RestrictedList {
        sids: FxHashSet<Sid>,
        on_error: OnError,
    },
}

impl fmt::Display for TradingControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TradingControl::MaxOrderSize {
                max_shares,
                max_notional,
                ..
            } => write!(f, "MaxOrderSize(max_shares={max_shares:?}, max_notional={max_notional:?})"),
            TradingControl::MaxPositionSize {
                max_shares,
                max_notional,
                ..
            } => write!(f, "MaxPositionSize(max_shares={max_shares:?}, max_notional={max_notional:?})"),
            TradingControl::MaxOrderCount { max_count, .. } => write!(f, "MaxOrderCount({max_count})"),
            TradingControl::LongOnly { .. } => write!(f, "LongOnly"),
            TradingControl::RestrictedList { sids, .. } => write!(f, "RestrictedList({} assets)", sids.len()),
        }
    }
}

fn applies_to(filter: &Option<Asset>, asset: &Asset) -> bool {
    filter.as_ref().is_none_or(|a| a == asset)
}

fn exceeds_shares(limit: Option<u64>, shares: i64) -> bool {
    limit.is_some_and(|max| shares.unsigned_abs() > max)
}

/// NaN values never exceed.
fn exceeds_notional(limit: Option<f64>, value: f64) -> bool {
    limit.is_some_and(|max| value.abs() > max)
}

impl TradingControl {
    pub fn max_order_size(asset: Option<Asset>, max_shares: Option<u64>, max_notional: Option<f64>, on_error: OnError) -> Self {
        TradingControl::MaxOrderSize {
            asset,
            max_shares,
            max_notional,
            on_error,
        }
    }

    pub fn max_position_size(asset: Option<Asset>, max_shares: Option<u64>, max_notional: Option<f64>, on_error: OnError) -> Self {
        TradingControl::MaxPositionSize {
            asset,
            max_shares,
            max_notional,
            on_error,
        }
    }

    pub fn max_order_count(max_count: usize, on_error: OnError) -> Self {
        TradingControl::MaxOrderCount {
            max_count,
            session: None,
            placed: 0,
            on_error,
        }
    }

    fn on_error(&self) -> OnError {
        match self {
            TradingControl::MaxOrderSize { on_error, .. }
            | TradingControl::MaxPositionSize { on_error, .. }
            | TradingControl::MaxOrderCount { on_error, .. }
            | TradingControl::LongOnly { on_error }
            | TradingControl::RestrictedList { on_error, .. } => *on_error,
        }
    }

    /// Whether the order would break this control. Order counting happens here too.
    fn violated(&mut self, input: &ControlInput) -> bool {
        match self {
            TradingControl::MaxOrderSize {
                asset,
                max_shares,
                max_notional,
                ..
            } => {
                applies_to(asset, input.asset)
                    && (exceeds_shares(*max_shares, input.amount)
                        || exceeds_notional(*max_notional, input.amount as f64 * input.price))
            }
            TradingControl::MaxPositionSize {
                asset,
                max_shares,
                max_notional,
                ..
            } => {
                let after = input.position + input.amount;
                applies_to(asset, input.asset)
                    && (exceeds_shares(*max_shares, after)
                        || exceeds_notional(*max_notional, after as f64 * input.price))
            }
            TradingControl::MaxOrderCount {
                max_count,
                session,
                placed,
                ..
            } => {
                if *session != Some(input.session) {
                    *session = Some(input.session);
                    *placed = 0;
                }
                if *placed >= *max_count {
                    return true;
                }
                *placed += 1;
                false
            }
            TradingControl::LongOnly { .. } => input.position + input.amount < 0,
            TradingControl::RestrictedList { sids, .. } => sids.contains(&input.asset.sid),
        }
    }

    pub fn validate(&mut self, input: &ControlInput) -> Result<()> {
        if !self.violated(input) {
            return Ok(());
        }
        match self.on_error() {
            OnError::Fail => Err(Error::TradingControlViolation {
                symbol: input.asset.symbol.to_string(),
                amount: input.amount,
                constraint: self.to_string(),
            }),
            OnError::Log => {
                tracing::error!(
                    "Order for {} shares of {} violates trading constraint {self}",
                    input.amount,
                    input.asset.symbol
                );
                Ok(())
            }
        }
    }

    /// Clears per-session counters.
    pub fn reset_session(&mut self) {
        if let TradingControl::MaxOrderCount { session, placed, .. } = self {
            *session = None;
            *placed = 0;
        }
    }
}

#[derive(Debug, Clone)]
pub enum AccountControl {
    MaxLeverage { max_leverage: f64, on_error: OnError },
}

impl fmt::Display for AccountControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccountControl::MaxLeverage { max_leverage, .. } => write!(f, "MaxLeverage({max_leverage})"),
        }
    }
}

impl AccountControl {
    pub fn validate(&self, account: &Account, dt: Timestamp) -> Result<()> {
        let (violated, on_error) = match self {
            AccountControl::MaxLeverage { max_leverage, on_error } => (account.leverage > *max_leverage, *on_error),
        };
        if !violated {
            return Ok(());
        }
        match on_error {
            OnError::Fail => Err(Error::AccountControlViolation {
                constraint: self.to_string(),
            }),
            OnError::Log => {
                tracing::error!("Account violates constraint {self} at {dt}");
                Ok(())
            }
        }
    }
}
