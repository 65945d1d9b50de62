use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::{
    Timestamp,
    asset::{Asset, Sid},
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub asset: Asset,
    pub amount: i64,
    /// Volume weighted average entry price.
    pub cost_basis: f64,
    pub last_sale_price: f64,
    pub last_sale_date: Option<Timestamp>,
}

impl Position {
    pub fn new(asset: Asset) -> Self {
        Self {
            asset,
            amount: 0,
            cost_basis: 0.,
            last_sale_price: f64::NAN,
            last_sale_date: None,
        }
    }

    pub fn market_value(&self) -> f64 {
        if self.last_sale_price.is_nan() {
            self.amount as f64 * self.cost_basis
        } else {
            self.amount as f64 * self.last_sale_price
        }
    }

    /// Applies a signed fill and keeps the cost basis volume weighted.
    pub fn on_fill(&mut self, qty: i64, price: f64, dt: Timestamp) {
        let total = self.amount + qty;
        if total == 0 {
            self.cost_basis = 0.;
        } else if self.amount == 0 || self.amount.signum() != total.signum() {
            self.cost_basis = price;
        } else if self.amount.signum() == qty.signum() {
            self.cost_basis =
                (self.cost_basis * self.amount as f64 + price * qty as f64) / total as f64;
        }
        self.amount = total;
        self.last_sale_price = price;
        self.last_sale_date = Some(dt);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Portfolio {
    pub starting_cash: f64,
    pub cash: f64,
    pub positions: FxHashMap<Sid, Position>,
    pub positions_value: f64,
    pub portfolio_value: f64,
}

impl Portfolio {
    pub fn new(starting_cash: f64, cash: f64, positions: FxHashMap<Sid, Position>) -> Self {
        let positions_value = positions.values().map(Position::market_value).sum::<f64>();
        Self {
            starting_cash,
            cash,
            positions,
            positions_value,
            portfolio_value: cash + positions_value,
        }
    }

    pub fn position_amount(&self, asset: &Asset) -> i64 {
        self.positions.get(&asset.sid).map_or(0, |p| p.amount)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub buying_power: f64,
    pub total_position_value: f64,
    pub net_liquidation: f64,
    pub leverage: f64,
}

impl Account {
    pub fn from_portfolio(portfolio: &Portfolio) -> Self {
        let gross: f64 = portfolio
            .positions
            .values()
            .map(|p| p.market_value().abs())
            .sum();
        let leverage = if portfolio.portfolio_value > 0. {
            gross / portfolio.portfolio_value
        } else {
            0.
        };
        Self {
            buying_power: portfolio.cash.max(0.),
            total_position_value: portfolio.positions_value,
            net_liquidation: portfolio.portfolio_value,
            leverage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_position_cost_basis() {
        let mut pos = Position::new(Asset::new(1, "AAPL"));
        let now = Utc::now();
        pos.on_fill(10, 100., now);
        pos.on_fill(10, 110., now);
        assert_eq!(pos.amount, 20);
        assert_eq!(pos.cost_basis, 105.);
        // reducing keeps the basis
        pos.on_fill(-5, 120., now);
        assert_eq!(pos.cost_basis, 105.);
        // crossing zero restarts it
        pos.on_fill(-25, 90., now);
        assert_eq!(pos.amount, -10);
        assert_eq!(pos.cost_basis, 90.);
        pos.on_fill(10, 95., now);
        assert_eq!(pos.amount, 0);
        assert_eq!(pos.cost_basis, 0.);
    }

    #[test]
    fn test_portfolio_and_account_values() {
        let asset = Asset::new(1, "AAPL");
        let mut pos = Position::new(asset.clone());
        pos.on_fill(10, 100., Utc::now());
        let mut positions = FxHashMap::default();
        positions.insert(asset.sid, pos);
        let portfolio = Portfolio::new(2000., 1000., positions);
        assert_eq!(portfolio.positions_value, 1000.);
        assert_eq!(portfolio.portfolio_value, 2000.);
        assert_eq!(portfolio.position_amount(&asset), 10);

        let account = Account::from_portfolio(&portfolio);
        assert_eq!(account.leverage, 0.5);
        assert_eq!(account.buying_power, 1000.);
    }
}
