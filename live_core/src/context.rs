//! The handle every algorithm callback receives.
//!
//! `TradingContext` owns everything an algorithm may touch between ticks:
//! the order API with its validation rules, registered controls, scheduled
//! events, recorded values and free-form variables. The executor moves it
//! through time with [`TradingContext::on_dt_changed`].
use std::{collections::BTreeMap, sync::Arc};

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use rustc_hash::FxHashSet;
use serde::{Serialize, de::DeserializeOwned};

use crate::{
    DataFrequency, Timestamp,
    asset::{Asset, AssetFinder, Sid},
    backend::Backend,
    controls::{AccountControl, ControlInput, OnError, TradingControl},
    data::{BarData, DataPortal},
    error::{Error, Result},
    order::{Order, OrderId, OrderStatus, OrderStyle},
    portfolio::{Account, Portfolio},
    schedule::{DateRule, EventManager, ScheduledEvent, TimeRule},
    state::PersistedState,
    utils::{round_if_near_integer, tolerant_equals},
};

/// No algorithm orders this many shares unless it is broken.
pub const MAX_ORDER_SHARES: f64 = 1e11;

/// Price parameters of an order. `style` excludes `limit` and `stop`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct OrderParams {
    pub limit: Option<f64>,
    pub stop: Option<f64>,
    pub style: Option<OrderStyle>,
}

impl OrderParams {
    pub fn market() -> Self {
        Self::default()
    }

    pub fn limit(price: f64) -> Self {
        Self {
            limit: Some(price),
            ..Self::default()
        }
    }

    pub fn stop(price: f64) -> Self {
        Self {
            stop: Some(price),
            ..Self::default()
        }
    }

    pub fn style(style: OrderStyle) -> Self {
        Self {
            style: Some(style),
            ..Self::default()
        }
    }

    fn resolve(&self) -> Result<OrderStyle> {
        match self.style {
            Some(_) if self.limit.is_some() || self.stop.is_some() => Err(Error::UnsupportedOrderParameters),
            Some(style) => Ok(style),
            None => Ok(OrderStyle::from_prices(self.limit, self.stop)),
        }
    }
}

pub struct TradingContext {
    name: String,
    backend: Arc<dyn Backend>,
    portal: Arc<DataPortal>,
    finder: AssetFinder,
    frequency: DataFrequency,
    datetime: Timestamp,
    flip_compatible: bool,
    initialized: bool,
    in_before_trading_start: bool,
    trading_controls: Vec<TradingControl>,
    account_controls: Vec<AccountControl>,
    events: EventManager,
    recorded: BTreeMap<String, f64>,
    user: serde_json::Map<String, serde_json::Value>,
    portfolio: Option<Portfolio>,
    account: Option<Account>,
}

impl TradingContext {
    pub fn new(
        name: impl Into<String>,
        portal: Arc<DataPortal>,
        frequency: DataFrequency,
        flip_compatible: bool,
    ) -> Self {
        let backend = portal.backend().clone();
        Self {
            name: name.into(),
            finder: AssetFinder::new(backend.clone()),
            backend,
            portal,
            frequency,
            datetime: Utc::now(),
            flip_compatible,
            initialized: false,
            in_before_trading_start: false,
            trading_controls: Vec::new(),
            account_controls: Vec::new(),
            events: EventManager::default(),
            recorded: BTreeMap::new(),
            user: serde_json::Map::new(),
            portfolio: None,
            account: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn portal(&self) -> &Arc<DataPortal> {
        &self.portal
    }

    pub fn frequency(&self) -> DataFrequency {
        self.frequency
    }

    pub fn datetime(&self) -> Timestamp {
        self.datetime
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Called by the runtime once `initialize` has returned.
    pub fn mark_initialized(&mut self) {
        self.initialized = true;
    }

    pub(crate) fn set_in_before_trading_start(&mut self, flag: bool) {
        self.in_before_trading_start = flag;
    }

    pub(crate) fn events_mut(&mut self) -> &mut EventManager {
        &mut self.events
    }

    /// Moves the algorithm clock and marks portfolio and account stale.
    pub fn on_dt_changed(&mut self, dt: Timestamp) {
        self.datetime = dt;
        self.invalidate_caches();
    }

    pub fn invalidate_caches(&mut self) {
        self.portfolio = None;
        self.account = None;
    }

    pub fn on_session_start(&mut self) {
        self.trading_controls.iter_mut().for_each(TradingControl::reset_session);
    }

    pub fn get_datetime(&self, tz: Option<Tz>) -> DateTime<Tz> {
        self.datetime.with_timezone(&tz.unwrap_or(chrono_tz::UTC))
    }

    /// A data view at the current algorithm time.
    pub fn current_data(&self) -> BarData {
        BarData::new(self.portal.clone(), self.frequency, self.datetime)
    }

    pub fn portfolio(&mut self) -> Result<&Portfolio> {
        if self.portfolio.is_none() {
            self.portfolio = Some(self.backend.portfolio()?);
        }
        Ok(self.portfolio.get_or_insert_with(Portfolio::default))
    }

    pub fn account(&mut self) -> Result<&Account> {
        if self.account.is_none() {
            self.account = Some(self.backend.account()?);
        }
        Ok(self.account.get_or_insert_with(Account::default))
    }

    fn ensure_not_in_before_trading_start(&self) -> Result<()> {
        if self.in_before_trading_start {
            return Err(Error::OrderInBeforeTradingStart);
        }
        Ok(())
    }

    /// False past the auto close date, with a warning.
    fn can_order_asset(&self, asset: &Asset) -> bool {
        if asset.auto_close_date.is_none() {
            return true;
        }
        let day = self.portal.calendar().session_label(self.datetime);
        match asset.last_order_date() {
            Some(last) if day > last => {
                tracing::warn!("Cannot place order for {}, as it is not tradable.", asset.symbol);
                false
            }
            _ => true,
        }
    }

    fn validate_order_params(&mut self, asset: &Asset, amount: i64, params: &OrderParams) -> Result<OrderStyle> {
        if !self.initialized {
            return Err(Error::OrderDuringInitialize);
        }
        let style = params.resolve()?;
        if self.trading_controls.is_empty() {
            return Ok(style);
        }

        let position = self.portfolio()?.position_amount(asset);
        let price = self.current_data().current_price(asset)?;
        let input = ControlInput {
            asset,
            amount,
            position,
            price,
            session: self.portal.calendar().session_label(self.datetime),
        };
        for control in &mut self.trading_controls {
            control.validate(&input)?;
        }
        Ok(style)
    }

    /// Places an order for `amount` shares, rounded toward zero unless within 1e-4 of an integer.
    ///
    /// Returns `None` when the amount rounds to zero, the asset is past its
    /// auto close date, or the broker refused the order.
    pub fn order(&mut self, asset: &Asset, amount: f64, params: OrderParams) -> Result<Option<OrderId>> {
        self.ensure_not_in_before_trading_start()?;
        if !self.can_order_asset(asset) {
            return Ok(None);
        }
        let amount = round_if_near_integer(amount);
        if amount.abs() > MAX_ORDER_SHARES {
            return Err(Error::OrderAmountOverflow(amount));
        }
        let amount = amount as i64;
        let style = self.validate_order_params(asset, amount, &params)?;
        if amount == 0 {
            return Ok(None);
        }
        let order = self.backend.order(asset, amount, &style, self.flip_compatible);
        Ok(order.map(|o| o.id))
    }

    fn order_value_amount(&self, asset: &Asset, value: f64) -> Result<f64> {
        let data = self.current_data();
        if !data.can_trade(asset)? {
            return Err(Error::CannotOrderDelistedAsset {
                symbol: asset.symbol.to_string(),
            });
        }
        let price = data.current_price(asset)?;
        if price.is_nan() {
            return Err(Error::NoTradablePrice {
                symbol: asset.symbol.to_string(),
            });
        }
        if tolerant_equals(price, 0.) {
            tracing::debug!("Price of 0 for {}; can't infer value", asset.symbol);
            return Ok(0.);
        }
        Ok(value / price)
    }

    fn order_percent_amount(&mut self, asset: &Asset, percent: f64) -> Result<f64> {
        let value = self.portfolio()?.portfolio_value * percent;
        self.order_value_amount(asset, value)
    }

    fn order_target_amount(&mut self, asset: &Asset, target: f64) -> Result<f64> {
        Ok(target - self.portfolio()?.position_amount(asset) as f64)
    }

    pub fn order_value(&mut self, asset: &Asset, value: f64, params: OrderParams) -> Result<Option<OrderId>> {
        self.ensure_not_in_before_trading_start()?;
        if !self.can_order_asset(asset) {
            return Ok(None);
        }
        let amount = self.order_value_amount(asset, value)?;
        self.order(asset, amount, params)
    }

    pub fn order_percent(&mut self, asset: &Asset, percent: f64, params: OrderParams) -> Result<Option<OrderId>> {
        self.ensure_not_in_before_trading_start()?;
        if !self.can_order_asset(asset) {
            return Ok(None);
        }
        let amount = self.order_percent_amount(asset, percent)?;
        self.order(asset, amount, params)
    }

    pub fn order_target(&mut self, asset: &Asset, target: f64, params: OrderParams) -> Result<Option<OrderId>> {
        self.ensure_not_in_before_trading_start()?;
        if !self.can_order_asset(asset) {
            return Ok(None);
        }
        let amount = self.order_target_amount(asset, target)?;
        self.order(asset, amount, params)
    }

    pub fn order_target_value(&mut self, asset: &Asset, target: f64, params: OrderParams) -> Result<Option<OrderId>> {
        self.ensure_not_in_before_trading_start()?;
        if !self.can_order_asset(asset) {
            return Ok(None);
        }
        let target = self.order_value_amount(asset, target)?;
        let amount = self.order_target_amount(asset, target)?;
        self.order(asset, amount, params)
    }

    pub fn order_target_percent(&mut self, asset: &Asset, target: f64, params: OrderParams) -> Result<Option<OrderId>> {
        self.ensure_not_in_before_trading_start()?;
        if !self.can_order_asset(asset) {
            return Ok(None);
        }
        let target = self.order_percent_amount(asset, target)?;
        let amount = self.order_target_amount(asset, target)?;
        self.order(asset, amount, params)
    }

    /// Market orders for several assets at once. Zero amounts are skipped.
    pub fn batch_market_order(&mut self, share_counts: &[(Asset, f64)]) -> Result<Vec<Option<OrderId>>> {
        self.ensure_not_in_before_trading_start()?;
        if !self.initialized {
            return Err(Error::OrderDuringInitialize);
        }
        let orders: Vec<(Asset, i64, OrderStyle)> = share_counts
            .iter()
            .map(|(asset, amount)| (asset.clone(), round_if_near_integer(*amount) as i64, OrderStyle::Market))
            .filter(|(_, amount, _)| *amount != 0)
            .collect();
        Ok(self
            .backend
            .batch_order(&orders)
            .into_iter()
            .map(|o| o.map(|o| o.id))
            .collect())
    }

    pub fn cancel_order(&self, id: &OrderId) {
        self.backend.cancel_order(id);
    }

    pub fn get_order(&self, id: &OrderId) -> Option<Order> {
        self.backend.get_order(id)
    }

    fn group_by_asset(orders: impl IntoIterator<Item = Order>) -> BTreeMap<Asset, Vec<Order>> {
        let mut sorted: Vec<Order> = orders.into_iter().collect();
        sorted.sort_by_key(|o| o.created);
        let mut grouped: BTreeMap<Asset, Vec<Order>> = BTreeMap::new();
        for order in sorted {
            grouped.entry(order.asset.clone()).or_default().push(order);
        }
        grouped
    }

    /// Open orders per asset, oldest first.
    pub fn get_open_orders(&self) -> BTreeMap<Asset, Vec<Order>> {
        Self::group_by_asset(self.backend.open_orders().into_values())
    }

    pub fn get_open_orders_for(&self, asset: &Asset) -> Vec<Order> {
        self.get_open_orders().remove(asset).unwrap_or_default()
    }

    pub fn get_all_orders(
        &self,
        before: Option<Timestamp>,
        status: Option<OrderStatus>,
        days_back: Option<i64>,
    ) -> Result<BTreeMap<Asset, Vec<Order>>> {
        let orders = self.backend.all_orders(before, status, days_back)?;
        Ok(Self::group_by_asset(orders.into_values()))
    }

    /// Orders of any status placed in the last `days_back` days.
    pub fn get_recent_orders(&self, days_back: i64) -> Result<BTreeMap<Asset, Vec<Order>>> {
        self.get_all_orders(None, None, Some(days_back))
    }

    pub fn symbol(&mut self, symbol: &str) -> Result<Asset> {
        self.finder.lookup_symbol(symbol)
    }

    pub fn symbols(&mut self, symbols: &[&str]) -> Result<Vec<Asset>> {
        symbols.iter().map(|s| self.finder.lookup_symbol(s)).collect()
    }

    pub fn sid(&mut self, sid: Sid) -> Result<Asset> {
        self.finder.retrieve_asset(sid)
    }

    pub fn record(&mut self, name: impl Into<String>, value: f64) {
        self.recorded.insert(name.into(), value);
    }

    pub fn recorded_vars(&self) -> &BTreeMap<String, f64> {
        &self.recorded
    }

    /// Stores a variable that survives restarts through the state store.
    pub fn set_var<T: Serialize>(&mut self, name: impl Into<String>, value: &T) -> Result<()> {
        self.user.insert(name.into(), serde_json::to_value(value)?);
        Ok(())
    }

    pub fn var<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        self.user
            .get(name)
            .map(|v| serde_json::from_value(v.clone()))
            .transpose()
            .map_err(Error::from)
    }

    pub fn schedule_function(
        &mut self,
        name: impl Into<String>,
        date_rule: DateRule,
        time_rule: TimeRule,
        half_days: bool,
    ) {
        self.events.add(ScheduledEvent::new(name, date_rule, time_rule, half_days));
    }

    fn register_trading_control(&mut self, control: TradingControl) -> Result<()> {
        if self.initialized {
            return Err(Error::RegisterTradingControlPostInit);
        }
        self.trading_controls.push(control);
        Ok(())
    }

    pub fn set_max_order_size(
        &mut self,
        asset: Option<Asset>,
        max_shares: Option<u64>,
        max_notional: Option<f64>,
        on_error: OnError,
    ) -> Result<()> {
        self.register_trading_control(TradingControl::max_order_size(asset, max_shares, max_notional, on_error))
    }

    pub fn set_max_position_size(
        &mut self,
        asset: Option<Asset>,
        max_shares: Option<u64>,
        max_notional: Option<f64>,
        on_error: OnError,
    ) -> Result<()> {
        self.register_trading_control(TradingControl::max_position_size(asset, max_shares, max_notional, on_error))
    }

    pub fn set_max_order_count(&mut self, max_count: usize, on_error: OnError) -> Result<()> {
        self.register_trading_control(TradingControl::max_order_count(max_count, on_error))
    }

    pub fn set_long_only(&mut self, on_error: OnError) -> Result<()> {
        self.register_trading_control(TradingControl::LongOnly { on_error })
    }

    pub fn set_do_not_order_list(&mut self, assets: &[Asset], on_error: OnError) -> Result<()> {
        let sids: FxHashSet<Sid> = assets.iter().map(|a| a.sid).collect();
        self.register_trading_control(TradingControl::RestrictedList { sids, on_error })
    }

    pub fn set_max_leverage(&mut self, max_leverage: f64, on_error: OnError) -> Result<()> {
        if self.initialized {
            return Err(Error::RegisterAccountControlPostInit);
        }
        self.account_controls.push(AccountControl::MaxLeverage { max_leverage, on_error });
        Ok(())
    }

    pub fn validate_account_controls(&mut self) -> Result<()> {
        if self.account_controls.is_empty() {
            return Ok(());
        }
        let dt = self.datetime;
        let account = self.account()?.clone();
        self.account_controls
            .iter()
            .try_for_each(|control| control.validate(&account, dt))
    }

    pub fn set_slippage(&self) {
        tracing::debug!("set_slippage has no effect in live trading");
    }

    pub fn set_commission(&self) {
        tracing::debug!("set_commission has no effect in live trading");
    }

    pub fn set_benchmark(&self, asset: &Asset) {
        tracing::debug!("Ignoring benchmark {}", asset.symbol);
    }

    pub fn persisted_state(&self) -> PersistedState {
        let mut state = PersistedState::new(&self.name);
        state.recorded = self.recorded.clone();
        state.user = self.user.clone();
        state
    }

    /// Applies saved values. A foreign or unknown state leaves the context untouched.
    pub fn restore(&mut self, state: PersistedState) -> Result<()> {
        state.verify(&self.name)?;
        self.recorded = state.recorded;
        self.user = state.user;
        tracing::info!("Restored state of {} ({} variables)", self.name, self.user.len());
        Ok(())
    }
}
