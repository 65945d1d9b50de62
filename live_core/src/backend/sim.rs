//! In-memory broker used for paper trading and tests.
//!
//! Orders go through the shared [`OrderRouter`] so flip splitting and open
//! order reconciliation behave as they would against a remote broker: every
//! state change is published as a [`TradeUpdate`] on the reconcile channel.
use std::{
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock},
};

use chrono::{NaiveTime, TimeDelta, Utc};
use chrono_tz::America::New_York;
use rustc_hash::FxHashMap;
use serde::Deserialize;
use tokio::sync::mpsc::{self, UnboundedSender};

use super::{Backend, Bar, BarTable, Field, SpotValue, TradeEvent, TradeUpdate};
use crate::{
    DataFrequency, Timestamp,
    asset::{Asset, Sid},
    error::{Error, Result},
    order::{Order, OrderId, OrderStatus, OrderStyle},
    portfolio::{Account, Portfolio, Position},
    reconcile::{OpenOrders, OrderGateway, OrderRouter, ReconcileMsg, Reconciler},
    utils::floor_minute,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FillMode {
    /// Marketable orders fill at the last close as soon as they arrive.
    #[default]
    Immediate,
    /// Orders rest until `fill`, `cancel_from_broker` or `reject` is called.
    Manual,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SimConfig {
    #[serde(default = "default_cash")]
    pub cash: f64,
    /// Directory of `<SYMBOL>.csv` minute bars.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    #[serde(default)]
    pub fill_mode: FillMode,
    #[serde(default)]
    pub time_skew_secs: i64,
    #[serde(default)]
    pub assets: Vec<Asset>,
}

fn default_cash() -> f64 {
    100_000.
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            cash: default_cash(),
            data_dir: None,
            fill_mode: FillMode::default(),
            time_skew_secs: 0,
            assets: Vec::new(),
        }
    }
}

impl SimConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }
}

/// Minute bars per sid, oldest first.
#[derive(Debug, Default)]
struct MarketData {
    bars: RwLock<FxHashMap<Sid, Vec<Bar>>>,
}

impl MarketData {
    fn load_dir(dir: &Path, assets: &[Asset]) -> Result<Self> {
        let data = Self::default();
        for asset in assets {
            let path = dir.join(format!("{}.csv", asset.symbol));
            if !path.exists() {
                tracing::warn!("No bars for {} at {}", asset.symbol, path.display());
                continue;
            }
            let mut reader = csv::Reader::from_path(&path)?;
            let bars = reader.deserialize().collect::<std::result::Result<Vec<Bar>, _>>()?;
            tracing::info!("Loaded {} bars for {}", bars.len(), asset.symbol);
            data.extend(asset.sid, bars);
        }
        Ok(data)
    }

    fn extend(&self, sid: Sid, bars: Vec<Bar>) {
        let mut all = self.bars.write().unwrap_or_else(PoisonError::into_inner);
        let series = all.entry(sid).or_default();
        series.extend(bars);
        series.sort_by_key(|b| b.dt);
        series.dedup_by_key(|b| b.dt);
    }

    fn minute_bars(&self, sid: Sid, end: Timestamp, count: usize) -> Vec<Bar> {
        let all = self.bars.read().unwrap_or_else(PoisonError::into_inner);
        let Some(series) = all.get(&sid) else {
            return Vec::new();
        };
        let stop = series.partition_point(|b| b.dt <= end);
        series[stop.saturating_sub(count)..stop].to_vec()
    }

    /// Minute bars rolled up per New York trading date, labelled at midnight UTC.
    fn daily_bars(&self, sid: Sid, end: Timestamp, count: usize) -> Vec<Bar> {
        let minutes = self.minute_bars(sid, end, usize::MAX);
        let mut days: Vec<Bar> = Vec::new();
        for bar in minutes {
            let label = bar
                .dt
                .with_timezone(&New_York)
                .date_naive()
                .and_time(NaiveTime::MIN)
                .and_utc();
            match days.last_mut() {
                Some(day) if day.dt == label => {
                    day.high = day.high.max(bar.high);
                    day.low = day.low.min(bar.low);
                    day.close = bar.close;
                    day.volume += bar.volume;
                }
                _ => days.push(Bar { dt: label, ..bar }),
            }
        }
        let start = days.len().saturating_sub(count);
        days.split_off(start)
    }

    fn bars(&self, sid: Sid, frequency: DataFrequency, end: Timestamp, count: usize) -> Vec<Bar> {
        match frequency {
            DataFrequency::Minute => self.minute_bars(sid, end, count),
            DataFrequency::Daily => self.daily_bars(sid, end, count),
        }
    }

    fn last_price(&self, sid: Sid, at: Timestamp) -> Option<f64> {
        self.minute_bars(sid, at, usize::MAX)
            .iter()
            .rev()
            .map(|b| b.close)
            .find(|c| !c.is_nan())
    }

    fn last_traded(&self, sid: Sid, at: Timestamp) -> Option<Timestamp> {
        self.minute_bars(sid, at, usize::MAX)
            .iter()
            .rev()
            .find(|b| b.volume > 0.)
            .map(|b| b.dt)
    }
}

/// The price a resting order would execute at, if it is marketable at `price`.
fn execution_price(style: &OrderStyle, amount: i64, price: f64) -> Option<f64> {
    let buy = amount > 0;
    let limit_ok = |limit: f64| if buy { price <= limit } else { price >= limit };
    let stop_hit = |stop: f64| if buy { price >= stop } else { price <= stop };
    let ok = match *style {
        OrderStyle::Market => true,
        OrderStyle::Limit(limit) => limit_ok(limit),
        OrderStyle::Stop(stop) => stop_hit(stop),
        OrderStyle::StopLimit { limit, stop } => stop_hit(stop) && limit_ok(limit),
    };
    ok.then_some(price)
}

#[derive(Debug)]
struct Book {
    starting_cash: f64,
    cash: f64,
    positions: FxHashMap<Sid, Position>,
    orders: FxHashMap<OrderId, Order>,
    submit_failure: Option<u16>,
    now: Option<Timestamp>,
}

impl Book {
    fn now(&self) -> Timestamp {
        self.now.unwrap_or_else(Utc::now)
    }
}

struct SimExchange {
    book: Mutex<Book>,
    market: MarketData,
    fill_mode: FillMode,
    updates: UnboundedSender<ReconcileMsg>,
}

impl SimExchange {
    fn lock(&self) -> MutexGuard<'_, Book> {
        self.book.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, event: TradeEvent, order: &Order) {
        let update = TradeUpdate {
            event,
            order: order.clone(),
        };
        if self.updates.send(ReconcileMsg::Trade(update)).is_err() {
            tracing::debug!("No listener for trade update on {}", order.id);
        }
    }

    fn unknown(id: &OrderId) -> Error {
        Error::Http {
            status: 404,
            message: format!("order {id} not found"),
        }
    }

    /// Fills up to `qty` shares (everything when `None`) of an open order.
    fn execute(&self, book: &mut Book, id: &OrderId, qty: Option<u64>, price: f64) -> Result<()> {
        let now = book.now();
        let order = book.orders.get_mut(id).ok_or_else(|| Self::unknown(id))?;
        if !order.open() {
            return Err(Error::Http {
                status: 422,
                message: format!("order {id} is {:?}", order.status()),
            });
        }
        let signed = order.apply_fill(qty.unwrap_or(u64::MAX));
        let event = if order.open_amount() == 0 {
            TradeEvent::Fill
        } else {
            TradeEvent::PartialFill
        };
        let order = order.clone();

        let position = book
            .positions
            .entry(order.asset.sid)
            .or_insert_with(|| Position::new(order.asset.clone()));
        position.on_fill(signed, price, now);
        if position.amount == 0 {
            book.positions.remove(&order.asset.sid);
        }
        book.cash -= signed as f64 * price;

        tracing::info!("Filled {signed} {} at {price} for order {id}", order.asset.symbol);
        self.publish(event, &order);
        Ok(())
    }

    fn finish(&self, id: &OrderId, status: OrderStatus, event: TradeEvent) -> Result<()> {
        let mut book = self.lock();
        let order = book.orders.get_mut(id).ok_or_else(|| Self::unknown(id))?;
        if !order.open() {
            return Err(Error::Http {
                status: 422,
                message: format!("order {id} is already {:?}", order.status()),
            });
        }
        order.set_broker_status(status);
        let order = order.clone();
        drop(book);
        self.publish(event, &order);
        Ok(())
    }

    /// Tries every resting order against the latest prices.
    fn match_resting(&self) {
        let mut book = self.lock();
        let now = book.now();
        let candidates: Vec<(OrderId, f64)> = book
            .orders
            .values()
            .filter(|o| o.open())
            .filter_map(|o| {
                let price = self.market.last_price(o.asset.sid, now)?;
                execution_price(&o.style, o.open_amount(), price).map(|p| (o.id.clone(), p))
            })
            .collect();
        for (id, price) in candidates {
            if let Err(e) = self.execute(&mut book, &id, None, price) {
                tracing::warn!("Could not fill resting order {id}: {e}");
            }
        }
    }

    fn open_orders(&self) -> Vec<Order> {
        self.lock().orders.values().filter(|o| o.open()).cloned().collect()
    }
}

impl OrderGateway for SimExchange {
    fn submit(&self, id: OrderId, asset: &Asset, amount: i64, style: &OrderStyle) -> Result<Order> {
        let mut book = self.lock();
        if let Some(status) = book.submit_failure {
            return Err(Error::Http {
                status,
                message: "order submission refused".into(),
            });
        }
        let now = book.now();
        let order = Order::new(id.clone(), now, asset.clone(), amount, *style);
        book.orders.insert(id.clone(), order.clone());
        self.publish(TradeEvent::New, &order);

        if self.fill_mode == FillMode::Immediate {
            match self.market.last_price(asset.sid, now) {
                Some(price) => {
                    if let Some(price) = execution_price(style, amount, price) {
                        self.execute(&mut book, &id, None, price)?;
                    }
                }
                None => {
                    if let Some(order) = book.orders.get_mut(&id) {
                        order.set_broker_status(OrderStatus::Rejected);
                        let order = order.clone();
                        tracing::warn!("Rejecting order {id}: no price for {}", asset.symbol);
                        self.publish(TradeEvent::Rejected, &order);
                    }
                }
            }
        }
        book.orders.get(&id).cloned().ok_or_else(|| Self::unknown(&id))
    }

    fn cancel(&self, id: &OrderId) -> Result<()> {
        self.finish(id, OrderStatus::Cancelled, TradeEvent::Canceled)
    }
}

pub struct SimBackend {
    assets: Vec<Asset>,
    exchange: Arc<SimExchange>,
    router: OrderRouter,
    reconciler: Mutex<Option<Reconciler>>,
    time_skew: TimeDelta,
    data_failure: Mutex<Option<u16>>,
}

impl SimBackend {
    pub fn builder() -> SimBackendBuilder {
        SimBackendBuilder::default()
    }

    pub fn from_config(config: SimConfig) -> Result<Self> {
        let market = match &config.data_dir {
            Some(dir) => MarketData::load_dir(dir, &config.assets)?,
            None => MarketData::default(),
        };
        Ok(Self::assemble(config, market, None))
    }

    fn assemble(config: SimConfig, market: MarketData, now: Option<Timestamp>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let exchange = Arc::new(SimExchange {
            book: Mutex::new(Book {
                starting_cash: config.cash,
                cash: config.cash,
                positions: FxHashMap::default(),
                orders: FxHashMap::default(),
                submit_failure: None,
                now,
            }),
            market,
            fill_mode: config.fill_mode,
            updates: tx.clone(),
        });
        let open_orders = OpenOrders::default();
        let router = OrderRouter::new(exchange.clone(), open_orders.clone(), tx);
        let reconciler = Reconciler::new(exchange.clone(), open_orders, rx);
        Self {
            assets: config.assets,
            exchange,
            router,
            reconciler: Mutex::new(Some(reconciler)),
            time_skew: TimeDelta::seconds(config.time_skew_secs),
            data_failure: Mutex::new(None),
        }
    }

    pub fn add_bars(&self, sid: Sid, bars: Vec<Bar>) {
        self.exchange.market.extend(sid, bars);
    }

    /// Pins the simulated broker clock. Without it the wall clock is used.
    pub fn set_time(&self, dt: Timestamp) {
        self.exchange.lock().now = Some(dt);
    }

    /// Makes every order submission fail with this HTTP status.
    pub fn fail_submissions(&self, status: Option<u16>) {
        self.exchange.lock().submit_failure = status;
    }

    /// Makes every market data request fail with this HTTP status.
    pub fn fail_data(&self, status: Option<u16>) {
        *self.data_failure.lock().unwrap_or_else(PoisonError::into_inner) = status;
    }

    pub fn set_position(&self, asset: &Asset, amount: i64, cost_basis: f64) {
        let mut book = self.exchange.lock();
        let now = book.now();
        let mut position = Position::new(asset.clone());
        position.on_fill(amount, cost_basis, now);
        book.positions.insert(asset.sid, position);
    }

    pub fn fill(&self, id: &OrderId, price: f64) -> Result<()> {
        let mut book = self.exchange.lock();
        self.exchange.execute(&mut book, id, None, price)
    }

    pub fn partial_fill(&self, id: &OrderId, qty: u64, price: f64) -> Result<()> {
        let mut book = self.exchange.lock();
        self.exchange.execute(&mut book, id, Some(qty), price)
    }

    pub fn cancel_from_broker(&self, id: &OrderId) -> Result<()> {
        self.exchange.finish(id, OrderStatus::Cancelled, TradeEvent::Canceled)
    }

    pub fn reject(&self, id: &OrderId) -> Result<()> {
        self.exchange.finish(id, OrderStatus::Rejected, TradeEvent::Rejected)
    }

    /// Applies queued trade updates inline while no stream task owns them.
    pub fn process_updates(&self) -> usize {
        let mut reconciler = self.reconciler.lock().unwrap_or_else(PoisonError::into_inner);
        reconciler.as_mut().map_or(0, Reconciler::drain)
    }

    /// Orders the broker has seen, whatever their state.
    pub fn submitted_orders(&self) -> Vec<Order> {
        let mut orders: Vec<Order> = self.exchange.lock().orders.values().cloned().collect();
        orders.sort_by_key(|o| o.created);
        orders
    }

    fn check_data(&self) -> Result<()> {
        match *self.data_failure.lock().unwrap_or_else(PoisonError::into_inner) {
            Some(status) => Err(Error::Http {
                status,
                message: "market data unavailable".into(),
            }),
            None => Ok(()),
        }
    }

    fn period_start(dt: Timestamp, frequency: DataFrequency) -> Timestamp {
        match frequency {
            DataFrequency::Minute => floor_minute(dt),
            DataFrequency::Daily => dt
                .with_timezone(&New_York)
                .date_naive()
                .and_time(NaiveTime::MIN)
                .and_utc(),
        }
    }
}

impl Backend for SimBackend {
    fn get_equities(&self) -> Result<Vec<Asset>> {
        Ok(self.assets.clone())
    }

    fn positions(&self) -> Result<FxHashMap<Sid, Position>> {
        Ok(self.exchange.lock().positions.clone())
    }

    fn portfolio(&self) -> Result<Portfolio> {
        let book = self.exchange.lock();
        let now = book.now();
        let mut positions = book.positions.clone();
        for position in positions.values_mut() {
            if let Some(price) = self.exchange.market.last_price(position.asset.sid, now) {
                position.last_sale_price = price;
            }
        }
        Ok(Portfolio::new(book.starting_cash, book.cash, positions))
    }

    fn account(&self) -> Result<Account> {
        Ok(Account::from_portfolio(&self.portfolio()?))
    }

    fn order(&self, asset: &Asset, amount: i64, style: &OrderStyle, flip_compatible: bool) -> Option<Order> {
        let position = self
            .exchange
            .lock()
            .positions
            .get(&asset.sid)
            .map_or(0, |p| p.amount);
        self.router.submit(asset, amount, style, position, flip_compatible)
    }

    fn all_orders(
        &self,
        before: Option<Timestamp>,
        status: Option<OrderStatus>,
        days_back: Option<i64>,
    ) -> Result<FxHashMap<OrderId, Order>> {
        let book = self.exchange.lock();
        let since = days_back.map(|days| book.now() - TimeDelta::days(days));
        Ok(book
            .orders
            .iter()
            .filter(|(_, o)| before.is_none_or(|b| o.created < b))
            .filter(|(_, o)| since.is_none_or(|s| o.created >= s))
            .filter(|(_, o)| status.is_none_or(|s| o.status() == s))
            .map(|(id, o)| (id.clone(), o.clone()))
            .collect())
    }

    fn open_orders(&self) -> FxHashMap<OrderId, Order> {
        self.router.open_orders().snapshot()
    }

    fn get_order(&self, id: &OrderId) -> Option<Order> {
        self.router
            .open_orders()
            .get(id)
            .or_else(|| self.exchange.lock().orders.get(id).cloned())
    }

    fn cancel_order(&self, id: &OrderId) {
        if let Err(e) = self.router.cancel(id) {
            tracing::warn!("Failed to cancel order {id}: {e}");
        }
    }

    fn get_spot_value(
        &self,
        assets: &[Asset],
        field: Field,
        dt: Timestamp,
        frequency: DataFrequency,
        compat: bool,
    ) -> Result<Vec<SpotValue>> {
        self.check_data()?;
        let period = Self::period_start(dt, frequency);
        let market = &self.exchange.market;
        Ok(assets
            .iter()
            .map(|asset| {
                if field == Field::LastTraded {
                    return SpotValue::Time(market.last_traded(asset.sid, dt));
                }
                match market.bars(asset.sid, frequency, dt, 1).pop() {
                    Some(bar) if compat || bar.dt >= period => SpotValue::Number(bar.field(field)),
                    _ => SpotValue::MISSING,
                }
            })
            .collect())
    }

    fn get_bars(
        &self,
        assets: &[Asset],
        frequency: DataFrequency,
        bar_count: usize,
        end_dt: Timestamp,
    ) -> Result<BarTable> {
        self.check_data()?;
        let mut table = BarTable::default();
        for asset in assets {
            table.insert(
                asset.sid,
                self.exchange.market.bars(asset.sid, frequency, end_dt, bar_count),
            );
        }
        Ok(table)
    }

    fn get_last_traded_dt(&self, asset: &Asset) -> Result<Option<Timestamp>> {
        self.check_data()?;
        let now = self.exchange.lock().now();
        Ok(self.exchange.market.last_traded(asset.sid, now))
    }

    fn time_skew(&self) -> TimeDelta {
        self.time_skew
    }

    fn initialize_data(&self) -> Result<()> {
        let mut slot = self.reconciler.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(mut reconciler) = slot.take() else {
            return Ok(());
        };
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(e) => {
                *slot = Some(reconciler);
                return Err(Error::Backend(format!("trade update stream needs a tokio runtime: {e}")));
            }
        };
        reconciler.drain();
        self.router.open_orders().reset(self.exchange.open_orders());
        handle.spawn(reconciler.run());
        tracing::info!("Trade update stream started");
        Ok(())
    }

    fn sync_open_orders(&self) -> Result<()> {
        if self.exchange.fill_mode == FillMode::Immediate {
            self.exchange.match_resting();
        }
        self.router.open_orders().reset(self.exchange.open_orders());
        Ok(())
    }
}

/// Builds a [`SimBackend`] in code, mostly for tests and demos.
#[derive(Default)]
pub struct SimBackendBuilder {
    config: SimConfig,
    bars: Vec<(Sid, Vec<Bar>)>,
    now: Option<Timestamp>,
}

impl SimBackendBuilder {
    pub fn cash(mut self, cash: f64) -> Self {
        self.config.cash = cash;
        self
    }

    pub fn asset(mut self, asset: Asset) -> Self {
        self.config.assets.push(asset);
        self
    }

    pub fn fill_mode(mut self, fill_mode: FillMode) -> Self {
        self.config.fill_mode = fill_mode;
        self
    }

    pub fn bars(mut self, sid: Sid, bars: Vec<Bar>) -> Self {
        self.bars.push((sid, bars));
        self
    }

    pub fn time(mut self, now: Timestamp) -> Self {
        self.now = Some(now);
        self
    }

    pub fn time_skew(mut self, skew: TimeDelta) -> Self {
        self.config.time_skew_secs = skew.num_seconds();
        self
    }

    pub fn build(self) -> SimBackend {
        let market = MarketData::default();
        for (sid, bars) in self.bars {
            market.extend(sid, bars);
        }
        SimBackend::assemble(self.config, market, self.now)
    }
}
