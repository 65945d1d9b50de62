//! Market data access between algorithms and the backend.
pub mod bardata;

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, PoisonError},
};

use rayon::prelude::*;
use statrs::statistics::Statistics;

use crate::{
    DataFrequency, Timestamp,
    asset::{Asset, Sid},
    backend::{Backend, BarTable, Field, SpotValue},
    calendar::TradingCalendar,
    error::{Error, Result},
    utils::fill_nan,
};

pub use bardata::{BarData, Current, History, Selection};

/// HTTP statuses treated as "no data" instead of errors.
pub const SKIPPED_HTTP_STATUSES: [u16; 2] = [404, 504];

const BAR_CACHE_SIZE: usize = 10;

/// Maps transient HTTP failures onto a no-data value.
pub fn skip_http_error<T>(result: Result<T>, fallback: impl FnOnce() -> T) -> Result<T> {
    match result {
        Err(Error::Http { status, message }) if SKIPPED_HTTP_STATUSES.contains(&status) => {
            tracing::warn!("Ignoring http {status}: {message}");
            Ok(fallback())
        }
        other => other,
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Series {
    pub index: Vec<Timestamp>,
    pub values: Vec<f64>,
}

impl Series {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn last(&self) -> Option<f64> {
        self.values.last().copied()
    }

    /// NaN when empty or when any value is NaN.
    pub fn mean(&self) -> f64 {
        self.values.iter().mean()
    }

    fn tail(mut self, n: usize) -> Self {
        let start = self.values.len().saturating_sub(n);
        self.index.drain(..start);
        self.values.drain(..start);
        self
    }
}

/// A fixed-width private thread pool for fanning out backend calls.
pub struct FetchPool {
    pool: rayon::ThreadPool,
}

impl FetchPool {
    pub fn new(workers: usize) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers.max(1))
            .thread_name(|i| format!("live-fetch-{i}"))
            .build()
            .map_err(|e| Error::Config(format!("cannot build fetch pool: {e}")))?;
        Ok(Self { pool })
    }

    pub fn workers(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Runs `f` over `items` in parallel, blocking until all finish. Output order follows input order.
    pub fn map<T, R, F>(&self, items: &[T], f: F) -> Vec<R>
    where
        T: Sync,
        R: Send,
        F: Fn(&T) -> R + Sync + Send,
    {
        self.pool.install(|| items.par_iter().map(f).collect())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct BarKey {
    sids: Vec<Sid>,
    frequency: DataFrequency,
    bar_count: usize,
    end: Timestamp,
}

#[derive(Debug, Clone)]
pub struct PortalOptions {
    pub fetch_workers: usize,
    /// Re-request all-NaN history windows this many times in total.
    pub nan_retry_attempts: usize,
    pub compat: bool,
}

impl Default for PortalOptions {
    fn default() -> Self {
        Self {
            fetch_workers: 10,
            nan_retry_attempts: 3,
            compat: true,
        }
    }
}

pub struct DataPortal {
    backend: Arc<dyn Backend>,
    calendar: Arc<dyn TradingCalendar>,
    pool: FetchPool,
    options: PortalOptions,
    cache: Mutex<VecDeque<(BarKey, Arc<BarTable>)>>,
}

impl DataPortal {
    pub fn new(
        backend: Arc<dyn Backend>,
        calendar: Arc<dyn TradingCalendar>,
        options: PortalOptions,
    ) -> Result<Self> {
        Ok(Self {
            backend,
            calendar,
            pool: FetchPool::new(options.fetch_workers)?,
            options,
            cache: Mutex::new(VecDeque::with_capacity(BAR_CACHE_SIZE)),
        })
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn calendar(&self) -> &Arc<dyn TradingCalendar> {
        &self.calendar
    }

    pub fn pool(&self) -> &FetchPool {
        &self.pool
    }

    pub fn cache_clear(&self) {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    pub fn get_spot_value(
        &self,
        asset: &Asset,
        field: Field,
        dt: Timestamp,
        frequency: DataFrequency,
    ) -> Result<SpotValue> {
        if field == Field::LastTraded {
            let last = skip_http_error(self.backend.get_last_traded_dt(asset), || None)?;
            return Ok(SpotValue::Time(last));
        }
        let values = skip_http_error(
            self.backend.get_spot_value(
                std::slice::from_ref(asset),
                field,
                dt,
                frequency,
                self.options.compat,
            ),
            Vec::new,
        )?;
        Ok(values.into_iter().next().unwrap_or(SpotValue::MISSING))
    }

    /// One value per (asset, field) pair, fetched in parallel, in input order.
    pub fn get_spot_values(
        &self,
        pairs: &[(Asset, Field)],
        dt: Timestamp,
        frequency: DataFrequency,
    ) -> Result<Vec<SpotValue>> {
        self.pool
            .map(pairs, |(asset, field)| self.get_spot_value(asset, *field, dt, frequency))
            .into_iter()
            .collect()
    }

    pub fn get_bars(
        &self,
        assets: &[Asset],
        frequency: DataFrequency,
        bar_count: usize,
        end: Timestamp,
    ) -> Result<Arc<BarTable>> {
        let key = BarKey {
            sids: assets.iter().map(|a| a.sid).collect(),
            frequency,
            bar_count,
            end,
        };
        {
            let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(pos) = cache.iter().position(|(k, _)| *k == key) {
                if let Some(hit) = cache.remove(pos) {
                    let table = hit.1.clone();
                    cache.push_back(hit);
                    return Ok(table);
                }
            }
        }

        let parts = self.pool.map(assets, |asset| {
            skip_http_error(
                self.backend
                    .get_bars(std::slice::from_ref(asset), frequency, bar_count, end),
                BarTable::default,
            )
            .map(|table| (asset.sid, table.get(asset.sid).to_vec()))
        });
        let mut table = BarTable::default();
        for part in parts {
            let (sid, bars) = part?;
            table.insert(sid, bars);
        }
        let table = Arc::new(table);

        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        if cache.len() == BAR_CACHE_SIZE {
            cache.pop_front();
        }
        cache.push_back((key, table.clone()));
        Ok(table)
    }

    /// Trailing `bar_count` values of `field` per asset, ending at `end`.
    pub fn get_history_window(
        &self,
        assets: &[Asset],
        end: Timestamp,
        bar_count: usize,
        frequency: DataFrequency,
        field: Field,
        ffill: bool,
    ) -> Result<Vec<Series>> {
        let column = match field {
            Field::Price => Field::Close,
            other => other,
        };
        let attempts = self.options.nan_retry_attempts.max(1);
        let mut attempt = 1;
        let table = loop {
            let table = self.get_bars(assets, frequency, bar_count * attempt, end)?;
            let hole = assets.iter().find(|a| table.all_nan(a.sid, column));
            let Some(asset) = hole.filter(|_| self.options.compat && attempt < attempts) else {
                break table;
            };
            tracing::debug!(
                "History window of {} bars is all NaN for {}, widening (attempt {attempt})",
                bar_count * attempt,
                asset.symbol
            );
            attempt += 1;
        };

        Ok(assets
            .iter()
            .map(|asset| {
                let mut series = table.column(asset.sid, column);
                if ffill && field == Field::Price {
                    fill_nan(&mut series.values);
                }
                series.tail(bar_count)
            })
            .collect())
    }
}
