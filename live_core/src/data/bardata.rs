use std::sync::Arc;

use chrono::NaiveTime;

use super::{DataPortal, Series};
use crate::{
    DataFrequency, Timestamp,
    asset::Asset,
    backend::{Field, SpotValue},
    error::{Error, Result},
    utils::fill_nan,
};

/// One item or a list; decides the shape of lookups.
#[derive(Debug, Clone, PartialEq)]
pub enum Selection<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> Selection<T> {
    pub fn items(&self) -> &[T] {
        match self {
            Selection::One(item) => std::slice::from_ref(item),
            Selection::Many(items) => items,
        }
    }

    fn is_one(&self) -> bool {
        matches!(self, Selection::One(_))
    }
}

impl From<Asset> for Selection<Asset> {
    fn from(asset: Asset) -> Self {
        Selection::One(asset)
    }
}

impl From<&Asset> for Selection<Asset> {
    fn from(asset: &Asset) -> Self {
        Selection::One(asset.clone())
    }
}

impl From<Vec<Asset>> for Selection<Asset> {
    fn from(assets: Vec<Asset>) -> Self {
        Selection::Many(assets)
    }
}

impl From<&[Asset]> for Selection<Asset> {
    fn from(assets: &[Asset]) -> Self {
        Selection::Many(assets.to_vec())
    }
}

impl From<Field> for Selection<Field> {
    fn from(field: Field) -> Self {
        Selection::One(field)
    }
}

impl From<Vec<Field>> for Selection<Field> {
    fn from(fields: Vec<Field>) -> Self {
        Selection::Many(fields)
    }
}

impl From<&[Field]> for Selection<Field> {
    fn from(fields: &[Field]) -> Self {
        Selection::Many(fields.to_vec())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Current {
    Scalar(SpotValue),
    ByAsset(Vec<(Asset, SpotValue)>),
    ByField(Vec<(Field, SpotValue)>),
    Frame(Vec<(Asset, Vec<(Field, SpotValue)>)>),
}

impl Current {
    pub fn scalar(&self) -> Option<SpotValue> {
        match self {
            Current::Scalar(v) => Some(*v),
            _ => None,
        }
    }
}

/// Columns sharing one time index. Missing cells are NaN.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame<K> {
    pub index: Vec<Timestamp>,
    pub columns: Vec<(K, Vec<f64>)>,
}

impl<K> Frame<K> {
    /// Merges the series on the union of their timestamps and keeps the last
    /// `bar_count` rows. Columns selected by `fill` are filled across the merged
    /// index before the cut.
    fn align(series: Vec<(K, Series)>, bar_count: usize, fill: impl Fn(&K) -> bool) -> Self {
        let mut index: Vec<Timestamp> = series.iter().flat_map(|(_, s)| s.index.iter().copied()).collect();
        index.sort();
        index.dedup();
        let start = index.len().saturating_sub(bar_count);
        let columns = series
            .into_iter()
            .map(|(key, s)| {
                let mut values = vec![f64::NAN; index.len()];
                for (dt, v) in s.index.iter().zip(s.values) {
                    if let Ok(pos) = index.binary_search(dt) {
                        values[pos] = v;
                    }
                }
                if fill(&key) {
                    fill_nan(&mut values);
                }
                values.drain(..start);
                (key, values)
            })
            .collect();
        index.drain(..start);
        Self { index, columns }
    }

    pub fn column(&self, key: &K) -> Option<&[f64]>
    where
        K: PartialEq,
    {
        self.columns
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_slice())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum History {
    Series(Series),
    /// One asset, several fields.
    ByField(Frame<Field>),
    /// Several assets, one field.
    ByAsset(Frame<Asset>),
    /// Several assets and fields, one frame per asset.
    Panel(Vec<(Asset, Frame<Field>)>),
}

impl History {
    pub fn series(self) -> Option<Series> {
        match self {
            History::Series(s) => Some(s),
            _ => None,
        }
    }
}

/// The view of market data handed to algorithm callbacks for one tick.
pub struct BarData {
    portal: Arc<DataPortal>,
    frequency: DataFrequency,
    datetime: Timestamp,
    adjust_minutes: bool,
}

impl BarData {
    pub fn new(portal: Arc<DataPortal>, frequency: DataFrequency, datetime: Timestamp) -> Self {
        Self {
            portal,
            frequency,
            datetime,
            adjust_minutes: false,
        }
    }

    pub fn datetime(&self) -> Timestamp {
        self.datetime
    }

    pub fn set_datetime(&mut self, dt: Timestamp) {
        self.datetime = dt;
    }

    pub fn frequency(&self) -> DataFrequency {
        self.frequency
    }

    /// Runs `f` with lookups shifted back to the previous market minute.
    pub fn with_adjusted_minutes<R>(&mut self, f: impl FnOnce(&BarData) -> R) -> R {
        self.adjust_minutes = true;
        let out = f(self);
        self.adjust_minutes = false;
        out
    }

    pub fn is_adjusted(&self) -> bool {
        self.adjust_minutes
    }

    /// The instant lookups are made at.
    pub fn current_minute(&self) -> Result<Timestamp> {
        let calendar = self.portal.calendar();
        let mut dt = self.datetime;
        if self.adjust_minutes {
            dt = calendar.previous_minute(dt)?;
        }
        if self.frequency == DataFrequency::Daily {
            dt = calendar.session_label(dt).and_time(NaiveTime::MIN).and_utc();
        }
        Ok(dt)
    }

    pub fn current(
        &self,
        assets: impl Into<Selection<Asset>>,
        fields: impl Into<Selection<Field>>,
    ) -> Result<Current> {
        let (assets, fields) = (assets.into(), fields.into());
        let pairs: Vec<(Asset, Field)> = assets
            .items()
            .iter()
            .flat_map(|a| fields.items().iter().map(move |f| (a.clone(), *f)))
            .collect();
        let values = self
            .portal
            .get_spot_values(&pairs, self.current_minute()?, self.frequency)?;

        let width = fields.items().len();
        Ok(match (assets.is_one(), fields.is_one()) {
            (true, true) => Current::Scalar(values.first().copied().unwrap_or(SpotValue::MISSING)),
            (false, true) => Current::ByAsset(assets.items().iter().cloned().zip(values).collect()),
            (true, false) => Current::ByField(fields.items().iter().copied().zip(values).collect()),
            (false, false) => Current::Frame(
                assets
                    .items()
                    .iter()
                    .cloned()
                    .zip(values.chunks(width.max(1)))
                    .map(|(asset, row)| (asset, fields.items().iter().copied().zip(row.iter().copied()).collect()))
                    .collect(),
            ),
        })
    }

    /// Latest price, NaN when unknown.
    pub fn current_price(&self, asset: &Asset) -> Result<f64> {
        let value = self
            .portal
            .get_spot_value(asset, Field::Price, self.current_minute()?, self.frequency)?;
        Ok(value.as_f64())
    }

    pub fn history(
        &self,
        assets: impl Into<Selection<Asset>>,
        fields: impl Into<Selection<Field>>,
        bar_count: usize,
        frequency: DataFrequency,
    ) -> Result<History> {
        let (assets, fields) = (assets.into(), fields.into());
        if fields.items().contains(&Field::LastTraded) {
            return Err(Error::Config("last_traded has no history".into()));
        }
        let end = self.current_minute()?;
        // windows[field][asset]
        let mut windows = Vec::with_capacity(fields.items().len());
        for field in fields.items() {
            windows.push(self.portal.get_history_window(
                assets.items(),
                end,
                bar_count,
                frequency,
                *field,
                true,
            )?);
        }

        let is_price = |field: &Field| *field == Field::Price;
        let per_asset = |i: usize| -> Vec<(Field, Series)> {
            fields
                .items()
                .iter()
                .copied()
                .zip(windows.iter().map(|w| w.get(i).cloned().unwrap_or_default()))
                .collect()
        };
        Ok(match (assets.is_one(), fields.is_one()) {
            (true, true) => History::Series(windows.first().and_then(|w| w.first().cloned()).unwrap_or_default()),
            (true, false) => History::ByField(Frame::align(per_asset(0), bar_count, is_price)),
            (false, true) => History::ByAsset(Frame::align(
                assets
                    .items()
                    .iter()
                    .cloned()
                    .zip(windows.first().cloned().unwrap_or_default())
                    .collect(),
                bar_count,
                |_| fields.items().first() == Some(&Field::Price),
            )),
            (false, false) => History::Panel(
                assets
                    .items()
                    .iter()
                    .enumerate()
                    .map(|(i, asset)| (asset.clone(), Frame::align(per_asset(i), bar_count, is_price)))
                    .collect(),
            ),
        })
    }

    pub fn can_trade(&self, asset: &Asset) -> Result<bool> {
        let calendar = self.portal.calendar();
        let dt = self.current_minute()?;
        let session = calendar.session_label(dt);
        if !self.portal.backend().is_tradable(asset) || !asset.is_alive_for_session(session) {
            return Ok(false);
        }
        if self.frequency == DataFrequency::Daily {
            return Ok(true);
        }
        let check = if calendar.is_open_on_minute(dt) {
            dt
        } else {
            calendar.next_open(dt)?
        };
        Ok(calendar.is_open_on_minute(check))
    }

    pub fn can_trade_many(&self, assets: &[Asset]) -> Result<Vec<(Asset, bool)>> {
        assets
            .iter()
            .map(|a| Ok((a.clone(), self.can_trade(a)?)))
            .collect()
    }

    /// Traded before but nothing in the current period.
    pub fn is_stale(&self, asset: &Asset) -> Result<bool> {
        let dt = self.current_minute()?;
        if !asset.is_alive_for_session(self.portal.calendar().session_label(dt)) {
            return Ok(false);
        }
        let volume = self
            .portal
            .get_spot_value(asset, Field::Volume, dt, self.frequency)?
            .as_f64();
        if volume > 0. {
            return Ok(false);
        }
        let last_traded = self
            .portal
            .get_spot_value(asset, Field::LastTraded, dt, self.frequency)?;
        Ok(last_traded.as_time().is_some())
    }

    pub fn is_stale_many(&self, assets: &[Asset]) -> Result<Vec<(Asset, bool)>> {
        assets
            .iter()
            .map(|a| Ok((a.clone(), self.is_stale(a)?)))
            .collect()
    }
}
