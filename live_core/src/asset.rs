use std::{
    cmp::Ordering,
    hash::{Hash, Hasher},
    sync::Arc,
};

use chrono::NaiveDate;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use smartstring::alias::String;

use crate::{
    backend::Backend,
    error::{Error, Result},
};

pub type Sid = u64;

/// An equity as known to the backend. Identity is the sid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Asset {
    pub sid: Sid,
    pub symbol: String,
    #[serde(default = "default_exchange")]
    pub exchange: String,
    #[serde(default = "default_tradable")]
    pub tradable: bool,
    #[serde(default)]
    pub start_date: Option<NaiveDate>,
    #[serde(default)]
    pub end_date: Option<NaiveDate>,
    #[serde(default)]
    pub auto_close_date: Option<NaiveDate>,
}

fn default_exchange() -> String {
    "NYSE".into()
}

fn default_tradable() -> bool {
    true
}

impl Asset {
    pub fn new(sid: Sid, symbol: &str) -> Self {
        Self {
            sid,
            symbol: symbol.to_uppercase().into(),
            exchange: default_exchange(),
            tradable: true,
            start_date: None,
            end_date: None,
            auto_close_date: None,
        }
    }

    pub fn is_alive_for_session(&self, session: NaiveDate) -> bool {
        self.start_date.is_none_or(|start| start <= session)
            && self.end_date.is_none_or(|end| session <= end)
    }

    /// The last day orders are accepted: the earlier of end date and auto close date.
    pub fn last_order_date(&self) -> Option<NaiveDate> {
        match (self.end_date, self.auto_close_date) {
            (Some(end), Some(close)) => Some(end.min(close)),
            (end, close) => end.or(close),
        }
    }
}

impl PartialEq for Asset {
    fn eq(&self, other: &Self) -> bool {
        self.sid == other.sid
    }
}

impl Eq for Asset {}

impl Hash for Asset {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.sid.hash(state);
    }
}

impl PartialOrd for Asset {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Asset {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sid.cmp(&other.sid)
    }
}

/// Caches the backend's equity universe and resolves symbols and sids.
pub struct AssetFinder {
    backend: Arc<dyn Backend>,
    by_sid: FxHashMap<Sid, Asset>,
    by_symbol: FxHashMap<String, Sid>,
}

impl AssetFinder {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            by_sid: FxHashMap::default(),
            by_symbol: FxHashMap::default(),
        }
    }

    fn ensure_loaded(&mut self) -> Result<()> {
        if !self.by_sid.is_empty() {
            return Ok(());
        }
        let equities = self.backend.get_equities()?;
        tracing::debug!("Loaded {} equities", equities.len());
        for asset in equities {
            self.by_symbol.insert(asset.symbol.to_uppercase().into(), asset.sid);
            self.by_sid.insert(asset.sid, asset);
        }
        Ok(())
    }

    /// Drops the cached universe; the next lookup refetches it.
    pub fn refresh(&mut self) {
        self.by_sid.clear();
        self.by_symbol.clear();
    }

    pub fn lookup_symbol(&mut self, symbol: &str) -> Result<Asset> {
        self.ensure_loaded()?;
        let key: String = symbol.to_uppercase().into();
        self.by_symbol
            .get(&key)
            .and_then(|sid| self.by_sid.get(sid))
            .cloned()
            .ok_or_else(|| Error::SymbolNotFound(symbol.to_string()))
    }

    /// Resolves every sid or fails listing all the missing ones.
    pub fn retrieve_all(&mut self, sids: &[Sid]) -> Result<Vec<Asset>> {
        self.ensure_loaded()?;
        let missing: Vec<Sid> = sids
            .iter()
            .copied()
            .filter(|sid| !self.by_sid.contains_key(sid))
            .collect();
        if !missing.is_empty() {
            return Err(Error::SidsNotFound(missing));
        }
        Ok(sids.iter().filter_map(|sid| self.by_sid.get(sid).cloned()).collect())
    }

    pub fn retrieve_asset(&mut self, sid: Sid) -> Result<Asset> {
        let mut assets = self.retrieve_all(&[sid])?;
        assets.pop().ok_or(Error::SidsNotFound(vec![sid]))
    }

    pub fn all(&mut self) -> Result<Vec<Asset>> {
        self.ensure_loaded()?;
        let mut assets: Vec<Asset> = self.by_sid.values().cloned().collect();
        assets.sort();
        Ok(assets)
    }
}
