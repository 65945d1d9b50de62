pub mod algorithms;
pub mod asset;
pub mod backend;
pub mod calendar;
pub mod clock;
pub mod config;
pub mod context;
pub mod controls;
pub mod data;
pub mod error;
pub mod executor;
pub mod order;
pub mod portfolio;
pub mod reconcile;
pub mod schedule;
pub mod state;
pub mod trader;
pub mod utils;

use serde::{Deserialize, Serialize};

pub use error::{Error, Result};

pub type Timestamp = chrono::DateTime<chrono::Utc>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DataFrequency {
    Minute,
    Daily,
}
