use thiserror::Error;

use crate::asset::Sid;

#[derive(Error, Debug)]
pub enum Error {
    // configuration
    #[error("unknown backend '{0}'")]
    UnknownBackend(String),
    #[error("unknown algorithm '{0}'")]
    UnknownAlgorithm(String),
    #[error("calendar error: {0}")]
    Calendar(String),
    #[error(
        "Checksum mismatch during state load: expected {expected}, found {found}. \
         The state file belongs to another algorithm."
    )]
    ChecksumMismatch { expected: String, found: String },
    #[error("unsupported state version {0}")]
    StateVersion(u32),
    #[error("configuration error: {0}")]
    Config(String),

    // ordering and controls
    #[error("order() can only be called after initialize() has finished")]
    OrderDuringInitialize,
    #[error("order() cannot be called from before_trading_start()")]
    OrderInBeforeTradingStart,
    #[error("passing both an order style and limit/stop prices is not supported")]
    UnsupportedOrderParameters,
    #[error("order for {amount} shares of {symbol} violates trading constraint {constraint}")]
    TradingControlViolation {
        symbol: String,
        amount: i64,
        constraint: String,
    },
    #[error("account violates constraint {constraint}")]
    AccountControlViolation { constraint: String },
    #[error("trading controls can only be registered before initialization")]
    RegisterTradingControlPostInit,
    #[error("account controls can only be registered before initialization")]
    RegisterAccountControlPostInit,
    #[error("cannot order {symbol}: the asset is delisted or not tradable")]
    CannotOrderDelistedAsset { symbol: String },
    #[error("no tradable price for {symbol}")]
    NoTradablePrice { symbol: String },
    #[error("order amount {0} exceeds the maximum of 1e11 shares")]
    OrderAmountOverflow(f64),

    // lookups
    #[error("Symbol '{0}' was not found")]
    SymbolNotFound(String),
    #[error("no assets found for sids: {0:?}")]
    SidsNotFound(Vec<Sid>),

    // backend
    #[error("http {status}: {message}")]
    Http { status: u16, message: String },
    #[error("backend error: {0}")]
    Backend(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Toml(#[from] toml::de::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn http_status(&self) -> Option<u16> {
        match self {
            Error::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}
