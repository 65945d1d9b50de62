use crate::{
    asset::Asset,
    backend::Field,
    context::{OrderParams, TradingContext},
    data::BarData,
    executor::Algorithm,
};

/// Goes long `shares` when the short moving average crosses above the long one
/// and flattens when it crosses back.
#[derive(Debug, Clone)]
pub struct DualMovingAverage {
    symbol: String,
    short_window: usize,
    long_window: usize,
    shares: f64,
    asset: Option<Asset>,
}

impl Default for DualMovingAverage {
    fn default() -> Self {
        Self::new("AAPL", 100, 300, 100.)
    }
}

impl DualMovingAverage {
    pub fn new(symbol: &str, short_window: usize, long_window: usize, shares: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            short_window,
            long_window,
            shares,
            asset: None,
        }
    }

    fn mavg(&self, data: &BarData, asset: &Asset, window: usize) -> anyhow::Result<f64> {
        let history = data.history(asset, Field::Price, window, data.frequency())?;
        Ok(history.series().map_or(f64::NAN, |s| s.mean()))
    }
}

impl Algorithm for DualMovingAverage {
    fn initialize(&mut self, ctx: &mut TradingContext) -> anyhow::Result<()> {
        self.asset = Some(ctx.symbol(&self.symbol)?);
        if ctx.var::<bool>("invested")?.is_none() {
            ctx.set_var("invested", &false)?;
        }
        Ok(())
    }

    fn handle_data(&mut self, ctx: &mut TradingContext, data: &BarData) -> anyhow::Result<()> {
        let Some(asset) = self.asset.clone() else {
            anyhow::bail!("handle_data called before initialize");
        };
        let short_mavg = self.mavg(data, &asset, self.short_window)?;
        let long_mavg = self.mavg(data, &asset, self.long_window)?;
        if short_mavg.is_nan() || long_mavg.is_nan() {
            tracing::debug!("Not enough history for {}", asset.symbol);
            return Ok(());
        }

        let invested = ctx.var::<bool>("invested")?.unwrap_or(false);
        if short_mavg > long_mavg && !invested {
            ctx.order_target(&asset, self.shares, OrderParams::market())?;
            ctx.set_var("invested", &true)?;
        } else if short_mavg < long_mavg && invested {
            ctx.order_target(&asset, 0., OrderParams::market())?;
            ctx.set_var("invested", &false)?;
        }

        ctx.record("short_mavg", short_mavg);
        ctx.record("long_mavg", long_mavg);
        Ok(())
    }
}
