//! Process-level wiring: state, backend streams, initialize, then the control loop.
use std::time::Duration;

use anyhow::Context as _;
use futures::Stream;

use crate::{
    DataFrequency,
    clock::{RealtimeClock, SystemTime, TimedEvent},
    config::Settings,
    context::TradingContext,
    error::Result,
    executor::{Algorithm, AlgorithmExecutor},
    state::StateStore,
};

/// How often open orders are re-read from the broker.
const RESYNC_INTERVAL: Duration = Duration::from_secs(60);

pub struct LiveTrader<A> {
    algo: A,
    ctx: TradingContext,
    store: StateStore,
    settings: Settings,
}

impl<A: Algorithm> LiveTrader<A> {
    pub fn new(algo: A, ctx: TradingContext, store: StateStore, settings: Settings) -> Self {
        Self {
            algo,
            ctx,
            store,
            settings,
        }
    }

    fn start(&mut self) -> anyhow::Result<()> {
        tracing::info!(
            "livetrader start running with algorithm = {} data-frequency = {:?}",
            self.ctx.name(),
            self.ctx.frequency()
        );
        if let Some(state) = self.store.load().context("failed to load algorithm state")? {
            self.ctx.restore(state)?;
        }
        self.ctx
            .backend()
            .initialize_data()
            .context("backend failed to initialize")?;

        self.algo
            .initialize(&mut self.ctx)
            .context("initialize failed")?;
        self.store
            .save(&self.ctx.persisted_state())
            .context("failed to save algorithm state")?;
        self.ctx.mark_initialized();
        Ok(())
    }

    fn spawn_resync(&self) -> tokio::task::JoinHandle<()> {
        let backend = self.ctx.backend().clone();
        ::utils::spawn_with_retry(
            "open order resync",
            move || {
                let backend = backend.clone();
                async move {
                    tokio::task::spawn_blocking(move || backend.sync_open_orders()).await??;
                    Ok::<_, anyhow::Error>(())
                }
            },
            RESYNC_INTERVAL,
        )
    }

    /// Initializes the algorithm then drives it with `events`.
    pub async fn run_with<S>(mut self, events: S) -> anyhow::Result<(A, TradingContext)>
    where
        S: Stream<Item = Result<TimedEvent>>,
    {
        self.start()?;
        let resync = self.spawn_resync();
        let executor = AlgorithmExecutor::new(self.algo, self.ctx, self.store, self.settings.continue_on_error);
        let result = executor.drive(events).await;
        resync.abort();
        result
    }

    /// Runs against the wall clock until a fatal error.
    pub async fn run(self) -> anyhow::Result<(A, TradingContext)> {
        let clock = RealtimeClock::new(
            self.ctx.portal().calendar().clone(),
            self.settings.before_trading_start()?,
            self.ctx.frequency() == DataFrequency::Minute,
            self.ctx.backend().time_skew(),
        );
        let poll_interval = self.settings.poll_interval();
        self.run_with(clock.into_stream(SystemTime, poll_interval)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        Timestamp,
        asset::Asset,
        backend::{Bar, SimBackend},
        calendar::NyseCalendar,
        clock::ClockEvent,
        data::{BarData, DataPortal, PortalOptions},
        error::Error,
        state::PersistedState,
    };
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;

    fn t(h: u32, m: u32) -> Timestamp {
        Utc.with_ymd_and_hms(2024, 3, 5, h, m, 0).unwrap()
    }

    #[derive(Default)]
    struct Counter {
        initialized: usize,
        bars: usize,
    }

    impl Algorithm for Counter {
        fn initialize(&mut self, ctx: &mut TradingContext) -> anyhow::Result<()> {
            self.initialized += 1;
            let runs = ctx.var::<u32>("runs")?.unwrap_or(0);
            ctx.set_var("runs", &(runs + 1))?;
            Ok(())
        }

        fn handle_data(&mut self, _ctx: &mut TradingContext, _data: &BarData) -> anyhow::Result<()> {
            self.bars += 1;
            Ok(())
        }
    }

    fn create_test_context(name: &str) -> TradingContext {
        let backend = Arc::new(
            SimBackend::builder()
                .asset(Asset::new(1, "AAPL"))
                .bars(
                    1,
                    vec![Bar {
                        dt: t(14, 30),
                        open: 1.,
                        high: 1.,
                        low: 1.,
                        close: 1.,
                        volume: 1.,
                    }],
                )
                .build(),
        );
        let portal = DataPortal::new(backend, Arc::new(NyseCalendar::new()), PortalOptions::default()).unwrap();
        TradingContext::new(name, Arc::new(portal), DataFrequency::Minute, true)
    }

    fn bars() -> futures::stream::Iter<std::vec::IntoIter<Result<TimedEvent>>> {
        futures::stream::iter(vec![Ok((t(14, 30), ClockEvent::Bar)), Ok((t(14, 31), ClockEvent::Bar))])
    }

    #[tokio::test]
    async fn test_resumes_saved_state() {
        let store = StateStore::memory();
        let trader = LiveTrader::new(Counter::default(), create_test_context("counter"), store.clone(), Settings::default());
        let (algo, ctx) = trader.run_with(bars()).await.unwrap();
        assert_eq!(algo.initialized, 1);
        assert_eq!(algo.bars, 2);
        assert!(ctx.is_initialized());

        let trader = LiveTrader::new(Counter::default(), create_test_context("counter"), store.clone(), Settings::default());
        let (_, ctx) = trader.run_with(bars()).await.unwrap();
        assert_eq!(ctx.var::<u32>("runs").unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_foreign_state_aborts_before_initialize() {
        let store = StateStore::memory();
        store.save(&PersistedState::new("someone_else")).unwrap();
        let trader = LiveTrader::new(Counter::default(), create_test_context("counter"), store, Settings::default());
        let err = trader.run_with(bars()).await.err().unwrap();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::ChecksumMismatch { .. })));
    }
}
