//! The control loop binding clock events to algorithm callbacks.
use std::{pin::pin, time::Duration};

use anyhow::Context as _;
use futures::{Stream, StreamExt};

use crate::{
    Timestamp,
    clock::{ClockEvent, RealtimeClock, SystemTime, TimedEvent},
    context::TradingContext,
    data::BarData,
    error::Result,
    schedule::Callback,
    state::StateStore,
};

/// User trading logic. Every callback gets the context explicitly.
pub trait Algorithm: Send {
    fn initialize(&mut self, ctx: &mut TradingContext) -> anyhow::Result<()>;

    fn handle_data(&mut self, _ctx: &mut TradingContext, _data: &BarData) -> anyhow::Result<()> {
        Ok(())
    }

    fn before_trading_start(&mut self, _ctx: &mut TradingContext, _data: &BarData) -> anyhow::Result<()> {
        Ok(())
    }

    /// Runs the function registered with `schedule_function` under `name`.
    fn on_scheduled(&mut self, name: &str, _ctx: &mut TradingContext, _data: &BarData) -> anyhow::Result<()> {
        tracing::warn!("No handler for scheduled function {name}");
        Ok(())
    }
}

impl<A: Algorithm + ?Sized> Algorithm for Box<A> {
    fn initialize(&mut self, ctx: &mut TradingContext) -> anyhow::Result<()> {
        (**self).initialize(ctx)
    }

    fn handle_data(&mut self, ctx: &mut TradingContext, data: &BarData) -> anyhow::Result<()> {
        (**self).handle_data(ctx, data)
    }

    fn before_trading_start(&mut self, ctx: &mut TradingContext, data: &BarData) -> anyhow::Result<()> {
        (**self).before_trading_start(ctx, data)
    }

    fn on_scheduled(&mut self, name: &str, ctx: &mut TradingContext, data: &BarData) -> anyhow::Result<()> {
        (**self).on_scheduled(name, ctx, data)
    }
}

pub struct AlgorithmExecutor<A> {
    algo: A,
    ctx: TradingContext,
    data: BarData,
    store: StateStore,
    continue_on_error: bool,
}

impl<A: Algorithm> AlgorithmExecutor<A> {
    pub fn new(algo: A, ctx: TradingContext, store: StateStore, continue_on_error: bool) -> Self {
        let data = ctx.current_data();
        Self {
            algo,
            ctx,
            data,
            store,
            continue_on_error,
        }
    }

    pub fn context(&self) -> &TradingContext {
        &self.ctx
    }

    /// Consumes clock events until the stream ends or a fatal error occurs.
    ///
    /// The executor is consumed either way so the algorithm and the data
    /// portal are released when the loop exits.
    pub async fn drive<S>(mut self, events: S) -> anyhow::Result<(A, TradingContext)>
    where
        S: Stream<Item = Result<TimedEvent>>,
    {
        let mut events = pin!(events);
        while let Some(event) = events.next().await {
            let (dt, event) = event.context("clock failed")?;
            self.on_event(dt, event)?;
        }
        Ok((self.algo, self.ctx))
    }

    /// Runs forever against the wall clock.
    pub async fn run(self, clock: RealtimeClock, poll_interval: Duration) -> anyhow::Result<(A, TradingContext)> {
        self.drive(clock.into_stream(SystemTime, poll_interval)).await
    }

    fn on_event(&mut self, dt: Timestamp, event: ClockEvent) -> anyhow::Result<()> {
        match event {
            ClockEvent::SessionStart => {
                tracing::info!("Session {} started", dt.date_naive());
                self.ctx.on_dt_changed(dt);
                self.ctx.on_session_start();
                self.data.set_datetime(dt);
            }
            ClockEvent::BeforeTradingStart => self.before_trading_start(dt)?,
            ClockEvent::Bar => self.every_bar(dt)?,
            ClockEvent::MinuteEnd => {}
            ClockEvent::SessionEnd => tracing::info!("Session ended at {dt}"),
        }
        Ok(())
    }

    /// Failures here abort the run.
    fn before_trading_start(&mut self, dt: Timestamp) -> anyhow::Result<()> {
        tracing::info!("Before trading start at {dt}");
        self.ctx.on_dt_changed(dt);
        self.data.set_datetime(dt);

        let Self { algo, ctx, data, .. } = self;
        ctx.set_in_before_trading_start(true);
        let result = data.with_adjusted_minutes(|data| algo.before_trading_start(ctx, data));
        ctx.set_in_before_trading_start(false);
        result.context("before_trading_start failed")?;

        self.save_state()?;
        Ok(())
    }

    fn every_bar(&mut self, dt: Timestamp) -> anyhow::Result<()> {
        let portal = self.ctx.portal().clone();
        portal.cache_clear();
        self.ctx.on_dt_changed(dt);
        self.data.set_datetime(dt);

        let due = self
            .ctx
            .events_mut()
            .due(dt, portal.calendar().as_ref(), self.data.frequency())?;
        for callback in due {
            let result = match &callback {
                Callback::HandleData => self.algo.handle_data(&mut self.ctx, &self.data),
                Callback::Scheduled(name) => self.algo.on_scheduled(name, &mut self.ctx, &self.data),
            };
            self.isolate(result.with_context(|| format!("{callback:?} failed at {dt}")))?;
        }
        let controls = self.ctx.validate_account_controls().map_err(anyhow::Error::from);
        self.isolate(controls)?;

        self.ctx.invalidate_caches();
        let saved = self.save_state();
        self.isolate(saved)
    }

    /// Logs and swallows a tick error when continuing on error.
    fn isolate(&self, result: anyhow::Result<()>) -> anyhow::Result<()> {
        match result {
            Err(e) if self.continue_on_error => {
                tracing::error!("{e:?}");
                tracing::warn!("Continuing execution");
                Ok(())
            }
            other => other,
        }
    }

    fn save_state(&self) -> anyhow::Result<()> {
        self.store
            .save(&self.ctx.persisted_state())
            .context("failed to save algorithm state")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        DataFrequency,
        asset::Asset,
        backend::{Bar, FillMode, SimBackend},
        calendar::NyseCalendar,
        context::OrderParams,
        data::{DataPortal, PortalOptions},
        schedule::{DateRule, TimeRule},
    };
    use chrono::{TimeDelta, TimeZone, Utc};
    use std::sync::Arc;

    fn t(h: u32, m: u32) -> Timestamp {
        Utc.with_ymd_and_hms(2024, 3, 5, h, m, 0).unwrap()
    }

    #[derive(Default)]
    struct Recorder {
        calls: Vec<String>,
        fail_handle_data: bool,
        fail_bts: bool,
    }

    impl Algorithm for Recorder {
        fn initialize(&mut self, ctx: &mut TradingContext) -> anyhow::Result<()> {
            ctx.schedule_function("open", DateRule::EveryDay, TimeRule::MarketOpen(TimeDelta::minutes(1)), true);
            Ok(())
        }

        fn handle_data(&mut self, ctx: &mut TradingContext, data: &BarData) -> anyhow::Result<()> {
            self.calls.push(format!("bar {}", data.datetime().format("%H:%M")));
            ctx.record("bars", self.calls.len() as f64);
            if self.fail_handle_data {
                anyhow::bail!("boom");
            }
            Ok(())
        }

        fn before_trading_start(&mut self, ctx: &mut TradingContext, data: &BarData) -> anyhow::Result<()> {
            self.calls.push(format!("bts adjusted={}", data.is_adjusted()));
            if self.fail_bts {
                anyhow::bail!("setup failed");
            }
            // ordering is refused here
            assert!(ctx.order(&Asset::new(1, "AAPL"), 1., OrderParams::market()).is_err());
            Ok(())
        }

        fn on_scheduled(&mut self, name: &str, _ctx: &mut TradingContext, _data: &BarData) -> anyhow::Result<()> {
            self.calls.push(format!("scheduled {name}"));
            Ok(())
        }
    }

    fn create_test_executor(algo: Recorder, continue_on_error: bool) -> (AlgorithmExecutor<Recorder>, StateStore) {
        let backend = Arc::new(
            SimBackend::builder()
                .asset(Asset::new(1, "AAPL"))
                .fill_mode(FillMode::Manual)
                .bars(
                    1,
                    vec![Bar {
                        dt: t(14, 30),
                        open: 10.,
                        high: 10.,
                        low: 10.,
                        close: 10.,
                        volume: 1.,
                    }],
                )
                .build(),
        );
        let portal = DataPortal::new(backend, Arc::new(NyseCalendar::new()), PortalOptions::default()).unwrap();
        let mut algo = algo;
        let mut ctx = TradingContext::new("recorder", Arc::new(portal), DataFrequency::Minute, true);
        algo.initialize(&mut ctx).unwrap();
        ctx.mark_initialized();
        let store = StateStore::memory();
        (AlgorithmExecutor::new(algo, ctx, store.clone(), continue_on_error), store)
    }

    fn session_events() -> Vec<Result<TimedEvent>> {
        vec![
            Ok((t(0, 0), ClockEvent::SessionStart)),
            Ok((t(13, 45), ClockEvent::BeforeTradingStart)),
            Ok((t(14, 30), ClockEvent::Bar)),
            Ok((t(14, 30), ClockEvent::MinuteEnd)),
            Ok((t(14, 31), ClockEvent::Bar)),
            Ok((t(14, 31), ClockEvent::MinuteEnd)),
        ]
    }

    #[tokio::test]
    async fn test_callbacks_in_order() {
        let (executor, store) = create_test_executor(Recorder::default(), true);
        let (algo, ctx) = executor
            .drive(futures::stream::iter(session_events()))
            .await
            .unwrap();
        assert_eq!(
            algo.calls,
            vec!["bts adjusted=true", "bar 14:30", "bar 14:31", "scheduled open"]
        );
        assert_eq!(ctx.datetime(), t(14, 31));
        let saved = store.load().unwrap().unwrap();
        assert_eq!(saved.recorded["bars"], 3.);
    }

    #[tokio::test]
    async fn test_tick_errors_are_isolated() {
        let algo = Recorder {
            fail_handle_data: true,
            ..Recorder::default()
        };
        let (executor, _) = create_test_executor(algo, true);
        let (algo, _) = executor
            .drive(futures::stream::iter(session_events()))
            .await
            .unwrap();
        // the scheduled callback still ran after handle_data failed
        assert!(algo.calls.contains(&"scheduled open".to_string()));

        let algo = Recorder {
            fail_handle_data: true,
            ..Recorder::default()
        };
        let (executor, _) = create_test_executor(algo, false);
        let err = executor
            .drive(futures::stream::iter(session_events()))
            .await
            .err().unwrap();
        assert!(format!("{err:?}").contains("boom"));
    }

    #[tokio::test]
    async fn test_before_trading_start_failure_is_fatal() {
        let algo = Recorder {
            fail_bts: true,
            ..Recorder::default()
        };
        let (executor, store) = create_test_executor(algo, true);
        let err = executor
            .drive(futures::stream::iter(session_events()))
            .await
            .err().unwrap();
        assert!(format!("{err:?}").contains("setup failed"));
        assert!(store.load().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_clock_error_stops_the_loop() {
        let (executor, _) = create_test_executor(Recorder::default(), true);
        let events = vec![
            Ok((t(14, 30), ClockEvent::Bar)),
            Err(crate::error::Error::Calendar("no session".into())),
            Ok((t(14, 31), ClockEvent::Bar)),
        ];
        assert!(executor.drive(futures::stream::iter(events)).await.is_err());
    }
}
