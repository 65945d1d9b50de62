//! Wall-clock driven event source.
//!
//! [`RealtimeClock::poll`] is the whole state machine: given the current
//! wall-clock instant it returns the events due at that instant, or nothing
//! when the caller should sleep and poll again. [`RealtimeClock::into_stream`]
//! wraps it into an endless stream over a [`TimeSource`].
use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration as StdDuration,
};

use async_stream::try_stream;
use chrono::{NaiveDate, NaiveTime, TimeDelta, TimeZone};
use chrono_tz::Tz;
use futures::Stream;

use crate::{
    Timestamp,
    calendar::TradingCalendar,
    error::{Error, Result},
    utils::floor_minute,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClockEvent {
    SessionStart,
    BeforeTradingStart,
    Bar,
    MinuteEnd,
    SessionEnd,
}

pub type TimedEvent = (Timestamp, ClockEvent);

pub trait TimeSource: Send + Sync {
    fn now(&self) -> Timestamp;
    fn sleep(&self, duration: StdDuration) -> impl Future<Output = ()> + Send;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTime;

impl TimeSource for SystemTime {
    fn now(&self) -> Timestamp {
        chrono::Utc::now()
    }

    async fn sleep(&self, duration: StdDuration) {
        tokio::time::sleep(duration).await
    }
}

/// Simulated time that jumps forward by `step` on every sleep.
#[derive(Debug, Clone)]
pub struct FakeTime {
    now: Arc<Mutex<Timestamp>>,
    step: TimeDelta,
}

impl FakeTime {
    pub fn new(start: Timestamp, step: TimeDelta) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
            step,
        }
    }

    pub fn set(&self, dt: Timestamp) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = dt;
    }
}

impl TimeSource for FakeTime {
    fn now(&self) -> Timestamp {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn sleep(&self, _duration: StdDuration) {
        {
            let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
            *now += self.step;
        }
        tokio::task::yield_now().await
    }
}

#[derive(Debug, Default, Clone)]
struct ClockState {
    session: Option<NaiveDate>,
    bts_emitted: bool,
    session_end_emitted: bool,
    last_emit: Option<Timestamp>,
}

pub struct RealtimeClock {
    calendar: Arc<dyn TradingCalendar>,
    before_trading_start: (NaiveTime, Tz),
    minute_emission: bool,
    time_skew: TimeDelta,
    state: ClockState,
}

impl RealtimeClock {
    pub fn new(
        calendar: Arc<dyn TradingCalendar>,
        before_trading_start: (NaiveTime, Tz),
        minute_emission: bool,
        time_skew: TimeDelta,
    ) -> Self {
        Self {
            calendar,
            before_trading_start,
            minute_emission,
            time_skew,
            state: ClockState::default(),
        }
    }

    fn before_trading_start_at(&self, session: NaiveDate) -> Result<Timestamp> {
        let (time, tz) = self.before_trading_start;
        tz.from_local_datetime(&session.and_time(time))
            .single()
            .map(|dt| dt.with_timezone(&chrono::Utc))
            .ok_or_else(|| Error::Calendar(format!("before trading start {time} {tz} does not exist on {session}")))
    }

    fn emit_bar(&mut self, server_time: Timestamp, events: &mut Vec<TimedEvent>) {
        self.state.last_emit = Some(server_time);
        events.push((server_time, ClockEvent::Bar));
        if self.minute_emission {
            events.push((server_time, ClockEvent::MinuteEnd));
        }
    }

    /// Events due at wall-clock `now`. Empty means idle.
    pub fn poll(&mut self, now: Timestamp) -> Result<Vec<TimedEvent>> {
        let server_time = floor_minute(now + self.time_skew);
        let session = self.calendar.session_label(server_time);
        if !self.calendar.is_session(session) {
            return Ok(Vec::new());
        }

        let mut events = Vec::new();
        if self.state.session != Some(session) {
            let midnight = session.and_time(NaiveTime::MIN).and_utc();
            events.push((midnight, ClockEvent::SessionStart));
            self.state.session = Some(session);
            self.state.bts_emitted = false;
            self.state.session_end_emitted = false;
        }

        let bts = self.before_trading_start_at(session)?;
        let open = self.calendar.session_open(session)?;
        let close = self.calendar.session_close(session)?;

        if server_time >= bts && !self.state.bts_emitted {
            self.state.last_emit = Some(server_time);
            self.state.bts_emitted = true;
            events.push((server_time, ClockEvent::BeforeTradingStart));
        } else if server_time < open {
            // pre-market
        } else if server_time < close {
            let due = self
                .state
                .last_emit
                .is_none_or(|last| server_time - last >= TimeDelta::minutes(1));
            if due {
                self.emit_bar(server_time, &mut events);
            }
        } else if server_time == close && !self.state.session_end_emitted {
            self.state.session_end_emitted = true;
            self.emit_bar(server_time, &mut events);
            events.push((server_time, ClockEvent::SessionEnd));
        }
        Ok(events)
    }

    /// Polls forever, sleeping `poll_interval` whenever nothing is due.
    pub fn into_stream<T: TimeSource>(
        mut self,
        source: T,
        poll_interval: StdDuration,
    ) -> impl Stream<Item = Result<TimedEvent>> + Send {
        try_stream! {
            loop {
                let events = self.poll(source.now())?;
                if events.is_empty() {
                    source.sleep(poll_interval).await;
                    continue;
                }
                for event in events {
                    tracing::debug!("Clock event: {event:?}");
                    yield event;
                }
            }
        }
    }
}
