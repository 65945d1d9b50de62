//! Calendar-aware scheduling of algorithm callbacks.
use chrono::{Datelike, Duration, NaiveDate, TimeDelta};

use crate::{DataFrequency, Timestamp, calendar::TradingCalendar, error::Result};

/// Which sessions a scheduled callback runs on. Offsets count trading sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DateRule {
    #[default]
    EveryDay,
    /// The n-th session of the week, 0 being the first.
    WeekStart(usize),
    /// The n-th session before the last of the week, 0 being the last.
    WeekEnd(usize),
    MonthStart(usize),
    MonthEnd(usize),
}

impl DateRule {
    pub fn matches(&self, session: NaiveDate, calendar: &dyn TradingCalendar) -> bool {
        let (start, end) = match self {
            DateRule::EveryDay => return true,
            DateRule::WeekStart(_) | DateRule::WeekEnd(_) => {
                let monday = session - Duration::days(session.weekday().num_days_from_monday() as i64);
                (monday, monday + Duration::days(6))
            }
            DateRule::MonthStart(_) | DateRule::MonthEnd(_) => {
                let first = session.with_day(1).unwrap_or(session);
                let next = first
                    .checked_add_months(chrono::Months::new(1))
                    .unwrap_or(first);
                (first, next.pred_opt().unwrap_or(next))
            }
        };
        let sessions = calendar.sessions_in_range(start, end);
        let index = match *self {
            DateRule::WeekStart(n) | DateRule::MonthStart(n) => Some(n),
            DateRule::WeekEnd(n) | DateRule::MonthEnd(n) => sessions.len().checked_sub(n + 1),
            DateRule::EveryDay => None,
        };
        index.and_then(|i| sessions.get(i)) == Some(&session)
    }
}

/// When within a session a scheduled callback runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeRule {
    #[default]
    EveryMinute,
    /// This long after the open.
    MarketOpen(TimeDelta),
    /// This long before the close.
    MarketClose(TimeDelta),
}

impl TimeRule {
    /// The default offsets used by `market_open()` / `market_close()` style helpers.
    pub fn market_open() -> Self {
        TimeRule::MarketOpen(TimeDelta::minutes(1))
    }

    pub fn market_close() -> Self {
        TimeRule::MarketClose(TimeDelta::minutes(1))
    }

    fn target(&self, session: NaiveDate, calendar: &dyn TradingCalendar) -> Result<Option<Timestamp>> {
        Ok(match self {
            TimeRule::EveryMinute => None,
            TimeRule::MarketOpen(offset) => Some(calendar.session_open(session)? + *offset),
            TimeRule::MarketClose(offset) => Some(calendar.session_close(session)? - *offset),
        })
    }
}

#[derive(Debug, Clone)]
pub struct ScheduledEvent {
    pub name: String,
    pub date_rule: DateRule,
    pub time_rule: TimeRule,
    /// Also run on early-close sessions.
    pub half_days: bool,
    last_fired: Option<NaiveDate>,
}

impl ScheduledEvent {
    pub fn new(name: impl Into<String>, date_rule: DateRule, time_rule: TimeRule, half_days: bool) -> Self {
        Self {
            name: name.into(),
            date_rule,
            time_rule,
            half_days,
            last_fired: None,
        }
    }

    fn should_fire(&mut self, dt: Timestamp, calendar: &dyn TradingCalendar, frequency: DataFrequency) -> Result<bool> {
        let session = calendar.session_label(dt);
        if !calendar.is_session(session)
            || (!self.half_days && calendar.is_half_day(session))
            || !self.date_rule.matches(session, calendar)
        {
            return Ok(false);
        }
        // daily bars have no intraday time to match
        if frequency == DataFrequency::Daily {
            return Ok(true);
        }
        let Some(target) = self.time_rule.target(session, calendar)? else {
            return Ok(true);
        };
        // the clock can skip minutes, so take the first bar at or after the target
        if self.last_fired == Some(session) || dt < target {
            return Ok(false);
        }
        self.last_fired = Some(session);
        Ok(true)
    }
}

/// A callback due on the current bar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Callback {
    HandleData,
    Scheduled(String),
}

/// The ordered list of callbacks run on each bar; `handle_data` always goes first.
#[derive(Debug, Clone, Default)]
pub struct EventManager {
    events: Vec<ScheduledEvent>,
}

impl EventManager {
    pub fn add(&mut self, event: ScheduledEvent) {
        tracing::debug!(
            "Scheduled {} with {:?} / {:?}",
            event.name,
            event.date_rule,
            event.time_rule
        );
        self.events.push(event);
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn due(
        &mut self,
        dt: Timestamp,
        calendar: &dyn TradingCalendar,
        frequency: DataFrequency,
    ) -> Result<Vec<Callback>> {
        let mut due = vec![Callback::HandleData];
        for event in &mut self.events {
            if event.should_fire(dt, calendar, frequency)? {
                due.push(Callback::Scheduled(event.name.clone()));
            }
        }
        Ok(due)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::NyseCalendar;
    use chrono::{TimeZone, Utc};

    fn d(m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, m, day).unwrap()
    }

    fn utc(m: u32, day: u32, h: u32, min: u32) -> Timestamp {
        Utc.with_ymd_and_hms(2024, m, day, h, min, 0).unwrap()
    }

    #[test]
    fn test_week_rules_skip_holidays() {
        let cal = NyseCalendar::new();
        // MLK day 2024-01-15 is a Monday
        assert!(DateRule::WeekStart(0).matches(d(1, 16), &cal));
        assert!(!DateRule::WeekStart(0).matches(d(1, 15), &cal));
        assert!(DateRule::WeekStart(1).matches(d(1, 17), &cal));
        assert!(DateRule::WeekEnd(0).matches(d(1, 19), &cal));
        assert!(DateRule::WeekEnd(1).matches(d(1, 18), &cal));
        // Good Friday 2024-03-29
        assert!(DateRule::WeekEnd(0).matches(d(3, 28), &cal));
    }

    #[test]
    fn test_month_rules() {
        let cal = NyseCalendar::new();
        // 2024-06-01 is a Saturday
        assert!(DateRule::MonthStart(0).matches(d(6, 3), &cal));
        assert!(DateRule::MonthEnd(0).matches(d(5, 31), &cal));
        assert!(DateRule::MonthEnd(2).matches(d(5, 29), &cal));
        assert!(!DateRule::MonthEnd(40).matches(d(5, 1), &cal));
        // December wraps into the next year
        assert!(DateRule::MonthEnd(0).matches(d(12, 31), &cal));
    }

    #[test]
    fn test_open_offset_fires_once_at_first_bar_after_target() {
        let cal = NyseCalendar::new();
        let mut events = EventManager::default();
        events.add(ScheduledEvent::new(
            "rebalance",
            DateRule::EveryDay,
            TimeRule::MarketOpen(TimeDelta::minutes(30)),
            true,
        ));
        let scheduled = Callback::Scheduled("rebalance".into());

        // open is 14:30Z in July
        let due = events.due(utc(7, 9, 14, 59), &cal, DataFrequency::Minute).unwrap();
        assert_eq!(due, vec![Callback::HandleData]);
        // the 15:00 bar was skipped
        let due = events.due(utc(7, 9, 15, 2), &cal, DataFrequency::Minute).unwrap();
        assert_eq!(due, vec![Callback::HandleData, scheduled.clone()]);
        let due = events.due(utc(7, 9, 15, 3), &cal, DataFrequency::Minute).unwrap();
        assert_eq!(due, vec![Callback::HandleData]);
        // next session fires again
        let due = events.due(utc(7, 10, 15, 0), &cal, DataFrequency::Minute).unwrap();
        assert_eq!(due, vec![Callback::HandleData, scheduled]);
    }

    #[test]
    fn test_close_offset_and_half_days() {
        let cal = NyseCalendar::new();
        let mut events = EventManager::default();
        events.add(ScheduledEvent::new("exit", DateRule::EveryDay, TimeRule::market_close(), false));
        // 2024-07-03 closes at 13:00 local
        assert_eq!(
            events.due(utc(7, 3, 16, 59), &cal, DataFrequency::Minute).unwrap(),
            vec![Callback::HandleData]
        );
        assert_eq!(
            events.due(utc(7, 5, 19, 59), &cal, DataFrequency::Minute).unwrap(),
            vec![Callback::HandleData, Callback::Scheduled("exit".into())]
        );
    }

    #[test]
    fn test_daily_mode_ignores_time_rules() {
        let cal = NyseCalendar::new();
        let mut events = EventManager::default();
        events.add(ScheduledEvent::new(
            "late",
            DateRule::EveryDay,
            TimeRule::MarketClose(TimeDelta::minutes(5)),
            true,
        ));
        let due = events.due(utc(7, 9, 0, 0), &cal, DataFrequency::Daily).unwrap();
        assert_eq!(due.len(), 2);
        assert_eq!(events.len(), 1);
    }
}
