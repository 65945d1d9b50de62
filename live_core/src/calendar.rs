//! Exchange trading calendars.
//!
//! Sessions are labelled by their local exchange date. Open and close
//! instants are returned in UTC.
use chrono::{Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Utc, Weekday};
use chrono_tz::{America::New_York, Tz};
use rustc_hash::FxHashSet;

use crate::{
    Timestamp,
    error::{Error, Result},
};

/// Give up looking for an adjacent session after this many days.
const MAX_SESSION_GAP: i64 = 30;

pub trait TradingCalendar: Send + Sync {
    fn name(&self) -> &str;
    fn tz(&self) -> Tz;
    fn is_session(&self, date: NaiveDate) -> bool;
    fn is_half_day(&self, date: NaiveDate) -> bool;
    /// Local open time of a session.
    fn open_time(&self, date: NaiveDate) -> NaiveTime;
    /// Local close time of a session.
    fn close_time(&self, date: NaiveDate) -> NaiveTime;

    fn localize(&self, date: NaiveDate, time: NaiveTime) -> Result<Timestamp> {
        self.tz()
            .from_local_datetime(&date.and_time(time))
            .single()
            .map(|dt| dt.with_timezone(&Utc))
            .ok_or_else(|| Error::Calendar(format!("{date} {time} is ambiguous in {}", self.tz())))
    }

    fn session_label(&self, dt: Timestamp) -> NaiveDate {
        dt.with_timezone(&self.tz()).date_naive()
    }

    fn session_open(&self, date: NaiveDate) -> Result<Timestamp> {
        if !self.is_session(date) {
            return Err(Error::Calendar(format!("{date} is not a {} session", self.name())));
        }
        self.localize(date, self.open_time(date))
    }

    fn session_close(&self, date: NaiveDate) -> Result<Timestamp> {
        if !self.is_session(date) {
            return Err(Error::Calendar(format!("{date} is not a {} session", self.name())));
        }
        self.localize(date, self.close_time(date))
    }

    fn next_session(&self, date: NaiveDate) -> Result<NaiveDate> {
        (1..=MAX_SESSION_GAP)
            .map(|n| date + Duration::days(n))
            .find(|d| self.is_session(*d))
            .ok_or_else(|| Error::Calendar(format!("no session within {MAX_SESSION_GAP} days after {date}")))
    }

    fn previous_session(&self, date: NaiveDate) -> Result<NaiveDate> {
        (1..=MAX_SESSION_GAP)
            .map(|n| date - Duration::days(n))
            .find(|d| self.is_session(*d))
            .ok_or_else(|| Error::Calendar(format!("no session within {MAX_SESSION_GAP} days before {date}")))
    }

    fn is_open_on_minute(&self, dt: Timestamp) -> bool {
        let date = self.session_label(dt);
        match (self.session_open(date), self.session_close(date)) {
            (Ok(open), Ok(close)) => open <= dt && dt <= close,
            _ => false,
        }
    }

    /// The last market minute strictly before `dt`.
    fn previous_minute(&self, dt: Timestamp) -> Result<Timestamp> {
        let date = self.session_label(dt);
        if self.is_session(date) {
            let open = self.session_open(date)?;
            if dt > open {
                let close = self.session_close(date)?;
                return Ok((dt - Duration::minutes(1)).min(close));
            }
        }
        self.session_close(self.previous_session(date)?)
    }

    /// The first session open strictly after `dt`.
    fn next_open(&self, dt: Timestamp) -> Result<Timestamp> {
        let date = self.session_label(dt);
        if self.is_session(date) {
            let open = self.session_open(date)?;
            if open > dt {
                return Ok(open);
            }
        }
        self.session_open(self.next_session(date)?)
    }

    fn sessions_in_range(&self, start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
        start
            .iter_days()
            .take_while(|d| *d <= end)
            .filter(|d| self.is_session(*d))
            .collect()
    }
}

/// New York Stock Exchange: 09:30 to 16:00 America/New_York, 13:00 on early closes.
#[derive(Debug, Clone, Default)]
pub struct NyseCalendar {
    closures: FxHashSet<NaiveDate>,
}

impl NyseCalendar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds unscheduled closures (national days of mourning, weather).
    pub fn with_closures(mut self, dates: impl IntoIterator<Item = NaiveDate>) -> Self {
        self.closures.extend(dates);
        self
    }

    fn is_holiday(&self, date: NaiveDate) -> bool {
        self.closures.contains(&date) || nyse_holidays(date.year()).contains(&date)
    }
}

impl TradingCalendar for NyseCalendar {
    fn name(&self) -> &str {
        "NYSE"
    }

    fn tz(&self) -> Tz {
        New_York
    }

    fn is_session(&self, date: NaiveDate) -> bool {
        !is_weekend(date) && !self.is_holiday(date)
    }

    fn is_half_day(&self, date: NaiveDate) -> bool {
        if !self.is_session(date) {
            return false;
        }
        let (year, month, day) = (date.year(), date.month(), date.day());
        let mon_to_thu = matches!(
            date.weekday(),
            Weekday::Mon | Weekday::Tue | Weekday::Wed | Weekday::Thu
        );
        (month == 7 && day == 3 && mon_to_thu)
            || (month == 12 && day == 24 && mon_to_thu)
            || date == thanksgiving(year) + Duration::days(1)
    }

    fn open_time(&self, _date: NaiveDate) -> NaiveTime {
        NaiveTime::from_hms_opt(9, 30, 0).unwrap_or_default()
    }

    fn close_time(&self, date: NaiveDate) -> NaiveTime {
        let hour = if self.is_half_day(date) { 13 } else { 16 };
        NaiveTime::from_hms_opt(hour, 0, 0).unwrap_or_default()
    }
}

fn is_weekend(date: NaiveDate) -> bool {
    matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
}

fn ymd(year: i32, month: u32, day: u32) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(year, month, day)
}

/// Saturday holidays move to Friday, Sunday holidays to Monday.
fn observed(date: NaiveDate) -> NaiveDate {
    match date.weekday() {
        Weekday::Sat => date - Duration::days(1),
        Weekday::Sun => date + Duration::days(1),
        _ => date,
    }
}

fn nth_weekday(year: i32, month: u32, weekday: Weekday, n: u8) -> Option<NaiveDate> {
    NaiveDate::from_weekday_of_month_opt(year, month, weekday, n)
}

fn last_weekday(year: i32, month: u32, weekday: Weekday) -> Option<NaiveDate> {
    let first_next = if month == 12 {
        ymd(year + 1, 1, 1)
    } else {
        ymd(year, month + 1, 1)
    }?;
    (1..=7)
        .map(|n| first_next - Duration::days(n))
        .find(|d| d.weekday() == weekday)
}

fn thanksgiving(year: i32) -> NaiveDate {
    nth_weekday(year, 11, Weekday::Thu, 4).unwrap_or(NaiveDate::MIN)
}

/// Gregorian Easter Sunday (anonymous algorithm).
fn easter(year: i32) -> Option<NaiveDate> {
    let a = year % 19;
    let b = year / 100;
    let c = year % 100;
    let d = b / 4;
    let e = b % 4;
    let f = (b + 8) / 25;
    let g = (b - f + 1) / 3;
    let h = (19 * a + b - d - g + 15) % 30;
    let i = c / 4;
    let k = c % 4;
    let l = (32 + 2 * e + 2 * i - h - k) % 7;
    let m = (a + 11 * h + 22 * l) / 451;
    let month = (h + l - 7 * m + 114) / 31;
    let day = (h + l - 7 * m + 114) % 31 + 1;
    ymd(year, month as u32, day as u32)
}

fn nyse_holidays(year: i32) -> Vec<NaiveDate> {
    let mut days = Vec::with_capacity(10);
    // a Saturday new year is not observed on the prior Friday
    if let Some(new_year) = ymd(year, 1, 1) {
        match new_year.weekday() {
            Weekday::Sat => {}
            _ => days.push(observed(new_year)),
        }
    }
    days.extend(nth_weekday(year, 1, Weekday::Mon, 3));
    days.extend(nth_weekday(year, 2, Weekday::Mon, 3));
    days.extend(easter(year).map(|d| d - Duration::days(2)));
    days.extend(last_weekday(year, 5, Weekday::Mon));
    if year >= 2022 {
        days.extend(ymd(year, 6, 19).map(observed));
    }
    days.extend(ymd(year, 7, 4).map(observed));
    days.extend(nth_weekday(year, 9, Weekday::Mon, 1));
    days.push(thanksgiving(year));
    days.extend(ymd(year, 12, 25).map(observed));
    days
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn utc(y: i32, m: u32, day: u32, h: u32, min: u32) -> Timestamp {
        Utc.with_ymd_and_hms(y, m, day, h, min, 0).unwrap()
    }

    #[test]
    fn test_holidays_2024() {
        let cal = NyseCalendar::new();
        for holiday in [
            d(2024, 1, 1),
            d(2024, 1, 15),
            d(2024, 2, 19),
            d(2024, 3, 29),
            d(2024, 5, 27),
            d(2024, 6, 19),
            d(2024, 7, 4),
            d(2024, 9, 2),
            d(2024, 11, 28),
            d(2024, 12, 25),
        ] {
            assert!(!cal.is_session(holiday), "{holiday} should be closed");
        }
        assert!(cal.is_session(d(2024, 3, 5)));
        assert!(!cal.is_session(d(2024, 3, 9)));
    }

    #[test]
    fn test_observance() {
        let cal = NyseCalendar::new();
        // Christmas 2021 fell on a Saturday
        assert!(!cal.is_session(d(2021, 12, 24)));
        // New Year 2022 fell on a Saturday and was not observed
        assert!(cal.is_session(d(2021, 12, 31)));
        // New Year 2023 fell on a Sunday
        assert!(!cal.is_session(d(2023, 1, 2)));
        // Juneteenth only from 2022
        assert!(cal.is_session(d(2021, 6, 18)));
        assert_eq!(easter(2025), Some(d(2025, 4, 20)));
    }

    #[test]
    fn test_open_close_across_dst() {
        let cal = NyseCalendar::new();
        assert_eq!(cal.session_open(d(2024, 3, 5)).unwrap(), utc(2024, 3, 5, 14, 30));
        assert_eq!(cal.session_close(d(2024, 3, 5)).unwrap(), utc(2024, 3, 5, 21, 0));
        assert_eq!(cal.session_open(d(2024, 7, 1)).unwrap(), utc(2024, 7, 1, 13, 30));
        assert!(cal.session_open(d(2024, 7, 4)).is_err());
    }

    #[test]
    fn test_early_closes() {
        let cal = NyseCalendar::new();
        assert!(cal.is_half_day(d(2024, 7, 3)));
        assert!(cal.is_half_day(d(2024, 11, 29)));
        assert!(cal.is_half_day(d(2024, 12, 24)));
        assert!(!cal.is_half_day(d(2024, 12, 23)));
        assert_eq!(cal.session_close(d(2024, 11, 29)).unwrap(), utc(2024, 11, 29, 18, 0));
    }

    #[test]
    fn test_previous_minute_and_next_open() {
        let cal = NyseCalendar::new();
        // Tuesday 2024-03-05 08:45 ET -> Monday's close
        let bts = utc(2024, 3, 5, 13, 45);
        assert_eq!(cal.previous_minute(bts).unwrap(), utc(2024, 3, 4, 21, 0));
        assert_eq!(cal.next_open(bts).unwrap(), utc(2024, 3, 5, 14, 30));

        let mid = utc(2024, 3, 5, 15, 0);
        assert_eq!(cal.previous_minute(mid).unwrap(), utc(2024, 3, 5, 14, 59));
        assert!(cal.is_open_on_minute(mid));
        assert_eq!(cal.next_open(mid).unwrap(), utc(2024, 3, 6, 14, 30));

        // Monday after a weekend
        let monday_pre = utc(2024, 3, 11, 12, 0);
        assert_eq!(cal.previous_minute(monday_pre).unwrap(), utc(2024, 3, 8, 21, 0));
    }

    #[test]
    fn test_session_navigation() {
        let cal = NyseCalendar::new().with_closures([d(2024, 3, 6)]);
        assert_eq!(cal.next_session(d(2024, 3, 5)).unwrap(), d(2024, 3, 7));
        assert_eq!(cal.previous_session(d(2024, 3, 11)).unwrap(), d(2024, 3, 8));
        assert_eq!(cal.sessions_in_range(d(2024, 3, 4), d(2024, 3, 10)).len(), 4);
        assert_eq!(cal.session_label(utc(2024, 3, 6, 3, 0)), d(2024, 3, 5));
    }

    #[test]
    fn test_missing_sessions_are_calendar_errors() {
        let start = d(2024, 1, 1);
        let cal = NyseCalendar::new().with_closures(start.iter_days().take(60));
        assert!(matches!(cal.next_session(start), Err(Error::Calendar(_))));
    }
}
