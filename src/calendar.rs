// Local calendar helpers
//
// Days are stored as "days since 1970-01-01" in the user's local time so one
// completion per calendar day can be enforced with plain integer compares.

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, Timelike, Weekday};
use spacetimedb::Timestamp;

pub const MICROS_PER_MINUTE: i64 = 60 * 1_000_000;
pub const MICROS_PER_DAY: i64 = 24 * 60 * MICROS_PER_MINUTE;

/// `NaiveDate::num_days_from_ce()` of 1970-01-01
const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;

/// Offsets beyond ±14h don't exist
pub const MAX_UTC_OFFSET_MINUTES: i32 = 14 * 60;

pub fn clamp_utc_offset(minutes: i32) -> i32 {
    minutes.clamp(-MAX_UTC_OFFSET_MINUTES, MAX_UTC_OFFSET_MINUTES)
}

fn local_micros(ts: Timestamp, utc_offset_minutes: i32) -> i64 {
    ts.to_micros_since_unix_epoch() + utc_offset_minutes as i64 * MICROS_PER_MINUTE
}

/// Local calendar day of a timestamp
pub fn local_day(ts: Timestamp, utc_offset_minutes: i32) -> i32 {
    local_micros(ts, utc_offset_minutes).div_euclid(MICROS_PER_DAY) as i32
}

pub fn local_datetime(ts: Timestamp, utc_offset_minutes: i32) -> Option<NaiveDateTime> {
    DateTime::from_timestamp_micros(local_micros(ts, utc_offset_minutes)).map(|dt| dt.naive_utc())
}

pub fn local_hour(ts: Timestamp, utc_offset_minutes: i32) -> Option<u32> {
    local_datetime(ts, utc_offset_minutes).map(|dt| dt.hour())
}

pub fn date_of_day(day: i32) -> Option<NaiveDate> {
    NaiveDate::from_num_days_from_ce_opt(day.checked_add(UNIX_EPOCH_DAYS_FROM_CE)?)
}

pub fn day_of_date(date: NaiveDate) -> i32 {
    date.num_days_from_ce() - UNIX_EPOCH_DAYS_FROM_CE
}

pub fn weekday_of_day(day: i32) -> Option<Weekday> {
    date_of_day(day).map(|d| d.weekday())
}

/// Parse an exported `YYYY-MM-DD` date (a trailing time part is ignored)
pub fn parse_day(date: &str) -> Option<i32> {
    let date_part = date.get(..10).unwrap_or(date);
    NaiveDate::parse_from_str(date_part, "%Y-%m-%d").ok().map(day_of_date)
}

pub fn format_day(day: i32) -> String {
    date_of_day(day)
        .map(|d| d.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| format!("day-{}", day))
}

/// Time-of-day bucket used by the insight rollup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeOfDay {
    Morning,   // 05:00-11:59
    Afternoon, // 12:00-16:59
    Evening,   // 17:00-20:59
    Night,
}

impl TimeOfDay {
    pub fn from_hour(hour: u32) -> Self {
        match hour {
            5..=11 => TimeOfDay::Morning,
            12..=16 => TimeOfDay::Afternoon,
            17..=20 => TimeOfDay::Evening,
            _ => TimeOfDay::Night,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            TimeOfDay::Morning => "morning",
            TimeOfDay::Afternoon => "afternoon",
            TimeOfDay::Evening => "evening",
            TimeOfDay::Night => "night",
        }
    }
}

pub fn weekday_label(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "Monday",
        Weekday::Tue => "Tuesday",
        Weekday::Wed => "Wednesday",
        Weekday::Thu => "Thursday",
        Weekday::Fri => "Friday",
        Weekday::Sat => "Saturday",
        Weekday::Sun => "Sunday",
    }
}
