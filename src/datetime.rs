//! Datetime module: the time zone database stored in the `timeZoneDB` global
//! slot and calendar decomposition of dates.

use chrono::{DateTime, Datelike, FixedOffset, Offset, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use indexmap::IndexMap;

/// Name of the environment slot holding the time zone database.
pub const TIME_ZONE_DB_SLOT: &str = "timeZoneDB";

/// How a zone identifier maps instants to local time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ZoneRule {
    Fixed(FixedOffset),
    Olson(Tz),
}

impl ZoneRule {
    /// Offset from UTC in effect at `utc`.
    pub fn offset_at(&self, utc: &DateTime<Utc>) -> FixedOffset {
        match self {
            ZoneRule::Fixed(offset) => *offset,
            ZoneRule::Olson(tz) => tz.offset_from_utc_datetime(&utc.naive_utc()).fix(),
        }
    }
}

/// Resolves time zone identifiers.
///
/// Lookup order is registered aliases, then Olson identifiers from the IANA
/// database (`America/New_York`), then literal offsets of the form `+hh`,
/// `+hhmm` and `+hh:mm` (or with `-`).
#[derive(Debug, Clone, PartialEq)]
pub struct TimeZoneDatabase {
    aliases: IndexMap<String, ZoneRule>,
}

impl Default for TimeZoneDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeZoneDatabase {
    pub fn new() -> Self {
        let utc = ZoneRule::Fixed(Utc.fix());
        let aliases = ["UTC", "GMT", "Z"].into_iter().map(|name| (name.to_string(), utc)).collect();
        Self { aliases }
    }

    /// Registers a named zone with a fixed offset east of UTC. Offsets beyond
    /// a day are ignored.
    pub fn with_zone(mut self, name: impl Into<String>, offset_seconds: i32) -> Self {
        if let Some(offset) = FixedOffset::east_opt(offset_seconds) {
            self.aliases.insert(name.into(), ZoneRule::Fixed(offset));
        }
        self
    }

    pub fn is_time_zone_identifier(&self, name: &str) -> bool {
        self.resolve(name).is_some()
    }

    pub fn resolve(&self, name: &str) -> Option<ZoneRule> {
        if let Some(rule) = self.aliases.get(name) {
            return Some(*rule);
        }
        if let Ok(tz) = name.parse::<Tz>() {
            return Some(ZoneRule::Olson(tz));
        }
        parse_utc_offset(name).and_then(FixedOffset::east_opt).map(ZoneRule::Fixed)
    }
}

fn parse_utc_offset(s: &str) -> Option<i32> {
    let (sign, rest) = match s.as_bytes().first()? {
        b'+' => (1, &s[1..]),
        b'-' => (-1, &s[1..]),
        _ => return None,
    };
    let digits: String = rest.chars().filter(|c| *c != ':').collect();
    if !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let (hours, minutes) = match digits.len() {
        2 => (digits.parse::<i32>().ok()?, 0),
        4 => (digits[..2].parse::<i32>().ok()?, digits[2..].parse::<i32>().ok()?),
        _ => return None,
    };
    if hours > 23 || minutes > 59 {
        return None;
    }
    if rest.contains(':') && rest.len() != 5 {
        return None;
    }
    Some(sign * (hours * 3600 + minutes * 60))
}

/// Calendar fields of an instant in a given zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateParts {
    pub year: i32,
    pub month: i32,
    pub day: i32,
    pub hour: i32,
    pub minute: i32,
    pub second: i32,
    pub millisecond: i32,
}

/// ISO 8601 week-based calendar fields of an instant in a given zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IsoDateParts {
    pub iso_week_year: i32,
    pub iso_week: i32,
    pub iso_day_of_week: i32,
    pub hour: i32,
    pub minute: i32,
    pub second: i32,
    pub millisecond: i32,
}

fn local_time(db: &TimeZoneDatabase, millis: i64, zone: &str) -> Option<DateTime<FixedOffset>> {
    let rule = db.resolve(zone)?;
    let utc = Utc.timestamp_millis_opt(millis).single()?;
    Some(utc.with_timezone(&rule.offset_at(&utc)))
}

/// Splits `millis` since the epoch into calendar parts in `zone`.
pub fn date_parts(db: &TimeZoneDatabase, millis: i64, zone: &str) -> Option<DateParts> {
    let t = local_time(db, millis, zone)?;
    Some(DateParts {
        year: t.year(),
        month: t.month() as i32,
        day: t.day() as i32,
        hour: t.hour() as i32,
        minute: t.minute() as i32,
        second: t.second() as i32,
        millisecond: (t.nanosecond() / 1_000_000) as i32,
    })
}

/// Splits `millis` since the epoch into ISO week-date parts in `zone`.
pub fn iso_date_parts(db: &TimeZoneDatabase, millis: i64, zone: &str) -> Option<IsoDateParts> {
    let t = local_time(db, millis, zone)?;
    let week = t.iso_week();
    Some(IsoDateParts {
        iso_week_year: week.year(),
        iso_week: week.week() as i32,
        iso_day_of_week: t.weekday().number_from_monday() as i32,
        hour: t.hour() as i32,
        minute: t.minute() as i32,
        second: t.second() as i32,
        millisecond: (t.nanosecond() / 1_000_000) as i32,
    })
}

/// Formats a date as an ISO 8601 UTC string with millisecond precision.
pub fn format_iso_date(millis: i64) -> Option<String> {
    let utc = Utc.timestamp_millis_opt(millis).single()?;
    Some(utc.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string())
}
