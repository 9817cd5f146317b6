//! Date and timezone formatting.
//!
//! Timestamps are stored in UTC. The school runs on a single fixed UTC
//! offset taken from configuration; everything a person sees or types is
//! in that offset.

use chrono::{
    DateTime, Datelike, Duration, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Offset,
    TimeZone, Utc,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchoolTz {
    offset: FixedOffset,
}

impl Default for SchoolTz {
    fn default() -> Self {
        Self { offset: Utc.fix() }
    }
}

impl SchoolTz {
    /// Parse `UTC`, `Z`, `+HH:MM`, `-HH:MM` or `+HHMM`.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("utc") || s == "Z" {
            return Some(Self::default());
        }
        let (sign, rest) = match s.as_bytes().first()? {
            b'+' => (1, &s[1..]),
            b'-' => (-1, &s[1..]),
            _ => return None,
        };
        let (hours, minutes) = match rest.split_once(':') {
            Some((h, m)) => (h, m),
            None if rest.len() == 4 && rest.is_ascii() => rest.split_at(2),
            None => return None,
        };
        if hours.len() != 2 || minutes.len() != 2 {
            return None;
        }
        let hours: i32 = hours.parse().ok()?;
        let minutes: i32 = minutes.parse().ok()?;
        if hours > 14 || minutes > 59 {
            return None;
        }
        let offset = FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))?;
        Some(Self { offset })
    }

    pub fn offset_minutes(&self) -> i32 {
        self.offset.local_minus_utc() / 60
    }

    pub fn label(&self) -> String {
        let minutes = self.offset_minutes();
        if minutes == 0 {
            return "UTC".to_string();
        }
        let sign = if minutes < 0 { '-' } else { '+' };
        let minutes = minutes.abs();
        format!("UTC{}{:02}:{:02}", sign, minutes / 60, minutes % 60)
    }

    pub fn local(&self, dt: DateTime<Utc>) -> DateTime<FixedOffset> {
        dt.with_timezone(&self.offset)
    }

    pub fn local_date(&self, dt: DateTime<Utc>) -> NaiveDate {
        self.local(dt).date_naive()
    }

    pub fn format_datetime(&self, dt: DateTime<Utc>) -> String {
        self.local(dt).format("%d %b %Y, %H:%M").to_string()
    }

    pub fn format_date(&self, dt: DateTime<Utc>) -> String {
        self.local(dt).format("%a %d %b %Y").to_string()
    }

    pub fn format_time(&self, dt: DateTime<Utc>) -> String {
        self.local(dt).format("%H:%M").to_string()
    }

    /// Value for an `<input type="datetime-local">`.
    pub fn to_input_value(&self, dt: DateTime<Utc>) -> String {
        self.local(dt).format("%Y-%m-%dT%H:%M").to_string()
    }

    /// Due-date label: "due 03 Mar 2025, 09:00" or "overdue since ...".
    pub fn format_due(&self, due: DateTime<Utc>, now: DateTime<Utc>) -> String {
        if due < now {
            format!("overdue since {}", self.format_datetime(due))
        } else {
            format!("due {}", self.format_datetime(due))
        }
    }

    /// Parse form input (`YYYY-MM-DDTHH:MM[:SS]` or with a space) given in
    /// school time.
    pub fn parse_local_datetime(&self, s: &str) -> Option<DateTime<Utc>> {
        let s = s.trim();
        let naive = ["%Y-%m-%dT%H:%M", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"]
            .iter()
            .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())?;
        self.from_local(naive)
    }

    pub fn parse_local_date(&self, s: &str) -> Option<NaiveDate> {
        NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").ok()
    }

    /// Midnight of `date` in school time, as UTC.
    pub fn start_of_day(&self, date: NaiveDate) -> Option<DateTime<Utc>> {
        self.from_local(date.and_time(NaiveTime::MIN))
    }

    /// `[start, end)` of a calendar month in school time.
    pub fn month_bounds(&self, year: i32, month: u32) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let first = NaiveDate::from_ymd_opt(year, month, 1)?;
        let next = if month == 12 {
            NaiveDate::from_ymd_opt(year + 1, 1, 1)?
        } else {
            NaiveDate::from_ymd_opt(year, month + 1, 1)?
        };
        Some((self.start_of_day(first)?, self.start_of_day(next)?))
    }

    /// (year, month) of `dt` in school time.
    pub fn year_month(&self, dt: DateTime<Utc>) -> (i32, u32) {
        let local = self.local(dt);
        (local.year(), local.month())
    }

    fn from_local(&self, naive: NaiveDateTime) -> Option<DateTime<Utc>> {
        self.offset
            .from_local_datetime(&naive)
            .single()
            .map(|dt| dt.with_timezone(&Utc))
    }
}

/// "just now", "5 minutes ago", "in 2 days"; falls back to the date beyond
/// a month.
pub fn format_relative(tz: &SchoolTz, dt: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let delta = dt.signed_duration_since(now);
    let future = delta > Duration::zero();
    let secs = delta.num_seconds().abs();

    let (value, unit) = if secs < 60 {
        return "just now".to_string();
    } else if secs < 3600 {
        (secs / 60, "minute")
    } else if secs < 86_400 {
        (secs / 3600, "hour")
    } else if secs < 30 * 86_400 {
        (secs / 86_400, "day")
    } else {
        return tz.format_date(dt);
    };

    let plural = if value == 1 { "" } else { "s" };
    if future {
        format!("in {} {}{}", value, unit, plural)
    } else {
        format!("{} {}{} ago", value, unit, plural)
    }
}
