use crate::error::{Error, Result};
use chrono::Weekday;
use std::fmt;
use std::str::FromStr;

pub const SECS_PER_DAY: u32 = 86_400;
pub const WEEKDAY_SHIFT: u32 = 24;
pub const TIME_MASK: u32 = 0x00FF_FFFF;
pub const ALL_WEEKDAYS: u8 = 0x7F;

/// Time of day plus an optional weekday restriction.
///
/// Bit `i` of `weekday_mask` stands for ISO weekday `i + 1` (bit 0 = Monday,
/// bit 6 = Sunday). An empty mask means every day.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimeSpec {
    pub seconds_of_day: u32,
    pub weekday_mask: u8,
}

impl TimeSpec {
    pub fn new(seconds_of_day: u32, weekday_mask: u8) -> Self {
        Self {
            seconds_of_day: seconds_of_day % SECS_PER_DAY,
            weekday_mask: weekday_mask & ALL_WEEKDAYS,
        }
    }

    pub fn pack(&self) -> u32 {
        self.seconds_of_day | ((self.weekday_mask as u32) << WEEKDAY_SHIFT)
    }

    pub fn unpack(packed: u32) -> Self {
        Self {
            seconds_of_day: packed & TIME_MASK,
            weekday_mask: (packed >> WEEKDAY_SHIFT) as u8 & ALL_WEEKDAYS,
        }
    }

    pub fn offset(&self, offset_secs: i64) -> Self {
        let secs = (self.seconds_of_day as i64 + offset_secs).rem_euclid(SECS_PER_DAY as i64);
        Self::new(secs as u32, self.weekday_mask)
    }

    pub fn matches(&self, day: Weekday) -> bool {
        self.weekday_mask == 0 || self.weekday_mask & (1 << day.num_days_from_monday()) != 0
    }

    pub fn hour(&self) -> u32 {
        self.seconds_of_day / 3600
    }

    pub fn minute(&self) -> u32 {
        self.seconds_of_day % 3600 / 60
    }

    pub fn second(&self) -> u32 {
        self.seconds_of_day % 60
    }
}

impl FromStr for TimeSpec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        parse_time_spec(s)
    }
}

impl fmt::Display for TimeSpec {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour(), self.minute())?;
        if self.second() != 0 {
            write!(f, ":{:02}", self.second())?;
        }
        if self.weekday_mask != 0 {
            write!(f, "%")?;
            for bit in 0..7 {
                if self.weekday_mask & (1 << bit) != 0 {
                    write!(f, "{}", bit + 1)?;
                }
            }
        }
        Ok(())
    }
}

fn parse_field(text: &str, max: u32, spec: &str) -> Result<u32> {
    if text.is_empty() || text.len() > 2 || !text.chars().all(|c| c.is_ascii_digit()) {
        return Err(Error::InvalidTimeValue(spec.to_string()));
    }
    match text.parse::<u32>() {
        Ok(v) if v <= max => Ok(v),
        _ => Err(Error::InvalidTimeValue(spec.to_string())),
    }
}

fn weekday_digit(c: char, expr: &str) -> Result<u8> {
    match c.to_digit(10) {
        Some(d) if (1..=7).contains(&d) => Ok(d as u8),
        _ => Err(Error::InvalidWeekdayExpr(expr.to_string())),
    }
}

/// Parses a weekday expression: `*`, or a run of digits `1`-`7` and ranges `a-b`.
pub fn parse_weekdays(expr: &str) -> Result<u8> {
    let expr = expr.trim();
    if expr == "*" {
        return Ok(0);
    }
    if expr.is_empty() {
        return Err(Error::InvalidWeekdayExpr(expr.to_string()));
    }

    let mut mask: u8 = 0;
    let mut chars = expr.chars().peekable();
    while let Some(c) = chars.next() {
        let first = weekday_digit(c, expr)?;
        let mut last = first;
        if chars.peek() == Some(&'-') {
            chars.next();
            last = match chars.next() {
                Some(c) => weekday_digit(c, expr)?,
                None => return Err(Error::InvalidWeekdayExpr(expr.to_string())),
            };
            if last < first {
                return Err(Error::InvalidWeekdayExpr(expr.to_string()));
            }
        }
        for day in first..=last {
            mask |= 1 << (day - 1);
        }
    }
    Ok(mask)
}

/// Parses `H[:MM[:SS]][%weekdays]`.
pub fn parse_time_spec(text: &str) -> Result<TimeSpec> {
    let text = text.trim();
    let (time, weekdays) = match text.split_once('%') {
        Some((time, weekdays)) => (time, Some(weekdays)),
        None => (text, None),
    };

    let mut fields = time.split(':');
    let hour = parse_field(fields.next().unwrap_or_default(), 23, text)?;
    let minute = match fields.next() {
        Some(m) => parse_field(m, 59, text)?,
        None => 0,
    };
    let second = match fields.next() {
        Some(s) => parse_field(s, 59, text)?,
        None => 0,
    };
    if fields.next().is_some() {
        return Err(Error::InvalidTimeValue(text.to_string()));
    }

    let weekday_mask = match weekdays {
        Some(expr) => parse_weekdays(expr)?,
        None => 0,
    };

    Ok(TimeSpec::new(hour * 3600 + minute * 60 + second, weekday_mask))
}
