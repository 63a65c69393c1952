//! Calendar schedules for time triggers
//!
//! A [`Schedule`] is parsed from a short English phrase such as
//! `every day at 7:30am in utc` or `every 15 minutes` and computes the next
//! instant it fires after a given time. Wall-clock targets are resolved in
//! the schedule's zone on every computation, so "every day at midnight"
//! lands on the next local midnight across DST changes and leap days.

use chrono::{
    DateTime, Datelike, Duration as ChronoDuration, FixedOffset, LocalResult, NaiveDateTime,
    NaiveTime, TimeZone, Timelike, Utc, Weekday,
};
use regex::Regex;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;

use crate::ScheduleError;

/// Tolerance used by a bare `exact` suffix
pub const DEFAULT_EXACT_TOLERANCE: Duration = Duration::from_secs(3);

/// Longest forward search for a valid instant after a DST gap
const GAP_SEARCH_MINUTES: i64 = 24 * 60;

/// Upper bound on candidate instants examined by one computation
const MAX_CANDIDATES: usize = 10_000;

/// Time zone a schedule's wall-clock fields are interpreted in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Zone {
    Utc,
    Local,
    Fixed(FixedOffset),
}

impl Zone {
    /// Wall-clock reading of an instant in this zone
    pub fn local_time(&self, t: DateTime<Utc>) -> NaiveDateTime {
        match self {
            Zone::Utc => t.naive_utc(),
            Zone::Local => t.with_timezone(&chrono::Local).naive_local(),
            Zone::Fixed(offset) => t.with_timezone(offset).naive_local(),
        }
    }

    /// Instants a wall-clock reading maps to in this zone
    pub fn resolve(&self, naive: NaiveDateTime) -> LocalResult<DateTime<Utc>> {
        match self {
            Zone::Utc => LocalResult::Single(Utc.from_utc_datetime(&naive)),
            Zone::Local => chrono::Local
                .from_local_datetime(&naive)
                .map(|d| d.with_timezone(&Utc)),
            Zone::Fixed(offset) => offset
                .from_local_datetime(&naive)
                .map(|d| d.with_timezone(&Utc)),
        }
    }
}

/// Mapping between instants and wall-clock readings
trait WallClock {
    fn local_time(&self, t: DateTime<Utc>) -> NaiveDateTime;
    fn resolve(&self, naive: NaiveDateTime) -> LocalResult<DateTime<Utc>>;
}

impl WallClock for Zone {
    fn local_time(&self, t: DateTime<Utc>) -> NaiveDateTime {
        Zone::local_time(self, t)
    }

    fn resolve(&self, naive: NaiveDateTime) -> LocalResult<DateTime<Utc>> {
        Zone::resolve(self, naive)
    }
}

impl fmt::Display for Zone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Zone::Utc => f.write_str("utc"),
            Zone::Local => f.write_str("local"),
            Zone::Fixed(offset) => write!(f, "{}", offset),
        }
    }
}

/// Field a sub-daily schedule is aligned on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unit {
    Second,
    Minute,
    Hour,
}

impl Unit {
    fn field(&self, t: &NaiveDateTime) -> u32 {
        match self {
            Unit::Second => t.second(),
            Unit::Minute => t.minute(),
            Unit::Hour => t.hour(),
        }
    }

    fn period(&self) -> u32 {
        match self {
            Unit::Second | Unit::Minute => 60,
            Unit::Hour => 24,
        }
    }

    fn length(&self) -> ChronoDuration {
        match self {
            Unit::Second => ChronoDuration::seconds(1),
            Unit::Minute => ChronoDuration::minutes(1),
            Unit::Hour => ChronoDuration::hours(1),
        }
    }

    fn truncate(&self, t: NaiveDateTime) -> NaiveDateTime {
        let time = t.time();
        let truncated = match self {
            Unit::Second => NaiveTime::from_hms_opt(time.hour(), time.minute(), time.second()),
            Unit::Minute => NaiveTime::from_hms_opt(time.hour(), time.minute(), 0),
            Unit::Hour => NaiveTime::from_hms_opt(time.hour(), 0, 0),
        };
        t.date().and_time(truncated.unwrap_or(NaiveTime::MIN))
    }

    /// Next aligned reading strictly after an aligned `t`
    ///
    /// Alignment is on the field value: `every 7 seconds` fires at seconds
    /// 0, 7, ..., 56 and then 0 again.
    fn next_aligned(&self, t: NaiveDateTime, step: u32) -> NaiveDateTime {
        let field = self.field(&t);
        let next_field = (field / step + 1) * step;
        let steps = if next_field < self.period() {
            next_field - field
        } else {
            self.period() - field
        };
        t + self.length() * steps as i32
    }

    fn first_aligned(&self, t: NaiveDateTime, step: u32) -> NaiveDateTime {
        let t = self.truncate(t);
        if self.field(&t) % step == 0 {
            t
        } else {
            self.next_aligned(t, step)
        }
    }
}

/// What a schedule fires on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleKind {
    /// Every `step` units, aligned on the unit's field
    Every { unit: Unit, step: u32 },
    /// Every day at a wall-clock time
    Daily { time: NaiveTime },
    /// Every week on a weekday at a wall-clock time
    Weekly { weekday: Weekday, time: NaiveTime },
}

/// A parsed calendar schedule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schedule {
    kind: ScheduleKind,
    zone: Zone,
    exact: Option<Duration>,
    source: String,
}

impl Schedule {
    pub fn new(kind: ScheduleKind, zone: Zone) -> Self {
        Self {
            kind,
            zone,
            exact: None,
            source: String::new(),
        }
    }

    /// Set the `exact` tolerance
    pub fn with_exact(mut self, tolerance: Duration) -> Self {
        self.exact = Some(tolerance);
        self
    }

    pub fn kind(&self) -> ScheduleKind {
        self.kind
    }

    pub fn zone(&self) -> Zone {
        self.zone
    }

    /// Maximum lateness after which an occurrence is skipped, if `exact`
    pub fn exact(&self) -> Option<Duration> {
        self.exact
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// The first instant strictly after `t` at which the schedule fires
    pub fn next_after(&self, t: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self.kind {
            ScheduleKind::Every { unit, step } => next_aligned_after(t, unit, step, &self.zone),
            ScheduleKind::Daily { time } => next_wall_clock_after(t, time, None, &self.zone),
            ScheduleKind::Weekly { weekday, time } => {
                next_wall_clock_after(t, time, Some(weekday), &self.zone)
            }
        }
    }

    /// Whether an occurrence scheduled for `scheduled` should be skipped
    /// because it is being handled at `now`, too late for an `exact` schedule
    pub fn is_missed(&self, scheduled: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        match self.exact {
            Some(tolerance) => match (now - scheduled).to_std() {
                Ok(late) => late > tolerance,
                Err(_) => false,
            },
            None => false,
        }
    }
}

fn next_aligned_after<Z: WallClock>(
    t: DateTime<Utc>,
    unit: Unit,
    step: u32,
    zone: &Z,
) -> Option<DateTime<Utc>> {
    let mut candidate = unit.first_aligned(zone.local_time(t), step);
    for _ in 0..MAX_CANDIDATES {
        // every mapping of a repeated reading fires; readings in a gap do not
        let hit = match zone.resolve(candidate) {
            LocalResult::Single(instant) => (instant > t).then_some(instant),
            LocalResult::Ambiguous(earliest, latest) => {
                [earliest, latest].into_iter().find(|instant| *instant > t)
            }
            LocalResult::None => None,
        };
        if hit.is_some() {
            return hit;
        }
        candidate = unit.next_aligned(candidate, step);
    }
    None
}

fn next_wall_clock_after<Z: WallClock>(
    t: DateTime<Utc>,
    time: NaiveTime,
    weekday: Option<Weekday>,
    zone: &Z,
) -> Option<DateTime<Utc>> {
    let mut date = zone.local_time(t).date().pred_opt()?;
    // a week plus the day before and the day of `t`
    for _ in 0..10 {
        if weekday.map_or(true, |w| date.weekday() == w) {
            if let Some(instant) = resolve_forward(zone, date.and_time(time)) {
                if instant > t {
                    return Some(instant);
                }
            }
        }
        date = date.succ_opt()?;
    }
    None
}

/// Resolve a wall-clock reading, taking the earliest mapping of an
/// ambiguous reading and the first valid minute after a gap
fn resolve_forward<Z: WallClock>(zone: &Z, naive: NaiveDateTime) -> Option<DateTime<Utc>> {
    let earliest = |probe: NaiveDateTime| match zone.resolve(probe) {
        LocalResult::Single(instant) => Some(instant),
        LocalResult::Ambiguous(earliest, _) => Some(earliest),
        LocalResult::None => None,
    };
    earliest(naive).or_else(|| {
        (1..=GAP_SEARCH_MINUTES)
            .find_map(|m| earliest(Unit::Minute.truncate(naive + ChronoDuration::minutes(m))))
    })
}

fn patterns() -> Result<&'static Patterns, ScheduleError> {
    static PATTERNS: OnceLock<Result<Patterns, regex::Error>> = OnceLock::new();
    PATTERNS
        .get_or_init(Patterns::new)
        .as_ref()
        .map_err(|e| ScheduleError::Pattern(e.clone()))
}

struct Patterns {
    exact: Regex,
    zone: Regex,
    every_unit: Regex,
    every_n: Regex,
    daily: Regex,
    weekly: Regex,
    clock_24: Regex,
    clock_12: Regex,
    offset: Regex,
}

impl Patterns {
    fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            exact: Regex::new(r"^(.*?)\s+exact(?:\s+(\d+(?:\.\d+)?))?$")?,
            zone: Regex::new(r"^(.*?)\s+in\s+(utc|gmt|local|[+-]\d{1,2}(?::?\d{2})?)$")?,
            every_unit: Regex::new(r"^every\s+(second|minute|hour|day)$")?,
            every_n: Regex::new(r"^every\s+(\d+)\s+(seconds?|minutes?|hours?)$")?,
            daily: Regex::new(r"^(?:every\s+day\s+)?at\s+(.+)$")?,
            weekly: Regex::new(r"^every\s+([a-z]+?)s?\s+at\s+(.+)$")?,
            clock_24: Regex::new(r"^(\d{1,2}):(\d{2})(?::(\d{2}))?$")?,
            clock_12: Regex::new(r"^(\d{1,2})(?::(\d{2}))?\s*(am|pm)$")?,
            offset: Regex::new(r"^([+-])(\d{1,2}):?(\d{2})?$")?,
        })
    }
}

fn parse_time(text: &str) -> Result<NaiveTime, ScheduleError> {
    let text = text.trim();
    let invalid = || ScheduleError::InvalidTime(text.to_string());
    let p = patterns()?;

    match text {
        "midnight" => return Ok(NaiveTime::MIN),
        "noon" => return NaiveTime::from_hms_opt(12, 0, 0).ok_or_else(invalid),
        _ => {}
    }

    if let Some(caps) = p.clock_24.captures(text) {
        let hour: u32 = caps[1].parse().map_err(|_| invalid())?;
        let minute: u32 = caps[2].parse().map_err(|_| invalid())?;
        let second: u32 = match caps.get(3) {
            Some(s) => s.as_str().parse().map_err(|_| invalid())?,
            None => 0,
        };
        return NaiveTime::from_hms_opt(hour, minute, second).ok_or_else(invalid);
    }

    if let Some(caps) = p.clock_12.captures(text) {
        let hour: u32 = caps[1].parse().map_err(|_| invalid())?;
        let minute: u32 = match caps.get(2) {
            Some(m) => m.as_str().parse().map_err(|_| invalid())?,
            None => 0,
        };
        if !(1..=12).contains(&hour) {
            return Err(invalid());
        }
        let hour = match (&caps[3], hour) {
            ("am", 12) => 0,
            ("am", h) => h,
            ("pm", 12) => 12,
            (_, h) => h + 12,
        };
        return NaiveTime::from_hms_opt(hour, minute, 0).ok_or_else(invalid);
    }

    Err(invalid())
}

fn parse_weekday(text: &str) -> Option<Weekday> {
    let day = match text {
        "monday" | "mon" => Weekday::Mon,
        "tuesday" | "tue" | "tues" => Weekday::Tue,
        "wednesday" | "wed" => Weekday::Wed,
        "thursday" | "thu" | "thur" | "thurs" => Weekday::Thu,
        "friday" | "fri" => Weekday::Fri,
        "saturday" | "sat" => Weekday::Sat,
        "sunday" | "sun" => Weekday::Sun,
        _ => return None,
    };
    Some(day)
}

fn parse_zone(text: &str) -> Result<Zone, ScheduleError> {
    match text {
        "utc" | "gmt" => return Ok(Zone::Utc),
        "local" => return Ok(Zone::Local),
        _ => {}
    }
    let invalid = || ScheduleError::InvalidZone(text.to_string());
    let caps = patterns()?.offset.captures(text).ok_or_else(invalid)?;
    let hours: i32 = caps[2].parse().map_err(|_| invalid())?;
    let minutes: i32 = match caps.get(3) {
        Some(m) => m.as_str().parse().map_err(|_| invalid())?,
        None => 0,
    };
    let seconds = hours * 3600 + minutes * 60;
    let seconds = if &caps[1] == "-" { -seconds } else { seconds };
    FixedOffset::east_opt(seconds).map(Zone::Fixed).ok_or_else(invalid)
}

impl FromStr for Schedule {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let source = s.trim().to_string();
        let mut text = source
            .to_lowercase()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ");
        let p = patterns()?;

        let mut exact = None;
        if let Some(caps) = p.exact.captures(&text) {
            exact = Some(match caps.get(2) {
                Some(secs) => {
                    let secs: f64 = secs
                        .as_str()
                        .parse()
                        .map_err(|_| ScheduleError::Unrecognized(source.clone()))?;
                    Duration::try_from_secs_f64(secs)
                        .map_err(|_| ScheduleError::Unrecognized(source.clone()))?
                }
                None => DEFAULT_EXACT_TOLERANCE,
            });
            text = caps[1].to_string();
        }

        let mut zone = Zone::Local;
        if let Some(caps) = p.zone.captures(&text) {
            zone = parse_zone(&caps[2])?;
            text = caps[1].to_string();
        }

        let kind = if let Some(caps) = p.every_unit.captures(&text) {
            match &caps[1] {
                "second" => ScheduleKind::Every {
                    unit: Unit::Second,
                    step: 1,
                },
                "minute" => ScheduleKind::Every {
                    unit: Unit::Minute,
                    step: 1,
                },
                "hour" => ScheduleKind::Every {
                    unit: Unit::Hour,
                    step: 1,
                },
                _ => ScheduleKind::Daily {
                    time: NaiveTime::MIN,
                },
            }
        } else if let Some(caps) = p.every_n.captures(&text) {
            let step: u32 = caps[1]
                .parse()
                .map_err(|_| ScheduleError::Unrecognized(source.clone()))?;
            let unit = match caps[2].trim_end_matches('s') {
                "second" => Unit::Second,
                "minute" => Unit::Minute,
                _ => Unit::Hour,
            };
            if step == 0 || step >= unit.period() {
                return Err(ScheduleError::InvalidStep { step, unit });
            }
            ScheduleKind::Every { unit, step }
        } else if let Some(caps) = p.daily.captures(&text) {
            ScheduleKind::Daily {
                time: parse_time(&caps[1])?,
            }
        } else if let Some(caps) = p.weekly.captures(&text) {
            let weekday = parse_weekday(&caps[1])
                .ok_or_else(|| ScheduleError::Unrecognized(source.clone()))?;
            ScheduleKind::Weekly {
                weekday,
                time: parse_time(&caps[2])?,
            }
        } else {
            return Err(ScheduleError::Unrecognized(source));
        };

        Ok(Schedule {
            kind,
            zone,
            exact,
            source,
        })
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.source.is_empty() {
            return f.write_str(&self.source);
        }
        match self.kind {
            ScheduleKind::Every { unit, step } => write!(f, "every {} {:?}s", step, unit)?,
            ScheduleKind::Daily { time } => write!(f, "every day at {}", time)?,
            ScheduleKind::Weekly { weekday, time } => write!(f, "every {} at {}", weekday, time)?,
        }
        write!(f, " in {}", self.zone)
    }
}
