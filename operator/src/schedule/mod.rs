//! Pure decision function: given a plan's schedule, its currently applicable
//! exceptions, an optional ad-hoc suspension, and an instant in time, decide
//! whether the plan should be hibernated right now and when the next
//! transition falls. No I/O, no wall-clock reads — `now` is always supplied
//! by the caller so tests can fast-forward through windows.

use chrono::{DateTime, Datelike, Timelike, Utc};
use chrono_tz::Tz;
use std::time::Duration as StdDuration;

use crate::util::Error;
use hibernator_types::{ExceptionPhase, ExceptionType, OffHourWindow, ScheduleSpec};

const SECONDS_PER_DAY: i64 = 86_400;
const SECONDS_PER_WEEK: i64 = 7 * SECONDS_PER_DAY;
const TRIPLE_LO: i64 = -SECONDS_PER_WEEK;
const TRIPLE_HI: i64 = 2 * SECONDS_PER_WEEK;

/// Default schedule buffer (§4.1 step 4): transitions closer together than
/// this are merged so all-day windows don't flap at midnight.
pub const DEFAULT_BUFFER_SECONDS: i64 = 60;

type Interval = (i64, i64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleState {
    Active,
    ShouldHibernate,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub state: ScheduleState,
    pub next_transition: DateTime<Utc>,
    pub reason: String,
}

/// A caller-filtered view of one Exception relevant to the evaluation.
/// `state`/`valid_from`/`valid_until` are still passed through (rather than
/// pre-filtered away) so `evaluate` itself enforces the "state=Active and
/// within range" membership rule it is specified to apply.
#[derive(Debug, Clone)]
pub struct ExceptionInput {
    pub exception_type: ExceptionType,
    pub state: ExceptionPhase,
    pub valid_from: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
    pub lead_time: Option<StdDuration>,
    pub windows: Vec<OffHourWindow>,
}

pub fn evaluate(
    schedule: &ScheduleSpec,
    exceptions: &[ExceptionInput],
    suspend_until: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<Decision, Error> {
    let tz: Tz = schedule
        .timezone
        .parse()
        .map_err(|_| Error::Configuration(format!("unknown timezone: {}", schedule.timezone)))?;
    let local_now = now.with_timezone(&tz);

    let active: Vec<&ExceptionInput> = exceptions
        .iter()
        .filter(|e| e.state == ExceptionPhase::Active && e.valid_from <= now && now < e.valid_until)
        .collect();

    let base_windows: Vec<OffHourWindow> = if let Some(replace) = active
        .iter()
        .find(|e| e.exception_type == ExceptionType::Replace)
    {
        replace.windows.clone()
    } else {
        let mut windows = schedule.windows.clone();
        for e in active
            .iter()
            .filter(|e| e.exception_type == ExceptionType::Extend)
        {
            windows.extend(e.windows.clone());
        }
        windows
    };

    let mut effective = merge(triple(&windows_to_intervals(&base_windows)?));

    for e in active
        .iter()
        .filter(|e| e.exception_type == ExceptionType::Suspend)
    {
        let lead = e.lead_time.unwrap_or_default().as_secs() as i64;
        let carve: Vec<Interval> = windows_to_intervals(&e.windows)?
            .into_iter()
            .map(|(start, end)| (start - lead, end))
            .collect();
        effective = subtract(&effective, &triple(&carve));
    }

    effective = merge_with_buffer(&effective, DEFAULT_BUFFER_SECONDS);

    let now_sow = second_of_week(&local_now);
    let should_hibernate = effective.iter().any(|&(s, e)| s <= now_sow && now_sow < e);

    let next_boundary =
        next_boundary_after(&effective, now_sow, should_hibernate).unwrap_or(now_sow + SECONDS_PER_WEEK);
    let next_transition = now + chrono::Duration::seconds(next_boundary - now_sow);

    let (state, reason) = if should_hibernate {
        (
            ScheduleState::ShouldHibernate,
            "within-hibernation-window".to_string(),
        )
    } else {
        (ScheduleState::Active, "outside-hibernation-window".to_string())
    };

    if let Some(su) = suspend_until
        && now < su
    {
        return Ok(Decision {
            state: ScheduleState::Active,
            next_transition: su,
            reason: "suspended-by-annotation".to_string(),
        });
    }

    Ok(Decision {
        state,
        next_transition,
        reason,
    })
}

pub(crate) fn parse_hhmm(s: &str) -> Result<i64, Error> {
    let (h, m) = s
        .split_once(':')
        .ok_or_else(|| Error::Configuration(format!("invalid time of day: {s}")))?;
    let h: i64 = h
        .parse()
        .map_err(|_| Error::Configuration(format!("invalid time of day: {s}")))?;
    let m: i64 = m
        .parse()
        .map_err(|_| Error::Configuration(format!("invalid time of day: {s}")))?;
    if !(0..24).contains(&h) || !(0..60).contains(&m) {
        return Err(Error::Configuration(format!("invalid time of day: {s}")));
    }
    Ok(h * 3600 + m * 60)
}

fn windows_to_intervals(windows: &[OffHourWindow]) -> Result<Vec<Interval>, Error> {
    let mut out = Vec::new();
    for w in windows {
        let start_secs = parse_hhmm(&w.start)?;
        let end_secs = parse_hhmm(&w.end)?;
        if start_secs == end_secs {
            return Err(Error::Configuration(format!(
                "window start must differ from end: {} == {}",
                w.start, w.end
            )));
        }
        let duration = if end_secs > start_secs {
            end_secs - start_secs
        } else {
            (SECONDS_PER_DAY - start_secs) + end_secs
        };
        for day in &w.days_of_week {
            let start_sow = (day.index() as i64) * SECONDS_PER_DAY + start_secs;
            out.push((start_sow, start_sow + duration));
        }
    }
    Ok(out)
}

fn triple(intervals: &[Interval]) -> Vec<Interval> {
    let mut out = Vec::new();
    for &(s, e) in intervals {
        for shift in [-SECONDS_PER_WEEK, 0, SECONDS_PER_WEEK] {
            let (ss, ee) = (s + shift, e + shift);
            if ee > TRIPLE_LO && ss < TRIPLE_HI {
                out.push((ss.max(TRIPLE_LO), ee.min(TRIPLE_HI)));
            }
        }
    }
    out
}

fn merge(intervals: Vec<Interval>) -> Vec<Interval> {
    let mut sorted = intervals;
    sorted.sort();
    let mut merged: Vec<Interval> = Vec::new();
    for iv in sorted {
        if let Some(last) = merged.last_mut() {
            if iv.0 <= last.1 {
                last.1 = last.1.max(iv.1);
                continue;
            }
        }
        merged.push(iv);
    }
    merged
}

fn subtract(base: &[Interval], carve: &[Interval]) -> Vec<Interval> {
    if carve.is_empty() {
        return base.to_vec();
    }
    let mut result = Vec::new();
    for &(s, e) in base {
        let mut cuts: Vec<Interval> = carve
            .iter()
            .cloned()
            .filter(|&(cs, ce)| cs < e && ce > s)
            .collect();
        cuts.sort();
        let mut cur = s;
        for (cs, ce) in cuts {
            if cs > cur {
                result.push((cur, cs.min(e)));
            }
            cur = cur.max(ce);
            if cur >= e {
                break;
            }
        }
        if cur < e {
            result.push((cur, e));
        }
    }
    merge(result)
}

fn merge_with_buffer(intervals: &[Interval], buffer: i64) -> Vec<Interval> {
    let mut sorted = intervals.to_vec();
    sorted.sort();
    let mut merged: Vec<Interval> = Vec::new();
    for iv in sorted {
        if let Some(last) = merged.last_mut() {
            if iv.0 - last.1 < buffer {
                last.1 = last.1.max(iv.1);
                continue;
            }
        }
        merged.push(iv);
    }
    merged
}

fn next_boundary_after(intervals: &[Interval], now_sow: i64, in_window: bool) -> Option<i64> {
    if in_window {
        intervals
            .iter()
            .filter(|&&(_, e)| e > now_sow)
            .map(|&(_, e)| e)
            .min()
    } else {
        intervals
            .iter()
            .filter(|&&(s, _)| s > now_sow)
            .map(|&(s, _)| s)
            .min()
    }
}

fn second_of_week(dt: &DateTime<Tz>) -> i64 {
    let weekday_index = dt.weekday().num_days_from_monday() as i64;
    weekday_index * SECONDS_PER_DAY
        + dt.hour() as i64 * 3600
        + dt.minute() as i64 * 60
        + dt.second() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use hibernator_types::Weekday;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    fn schedule(windows: Vec<OffHourWindow>) -> ScheduleSpec {
        ScheduleSpec {
            timezone: "UTC".to_string(),
            windows,
        }
    }

    fn window(start: &str, end: &str, days: &[Weekday]) -> OffHourWindow {
        OffHourWindow {
            start: start.to_string(),
            end: end.to_string(),
            days_of_week: days.to_vec(),
        }
    }

    #[test]
    fn midnight_crossing_window_covers_into_next_day() {
        let sched = schedule(vec![window("20:00", "06:00", &[Weekday::Mon, Weekday::Tue])]);
        // 2024-01-01 is a Monday.
        let before = utc(2024, 1, 1, 19, 59);
        let during_mon_night = utc(2024, 1, 1, 23, 30);
        let during_tue_morning = utc(2024, 1, 2, 5, 30);
        let after = utc(2024, 1, 2, 6, 1);

        assert_eq!(
            evaluate(&sched, &[], None, before).unwrap().state,
            ScheduleState::Active
        );
        assert_eq!(
            evaluate(&sched, &[], None, during_mon_night).unwrap().state,
            ScheduleState::ShouldHibernate
        );
        assert_eq!(
            evaluate(&sched, &[], None, during_tue_morning).unwrap().state,
            ScheduleState::ShouldHibernate
        );
        assert_eq!(
            evaluate(&sched, &[], None, after).unwrap().state,
            ScheduleState::Active
        );
    }

    #[test]
    fn full_day_window_stays_hibernating_across_midnight() {
        use hibernator_types::Weekday::*;
        let sched = schedule(vec![window(
            "00:00",
            "23:59",
            &[Mon, Tue, Wed, Thu, Fri, Sat, Sun],
        )]);
        let around_midnight = utc(2024, 1, 2, 23, 59);
        let just_after = utc(2024, 1, 3, 0, 0);
        assert_eq!(
            evaluate(&sched, &[], None, around_midnight).unwrap().state,
            ScheduleState::ShouldHibernate
        );
        assert_eq!(
            evaluate(&sched, &[], None, just_after).unwrap().state,
            ScheduleState::ShouldHibernate
        );
    }

    #[test]
    fn evaluate_is_pure() {
        let sched = schedule(vec![window("20:00", "06:00", &[Weekday::Mon])]);
        let now = utc(2024, 1, 1, 21, 0);
        let a = evaluate(&sched, &[], None, now).unwrap();
        let b = evaluate(&sched, &[], None, now).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn next_transition_is_always_after_now() {
        let sched = schedule(vec![window("20:00", "06:00", &[Weekday::Mon, Weekday::Wed])]);
        for hour in 0..24 {
            let now = utc(2024, 1, 1, hour, 0);
            let decision = evaluate(&sched, &[], None, now).unwrap();
            assert!(decision.next_transition > now);
        }
    }

    #[test]
    fn replace_exception_overrides_base_windows() {
        let sched = schedule(vec![window("20:00", "06:00", &[Weekday::Mon])]);
        let replace = ExceptionInput {
            exception_type: ExceptionType::Replace,
            state: ExceptionPhase::Active,
            valid_from: utc(2024, 1, 1, 0, 0),
            valid_until: utc(2024, 1, 2, 0, 0),
            lead_time: None,
            windows: vec![window("10:00", "11:00", &[Weekday::Mon])],
        };
        let now = utc(2024, 1, 1, 21, 0);
        assert_eq!(
            evaluate(&sched, &[replace], None, now).unwrap().state,
            ScheduleState::Active
        );
    }

    #[test]
    fn suspend_exception_with_lead_time_forbids_new_hibernation() {
        let sched = schedule(vec![window("20:00", "06:00", &[Weekday::Mon])]);
        let suspend = ExceptionInput {
            exception_type: ExceptionType::Suspend,
            state: ExceptionPhase::Active,
            valid_from: utc(2024, 1, 1, 0, 0),
            valid_until: utc(2024, 1, 2, 0, 0),
            lead_time: Some(StdDuration::from_secs(3600)),
            windows: vec![window("20:00", "06:00", &[Weekday::Mon])],
        };
        // 19:30 is within the one-hour lead time before the 20:00 window.
        let now = utc(2024, 1, 1, 19, 30);
        assert_eq!(
            evaluate(&sched, &[suspend], None, now).unwrap().state,
            ScheduleState::Active
        );
    }

    #[test]
    fn suspend_until_annotation_forces_active() {
        let sched = schedule(vec![window("20:00", "06:00", &[Weekday::Mon])]);
        let now = utc(2024, 1, 1, 21, 0);
        let until = utc(2024, 1, 1, 22, 0);
        let decision = evaluate(&sched, &[], Some(until), now).unwrap();
        assert_eq!(decision.state, ScheduleState::Active);
        assert_eq!(decision.reason, "suspended-by-annotation");
        assert_eq!(decision.next_transition, until);
    }

    #[test]
    fn unknown_timezone_is_configuration_error() {
        let sched = schedule(vec![]);
        let mut bad = sched.clone();
        bad.timezone = "Not/AZone".to_string();
        let now = utc(2024, 1, 1, 0, 0);
        assert!(evaluate(&bad, &[], None, now).is_err());
    }
}
