use chrono::{TimeZone, Utc};
use hibernator_operator::schedule::{self, ExceptionInput};
use hibernator_types::{ExceptionPhase, ExceptionType, OffHourWindow, ScheduleSpec, Weekday};
use proptest::prelude::*;

fn days_strategy() -> impl Strategy<Value = Vec<Weekday>> {
    let all = vec![
        Weekday::Mon,
        Weekday::Tue,
        Weekday::Wed,
        Weekday::Thu,
        Weekday::Fri,
        Weekday::Sat,
        Weekday::Sun,
    ];
    prop::sample::subsequence(all, 1..=7)
}

fn hhmm_strategy() -> impl Strategy<Value = String> {
    (0u32..24, 0u32..60).prop_map(|(h, m)| format!("{h:02}:{m:02}"))
}

fn schedule_strategy() -> impl Strategy<Value = ScheduleSpec> {
    (hhmm_strategy(), hhmm_strategy(), days_strategy()).prop_filter_map("start != end", |(start, end, days)| {
        if start == end {
            return None;
        }
        Some(ScheduleSpec {
            timezone: "UTC".to_string(),
            windows: vec![OffHourWindow {
                start,
                end,
                days_of_week: days,
            }],
        })
    })
}

proptest! {
    /// Property: `evaluate` always reports a `next_transition` strictly in
    /// the future relative to `now`, regardless of which window boundary it
    /// straddles. A reconciler that requeued for zero or negative time would
    /// busy-loop.
    #[test]
    fn prop_next_transition_is_always_in_the_future(
        schedule in schedule_strategy(),
        offset_minutes in 0i64..(7 * 24 * 60),
    ) {
        let now = Utc.with_ymd_and_hms(2026, 1, 5, 0, 0, 0).unwrap() + chrono::Duration::minutes(offset_minutes);
        let decision = schedule::evaluate(&schedule, &[], None, now);
        if let Ok(decision) = decision {
            prop_assert!(decision.next_transition > now);
        }
    }

    /// Property: evaluating the same inputs twice gives the same answer.
    /// The evaluator takes `now` as an explicit parameter precisely so it has
    /// no hidden clock dependency.
    #[test]
    fn prop_evaluate_is_pure(
        schedule in schedule_strategy(),
        offset_minutes in 0i64..(7 * 24 * 60),
    ) {
        let now = Utc.with_ymd_and_hms(2026, 1, 5, 0, 0, 0).unwrap() + chrono::Duration::minutes(offset_minutes);
        let first = schedule::evaluate(&schedule, &[], None, now).ok();
        let second = schedule::evaluate(&schedule, &[], None, now).ok();
        prop_assert_eq!(first, second);
    }

    /// Property: an `Extend` exception covering `now` always forces the
    /// `Active` state, overriding whatever the base schedule says.
    #[test]
    fn prop_active_extend_exception_always_wins(
        schedule in schedule_strategy(),
        offset_minutes in 0i64..(7 * 24 * 60),
    ) {
        let now = Utc.with_ymd_and_hms(2026, 1, 5, 0, 0, 0).unwrap() + chrono::Duration::minutes(offset_minutes);
        let exception = ExceptionInput {
            exception_type: ExceptionType::Extend,
            state: ExceptionPhase::Active,
            valid_from: now - chrono::Duration::hours(1),
            valid_until: now + chrono::Duration::hours(1),
            lead_time: None,
            windows: vec![],
        };
        let decision = schedule::evaluate(&schedule, &[exception], None, now);
        if let Ok(decision) = decision {
            prop_assert_eq!(decision.state, schedule::ScheduleState::Active);
        }
    }
}
