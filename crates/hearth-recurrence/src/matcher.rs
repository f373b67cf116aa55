use std::ops::ControlFlow;

use chrono::{Datelike, Days, NaiveDate};

use crate::pattern::{EndCondition, PatternKind, RecurrencePattern};

/// How far [`next_occurrence_after`] looks before giving up.
pub const LOOKAHEAD_DAYS: u64 = 365;

/// Caller-supplied predicate for [`PatternKind::Custom`] patterns.
pub trait CustomRule {
    fn matches(&self, candidate: NaiveDate, series_start: NaiveDate) -> bool;
}

impl<F> CustomRule for F
where
    F: Fn(NaiveDate, NaiveDate) -> bool,
{
    fn matches(&self, candidate: NaiveDate, series_start: NaiveDate) -> bool {
        self(candidate, series_start)
    }
}

/// Rule used when the caller has none: custom patterns never match.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCustomRule;

impl CustomRule for NoCustomRule {
    fn matches(&self, _candidate: NaiveDate, _series_start: NaiveDate) -> bool {
        false
    }
}

pub fn is_occurrence(
    pattern: &RecurrencePattern,
    candidate: NaiveDate,
    series_start: NaiveDate,
) -> bool {
    is_occurrence_with(pattern, candidate, series_start, &NoCustomRule)
}

/// Answers whether `pattern`, started on `series_start`, occurs on `candidate`.
///
/// With [`EndCondition::AfterCount`] only valid occurrences are counted: the
/// candidate matches when it satisfies every other rule and fewer than `n`
/// earlier dates since `series_start` did.
pub fn is_occurrence_with<R>(
    pattern: &RecurrencePattern,
    candidate: NaiveDate,
    series_start: NaiveDate,
    rule: &R,
) -> bool
where
    R: CustomRule + ?Sized,
{
    if !within_bounds(pattern, candidate, series_start)
        || !matches_rule(pattern, candidate, series_start, rule)
    {
        return false;
    }
    match pattern.end() {
        EndCondition::AfterCount(limit) => {
            count_before(pattern, series_start, candidate, rule, limit) < limit
        }
        EndCondition::Never | EndCondition::OnDate(_) => true,
    }
}

pub fn next_occurrence_after(
    pattern: &RecurrencePattern,
    from: NaiveDate,
    series_start: NaiveDate,
) -> Option<NaiveDate> {
    next_occurrence_after_with(pattern, from, series_start, &NoCustomRule)
}

/// First occurrence strictly after `from`, looking at most [`LOOKAHEAD_DAYS`] ahead.
pub fn next_occurrence_after_with<R>(
    pattern: &RecurrencePattern,
    from: NaiveDate,
    series_start: NaiveDate,
    rule: &R,
) -> Option<NaiveDate>
where
    R: CustomRule + ?Sized,
{
    let first = from.succ_opt()?;
    let last = from
        .checked_add_days(Days::new(LOOKAHEAD_DAYS))
        .unwrap_or(NaiveDate::MAX);

    let mut found = None;
    scan(pattern, series_start, first, last, rule, |day| {
        found = Some(day);
        ControlFlow::Break(())
    });
    found
}

pub fn occurrences_in_range(
    pattern: &RecurrencePattern,
    series_start: NaiveDate,
    range_start: NaiveDate,
    range_end: NaiveDate,
) -> Vec<NaiveDate> {
    occurrences_in_range_with(pattern, series_start, range_start, range_end, &NoCustomRule)
}

/// Every occurrence in `range_start..=range_end`. Empty and reversed ranges yield nothing.
pub fn occurrences_in_range_with<R>(
    pattern: &RecurrencePattern,
    series_start: NaiveDate,
    range_start: NaiveDate,
    range_end: NaiveDate,
    rule: &R,
) -> Vec<NaiveDate>
where
    R: CustomRule + ?Sized,
{
    let mut dates = Vec::new();
    scan(pattern, series_start, range_start, range_end, rule, |day| {
        dates.push(day);
        ControlFlow::Continue(())
    });
    dates
}

/// Walks `from..=to` once, feeding occurrences to `visit`.
///
/// The occurrence count for `AfterCount` is seeded once for the window start
/// and then carried along, so a walk never re-counts from the series start.
fn scan<R, F>(
    pattern: &RecurrencePattern,
    series_start: NaiveDate,
    from: NaiveDate,
    to: NaiveDate,
    rule: &R,
    mut visit: F,
) where
    R: CustomRule + ?Sized,
    F: FnMut(NaiveDate) -> ControlFlow<()>,
{
    let from = from.max(series_start);
    if from > to {
        return;
    }

    let limit = match pattern.end() {
        EndCondition::AfterCount(limit) => Some(limit),
        EndCondition::Never | EndCondition::OnDate(_) => None,
    };
    let mut seen = match limit {
        Some(limit) => count_before(pattern, series_start, from, rule, limit),
        None => 0,
    };

    for day in from.iter_days() {
        if day > to {
            break;
        }
        if !within_bounds(pattern, day, series_start) {
            // Only an on_date end condition can fail here once day >= series_start.
            break;
        }
        if !matches_rule(pattern, day, series_start, rule) {
            continue;
        }
        if let Some(limit) = limit {
            if seen >= limit {
                break;
            }
            seen += 1;
        }
        if visit(day).is_break() {
            break;
        }
    }
}

fn within_bounds(pattern: &RecurrencePattern, candidate: NaiveDate, series_start: NaiveDate) -> bool {
    if candidate < series_start {
        return false;
    }
    match pattern.end() {
        EndCondition::OnDate(end) => candidate <= end,
        EndCondition::Never | EndCondition::AfterCount(_) => true,
    }
}

/// The kind-specific rule, ignoring end conditions. Assumes `candidate >= series_start`.
fn matches_rule<R>(
    pattern: &RecurrencePattern,
    candidate: NaiveDate,
    series_start: NaiveDate,
    rule: &R,
) -> bool
where
    R: CustomRule + ?Sized,
{
    let interval = i64::from(pattern.interval());
    let elapsed_days = (candidate - series_start).num_days();

    match pattern.kind() {
        PatternKind::None => candidate == series_start,
        PatternKind::Daily => elapsed_days >= 0 && elapsed_days % interval == 0,
        PatternKind::Weekly => {
            let elapsed_weeks = elapsed_days / 7;
            if elapsed_weeks % interval != 0 {
                return false;
            }
            let weekday = weekday_index(candidate);
            if pattern.days_of_week().is_empty() {
                weekday == weekday_index(series_start)
            } else {
                pattern.days_of_week().contains(&weekday)
            }
        }
        PatternKind::Monthly => {
            let elapsed_months = month_index(candidate) - month_index(series_start);
            if elapsed_months < 0 || elapsed_months % interval != 0 {
                return false;
            }
            let day = candidate.day() as u8;
            if pattern.days_of_month().is_empty() {
                day == series_start.day() as u8
            } else {
                pattern.days_of_month().contains(&day)
            }
        }
        PatternKind::Custom => rule.matches(candidate, series_start),
    }
}

/// Valid occurrences in `series_start..before`, saturating at `limit`.
fn count_before<R>(
    pattern: &RecurrencePattern,
    series_start: NaiveDate,
    before: NaiveDate,
    rule: &R,
    limit: u32,
) -> u32
where
    R: CustomRule + ?Sized,
{
    let counted = series_start
        .iter_days()
        .take_while(|day| *day < before)
        .filter(|day| matches_rule(pattern, *day, series_start, rule))
        .take(limit as usize)
        .count();
    counted as u32
}

/// 0 is Sunday.
fn weekday_index(date: NaiveDate) -> u8 {
    date.weekday().num_days_from_sunday() as u8
}

fn month_index(date: NaiveDate) -> i64 {
    i64::from(date.year()) * 12 + i64::from(date.month0())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(year: i32, month: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(year, month, day).unwrap()
    }

    fn daily(interval: u32) -> RecurrencePattern {
        RecurrencePattern::builder(PatternKind::Daily)
            .every(interval)
            .build()
            .unwrap()
    }

    #[test]
    fn nothing_occurs_before_series_start() {
        let start = date(2024, 3, 10);
        assert!(!is_occurrence(&daily(1), date(2024, 3, 9), start));
        assert!(!is_occurrence(&RecurrencePattern::once(), date(2024, 3, 9), start));
    }

    #[test]
    fn one_off_matches_only_its_start() {
        let start = date(2024, 3, 10);
        let once = RecurrencePattern::once();
        assert!(is_occurrence(&once, start, start));
        assert!(!is_occurrence(&once, date(2024, 3, 11), start));
        assert_eq!(occurrences_in_range(&once, start, start, start), vec![start]);
        assert_eq!(next_occurrence_after(&once, start, start), None);
    }

    #[test]
    fn daily_interval_hits_every_kth_day() {
        let start = date(2024, 1, 1);
        for k in 1..=5u32 {
            let pattern = daily(k);
            for offset in 0..60u64 {
                let candidate = start.checked_add_days(Days::new(offset)).unwrap();
                assert_eq!(
                    is_occurrence(&pattern, candidate, start),
                    offset % u64::from(k) == 0,
                    "interval {k} offset {offset}"
                );
            }
        }
    }

    #[test]
    fn weekdays_pattern_skips_weekends() {
        // 2024-01-01 is a Monday.
        let start = date(2024, 1, 1);
        let pattern = RecurrencePattern::builder(PatternKind::Weekly)
            .on_weekdays([1, 2, 3, 4, 5])
            .build()
            .unwrap();
        for candidate in start.iter_days().take(28) {
            let weekend = matches!(weekday_index(candidate), 0 | 6);
            assert_eq!(is_occurrence(&pattern, candidate, start), !weekend, "{candidate}");
        }
    }

    #[test]
    fn weekly_without_days_follows_start_weekday() {
        // 2024-01-03 is a Wednesday.
        let start = date(2024, 1, 3);
        let biweekly = RecurrencePattern::builder(PatternKind::Weekly)
            .every(2)
            .build()
            .unwrap();
        assert_eq!(
            occurrences_in_range(&biweekly, start, start, date(2024, 2, 1)),
            vec![date(2024, 1, 3), date(2024, 1, 17), date(2024, 1, 31)]
        );
    }

    #[test]
    fn weekly_weeks_are_counted_from_series_start() {
        // Monday 2024-01-08 is day 5 after Wednesday 2024-01-03, so still week 0.
        let start = date(2024, 1, 3);
        let pattern = RecurrencePattern::builder(PatternKind::Weekly)
            .every(2)
            .on_weekdays([1])
            .build()
            .unwrap();
        assert!(is_occurrence(&pattern, date(2024, 1, 8), start));
        assert!(!is_occurrence(&pattern, date(2024, 1, 15), start));
        assert!(is_occurrence(&pattern, date(2024, 1, 22), start));
    }

    #[test]
    fn monthly_day_31_skips_short_months() {
        let start = date(2024, 1, 31);
        let pattern = RecurrencePattern::builder(PatternKind::Monthly)
            .on_month_days([31])
            .build()
            .unwrap();
        assert_eq!(
            occurrences_in_range(&pattern, start, date(2024, 1, 1), date(2024, 4, 30)),
            vec![date(2024, 1, 31), date(2024, 3, 31)]
        );
        assert_eq!(
            next_occurrence_after(&pattern, start, start),
            Some(date(2024, 3, 31))
        );
    }

    #[test]
    fn monthly_without_days_uses_start_day_and_interval() {
        let start = date(2024, 1, 15);
        let quarterly = RecurrencePattern::builder(PatternKind::Monthly)
            .every(3)
            .build()
            .unwrap();
        assert_eq!(
            occurrences_in_range(&quarterly, start, start, date(2024, 12, 31)),
            vec![
                date(2024, 1, 15),
                date(2024, 4, 15),
                date(2024, 7, 15),
                date(2024, 10, 15)
            ]
        );
    }

    #[test]
    fn on_date_end_is_inclusive() {
        let start = date(2024, 1, 1);
        let pattern = RecurrencePattern::builder(PatternKind::Daily)
            .ending(EndCondition::OnDate(date(2024, 1, 5)))
            .build()
            .unwrap();
        assert!(is_occurrence(&pattern, date(2024, 1, 5), start));
        assert!(!is_occurrence(&pattern, date(2024, 1, 6), start));
        assert_eq!(
            occurrences_in_range(&pattern, start, start, date(2024, 1, 31)).len(),
            5
        );
        assert_eq!(next_occurrence_after(&pattern, date(2024, 1, 5), start), None);
    }

    #[test]
    fn after_count_counts_only_valid_occurrences() {
        let start = date(2024, 1, 1);
        let pattern = RecurrencePattern::builder(PatternKind::Weekly)
            .on_weekdays([1, 2, 3, 4, 5])
            .ending(EndCondition::AfterCount(5))
            .build()
            .unwrap();
        assert!(is_occurrence(&pattern, date(2024, 1, 5), start));
        assert!(!is_occurrence(&pattern, date(2024, 1, 8), start));
        assert_eq!(
            occurrences_in_range(&pattern, start, date(2024, 1, 3), date(2024, 1, 31)),
            vec![date(2024, 1, 3), date(2024, 1, 4), date(2024, 1, 5)]
        );
        assert_eq!(next_occurrence_after(&pattern, date(2024, 1, 5), start), None);
    }

    #[test]
    fn after_count_agrees_between_point_and_range_queries() {
        let start = date(2024, 1, 1);
        let pattern = RecurrencePattern::builder(PatternKind::Daily)
            .every(2)
            .ending(EndCondition::AfterCount(3))
            .build()
            .unwrap();
        let ranged = occurrences_in_range(&pattern, start, start, date(2024, 2, 1));
        let pointwise: Vec<_> = start
            .iter_days()
            .take(32)
            .filter(|day| is_occurrence(&pattern, *day, start))
            .collect();
        assert_eq!(ranged, vec![date(2024, 1, 1), date(2024, 1, 3), date(2024, 1, 5)]);
        assert_eq!(ranged, pointwise);
    }

    #[test]
    fn next_occurrence_is_strictly_after_from() {
        let start = date(2024, 1, 1);
        let pattern = daily(1);
        for from in start.iter_days().take(10) {
            let next = next_occurrence_after(&pattern, from, start).unwrap();
            assert!(next > from);
            assert_eq!(next, from.succ_opt().unwrap());
        }
        // Before the series starts the first hit is the start itself.
        assert_eq!(
            next_occurrence_after(&pattern, date(2023, 12, 1), start),
            Some(start)
        );
    }

    #[test]
    fn next_occurrence_gives_up_after_lookahead() {
        // A 29 February series every 12 months next lands in 2028.
        let start = date(2024, 2, 29);
        let yearly = RecurrencePattern::builder(PatternKind::Monthly)
            .every(12)
            .build()
            .unwrap();
        assert_eq!(next_occurrence_after(&yearly, start, start), None);

        // Exactly 365 days ahead is still inside the window.
        let start = date(2022, 3, 1);
        assert_eq!(
            next_occurrence_after(&yearly, start, start),
            Some(date(2023, 3, 1))
        );
    }

    #[test]
    fn empty_or_reversed_ranges_yield_nothing() {
        let start = date(2024, 1, 1);
        let pattern = daily(1);
        assert!(occurrences_in_range(&pattern, start, date(2024, 2, 1), date(2024, 1, 1)).is_empty());
        assert!(occurrences_in_range(&pattern, start, date(2023, 1, 1), date(2023, 12, 31)).is_empty());
    }

    #[test]
    fn custom_patterns_need_a_rule() {
        let start = date(2024, 1, 1);
        let pattern = RecurrencePattern::builder(PatternKind::Custom).build().unwrap();
        assert!(!is_occurrence(&pattern, date(2024, 1, 15), start));

        let fifteenth = |candidate: NaiveDate, _start: NaiveDate| candidate.day() == 15;
        assert!(is_occurrence_with(&pattern, date(2024, 1, 15), start, &fifteenth));
        assert_eq!(
            occurrences_in_range_with(&pattern, start, start, date(2024, 3, 31), &fifteenth),
            vec![date(2024, 1, 15), date(2024, 2, 15), date(2024, 3, 15)]
        );
        assert_eq!(
            next_occurrence_after_with(&pattern, date(2024, 1, 15), start, &fifteenth),
            Some(date(2024, 2, 15))
        );
    }
}
