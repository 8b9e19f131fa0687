//! Recurrence expansion: turns a root session range plus a rule into the
//! child occurrences of a series.
//!
//! Supports: daily, weekly, biweekly, monthly and custom
//! (weekday / day-of-month) patterns, each stepping by `interval` units.
//! Every occurrence is computed from the root, not from its predecessor, so
//! long series do not drift.

use chrono::{Datelike, Days, Duration, Months, NaiveDate, TimeZone};
use slotwise_core::config::{MonthlyAdvance, SchedulingConfig};
use slotwise_core::error::{Result, SlotwiseError};
use slotwise_core::types::{RecurrencePattern, RecurrenceRule, Timestamp};

use crate::interval::TimeRange;

/// Expands recurrence rules into bounded occurrence lists.
#[derive(Debug, Clone)]
pub struct RecurrenceExpander {
    default_max_occurrences: u32,
    max_series_occurrences: u32,
    monthly: MonthlyAdvance,
}

impl RecurrenceExpander {
    pub fn new(config: &SchedulingConfig) -> Self {
        Self {
            default_max_occurrences: config.default_max_occurrences,
            max_series_occurrences: config.max_series_occurrences,
            monthly: config.monthly_advance,
        }
    }

    /// Occurrences strictly after `root`, in ascending order, each as long as `root`.
    pub fn expand(
        &self,
        root: &TimeRange,
        pattern: RecurrencePattern,
        rule: &RecurrenceRule,
    ) -> Result<Vec<TimeRange>> {
        if !pattern.is_recurring() {
            return Ok(Vec::new());
        }
        let limit = self.validate(root, pattern, rule)?;

        let occurrences = match pattern {
            RecurrencePattern::None => Vec::new(),
            RecurrencePattern::Custom => self.expand_custom(root, rule, limit)?,
            _ => self.expand_stepped(root, pattern, rule, limit)?,
        };

        if rule.max_occurrences.is_none()
            && rule.end_date.is_some()
            && occurrences.len() as u32 == self.max_series_occurrences
        {
            tracing::warn!(
                "⚠️ Series expansion truncated at {} occurrences before reaching end date",
                self.max_series_occurrences
            );
        }

        ensure_disjoint(root, &occurrences)?;
        tracing::debug!(
            "🔁 Expanded {} pattern into {} occurrence(s)",
            pattern.as_str(),
            occurrences.len()
        );
        Ok(occurrences)
    }

    /// Check the rule and return how many occurrences it may produce.
    fn validate(
        &self,
        root: &TimeRange,
        pattern: RecurrencePattern,
        rule: &RecurrenceRule,
    ) -> Result<u32> {
        if rule.interval == 0 {
            return Err(SlotwiseError::validation("recurrence interval must be at least 1"));
        }
        if let Some(max) = rule.max_occurrences {
            if max == 0 {
                return Err(SlotwiseError::validation(
                    "recurrence max_occurrences must be at least 1",
                ));
            }
            if max > self.max_series_occurrences {
                return Err(SlotwiseError::validation(format!(
                    "recurrence max_occurrences {max} exceeds the limit of {}",
                    self.max_series_occurrences
                )));
            }
        }
        if let Some(end) = rule.end_date
            && end < root.start().date_naive()
        {
            return Err(SlotwiseError::validation(format!(
                "recurrence end date {end} is before the first session"
            )));
        }
        if pattern == RecurrencePattern::Custom {
            if rule.days_of_week.is_empty() && rule.days_of_month.is_empty() {
                return Err(SlotwiseError::validation(
                    "custom recurrence needs days_of_week or days_of_month",
                ));
            }
            if rule.days_of_month.iter().any(|d| !(1..=31).contains(d)) {
                return Err(SlotwiseError::validation("days_of_month must be within 1..=31"));
            }
        }

        Ok(match (rule.max_occurrences, rule.end_date) {
            (Some(max), _) => max,
            (None, Some(_)) => self.max_series_occurrences,
            (None, None) => self.default_max_occurrences,
        })
    }

    fn expand_stepped(
        &self,
        root: &TimeRange,
        pattern: RecurrencePattern,
        rule: &RecurrenceRule,
        limit: u32,
    ) -> Result<Vec<TimeRange>> {
        let length = root.duration();
        let mut out = Vec::with_capacity(limit as usize);

        for n in 1..=limit {
            let start = self.nth_start(root.start(), pattern, rule.interval, n)?;
            if past_end(rule.end_date, start) {
                break;
            }
            out.push(TimeRange::starting_at(start, length)?);
        }
        Ok(out)
    }

    /// Start of the n-th occurrence after `root`.
    fn nth_start(
        &self,
        root: Timestamp,
        pattern: RecurrencePattern,
        interval: u32,
        n: u32,
    ) -> Result<Timestamp> {
        let steps = i64::from(interval) * i64::from(n);
        let after = |step: Option<Duration>| step.and_then(|d| root.checked_add_signed(d));
        let start = match pattern {
            RecurrencePattern::Daily => after(Duration::try_days(steps)),
            RecurrencePattern::Weekly => after(Duration::try_weeks(steps)),
            RecurrencePattern::Biweekly => after(Duration::try_weeks(2 * steps)),
            RecurrencePattern::Monthly => match self.monthly {
                MonthlyAdvance::Calendar => u32::try_from(steps)
                    .ok()
                    .and_then(|m| root.checked_add_months(Months::new(m))),
                MonthlyAdvance::Fixed30Days => after(Duration::try_days(30 * steps)),
            },
            RecurrencePattern::None | RecurrencePattern::Custom => None,
        };
        start.ok_or_else(|| SlotwiseError::validation("recurrence runs past the supported date range"))
    }

    /// Jump through matching weeks and months, keeping the root's local time of day.
    fn expand_custom(
        &self,
        root: &TimeRange,
        rule: &RecurrenceRule,
        limit: u32,
    ) -> Result<Vec<TimeRange>> {
        let length = root.duration();
        let offset = *root.start().offset();
        let first_day = root.start().date_naive();
        let time_of_day = root.start().time();

        let mut days = Vec::new();
        let mut exhausted = false;
        if !rule.days_of_week.is_empty() {
            let (hits, overflow) = weekday_hits(rule, first_day, limit);
            days.extend(hits);
            exhausted |= overflow;
        }
        if !rule.days_of_month.is_empty() {
            let (hits, overflow) = month_day_hits(rule, first_day, limit);
            days.extend(hits);
            exhausted |= overflow;
        }
        days.sort();
        days.dedup();
        days.truncate(limit as usize);

        if exhausted && (days.len() as u32) < limit {
            return Err(SlotwiseError::validation("recurrence runs past the supported date range"));
        }
        if days.is_empty() {
            return Err(SlotwiseError::validation(
                "custom recurrence matches no dates after the first session",
            ));
        }

        days.into_iter()
            .map(|day| {
                let start = offset
                    .from_local_datetime(&day.and_time(time_of_day))
                    .single()
                    .ok_or_else(|| SlotwiseError::validation("ambiguous local time in recurrence"))?;
                TimeRange::starting_at(start, length)
            })
            .collect()
    }
}

/// Up to `limit` weekday matches after `first_day`, every `interval` weeks
/// counted from the root's week. The flag is set when the calendar ran out.
fn weekday_hits(rule: &RecurrenceRule, first_day: NaiveDate, limit: u32) -> (Vec<NaiveDate>, bool) {
    let mut weekdays: Vec<u64> = rule
        .days_of_week
        .iter()
        .map(|d| u64::from(d.num_days_from_monday()))
        .collect();
    weekdays.sort_unstable();
    weekdays.dedup();

    let back = u64::from(first_day.weekday().num_days_from_monday());
    let Some(week_zero) = first_day.checked_sub_days(Days::new(back)) else {
        return (Vec::new(), true);
    };
    let step = 7 * u64::from(rule.interval);

    let mut out = Vec::new();
    // Every week after the first yields at least one hit.
    for w in 0..=u64::from(limit) {
        let Some(week) = w.checked_mul(step).and_then(|d| week_zero.checked_add_days(Days::new(d))) else {
            return (out, true);
        };
        for &wd in &weekdays {
            let Some(day) = week.checked_add_days(Days::new(wd)) else {
                return (out, true);
            };
            if day <= first_day {
                continue;
            }
            if rule.end_date.is_some_and(|end| day > end) {
                return (out, false);
            }
            out.push(day);
            if out.len() as u32 == limit {
                return (out, false);
            }
        }
    }
    (out, false)
}

/// Up to `limit` day-of-month matches after `first_day`, every `interval`
/// months counted from the root's month. Days a month lacks are skipped.
fn month_day_hits(rule: &RecurrenceRule, first_day: NaiveDate, limit: u32) -> (Vec<NaiveDate>, bool) {
    let mut month_days = rule.days_of_month.clone();
    month_days.sort_unstable();
    month_days.dedup();

    let Some(month_zero) = first_day.with_day(1) else {
        return (Vec::new(), false);
    };
    let step = u64::from(rule.interval);

    let mut out = Vec::new();
    // The 29th-31st can miss most sampled months, so allow a year of misses per hit.
    for m in 0..(u64::from(limit) + 1) * 12 {
        let Some(month) = u32::try_from(m * step)
            .ok()
            .and_then(|n| month_zero.checked_add_months(Months::new(n)))
        else {
            return (out, true);
        };
        if rule.end_date.is_some_and(|end| month > end) {
            return (out, false);
        }
        for &d in &month_days {
            let Some(day) = month.with_day(d) else {
                continue;
            };
            if day <= first_day {
                continue;
            }
            if rule.end_date.is_some_and(|end| day > end) {
                return (out, false);
            }
            out.push(day);
            if out.len() as u32 == limit {
                return (out, false);
            }
        }
    }
    (out, false)
}

fn past_end(end_date: Option<NaiveDate>, start: Timestamp) -> bool {
    end_date.is_some_and(|end| start.date_naive() > end)
}

/// A series whose sessions run into each other cannot be booked.
fn ensure_disjoint(root: &TimeRange, occurrences: &[TimeRange]) -> Result<()> {
    let mut prev = root;
    for occ in occurrences {
        if prev.overlaps(occ) {
            return Err(SlotwiseError::validation(format!(
                "recurring sessions overlap each other ({} and {}); the session is longer than the recurrence step",
                prev.start().to_rfc3339(),
                occ.start().to_rfc3339()
            )));
        }
        prev = occ;
    }
    Ok(())
}
