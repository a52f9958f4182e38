//! Weekly recurring availability patterns and the slot grid they are cut on.
//!
//! Expansion is a pure function of its inputs: the reference date is always
//! passed in, never read from the clock.

use chrono::{Datelike, Days, NaiveDate, NaiveTime, Timelike};

use crate::limits::MAX_WEEK_COUNT;
use crate::model::{Ms, Span};
use crate::normalize::{ValidationError, parse_time};

const MINUTE_MS: Ms = 60_000;

/// The canonical grid of bookable slots within a day.
///
/// Grid points run from `first` to `last` inclusive in `step` increments;
/// each cell is `[point, point + step)`, so the last point is only ever an
/// end boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotGrid {
    first_minute: u32,
    last_minute: u32,
    step_minutes: u32,
}

impl Default for SlotGrid {
    /// 08:00–21:00 in 30-minute cells.
    fn default() -> Self {
        Self {
            first_minute: 8 * 60,
            last_minute: 21 * 60,
            step_minutes: 30,
        }
    }
}

impl SlotGrid {
    pub fn new(first: NaiveTime, last: NaiveTime, step_minutes: u32) -> Result<Self, String> {
        if first.second() != 0 || last.second() != 0 {
            return Err("grid bounds must be whole minutes".into());
        }
        let first_minute = first.num_seconds_from_midnight() / 60;
        let last_minute = last.num_seconds_from_midnight() / 60;
        if step_minutes == 0 {
            return Err("grid step must be positive".into());
        }
        if first_minute >= last_minute {
            return Err(format!("grid start {first} must be before grid end {last}"));
        }
        if (last_minute - first_minute) % step_minutes != 0 {
            return Err(format!(
                "grid {first}-{last} is not a whole number of {step_minutes}-minute steps"
            ));
        }
        Ok(Self {
            first_minute,
            last_minute,
            step_minutes,
        })
    }

    pub fn step_ms(&self) -> Ms {
        self.step_minutes as Ms * MINUTE_MS
    }

    /// Number of cells in one day.
    pub fn cells_per_day(&self) -> u32 {
        (self.last_minute - self.first_minute) / self.step_minutes
    }

    /// Index of a grid point (`0..=cells_per_day`), if `time` is one.
    pub fn index_of(&self, time: NaiveTime) -> Option<u32> {
        let secs = time.num_seconds_from_midnight();
        if secs % 60 != 0 || time.nanosecond() != 0 {
            return None;
        }
        let minute = secs / 60;
        if minute < self.first_minute || minute > self.last_minute {
            return None;
        }
        let offset = minute - self.first_minute;
        (offset % self.step_minutes == 0).then_some(offset / self.step_minutes)
    }

    /// Index of the cell starting at `time`.
    pub fn cell_index_of(&self, time: NaiveTime) -> Option<u32> {
        self.index_of(time).filter(|&i| i < self.cells_per_day())
    }

    fn point_ms(&self, date: NaiveDate, index: u32) -> Ms {
        let minute = self.first_minute + index * self.step_minutes;
        date.and_time(NaiveTime::MIN).and_utc().timestamp_millis() + minute as Ms * MINUTE_MS
    }
}

/// "Every `weekday` from `start_time` to `end_time`, for `week_count` weeks."
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeeklyPattern {
    /// 0 = Sunday … 6 = Saturday.
    pub weekday: u8,
    pub start_time: String,
    pub end_time: String,
    pub week_count: u32,
}

impl WeeklyPattern {
    /// Concrete spans, one per grid cell per occurrence, in chronological order.
    ///
    /// The first occurrence is the first date on or after `today` that falls
    /// on `weekday`.
    pub fn expand(&self, today: NaiveDate, grid: &SlotGrid) -> Result<Vec<Span>, ValidationError> {
        if self.week_count > MAX_WEEK_COUNT {
            return Err(ValidationError::Unparseable(format!(
                "week_count {} exceeds {MAX_WEEK_COUNT}",
                self.week_count
            )));
        }
        if self.weekday > 6 {
            return Err(ValidationError::Unparseable(format!(
                "weekday {} not in 0..=6",
                self.weekday
            )));
        }
        let start_idx = grid_point(grid, "start_time", &self.start_time)?;
        let end_idx = grid_point(grid, "end_time", &self.end_time)?;
        if start_idx >= end_idx {
            return Err(ValidationError::InvertedRange {
                start: grid.point_ms(today, start_idx),
                end: grid.point_ms(today, end_idx),
            });
        }

        let today_wd = today.weekday().num_days_from_sunday();
        let days_ahead = (u32::from(self.weekday) + 7 - today_wd) % 7;

        let per_day = (end_idx - start_idx) as usize;
        let mut spans = Vec::with_capacity(per_day * self.week_count as usize);
        for week in 0..self.week_count {
            let offset = u64::from(days_ahead) + 7 * u64::from(week);
            let date = today.checked_add_days(Days::new(offset)).ok_or_else(|| {
                ValidationError::Unparseable(format!("week {week} is past the calendar range"))
            })?;
            for idx in start_idx..end_idx {
                spans.push(Span::new(
                    grid.point_ms(date, idx),
                    grid.point_ms(date, idx + 1),
                ));
            }
        }
        Ok(spans)
    }
}

fn grid_point(grid: &SlotGrid, field: &'static str, raw: &str) -> Result<u32, ValidationError> {
    let time = parse_time(field, raw)?;
    grid.index_of(time).ok_or_else(|| {
        ValidationError::Unparseable(format!("{field}: {raw:?} is not on the slot grid"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const H: Ms = 3_600_000;
    const M: Ms = 60_000;
    const DAY: Ms = 24 * H;
    /// 2024-06-03T00:00:00Z (a Monday)
    const JUNE_3: Ms = 1_717_372_800_000;

    fn pattern(weekday: u8, start: &str, end: &str, weeks: u32) -> WeeklyPattern {
        WeeklyPattern {
            weekday,
            start_time: start.into(),
            end_time: end.into(),
            week_count: weeks,
        }
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn two_mondays_two_cells_each() {
        // Today is Saturday 2024-06-01; next Monday is 06-03.
        let spans = pattern(1, "09:00", "10:00", 2)
            .expand(date(2024, 6, 1), &SlotGrid::default())
            .unwrap();
        assert_eq!(
            spans,
            vec![
                Span::new(JUNE_3 + 9 * H, JUNE_3 + 9 * H + 30 * M),
                Span::new(JUNE_3 + 9 * H + 30 * M, JUNE_3 + 10 * H),
                Span::new(JUNE_3 + 7 * DAY + 9 * H, JUNE_3 + 7 * DAY + 9 * H + 30 * M),
                Span::new(JUNE_3 + 7 * DAY + 9 * H + 30 * M, JUNE_3 + 7 * DAY + 10 * H),
            ]
        );
    }

    #[test]
    fn same_day_counts_as_first_occurrence() {
        let spans = pattern(1, "09:00", "09:30", 1)
            .expand(date(2024, 6, 3), &SlotGrid::default())
            .unwrap();
        assert_eq!(spans, vec![Span::new(JUNE_3 + 9 * H, JUNE_3 + 9 * H + 30 * M)]);
    }

    #[test]
    fn day_after_rolls_to_next_week() {
        // Tuesday 06-04 asking for Mondays → 06-10.
        let spans = pattern(1, "09:00", "09:30", 1)
            .expand(date(2024, 6, 4), &SlotGrid::default())
            .unwrap();
        assert_eq!(spans[0].start, JUNE_3 + 7 * DAY + 9 * H);
    }

    #[test]
    fn sunday_is_zero() {
        // 2024-06-09 is a Sunday.
        let spans = pattern(0, "08:00", "08:30", 1)
            .expand(date(2024, 6, 3), &SlotGrid::default())
            .unwrap();
        assert_eq!(spans[0].start, JUNE_3 + 6 * DAY + 8 * H);
    }

    #[test]
    fn expansion_is_repeatable() {
        let p = pattern(3, "08:00", "21:00", 8);
        let grid = SlotGrid::default();
        let today = date(2024, 2, 27);
        let first = p.expand(today, &grid).unwrap();
        let second = p.expand(today, &grid).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 8 * 26);
    }

    #[test]
    fn inverted_and_empty_patterns_rejected() {
        let grid = SlotGrid::default();
        assert!(matches!(
            pattern(1, "10:00", "09:00", 1).expand(date(2024, 6, 3), &grid),
            Err(ValidationError::InvertedRange { .. })
        ));
        assert!(matches!(
            pattern(1, "10:00", "10:00", 1).expand(date(2024, 6, 3), &grid),
            Err(ValidationError::InvertedRange { .. })
        ));
    }

    #[test]
    fn off_grid_and_bad_weekday_rejected() {
        let grid = SlotGrid::default();
        let today = date(2024, 6, 3);
        assert!(matches!(
            pattern(1, "09:10", "10:00", 1).expand(today, &grid),
            Err(ValidationError::Unparseable(_))
        ));
        assert!(matches!(
            pattern(1, "06:00", "10:00", 1).expand(today, &grid),
            Err(ValidationError::Unparseable(_))
        ));
        assert!(matches!(
            pattern(7, "09:00", "10:00", 1).expand(today, &grid),
            Err(ValidationError::Unparseable(_))
        ));
    }

    #[test]
    fn week_count_is_bounded_before_allocating() {
        let grid = SlotGrid::default();
        let today = date(2024, 6, 3);
        assert!(matches!(
            pattern(1, "08:00", "21:00", u32::MAX).expand(today, &grid),
            Err(ValidationError::Unparseable(_))
        ));
        assert!(matches!(
            pattern(1, "09:00", "10:00", MAX_WEEK_COUNT + 1).expand(today, &grid),
            Err(ValidationError::Unparseable(_))
        ));
        let spans = pattern(1, "09:00", "10:00", MAX_WEEK_COUNT)
            .expand(today, &grid)
            .unwrap();
        assert_eq!(spans.len(), 2 * MAX_WEEK_COUNT as usize);
    }

    #[test]
    fn grid_points_are_utc_milliseconds() {
        let grid = SlotGrid::default();
        assert_eq!(grid.point_ms(date(2024, 6, 3), 0), JUNE_3 + 8 * H);
        assert_eq!(grid.point_ms(date(1970, 1, 1), 2), 9 * H);
        // Before the epoch counts backwards from it.
        assert_eq!(grid.point_ms(date(1969, 12, 31), 0), -DAY + 8 * H);
    }

    #[test]
    fn zero_weeks_is_empty() {
        let spans = pattern(1, "09:00", "10:00", 0)
            .expand(date(2024, 6, 3), &SlotGrid::default())
            .unwrap();
        assert!(spans.is_empty());
    }

    #[test]
    fn custom_grid() {
        let grid = SlotGrid::new(
            NaiveTime::from_hms_opt(0, 0, 0).unwrap(),
            NaiveTime::from_hms_opt(23, 0, 0).unwrap(),
            60,
        )
        .unwrap();
        assert_eq!(grid.cells_per_day(), 23);
        let spans = pattern(1, "00:00", "03:00", 1)
            .expand(date(2024, 6, 3), &grid)
            .unwrap();
        assert_eq!(spans.len(), 3);
        assert_eq!(spans[2], Span::new(JUNE_3 + 2 * H, JUNE_3 + 3 * H));
    }

    #[test]
    fn grid_validation() {
        let t = |h, m| NaiveTime::from_hms_opt(h, m, 0).unwrap();
        assert!(SlotGrid::new(t(9, 0), t(9, 0), 30).is_err());
        assert!(SlotGrid::new(t(9, 0), t(10, 0), 0).is_err());
        assert!(SlotGrid::new(t(9, 0), t(10, 0), 45).is_err());
        assert!(SlotGrid::new(t(9, 0), t(10, 30), 45).is_ok());
    }

    #[test]
    fn grid_indexing() {
        let grid = SlotGrid::default();
        let t = |h, m| NaiveTime::from_hms_opt(h, m, 0).unwrap();
        assert_eq!(grid.cells_per_day(), 26);
        assert_eq!(grid.index_of(t(8, 0)), Some(0));
        assert_eq!(grid.index_of(t(21, 0)), Some(26));
        assert_eq!(grid.cell_index_of(t(21, 0)), None);
        assert_eq!(grid.index_of(t(8, 15)), None);
        assert_eq!(grid.index_of(t(21, 30)), None);
    }
}
