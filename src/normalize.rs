//! TimeSlot normalization: raw calendar input → half-open UTC `Span`.
//!
//! Everything is treated as UTC. There is no timezone handling here; callers
//! hand in instants that are already normalized.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime};

use crate::model::{Ms, Span};
use crate::recurrence::SlotGrid;

/// Raw slot input as it arrives from a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawSlot {
    /// One cell of the slot grid: `[date + time, date + time + step)`.
    Cell {
        date: Option<String>,
        time: Option<String>,
    },
    /// An explicit `[start, end)` pair of instants.
    Range {
        start: Option<String>,
        end: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    MissingField(&'static str),
    InvertedRange { start: Ms, end: Ms },
    Unparseable(String),
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::MissingField(field) => write!(f, "missing field: {field}"),
            ValidationError::InvertedRange { start, end } => {
                write!(f, "inverted range: end {end} is not after start {start}")
            }
            ValidationError::Unparseable(msg) => write!(f, "unparseable input: {msg}"),
        }
    }
}

impl std::error::Error for ValidationError {}

/// Canonicalize raw input into a `Span`.
pub fn normalize(raw: &RawSlot, grid: &SlotGrid) -> Result<Span, ValidationError> {
    match raw {
        RawSlot::Cell { date, time } => {
            let date = parse_date(required("date", date)?)?;
            let time = parse_time("time", required("time", time)?)?;
            if grid.cell_index_of(time).is_none() {
                return Err(ValidationError::Unparseable(format!(
                    "time {} is not a cell of the slot grid",
                    time.format("%H:%M")
                )));
            }
            let start = date.and_time(time).and_utc().timestamp_millis();
            normalize_range(start, start + grid.step_ms())
        }
        RawSlot::Range { start, end } => {
            let start = parse_instant("start", required("start", start)?)?;
            let end = parse_instant("end", required("end", end)?)?;
            normalize_range(start, end)
        }
    }
}

/// Build a span from numeric bounds, rejecting empty and inverted ranges.
pub fn normalize_range(start: Ms, end: Ms) -> Result<Span, ValidationError> {
    if end <= start {
        return Err(ValidationError::InvertedRange { start, end });
    }
    Ok(Span::new(start, end))
}

fn required<'a>(field: &'static str, value: &'a Option<String>) -> Result<&'a str, ValidationError> {
    match value.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(ValidationError::MissingField(field)),
    }
}

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
];

/// Parse an instant: Unix ms, RFC 3339, or naive ISO-8601 taken as UTC.
pub fn parse_instant(field: &'static str, s: &str) -> Result<Ms, ValidationError> {
    let s = s.trim();
    if let Ok(ms) = s.parse::<Ms>() {
        return Ok(ms);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.timestamp_millis());
    }
    // A bare `Z` without seconds (`2024-06-03T10:00Z`) is not RFC 3339.
    let naive = s.strip_suffix(['Z', 'z']).unwrap_or(s);
    for fmt in NAIVE_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(naive, fmt) {
            return Ok(dt.and_utc().timestamp_millis());
        }
    }
    Err(ValidationError::Unparseable(format!("{field}: bad instant {s:?}")))
}

pub fn parse_date(s: &str) -> Result<NaiveDate, ValidationError> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .map_err(|e| ValidationError::Unparseable(format!("date: {s:?}: {e}")))
}

/// Wall-clock time of day, `HH:MM` or `HH:MM:SS`.
pub fn parse_time(field: &'static str, s: &str) -> Result<NaiveTime, ValidationError> {
    let s = s.trim();
    NaiveTime::parse_from_str(s, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S"))
        .map_err(|e| ValidationError::Unparseable(format!("{field}: {s:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    const H: Ms = 3_600_000;
    const M: Ms = 60_000;
    /// 2024-06-03T00:00:00Z (a Monday)
    const JUNE_3: Ms = 1_717_372_800_000;

    fn range(start: &str, end: &str) -> RawSlot {
        RawSlot::Range {
            start: Some(start.into()),
            end: Some(end.into()),
        }
    }

    fn cell(date: &str, time: &str) -> RawSlot {
        RawSlot::Cell {
            date: Some(date.into()),
            time: Some(time.into()),
        }
    }

    #[test]
    fn range_rfc3339() {
        let span = normalize(
            &range("2024-06-03T09:00:00Z", "2024-06-03T09:30:00Z"),
            &SlotGrid::default(),
        )
        .unwrap();
        assert_eq!(span, Span::new(JUNE_3 + 9 * H, JUNE_3 + 9 * H + 30 * M));
    }

    #[test]
    fn range_with_offset_converted_to_utc() {
        let span = normalize(
            &range("2024-06-03T11:00:00+02:00", "2024-06-03T12:00:00+02:00"),
            &SlotGrid::default(),
        )
        .unwrap();
        assert_eq!(span, Span::new(JUNE_3 + 9 * H, JUNE_3 + 10 * H));
    }

    #[test]
    fn range_naive_iso_and_millis() {
        let grid = SlotGrid::default();
        let a = normalize(&range("2024-06-03T09:00", "2024-06-03 10:00:00"), &grid).unwrap();
        assert_eq!(a, Span::new(JUNE_3 + 9 * H, JUNE_3 + 10 * H));
        let b = normalize(&range("1000", "2000"), &grid).unwrap();
        assert_eq!(b, Span::new(1000, 2000));
    }

    #[test]
    fn inverted_range_rejected() {
        let err = normalize(
            &range("2024-06-03T10:00Z", "2024-06-03T09:00Z"),
            &SlotGrid::default(),
        );
        match err {
            Err(ValidationError::InvertedRange { start, end }) => {
                assert_eq!(start, JUNE_3 + 10 * H);
                assert_eq!(end, JUNE_3 + 9 * H);
            }
            other => panic!("expected InvertedRange, got {other:?}"),
        }
    }

    #[test]
    fn zero_length_range_rejected() {
        let err = normalize(&range("5000", "5000"), &SlotGrid::default()).unwrap_err();
        assert_eq!(err, ValidationError::InvertedRange { start: 5000, end: 5000 });
    }

    #[test]
    fn missing_and_blank_fields() {
        let grid = SlotGrid::default();
        let no_end = RawSlot::Range {
            start: Some("1000".into()),
            end: None,
        };
        assert_eq!(normalize(&no_end, &grid), Err(ValidationError::MissingField("end")));

        let blank_date = RawSlot::Cell {
            date: Some("  ".into()),
            time: Some("09:00".into()),
        };
        assert_eq!(normalize(&blank_date, &grid), Err(ValidationError::MissingField("date")));
    }

    #[test]
    fn garbage_is_unparseable() {
        let grid = SlotGrid::default();
        assert!(matches!(
            normalize(&range("tomorrow", "2024-06-03T09:00:00Z"), &grid),
            Err(ValidationError::Unparseable(_))
        ));
        assert!(matches!(
            normalize(&cell("2024-13-40", "09:00"), &grid),
            Err(ValidationError::Unparseable(_))
        ));
        assert!(matches!(
            normalize(&cell("2024-06-03", "9am"), &grid),
            Err(ValidationError::Unparseable(_))
        ));
    }

    #[test]
    fn cell_expands_to_one_grid_step() {
        let span = normalize(&cell("2024-06-03", "09:30"), &SlotGrid::default()).unwrap();
        assert_eq!(span, Span::new(JUNE_3 + 9 * H + 30 * M, JUNE_3 + 10 * H));
    }

    #[test]
    fn cell_off_grid_rejected() {
        let grid = SlotGrid::default();
        // Not on a 30-minute boundary.
        assert!(matches!(
            normalize(&cell("2024-06-03", "09:15"), &grid),
            Err(ValidationError::Unparseable(_))
        ));
        // Last grid point is an end boundary, not a cell.
        assert!(matches!(
            normalize(&cell("2024-06-03", "21:00"), &grid),
            Err(ValidationError::Unparseable(_))
        ));
        // Before the grid opens.
        assert!(matches!(
            normalize(&cell("2024-06-03", "07:30"), &grid),
            Err(ValidationError::Unparseable(_))
        ));
    }

    #[test]
    fn normalize_range_checks_order() {
        assert_eq!(normalize_range(1, 2), Ok(Span::new(1, 2)));
        assert!(normalize_range(2, 1).is_err());
    }
}
