use chrono::{Datelike, Duration, NaiveDate};

/// 7 rows of 7 cells, always, so month rendering never reflows.
pub const GRID_CELLS: usize = 49;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirstDayOfWeek {
    Sunday,
    Monday,
}

impl FirstDayOfWeek {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "sunday" => Some(Self::Sunday),
            "monday" => Some(Self::Monday),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DayCell {
    pub date: NaiveDate,
    pub day: u32,
    pub in_target_month: bool,
}

/// Build the 7x7 month view for a 1-based `month`. Leading cells carry the
/// previous month's trailing days (one per weekday slot before the 1st),
/// trailing cells the next month's leading days, both flagged out-of-month.
/// Returns `None` only for an invalid year/month pair.
pub fn month_grid(year: i32, month: u32, first_day: FirstDayOfWeek) -> Option<Vec<DayCell>> {
    let first = NaiveDate::from_ymd_opt(year, month, 1)?;
    let lead = match first_day {
        FirstDayOfWeek::Sunday => first.weekday().num_days_from_sunday(),
        FirstDayOfWeek::Monday => first.weekday().num_days_from_monday(),
    } as i64;

    let start = first - Duration::days(lead);
    let mut cells = Vec::with_capacity(GRID_CELLS);
    for offset in 0..GRID_CELLS as i64 {
        let date = start + Duration::days(offset);
        cells.push(DayCell {
            date,
            day: date.day(),
            in_target_month: date.year() == year && date.month() == month,
        });
    }
    Some(cells)
}

/// First day of the month paired with the first day of the next one: a
/// half-open range for date scans.
pub fn month_bounds(year: i32, month: u32) -> Option<(NaiveDate, NaiveDate)> {
    let first = NaiveDate::from_ymd_opt(year, month, 1)?;
    let next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)?
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)?
    };
    Some((first, next))
}
