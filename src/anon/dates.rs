//! Date arithmetic on DA, DT and TM values.
//!
//! Shifting moves the calendar date by a whole number of days and leaves
//! the time of day untouched. Flooring truncates to the start of the day.

use chrono::{Duration, NaiveDate};
use thiserror::Error;

/// Shifts a DA value (`YYYYMMDD`) by `days`.
/// # Errors
/// Returns a [`DateError`] if the value does not parse as a date.
pub fn shift_da(value: &str, days: i64) -> Result<String, DateError> {
	let trimmed = value.trim();
	let date = parse_da(trimmed)?;
	let shifted = date
		.checked_add_signed(Duration::days(days))
		.ok_or_else(|| DateError::OutOfRange(value.to_owned()))?;
	Ok(shifted.format("%Y%m%d").to_string())
}

/// Shifts the date part of a DT value (`YYYYMMDD[HHMMSS[.FFFFFF]][&ZZXX]`)
/// by `days`, preserving everything after the date.
/// # Errors
/// Returns a [`DateError`] if the leading date does not parse.
pub fn shift_dt(value: &str, days: i64) -> Result<String, DateError> {
	let trimmed = value.trim();
	if trimmed.len() < 8 {
		return Err(DateError::Unparseable(value.to_owned()));
	}
	let (date_part, rest) = trimmed.split_at(8);
	let shifted = shift_da(date_part, days)?;
	Ok(format!("{shifted}{rest}"))
}

/// A TM value carries no date, so a whole-day shift is the identity.
pub fn shift_tm(value: &str) -> String {
	value.trim().to_owned()
}

/// Floors a DT value to the start of its day.
/// # Errors
/// Returns a [`DateError`] if the leading date does not parse.
pub fn floor_dt(value: &str) -> Result<String, DateError> {
	let trimmed = value.trim();
	if trimmed.len() < 8 {
		return Err(DateError::Unparseable(value.to_owned()));
	}
	let date_part = &trimmed[..8];
	parse_da(date_part)?;
	Ok(format!("{date_part}000000"))
}

/// Floors a TM value to the start of the day.
pub fn floor_tm(_value: &str) -> String {
	String::from("000000")
}

fn parse_da(value: &str) -> Result<NaiveDate, DateError> {
	NaiveDate::parse_from_str(value, "%Y%m%d")
		.map_err(|_| DateError::Unparseable(value.to_owned()))
}

#[derive(Debug, Error)]
pub enum DateError {
	#[error("Value '{0}' is not a valid DICOM date")]
	Unparseable(String),
	#[error("Shifting '{0}' leaves the supported date range")]
	OutOfRange(String),
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn da_shifts_backwards_across_month_boundaries() {
		assert_eq!(shift_da("20230301", -1).unwrap(), "20230228");
		assert_eq!(shift_da("20240301", -1).unwrap(), "20240229");
		assert_eq!(shift_da("20230101", -30).unwrap(), "20221202");
		assert_eq!(shift_da("20230517", 0).unwrap(), "20230517");
	}

	#[test]
	fn dt_preserves_time_and_offset_suffix() {
		assert_eq!(shift_dt("20230301120000", -1).unwrap(), "20230228120000");
		assert_eq!(
			shift_dt("20230301120000.123456+0100", -2).unwrap(),
			"20230227120000.123456+0100"
		);
		assert_eq!(shift_dt("20230301", -1).unwrap(), "20230228");
	}

	#[test]
	fn tm_is_untouched_by_day_shifts() {
		assert_eq!(shift_tm("093000"), "093000");
		assert_eq!(shift_tm("093000.250000 "), "093000.250000");
	}

	#[test]
	fn flooring_truncates_to_midnight() {
		assert_eq!(floor_dt("20230517093015.5").unwrap(), "20230517000000");
		assert_eq!(floor_tm("093015"), "000000");
	}

	#[test]
	fn garbage_is_rejected() {
		assert!(shift_da("not-a-date", -1).is_err());
		assert!(shift_da("2023051", -1).is_err());
		assert!(shift_dt("20231", -1).is_err());
		assert!(floor_dt("xx230517").is_err());
	}
}
