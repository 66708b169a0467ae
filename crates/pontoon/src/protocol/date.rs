//! Passport dates travel as YYMMDD integers; zero means "no restriction".

use std::fmt;

use super::ValidationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassportDate {
    NoRestriction,
    Date { year: u8, month: u8, day: u8 },
}

impl PassportDate {
    pub fn encode(self) -> u32 {
        match self {
            PassportDate::NoRestriction => 0,
            PassportDate::Date { year, month, day } => {
                u32::from(year) * 10_000 + u32::from(month) * 100 + u32::from(day)
            }
        }
    }

    pub fn decode(value: u32) -> Result<Self, ValidationError> {
        if value == 0 {
            return Ok(PassportDate::NoRestriction);
        }
        if value > 99_12_31 {
            return Err(ValidationError::new(
                "date",
                format!("{value} exceeds the YYMMDD range"),
            ));
        }
        let year = (value / 10_000) as u8;
        let month = ((value / 100) % 100) as u8;
        let day = (value % 100) as u8;
        if month == 0 || month > 12 {
            return Err(ValidationError::new(
                "date",
                format!("month {month} out of range"),
            ));
        }
        if day == 0 || day > 31 {
            return Err(ValidationError::new(
                "date",
                format!("day {day} out of range"),
            ));
        }
        Ok(PassportDate::Date { year, month, day })
    }
}

impl fmt::Display for PassportDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PassportDate::NoRestriction => write!(f, "no restriction"),
            PassportDate::Date { year, month, day } => {
                write!(f, "{day:02}.{month:02}.{year:02}")
            }
        }
    }
}
