use std::{borrow::Cow, collections::BTreeMap, fmt, str::FromStr};

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One input row: source column name to raw cell value.
pub type InputRow = BTreeMap<String, CellValue>;

/// A raw value as handed over by a sheet reader, before any coercion.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum CellValue {
    #[default]
    Empty,
    Text(String),
    Number(Decimal),
    Boolean(bool),
    Timestamp(NaiveDateTime),
}

impl CellValue {
    pub fn is_blank(&self) -> bool {
        match self {
            CellValue::Empty => true,
            CellValue::Text(text) => text.trim().is_empty(),
            _ => false,
        }
    }

    pub fn as_text(&self) -> Cow<'_, str> {
        match self {
            CellValue::Empty => Cow::Borrowed(""),
            CellValue::Text(text) => Cow::Borrowed(text.trim()),
            CellValue::Number(number) => Cow::Owned(number.normalize().to_string()),
            CellValue::Boolean(flag) => Cow::Owned(flag.to_string()),
            CellValue::Timestamp(ts) => Cow::Owned(format_timestamp(ts)),
        }
    }
}

impl From<&str> for CellValue {
    fn from(value: &str) -> Self {
        if value.is_empty() {
            CellValue::Empty
        } else {
            CellValue::Text(value.to_string())
        }
    }
}

impl From<String> for CellValue {
    fn from(value: String) -> Self {
        if value.is_empty() {
            CellValue::Empty
        } else {
            CellValue::Text(value)
        }
    }
}

impl From<i64> for CellValue {
    fn from(value: i64) -> Self {
        CellValue::Number(Decimal::from(value))
    }
}

impl From<Decimal> for CellValue {
    fn from(value: Decimal) -> Self {
        CellValue::Number(value)
    }
}

impl From<bool> for CellValue {
    fn from(value: bool) -> Self {
        CellValue::Boolean(value)
    }
}

/// A coerced field value, typed by the field kind it was validated against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Value {
    Identifier(Uuid),
    Text(String),
    Integer(i64),
    Decimal(Decimal),
    Boolean(bool),
    Timestamp(NaiveDateTime),
    Enum(String),
}

impl Value {
    pub fn as_display(&self) -> String {
        match self {
            Value::Identifier(id) => id.hyphenated().to_string(),
            Value::Text(s) | Value::Enum(s) => s.clone(),
            Value::Integer(i) => i.to_string(),
            Value::Decimal(d) => d.to_string(),
            Value::Boolean(b) => b.to_string(),
            Value::Timestamp(ts) => format_timestamp(ts),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_display())
    }
}

pub fn format_timestamp(ts: &NaiveDateTime) -> String {
    ts.format("%Y-%m-%dT%H:%M:%S%.f").to_string()
}

/// Case-insensitive comparison form used by every natural-key match.
pub fn fold(value: &str) -> String {
    value.trim().to_lowercase()
}

pub fn parse_timestamp(value: &str) -> Option<NaiveDateTime> {
    const DATETIME_FORMATS: &[&str] = &[
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%d %H:%M",
        "%d/%m/%Y %H:%M:%S",
        "%d/%m/%Y %H:%M",
    ];
    const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%d/%m/%Y", "%Y/%m/%d", "%d-%m-%Y", "%d.%m.%Y"];

    let value = value.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.naive_utc());
    }
    for fmt in DATETIME_FORMATS {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(value, fmt) {
            return Some(parsed);
        }
    }
    for fmt in DATE_FORMATS {
        if let Ok(parsed) = NaiveDate::parse_from_str(value, fmt) {
            return parsed.and_hms_opt(0, 0, 0);
        }
    }
    None
}

pub fn parse_decimal(value: &str) -> Option<Decimal> {
    let trimmed = value.trim();
    let unsigned = trimmed.strip_prefix('+').unwrap_or(trimmed);
    Decimal::from_str(unsigned)
        .or_else(|_| Decimal::from_scientific(unsigned))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_timestamp_supports_iso_and_common_layouts() {
        let expected = NaiveDate::from_ymd_opt(2024, 5, 6)
            .unwrap()
            .and_hms_opt(14, 30, 0)
            .unwrap();
        assert_eq!(parse_timestamp("2024-05-06T14:30:00"), Some(expected));
        assert_eq!(parse_timestamp("2024-05-06T14:30:00Z"), Some(expected));
        assert_eq!(parse_timestamp("2024-05-06 14:30"), Some(expected));
        assert_eq!(parse_timestamp("06/05/2024 14:30:00"), Some(expected));

        let midnight = NaiveDate::from_ymd_opt(2024, 5, 6)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        assert_eq!(parse_timestamp("06/05/2024"), Some(midnight));
        assert_eq!(parse_timestamp("2024/05/06"), Some(midnight));
        assert_eq!(parse_timestamp("next tuesday"), None);
    }

    #[test]
    fn parse_decimal_accepts_signs_and_exponents() {
        assert_eq!(parse_decimal("+1.50"), Some(Decimal::new(150, 2)));
        assert_eq!(parse_decimal("-0.25"), Some(Decimal::new(-25, 2)));
        assert_eq!(parse_decimal("1.5e3"), Some(Decimal::new(1500, 0)));
        assert_eq!(parse_decimal("12abc"), None);
    }

    #[test]
    fn blank_cells_include_whitespace_text() {
        assert!(CellValue::Empty.is_blank());
        assert!(CellValue::from("   ").is_blank());
        assert!(!CellValue::from(0).is_blank());
        assert_eq!(CellValue::from(" Alpha ").as_text(), "Alpha");
    }

    #[test]
    fn timestamps_render_without_empty_fraction() {
        let ts = parse_timestamp("2024-01-02 03:04:05").unwrap();
        assert_eq!(Value::Timestamp(ts).to_string(), "2024-01-02T03:04:05");
    }
}
