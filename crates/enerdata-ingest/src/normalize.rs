//! Field normalization
//!
//! Every function here is total: a token that cannot be interpreted yields
//! `None` for that field and never an error.

use chrono::{NaiveDate, NaiveDateTime};

/// Tokens that stand for "no value" once trimmed
pub const NULL_TOKENS: &[&str] = &["", "NULL"];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%d/%m/%Y", "%Y/%m/%d"];
const DATETIME_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S%.f"];

/// Trim a raw token and map null-like tokens to `None`
pub fn clean_text(raw: Option<&str>) -> Option<String> {
    let trimmed = raw?.trim();
    if NULL_TOKENS.contains(&trimmed) {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Permissive decimal parse; a lone `,` is accepted as decimal separator
pub fn parse_number(raw: Option<&str>) -> Option<f64> {
    let text = clean_text(raw)?;
    let parsed = match text.parse::<f64>() {
        Ok(v) => v,
        Err(_) if text.matches(',').count() == 1 && !text.contains('.') => {
            text.replace(',', ".").parse::<f64>().ok()?
        },
        Err(_) => return None,
    };
    parsed.is_finite().then_some(parsed)
}

/// Integral values only; `"3.0"` is accepted, `"3.5"` is not
pub fn parse_int(raw: Option<&str>) -> Option<i32> {
    let text = clean_text(raw)?;
    if let Ok(v) = text.parse::<i32>() {
        return Some(v);
    }
    let number = parse_number(Some(&text))?;
    if number.fract() != 0.0 || number < f64::from(i32::MIN) || number > f64::from(i32::MAX) {
        return None;
    }
    Some(number as i32)
}

pub fn parse_year(raw: Option<&str>) -> Option<i32> {
    parse_int(raw)
}

/// Parse a date or timestamp; the time of day is discarded
pub fn parse_date(raw: Option<&str>) -> Option<NaiveDate> {
    let text = clean_text(raw)?;

    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(&text, fmt).ok())
        .or_else(|| {
            DATETIME_FORMATS
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(&text, fmt).ok())
                .map(|dt| dt.date())
        })
}
