use chrono::{FixedOffset, NaiveDate, NaiveDateTime, TimeZone};
use serde_json::{Map, Value};
use crate::core::error::{Error, ErrorKind, Result};
use crate::query::Query;

const DATETIME_FORMATS: [&str; 3] = ["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M", "%Y-%m-%dT%H:%M:%S"];

/// Parse "UTC", "Z" or a fixed offset such as "-05:00" / "+0130".
///
/// IANA zone names are rejected; offsets do not follow daylight saving.
pub fn parse_timezone(name: &str) -> Result<FixedOffset> {
    let trimmed = name.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("utc") || trimmed == "Z" {
        return FixedOffset::east_opt(0).ok_or_else(|| bad_timezone(name));
    }

    let (sign, rest) = if let Some(rest) = trimmed.strip_prefix('+') {
        (1, rest)
    } else if let Some(rest) = trimmed.strip_prefix('-') {
        (-1, rest)
    } else {
        return Err(bad_timezone(name));
    };
    let digits: String = rest.chars().filter(|c| *c != ':').collect();
    if digits.len() != 4 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(bad_timezone(name));
    }
    let hours: i32 = digits[..2].parse().map_err(|_| bad_timezone(name))?;
    let minutes: i32 = digits[2..].parse().map_err(|_| bad_timezone(name))?;

    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60)).ok_or_else(|| bad_timezone(name))
}

fn bad_timezone(name: &str) -> Error {
    Error::new(ErrorKind::Config, format!("Unsupported timezone '{}'", name))
}

/// Convert a human-friendly time to seconds since the epoch.
///
/// Accepts numbers (already epoch seconds) and strings shaped like
/// `2015`, `2015-01`, `2015-01-30`, `2015-01-30 03:00` or
/// `2015-01-30 03:00:00`, interpreted in `tz`.
pub fn normalize_human_time(value: &Value, tz: &FixedOffset) -> Result<f64> {
    match value {
        Value::Number(n) => n.as_f64().ok_or_else(|| bad_time(value)),
        Value::String(text) => {
            let naive = parse_naive(text.trim()).ok_or_else(|| bad_time(value))?;
            let local = tz
                .from_local_datetime(&naive)
                .single()
                .ok_or_else(|| bad_time(value))?;
            Ok(local.timestamp_millis() as f64 / 1000.0)
        }
        _ => Err(bad_time(value)),
    }
}

fn parse_naive(text: &str) -> Option<NaiveDateTime> {
    for format in DATETIME_FORMATS {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(text, format) {
            return Some(parsed);
        }
    }

    let parts: Vec<&str> = text.split('-').collect();
    let date = match parts.as_slice() {
        [year] => NaiveDate::from_ymd_opt(year.parse().ok()?, 1, 1)?,
        [year, month] => NaiveDate::from_ymd_opt(year.parse().ok()?, month.parse().ok()?, 1)?,
        [year, month, day] => NaiveDate::from_ymd_opt(
            year.parse().ok()?,
            month.parse().ok()?,
            day.parse().ok()?,
        )?,
        _ => return None,
    };
    date.and_hms_opt(0, 0, 0)
}

fn bad_time(value: &Value) -> Error {
    Error::new(
        ErrorKind::InvalidArgument,
        format!("Could not interpret {} as a time", value),
    )
}

/// Replace `start_time` / `stop_time` entries with a range clause on `time`.
pub fn format_time(query: &mut Query, tz: &FixedOffset) -> Result<()> {
    let start = query.remove("start_time");
    let stop = query.remove("stop_time");

    let mut range = Map::new();
    if let Some(start) = start.filter(|v| !v.is_null()) {
        range.insert("$gte".to_string(), Value::from(normalize_human_time(&start, tz)?));
    }
    if let Some(stop) = stop.filter(|v| !v.is_null()) {
        range.insert("$lte".to_string(), Value::from(normalize_human_time(&stop, tz)?));
    }
    if !range.is_empty() {
        query.insert("time".to_string(), Value::Object(range));
    }
    Ok(())
}

/// Render epoch seconds as RFC 3339 in the given offset.
pub fn render_timestamp(seconds: f64, tz: &FixedOffset) -> Option<String> {
    let millis = (seconds * 1000.0).round() as i64;
    tz.timestamp_millis_opt(millis).single().map(|dt| dt.to_rfc3339())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_timezone_variants() {
        assert_eq!(parse_timezone("UTC").unwrap().local_minus_utc(), 0);
        assert_eq!(parse_timezone("-05:00").unwrap().local_minus_utc(), -5 * 3600);
        assert_eq!(parse_timezone("+0130").unwrap().local_minus_utc(), 5400);
        assert!(parse_timezone("US/Eastern").is_err());
    }

    #[test]
    fn test_parse_timezone_rejects_multibyte_sign() {
        let err = parse_timezone("\u{2212}05:00").unwrap_err();
        assert!(err.is(ErrorKind::Config));
        assert!(parse_timezone("é").unwrap_err().is(ErrorKind::Config));
        assert!(parse_timezone("+5").unwrap_err().is(ErrorKind::Config));
    }

    #[test]
    fn test_partial_dates_are_start_of_period() {
        let utc = parse_timezone("UTC").unwrap();
        assert_eq!(normalize_human_time(&json!("1970"), &utc).unwrap(), 0.0);
        assert_eq!(normalize_human_time(&json!("1970-01-02"), &utc).unwrap(), 86400.0);
        assert_eq!(normalize_human_time(&json!("1970-02"), &utc).unwrap(), 31.0 * 86400.0);
        assert_eq!(normalize_human_time(&json!("1970-01-01 01:00:00"), &utc).unwrap(), 3600.0);
        assert_eq!(normalize_human_time(&json!(12.5), &utc).unwrap(), 12.5);
    }

    #[test]
    fn test_local_time_respects_offset() {
        let eastern = parse_timezone("-05:00").unwrap();
        assert_eq!(normalize_human_time(&json!("1970-01-01"), &eastern).unwrap(), 5.0 * 3600.0);
    }

    #[test]
    fn test_format_time_builds_range() {
        let utc = parse_timezone("UTC").unwrap();
        let mut query = Query::new();
        query.insert("start_time".into(), json!("1970-01-02"));
        query.insert("stop_time".into(), json!(100000.0));
        query.insert("plan_name".into(), json!("scan"));

        format_time(&mut query, &utc).unwrap();

        assert!(!query.contains_key("start_time"));
        assert_eq!(query["time"], json!({"$gte": 86400.0, "$lte": 100000.0}));
        assert_eq!(query["plan_name"], json!("scan"));
    }

    #[test]
    fn test_unparseable_time_is_rejected() {
        let utc = parse_timezone("UTC").unwrap();
        let err = normalize_human_time(&json!("yesterday"), &utc).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);
    }
}
