//! Hour-bucketed window keys (`YYYY-MM-DDTHH:00`, UTC).

use chrono::{DateTime, Duration, NaiveDateTime, TimeZone, Timelike, Utc};

use crate::error::{Error, Result};

const WINDOW_FORMAT: &str = "%Y-%m-%dT%H:00";

/// The window id containing `ts`.
pub fn window_id_for(ts: DateTime<Utc>) -> String {
    ts.format(WINDOW_FORMAT).to_string()
}

/// The window id `hours_ago` hours before the window containing `now`.
pub fn window_id_hours_ago(now: DateTime<Utc>, hours_ago: u32) -> String {
    window_id_for(now - Duration::hours(i64::from(hours_ago)))
}

/// Parse a window id back into the start of its hour.
pub fn parse_window_id(window_id: &str) -> Result<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(&format!("{window_id}:00"), "%Y-%m-%dT%H:%M:%S")
        .map_err(|e| Error::InvalidArgument(format!("malformed window id {window_id:?}: {e}")))?;
    if naive.minute() != 0 || window_id.len() != 16 {
        return Err(Error::InvalidArgument(format!(
            "window id {window_id:?} is not aligned to the hour"
        )));
    }
    Ok(Utc.from_utc_datetime(&naive))
}
