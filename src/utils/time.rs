use chrono::{DateTime, Duration, NaiveTime, TimeZone};

/// Renders elapsed seconds the way every surface shows the running timer, `HH:MM:SS`. Hours are
/// not wrapped, so a forgotten timer reads `123:04:05`.
pub fn format_clock(seconds: u64) -> String {
    format!(
        "{:02}:{:02}:{:02}",
        seconds / 3600,
        (seconds / 60) % 60,
        seconds % 60
    )
}

/// Compact human duration used in listings, e.g. `1h2m3s`.
pub fn format_duration(seconds: u64) -> String {
    let v = Duration::seconds(seconds as i64);
    if v.num_hours() > 0 {
        format!(
            "{}h{}m{}s",
            v.num_hours(),
            v.num_minutes() % 60,
            v.num_seconds() % 60
        )
    } else if v.num_minutes() > 0 {
        format!("{}m{}s", v.num_minutes() % 60, v.num_seconds() % 60)
    } else {
        format!("{}s", v.num_seconds() % 60)
    }
}

/// Returns start of the next day. Where midnight doesn't exist locally, the same time tomorrow.
pub fn next_day_start<Tz: TimeZone>(date: DateTime<Tz>) -> DateTime<Tz> {
    let next = date + Duration::days(1);
    next.with_time(NaiveTime::MIN).earliest().unwrap_or(next)
}
