use chrono::{DateTime, Utc};

/// Current UTC time as an RFC 3339 string (millisecond precision)
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Human-readable relative time, e.g. "2 minutes ago".
pub fn format_time_ago(then: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let elapsed = now.signed_duration_since(then);

    if elapsed < chrono::Duration::seconds(30) {
        return "just now".to_string();
    }

    if elapsed < chrono::Duration::hours(1) {
        let minutes = elapsed.num_minutes().max(1);
        return plural(minutes, "minute");
    }

    if elapsed < chrono::Duration::days(1) {
        return plural(elapsed.num_hours(), "hour");
    }

    plural(elapsed.num_days(), "day")
}

fn plural(n: i64, unit: &str) -> String {
    if n == 1 {
        format!("1 {unit} ago")
    } else {
        format!("{n} {unit}s ago")
    }
}
