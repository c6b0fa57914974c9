//! Conversions between wall-clock timestamps and f64 epoch seconds.
//!
//! The pipeline keeps time as f64 epoch seconds internally; the stores keep
//! integer epoch seconds (counter history) and local-time
//! `YYYY-MM-DD HH:MM:SS` strings (queue history).

use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};

pub const LOCAL_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub fn datetime_to_f64<TZ>(dt: &DateTime<TZ>) -> f64
where
    TZ: TimeZone,
{
    let secs = dt.timestamp();
    let nsecs = dt.timestamp_subsec_nanos();
    (secs as f64) + (nsecs as f64 * 1e-9)
}

pub fn f64_to_datetime(timestamp: f64) -> DateTime<Local> {
    let secs_f = timestamp.floor();
    let secs = secs_f as i64;
    let nsecs = ((timestamp - secs_f) * 1e9) as u32;
    match Local.timestamp_opt(secs, nsecs) {
        chrono::LocalResult::Single(dt) | chrono::LocalResult::Ambiguous(dt, _) => dt,
        chrono::LocalResult::None => Local
            .timestamp_opt(secs, 0)
            .earliest()
            .unwrap_or_else(|| Utc.timestamp_opt(0, 0).unwrap().with_timezone(&Local)),
    }
}

/// Current wall-clock time as epoch seconds.
pub fn epoch_now() -> f64 {
    datetime_to_f64(&Utc::now())
}

/// Format epoch seconds as local `YYYY-MM-DD HH:MM:SS`.
pub fn format_epoch_local(epoch: f64) -> String {
    f64_to_datetime(epoch).format(LOCAL_FORMAT).to_string()
}

/// Parse a legacy local-time timestamp, `YYYY-MM-DD HH:MM:SS` with an
/// optional fractional part, into integer epoch seconds.
pub fn parse_legacy_local(s: &str) -> Option<i64> {
    let naive = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f").ok()?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.timestamp())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_epoch_f64() {
        let now = Local::now();
        let f = datetime_to_f64(&now);
        let back = f64_to_datetime(f);
        let diff = (datetime_to_f64(&back) - f).abs();
        assert!(diff < 1e-6);
    }

    #[test]
    fn legacy_parse_then_format_preserves_local_time() {
        let original = "2025-01-02 10:00:42";
        let epoch = parse_legacy_local(original).unwrap();
        assert_eq!(format_epoch_local(epoch as f64), original);
    }

    #[test]
    fn legacy_parse_accepts_fractional_seconds() {
        let a = parse_legacy_local("2024-06-01 08:30:00").unwrap();
        let b = parse_legacy_local("2024-06-01 08:30:00.123456").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn legacy_parse_rejects_garbage() {
        assert!(parse_legacy_local("not a timestamp").is_none());
        assert!(parse_legacy_local("2024-13-40 99:99:99").is_none());
    }
}
