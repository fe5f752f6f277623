//! Common helpers shared by the recorder

use rand::Rng;
use time::{Duration, OffsetDateTime};

/// Format seconds as `h:mm:ss`
pub fn format_duration(seconds: f64) -> String {
    let d = Duration::seconds_f64(seconds.max(0.0));
    format!(
        "{}:{:02}:{:02}",
        d.whole_hours(),
        d.whole_minutes() % 60,
        d.whole_seconds() % 60
    )
}

/// Random lowercase hex string, two characters per byte
pub fn random_hex(bytes: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..bytes).map(|_| format!("{:02x}", rng.gen::<u8>())).collect()
}

/// Local timestamp `YYYY-MM-DD_HH-MM-SS`, falling back to UTC when the offset is unknown
pub fn timestamp_name() -> String {
    let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
    format!(
        "{:04}-{:02}-{:02}_{:02}-{:02}-{:02}",
        now.year(),
        u8::from(now.month()),
        now.day(),
        now.hour(),
        now.minute(),
        now.second()
    )
}
