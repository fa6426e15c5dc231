//! Rate-limit message detection and resume-time computation.
//!
//! Provider throttle messages arrive as plain terminal text. Detection has
//! to tolerate phrasing drift while refusing to fire on source code that
//! merely mentions rate limits, so matching runs only against lines that do
//! not look like code.

use chrono::{DateTime, Duration, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, warn};

/// Phrasings that indicate the driven assistant has been throttled.
static RATE_LIMIT_REGEXES: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"(?i)\brate.?limit(ed|s)?\b").unwrap(),
        Regex::new(r"(?i)\busage limit (reached|exceeded)\b").unwrap(),
        Regex::new(r"(?i)\btoo many requests\b").unwrap(),
        Regex::new(r"(?i)\bquota (exceeded|exhausted)\b").unwrap(),
        Regex::new(r"(?i)\b(429|overloaded)\b.{0,40}\b(error|status|response)\b").unwrap(),
        Regex::new(r"(?i)\b(try|retry|resets?)\b.{0,30}\b(at|in|after)\b.{0,30}\b(\d{1,2}(:\d{2})?\s*(am|pm)?|\d+\s*(minutes?|mins?|hours?|hrs?|seconds?|secs?))\b").unwrap(),
    ]
});

/// Lines that look like source code rather than assistant prose. A throttle
/// phrase inside one of these must not trigger a pause.
static CODE_LINE_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"^\s*(//|#|\*|/\*|\w+\s*[:=]\s*["']|fn\s|def\s|class\s|let\s|const\s|var\s|import\s|if\s*\(|return\s)"#,
    )
    .unwrap()
});

/// "resets at 7am (Asia/Tokyo)" and friends.
static RESET_AT_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(?:try again|resets?|available)\s+(?:at|after)\s+(\d{1,2})(?::(\d{2}))?\s*(am|pm)?\s*(?:\(([A-Za-z]+/[A-Za-z_]+)\))?",
    )
    .unwrap()
});

/// "retry in 45 minutes", "try again in 2 hours".
static RETRY_IN_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:retry|try again|resets?)\s+in\s+(\d+)\s*(minutes?|mins?|hours?|hrs?|seconds?|secs?)\b")
        .unwrap()
});

/// Scan captured output for a rate-limit message.
///
/// Returns the matching line, suitable for storing as the pause reason.
pub fn detect_rate_limit(text: &str) -> Option<String> {
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || CODE_LINE_REGEX.is_match(line) {
            continue;
        }
        if RATE_LIMIT_REGEXES.iter().any(|r| r.is_match(line)) {
            debug!(target: "taskmux::ratelimit", "Rate-limit line matched: {}", line);
            return Some(line.to_string());
        }
    }
    None
}

/// Compute when work should resume, from the throttle message itself.
///
/// Tries an absolute reset time first (honoring an IANA zone suffix like
/// "(Asia/Tokyo)"), then a relative duration, and finally falls back to the
/// configured cooldown. Always returns a deadline strictly after `now`.
pub fn compute_resume_time(
    message: &str,
    now: DateTime<Utc>,
    fallback_mins: i64,
) -> DateTime<Utc> {
    if let Some(at) = parse_reset_at(message, now) {
        return at;
    }
    if let Some(at) = parse_retry_in(message, now) {
        return at;
    }
    debug!(
        target: "taskmux::ratelimit",
        "No resume time in message, applying {}m fallback", fallback_mins
    );
    now + Duration::minutes(fallback_mins.max(1))
}

fn parse_reset_at(message: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let caps = RESET_AT_REGEX.captures(message)?;
    let mut hour: u32 = caps.get(1)?.as_str().parse().ok()?;
    let minute: u32 = caps
        .get(2)
        .map(|m| m.as_str().parse().unwrap_or(0))
        .unwrap_or(0);
    match caps.get(3).map(|m| m.as_str().to_ascii_lowercase()) {
        Some(ref ampm) if ampm == "pm" && hour < 12 => hour += 12,
        Some(ref ampm) if ampm == "am" && hour == 12 => hour = 0,
        _ => {}
    }
    let time = NaiveTime::from_hms_opt(hour, minute, 0)?;

    match caps.get(4).map(|m| m.as_str()) {
        Some(zone_name) => {
            let tz: Tz = match zone_name.parse() {
                Ok(tz) => tz,
                Err(_) => {
                    warn!(
                        target: "taskmux::ratelimit",
                        "Unknown time zone '{}' in throttle message", zone_name
                    );
                    return None;
                }
            };
            let local_now = now.with_timezone(&tz);
            let mut candidate = tz
                .from_local_datetime(&local_now.date_naive().and_time(time))
                .earliest()?;
            if candidate <= local_now {
                candidate = tz
                    .from_local_datetime(
                        &(local_now.date_naive() + Duration::days(1)).and_time(time),
                    )
                    .earliest()?;
            }
            Some(candidate.with_timezone(&Utc))
        }
        None => {
            // No zone given: interpret the wall-clock time as UTC.
            let mut candidate = Utc.from_utc_datetime(&now.date_naive().and_time(time));
            if candidate <= now {
                candidate += Duration::days(1);
            }
            Some(candidate)
        }
    }
}

fn parse_retry_in(message: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let caps = RETRY_IN_REGEX.captures(message)?;
    let amount: i64 = caps.get(1)?.as_str().parse().ok()?;
    let unit = caps.get(2)?.as_str().to_ascii_lowercase();
    let duration = if unit.starts_with("hour") || unit.starts_with("hr") {
        Duration::hours(amount)
    } else if unit.starts_with("sec") {
        Duration::seconds(amount)
    } else {
        Duration::minutes(amount)
    };
    Some(now + duration.max(Duration::seconds(1)))
}
