//! Timestamp helpers. All persisted timestamps are RFC 3339 UTC with whole
//! seconds, so lexicographic order in SQL matches chronological order.

use chrono::{Duration, SecondsFormat, Utc};

pub fn now_ts() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// One hour in the past. New repositories are stamped with this so they win
/// the oldest-ready selection and sync immediately after download.
pub fn hour_ago_ts() -> String {
    (Utc::now() - Duration::hours(1)).to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_are_fixed_width_utc() {
        let ts = now_ts();
        assert_eq!(ts.len(), 20);
        assert!(ts.ends_with('Z'));
    }

    #[test]
    fn hour_ago_sorts_before_now() {
        assert!(hour_ago_ts() < now_ts());
    }
}
