//! Snapshot expiry policy.
//!
//! Policies are space separated `<count><unit>` terms, e.g. `"1d 12H"`. Units:
//! `M` minutes, `H` hours, `d` days, `w` weeks, `m` months, `y` years. Each
//! unit may appear once.

use chrono::{DateTime, Days, Duration, Months, Utc};
use std::collections::HashMap;

use crate::{HostdError, Result};

/// Config key holding the expiry applied to manually created snapshots.
pub const MANUAL_EXPIRY_KEY: &str = "snapshots.expiry.manual";

/// Config key holding the general snapshot expiry, used as the fallback.
pub const EXPIRY_KEY: &str = "snapshots.expiry";

/// Config key overriding the auto-naming pattern.
pub const PATTERN_KEY: &str = "snapshots.pattern";

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Offset {
    minutes: u32,
    hours: u32,
    days: u32,
    weeks: u32,
    months: u32,
    years: u32,
}

fn parse_offset(expr: &str) -> Result<Offset> {
    let invalid = || HostdError::bad_request(format!("Invalid expiry expression {expr:?}"));
    let mut offset = Offset::default();
    let mut seen = Vec::new();

    for term in expr.split_whitespace() {
        let unit = term.chars().last().ok_or_else(invalid)?;
        let count: u32 = term[..term.len() - unit.len_utf8()]
            .parse()
            .map_err(|_| invalid())?;

        if seen.contains(&unit) {
            return Err(invalid());
        }
        seen.push(unit);

        match unit {
            'M' => offset.minutes = count,
            'H' => offset.hours = count,
            'd' => offset.days = count,
            'w' => offset.weeks = count,
            'm' => offset.months = count,
            'y' => offset.years = count,
            _ => return Err(invalid()),
        }
    }

    Ok(offset)
}

/// Compute the expiry for `expr` relative to `now`.
///
/// An empty expression means the snapshot never expires.
pub fn expiry_from(now: DateTime<Utc>, expr: &str) -> Result<Option<DateTime<Utc>>> {
    if expr.trim().is_empty() {
        return Ok(None);
    }

    let offset = parse_offset(expr)?;
    let overflow = || HostdError::bad_request(format!("Expiry expression {expr:?} overflows"));

    let months = offset
        .years
        .checked_mul(12)
        .and_then(|m| m.checked_add(offset.months))
        .ok_or_else(overflow)?;
    let days = u64::from(offset.days) + u64::from(offset.weeks) * 7;

    let expiry = now
        .checked_add_months(Months::new(months))
        .and_then(|t| t.checked_add_days(Days::new(days)))
        .and_then(|t| t.checked_add_signed(Duration::hours(i64::from(offset.hours))))
        .and_then(|t| t.checked_add_signed(Duration::minutes(i64::from(offset.minutes))))
        .ok_or_else(overflow)?;

    Ok(Some(expiry))
}

/// Default expiry for a manually created snapshot of an instance with the
/// given expanded config.
///
/// `snapshots.expiry.manual` wins over `snapshots.expiry`. A missing policy
/// yields no expiry; so does an unparseable one, which callers are expected
/// to report as a warning rather than reject the request.
pub fn default_snapshot_expiry(
    config: &HashMap<String, String>,
    now: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>> {
    let policy = config
        .get(MANUAL_EXPIRY_KEY)
        .filter(|v| !v.is_empty())
        .or_else(|| config.get(EXPIRY_KEY))
        .map(String::as_str)
        .unwrap_or("");

    expiry_from(now, policy)
}
