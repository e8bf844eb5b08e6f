//! Human-readable size and duration parsing (component A).
//!
//! Sizes use `{B, K, KB, KiB, M, MB, MiB, G, GB, GiB, T, TB, TiB}`, with the
//! bare-letter and `*iB` suffixes binary (powers of 1024) and the `*B`
//! suffixes decimal (powers of 1000). Durations use `{s, m, h, d, w, y}` and
//! may be written as a sequence of segments (`"4w2d"`) the way `humantime`-style
//! formats do. An empty string means "unspecified", distinct from `0`.

/// Errors from parsing a size or duration string.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The input did not match any recognised size/duration grammar.
    #[error("invalid format: {0:?}")]
    InvalidFormat(String),
}

/// Alias for `Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;

const SIZE_UNITS: &[(&str, f64, bool)] = &[
    ("TiB", 1024.0_f64.powi(4), true),
    ("GiB", 1024.0_f64.powi(3), true),
    ("MiB", 1024.0_f64.powi(2), true),
    ("KiB", 1024.0, true),
    ("TB", 1000.0_f64.powi(4), false),
    ("GB", 1000.0_f64.powi(3), false),
    ("MB", 1000.0_f64.powi(2), false),
    ("KB", 1000.0, false),
    ("T", 1024.0_f64.powi(4), true),
    ("G", 1024.0_f64.powi(3), true),
    ("M", 1024.0_f64.powi(2), true),
    ("K", 1024.0, true),
    ("B", 1.0, false),
];

/// Parses a human size string (`"1G"`, `"2.4GiB"`, `"0"`, `""`) into bytes.
///
/// Returns `Ok(None)` for an empty/missing string ("unspecified"), distinct
/// from `Ok(Some(0))` for the literal `"0"`.
pub fn parse_size(input: &str) -> Result<Option<u64>> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    if trimmed == "0" {
        return Ok(Some(0));
    }

    let split = trimmed.find(|c: char| !c.is_ascii_digit() && c != '.');
    let (num_str, unit_str) = match split {
        Some(pos) => trimmed.split_at(pos),
        None => (trimmed, ""),
    };
    let unit_str = unit_str.trim();

    let num: f64 = num_str
        .parse()
        .map_err(|_| Error::InvalidFormat(input.to_owned()))?;
    if num < 0.0 {
        return Err(Error::InvalidFormat(input.to_owned()));
    }

    let (_, multiplier, _) = SIZE_UNITS
        .iter()
        .find(|(suffix, ..)| suffix.eq_ignore_ascii_case(unit_str))
        .ok_or_else(|| Error::InvalidFormat(input.to_owned()))?;

    Ok(Some((num * multiplier).round() as u64))
}

/// Formats a byte count back into a human size string, preferring the
/// largest binary unit that divides the value evenly.
#[must_use]
pub fn format_size(bytes: u64) -> String {
    if bytes == 0 {
        return "0".to_owned();
    }
    let value = bytes as f64;
    for (suffix, multiplier, binary) in SIZE_UNITS {
        if !binary || *multiplier == 1.0 {
            continue;
        }
        if value >= *multiplier && (value / multiplier).fract() == 0.0 {
            return format!("{}{suffix}", (value / multiplier) as u64);
        }
    }
    format!("{bytes}B")
}

const DURATION_UNITS: &[(char, i64)] = &[
    ('y', 365 * 86400),
    ('w', 7 * 86400),
    ('d', 86400),
    ('h', 3600),
    ('m', 60),
    ('s', 1),
];

/// Parses a human duration string (`"30d"`, `"4w2d"`, `"0"`, `""`) into seconds.
///
/// Returns `Ok(None)` for an empty/missing string ("unspecified"). A string
/// may chain multiple `<number><unit>` segments, which are summed.
pub fn parse_duration(input: &str) -> Result<Option<i64>> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    if trimmed == "0" {
        return Ok(Some(0));
    }

    let mut total: i64 = 0;
    let mut rest = trimmed;
    while !rest.is_empty() {
        let split = rest
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| Error::InvalidFormat(input.to_owned()))?;
        let (num_str, tail) = rest.split_at(split);
        let mut chars = tail.chars();
        let unit = chars.next().ok_or_else(|| Error::InvalidFormat(input.to_owned()))?;

        let num: i64 = num_str
            .parse()
            .map_err(|_| Error::InvalidFormat(input.to_owned()))?;
        let seconds = DURATION_UNITS
            .iter()
            .find(|(u, _)| *u == unit)
            .map(|(_, s)| *s)
            .ok_or_else(|| Error::InvalidFormat(input.to_owned()))?;

        total += num * seconds;
        rest = chars.as_str();
    }

    Ok(Some(total))
}

/// Formats a duration in seconds back into the largest whole unit that
/// divides it evenly, falling back to seconds.
#[must_use]
pub fn format_duration(seconds: i64) -> String {
    if seconds == 0 {
        return "0".to_owned();
    }
    for (unit, unit_seconds) in DURATION_UNITS {
        if *unit_seconds > 1 && seconds % unit_seconds == 0 {
            return format!("{}{unit}", seconds / unit_seconds);
        }
    }
    format!("{seconds}s")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_is_unspecified() {
        assert_eq!(parse_size("").unwrap(), None);
        assert_eq!(parse_duration("").unwrap(), None);
    }

    #[test]
    fn bare_zero_is_zero() {
        assert_eq!(parse_size("0").unwrap(), Some(0));
        assert_eq!(parse_duration("0").unwrap(), Some(0));
    }

    #[test]
    fn binary_units() {
        assert_eq!(parse_size("1G").unwrap(), Some(1024 * 1024 * 1024));
        assert_eq!(parse_size("2.4GiB").unwrap(), Some((2.4 * 1024.0 * 1024.0 * 1024.0).round() as u64));
        assert_eq!(parse_size("10GiB").unwrap(), Some(10 * 1024 * 1024 * 1024));
    }

    #[test]
    fn decimal_units() {
        assert_eq!(parse_size("1GB").unwrap(), Some(1_000_000_000));
        assert_eq!(parse_size("1KB").unwrap(), Some(1_000));
    }

    #[test]
    fn invalid_format_rejected() {
        assert!(parse_size("nope").is_err());
        assert!(parse_size("1Gx").is_err());
        assert!(parse_duration("1x").is_err());
    }

    #[test]
    fn duration_compound_segments() {
        assert_eq!(parse_duration("30d").unwrap(), parse_duration("4w2d").unwrap());
    }

    #[test]
    fn size_round_trip_binary() {
        for x in [0u64, 1024, 10 * 1024u64.pow(3)] {
            let formatted = format_size(x);
            assert_eq!(parse_size(&formatted).unwrap(), Some(x));
        }
    }

    #[test]
    fn size_round_trip_one_byte() {
        assert_eq!(parse_size(&format_size(1)).unwrap(), Some(1));
    }
}
