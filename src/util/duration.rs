/// Parses an `itunes:duration` value into whole seconds.
///
/// Apple allows either a plain number of seconds or a clock value:
/// `HH:MM:SS`, `H:MM:SS`, `MM:SS`, `M:SS`. Fractional seconds are truncated.
/// Anything else (negative numbers, garbage, more than three fields) is
/// `None`; a half-parsed clock value is not guessed at.
pub fn parse_duration(raw: &str) -> Option<u32> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }

    let parts: Vec<&str> = s.split(':').map(str::trim).collect();
    let (hours, minutes, seconds) = match parts.as_slice() {
        [secs] => return whole_seconds(secs),
        [m, secs] => (0, m.parse::<u32>().ok()?, whole_seconds(secs)?),
        [h, m, secs] => (
            h.parse::<u32>().ok()?,
            m.parse::<u32>().ok()?,
            whole_seconds(secs)?,
        ),
        _ => return None,
    };

    hours
        .checked_mul(3600)?
        .checked_add(minutes.checked_mul(60)?)?
        .checked_add(seconds)
}

fn whole_seconds(s: &str) -> Option<u32> {
    let value: f64 = s.parse().ok()?;
    if !value.is_finite() || value < 0.0 || value > f64::from(u32::MAX) {
        return None;
    }
    Some(value.trunc() as u32)
}
