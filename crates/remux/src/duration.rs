use std::time::Duration;

/// Scrapes the captured duration out of the remuxer's progress log.
///
/// ffmpeg reports progress as `... time=HH:MM:SS.cc bitrate=...`; the last
/// such token is the final position of the output stream. Returns `None`
/// when no token is present (e.g. the process died before writing any
/// progress), which callers should treat as zero.
pub fn parse_last_duration(log: &str) -> Option<Duration> {
    let token_start = log.rfind("time=")? + "time=".len();
    let rest = &log[token_start..];
    let token = rest
        .split(|c: char| c.is_whitespace())
        .next()?
        .trim_end_matches(',');
    parse_clock(token)
}

fn parse_clock(token: &str) -> Option<Duration> {
    let mut parts = token.split(':');
    let hours: u64 = parts.next()?.parse().ok()?;
    let minutes: u64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() || !(0.0..60.0).contains(&seconds) || minutes >= 60 {
        return None;
    }
    Some(Duration::from_secs_f64(
        (hours * 3600 + minutes * 60) as f64 + seconds,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_the_last_time_token() {
        let log = "frame=  100 time=00:00:10.00 bitrate=x\n\
                   frame=  200 time=00:03:21.45 bitrate=y\n";
        let duration = parse_last_duration(log).unwrap();
        assert_eq!(duration.as_millis(), 201_450);
    }

    #[test]
    fn handles_hours() {
        let duration = parse_last_duration("time=02:15:00.00 ").unwrap();
        assert_eq!(duration.as_secs(), 2 * 3600 + 15 * 60);
    }

    #[test]
    fn missing_token_is_none() {
        assert!(parse_last_duration("no progress lines at all").is_none());
        assert!(parse_last_duration("").is_none());
    }

    #[test]
    fn malformed_token_is_none() {
        assert!(parse_last_duration("time=garbage ").is_none());
        assert!(parse_last_duration("time=1:99:00.0 ").is_none());
    }
}
