//! Parser for the human-readable durations used in config files and HTTP
//! headers (`"30s"`, `"1m30s"`, `"2h"`). Same `nom` idiom as the changer
//! status parser, applied to a much smaller grammar.

use std::time::Duration;

use nom::{character::complete::one_of, multi::many1};

use crate::parsing::{parse_complete, parse_u64, IResult};

fn unit_seconds(u: char) -> u64 {
    match u {
        'h' => 3600,
        'm' => 60,
        's' => 1,
        _ => unreachable!(),
    }
}

fn component(i: &str) -> IResult<&str, u64> {
    let (i, n) = parse_u64(i)?;
    let (i, unit) = one_of("hms")(i)?;
    Ok((i, n * unit_seconds(unit)))
}

fn components(i: &str) -> IResult<&str, u64> {
    let (i, parts) = many1(component)(i)?;
    Ok((i, parts.into_iter().sum()))
}

/// Parse a duration such as `"30s"`, `"1m30s"` or `"2h"`. A bare integer is
/// interpreted as a count of seconds, matching how the original tooling's
/// duration header accepted a raw number when no unit was given.
pub fn parse_duration(text: &str) -> Result<Duration, anyhow::Error> {
    let text = text.trim();
    if text.is_empty() {
        anyhow::bail!("empty duration");
    }

    if let Ok(secs) = text.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let secs = parse_complete("duration", text, components)?;
    Ok(Duration::from_secs(secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_seconds() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
    }

    #[test]
    fn minutes_and_seconds() {
        assert_eq!(parse_duration("1m30s").unwrap(), Duration::from_secs(90));
    }

    #[test]
    fn hours() {
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
    }

    #[test]
    fn bare_number_is_seconds() {
        assert_eq!(parse_duration("5").unwrap(), Duration::from_secs(5));
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_duration("not-a-duration").is_err());
    }
}
