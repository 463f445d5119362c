//! Lenient version parsing.

use ::semver::Version;

use crate::error::{Result, TurnixError};

fn invalid(raw: &str, message: impl Into<String>) -> TurnixError {
    TurnixError::InvalidVersion {
        raw: raw.to_string(),
        message: message.into(),
    }
}

fn is_numeric_component(part: &str) -> bool {
    !part.is_empty()
        && part.chars().all(|c| c.is_ascii_digit())
        && (part == "0" || !part.starts_with('0'))
}

/// Parse a semantic version string, accepting the lenient forms pack
/// manifests use.
///
/// Accepted (examples):
///   "1"            -> 1.0.0
///   "1.2"          -> 1.2.0
///   "1.2.3"        -> 1.2.3
///   "v1.2.3"       -> 1.2.3
///   "1.2.3-alpha.1"
///   "1.2.3+build.1"
///
/// Rejected: ".1", "1.", "1..3", "1.2.3.4", "01.2.3" (leading zeroes).
pub fn parse_version(raw: &str) -> Result<Version> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(invalid(raw, "version string cannot be empty"));
    }

    // Accept a single leading 'v' before a digit (v1.2.3 -> 1.2.3)
    let mut text = trimmed;
    let mut chars = text.chars();
    if chars.next() == Some('v') {
        if matches!(chars.next(), Some(c) if c.is_ascii_digit()) {
            text = &text[1..];
        }
    }

    // Split into numeric core and -prerelease/+build suffix
    let sep = text
        .find(|c| c == '-' || c == '+')
        .unwrap_or(text.len());
    let core = &text[..sep];
    let suffix = &text[sep..];

    let parts: Vec<&str> = core.split('.').collect();
    if parts.is_empty() || parts.len() > 3 {
        return Err(invalid(raw, format!("invalid version core '{core}'")));
    }
    for part in &parts {
        if !is_numeric_component(part) {
            return Err(invalid(raw, format!("invalid numeric component '{part}'")));
        }
    }

    let mut nums: Vec<&str> = parts;
    while nums.len() < 3 {
        nums.push("0");
    }
    let normalized = format!("{}.{}.{}{}", nums[0], nums[1], nums[2], suffix);

    Version::parse(&normalized).map_err(|err| invalid(raw, err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::Ordering;

    #[test]
    fn parses_lenient_forms() {
        assert_eq!(parse_version("1").unwrap(), Version::new(1, 0, 0));
        assert_eq!(parse_version("1.2").unwrap(), Version::new(1, 2, 0));
        assert_eq!(parse_version("1.2.3").unwrap(), Version::new(1, 2, 3));
        assert_eq!(parse_version("v1.2.3").unwrap(), Version::new(1, 2, 3));
        assert_eq!(parse_version("0.1").unwrap(), Version::new(0, 1, 0));
        assert_eq!(parse_version(" 1.2.3 ").unwrap(), Version::new(1, 2, 3));
    }

    #[test]
    fn parses_prerelease_and_build() {
        let v = parse_version("1.2.3-alpha.1+build.7").unwrap();
        assert_eq!(v.pre.as_str(), "alpha.1");
        assert_eq!(v.build.as_str(), "build.7");
    }

    #[test]
    fn rejects_malformed() {
        for raw in [".1", "1.", "1..3", "1.2.3.4", "01.2.3", "", "  ", "banana", "1.x"] {
            assert!(parse_version(raw).is_err(), "should reject {raw:?}");
        }
    }

    #[test]
    fn round_trips() {
        for raw in ["1.2.3", "0.0.1", "1.2.3-alpha.1", "2.0.0-rc.1+meta"] {
            let v = parse_version(raw).unwrap();
            assert_eq!(parse_version(&v.to_string()).unwrap(), v);
        }
    }

    #[test]
    fn prerelease_sorts_below_stable() {
        let pre = parse_version("1.0.0-alpha").unwrap();
        let stable = parse_version("1.0.0").unwrap();
        assert_eq!(pre.cmp_precedence(&stable), Ordering::Less);
    }

    #[test]
    fn build_metadata_does_not_affect_ordering() {
        let a = parse_version("1.2.3+one").unwrap();
        let b = parse_version("1.2.3+two").unwrap();
        assert_eq!(a.cmp_precedence(&b), Ordering::Equal);
    }
}
