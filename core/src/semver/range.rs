//! npm-style version requirements.

use std::cmp::Ordering;
use std::fmt;

use ::semver::Version;

use crate::error::{Result, TurnixError};
use crate::semver::parse_version;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Op::Lt => "<",
            Op::Le => "<=",
            Op::Gt => ">",
            Op::Ge => ">=",
            Op::Eq => "==",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Comparator {
    pub op: Op,
    pub version: Version,
}

impl Comparator {
    fn matches(&self, version: &Version) -> bool {
        let ord = version.cmp_precedence(&self.version);
        match self.op {
            Op::Lt => ord == Ordering::Less,
            Op::Le => ord != Ordering::Greater,
            Op::Gt => ord == Ordering::Greater,
            Op::Ge => ord != Ordering::Less,
            Op::Eq => ord == Ordering::Equal,
        }
    }
}

/// A parsed requirement: all comparators are AND-ed. `parse` returns `None`
/// for the wildcard forms (empty / `*`), meaning "any version".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    pub comparators: Vec<Comparator>,
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .comparators
            .iter()
            .map(|c| format!("{}{}", c.op, c.version))
            .collect();
        write!(f, "{}", parts.join(" "))
    }
}

fn invalid(raw: &str, message: impl Into<String>) -> TurnixError {
    TurnixError::InvalidRange {
        raw: raw.to_string(),
        message: message.into(),
    }
}

/// ^M.m.p caret expansion with 0.x semantics:
///   M > 0          -> >=M.m.p <(M+1).0.0
///   M == 0, m > 0  -> >=0.m.p <0.(m+1).0
///   M == 0, m == 0 -> >=0.0.p <0.0.(p+1)
fn caret_comparators(version: Version) -> (Comparator, Comparator) {
    let upper = if version.major > 0 {
        Version::new(version.major + 1, 0, 0)
    } else if version.minor > 0 {
        Version::new(0, version.minor + 1, 0)
    } else {
        Version::new(0, 0, version.patch + 1)
    };
    (
        Comparator {
            op: Op::Ge,
            version,
        },
        Comparator {
            op: Op::Lt,
            version: upper,
        },
    )
}

/// ~M.m.p tilde expansion:
///   minor or patch set -> >=M.m.p <M.(m+1).0
///   bare major ('~1')  -> >=M.0.0 <(M+1).0.0
fn tilde_comparators(version: Version) -> (Comparator, Comparator) {
    let upper = if version.minor > 0 || version.patch > 0 {
        Version::new(version.major, version.minor + 1, 0)
    } else {
        Version::new(version.major + 1, 0, 0)
    };
    (
        Comparator {
            op: Op::Ge,
            version,
        },
        Comparator {
            op: Op::Lt,
            version: upper,
        },
    )
}

/// Split `a - b` hyphen ranges. The hyphen must be set off by whitespace on at
/// least one side so prerelease versions ("1.2.3-alpha") are not mistaken for
/// ranges.
fn split_hyphen_range(raw: &str) -> Option<(&str, &str)> {
    for (idx, _) in raw.match_indices('-') {
        let left = raw[..idx].trim_end();
        let right = raw[idx + 1..].trim_start();
        let spaced = raw[..idx].ends_with(char::is_whitespace)
            || raw[idx + 1..].starts_with(char::is_whitespace);
        if spaced && !left.is_empty() && !right.is_empty() {
            return Some((left, right));
        }
    }
    None
}

impl Requirement {
    /// Parse a requirement string.
    ///
    /// Accepted forms:
    ///   None / "" / "*"     -> Ok(None) (no constraint)
    ///   "1.2.3"             -> ==1.2.3
    ///   ">=1.2.0 <2.0.0"    -> conjunction
    ///   "^1.2.3"            -> >=1.2.3 <2.0.0 (0.x semantics)
    ///   "~1.2.3"            -> >=1.2.3 <1.3.0
    ///   "1.2.3 - 2.0.0"     -> >=1.2.3 <=2.0.0
    pub fn parse(raw: &str) -> Result<Option<Requirement>> {
        let text = raw.trim();
        if text.is_empty() || text == "*" {
            return Ok(None);
        }

        if let Some((left, right)) = split_hyphen_range(text) {
            let lo = parse_version(left)?;
            let hi = parse_version(right)?;
            if hi.cmp_precedence(&lo) == Ordering::Less {
                return Err(invalid(raw, "hyphen range upper bound is below lower bound"));
            }
            return Ok(Some(Requirement {
                comparators: vec![
                    Comparator {
                        op: Op::Ge,
                        version: lo,
                    },
                    Comparator {
                        op: Op::Le,
                        version: hi,
                    },
                ],
            }));
        }

        let mut comparators = Vec::new();
        for token in text.split_whitespace() {
            if let Some(rest) = token.strip_prefix('^') {
                if rest.is_empty() {
                    return Err(invalid(raw, "missing version after '^'"));
                }
                let (lo, hi) = caret_comparators(parse_version(rest)?);
                comparators.push(lo);
                comparators.push(hi);
                continue;
            }
            if let Some(rest) = token.strip_prefix('~') {
                if rest.is_empty() {
                    return Err(invalid(raw, "missing version after '~'"));
                }
                let (lo, hi) = tilde_comparators(parse_version(rest)?);
                comparators.push(lo);
                comparators.push(hi);
                continue;
            }

            let (op, version_part) = if let Some(rest) = token.strip_prefix("<=") {
                (Op::Le, rest)
            } else if let Some(rest) = token.strip_prefix(">=") {
                (Op::Ge, rest)
            } else if let Some(rest) = token.strip_prefix("==") {
                (Op::Eq, rest)
            } else if let Some(rest) = token.strip_prefix('<') {
                (Op::Lt, rest)
            } else if let Some(rest) = token.strip_prefix('>') {
                (Op::Gt, rest)
            } else if let Some(rest) = token.strip_prefix('=') {
                (Op::Eq, rest)
            } else {
                (Op::Eq, token)
            };

            if version_part.is_empty() {
                return Err(invalid(raw, format!("missing version after operator in '{token}'")));
            }
            comparators.push(Comparator {
                op,
                version: parse_version(version_part)?,
            });
        }

        if comparators.is_empty() {
            return Ok(None);
        }
        Ok(Some(Requirement { comparators }))
    }

    /// True when `version` satisfies every comparator.
    pub fn matches(&self, version: &Version) -> bool {
        self.comparators.iter().all(|c| c.matches(version))
    }
}

/// Filter `candidates` by `requirement` and pick the highest version. Ties
/// keep the first candidate in input order, which is how save-layer packs win
/// over content-layer packs upstream.
pub fn best_match<T: Clone>(
    candidates: &[(Version, T)],
    requirement: Option<&Requirement>,
) -> Option<(Version, T)> {
    let mut best: Option<&(Version, T)> = None;
    for candidate in candidates {
        if let Some(req) = requirement {
            if !req.matches(&candidate.0) {
                continue;
            }
        }
        match best {
            None => best = Some(candidate),
            Some(current) => {
                if candidate.0.cmp_precedence(&current.0) == Ordering::Greater {
                    best = Some(candidate);
                }
            }
        }
    }
    best.cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(raw: &str) -> Version {
        parse_version(raw).unwrap()
    }

    fn req(raw: &str) -> Requirement {
        Requirement::parse(raw).unwrap().unwrap()
    }

    #[test]
    fn wildcard_forms_are_none() {
        assert!(Requirement::parse("").unwrap().is_none());
        assert!(Requirement::parse("*").unwrap().is_none());
        assert!(Requirement::parse("   ").unwrap().is_none());
    }

    #[test]
    fn bare_version_is_equality() {
        let r = req("1.2.3");
        assert!(r.matches(&v("1.2.3")));
        assert!(!r.matches(&v("1.2.4")));
        // Build metadata plays no part in equality
        assert!(r.matches(&v("1.2.3+meta")));
    }

    #[test]
    fn relational_conjunction() {
        let r = req(">=1.2.0 <2.0.0");
        assert!(r.matches(&v("1.2.0")));
        assert!(r.matches(&v("1.9.9")));
        assert!(!r.matches(&v("2.0.0")));
        assert!(!r.matches(&v("1.1.9")));
    }

    #[test]
    fn caret_semantics() {
        let r = req("^1.2.3");
        assert!(r.matches(&v("1.2.3")));
        assert!(r.matches(&v("1.9.0")));
        assert!(!r.matches(&v("2.0.0")));

        let r = req("^0.1.2");
        assert!(r.matches(&v("0.1.5")));
        assert!(!r.matches(&v("0.2.0")));

        // ^0.0.3 matches 0.0.3 only
        let r = req("^0.0.3");
        assert!(r.matches(&v("0.0.3")));
        assert!(!r.matches(&v("0.0.4")));
    }

    #[test]
    fn tilde_semantics() {
        let r = req("~1.2.3");
        assert!(r.matches(&v("1.2.3")));
        assert!(r.matches(&v("1.2.9")));
        assert!(!r.matches(&v("1.3.0")));

        let r = req("~1");
        assert!(r.matches(&v("1.9.0")));
        assert!(!r.matches(&v("2.0.0")));
    }

    #[test]
    fn hyphen_range() {
        let r = req("1.2.3 - 2.0.0");
        assert!(r.matches(&v("1.2.3")));
        assert!(r.matches(&v("2.0.0")));
        assert!(!r.matches(&v("2.0.1")));
        assert!(!r.matches(&v("1.2.2")));
    }

    #[test]
    fn reversed_hyphen_range_is_error() {
        assert!(Requirement::parse("2.0.0 - 1.0.0").is_err());
    }

    #[test]
    fn prerelease_is_not_a_hyphen_range() {
        let r = req("1.2.3-alpha");
        assert!(r.matches(&v("1.2.3-alpha")));
        assert!(!r.matches(&v("1.2.3")));
    }

    #[test]
    fn dangling_operators_are_errors() {
        assert!(Requirement::parse("^").is_err());
        assert!(Requirement::parse("~").is_err());
        assert!(Requirement::parse(">=").is_err());
    }

    #[test]
    fn prerelease_below_stable_in_bounds() {
        let r = req("<1.0.0");
        assert!(r.matches(&v("1.0.0-alpha")));
        let r = req(">=1.0.0");
        assert!(!r.matches(&v("1.0.0-alpha")));
    }

    #[test]
    fn best_match_picks_highest_and_keeps_input_order_on_ties() {
        let candidates = vec![
            (v("1.2.3"), "saves"),
            (v("1.0.0"), "low"),
            (v("1.2.3"), "content"),
        ];
        let requirement = Requirement::parse("^1.0.0").unwrap();
        let best = best_match(&candidates, requirement.as_ref()).unwrap();
        assert_eq!(best.0, v("1.2.3"));
        assert_eq!(best.1, "saves");
    }

    #[test]
    fn best_match_none_when_nothing_satisfies() {
        let candidates = vec![(v("0.9.0"), ())];
        let requirement = Requirement::parse("^1.0.0").unwrap();
        assert!(best_match(&candidates, requirement.as_ref()).is_none());
    }
}
