//! Shared `*`-wildcard-to-anchored-regex conversion, used by the Operation
//! Manager's `getObjects` filter and the Node Registry's `SubscriptionIndex`.
//! `*` matches any (possibly empty) sequence; `?` is not supported; every
//! other regex metacharacter is escaped; matching is case-sensitive and
//! fully anchored.

use iobroker_bridge_commons::Result;
use regex::Regex;

pub fn pattern_to_regex(pattern: &str) -> Result<Regex> {
    let mut out = String::with_capacity(pattern.len() + 2);
    out.push('^');
    for ch in pattern.chars() {
        if ch == '*' {
            out.push_str(".*");
        } else {
            out.push_str(&regex::escape(&ch.to_string()));
        }
    }
    out.push('$');
    Ok(Regex::new(&out)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn star_matches_any_sequence() {
        let re = pattern_to_regex("lights.*").unwrap();
        assert!(re.is_match("lights.kitchen"));
        assert!(re.is_match("lights."));
        assert!(!re.is_match("sensors.temp"));
    }

    #[test]
    fn non_wildcard_metacharacters_are_escaped() {
        let re = pattern_to_regex("system.adapter.a+b").unwrap();
        assert!(re.is_match("system.adapter.a+b"));
        assert!(!re.is_match("system.adapter.aXb"));
    }

    #[test]
    fn matching_is_fully_anchored_and_case_sensitive() {
        let re = pattern_to_regex("sensors.temp").unwrap();
        assert!(re.is_match("sensors.temp"));
        assert!(!re.is_match("sensors.temp2"));
        assert!(!re.is_match("Sensors.temp"));
    }
}
