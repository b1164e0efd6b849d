// Human-readable file sizes, base 1024.

use std::sync::LazyLock;

use regex::Regex;

pub(crate) static SIZE_SELECTOR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*([0-9]+)((?i)[bkmg]?)(!?)\s*$").unwrap());

const SUFFIXES: &[&str] = &["B", "KiB", "MiB", "GiB", "TiB", "PiB"];

/// Returns true if `s` conforms to the human size grammar (`500M`, `700m!`).
pub fn matches_human_size(s: &str) -> bool {
    SIZE_SELECTOR.is_match(s)
}

/// Parses a human-formatted size into bytes, `0` if it does not conform.
pub fn human_size_parse(s: &str) -> u64 {
    let Some(caps) = SIZE_SELECTOR.captures(s) else {
        return 0;
    };

    parse_parts(&caps[1], &caps[2], 1024.0)
}

pub(crate) fn parse_parts(num: &str, suffix: &str, base: f64) -> u64 {
    let Ok(value) = num.parse::<f64>() else {
        return 0;
    };

    let m = suffix.to_ascii_lowercase();

    match m.chars().next() {
        None | Some('b') => value as u64,
        Some('k') => (value * base) as u64,
        Some('m') => (value * base * base) as u64,
        Some('g') => (value * base * base * base) as u64,
        _ => 0,
    }
}

/// Formats a byte count with `B KiB MiB GiB TiB PiB` suffixes at one decimal.
pub fn human_size_format(size: f64) -> String {
    let mut size = size;
    let mut i = 0;

    while i < SUFFIXES.len() - 1 && size > 1024.0 {
        size /= 1024.0;
        i += 1;
    }

    format!("{size:5.1}{}", SUFFIXES[i])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_plain_bytes() {
        assert_eq!(human_size_parse("123"), 123);
        assert_eq!(human_size_parse(" 42b "), 42);
    }

    #[test]
    fn parse_suffixes_base_1024() {
        assert_eq!(human_size_parse("1k"), 1024);
        assert_eq!(human_size_parse("2K"), 2048);
        assert_eq!(human_size_parse("3M"), 3 * 1024 * 1024);
        assert_eq!(human_size_parse("1G"), 1024 * 1024 * 1024);
    }

    #[test]
    fn parse_accepts_force_flag() {
        assert_eq!(human_size_parse("50M!"), 50 * 1024 * 1024);
        assert!(matches_human_size("50M!"));
        assert!(!matches_human_size("50X"));
        assert!(!matches_human_size("sm9--aac"));
    }

    #[test]
    fn format_picks_suffix() {
        assert_eq!(human_size_format(100.0), "100.0B");
        assert_eq!(human_size_format(2048.0), "  2.0KiB");
        assert_eq!(human_size_format(5.0 * 1024.0 * 1024.0), "  5.0MiB");
    }

    #[test]
    fn format_parse_round_trips_within_one_step() {
        // Round-tripping is lossy to one decimal of the chosen 1024 step.
        for &size in &[1500u64, 80 << 20, 3 << 30, 7 << 40] {
            let formatted = human_size_format(size as f64);
            let trimmed = formatted.trim();
            let num: f64 = trimmed
                .trim_end_matches(|c: char| c.is_ascii_alphabetic())
                .parse()
                .unwrap();
            let step = match &trimmed[trimmed.len() - 3..] {
                "KiB" => 1024f64,
                "MiB" => 1024f64 * 1024.0,
                "GiB" => 1024f64 * 1024.0 * 1024.0,
                "TiB" => 1024f64 * 1024.0 * 1024.0 * 1024.0,
                _ => 1.0,
            };
            let back = num * step;
            assert!((back - size as f64).abs() <= step * 0.1);
        }
    }
}
