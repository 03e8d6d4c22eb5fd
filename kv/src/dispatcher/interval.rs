//! Interval-string parsing for scheduled pipelines and lambdas, grounded
//! on the original `parse_time_string`: a sequence of `<amount><unit>`
//! fragments (`q`uarter, `M`onth, `w`eek, `d`ay, `h`our, `m`inute,
//! `s`econd) summed into a total duration.

use std::time::Duration;

use regex::Regex;

const SECONDS_PER_QUARTER: u64 = 7_884_000; // 91.25 days
const SECONDS_PER_MONTH: u64 = 2_628_000; // 30.42 days
const SECONDS_PER_WEEK: u64 = 604_800;
const SECONDS_PER_DAY: u64 = 86_400;
const SECONDS_PER_HOUR: u64 = 3_600;
const SECONDS_PER_MINUTE: u64 = 60;

fn seconds_for_unit(unit: &str) -> u64 {
    match unit {
        "q" => SECONDS_PER_QUARTER,
        "M" => SECONDS_PER_MONTH,
        "w" => SECONDS_PER_WEEK,
        "d" => SECONDS_PER_DAY,
        "h" => SECONDS_PER_HOUR,
        "m" => SECONDS_PER_MINUTE,
        "s" => 1,
        _ => 0,
    }
}

/// Parses a string like `"2w3d5h20m30s"` into a `Duration`. Components may
/// appear in any order and repeat; unrecognised text between matches is
/// ignored. An empty or fully unrecognised string yields `Duration::ZERO`.
pub fn parse_interval(s: &str) -> Duration {
    let re = Regex::new(r"(\d+)([qMwdhms])").expect("static pattern is valid");
    let total_seconds: u64 = re
        .captures_iter(s)
        .map(|cap| {
            let amount: u64 = cap[1].parse().unwrap_or(0);
            amount.saturating_mul(seconds_for_unit(&cap[2]))
        })
        .sum();
    Duration::from_secs(total_seconds)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combined_units_sum_correctly() {
        assert_eq!(parse_interval("2w3d5h20m30s"), Duration::from_secs(1_488_030));
    }

    #[test]
    fn empty_string_is_zero() {
        assert_eq!(parse_interval(""), Duration::ZERO);
    }

    #[test]
    fn unrecognised_text_is_zero() {
        assert_eq!(parse_interval("soon"), Duration::ZERO);
    }

    #[test]
    fn single_unit_components() {
        assert_eq!(parse_interval("1q"), Duration::from_secs(SECONDS_PER_QUARTER));
        assert_eq!(parse_interval("1M"), Duration::from_secs(SECONDS_PER_MONTH));
        assert_eq!(parse_interval("1d"), Duration::from_secs(SECONDS_PER_DAY));
    }
}
