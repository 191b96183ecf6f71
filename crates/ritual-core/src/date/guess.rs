use std::sync::LazyLock;

use chrono::NaiveDateTime;
use regex::Regex;

const YEAR: &str = r"(?:20|19)\d{2}";
const MONTH: &str = r"(?:0[1-9]|1[0-2])";
const DAY: &str = r"[0-3]\d";

struct DatePattern {
    regex: Regex,
    format: &'static str,
    /// Characters of the match fed to the parser (the compact form may be followed by millis)
    take: Option<usize>,
}

fn pattern(body: String, format: &'static str, take: Option<usize>) -> DatePattern {
    DatePattern {
        // Patterns are built from constants above
        regex: Regex::new(&format!("(?P<date>{body})")).unwrap(),
        format,
        take,
    }
}

static PATTERNS: LazyLock<Vec<DatePattern>> = LazyLock::new(|| {
    vec![
        // Screenshot_20190919-053857.jpg
        pattern(format!(r"{YEAR}{MONTH}{DAY}-\d{{6}}"), "%Y%m%d-%H%M%S", None),
        // IMG_20190509_154733.jpg, VID_20240131_101010.mp4
        pattern(format!(r"{YEAR}{MONTH}{DAY}_\d{{6}}"), "%Y%m%d_%H%M%S", None),
        // signal-2020-10-26-16-38-32.jpg
        pattern(format!(r"{YEAR}-{MONTH}-{DAY}-\d{{2}}-\d{{2}}-\d{{2}}"), "%Y-%m-%d-%H-%M-%S", None),
        // signal-2020-10-26-163832.jpg
        pattern(format!(r"{YEAR}-{MONTH}-{DAY}-\d{{6}}"), "%Y-%m-%d-%H%M%S", None),
        // 2016_01_30_11_49_15.mp4
        pattern(format!(r"{YEAR}_{MONTH}_{DAY}_\d{{2}}_\d{{2}}_\d{{2}}"), "%Y_%m_%d_%H_%M_%S", None),
        // 20190509154733123.jpg (trailing millis ignored)
        pattern(format!(r"{YEAR}{MONTH}{DAY}\d{{6}}"), "%Y%m%d%H%M%S", Some(14)),
    ]
});

/// Guess a capture timestamp from common camera / messenger filename patterns.
pub fn guess_date_from_filename(filename: &str) -> Option<NaiveDateTime> {
    PATTERNS.iter().find_map(|pat| {
        let matched = pat.regex.captures(filename)?.name("date")?.as_str();
        let s = match pat.take {
            Some(n) => &matched[..n.min(matched.len())],
            None => matched,
        };
        NaiveDateTime::parse_from_str(s, pat.format).ok()
    })
}
