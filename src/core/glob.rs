//! Path glob matching for repo-relative paths.
//!
//! - `*` matches within one path segment
//! - `?` matches one character within a segment
//! - `**/` matches zero or more leading directories; a trailing `**` matches
//!   everything below

use regex::Regex;

/// Translate a glob into an anchored regex.
pub fn glob_to_regex(pattern: &str) -> Result<Regex, regex::Error> {
    let mut re = String::with_capacity(pattern.len() * 2 + 2);
    re.push('^');
    let chars: Vec<char> = pattern.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '*' if chars.get(i + 1) == Some(&'*') => {
                if chars.get(i + 2) == Some(&'/') {
                    re.push_str("(?:.*/)?");
                    i += 3;
                } else {
                    re.push_str(".*");
                    i += 2;
                }
                continue;
            }
            '*' => re.push_str("[^/]*"),
            '?' => re.push_str("[^/]"),
            c => re.push_str(&regex::escape(&c.to_string())),
        }
        i += 1;
    }
    re.push('$');
    Regex::new(&re)
}

/// Match `path` against `pattern`; a malformed pattern matches nothing.
pub fn glob_match(pattern: &str, path: &str) -> bool {
    let path = path.trim_start_matches("./");
    glob_to_regex(pattern)
        .map(|re| re.is_match(path))
        .unwrap_or(false)
}
