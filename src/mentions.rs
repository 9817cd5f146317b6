//! `@username` mention parsing and autocomplete.

use std::sync::LazyLock;

use regex::Regex;

use crate::models::UserSummary;

/// `@` must not follow a word character, so e-mail addresses are ignored.
static MENTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|[^\w@])@([A-Za-z0-9_][A-Za-z0-9_.-]{0,31})").expect("valid mention regex")
});

/// Usernames mentioned in `text`, lowercased, de-duplicated, in order of
/// first appearance. Trailing `.` and `-` are treated as punctuation.
pub fn parse_mentions(text: &str) -> Vec<String> {
    let mut found: Vec<String> = Vec::new();
    for caps in MENTION_RE.captures_iter(text) {
        let name = caps[1]
            .trim_end_matches(['.', '-'])
            .to_ascii_lowercase();
        if !name.is_empty() && !found.contains(&name) {
            found.push(name);
        }
    }
    found
}

/// Autocomplete candidates for a partially typed mention. Username prefix
/// matches come before display-name matches.
pub fn suggest<'a>(prefix: &str, users: &'a [UserSummary], limit: usize) -> Vec<&'a UserSummary> {
    let prefix = prefix.trim_start_matches('@').to_lowercase();
    if prefix.is_empty() {
        return users.iter().take(limit).collect();
    }
    let mut by_username: Vec<&UserSummary> = Vec::new();
    let mut by_name: Vec<&UserSummary> = Vec::new();
    for user in users {
        if user.username.to_lowercase().starts_with(&prefix) {
            by_username.push(user);
        } else if user
            .display_name
            .to_lowercase()
            .split_whitespace()
            .any(|word| word.starts_with(&prefix))
        {
            by_name.push(user);
        }
    }
    by_username.extend(by_name);
    by_username.truncate(limit);
    by_username
}
