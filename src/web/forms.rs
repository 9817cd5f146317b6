//! Url-encoded form bodies with repeated keys.
//!
//! `axum::Form` deserializes through `serde_urlencoded`, which cannot
//! collect `assignee=1&assignee=2` into a `Vec`. Forms with checkbox
//! lists are extracted as `Form<Vec<(String, String)>>` and read through
//! [`FormFields`].

#[derive(Debug, Default, Clone)]
pub struct FormFields(Vec<(String, String)>);

impl FormFields {
    pub fn new(pairs: Vec<(String, String)>) -> Self {
        Self(pairs)
    }

    /// First value for `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// First value for `key`, or an empty string.
    pub fn text(&self, key: &str) -> String {
        self.get(key).unwrap_or_default().to_string()
    }

    /// Non-blank value for `key`.
    pub fn optional(&self, key: &str) -> Option<String> {
        self.get(key)
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    }

    pub fn checked(&self, key: &str) -> bool {
        matches!(self.get(key), Some("on" | "true" | "1"))
    }

    /// Every value of `key` that parses as an id, de-duplicated.
    pub fn ids(&self, key: &str) -> Vec<i64> {
        let mut ids: Vec<i64> = Vec::new();
        for id in self
            .0
            .iter()
            .filter(|(k, _)| k == key)
            .filter_map(|(_, v)| v.trim().parse().ok())
        {
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        ids
    }
}
