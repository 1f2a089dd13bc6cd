//! The predicate a `Listener` uses to pick an upstream `Server`.

/// Selects zero or more servers from the fleet. `tags` is an all-of
/// (intersection) match: a candidate must carry every listed tag, not just
/// one of them. `ignore_all` short-circuits selection to the `direct`
/// singleton regardless of every other field.
#[derive(Debug, Clone, Default)]
pub struct ServerFilter {
    pub tags: Vec<String>,
    pub server_ids: Vec<String>,
    pub ignore_all: bool,
}

impl ServerFilter {
    pub fn ignore_all() -> Self {
        Self { ignore_all: true, ..Default::default() }
    }

    pub fn by_tags(tags: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self { tags: tags.into_iter().map(Into::into).collect(), ..Default::default() }
    }

    pub fn by_server_id(id: impl Into<String>) -> Self {
        Self { server_ids: vec![id.into()], ..Default::default() }
    }

    /// Whether a candidate carrying `tags` and `id` satisfies this filter,
    /// ignoring the `ignore_all` shortcut (the manager handles that case
    /// before ever calling this).
    pub fn matches(&self, id: &str, tags: &std::collections::HashSet<String>) -> bool {
        if !self.server_ids.is_empty() && !self.server_ids.iter().any(|sid| sid == id) {
            return false;
        }
        self.tags.iter().all(|t| tags.contains(t))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn tags(values: &[&str]) -> HashSet<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn all_of_semantics_require_every_tag() {
        let filter = ServerFilter::by_tags(["socks5", "us"]);
        assert!(filter.matches("s1", &tags(&["socks5", "us", "fast"])));
        assert!(!filter.matches("s1", &tags(&["socks5"])));
    }

    #[test]
    fn server_ids_restrict_candidates() {
        let filter = ServerFilter::by_server_id("s1");
        assert!(filter.matches("s1", &tags(&[])));
        assert!(!filter.matches("s2", &tags(&[])));
    }

    #[test]
    fn empty_filter_matches_anything() {
        let filter = ServerFilter::default();
        assert!(filter.matches("anything", &tags(&[])));
    }
}
