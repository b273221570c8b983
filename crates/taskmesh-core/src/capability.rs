/// Capability tag that matches every task type.
pub const WILDCARD: &str = "*";

/// Returns true if a worker advertising `capabilities` can take a task of `task_type`.
///
/// An empty type matches any worker; otherwise the type must be listed
/// literally or the worker must advertise [`WILDCARD`].
pub fn capability_matches<S: AsRef<str>>(capabilities: &[S], task_type: &str) -> bool {
    task_type.is_empty()
        || capabilities
            .iter()
            .any(|c| c.as_ref() == task_type || c.as_ref() == WILDCARD)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_match() {
        let caps = vec!["shell".to_string(), "file_operation".to_string()];
        assert!(capability_matches(&caps, "shell"));
        assert!(!capability_matches(&caps, "web_search"));
    }

    #[test]
    fn test_wildcard_matches_everything() {
        let caps = vec![WILDCARD.to_string()];
        assert!(capability_matches(&caps, "shell"));
        assert!(capability_matches(&caps, "anything-at-all"));
        assert!(capability_matches(&caps, ""));
    }

    #[test]
    fn test_empty_type_matches_worker_without_capabilities() {
        let caps: Vec<String> = vec![];
        assert!(capability_matches(&caps, ""));
        assert!(!capability_matches(&caps, "shell"));
    }
}
