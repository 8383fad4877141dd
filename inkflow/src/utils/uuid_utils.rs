//! Run identifier generation.

use uuid::Uuid;

/// Generates a new run id (UUID v7, time-ordered so run directories sort by age).
#[must_use]
pub fn generate_run_id() -> String {
    Uuid::now_v7().to_string()
}

/// Returns true if `value` is safe to use as a run directory name.
#[must_use]
pub fn is_valid_run_id(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= 128
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_run_id_is_v7() {
        let id = generate_run_id();
        let parsed = Uuid::parse_str(&id).unwrap();
        assert_eq!(parsed.get_version_num(), 7);
        assert!(is_valid_run_id(&id));
    }

    #[test]
    fn test_run_ids_are_unique() {
        assert_ne!(generate_run_id(), generate_run_id());
    }

    #[test]
    fn test_invalid_run_ids() {
        assert!(!is_valid_run_id(""));
        assert!(!is_valid_run_id("../escape"));
        assert!(!is_valid_run_id("with space"));
        assert!(is_valid_run_id("novel_01"));
    }
}
