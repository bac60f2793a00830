//! Semantic task-list invariants not expressible via JSON Schema.

use std::collections::HashSet;

use crate::core::types::Task;

/// Check semantic invariants not expressible in JSON Schema:
/// - No duplicate ids
/// - Ids are positive
/// - Descriptions are not blank
pub fn validate_invariants(tasks: &[Task]) -> Vec<String> {
    let mut errors = Vec::new();
    let mut seen = HashSet::new();
    for task in tasks {
        if !seen.insert(task.id) {
            errors.push(format!("duplicate task id {}", task.id));
        }
        if task.id == 0 {
            errors.push("task ids must start at 1".to_string());
        }
        if task.description.trim().is_empty() {
            errors.push(format!("task {}: description must not be empty", task.id));
        }
    }
    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::task;

    #[test]
    fn valid_list_has_no_errors() {
        let tasks = vec![task(1, false), task(2, true)];
        assert!(validate_invariants(&tasks).is_empty());
    }

    #[test]
    fn reports_duplicate_and_zero_ids() {
        let tasks = vec![task(1, false), task(1, true), task(0, false)];
        let errors = validate_invariants(&tasks);
        assert!(errors.iter().any(|err| err.contains("duplicate task id 1")));
        assert!(errors.iter().any(|err| err.contains("start at 1")));
    }

    #[test]
    fn reports_blank_description() {
        let mut blank = task(3, false);
        blank.description = "   ".to_string();
        let errors = validate_invariants(&[blank]);
        assert_eq!(errors, vec!["task 3: description must not be empty"]);
    }
}
