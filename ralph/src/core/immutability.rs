//! Completion-flag monotonicity across iterations.
//!
//! Once the driver has observed a task as completed, no later read may see
//! it open again. The agent owns the task list between iterations, so the
//! controller compares snapshots after every invocation and restores any
//! completed task the agent reopened or dropped.

use std::collections::HashMap;

use crate::core::types::Task;

/// Describe every completed task in `prev` that is reopened or missing in `next`.
///
/// Returns stable messages sorted by task id.
pub fn check_completed_task_regressions(prev: &[Task], next: &[Task]) -> Vec<String> {
    let next_index: HashMap<u32, &Task> = next.iter().map(|task| (task.id, task)).collect();
    let mut completed: Vec<&Task> = prev.iter().filter(|task| task.completed).collect();
    completed.sort_by_key(|task| task.id);

    let mut errors = Vec::new();
    for task in completed {
        match next_index.get(&task.id) {
            None => errors.push(format!("completed task {} missing in next list", task.id)),
            Some(found) if !found.completed => {
                errors.push(format!("completed task {} was reopened", task.id));
            }
            Some(_) => {}
        }
    }
    errors
}

/// Merge `prev` completions into `next` so completed tasks stay completed.
///
/// Reopened tasks get `completed = true` back; dropped completed tasks are
/// re-appended in their previous form. Returns the restored ids in
/// ascending order (empty when `next` already respected monotonicity).
pub fn restore_completed_tasks(prev: &[Task], next: &mut Vec<Task>) -> Vec<u32> {
    let mut restored = Vec::new();
    for previous in prev.iter().filter(|task| task.completed) {
        match next.iter_mut().find(|task| task.id == previous.id) {
            Some(current) if !current.completed => {
                current.completed = true;
                restored.push(previous.id);
            }
            Some(_) => {}
            None => {
                next.push(previous.clone());
                restored.push(previous.id);
            }
        }
    }
    restored.sort_unstable();
    restored
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::task;

    #[test]
    fn unchanged_completions_are_accepted() {
        let prev = vec![task(1, true), task(2, false)];
        let next = vec![task(1, true), task(2, true)];
        assert!(check_completed_task_regressions(&prev, &next).is_empty());
    }

    #[test]
    fn reopened_and_missing_tasks_are_reported() {
        let prev = vec![task(1, true), task(2, true), task(3, false)];
        let next = vec![task(1, false), task(3, false)];
        let errors = check_completed_task_regressions(&prev, &next);
        assert_eq!(
            errors,
            vec![
                "completed task 1 was reopened".to_string(),
                "completed task 2 missing in next list".to_string(),
            ]
        );
    }

    #[test]
    fn restore_reinstates_completion() {
        let prev = vec![task(1, true), task(2, true), task(3, false)];
        let mut next = vec![task(1, false), task(3, false), task(4, false)];
        let restored = restore_completed_tasks(&prev, &mut next);
        assert_eq!(restored, vec![1, 2]);
        assert!(next.iter().find(|t| t.id == 1).expect("task 1").completed);
        assert!(next.iter().find(|t| t.id == 2).expect("task 2").completed);
        assert!(!next.iter().find(|t| t.id == 3).expect("task 3").completed);
        assert!(check_completed_task_regressions(&prev, &next).is_empty());
    }

    #[test]
    fn open_tasks_may_be_edited_or_removed() {
        let prev = vec![task(1, false), task(2, false)];
        let mut next = vec![task(2, false)];
        assert!(restore_completed_tasks(&prev, &mut next).is_empty());
        assert_eq!(next.len(), 1);
    }
}
