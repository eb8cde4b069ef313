//! Task progress calculator.
//!
//! Executors report coarse or absent progress; the UI must show visible,
//! non-decreasing motion without ever claiming completion before a terminal
//! callback arrives. The cap constants (90 for a lone running step, 99
//! otherwise) are part of the observed contract — do not re-derive them.

use crate::model::TaskStatus;

/// Compute the task's aggregate progress from its subtask counts.
///
/// - Terminal status returns 100 unconditionally.
/// - A fractional executor signal (`running_progress > 0`) folds into
///   `floor((completed + running/100) / total * 100)`, never regressing
///   below `previous` and capped at 99 while non-terminal.
/// - With no signal, progress pseudo-increments by 1 per recomputation,
///   capped at `floor((completed + 0.9) / total * 100)` — 90 when a single
///   subtask is running cold — and at 99.
pub fn calculate_task_progress(
    total_subtasks: u32,
    completed_subtasks: u32,
    running_progress: u8,
    previous_progress: u8,
    status: TaskStatus,
) -> u8 {
    if status.is_terminal() {
        return 100;
    }

    let total = total_subtasks.max(1) as f64;

    if running_progress > 0 {
        let raw = ((completed_subtasks as f64 + running_progress as f64 / 100.0) / total * 100.0)
            .floor() as u8;
        return raw.max(previous_progress).min(99);
    }

    let candidate = previous_progress.saturating_add(1);
    let cap = (((completed_subtasks as f64 + 0.9) / total) * 100.0).floor() as u8;
    candidate.min(cap).min(99).max(previous_progress)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converges_on_final_states() {
        for status in [TaskStatus::Completed, TaskStatus::Failed, TaskStatus::Cancelled] {
            assert_eq!(calculate_task_progress(1, 0, 0, 10, status), 100);
        }
    }

    #[test]
    fn uses_running_progress_as_fractional_step() {
        // 2 subtasks: 1 completed, 1 running at 50% => (1 + 0.5) / 2 * 100 = 75
        assert_eq!(
            calculate_task_progress(2, 1, 50, 0, TaskStatus::Running),
            75
        );
    }

    #[test]
    fn pseudo_increases_when_running_progress_is_missing() {
        assert_eq!(
            calculate_task_progress(1, 0, 0, 10, TaskStatus::Running),
            11
        );

        // Cap at 90% for a single cold running step (0.9 / 1 * 100).
        assert_eq!(
            calculate_task_progress(1, 0, 0, 89, TaskStatus::Running),
            90
        );
        assert_eq!(
            calculate_task_progress(1, 0, 0, 90, TaskStatus::Running),
            90
        );
    }

    #[test]
    fn never_goes_backward() {
        // No signal after previously higher progress: keep climbing slowly.
        assert_eq!(
            calculate_task_progress(1, 0, 0, 50, TaskStatus::Running),
            51
        );

        // A fractional signal below previous is ignored, not regressed.
        assert_eq!(
            calculate_task_progress(1, 0, 10, 50, TaskStatus::Running),
            50
        );
    }

    #[test]
    fn caps_running_at_99() {
        assert_eq!(
            calculate_task_progress(1, 0, 100, 0, TaskStatus::Running),
            99
        );
    }

    #[test]
    fn pseudo_cap_scales_with_completed_siblings() {
        // 2 subtasks, 1 completed, second running cold: cap is
        // floor(1.9 / 2 * 100) = 95, so progress keeps inching past 90.
        assert_eq!(
            calculate_task_progress(2, 1, 0, 94, TaskStatus::Running),
            95
        );
        assert_eq!(
            calculate_task_progress(2, 1, 0, 95, TaskStatus::Running),
            95
        );
    }

    #[test]
    fn zero_total_does_not_panic() {
        assert_eq!(calculate_task_progress(0, 0, 0, 0, TaskStatus::Running), 1);
    }
}
