//! Pure comparison between a remote list snapshot and cached records.
//!
//! The diff never performs IO; it only decides what the cycle has to do.
//! Partially synchronized records (a classification without its artifact,
//! a due date without its event) surface as altered with the matching flag
//! set, so an interrupted cycle heals on the next pass without repeating
//! classification.

use std::collections::HashMap;

use crate::model::RemoteTask;
use crate::store::TaskRecord;

/// What changed for one task that exists on both sides.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChangeSet {
    /// Remote modification stamp differs from the cached one.
    pub drifted: bool,
    /// Remote task is completed but the record is not.
    pub newly_completed: bool,
    /// Remote due date is present and differs from the cached one.
    pub due_changed: bool,
    /// Record wants an artifact but none was ever created.
    pub artifact_missing: bool,
    /// Task has a due date but no calendar event is on record.
    pub event_missing: bool,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        !(self.drifted
            || self.newly_completed
            || self.due_changed
            || self.artifact_missing
            || self.event_missing)
    }
}

/// A task present on both sides with at least one pending change.
#[derive(Debug, Clone)]
pub struct AlteredTask {
    pub task: RemoteTask,
    pub record: TaskRecord,
    pub change: ChangeSet,
}

/// Outcome of diffing one monitored list.
#[derive(Debug, Clone, Default)]
pub struct ListDiff {
    /// Remote tasks with no cached record.
    pub new: Vec<RemoteTask>,
    /// Tasks on both sides with pending changes.
    pub altered: Vec<AlteredTask>,
    /// Cached records whose task no longer exists remotely.
    pub removed: Vec<TaskRecord>,
    /// Tasks on both sides with nothing to do.
    pub unchanged: usize,
}

/// Compare one list's remote tasks against its cached records.
///
/// Remote order is preserved for `new` and `altered`; `removed` is sorted
/// by task id so cycles process deletions deterministically.
pub fn diff_list(remote: &[RemoteTask], cached: &[TaskRecord]) -> ListDiff {
    let mut by_id: HashMap<&str, &TaskRecord> =
        cached.iter().map(|r| (r.task_id.as_str(), r)).collect();

    let mut diff = ListDiff::default();
    for task in remote {
        match by_id.remove(task.id.as_str()) {
            None => diff.new.push(task.clone()),
            Some(record) => {
                let change = change_between(task, record);
                if change.is_empty() {
                    diff.unchanged += 1;
                } else {
                    diff.altered.push(AlteredTask {
                        task: task.clone(),
                        record: record.clone(),
                        change,
                    });
                }
            }
        }
    }

    diff.removed = by_id.into_values().cloned().collect();
    diff.removed.sort_by(|a, b| a.task_id.cmp(&b.task_id));
    diff
}

/// Pending changes for a task that exists on both sides.
pub fn change_between(task: &RemoteTask, record: &TaskRecord) -> ChangeSet {
    // Once both sides agree the task is done there is nothing left to
    // reconcile; stale stamps on settled tasks are not worth a write.
    if task.completed && record.completed {
        return ChangeSet::default();
    }

    ChangeSet {
        drifted: task.modified != record.remote_modified,
        newly_completed: task.completed && !record.completed,
        due_changed: task.due.is_some() && task.due != record.due,
        artifact_missing: record.needs_artifact && record.artifact_id.is_none() && !task.completed,
        event_missing: task.due.is_some() && record.event_id.is_none() && !task.completed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, NaiveDateTime, Utc};

    fn due(day: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 1, day)
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .expect("date")
    }

    /// A record fully in sync with the given task.
    fn record_for(task: &RemoteTask) -> TaskRecord {
        TaskRecord {
            task_id: task.id.clone(),
            list_id: "id-hoy".to_owned(),
            list_name: "Hoy".to_owned(),
            title: task.title.clone(),
            artifact_id: None,
            artifact_url: None,
            event_id: task.due.map(|_| "ev-1".to_owned()),
            completed: task.completed,
            due: task.due,
            remote_modified: task.modified.clone(),
            needs_artifact: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn empty_cache_means_everything_is_new() {
        let remote = vec![
            RemoteTask::new("t1", "Pagar luz").with_modified("m1"),
            RemoteTask::new("t2", "Preparar informe").with_modified("m1"),
        ];
        let diff = diff_list(&remote, &[]);
        assert_eq!(diff.new.len(), 2);
        assert!(diff.altered.is_empty());
        assert!(diff.removed.is_empty());
        assert_eq!(diff.unchanged, 0);
    }

    #[test]
    fn matching_sides_are_unchanged() {
        let task = RemoteTask::new("t1", "Pagar luz").with_modified("m1");
        let diff = diff_list(std::slice::from_ref(&task), &[record_for(&task)]);
        assert_eq!(diff.unchanged, 1);
        assert!(diff.new.is_empty());
        assert!(diff.altered.is_empty());
        assert!(diff.removed.is_empty());
    }

    #[test]
    fn stamp_drift_marks_the_task_altered() {
        let task = RemoteTask::new("t1", "Pagar luz").with_modified("m2");
        let mut record = record_for(&task);
        record.remote_modified = "m1".to_owned();

        let diff = diff_list(std::slice::from_ref(&task), &[record]);
        assert_eq!(diff.altered.len(), 1);
        let change = diff.altered[0].change;
        assert!(change.drifted);
        assert!(!change.newly_completed);
        assert!(!change.due_changed);
    }

    #[test]
    fn remote_completion_is_detected() {
        let task = RemoteTask::new("t1", "Pagar luz").with_modified("m2").completed();
        let mut record = record_for(&task);
        record.completed = false;
        record.remote_modified = "m1".to_owned();

        let diff = diff_list(std::slice::from_ref(&task), &[record]);
        assert!(diff.altered[0].change.newly_completed);
    }

    #[test]
    fn settled_tasks_stay_quiet_even_when_stamps_drift() {
        let task = RemoteTask::new("t1", "Pagar luz").with_modified("m9").completed();
        let mut record = record_for(&task);
        record.remote_modified = "m1".to_owned();

        let diff = diff_list(std::slice::from_ref(&task), &[record]);
        assert_eq!(diff.unchanged, 1);
        assert!(diff.altered.is_empty());
    }

    #[test]
    fn added_or_moved_due_date_is_a_change() {
        let task = RemoteTask::new("t1", "Preparar informe")
            .with_modified("m1")
            .with_due(due(20));
        let mut record = record_for(&task);
        record.due = Some(due(18));

        let change = change_between(&task, &record);
        assert!(change.due_changed);
        assert!(!change.event_missing);
    }

    #[test]
    fn removed_due_date_is_not_a_change() {
        // The event is kept when the remote side drops the due date.
        let task = RemoteTask::new("t1", "Preparar informe").with_modified("m1");
        let mut record = record_for(&task);
        record.due = Some(due(20));
        record.event_id = Some("ev-1".to_owned());

        let change = change_between(&task, &record);
        assert!(!change.due_changed);
        assert!(!change.event_missing);
        assert!(change.is_empty());
    }

    #[test]
    fn missing_artifact_resurfaces_without_reclassification() {
        // Classification already happened; only the artifact write failed.
        let task = RemoteTask::new("t1", "Investigar opciones").with_modified("m1");
        let mut record = record_for(&task);
        record.needs_artifact = true;
        record.artifact_id = None;

        let change = change_between(&task, &record);
        assert!(change.artifact_missing);
        assert!(!change.drifted);
    }

    #[test]
    fn missing_event_resurfaces_for_due_tasks() {
        let task = RemoteTask::new("t1", "Preparar informe")
            .with_modified("m1")
            .with_due(due(20));
        let mut record = record_for(&task);
        record.event_id = None;

        let change = change_between(&task, &record);
        assert!(change.event_missing);
        // Cached due matches, so this is purely a repair.
        assert!(!change.due_changed);
    }

    #[test]
    fn completed_tasks_are_not_repaired() {
        let task = RemoteTask::new("t1", "Investigar opciones")
            .with_modified("m1")
            .with_due(due(20))
            .completed();
        let mut record = record_for(&task);
        record.completed = false;
        record.needs_artifact = true;
        record.artifact_id = None;
        record.event_id = None;

        let change = change_between(&task, &record);
        assert!(change.newly_completed);
        assert!(!change.artifact_missing);
        assert!(!change.event_missing);
    }

    #[test]
    fn vanished_tasks_are_listed_sorted() {
        let kept = RemoteTask::new("t2", "Pagar luz").with_modified("m1");
        let gone_b = RemoteTask::new("t9", "Vieja b").with_modified("m1");
        let gone_a = RemoteTask::new("t0", "Vieja a").with_modified("m1");
        let cached = vec![record_for(&gone_b), record_for(&kept), record_for(&gone_a)];

        let diff = diff_list(std::slice::from_ref(&kept), &cached);
        assert_eq!(diff.unchanged, 1);
        let removed: Vec<&str> = diff.removed.iter().map(|r| r.task_id.as_str()).collect();
        assert_eq!(removed, vec!["t0", "t9"]);
    }
}
