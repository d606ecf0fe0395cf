//! The reconciliation cycle.
//!
//! One cycle walks every monitored list: fetch the remote snapshot, diff it
//! against the cached records, dispatch create/update/delete actions to the
//! note and calendar collaborators, persist the outcome, then check whether
//! this week's review event still needs scheduling.
//!
//! Cycles are independently resumable from store contents. Every store write
//! is a single idempotent upsert or delete, so a crash mid-cycle never
//! corrupts the durable view; the next cycle picks up repairs from whatever
//! the records say. Lists and tasks are processed strictly one at a time,
//! which keeps the diff-then-act sequence for any task free of interleaving.

pub mod diff;

use std::sync::Arc;

use chrono::{Datelike, NaiveDate, NaiveDateTime, Weekday};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::classify::Classifier;
use crate::clock::Clock;
use crate::config::{ReviewConfig, SyncConfig};
use crate::error::Result;
use crate::model::{RemoteTask, TaskList};
use crate::remote::{ArtifactService, EventPatch, EventService, NewEvent, TaskSource};
use crate::store::{AuditEntry, AuditKind, StateStore, TaskRecord};
use diff::{AlteredTask, ChangeSet, diff_list};

/// Subject prefix for task-due events.
const TODO_PREFIX: &str = "[todo] ";
/// Subject prefix once the task is completed.
const DONE_PREFIX: &str = "[done] ";

// ---------------------------------------------------------------------------
// Cycle report
// ---------------------------------------------------------------------------

/// Per-list outcome counts. `failed` counts task action sequences that
/// errored; a list whose remote fetch failed entirely reports as one failure.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListOutcome {
    pub list_name: String,
    pub new: usize,
    pub modified: usize,
    pub removed: usize,
    pub failed: usize,
}

/// Aggregate result of one cycle. Partial failure is never silent: every
/// failed task sequence shows up in a count, and a failed review check sets
/// its own flag.
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub lists: Vec<ListOutcome>,
    pub review_created: bool,
    pub review_failed: bool,
}

impl CycleReport {
    pub fn total_new(&self) -> usize {
        self.lists.iter().map(|l| l.new).sum()
    }

    pub fn total_modified(&self) -> usize {
        self.lists.iter().map(|l| l.modified).sum()
    }

    pub fn total_removed(&self) -> usize {
        self.lists.iter().map(|l| l.removed).sum()
    }

    pub fn total_failed(&self) -> usize {
        self.lists.iter().map(|l| l.failed).sum()
    }

    pub fn has_failures(&self) -> bool {
        self.review_failed || self.total_failed() > 0
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Drives the fetch → diff → act → persist cycle over the monitored lists.
pub struct SyncEngine {
    source: Arc<dyn TaskSource>,
    artifacts: Arc<dyn ArtifactService>,
    events: Arc<dyn EventService>,
    store: Arc<dyn StateStore>,
    classifier: Classifier,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
    monitored: Vec<String>,
    review: ReviewConfig,
    event_hour: u32,
    /// List bindings resolved on first use and kept for the process lifetime.
    bindings: tokio::sync::Mutex<Option<Vec<TaskList>>>,
}

impl SyncEngine {
    pub fn new(
        config: &SyncConfig,
        source: Arc<dyn TaskSource>,
        artifacts: Arc<dyn ArtifactService>,
        events: Arc<dyn EventService>,
        store: Arc<dyn StateStore>,
        clock: Arc<dyn Clock>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            source,
            artifacts,
            events,
            store,
            classifier: Classifier::new(&config.rules),
            clock,
            cancel,
            monitored: config.engine.monitored_lists.clone(),
            review: config.review.clone(),
            event_hour: config.calendar.event_hour,
            bindings: tokio::sync::Mutex::new(None),
        }
    }

    /// Runs one full cycle.
    ///
    /// Returns `Err` only when the cycle cannot continue at all: list
    /// resolution failed, or an authentication failure made every further
    /// call pointless. Per-task and per-list failures are absorbed into the
    /// report instead. A pending stop signal yields a partial report,
    /// honored between lists and between task sequences, never inside one.
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let bindings = self.resolve_bindings().await?;
        info!(lists = bindings.len(), "starting sync cycle");

        let mut report = CycleReport::default();
        for list in &bindings {
            if self.cancel.is_cancelled() {
                info!("stop requested, returning partial cycle");
                return Ok(report);
            }
            match self.sync_list(list).await {
                Ok(outcome) => report.lists.push(outcome),
                Err(e) if e.is_auth() => return Err(e),
                Err(e) => {
                    warn!(list = %list.display_name, error = %e, "list sync failed");
                    self.audit(
                        AuditKind::CycleError,
                        None,
                        format!("list '{}' failed: {e}", list.display_name),
                        false,
                    )
                    .await;
                    report.lists.push(ListOutcome {
                        list_name: list.display_name.clone(),
                        failed: 1,
                        ..ListOutcome::default()
                    });
                }
            }
        }

        if self.review.enabled && !self.cancel.is_cancelled() {
            match self.review_check().await {
                Ok(created) => report.review_created = created,
                Err(e) if e.is_auth() => return Err(e),
                Err(e) => {
                    warn!(error = %e, "weekly review check failed");
                    report.review_failed = true;
                }
            }
        }

        info!(
            new = report.total_new(),
            modified = report.total_modified(),
            removed = report.total_removed(),
            failed = report.total_failed(),
            review_created = report.review_created,
            "cycle complete"
        );
        Ok(report)
    }

    /// Resolve monitored list names to remote identities, once per process.
    /// Missing lists are logged and skipped.
    async fn resolve_bindings(&self) -> Result<Vec<TaskList>> {
        let mut cached = self.bindings.lock().await;
        if let Some(lists) = cached.as_ref() {
            return Ok(lists.clone());
        }

        let mut resolved = Vec::new();
        for name in &self.monitored {
            match self.source.resolve_list(name).await? {
                Some(list) => {
                    debug!(list = %name, id = %list.id, "resolved list");
                    resolved.push(list);
                }
                None => warn!(list = %name, "monitored list not found, skipping"),
            }
        }
        if resolved.is_empty() {
            warn!("no monitored list could be resolved");
        }
        *cached = Some(resolved.clone());
        Ok(resolved)
    }

    async fn sync_list(&self, list: &TaskList) -> Result<ListOutcome> {
        let remote = self.source.list_tasks(&list.id).await?;
        let cached = self.store.list_for(&list.display_name).await?;
        let diff = diff_list(&remote, &cached);
        info!(
            list = %list.display_name,
            new = diff.new.len(),
            altered = diff.altered.len(),
            removed = diff.removed.len(),
            unchanged = diff.unchanged,
            "list diffed"
        );

        let mut outcome = ListOutcome {
            list_name: list.display_name.clone(),
            ..ListOutcome::default()
        };

        for task in &diff.new {
            if self.cancel.is_cancelled() {
                return Ok(outcome);
            }
            match self.apply_new(list, task).await {
                Ok(()) => outcome.new += 1,
                Err(e) if e.is_auth() => return Err(e),
                Err(e) => {
                    warn!(task = %task.title, error = %e, "new-task sequence failed");
                    outcome.failed += 1;
                }
            }
        }

        for altered in &diff.altered {
            if self.cancel.is_cancelled() {
                return Ok(outcome);
            }
            match self.apply_altered(altered).await {
                Ok(()) => outcome.modified += 1,
                Err(e) if e.is_auth() => return Err(e),
                Err(e) => {
                    warn!(task = %altered.task.title, error = %e, "update sequence failed");
                    outcome.failed += 1;
                }
            }
        }

        for record in &diff.removed {
            if self.cancel.is_cancelled() {
                return Ok(outcome);
            }
            match self.apply_removed(record).await {
                Ok(()) => outcome.removed += 1,
                Err(e) if e.is_auth() => return Err(e),
                Err(e) => {
                    warn!(task = %record.title, error = %e, "removal sequence failed");
                    outcome.failed += 1;
                }
            }
        }

        Ok(outcome)
    }

    /// First observation of a task: classify, create the derived artifact and
    /// event, persist the record.
    ///
    /// Sub-steps run independently; one failing does not skip the rest, and
    /// the record always persists whatever succeeded so the next cycle
    /// resumes at the failed sub-step instead of starting over.
    async fn apply_new(&self, list: &TaskList, task: &RemoteTask) -> Result<()> {
        let needs_artifact = self.classifier.needs_artifact(&task.title, &task.body);
        info!(
            list = %list.display_name,
            task = %task.title,
            needs_artifact,
            "new task observed"
        );

        let now = self.clock.now();
        let mut record = TaskRecord {
            task_id: task.id.clone(),
            list_id: list.id.clone(),
            list_name: list.display_name.clone(),
            title: task.title.clone(),
            artifact_id: None,
            artifact_url: None,
            event_id: None,
            completed: task.completed,
            due: task.due,
            remote_modified: task.modified.clone(),
            needs_artifact,
            created_at: now,
            updated_at: now,
        };

        let mut first_error = None;
        if needs_artifact && !task.completed {
            if let Err(e) = self.ensure_artifact(task, &mut record).await {
                if e.is_auth() {
                    self.persist(&record).await?;
                    return Err(e);
                }
                first_error.get_or_insert(e);
            }
        }
        if task.due.is_some() && !task.completed {
            if let Err(e) = self.ensure_event(task, &mut record).await {
                if e.is_auth() {
                    self.persist(&record).await?;
                    return Err(e);
                }
                first_error.get_or_insert(e);
            }
        }

        self.persist(&record).await?;
        self.audit(
            AuditKind::TaskNew,
            Some(&task.id),
            format!("'{}' in '{}'", task.title, list.display_name),
            true,
        )
        .await;

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// A task present on both sides with pending changes: repair missing
    /// derived state, follow due-date moves and completion, refresh the
    /// record. The classifier verdict stored on first observation is reused
    /// as-is.
    async fn apply_altered(&self, altered: &AlteredTask) -> Result<()> {
        let task = &altered.task;
        let change = altered.change;
        let mut record = altered.record.clone();
        debug!(task = %task.title, "task altered: {}", describe_change(change));

        let step_result = self.run_altered_steps(task, &mut record, change).await;
        if let Err(e) = &step_result {
            if e.is_auth() {
                self.persist(&record).await?;
                return step_result;
            }
        }

        // The drift marker advances even when a step failed: repairs are
        // driven by the record's missing references, not by the marker.
        record.title = task.title.clone();
        record.remote_modified = task.modified.clone();
        record.updated_at = self.clock.now();
        self.persist(&record).await?;
        self.audit(
            AuditKind::TaskModified,
            Some(&task.id),
            format!("'{}': {}", task.title, describe_change(change)),
            step_result.is_ok(),
        )
        .await;

        step_result
    }

    async fn run_altered_steps(
        &self,
        task: &RemoteTask,
        record: &mut TaskRecord,
        change: ChangeSet,
    ) -> Result<()> {
        if change.newly_completed {
            // Completion ends the task's derived life; nothing else to do.
            return self.complete_task(task, record).await;
        }

        let mut first_error = None;
        if change.artifact_missing {
            if let Err(e) = self.ensure_artifact(task, record).await {
                if e.is_auth() {
                    return Err(e);
                }
                first_error.get_or_insert(e);
            }
        }
        if change.event_missing {
            if let Err(e) = self.ensure_event(task, record).await {
                if e.is_auth() {
                    return Err(e);
                }
                first_error.get_or_insert(e);
            }
        } else if change.due_changed {
            if let Err(e) = self.move_event(task, record).await {
                if e.is_auth() {
                    return Err(e);
                }
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// A cached task that vanished remotely: drop its event and its record.
    /// The note artifact is deliberately left in place.
    async fn apply_removed(&self, record: &TaskRecord) -> Result<()> {
        info!(list = %record.list_name, task = %record.title, "task removed remotely");

        if let Some(event_id) = &record.event_id {
            match self.events.delete_event(event_id).await {
                Ok(()) => {
                    self.audit(
                        AuditKind::EventDeleted,
                        Some(&record.task_id),
                        format!("event {event_id} for '{}'", record.title),
                        true,
                    )
                    .await;
                }
                Err(e) => {
                    self.audit(
                        AuditKind::EventDeleted,
                        Some(&record.task_id),
                        format!("event {event_id} delete failed: {e}"),
                        false,
                    )
                    .await;
                    // Record kept; the next cycle retries the deletion.
                    return Err(e);
                }
            }
        }

        self.store.delete(&record.task_id).await?;
        self.audit(
            AuditKind::TaskRemoved,
            Some(&record.task_id),
            format!("'{}' no longer in '{}'", record.title, record.list_name),
            true,
        )
        .await;
        Ok(())
    }

    // -- sub-steps ---------------------------------------------------------

    /// Creates the note artifact and annotates the task body with its link.
    /// On success the record carries the artifact reference.
    async fn ensure_artifact(&self, task: &RemoteTask, record: &mut TaskRecord) -> Result<()> {
        let artifact = match self.artifacts.create_artifact(&record.list_name, task).await {
            Ok(artifact) => artifact,
            Err(e) => {
                self.audit(
                    AuditKind::ArtifactCreated,
                    Some(&task.id),
                    format!("artifact for '{}' failed: {e}", task.title),
                    false,
                )
                .await;
                return Err(e);
            }
        };
        self.audit(
            AuditKind::ArtifactCreated,
            Some(&task.id),
            format!("artifact {} for '{}'", artifact.id, task.title),
            true,
        )
        .await;
        record.artifact_id = Some(artifact.id);
        record.artifact_url = Some(artifact.url.clone());

        if artifact.url.is_empty() {
            // No link to write back; the artifact itself still counts.
            debug!(task = %task.title, "artifact has no link, skipping body annotation");
            return Ok(());
        }

        let annotated = body_annotation(&task.body, &artifact.url);
        match self
            .source
            .update_body(&record.list_id, &task.id, &annotated)
            .await
        {
            Ok(()) => {
                self.audit(
                    AuditKind::BodyAnnotated,
                    Some(&task.id),
                    format!("linked artifact into '{}'", task.title),
                    true,
                )
                .await;
                Ok(())
            }
            Err(e) => {
                self.audit(
                    AuditKind::BodyAnnotated,
                    Some(&task.id),
                    format!("body annotation for '{}' failed: {e}", task.title),
                    false,
                )
                .await;
                Err(e)
            }
        }
    }

    /// Creates the due-date event. On success the record carries the event
    /// reference and the due value the event was built from.
    async fn ensure_event(&self, task: &RemoteTask, record: &mut TaskRecord) -> Result<()> {
        let Some(due) = task.due else {
            return Ok(());
        };
        let (start, end) = event_window(due, self.event_hour);
        let event = NewEvent {
            subject: format!("{TODO_PREFIX}{}", task.title),
            body: format!("Tarea de lista: {}", record.list_name),
            start,
            end,
        };

        match self.events.create_event(&event).await {
            Ok(event_id) => {
                self.audit(
                    AuditKind::EventCreated,
                    Some(&task.id),
                    format!("event {event_id} for '{}'", task.title),
                    true,
                )
                .await;
                record.event_id = Some(event_id);
                record.due = task.due;
                Ok(())
            }
            Err(e) => {
                self.audit(
                    AuditKind::EventCreated,
                    Some(&task.id),
                    format!("event for '{}' failed: {e}", task.title),
                    false,
                )
                .await;
                Err(e)
            }
        }
    }

    /// Moves an existing event to the task's new due window.
    async fn move_event(&self, task: &RemoteTask, record: &mut TaskRecord) -> Result<()> {
        let (Some(due), Some(event_id)) = (task.due, record.event_id.clone()) else {
            return Ok(());
        };
        let (start, end) = event_window(due, self.event_hour);
        let patch = EventPatch {
            subject: Some(format!("{TODO_PREFIX}{}", task.title)),
            window: Some((start, end)),
        };

        match self.events.update_event(&event_id, &patch).await {
            Ok(()) => {
                self.audit(
                    AuditKind::EventUpdated,
                    Some(&task.id),
                    format!("event {event_id} moved for '{}'", task.title),
                    true,
                )
                .await;
                record.due = task.due;
                Ok(())
            }
            Err(e) => {
                self.audit(
                    AuditKind::EventUpdated,
                    Some(&task.id),
                    format!("event {event_id} move failed: {e}"),
                    false,
                )
                .await;
                Err(e)
            }
        }
    }

    /// Annotates the linked event as done and settles the record. The
    /// completion flag is only persisted once the annotation went through,
    /// so a failed annotation is retried next cycle.
    async fn complete_task(&self, task: &RemoteTask, record: &mut TaskRecord) -> Result<()> {
        if let Some(event_id) = record.event_id.clone() {
            let patch = EventPatch::subject(format!("{DONE_PREFIX}{}", task.title));
            match self.events.update_event(&event_id, &patch).await {
                Ok(()) => {
                    self.audit(
                        AuditKind::EventUpdated,
                        Some(&task.id),
                        format!("event {event_id} marked done for '{}'", task.title),
                        true,
                    )
                    .await;
                }
                Err(e) => {
                    self.audit(
                        AuditKind::EventUpdated,
                        Some(&task.id),
                        format!("event {event_id} done-mark failed: {e}"),
                        false,
                    )
                    .await;
                    return Err(e);
                }
            }
        }
        record.completed = true;
        Ok(())
    }

    // -- weekly review -----------------------------------------------------

    /// Schedules the weekly review event if this week still lacks one.
    ///
    /// The review lands on the next occurrence of the configured weekday;
    /// the store's marker on that week's Monday is what makes the event
    /// once-per-week. Losing the marker race to a concurrent process leaves
    /// a harmless duplicate event, logged and accepted.
    async fn review_check(&self) -> Result<bool> {
        let today = self.clock.now().date_naive();
        let review_date = next_review_date(today, self.review.weekday()?);
        let week_start = week_start_of(review_date);

        if self.store.review_marker(week_start).await?.is_some() {
            debug!(week = %week_start, "review already scheduled");
            return Ok(false);
        }

        let summary = pending_summary(&self.store.list().await?);
        let start = review_date.and_time(self.review.start_time()?);
        let end = start + chrono::Duration::minutes(self.review.duration_minutes);
        let event = NewEvent {
            subject: self.review.title.clone(),
            body: summary,
            start,
            end,
        };

        let event_id = match self.events.create_event(&event).await {
            Ok(id) => id,
            Err(e) => {
                self.audit(
                    AuditKind::ReviewCreated,
                    None,
                    format!("review event for week {week_start} failed: {e}"),
                    false,
                )
                .await;
                return Err(e);
            }
        };
        info!(week = %week_start, date = %review_date, "created weekly review event");

        match self.store.save_review_marker(week_start, &event_id).await {
            Ok(()) => {
                self.audit(
                    AuditKind::ReviewCreated,
                    None,
                    format!("review event {event_id} for week {week_start}"),
                    true,
                )
                .await;
                Ok(true)
            }
            Err(e) if e.is_already_exists() => {
                // Lost the race to a concurrent run; the extra event stays.
                info!(week = %week_start, "review marker already saved elsewhere");
                self.audit(
                    AuditKind::ReviewCreated,
                    None,
                    format!("duplicate review event {event_id} for week {week_start}"),
                    false,
                )
                .await;
                Ok(true)
            }
            Err(e) => Err(e),
        }
    }

    // -- plumbing ----------------------------------------------------------

    async fn persist(&self, record: &TaskRecord) -> Result<()> {
        self.store.upsert(record).await.inspect_err(|e| {
            warn!(task_id = %record.task_id, error = %e, "failed to persist record");
        })
    }

    /// Audit writes never roll back the action they describe; a failed write
    /// is logged and dropped.
    async fn audit(&self, kind: AuditKind, task_id: Option<&str>, detail: String, success: bool) {
        let entry = AuditEntry {
            at: self.clock.now(),
            kind,
            task_id: task_id.map(str::to_owned),
            detail,
            success,
        };
        if let Err(e) = self.store.append_audit(&entry).await {
            warn!(kind = ?kind, error = %e, "audit write failed");
        }
    }
}

// ---------------------------------------------------------------------------
// Pure helpers
// ---------------------------------------------------------------------------

/// Task body with the artifact link appended.
fn body_annotation(existing: &str, url: &str) -> String {
    format!("{existing}\n\nOneNote: {url}").trim().to_owned()
}

/// One-hour event window starting at `hour` on the due date.
fn event_window(due: NaiveDateTime, hour: u32) -> (NaiveDateTime, NaiveDateTime) {
    let start = due.date().and_hms_opt(hour, 0, 0).unwrap_or(due);
    (start, start + chrono::Duration::hours(1))
}

/// Next occurrence of `target`, counting today as a candidate.
fn next_review_date(today: NaiveDate, target: Weekday) -> NaiveDate {
    let ahead = (target.num_days_from_monday() as i64
        - today.weekday().num_days_from_monday() as i64)
        .rem_euclid(7);
    today + chrono::Duration::days(ahead)
}

/// Monday of the week `date` falls in.
fn week_start_of(date: NaiveDate) -> NaiveDate {
    date - chrono::Duration::days(date.weekday().num_days_from_monday() as i64)
}

/// Review event body: one line per pending task.
fn pending_summary(records: &[TaskRecord]) -> String {
    let lines: Vec<String> = records
        .iter()
        .filter(|r| !r.completed)
        .map(|r| format!("- [{}] {}", r.list_name, r.title))
        .collect();
    if lines.is_empty() {
        "No hay tareas pendientes.".to_owned()
    } else {
        lines.join("\n")
    }
}

fn describe_change(change: ChangeSet) -> String {
    let mut parts = Vec::new();
    if change.drifted {
        parts.push("drifted");
    }
    if change.newly_completed {
        parts.push("completed remotely");
    }
    if change.due_changed {
        parts.push("due moved");
    }
    if change.artifact_missing {
        parts.push("artifact missing");
    }
    if change.event_missing {
        parts.push("event missing");
    }
    parts.join(", ")
}
