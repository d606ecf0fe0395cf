#![allow(clippy::unwrap_used, clippy::expect_used)]

//! Full reconciliation cycle scenarios.
//!
//! The engine runs against scriptable fakes for the remote collaborators and
//! a real SQLite store in a temp directory, with a pinned clock.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use tokio_util::sync::CancellationToken;

use taskmirror::clock::Clock;
use taskmirror::error::{Result, SyncError};
use taskmirror::model::{RemoteTask, TaskList};
use taskmirror::remote::{
    ArtifactRef, ArtifactService, EventPatch, EventService, NewEvent, TaskSource,
};
use taskmirror::store::{AuditEntry, AuditKind, ReviewMarker, SqliteStore, StateStore, TaskRecord};
use taskmirror::{Classifier, SyncConfig, SyncEngine};

const LIST_ID: &str = "list-hoy";
const LIST_NAME: &str = "Hoy";
const COMPLEX_TITLE: &str = "Investigar opciones de migración a la nube para el proyecto";

// ────────────────────────────────────────────────────────────────────────────
// Fixtures
// ────────────────────────────────────────────────────────────────────────────

struct FixedClock(DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// Wednesday 2025-01-15, midday.
fn midweek() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 15, 12, 0, 0)
        .single()
        .expect("time")
}

fn due_on(day: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2025, 1, day)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .expect("date")
}

fn base_config() -> SyncConfig {
    let mut config = SyncConfig::default();
    config.engine.monitored_lists = vec![LIST_NAME.to_owned()];
    config.review.enabled = false;
    config
}

// ────────────────────────────────────────────────────────────────────────────
// Scriptable collaborators
// ────────────────────────────────────────────────────────────────────────────

struct FakeSource {
    lists: Vec<TaskList>,
    tasks: Mutex<HashMap<String, Vec<RemoteTask>>>,
    body_updates: Mutex<Vec<(String, String)>>,
    failing_lists: Mutex<HashSet<String>>,
    auth_broken: Mutex<bool>,
}

impl FakeSource {
    fn with_lists(lists: &[(&str, &str)]) -> Self {
        Self {
            lists: lists
                .iter()
                .map(|(id, name)| TaskList {
                    id: (*id).to_owned(),
                    display_name: (*name).to_owned(),
                })
                .collect(),
            tasks: Mutex::new(HashMap::new()),
            body_updates: Mutex::new(Vec::new()),
            failing_lists: Mutex::new(HashSet::new()),
            auth_broken: Mutex::new(false),
        }
    }

    fn set_tasks(&self, list_id: &str, tasks: Vec<RemoteTask>) {
        self.tasks
            .lock()
            .expect("lock")
            .insert(list_id.to_owned(), tasks);
    }

    fn fail_list(&self, list_id: &str) {
        self.failing_lists
            .lock()
            .expect("lock")
            .insert(list_id.to_owned());
    }

    fn break_auth(&self) {
        *self.auth_broken.lock().expect("lock") = true;
    }

    fn body_updates(&self) -> Vec<(String, String)> {
        self.body_updates.lock().expect("lock").clone()
    }
}

#[async_trait]
impl TaskSource for FakeSource {
    async fn resolve_list(&self, display_name: &str) -> Result<Option<TaskList>> {
        Ok(self
            .lists
            .iter()
            .find(|l| l.display_name == display_name)
            .cloned())
    }

    async fn list_tasks(&self, list_id: &str) -> Result<Vec<RemoteTask>> {
        if *self.auth_broken.lock().expect("lock") {
            return Err(SyncError::Auth("token rejected".to_owned()));
        }
        if self.failing_lists.lock().expect("lock").contains(list_id) {
            return Err(SyncError::Transient("list fetch failed".to_owned()));
        }
        Ok(self
            .tasks
            .lock()
            .expect("lock")
            .get(list_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn update_body(&self, _list_id: &str, task_id: &str, body: &str) -> Result<()> {
        self.body_updates
            .lock()
            .expect("lock")
            .push((task_id.to_owned(), body.to_owned()));
        Ok(())
    }

    async fn mark_completed(&self, _list_id: &str, _task_id: &str) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
struct FakeArtifacts {
    created: Mutex<Vec<String>>,
    failing: Mutex<bool>,
    /// Cancelled mid-sequence to prove the engine finishes the task in
    /// flight before honoring the stop.
    cancel_on_create: Mutex<Option<CancellationToken>>,
}

impl FakeArtifacts {
    fn set_failing(&self, failing: bool) {
        *self.failing.lock().expect("lock") = failing;
    }

    fn cancel_on_next_create(&self, token: CancellationToken) {
        *self.cancel_on_create.lock().expect("lock") = Some(token);
    }

    fn created(&self) -> Vec<String> {
        self.created.lock().expect("lock").clone()
    }
}

#[async_trait]
impl ArtifactService for FakeArtifacts {
    async fn create_artifact(&self, _list_name: &str, task: &RemoteTask) -> Result<ArtifactRef> {
        if *self.failing.lock().expect("lock") {
            return Err(SyncError::Transient("notes service unavailable".to_owned()));
        }
        if let Some(token) = self.cancel_on_create.lock().expect("lock").take() {
            token.cancel();
        }
        self.created.lock().expect("lock").push(task.id.clone());
        Ok(ArtifactRef {
            id: format!("page-{}", task.id),
            url: format!("https://notes.example/{}", task.id),
        })
    }
}

#[derive(Default)]
struct FakeEvents {
    created: Mutex<Vec<NewEvent>>,
    updated: Mutex<Vec<(String, EventPatch)>>,
    deleted: Mutex<Vec<String>>,
    failing_create: Mutex<bool>,
    next_id: Mutex<usize>,
}

impl FakeEvents {
    fn set_failing_create(&self, failing: bool) {
        *self.failing_create.lock().expect("lock") = failing;
    }

    fn created(&self) -> Vec<NewEvent> {
        self.created.lock().expect("lock").clone()
    }

    fn updated(&self) -> Vec<(String, EventPatch)> {
        self.updated.lock().expect("lock").clone()
    }

    fn deleted(&self) -> Vec<String> {
        self.deleted.lock().expect("lock").clone()
    }
}

#[async_trait]
impl EventService for FakeEvents {
    async fn create_event(&self, event: &NewEvent) -> Result<String> {
        if *self.failing_create.lock().expect("lock") {
            return Err(SyncError::Transient("calendar unavailable".to_owned()));
        }
        self.created.lock().expect("lock").push(event.clone());
        let mut next = self.next_id.lock().expect("lock");
        *next += 1;
        Ok(format!("ev-{next}", next = *next))
    }

    async fn update_event(&self, event_id: &str, patch: &EventPatch) -> Result<()> {
        self.updated
            .lock()
            .expect("lock")
            .push((event_id.to_owned(), patch.clone()));
        Ok(())
    }

    async fn delete_event(&self, event_id: &str) -> Result<()> {
        self.deleted.lock().expect("lock").push(event_id.to_owned());
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Harness
// ────────────────────────────────────────────────────────────────────────────

struct Harness {
    _dir: tempfile::TempDir,
    source: Arc<FakeSource>,
    artifacts: Arc<FakeArtifacts>,
    events: Arc<FakeEvents>,
    store: Arc<SqliteStore>,
    engine: SyncEngine,
    cancel: CancellationToken,
}

fn harness(config: &SyncConfig) -> Harness {
    let dir = tempfile::TempDir::new().expect("temp dir");
    let store = Arc::new(SqliteStore::open(&dir.path().join("state.db")).expect("open store"));
    let source = Arc::new(FakeSource::with_lists(&[(LIST_ID, LIST_NAME)]));
    let artifacts = Arc::new(FakeArtifacts::default());
    let events = Arc::new(FakeEvents::default());
    let cancel = CancellationToken::new();
    let engine = SyncEngine::new(
        config,
        source.clone(),
        artifacts.clone(),
        events.clone(),
        store.clone(),
        Arc::new(FixedClock(midweek())),
        cancel.clone(),
    );
    Harness {
        _dir: dir,
        source,
        artifacts,
        events,
        store,
        engine,
        cancel,
    }
}

async fn audits_of_kind(store: &SqliteStore, kind: AuditKind) -> Vec<AuditEntry> {
    store
        .recent_audit(100)
        .await
        .expect("recent audit")
        .into_iter()
        .filter(|e| e.kind == kind)
        .collect()
}

// ────────────────────────────────────────────────────────────────────────────
// New-task scenarios
// ────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn simple_task_gets_only_a_record() {
    let config = base_config();
    let h = harness(&config);
    h.source
        .set_tasks(LIST_ID, vec![RemoteTask::new("t1", "Pagar luz").with_modified("m1")]);

    let report = h.engine.run_cycle().await.expect("cycle");
    assert_eq!(report.total_new(), 1);
    assert_eq!(report.total_failed(), 0);

    let record = h.store.get("t1").await.expect("get").expect("record");
    assert!(!record.needs_artifact);
    assert!(record.artifact_id.is_none());
    assert!(record.event_id.is_none());
    assert!(h.artifacts.created().is_empty());
    assert!(h.events.created().is_empty());
}

#[tokio::test]
async fn complex_task_gets_artifact_annotation_and_event() {
    let config = base_config();
    let h = harness(&config);
    h.source.set_tasks(
        LIST_ID,
        vec![
            RemoteTask::new("t1", COMPLEX_TITLE)
                .with_body("Contexto inicial")
                .with_due(due_on(20))
                .with_modified("m1"),
        ],
    );

    let report = h.engine.run_cycle().await.expect("cycle");
    assert_eq!(report.total_new(), 1);

    let record = h.store.get("t1").await.expect("get").expect("record");
    assert!(record.needs_artifact);
    assert_eq!(record.artifact_id.as_deref(), Some("page-t1"));
    assert_eq!(
        record.artifact_url.as_deref(),
        Some("https://notes.example/t1")
    );
    assert_eq!(record.event_id.as_deref(), Some("ev-1"));

    // The stored verdict matches a pure recomputation on the same inputs.
    let classifier = Classifier::new(&config.rules);
    assert_eq!(
        record.needs_artifact,
        classifier.needs_artifact(COMPLEX_TITLE, "Contexto inicial")
    );

    // Body annotation carries the artifact link after the original text.
    let updates = h.source.body_updates();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].0, "t1");
    assert_eq!(
        updates[0].1,
        "Contexto inicial\n\nOneNote: https://notes.example/t1"
    );

    // Event sits in a one-hour window at the configured hour of the due day.
    let created = h.events.created();
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].subject, format!("[todo] {COMPLEX_TITLE}"));
    assert_eq!(created[0].body, format!("Tarea de lista: {LIST_NAME}"));
    assert_eq!(created[0].start, due_on(20).date().and_hms_opt(9, 0, 0).expect("time"));
    assert_eq!(created[0].end, due_on(20).date().and_hms_opt(10, 0, 0).expect("time"));
}

#[tokio::test]
async fn force_skip_prefix_suppresses_the_artifact() {
    let config = base_config();
    let h = harness(&config);
    h.source.set_tasks(
        LIST_ID,
        vec![
            RemoteTask::new("t1", "#simple Investigar opciones de migración del proyecto")
                .with_modified("m1"),
        ],
    );

    h.engine.run_cycle().await.expect("cycle");

    let record = h.store.get("t1").await.expect("get").expect("record");
    assert!(!record.needs_artifact);
    assert!(h.artifacts.created().is_empty());
}

// ────────────────────────────────────────────────────────────────────────────
// Partial failure and repair
// ────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn event_failure_persists_partial_record_then_repairs() {
    let config = base_config();
    let h = harness(&config);
    h.source.set_tasks(
        LIST_ID,
        vec![
            RemoteTask::new("t1", COMPLEX_TITLE)
                .with_body("Contexto")
                .with_due(due_on(20))
                .with_modified("m1"),
        ],
    );
    h.events.set_failing_create(true);

    let report = h.engine.run_cycle().await.expect("cycle");
    assert_eq!(report.total_new(), 0);
    assert_eq!(report.total_failed(), 1);

    // Whatever succeeded is on record: classified, artifact linked, no event.
    let record = h.store.get("t1").await.expect("get").expect("record");
    assert!(record.needs_artifact);
    assert_eq!(record.artifact_id.as_deref(), Some("page-t1"));
    assert!(record.event_id.is_none());

    // One success entry for the artifact, one failure for the event.
    let artifact_audits = audits_of_kind(&h.store, AuditKind::ArtifactCreated).await;
    assert_eq!(artifact_audits.len(), 1);
    assert!(artifact_audits[0].success);
    let event_audits = audits_of_kind(&h.store, AuditKind::EventCreated).await;
    assert_eq!(event_audits.len(), 1);
    assert!(!event_audits[0].success);

    // Next cycle repairs the event without a second artifact or annotation.
    h.events.set_failing_create(false);
    let report = h.engine.run_cycle().await.expect("repair cycle");
    assert_eq!(report.total_modified(), 1);
    assert_eq!(report.total_failed(), 0);

    let record = h.store.get("t1").await.expect("get").expect("record");
    assert_eq!(record.event_id.as_deref(), Some("ev-1"));
    assert_eq!(h.artifacts.created().len(), 1);
    assert_eq!(h.source.body_updates().len(), 1);
}

#[tokio::test]
async fn artifact_failure_is_repaired_without_reclassification() {
    let config = base_config();
    let h = harness(&config);
    h.source.set_tasks(
        LIST_ID,
        vec![RemoteTask::new("t1", COMPLEX_TITLE).with_modified("m1")],
    );
    h.artifacts.set_failing(true);

    let report = h.engine.run_cycle().await.expect("cycle");
    assert_eq!(report.total_failed(), 1);

    let record = h.store.get("t1").await.expect("get").expect("record");
    assert!(record.needs_artifact);
    assert!(record.artifact_id.is_none());

    h.artifacts.set_failing(false);
    let report = h.engine.run_cycle().await.expect("repair cycle");
    assert_eq!(report.total_modified(), 1);

    let record = h.store.get("t1").await.expect("get").expect("record");
    assert_eq!(record.artifact_id.as_deref(), Some("page-t1"));
    assert_eq!(h.artifacts.created(), vec!["t1".to_owned()]);
}

// ────────────────────────────────────────────────────────────────────────────
// Drift, completion and removal
// ────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn title_drift_refreshes_the_record() {
    let config = base_config();
    let h = harness(&config);
    h.source
        .set_tasks(LIST_ID, vec![RemoteTask::new("t1", "Pagar luz").with_modified("m1")]);
    h.engine.run_cycle().await.expect("first cycle");

    h.source.set_tasks(
        LIST_ID,
        vec![RemoteTask::new("t1", "Pagar luz y agua").with_modified("m2")],
    );
    let report = h.engine.run_cycle().await.expect("second cycle");
    assert_eq!(report.total_modified(), 1);

    let record = h.store.get("t1").await.expect("get").expect("record");
    assert_eq!(record.title, "Pagar luz y agua");
    assert_eq!(record.remote_modified, "m2");
    assert!(h.events.created().is_empty());
}

#[tokio::test]
async fn due_move_updates_the_linked_event() {
    let config = base_config();
    let h = harness(&config);
    h.source.set_tasks(
        LIST_ID,
        vec![
            RemoteTask::new("t1", "Preparar informe")
                .with_due(due_on(20))
                .with_modified("m1"),
        ],
    );
    h.engine.run_cycle().await.expect("first cycle");

    h.source.set_tasks(
        LIST_ID,
        vec![
            RemoteTask::new("t1", "Preparar informe")
                .with_due(due_on(24))
                .with_modified("m2"),
        ],
    );
    let report = h.engine.run_cycle().await.expect("second cycle");
    assert_eq!(report.total_modified(), 1);

    let updated = h.events.updated();
    assert_eq!(updated.len(), 1);
    assert_eq!(updated[0].0, "ev-1");
    assert_eq!(
        updated[0].1.window,
        Some((
            due_on(24).date().and_hms_opt(9, 0, 0).expect("time"),
            due_on(24).date().and_hms_opt(10, 0, 0).expect("time"),
        ))
    );

    let record = h.store.get("t1").await.expect("get").expect("record");
    assert_eq!(record.due, Some(due_on(24)));
    // Still the same event.
    assert_eq!(record.event_id.as_deref(), Some("ev-1"));
    assert_eq!(h.events.created().len(), 1);
}

#[tokio::test]
async fn completion_annotates_the_event_and_settles() {
    let config = base_config();
    let h = harness(&config);
    h.source.set_tasks(
        LIST_ID,
        vec![
            RemoteTask::new("t1", "Pagar luz")
                .with_due(due_on(20))
                .with_modified("m1"),
        ],
    );
    h.engine.run_cycle().await.expect("first cycle");

    h.source.set_tasks(
        LIST_ID,
        vec![
            RemoteTask::new("t1", "Pagar luz")
                .with_due(due_on(20))
                .with_modified("m2")
                .completed(),
        ],
    );
    let report = h.engine.run_cycle().await.expect("second cycle");
    assert_eq!(report.total_modified(), 1);

    let updated = h.events.updated();
    assert_eq!(updated.len(), 1);
    assert_eq!(updated[0].0, "ev-1");
    assert_eq!(updated[0].1, EventPatch::subject("[done] Pagar luz"));

    let record = h.store.get("t1").await.expect("get").expect("record");
    assert!(record.completed);
    assert!(h.events.deleted().is_empty());

    // Settled tasks cause no further traffic.
    let report = h.engine.run_cycle().await.expect("third cycle");
    assert_eq!(report.total_modified(), 0);
    assert_eq!(h.events.updated().len(), 1);
}

#[tokio::test]
async fn removed_task_deletes_its_event_exactly_once() {
    let config = base_config();
    let h = harness(&config);
    h.source.set_tasks(
        LIST_ID,
        vec![
            RemoteTask::new("t1", "Pagar luz")
                .with_due(due_on(20))
                .with_modified("m1"),
        ],
    );
    h.engine.run_cycle().await.expect("first cycle");
    assert!(h.store.get("t1").await.expect("get").is_some());

    h.source.set_tasks(LIST_ID, vec![]);
    let report = h.engine.run_cycle().await.expect("second cycle");
    assert_eq!(report.total_removed(), 1);

    assert_eq!(h.events.deleted(), vec!["ev-1".to_owned()]);
    assert!(h.store.get("t1").await.expect("get").is_none());

    // A further cycle has nothing left to delete.
    h.engine.run_cycle().await.expect("third cycle");
    assert_eq!(h.events.deleted().len(), 1);
}

// ────────────────────────────────────────────────────────────────────────────
// Failure isolation, auth and cancellation
// ────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn one_failing_task_does_not_block_its_siblings() {
    let config = base_config();
    let h = harness(&config);
    h.source.set_tasks(
        LIST_ID,
        vec![
            RemoteTask::new("t1", COMPLEX_TITLE).with_modified("m1"),
            RemoteTask::new("t2", "Pagar luz").with_modified("m1"),
        ],
    );
    h.artifacts.set_failing(true);

    let report = h.engine.run_cycle().await.expect("cycle");
    assert_eq!(report.total_failed(), 1);
    assert_eq!(report.total_new(), 1);
    assert!(h.store.get("t2").await.expect("get").is_some());
}

#[tokio::test]
async fn failing_list_fetch_is_isolated_per_list() {
    let mut config = base_config();
    config.engine.monitored_lists = vec!["Hoy".to_owned(), "En espera".to_owned()];

    let dir = tempfile::TempDir::new().expect("temp dir");
    let store = Arc::new(SqliteStore::open(&dir.path().join("state.db")).expect("open store"));
    let source = Arc::new(FakeSource::with_lists(&[
        (LIST_ID, LIST_NAME),
        ("list-espera", "En espera"),
    ]));
    let events = Arc::new(FakeEvents::default());
    let engine = SyncEngine::new(
        &config,
        source.clone(),
        Arc::new(FakeArtifacts::default()),
        events.clone(),
        store.clone(),
        Arc::new(FixedClock(midweek())),
        CancellationToken::new(),
    );

    source.fail_list(LIST_ID);
    source.set_tasks(
        "list-espera",
        vec![RemoteTask::new("t9", "Esperar respuesta").with_modified("m1")],
    );

    let report = engine.run_cycle().await.expect("cycle");
    assert_eq!(report.lists.len(), 2);
    assert_eq!(report.lists[0].failed, 1);
    assert_eq!(report.lists[1].new, 1);
    assert!(store.get("t9").await.expect("get").is_some());
}

#[tokio::test]
async fn auth_failure_aborts_the_cycle() {
    let config = base_config();
    let h = harness(&config);
    h.source.break_auth();
    h.source
        .set_tasks(LIST_ID, vec![RemoteTask::new("t1", "Pagar luz").with_modified("m1")]);

    let err = h.engine.run_cycle().await.expect_err("cycle must abort");
    assert!(err.is_auth());
    assert!(h.store.get("t1").await.expect("get").is_none());
}

#[tokio::test]
async fn stop_signal_finishes_the_task_in_flight() {
    let config = base_config();
    let h = harness(&config);
    h.source.set_tasks(
        LIST_ID,
        vec![
            RemoteTask::new("t1", COMPLEX_TITLE)
                .with_due(due_on(20))
                .with_modified("m1"),
            RemoteTask::new("t2", COMPLEX_TITLE).with_modified("m1"),
        ],
    );
    h.artifacts.cancel_on_next_create(h.cancel.clone());

    let report = h.engine.run_cycle().await.expect("cycle");

    // The first task's sequence ran to completion, event included.
    let record = h.store.get("t1").await.expect("get").expect("record");
    assert_eq!(record.artifact_id.as_deref(), Some("page-t1"));
    assert_eq!(record.event_id.as_deref(), Some("ev-1"));

    // The second sequence never started.
    assert!(h.store.get("t2").await.expect("get").is_none());
    assert_eq!(h.artifacts.created().len(), 1);
    assert_eq!(report.total_new(), 1);
}

// ────────────────────────────────────────────────────────────────────────────
// Weekly review
// ────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn review_event_is_created_once_per_week() {
    let mut config = base_config();
    config.review.enabled = true;
    let h = harness(&config);
    h.source
        .set_tasks(LIST_ID, vec![RemoteTask::new("t1", "Pagar luz").with_modified("m1")]);

    let report = h.engine.run_cycle().await.expect("cycle");
    assert!(report.review_created);

    // Clock is Wednesday the 15th; the review lands on Sunday the 19th.
    let created = h.events.created();
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].subject, "Weekly task review");
    assert_eq!(created[0].body, "- [Hoy] Pagar luz");
    assert_eq!(
        created[0].start,
        NaiveDate::from_ymd_opt(2025, 1, 19)
            .and_then(|d| d.and_hms_opt(18, 0, 0))
            .expect("time")
    );
    assert_eq!(
        created[0].end,
        NaiveDate::from_ymd_opt(2025, 1, 19)
            .and_then(|d| d.and_hms_opt(18, 30, 0))
            .expect("time")
    );

    // Marker pinned to that week's Monday.
    let week = NaiveDate::from_ymd_opt(2025, 1, 13).expect("date");
    let marker = h
        .store
        .review_marker(week)
        .await
        .expect("marker lookup")
        .expect("marker");
    assert_eq!(marker.event_id, "ev-1");

    // The week is covered; later cycles schedule nothing.
    let report = h.engine.run_cycle().await.expect("second cycle");
    assert!(!report.review_created);
    assert_eq!(h.events.created().len(), 1);
}

#[tokio::test]
async fn review_with_nothing_pending_says_so() {
    let mut config = base_config();
    config.review.enabled = true;
    let h = harness(&config);

    let report = h.engine.run_cycle().await.expect("cycle");
    assert!(report.review_created);
    assert_eq!(h.events.created()[0].body, "No hay tareas pendientes.");
}

// ────────────────────────────────────────────────────────────────────────────
// Review marker race
// ────────────────────────────────────────────────────────────────────────────

/// Wraps the real store but pretends the review marker is absent on the
/// first lookup, reproducing a concurrent process winning the race between
/// the engine's check and its save.
struct RacingStore {
    inner: Arc<SqliteStore>,
    hide_marker_once: Mutex<bool>,
}

#[async_trait]
impl StateStore for RacingStore {
    async fn get(&self, task_id: &str) -> Result<Option<TaskRecord>> {
        self.inner.get(task_id).await
    }

    async fn list(&self) -> Result<Vec<TaskRecord>> {
        self.inner.list().await
    }

    async fn list_for(&self, list_name: &str) -> Result<Vec<TaskRecord>> {
        self.inner.list_for(list_name).await
    }

    async fn upsert(&self, record: &TaskRecord) -> Result<()> {
        self.inner.upsert(record).await
    }

    async fn delete(&self, task_id: &str) -> Result<()> {
        self.inner.delete(task_id).await
    }

    async fn append_audit(&self, entry: &AuditEntry) -> Result<()> {
        self.inner.append_audit(entry).await
    }

    async fn recent_audit(&self, limit: usize) -> Result<Vec<AuditEntry>> {
        self.inner.recent_audit(limit).await
    }

    async fn review_marker(&self, week_start: NaiveDate) -> Result<Option<ReviewMarker>> {
        {
            let mut hide = self.hide_marker_once.lock().expect("lock");
            if *hide {
                *hide = false;
                return Ok(None);
            }
        }
        self.inner.review_marker(week_start).await
    }

    async fn save_review_marker(&self, week_start: NaiveDate, event_id: &str) -> Result<()> {
        self.inner.save_review_marker(week_start, event_id).await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

#[tokio::test]
async fn losing_the_marker_race_is_benign() {
    let mut config = base_config();
    config.review.enabled = true;

    let dir = tempfile::TempDir::new().expect("temp dir");
    let sqlite = Arc::new(SqliteStore::open(&dir.path().join("state.db")).expect("open store"));
    let week = NaiveDate::from_ymd_opt(2025, 1, 13).expect("date");
    sqlite
        .save_review_marker(week, "ev-winner")
        .await
        .expect("seed marker");

    let store = Arc::new(RacingStore {
        inner: sqlite.clone(),
        hide_marker_once: Mutex::new(true),
    });
    let events = Arc::new(FakeEvents::default());
    let engine = SyncEngine::new(
        &config,
        Arc::new(FakeSource::with_lists(&[(LIST_ID, LIST_NAME)])),
        Arc::new(FakeArtifacts::default()),
        events.clone(),
        store,
        Arc::new(FixedClock(midweek())),
        CancellationToken::new(),
    );

    // The duplicate event is created, the save loses, the cycle still
    // succeeds and nothing is deleted or retried.
    let report = engine.run_cycle().await.expect("cycle");
    assert!(report.review_created);
    assert!(!report.review_failed);
    assert_eq!(events.created().len(), 1);
    assert!(events.deleted().is_empty());

    // The winner's marker survives.
    let marker = sqlite
        .review_marker(week)
        .await
        .expect("marker lookup")
        .expect("marker");
    assert_eq!(marker.event_id, "ev-winner");

    let duplicates = sqlite
        .recent_audit(20)
        .await
        .expect("audit")
        .into_iter()
        .filter(|e| e.kind == AuditKind::ReviewCreated && !e.success)
        .count();
    assert_eq!(duplicates, 1);
}
