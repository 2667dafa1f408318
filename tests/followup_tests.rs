//! # Follow-up Engine Tests
//!
//! Drives the follow-up state machine with a recording sink and an
//! in-memory preference store.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use taskrelay::followup::*;
use taskrelay::preferences::*;
use taskrelay::task::{ResultBody, TaskKind};

#[derive(Debug, Clone, PartialEq)]
enum Event {
    Prompt(String),
    Execute(String, ActionCode, Trigger),
    Skip(String),
}

#[derive(Default)]
struct RecordingSink {
    events: Mutex<Vec<Event>>,
}

impl RecordingSink {
    fn take(&self) -> Vec<Event> {
        std::mem::take(&mut *self.events.lock().unwrap())
    }
}

#[async_trait]
impl FollowupSink for RecordingSink {
    async fn prompt(&self, record: &FollowupRecord, _prefs: &Preferences) -> Result<()> {
        self.events
            .lock()
            .unwrap()
            .push(Event::Prompt(record.task_id.clone()));
        Ok(())
    }

    async fn execute(&self, action: ActionCode, record: &FollowupRecord, trigger: Trigger) -> Result<()> {
        self.events
            .lock()
            .unwrap()
            .push(Event::Execute(record.task_id.clone(), action, trigger));
        Ok(())
    }

    async fn announce_skip(&self, record: &FollowupRecord) -> Result<()> {
        self.events
            .lock()
            .unwrap()
            .push(Event::Skip(record.task_id.clone()));
        Ok(())
    }
}

const CHAT: i64 = 100;

fn setup() -> (FollowupEngine, Arc<RecordingSink>) {
    let sink = Arc::new(RecordingSink::default());
    let engine = FollowupEngine::new(Arc::new(PreferenceStore::in_memory()), sink.clone());
    (engine, sink)
}

fn record(task_id: &str, kind: TaskKind) -> FollowupRecord {
    let result = match kind {
        TaskKind::Document => ResultBody::document("text".into(), "summary".into(), "a.txt".into()),
        TaskKind::Image => ResultBody::image("a cat".into(), "fluffy".into()),
        TaskKind::Audio => ResultBody::audio("hello".into(), "greeting".into(), Some(4)),
    };
    FollowupRecord {
        task_id: task_id.to_string(),
        chat_id: CHAT,
        kind,
        result,
        meta: FollowupMeta::default(),
        language_code: None,
    }
}

#[tokio::test]
async fn test_default_mode_prompts_and_keeps_record() {
    let (engine, sink) = setup();
    assert!(engine.register(record("t1", TaskKind::Document)));

    assert_eq!(engine.apply(CHAT, "t1").await, Some(Decision::Prompt));
    assert_eq!(sink.take(), vec![Event::Prompt("t1".to_string())]);
    assert!(engine.record("t1").is_some());
    assert_eq!(
        engine.last_state(CHAT),
        Some(LastPreferenceState {
            mode: Mode::Ask,
            action: None
        })
    );
}

#[tokio::test]
async fn test_failed_results_are_not_registered() {
    let (engine, _sink) = setup();
    let mut failed = record("t1", TaskKind::Audio);
    failed.result = ResultBody::failure("worker crashed");

    assert!(!engine.register(failed));
    assert_eq!(engine.pending_count(CHAT), 0);
    assert_eq!(engine.apply(CHAT, "t1").await, None);
}

#[tokio::test]
async fn test_record_of_other_chat_is_not_found() {
    let (engine, sink) = setup();
    engine.register(record("t1", TaskKind::Image));

    let outcome = engine
        .handle_follow(CHAT + 1, "t1", FollowChoice::Once, ActionCode::ImageOriginal)
        .await;
    assert_eq!(outcome, FollowOutcome::NotFound);
    assert!(sink.take().is_empty());
    assert!(engine.record("t1").is_some());
}

#[tokio::test]
async fn test_follow_once_runs_action_and_drops_record() {
    let (engine, sink) = setup();
    engine.register(record("t1", TaskKind::Image));

    let outcome = engine
        .handle_follow(CHAT, "t1", FollowChoice::Once, ActionCode::ImageSummary)
        .await;
    assert!(matches!(outcome, FollowOutcome::Completed { .. }));
    assert_eq!(
        sink.take(),
        vec![Event::Execute("t1".to_string(), ActionCode::ImageSummary, Trigger::Manual)]
    );
    assert!(engine.record("t1").is_none());
    // Preferences are untouched by a one-off choice
    assert_eq!(engine.store().get(CHAT).await, Preferences::default());
}

#[tokio::test]
async fn test_follow_with_action_of_other_kind_is_ignored() {
    let (engine, sink) = setup();
    engine.register(record("t1", TaskKind::Image));

    let outcome = engine
        .handle_follow(CHAT, "t1", FollowChoice::Once, ActionCode::AudioSummary)
        .await;
    assert_eq!(outcome, FollowOutcome::Ignored);
    assert!(sink.take().is_empty());
    assert!(engine.record("t1").is_some());
}

#[tokio::test]
async fn test_follow_auto_sets_default_and_applies_same_kind() {
    let (engine, sink) = setup();
    engine.register(record("d1", TaskKind::Document));
    engine.register(record("d2", TaskKind::Document));
    engine.register(record("a1", TaskKind::Audio));

    engine
        .handle_follow(CHAT, "d1", FollowChoice::Auto, ActionCode::DocumentSummary)
        .await;

    let prefs = engine.store().get(CHAT).await;
    assert_eq!(prefs.mode, Mode::Auto);
    assert_eq!(prefs.default_actions.document, ActionCode::DocumentSummary);

    assert_eq!(
        sink.take(),
        vec![
            Event::Execute("d1".to_string(), ActionCode::DocumentSummary, Trigger::Manual),
            Event::Execute("d2".to_string(), ActionCode::DocumentSummary, Trigger::Auto),
        ]
    );
    // The audio record is left alone until its kind gets a default
    assert!(engine.record("a1").is_some());
    assert_eq!(engine.pending_count(CHAT), 1);
}

#[tokio::test]
async fn test_follow_skip_skips_everything_and_announces_once() {
    let (engine, sink) = setup();
    engine.register(record("d1", TaskKind::Document));
    engine.register(record("i1", TaskKind::Image));
    engine.register(record("a1", TaskKind::Audio));

    engine
        .handle_follow(CHAT, "d1", FollowChoice::Skip, ActionCode::None)
        .await;

    let prefs = engine.store().get(CHAT).await;
    assert_eq!(prefs.mode, Mode::Skip);
    assert_eq!(prefs.default_actions.document, ActionCode::None);

    // One confirmation for the whole run of skips
    assert_eq!(sink.take(), vec![Event::Skip("i1".to_string())]);
    assert_eq!(engine.pending_count(CHAT), 0);

    engine.register(record("a2", TaskKind::Audio));
    assert_eq!(
        engine.apply(CHAT, "a2").await,
        Some(Decision::Skip { announce: false })
    );
    assert!(sink.take().is_empty());
}

#[tokio::test]
async fn test_auto_mode_applies_on_arrival() {
    let (engine, sink) = setup();
    engine
        .handle_preference(
            CHAT,
            &PreferenceCommand::Action {
                kind: TaskKind::Audio,
                action: ActionCode::AudioOriginalSummary,
            },
        )
        .await;

    engine.register(record("a1", TaskKind::Audio));
    assert_eq!(
        engine.apply(CHAT, "a1").await,
        Some(Decision::AutoApply(ActionCode::AudioOriginalSummary))
    );
    assert_eq!(
        sink.take(),
        vec![Event::Execute("a1".to_string(), ActionCode::AudioOriginalSummary, Trigger::Auto)]
    );
    assert_eq!(
        engine.last_state(CHAT),
        Some(LastPreferenceState {
            mode: Mode::Auto,
            action: Some(ActionCode::AudioOriginalSummary)
        })
    );

    // Auto with no default for the kind still asks
    engine.register(record("i1", TaskKind::Image));
    assert_eq!(engine.apply(CHAT, "i1").await, Some(Decision::Prompt));
}

#[tokio::test]
async fn test_action_none_switches_back_to_ask() {
    let (engine, _sink) = setup();
    engine
        .handle_preference(
            CHAT,
            &PreferenceCommand::Action {
                kind: TaskKind::Image,
                action: ActionCode::ImageOriginal,
            },
        )
        .await;
    let outcome = engine
        .handle_preference(
            CHAT,
            &PreferenceCommand::Action {
                kind: TaskKind::Image,
                action: ActionCode::None,
            },
        )
        .await;

    match outcome {
        PreferenceOutcome::Updated(prefs) => {
            assert_eq!(prefs.mode, Mode::Ask);
            assert_eq!(prefs.default_actions.image, ActionCode::None);
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[tokio::test]
async fn test_pipeline_applies_to_pending_and_undo_restores() {
    let (engine, sink) = setup();
    engine.register(record("d1", TaskKind::Document));
    engine.register(record("i1", TaskKind::Image));

    let outcome = engine
        .handle_preference(CHAT, &PreferenceCommand::Pipeline(PipelinePreset::Summary))
        .await;
    let prefs = match outcome {
        PreferenceOutcome::PipelineApplied(PipelinePreset::Summary, prefs) => prefs,
        other => panic!("unexpected outcome: {other:?}"),
    };
    assert_eq!(prefs.mode, Mode::Auto);
    assert_eq!(prefs.default_actions, PipelinePreset::Summary.actions());

    // Oldest record first
    assert_eq!(
        sink.take(),
        vec![
            Event::Execute("d1".to_string(), ActionCode::DocumentSummary, Trigger::Auto),
            Event::Execute("i1".to_string(), ActionCode::ImageSummary, Trigger::Auto),
        ]
    );

    let restored = engine
        .handle_preference(CHAT, &PreferenceCommand::Undo)
        .await;
    assert_eq!(restored, PreferenceOutcome::Restored(Preferences::default()));
    assert_eq!(
        engine.handle_preference(CHAT, &PreferenceCommand::Undo).await,
        PreferenceOutcome::NothingToUndo
    );
}

#[tokio::test]
async fn test_integration_toggle_and_reset() {
    let (engine, _sink) = setup();

    let toggle = PreferenceCommand::Integration {
        integration: Integration::Slack,
        change: IntegrationChange::Toggle,
    };
    match engine.handle_preference(CHAT, &toggle).await {
        PreferenceOutcome::Updated(prefs) => assert!(!prefs.integrations.slack),
        other => panic!("unexpected outcome: {other:?}"),
    }

    let notion_on = PreferenceCommand::Integration {
        integration: Integration::Notion,
        change: IntegrationChange::On,
    };
    match engine.handle_preference(CHAT, &notion_on).await {
        PreferenceOutcome::Updated(prefs) => {
            assert!(prefs.integrations.notion);
            assert!(!prefs.integrations.slack);
        }
        other => panic!("unexpected outcome: {other:?}"),
    }

    assert_eq!(engine.reset(CHAT).await, Preferences::default());
    // Reset can be undone too
    let restored = engine.undo(CHAT).await.expect("history entry");
    assert!(restored.integrations.notion);
}

#[tokio::test]
async fn test_open_shows_current_preferences() {
    let (engine, _sink) = setup();
    engine
        .handle_preference(CHAT, &PreferenceCommand::Mode(Mode::Skip))
        .await;
    match engine.handle_preference(CHAT, &PreferenceCommand::Open).await {
        PreferenceOutcome::Show(prefs) => assert_eq!(prefs.mode, Mode::Skip),
        other => panic!("unexpected outcome: {other:?}"),
    }
}

/// Sink whose actions take a while, so concurrent callers overlap
#[derive(Default)]
struct SlowSink {
    executed: Mutex<Vec<String>>,
}

#[async_trait]
impl FollowupSink for SlowSink {
    async fn prompt(&self, _record: &FollowupRecord, _prefs: &Preferences) -> Result<()> {
        Ok(())
    }

    async fn execute(&self, _action: ActionCode, record: &FollowupRecord, _trigger: Trigger) -> Result<()> {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        self.executed.lock().unwrap().push(record.task_id.clone());
        Ok(())
    }

    async fn announce_skip(&self, _record: &FollowupRecord) -> Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn test_concurrent_apply_runs_auto_action_once() {
    let sink = Arc::new(SlowSink::default());
    let engine = FollowupEngine::new(Arc::new(PreferenceStore::in_memory()), sink.clone());
    engine
        .handle_preference(
            CHAT,
            &PreferenceCommand::Action {
                kind: TaskKind::Document,
                action: ActionCode::DocumentOriginal,
            },
        )
        .await;

    engine.register(record("b", TaskKind::Document));
    let (decision, applied) = tokio::join!(
        engine.apply(CHAT, "b"),
        engine.apply_pending(CHAT, None)
    );

    assert_eq!(decision, Some(Decision::AutoApply(ActionCode::DocumentOriginal)));
    assert_eq!(applied, 0);
    assert_eq!(*sink.executed.lock().unwrap(), vec!["b".to_string()]);
    assert_eq!(engine.pending_count(CHAT), 0);
}

#[tokio::test]
async fn test_concurrent_follow_clicks_run_action_once() {
    let sink = Arc::new(SlowSink::default());
    let engine = FollowupEngine::new(Arc::new(PreferenceStore::in_memory()), sink.clone());
    engine.register(record("c", TaskKind::Document));

    let (first, second) = tokio::join!(
        engine.handle_follow(CHAT, "c", FollowChoice::Once, ActionCode::DocumentOriginal),
        engine.handle_follow(CHAT, "c", FollowChoice::Once, ActionCode::DocumentOriginal)
    );

    let outcomes = [first, second];
    assert_eq!(
        outcomes.iter().filter(|o| **o == FollowOutcome::NotFound).count(),
        1
    );
    assert_eq!(sink.executed.lock().unwrap().len(), 1);
}
