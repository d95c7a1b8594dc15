//! Agentic planning loop
//!
//! ```text
//! history + query ──▸ model ──▸ reply lines ──▸ actions ──▸ channel
//!                       ▲                           │
//!                       └── screenshot (vision) ◂───┘   at most 3 rounds
//! ```
//!
//! Only the user query and the final text reply are persisted; vision round
//! trips stay in memory.

use thiserror::Error;
use tracing::{debug, info, warn};

use super::executor::{execute_lines, EventSink, RunEvent};
use super::model::{LanguageModel, ModelError};
use super::prompt::{vision_text, SYSTEM_PROMPT};
use super::tokenizer::parse_reply;
use crate::client::{CommandChannel, TransportError};
use crate::context::{ContentBlock, ContextStore, ConversationTurn};

/// Default bound on model calls per run
pub const MAX_ROUNDS: usize = 3;

#[derive(Debug, Error)]
pub enum AiError {
    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Summary of one run.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RunReport {
    /// Number of model calls made.
    pub rounds: usize,
    /// Reply of the terminal round. `None` if every round was a vision round.
    pub final_response: Option<String>,
    pub actions_executed: usize,
    pub failures: Vec<(String, String)>,
    /// Whether the history file was written.
    pub context_saved: bool,
}

pub struct Orchestrator {
    model: Box<dyn LanguageModel>,
    store: ContextStore,
    max_rounds: usize,
    events: EventSink,
}

impl Orchestrator {
    pub fn new(model: Box<dyn LanguageModel>, store: ContextStore) -> Self {
        Self {
            model,
            store,
            max_rounds: MAX_ROUNDS,
            events: EventSink::default(),
        }
    }

    pub fn with_max_rounds(mut self, rounds: usize) -> Self {
        self.max_rounds = rounds.max(1);
        self
    }

    /// Send progress events to `events`.
    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    pub fn store(&self) -> &ContextStore {
        &self.store
    }

    /// Turn `query` into actions, looping while the model asks for a screenshot.
    pub async fn run<C>(
        &self,
        channel: &mut C,
        query: &str,
        no_context: bool,
    ) -> Result<RunReport, AiError>
    where
        C: CommandChannel + ?Sized,
    {
        let history = if no_context {
            Vec::new()
        } else {
            self.load_history()
        };
        if !history.is_empty() {
            self.events.emit(RunEvent::ContextLoaded(history.len()));
        }

        let user_turn = ConversationTurn::user(query);
        let mut transcript = history.clone();
        transcript.push(user_turn.clone());

        let mut report = RunReport::default();

        for round in 1..=self.max_rounds {
            self.events.emit(RunEvent::Round(round));
            report.rounds = round;

            let reply = self.model.complete(SYSTEM_PROMPT, &transcript).await?;
            debug!("[ai] Round {} reply: {:?}", round, reply);

            let lines = parse_reply(&reply);
            let execution = execute_lines(channel, &lines, &self.events).await?;
            report.actions_executed += execution.executed;
            report.failures.extend(execution.failures);

            transcript.push(ConversationTurn::assistant(reply.clone()));

            match execution.screenshot {
                Some(shot) if self.model.supports_vision() => {
                    info!(
                        "[ai] Vision round {} ({}, {:?})",
                        round, shot.media_type, shot.dimensions
                    );
                    transcript.push(ConversationTurn::user_blocks(vec![
                        ContentBlock::image(shot.media_type, shot.data),
                        ContentBlock::text(vision_text(shot.dimensions)),
                    ]));
                }
                _ => {
                    report.final_response = Some(reply);
                    break;
                }
            }
        }

        if !no_context {
            if let Some(response) = report.final_response.as_deref().filter(|r| !r.is_empty()) {
                let mut updated = history;
                updated.push(user_turn);
                updated.push(ConversationTurn::assistant(response));
                match self.store.save(&updated) {
                    Ok(()) => report.context_saved = true,
                    Err(e) => {
                        warn!("[ai] {}", e);
                        self.events.emit(RunEvent::ContextSaveFailed(e.to_string()));
                    }
                }
            }
        }

        Ok(report)
    }

    /// Single pass without vision or context, for text-only models.
    pub async fn run_fallback<C>(&self, channel: &mut C, query: &str) -> Result<RunReport, AiError>
    where
        C: CommandChannel + ?Sized,
    {
        self.events.emit(RunEvent::Round(1));
        let reply = self
            .model
            .complete(SYSTEM_PROMPT, &[ConversationTurn::user(query)])
            .await?;

        let execution = execute_lines(channel, &parse_reply(&reply), &self.events).await?;
        Ok(RunReport {
            rounds: 1,
            final_response: Some(reply),
            actions_executed: execution.executed,
            failures: execution.failures,
            context_saved: false,
        })
    }

    /// Delete the saved history.
    pub fn clear_context(&self) -> Result<(), crate::context::ContextError> {
        self.store.clear()
    }

    fn load_history(&self) -> Vec<ConversationTurn> {
        match self.store.load() {
            Ok(turns) => turns,
            Err(e) => {
                // A broken history must not block the request
                warn!("[ai] Ignoring saved context: {}", e);
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{Role, TurnContent};
    use crate::protocol::{Command, CommandResult, ResultData};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    /// Transcripts seen by the scripted model, one per call.
    type Recorder = Arc<Mutex<Vec<Vec<ConversationTurn>>>>;

    const PIXEL_PNG: &str = "iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAYAAAAfFcSJAAAADUlEQVR42mNkYPhfDwAChwGA60e6kgAAAABJRU5ErkJggg==";

    struct ScriptedModel {
        replies: Mutex<Vec<String>>,
        seen: Recorder,
    }

    impl ScriptedModel {
        fn new(replies: &[&str]) -> (Self, Recorder) {
            let seen = Recorder::default();
            (
                Self {
                    replies: Mutex::new(replies.iter().map(|r| r.to_string()).collect()),
                    seen: seen.clone(),
                },
                seen,
            )
        }
    }

    #[async_trait]
    impl LanguageModel for ScriptedModel {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn complete(
            &self,
            _system: &str,
            turns: &[ConversationTurn],
        ) -> Result<String, ModelError> {
            self.seen.lock().unwrap().push(turns.to_vec());
            let mut replies = self.replies.lock().unwrap();
            if replies.is_empty() {
                return Err(ModelError::Empty);
            }
            Ok(replies.remove(0))
        }
    }

    /// Answers `screenshot` with a tiny PNG and everything else with ok.
    #[derive(Default)]
    struct FakeDevice {
        received: Vec<Command>,
    }

    #[async_trait]
    impl CommandChannel for FakeDevice {
        async fn run(&mut self, cmd: Command) -> Result<CommandResult, TransportError> {
            let data = if cmd.cmd == "screenshot" {
                json!({"content": PIXEL_PNG, "width": 1080, "height": 2400})
                    .as_object()
                    .cloned()
                    .unwrap()
            } else {
                ResultData::new()
            };
            let id = cmd.id.clone();
            self.received.push(cmd);
            Ok(CommandResult::ok(id, data))
        }
    }

    fn store(temp_dir: &TempDir) -> ContextStore {
        ContextStore::for_device(temp_dir.path(), "Pixel")
    }

    #[tokio::test]
    async fn test_screenshot_round_triggers_one_more_round() {
        let temp_dir = TempDir::new().unwrap();
        let (model, seen) = ScriptedModel::new(&["tether screenshot", "tether tap 540 420"]);
        let orchestrator = Orchestrator::new(Box::new(model), store(&temp_dir));
        let mut device = FakeDevice::default();

        let report = orchestrator
            .run(&mut device, "open the first video", false)
            .await
            .unwrap();

        assert_eq!(report.rounds, 2);
        assert_eq!(report.final_response.as_deref(), Some("tether tap 540 420"));
        assert_eq!(device.received.len(), 2);
        assert_eq!(device.received[1].args, vec!["540", "420"]);

        // Second call carries the image, with its size in the instruction
        let calls = seen.lock().unwrap();
        assert_eq!(calls.len(), 2);
        let last = calls[1].last().unwrap();
        assert!(last.has_image());
        let TurnContent::Blocks(blocks) = &last.content else {
            panic!("Expected blocks");
        };
        assert!(matches!(&blocks[1], ContentBlock::Text { text } if text.contains("1080x2400")));

        // Only the query and the final reply are persisted
        let saved = orchestrator.store().load().unwrap();
        assert_eq!(saved.len(), 2);
        assert_eq!(saved[0].role, Role::User);
        assert_eq!(saved[0].text(), Some("open the first video"));
        assert_eq!(saved[1].text(), Some("tether tap 540 420"));
        assert!(report.context_saved);
    }

    #[tokio::test]
    async fn test_history_is_sent_and_extended() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir);
        store
            .save(&[
                ConversationTurn::user("open youtube"),
                ConversationTurn::assistant("tether apps launch youtube"),
            ])
            .unwrap();

        let (model, seen) = ScriptedModel::new(&["tether key back"]);
        let orchestrator = Orchestrator::new(Box::new(model), store);
        let report = orchestrator
            .run(&mut FakeDevice::default(), "go back", false)
            .await
            .unwrap();

        assert_eq!(report.rounds, 1);
        assert_eq!(seen.lock().unwrap()[0].len(), 3);
        assert_eq!(orchestrator.store().load().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_no_context_neither_loads_nor_saves() {
        let temp_dir = TempDir::new().unwrap();
        let store = store(&temp_dir);
        store.save(&[ConversationTurn::user("old")]).unwrap();

        let (model, seen) = ScriptedModel::new(&["tether key home"]);
        let orchestrator = Orchestrator::new(Box::new(model), store);
        let report = orchestrator
            .run(&mut FakeDevice::default(), "go home", true)
            .await
            .unwrap();

        assert!(!report.context_saved);
        assert_eq!(seen.lock().unwrap()[0].len(), 1);
        assert_eq!(orchestrator.store().load().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_all_vision_rounds_persist_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let (model, _) = ScriptedModel::new(&[
            "tether screenshot",
            "tether screenshot",
            "tether screenshot",
        ]);
        let orchestrator = Orchestrator::new(Box::new(model), store(&temp_dir));
        let report = orchestrator
            .run(&mut FakeDevice::default(), "look around", false)
            .await
            .unwrap();

        assert_eq!(report.rounds, MAX_ROUNDS);
        assert_eq!(report.final_response, None);
        assert!(orchestrator.store().load().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_model_failure_aborts_without_saving() {
        let temp_dir = TempDir::new().unwrap();
        let (model, _) = ScriptedModel::new(&[]);
        let orchestrator = Orchestrator::new(Box::new(model), store(&temp_dir));

        let err = orchestrator
            .run(&mut FakeDevice::default(), "anything", false)
            .await
            .unwrap_err();
        assert!(matches!(err, AiError::Model(ModelError::Empty)));
        assert!(!orchestrator.store().path().exists());
    }

    #[tokio::test]
    async fn test_fallback_is_single_pass() {
        let temp_dir = TempDir::new().unwrap();
        let (model, seen) = ScriptedModel::new(&["tether screenshot", "tether key home"]);
        let orchestrator = Orchestrator::new(Box::new(model), store(&temp_dir));
        let mut device = FakeDevice::default();

        let report = orchestrator.run_fallback(&mut device, "look").await.unwrap();

        assert_eq!(report.rounds, 1);
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(device.received.len(), 1);
        assert!(!orchestrator.store().path().exists());
    }
}
