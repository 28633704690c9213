//! Forum fixtures shared by unit tests.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::aggregate::{Aggregate, EventRecorder};
use crate::bus::{EventHandler, HandlerError};
use crate::event::{DomainEvent, EventPayload};

// ============================================================================
// Events
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionCreated {
    pub title: String,
    pub author_id: String,
}

impl QuestionCreated {
    pub fn new(title: &str) -> Self {
        Self {
            title: title.to_string(),
            author_id: "u-1".to_string(),
        }
    }
}

impl EventPayload for QuestionCreated {
    const EVENT_TYPE: &'static str = "QuestionCreated";

    fn validate(&self) -> Result<(), String> {
        if self.title.trim().is_empty() {
            return Err("title must not be blank".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerPosted {
    pub answer_id: Uuid,
    pub author_id: String,
    pub body: String,
}

impl EventPayload for AnswerPosted {
    const EVENT_TYPE: &'static str = "AnswerPosted";
}

// ============================================================================
// Aggregate
// ============================================================================

pub struct Question {
    id: String,
    recorder: EventRecorder,
}

impl Question {
    pub fn ask(author_id: &str, title: &str) -> Self {
        let mut question = Self {
            id: format!("q-{}", Uuid::new_v4()),
            recorder: EventRecorder::new(),
        };
        question.recorder.raise(
            &question.id,
            QuestionCreated {
                title: title.to_string(),
                author_id: author_id.to_string(),
            },
        );
        question
    }

    pub fn answer(&mut self, author_id: &str, body: &str) -> Arc<dyn DomainEvent> {
        self.recorder.raise(
            &self.id,
            AnswerPosted {
                answer_id: Uuid::new_v4(),
                author_id: author_id.to_string(),
                body: body.to_string(),
            },
        )
    }
}

impl Aggregate for Question {
    fn aggregate_id(&self) -> &str {
        &self.id
    }

    fn aggregate_type(&self) -> &str {
        "Question"
    }

    fn pending_events(&self) -> &[Arc<dyn DomainEvent>] {
        self.recorder.events()
    }

    fn clear_events(&mut self) {
        self.recorder.clear();
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// Records every event it sees.
pub struct RecordingHandler {
    name: String,
    seen: RwLock<Vec<Arc<dyn DomainEvent>>>,
}

impl RecordingHandler {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            seen: RwLock::new(Vec::new()),
        }
    }

    pub fn arc(name: &str) -> Arc<Self> {
        Arc::new(Self::new(name))
    }

    pub async fn seen(&self) -> Vec<Arc<dyn DomainEvent>> {
        self.seen.read().await.clone()
    }

    pub async fn count(&self) -> usize {
        self.seen.read().await.len()
    }
}

#[async_trait]
impl EventHandler for RecordingHandler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, event: Arc<dyn DomainEvent>) -> Result<(), HandlerError> {
        self.seen.write().await.push(event);
        Ok(())
    }
}

/// Fails the first `failures` calls, then succeeds.
pub struct FlakyHandler {
    name: String,
    failures: u32,
    calls: AtomicU32,
}

impl FlakyHandler {
    pub fn arc(name: &str, failures: u32) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            failures,
            calls: AtomicU32::new(0),
        })
    }

    pub fn always_failing(name: &str) -> Arc<Self> {
        Self::arc(name, u32::MAX)
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventHandler for FlakyHandler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, _event: Arc<dyn DomainEvent>) -> Result<(), HandlerError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(format!("{} failed on call {}", self.name, call + 1).into());
        }
        Ok(())
    }
}
