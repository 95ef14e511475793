//! Scripted fakes for the gateway, memory and agent seams.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use crate::agents::{Agent, AgentContext, AgentDescriptor, AgentError, AgentRef, AgentResult};
use crate::llm::{ChatMessage, Completion, LlmError, ModelGateway, ToolDefinition};
use crate::memory::{Chunk, ExtractiveSummarizer, RagRetriever, RetrievalError, SearchScope, Summarizer};
use crate::task::AgentTask;

/// Gateway answering from a queue; `Ok("ok")` once the queue is empty.
#[derive(Default)]
pub struct ScriptedGateway {
    queue: Mutex<VecDeque<Result<Completion, LlmError>>>,
    requests: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, response: Result<Completion, LlmError>) {
        self.queue.lock().unwrap().push_back(response);
    }

    pub fn push_text(&self, text: &str) {
        self.push(Ok(Completion::text(text)));
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<Vec<ChatMessage>> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ModelGateway for ScriptedGateway {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        _tools: Option<&[ToolDefinition]>,
    ) -> Result<Completion, LlmError> {
        self.requests.lock().unwrap().push(messages.to_vec());
        self.queue
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(Completion::text("ok")))
    }
}

enum SummaryMode {
    Extractive,
    Always(String),
    Failing,
}

pub struct ScriptedSummarizer {
    mode: SummaryMode,
    calls: AtomicUsize,
}

impl ScriptedSummarizer {
    /// Extractive summaries, no model.
    pub fn new() -> Self {
        Self {
            mode: SummaryMode::Extractive,
            calls: AtomicUsize::new(0),
        }
    }

    /// Answer every call with `summary`.
    pub fn always(mut self, summary: impl Into<String>) -> Self {
        self.mode = SummaryMode::Always(summary.into());
        self
    }

    pub fn failing() -> Self {
        Self {
            mode: SummaryMode::Failing,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Summarizer for ScriptedSummarizer {
    async fn summarize(&self, text: &str, target_tokens: usize) -> Result<String, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.mode {
            SummaryMode::Extractive => Ok(ExtractiveSummarizer::extract(text, target_tokens)),
            SummaryMode::Always(summary) => Ok(summary.clone()),
            SummaryMode::Failing => Err(LlmError::model_unavailable("summarizer down".to_string())),
        }
    }
}

/// Retriever that always fails.
pub struct ScriptedRetriever {
    error: RetrievalError,
}

impl ScriptedRetriever {
    pub fn unavailable() -> Self {
        Self {
            error: RetrievalError::Unavailable("index offline".to_string()),
        }
    }
}

#[async_trait]
impl RagRetriever for ScriptedRetriever {
    async fn search(
        &self,
        _query: &str,
        _scope: &SearchScope,
        _top_k: usize,
    ) -> Result<Vec<Chunk>, RetrievalError> {
        Err(self.error.clone())
    }
}

/// Start/end log shared by agents, tracking peak concurrency.
#[derive(Default)]
pub struct Journal {
    entries: Mutex<Vec<String>>,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl Journal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn start(&self, name: &str) {
        self.entries.lock().unwrap().push(format!("start:{name}"));
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn end(&self, name: &str) {
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.entries.lock().unwrap().push(format!("end:{name}"));
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().unwrap().clone()
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

enum Step {
    Reply(String),
    Fail(String),
}

enum Fallback {
    Default,
    Fail(String),
    Error(AgentError),
}

#[derive(Default)]
struct Observed {
    calls: usize,
    contexts: Vec<AgentContext>,
}

/// What an agent saw, readable after it was moved into a registry.
#[derive(Clone)]
pub struct AgentHandle {
    observed: Arc<Mutex<Observed>>,
}

impl AgentHandle {
    pub fn calls(&self) -> usize {
        self.observed.lock().unwrap().calls
    }

    pub fn contexts(&self) -> Vec<AgentContext> {
        self.observed.lock().unwrap().contexts.clone()
    }
}

/// Agent that follows a script, then answers by default.
///
/// Default reply: a success whose delta holds a tool result keyed
/// `"{subtask_id}:{name}"` plus any configured metadata.
pub struct ScriptedAgent {
    descriptor: AgentDescriptor,
    steps: Mutex<VecDeque<Step>>,
    fallback: Fallback,
    delay: Option<Duration>,
    journal: Option<Arc<Journal>>,
    metadata: Vec<(String, serde_json::Value)>,
    observed: Arc<Mutex<Observed>>,
}

impl ScriptedAgent {
    pub fn new<I, S>(name: impl Into<String>, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            descriptor: AgentDescriptor::new(name, capabilities),
            steps: Mutex::new(VecDeque::new()),
            fallback: Fallback::Default,
            delay: None,
            journal: None,
            metadata: Vec::new(),
            observed: Arc::new(Mutex::new(Observed::default())),
        }
    }

    pub fn arc<I, S>(name: impl Into<String>, capabilities: I) -> AgentRef
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self::new(name, capabilities).into_ref()
    }

    pub fn reply(self, text: impl Into<String>) -> Self {
        self.steps.lock().unwrap().push_back(Step::Reply(text.into()));
        self
    }

    /// Queue one failed attempt.
    pub fn fail(self, message: impl Into<String>) -> Self {
        self.steps.lock().unwrap().push_back(Step::Fail(message.into()));
        self
    }

    pub fn always_fail(mut self, message: impl Into<String>) -> Self {
        self.fallback = Fallback::Fail(message.into());
        self
    }

    pub fn always_error(mut self, error: AgentError) -> Self {
        self.fallback = Fallback::Error(error);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_journal(mut self, journal: Arc<Journal>) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.push((key.into(), value));
        self
    }

    pub fn handle(&self) -> AgentHandle {
        AgentHandle {
            observed: Arc::clone(&self.observed),
        }
    }

    pub fn into_ref(self) -> AgentRef {
        Arc::new(self)
    }

    fn success(&self, task: &AgentTask, content: String) -> AgentResult {
        let subtask = task
            .parameter("subtask_id")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| task.id().to_string());
        let mut delta = AgentContext::new();
        delta.set_tool_result(
            format!("{}:{}", subtask, self.descriptor.name()),
            json!(content),
        );
        for (key, value) in &self.metadata {
            delta.metadata.insert(key.clone(), value.clone());
        }
        AgentResult::success(&self.descriptor, task.id(), content).with_context(delta)
    }
}

#[async_trait]
impl Agent for ScriptedAgent {
    fn descriptor(&self) -> &AgentDescriptor {
        &self.descriptor
    }

    async fn process(
        &self,
        task: &AgentTask,
        context: &AgentContext,
    ) -> Result<AgentResult, AgentError> {
        {
            let mut observed = self.observed.lock().unwrap();
            observed.calls += 1;
            observed.contexts.push(context.clone());
        }
        let name = self.descriptor.name();
        if let Some(journal) = &self.journal {
            journal.start(name);
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let step = self.steps.lock().unwrap().pop_front();
        let outcome = match step {
            Some(Step::Reply(text)) => Ok(self.success(task, text)),
            Some(Step::Fail(message)) => Err(AgentError::Failed(message)),
            None => match &self.fallback {
                Fallback::Default => Ok(self.success(
                    task,
                    format!("{} handled: {}", name, task.description()),
                )),
                Fallback::Fail(message) => Err(AgentError::Failed(message.clone())),
                Fallback::Error(error) => Err(error.clone()),
            },
        };
        if let Some(journal) = &self.journal {
            journal.end(name);
        }
        outcome
    }
}
