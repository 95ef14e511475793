//! Model-backed agent.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use super::{Agent, AgentContext, AgentDescriptor, AgentError, AgentResult, Capability};
use crate::llm::{ChatMessage, ModelGateway, ToolDefinition};
use crate::task::AgentTask;

/// Agent that answers a task with a single model call.
///
/// # Algorithm
/// 1. Build a system prompt from the agent's role and capabilities
/// 2. Replay the isolated conversation
/// 3. Send the task description with the reference section (chunks, tool
///    results, files)
/// 4. Return the answer plus a context delta holding it
pub struct LlmAgent {
    descriptor: AgentDescriptor,
    gateway: Arc<dyn ModelGateway>,
    role_prompt: Option<String>,
    tools: Vec<ToolDefinition>,
}

impl LlmAgent {
    pub fn new<I, S>(name: impl Into<String>, capabilities: I, gateway: Arc<dyn ModelGateway>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            descriptor: AgentDescriptor::new(name, capabilities),
            gateway,
            role_prompt: None,
            tools: Vec::new(),
        }
    }

    /// Replace the default role description.
    pub fn with_role_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.role_prompt = Some(prompt.into());
        self
    }

    /// Offer tool definitions to the model.
    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }

    fn build_system_prompt(&self) -> String {
        let role = self.role_prompt.clone().unwrap_or_else(|| {
            format!(
                "You are {}, a specialist agent in a team coordinated by an orchestrator.",
                self.descriptor.name()
            )
        });
        let capabilities = self
            .descriptor
            .capabilities()
            .iter()
            .map(Capability::as_str)
            .collect::<Vec<_>>()
            .join(", ");

        format!(
            r#"{role}

## Capabilities
{capabilities}

## Rules
1. Work only on the task you are given; other agents handle the rest
2. Use the provided context instead of guessing
3. If something blocks you, say exactly what is missing
4. Answer with the result itself, not a description of what you would do"#
        )
    }

    fn build_user_message(task: &AgentTask, context: &AgentContext) -> String {
        let reference = context.render_reference_section();
        if reference.is_empty() {
            format!("## Task\n{}", task.description())
        } else {
            format!("{}\n## Task\n{}", reference, task.description())
        }
    }

    /// Key under which this agent's answer lands in the shared context.
    fn output_key(&self, task: &AgentTask) -> String {
        let scope = task
            .parameter("subtask_id")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| task.id().to_string());
        format!("{}:{}", scope, self.descriptor.name())
    }
}

#[async_trait]
impl Agent for LlmAgent {
    fn descriptor(&self) -> &AgentDescriptor {
        &self.descriptor
    }

    async fn process(
        &self,
        task: &AgentTask,
        context: &AgentContext,
    ) -> Result<AgentResult, AgentError> {
        let mut messages = vec![ChatMessage::system(self.build_system_prompt())];
        messages.extend(
            context
                .conversation_history
                .iter()
                .map(|m| ChatMessage::new(m.role, m.content.clone())),
        );
        messages.push(ChatMessage::user(Self::build_user_message(task, context)));

        let tools = (!self.tools.is_empty()).then_some(self.tools.as_slice());
        let completion = self.gateway.complete(&messages, tools).await?;

        let content = completion.content.trim().to_string();
        if content.is_empty() && completion.tool_calls.is_empty() {
            return Err(AgentError::Failed(format!(
                "{} returned an empty response",
                self.descriptor.name()
            )));
        }

        tracing::debug!(
            "{} answered task {} ({} chars, {} tool calls)",
            self.descriptor.name(),
            task.id(),
            content.len(),
            completion.tool_calls.len()
        );

        let key = self.output_key(task);
        let mut delta = AgentContext::new();
        delta.set_tool_result(key.clone(), json!(content));
        if !completion.tool_calls.is_empty() {
            delta.set_tool_result(format!("{key}:tool_calls"), json!(completion.tool_calls));
        }
        delta.set_agent_state(self.descriptor.name(), "last_task", json!(task.id().to_string()));

        Ok(AgentResult::success(&self.descriptor, task.id(), content)
            .with_tool_calls(completion.tool_calls)
            .with_usage(completion.usage)
            .with_context(delta))
    }

    fn description(&self) -> &str {
        "Answers a task with one model call over its isolated context"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::ContextMessage;
    use crate::llm::{Completion, FunctionCall, Role, TokenUsage, ToolCall};
    use crate::testing::ScriptedGateway;

    #[tokio::test]
    async fn test_process_returns_answer_and_delta() {
        let gateway = Arc::new(ScriptedGateway::new());
        gateway.push(Ok(Completion {
            content: "  The answer.  ".into(),
            tool_calls: Vec::new(),
            usage: Some(TokenUsage::new(10, 5)),
        }));
        let agent = LlmAgent::new("writer", ["writing"], gateway.clone());
        let task = AgentTask::new("Write it").with_parameter("subtask_id", json!("s1"));
        let context = AgentContext::with_history(vec![ContextMessage::user("earlier question")]);

        let result = agent.process(&task, &context).await.unwrap();

        assert!(result.success);
        assert_eq!(result.content, "The answer.");
        assert_eq!(result.usage.unwrap().total_tokens, 15);
        let delta = result.updated_context.unwrap();
        assert_eq!(delta.tool_result("s1:writer"), Some(&json!("The answer.")));
        assert!(delta.conversation_history.is_empty());

        let sent = gateway.requests();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0][0].role, Role::System);
        assert_eq!(sent[0][1].content, "earlier question");
        assert!(sent[0].last().unwrap().content.ends_with("Write it"));
    }

    #[tokio::test]
    async fn test_process_records_tool_calls() {
        let gateway = Arc::new(ScriptedGateway::new());
        let call = ToolCall {
            id: "call-1".into(),
            call_type: "function".into(),
            function: FunctionCall {
                name: "search".into(),
                arguments: "{}".into(),
            },
        };
        gateway.push(Ok(Completion {
            content: String::new(),
            tool_calls: vec![call.clone()],
            usage: None,
        }));
        let agent = LlmAgent::new("researcher", ["research"], gateway);
        let task = AgentTask::new("Look it up").with_parameter("subtask_id", json!("s2"));

        let result = agent.process(&task, &AgentContext::new()).await.unwrap();
        assert_eq!(result.tool_calls, vec![call]);
        assert!(result
            .updated_context
            .unwrap()
            .tool_result("s2:researcher:tool_calls")
            .is_some());
    }

    #[tokio::test]
    async fn test_empty_response_is_failure() {
        let gateway = Arc::new(ScriptedGateway::new());
        gateway.push_text("   ");
        let agent = LlmAgent::new("coder", ["coding"], gateway);
        let err = agent
            .process(&AgentTask::new("Do it"), &AgentContext::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Failed(_)));
    }

    #[tokio::test]
    async fn test_gateway_error_propagates() {
        let gateway = Arc::new(ScriptedGateway::new());
        gateway.push(Err(crate::llm::LlmError::model_unavailable("down".into())));
        let agent = LlmAgent::new("coder", ["coding"], gateway);
        let err = agent
            .process(&AgentTask::new("Do it"), &AgentContext::new())
            .await
            .unwrap_err();
        assert!(err.is_gateway_unavailable());
    }
}
