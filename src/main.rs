//! taskweave - command line entry point
//!
//! Runs one request through the orchestrator and prints the result as JSON.
//!
//! ```text
//! OPENROUTER_API_KEY=... taskweave "Research X and then write a summary"
//! ```

use std::sync::Arc;

use anyhow::Context;
use serde_json::json;
use taskweave::agents::{AgentContext, AgentRegistry, LlmAgent};
use taskweave::config::Config;
use taskweave::llm::{ModelGateway, OpenRouterGateway};
use taskweave::task::AgentTask;
use taskweave::Orchestrator;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn default_roster(registry: &AgentRegistry, gateway: &Arc<dyn ModelGateway>, coordinator: &str) {
    let roster: [(&str, &[&str], &str); 4] = [
        (
            coordinator,
            &["coordination", "planning", "review"],
            "You coordinate a team of specialists and review their work.",
        ),
        (
            "researcher",
            &["research", "web-search", "summarize"],
            "You research facts and report them with their sources.",
        ),
        (
            "coder",
            &["coding", "debugging", "file-reading"],
            "You write, read and fix code.",
        ),
        (
            "writer",
            &["writing", "editing", "summarize"],
            "You write clear prose for the requested audience.",
        ),
    ];
    for (name, capabilities, role) in roster {
        let agent = LlmAgent::new(name, capabilities.iter().copied(), Arc::clone(gateway))
            .with_role_prompt(role);
        registry.register(Arc::new(agent));
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "taskweave=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let request = std::env::args().skip(1).collect::<Vec<_>>().join(" ");
    if request.trim().is_empty() {
        anyhow::bail!("usage: taskweave <request>");
    }

    // Load configuration
    let config = Config::from_env().context("loading configuration")?;
    info!(
        "Loaded configuration: model={}, pattern={}",
        config.default_model,
        config.orchestrator.pattern.as_str()
    );

    let gateway: Arc<dyn ModelGateway> = Arc::new(
        OpenRouterGateway::new(config.api_key.clone(), config.default_model.clone())
            .with_api_url(config.api_url.clone()),
    );
    let registry = AgentRegistry::new();
    default_roster(&registry, &gateway, &config.orchestrator.coordinator_agent);

    let orchestrator = Orchestrator::new(registry, gateway, config.orchestrator.clone());
    let task = AgentTask::new(request.trim());

    match orchestrator.execute(&task, &AgentContext::new()).await {
        Ok(outcome) => {
            let output = json!({
                "success": outcome.result.success,
                "content": outcome.result.content,
                "error": outcome.result.error,
                "metrics": outcome.metrics,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
            Ok(())
        }
        Err(failed) => {
            error!("{}", failed);
            let partial: Vec<_> = failed
                .partial_results
                .iter()
                .map(|(id, result)| json!({ "subtask": id, "content": result.content }))
                .collect();
            let output = json!({
                "success": false,
                "error": failed.cause.to_string(),
                "partial_results": partial,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
            Err(failed.into())
        }
    }
}
