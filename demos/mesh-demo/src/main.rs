//! Two agents on an in-process mesh: a planner asks a translator for work,
//! delegates a summary, and reports progress with an event.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use amp_agents::config::RuntimeSettings;
use amp_agents::kernel::{CollectingEventSink, RequestOptions};
use amp_agents::prelude::*;
use amp_agents::telemetry::init_tracing;
use amp_agents::transport::LoopbackNetwork;
use anyhow::{Context as _, Result};
use clap::Parser;
use serde_json::{Value, json};
use tracing::info;

#[derive(Debug, Parser)]
#[command(about = "Runs two AMP agents over the loopback network")]
struct Args {
    /// TOML settings applied to both runtimes.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Emit JSON log lines.
    #[arg(long)]
    json: bool,
    /// Number of translation requests to send.
    #[arg(long, default_value_t = 3)]
    requests: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut settings = match &args.config {
        Some(path) => RuntimeSettings::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => RuntimeSettings::default(),
    };
    settings.apply_process_env()?;
    if args.json {
        settings.telemetry.json = true;
    }
    init_tracing(&settings.telemetry)?;

    let network = LoopbackNetwork::new();
    let translator = build_runtime("translator", &settings)?;
    let events = CollectingEventSink::new();
    let planner = AgentRuntime::builder(identity("planner")?)
        .with_settings(&settings)?
        .event_sink(events.clone())
        .build()?;

    register_translator(&translator)?;

    translator.serve(Arc::new(network.attach(translator.agent_id().clone())))?;
    planner.serve(Arc::new(network.attach(planner.agent_id().clone())))?;
    translator.spawn_maintenance();
    planner.spawn_maintenance();

    let translator_id = translator.agent_id().clone();
    for (n, text) in ["hello mesh", "agents talk", "over amp"]
        .into_iter()
        .cycle()
        .take(args.requests)
        .enumerate()
    {
        let request = RequestPayload::new(CapabilityId::new("translate")?, json!({ "text": text }))
            .with_version(">=1.0.0 <2.0.0");
        let response = planner
            .request_with(
                &translator_id,
                request,
                RequestOptions::default()
                    .in_session("demo-session")
                    .with_timeout(Duration::from_secs(2)),
            )
            .await?;
        info!(
            n,
            version = ?response.capability_version,
            result = %response.result,
            "translation received"
        );
    }

    let task = planner
        .delegate(
            &translator_id,
            RequestPayload::new(
                CapabilityId::new("summarize")?,
                json!({ "text": "a long document about agent meshes" }),
            ),
            "demo-parent",
        )
        .await?;
    info!(task_id = task.task_id(), "summary delegated");
    let summary = task.outcome_within(Duration::from_secs(5)).await?;
    info!(result = %summary.result, "summary completed");

    translator
        .send_event(planner.agent_id(), json!({ "kind": "status", "state": "idle" }))
        .await?;
    for event in events.drain() {
        info!(source = ?event.source.agent_id, payload = %event.payload, "event observed");
    }

    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "translator": translator.metrics().snapshot(),
            "planner": planner.metrics().snapshot(),
        }))?
    );

    planner.shutdown();
    translator.shutdown();
    Ok(())
}

fn identity(id: &str) -> Result<AgentIdentity> {
    Ok(AgentIdentity::builder(AgentId::new(id)?)
        .name(id)?
        .version(env!("CARGO_PKG_VERSION"))?
        .build()?)
}

fn build_runtime(id: &str, settings: &RuntimeSettings) -> Result<AgentRuntime> {
    Ok(AgentRuntime::builder(identity(id)?)
        .with_settings(settings)?
        .auto_create_sessions(true)
        .build()?)
}

fn register_translator(runtime: &AgentRuntime) -> Result<()> {
    let schema = json!({
        "type": "object",
        "required": ["text"],
        "properties": { "text": { "type": "string" } }
    });

    for version in ["1.0.0", "1.1.0", "2.0.0"] {
        let capability = Capability::builder(CapabilityId::new("translate")?)
            .version(version)?
            .input_schema(schema.clone())
            .build()?;
        let tag = version.to_owned();
        runtime.register_capability(capability, move |invocation: Invocation| {
            let tag = tag.clone();
            async move { translate(&tag, invocation).await }
        })?;
    }

    let summarize = Capability::builder(CapabilityId::new("summarize")?)
        .version("1.0.0")?
        .input_schema(schema)
        .build()?;
    runtime.register_capability(summarize, |invocation: Invocation| async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let text = invocation.parameters["text"].as_str().unwrap_or_default();
        let words = text.split_whitespace().count();
        Ok::<Value, HandlerError>(json!({ "summary": format!("{words} words about meshes") }))
    })?;
    Ok(())
}

async fn translate(version: &str, invocation: Invocation) -> HandlerResult<Value> {
    let text = invocation.parameters["text"]
        .as_str()
        .ok_or_else(|| HandlerError::invalid("`text` must be a string"))?;

    let mut seen = 0;
    if let Some(context) = &invocation.context {
        let previous = context
            .update_shared("translations", |previous| {
                Some(json!(previous.and_then(Value::as_u64).unwrap_or(0) + 1))
            })
            .await
            .map_err(|err| HandlerError::execution(err.to_string()))?;
        seen = previous.as_ref().and_then(Value::as_u64).unwrap_or(0) + 1;
    }

    Ok(json!({
        "translated": text.chars().rev().collect::<String>(),
        "engine": version,
        "session_translations": seen,
    }))
}
