//! `agentry chat` — Run one query and stream the answer to stdout.
//!
//! Tool activity goes to stderr. Ctrl-C stops the turn; the stream still
//! delivers its final `workflow_finished` event before the command exits.

use std::io::Write;

use agentry_agent::{EventPayload, RunStatus};
use agentry_config::AppConfig;
use agentry_core::turn::TurnRequest;
use tokio_stream::StreamExt;
use tracing::info;

/// Where a piece of rendered output goes.
#[derive(Debug, PartialEq)]
enum Output {
    Stdout(String),
    Stderr(String),
}

fn status_name(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Running => "running",
        RunStatus::Succeeded => "succeeded",
        RunStatus::Failed => "failed",
        RunStatus::Stopped => "stopped",
    }
}

fn render(payload: &EventPayload) -> Option<Output> {
    match payload {
        EventPayload::Message { answer } => Some(Output::Stdout(answer.clone())),
        EventPayload::NodeStarted { data } => Some(Output::Stderr(format!("\n  [{}] running...", data.title))),
        EventPayload::NodeFinished { data } => {
            let mut line = format!(
                "  [{}] {} in {:.1}s",
                data.title,
                status_name(data.status),
                data.elapsed_time.unwrap_or_default()
            );
            if let Some(error) = &data.error {
                line.push_str(&format!(": {error}"));
            }
            Some(Output::Stderr(line))
        }
        EventPayload::WorkflowFinished { data } => match data.status {
            RunStatus::Stopped => Some(Output::Stderr("\n  [stopped]".into())),
            _ => Some(Output::Stdout("\n".into())),
        },
        EventPayload::Error { message } => Some(Output::Stderr(format!("\n  [Error] {message}"))),
        EventPayload::WorkflowStarted | EventPayload::MessageReplace { .. } => None,
    }
}

pub async fn run(
    message: String,
    agent: String,
    user: String,
    conversation: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;

    if !config.has_api_key() {
        eprintln!();
        eprintln!("  ERROR: No API key configured!");
        eprintln!();
        eprintln!("  Set AGENTRY_API_KEY (or OPENAI_API_KEY), or add it to:");
        eprintln!("    {}", AppConfig::config_dir().join("config.toml").display());
        eprintln!();
        return Err("No API key found. See above for setup instructions.".into());
    }

    let engine = agentry_gateway::build_engine(config).await?;

    let mut request = TurnRequest::new(agent, user, message);
    request.conversation_id = conversation;
    let mut stream = engine.run_streaming(request).await?;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut stopping = false;
    let mut conversation_id = String::new();
    let mut failed = false;
    let mut stdout = std::io::stdout();

    loop {
        tokio::select! {
            event = stream.next() => {
                let Some(event) = event else { break };
                conversation_id.clone_from(&event.conversation_id);
                failed |= matches!(event.payload, EventPayload::Error { .. });
                match render(&event.payload) {
                    Some(Output::Stdout(text)) => {
                        print!("{text}");
                        stdout.flush()?;
                    }
                    Some(Output::Stderr(text)) => eprintln!("{text}"),
                    None => {}
                }
            }
            _ = &mut ctrl_c, if !stopping => {
                stopping = true;
                info!(message_id = %stream.context().message_id(), "Ctrl-C received, stopping turn");
                eprintln!("\n  Stopping...");
                stream.stop();
            }
        }
    }

    if !conversation_id.is_empty() {
        eprintln!("  conversation: {conversation_id}");
    }
    if failed {
        return Err("turn failed".into());
    }
    Ok(())
}
