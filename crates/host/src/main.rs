use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use deferral_core::{ConversationReference, OperationId, PrincipalId, SecurityContext, Signal};
use deferral_dialog::{
    InMemoryCounterStore, MessageSender, OutboundMessage, QueueTimeoutScheduler, TextTemplate,
    TurnContext, WaitOptions,
};
use deferral_dispatch::{DispatchConfig, DispatchService, WorkQueue};
use deferral_host::{Command, ConsoleSender, ConversationAdapter};

const APP_ID: &str = "deferral-host";
const REPROMPT: &str = "Still working on it ({{reprompt}} of {{max}} reminders, {{remaining}} left).";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    deferral_observability::init();

    let config = DispatchConfig::from_env();
    let queue = Arc::new(WorkQueue::new());
    let sender = Arc::new(ConsoleSender::new());
    let adapter = Arc::new(
        ConversationAdapter::new(
            Arc::new(QueueTimeoutScheduler::new(queue.clone())),
            Arc::new(InMemoryCounterStore::new()),
            sender.clone(),
        )
        .with_completion_notice("Done waiting."),
    );
    let service = DispatchService::with_queue(queue, adapter.clone(), config);
    service.start().await;

    let prompt = Arc::new(TextTemplate::parse(REPROMPT).context("invalid reprompt template")?);
    let security = SecurityContext::channel(PrincipalId::new(), APP_ID);
    let conversation = ConversationReference::new("console", "console").with_user("local");
    let turn = |signal: Signal| TurnContext::new(security.clone(), conversation.clone(), signal);

    println!("type `/wait <seconds> <max ignored messages>` to start a wait, `/quit` to leave");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut waits = 0u64;

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("reading stdin")?,
            _ = &mut ctrl_c => {
                info!("ctrl-c received");
                break;
            }
        };
        let Some(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }

        let command = match line.parse::<Command>() {
            Ok(command) => command,
            Err(err) => {
                println!("{err}");
                continue;
            }
        };

        match command {
            Command::Wait {
                delay_seconds,
                max_ignored_messages,
            } => {
                waits += 1;
                let options = WaitOptions::new(delay_seconds, max_ignored_messages).with_prompt(prompt.clone());
                let operation = OperationId::new(format!("wait-{waits}"));
                match adapter.begin_wait(&turn(Signal::message(line)), operation, options).await {
                    Ok(_) => {
                        let text = format!("Waiting {delay_seconds}s. Messages sent meanwhile get a reminder.");
                        sender.send(&conversation, OutboundMessage::text(text)).await?;
                    }
                    Err(err) => println!("could not start waiting: {err}"),
                }
            }
            Command::Message(text) => {
                // Turn errors are already reported to the conversation by the adapter.
                if let Ok(None) = adapter.handle_turn(&turn(Signal::message(text.clone()))).await {
                    sender
                        .send(&conversation, OutboundMessage::text(format!("You said: {text}")))
                        .await?;
                }
            }
            Command::Stats => {
                let stats = service.stats().await.unwrap_or_default();
                println!("{}", serde_json::to_string_pretty(&stats)?);
                println!("in flight: {}", service.in_flight().await);
            }
            Command::Quit => break,
        }
    }

    match service.shutdown().await {
        Some(report) => {
            if report.abandoned > 0 {
                warn!(abandoned = report.abandoned, "shutdown left work unfinished");
            }
            info!(
                gate = ?report.gate,
                completed = report.completed,
                abandoned = report.abandoned,
                elapsed_ms = report.elapsed.as_millis() as u64,
                "dispatch service stopped"
            );
        }
        None => warn!("dispatch service was not running"),
    }
    Ok(())
}
