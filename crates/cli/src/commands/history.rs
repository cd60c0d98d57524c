//! `deepsearch history` and `deepsearch show`: read stored conversations.

use std::sync::Arc;

use deepsearch_config::AppConfig;
use deepsearch_core::message::{ConversationId, InvocationState, Message, MessagePart, Role};
use deepsearch_core::store::ConversationStore;

async fn open_store() -> Result<Arc<dyn ConversationStore>, Box<dyn std::error::Error>> {
    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;
    deepsearch_gateway::open_store(&config).await
}

pub async fn list(user: String, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    let store = open_store().await?;
    let conversations = store.list(&user).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&conversations)?);
        return Ok(());
    }

    if conversations.is_empty() {
        println!("No conversations for user '{user}'.");
        return Ok(());
    }

    for conv in &conversations {
        println!(
            "{}  {}  {}",
            conv.updated_at.format("%Y-%m-%d %H:%M"),
            conv.id,
            conv.title
        );
    }
    Ok(())
}

pub async fn show(id: String, user: String, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    let store = open_store().await?;
    let conv = store
        .get(&user, &ConversationId::from(&id))
        .await?
        .ok_or("Chat not found")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&conv)?);
        return Ok(());
    }

    println!("{}", conv.title);
    println!("{}", "=".repeat(conv.title.chars().count().max(8)));
    for message in &conv.messages {
        println!();
        for line in describe(message) {
            println!("{line}");
        }
    }
    Ok(())
}

/// Printable lines for one message: a role header, its text, then one line
/// per tool invocation.
fn describe(message: &Message) -> Vec<String> {
    let role = match message.role {
        Role::User => "You",
        Role::Assistant => "Assistant",
        Role::Tool => "Tool",
    };
    let mut lines = vec![format!("[{}] {role}", message.ordinal)];

    let text = message.text();
    if !text.is_empty() {
        lines.extend(text.lines().map(|l| format!("  {l}")));
    }
    for part in &message.parts {
        if let MessagePart::ToolInvocation(inv) = part {
            let status = match inv.state {
                InvocationState::Pending => "pending",
                InvocationState::Result { .. } => "ok",
                InvocationState::Error { .. } => "failed",
            };
            lines.push(format!("  -> {}({}) {status}", inv.tool_name, inv.args));
        }
    }
    lines
}
