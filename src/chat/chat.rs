use std::io::{stdout, Write};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context};
use colored::*;
use futures::StreamExt;
use rustyline::DefaultEditor;
use tracing::{info, warn};

use llamabridge::config::Settings;
use llamabridge::session::stream::{generate_stream, StreamEvent};
use llamabridge::{ChatMessage, ChatTemplate, InferenceSession, ModelHandle, StopReason};

fn print_help() {
    println!("\n{}", "Chat Commands".cyan());
    println!("{}", "=".repeat(40).bright_cyan());
    println!("{}  - Clear the conversation and the session cache", "/reset".green());
    println!("{}   - Show this help message", "/help".green());
    println!("{}   - Exit the chat", "/quit".green());
    println!();
}

fn clear_session(session: &Mutex<InferenceSession>) -> anyhow::Result<()> {
    session.lock().map_err(|e| anyhow!("session lock poisoned: {}", e))?.clear();
    Ok(())
}

/// Interactive loop. The whole conversation is re-evaluated each turn from a
/// cleared cache, so earlier turns never need to fit alongside stale state.
pub async fn chat_loop(settings: &Settings, model: &ModelHandle) -> anyhow::Result<()> {
    let session = InferenceSession::create_with(model, &settings.session_config())
        .context("Failed to create inference session")?;
    let session = Arc::new(Mutex::new(session));
    let template = ChatTemplate::default();
    let params = settings.generation_params();
    let mut messages: Vec<ChatMessage> = Vec::new();

    print_help();
    let mut rl = DefaultEditor::new()?;

    loop {
        let input = match rl.readline("[you] > ") {
            Ok(line) => line,
            Err(_) => {
                println!("Goodbye!");
                break;
            }
        };
        let input = input.trim();
        if input.is_empty() {
            continue;
        }
        let _ = rl.add_history_entry(input);

        match input {
            "/quit" | "/exit" => {
                println!("Goodbye!");
                break;
            }
            "/help" => {
                print_help();
                continue;
            }
            "/reset" => {
                messages.clear();
                clear_session(&session)?;
                info!("Conversation reset");
                println!("{}", "Conversation cleared.".yellow());
                continue;
            }
            _ => {}
        }

        messages.push(ChatMessage::user(input));
        let prompt = template.format(&messages, &settings.generation.system_prompt);
        clear_session(&session)?;

        print!("\n{} ", "[assistant]".bold().yellow());
        stdout().flush()?;

        let mut reply = String::new();
        let mut failed = false;
        let mut events = Box::pin(generate_stream(session.clone(), prompt, params.clone()));
        while let Some(event) = events.next().await {
            match event {
                Ok(StreamEvent::Piece(piece)) => {
                    reply.push_str(&piece);
                    print!("{}", piece.bright_cyan());
                    stdout().flush()?;
                }
                Ok(StreamEvent::Done(generation)) => {
                    if generation.stop_reason == StopReason::ContextFull {
                        println!("\n{}", "[context full, use /reset to start over]".yellow());
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Generation failed");
                    println!("\n{} {}", "Error:".red().bold(), e);
                    failed = true;
                }
            }
        }
        println!("\n");

        if failed {
            messages.pop();
        } else {
            messages.push(ChatMessage::assistant(template.clean_response(&reply)));
        }
    }
    Ok(())
}
