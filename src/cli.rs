//! CLI interface for the chat client
//!
//! Provides command parsing, output formatting and the interactive loop that
//! multiplexes stdin with incoming messages.

use std::collections::HashSet;
use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use crate::error::{ChatError, Result};
use crate::facade::ChatFacade;
use crate::models::{ChatId, ChatMessage, Conversation, MessageId};
use crate::store::DocumentStore;

/// A line typed by the user
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Switch the current conversation.
    Peer(String),
    List,
    Unread,
    /// Mark the current conversation as read.
    Read,
    Quit,
    Help,
    Message(String),
}

impl Command {
    pub fn parse(input: &str) -> std::result::Result<Command, String> {
        let input = input.trim();
        if !input.starts_with('/') {
            return Ok(Command::Message(input.to_string()));
        }

        let mut parts = input.splitn(2, char::is_whitespace);
        let name = parts.next().unwrap_or_default();
        let arg = parts.next().map(str::trim).unwrap_or_default();
        match name {
            "/peer" if !arg.is_empty() => Ok(Command::Peer(arg.to_string())),
            "/peer" => Err("usage: /peer <user id>".to_string()),
            "/list" => Ok(Command::List),
            "/unread" => Ok(Command::Unread),
            "/read" => Ok(Command::Read),
            "/quit" | "/exit" => Ok(Command::Quit),
            "/help" => Ok(Command::Help),
            other => Err(format!("unknown command: {}", other)),
        }
    }
}

/// Parse a command from user input
pub fn parse_command(input: &str) -> Result<Command> {
    Command::parse(input).map_err(ChatError::InvalidMessage)
}

/// Format a message for display
pub fn format_message(chat_id: &ChatId, message: &ChatMessage) -> String {
    format!("#{} <{}> {}", chat_id, message.sender_id, message.content)
}

/// Format one conversation list row from `user_id`'s point of view
pub fn format_conversation(conversation: &Conversation, user_id: &str) -> String {
    let peer = conversation.peer_of(user_id).unwrap_or(user_id);
    let preview = conversation.last_message.as_deref().unwrap_or("(no messages)");
    if conversation.unread_count > 0 {
        format!("{} [{} unread] {}", peer, conversation.unread_count, preview)
    } else {
        format!("{} {}", peer, preview)
    }
}

pub const HELP: &str = "/peer <id>  switch conversation\n\
/list       list conversations\n\
/unread     show unread counters\n\
/read       mark the current conversation as read\n\
/quit       leave";

/// Async stdin reader that yields one line at a time
///
/// Prints the prompt and flushes stdout before waiting for input.
///
/// # Returns
/// - `Ok(Some(line))` - User entered a line
/// - `Ok(None)` - EOF reached (Ctrl+D)
/// - `Err(e)` - I/O error
pub async fn read_line_async(reader: &mut BufReader<tokio::io::Stdin>) -> Result<Option<String>> {
    print!("> ");
    std::io::stdout().flush()?;

    let mut line = String::new();
    match reader.read_line(&mut line).await {
        Ok(0) => Ok(None),
        Ok(_) => {
            if line.ends_with('\n') {
                line.pop();
                if line.ends_with('\r') {
                    line.pop();
                }
            }
            Ok(Some(line))
        }
        Err(e) => Err(e.into()),
    }
}

/// Interactive loop: stdin commands on one side, the bound conversation's
/// message sequence on the other. Confirmed messages are written to `cache`.
pub async fn run_session(
    facade: &ChatFacade,
    cache: Arc<dyn DocumentStore>,
    user_id: &str,
    mut peer: Option<String>,
) -> Result<()> {
    // stdin gets its own task: a pending read_line must not be cancelled
    let (line_tx, mut lines) = mpsc::unbounded_channel::<String>();
    tokio::spawn(async move {
        let mut stdin = BufReader::new(tokio::io::stdin());
        loop {
            match read_line_async(&mut stdin).await {
                Ok(Some(line)) => {
                    if line_tx.send(line).is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    log::error!("Failed to read stdin: {}", e);
                    break;
                }
            }
        }
    });

    let mut changes = facade.message_changes();
    let mut shown: HashSet<MessageId> = HashSet::new();

    loop {
        tokio::select! {
            changed = changes.changed() => {
                if changed.is_err() {
                    break;
                }
                let messages = changes.borrow_and_update().clone();
                for message in messages.iter().filter(|m| m.is_confirmed()) {
                    if shown.insert(message.message_id().clone()) {
                        if let Err(e) = cache.record_message(message) {
                            log::warn!("Failed to cache message: {}", e);
                        }
                        if message.sender_id != user_id {
                            println!("\r{}", format_message(&message.chat_id(), message));
                        }
                    }
                }
            }
            line = lines.recv() => {
                let Some(line) = line else {
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                let command = match parse_command(&line) {
                    Ok(command) => command,
                    Err(e) => {
                        println!("{}", e);
                        continue;
                    }
                };
                match command {
                    Command::Quit => break,
                    Command::Help => println!("{}", HELP),
                    Command::Peer(id) => {
                        let chat_id = facade.open_conversation(&id)?;
                        shown.clear();
                        println!("Now chatting in #{}", chat_id);
                        peer = Some(id);
                    }
                    Command::List => {
                        let conversations = facade.conversations();
                        if conversations.is_empty() {
                            println!("No conversations yet");
                        }
                        for conversation in conversations {
                            println!("{}", format_conversation(&conversation, user_id));
                        }
                    }
                    Command::Unread => {
                        println!("{} unread", facade.unread_count());
                        for (chat_id, count) in facade.unread_by_conversation() {
                            println!("  #{}: {}", chat_id, count);
                        }
                    }
                    Command::Read => match &peer {
                        Some(id) => {
                            let flipped = cache.mark_conversation_read(user_id, &ChatId::between(user_id, id))?;
                            println!("Marked {} message(s) as read", flipped);
                        }
                        None => println!("No conversation selected; use /peer <id>"),
                    },
                    Command::Message(text) => match &peer {
                        Some(id) => {
                            if let Err(e) = facade.send_message(id, &text).await {
                                println!("Send failed: {}", e);
                            }
                        }
                        None => println!("No conversation selected; use /peer <id>"),
                    },
                }
            }
        }
    }
    Ok(())
}
