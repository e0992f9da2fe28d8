//! Channel session controller.
//!
//! Decides what to do with each inbound message or command, runs the model
//! call for prompts and turns the result into transport-sized messages. The
//! controller knows nothing about Discord; it talks to a `Transport` bound to
//! the channel the event came from.

mod commands;

pub use commands::{help_text, Command};

use crate::gemini::{ContentGenerator, GeminiError, GenerationRequest};
use crate::images::ImageStore;
use crate::logging::ellipse;
use crate::session::{
    ActivateOutcome, ChannelKey, ClearOutcome, DeactivateOutcome, SessionStore, SystemPromptOutcome, Turn,
};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

/// Discord's single-message limit, in characters.
pub const MAX_MESSAGE_CHARS: usize = 2000;

/// Discord drops the typing indicator after ~10s.
const TYPING_REFRESH: Duration = Duration::from_secs(8);

const NO_CONTENT: &str = "No content was generated. Try rephrasing your prompt.";
const IMAGE_ONLY_CAPTION: &str = "Here's what I generated:";

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to send message: {0}")]
    Send(String),

    #[error("failed to read attachment {path}: {reason}")]
    Attachment { path: String, reason: String },

    #[error("request failed: {0}")]
    Http(String),
}

/// One outbound chat message: text plus files to upload with it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutboundMessage {
    pub content: String,
    pub attachments: Vec<PathBuf>,
}

impl OutboundMessage {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            attachments: Vec::new(),
        }
    }
}

/// The chat side of one inbound event (a channel, or a slash-command interaction).
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, message: OutboundMessage) -> Result<(), TransportError>;

    async fn broadcast_typing(&self) -> Result<(), TransportError>;

    /// Whether the author may change channel configuration.
    async fn author_can_manage(&self) -> bool;

    /// Display names of the guild's members; `None` outside a guild.
    async fn member_names(&self) -> Result<Option<Vec<String>>, TransportError>;
}

/// A plain (non-slash) chat message.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub channel: ChannelKey,
    pub author: String,
    pub content: String,
    pub image_url: Option<String>,
}

/// Split into consecutive chunks of at most `max` chars. Never splits a char.
pub fn chunk_text(text: &str, max: usize) -> Vec<String> {
    let max = max.max(1);
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut count = 0;
    for c in text.chars() {
        if count == max {
            chunks.push(std::mem::take(&mut current));
            count = 0;
        }
        current.push(c);
        count += 1;
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Lay a reply out as messages: text chunks with every image on the first one,
/// a caption when there are only images, a notice when there is nothing.
pub fn format_reply(text: &str, attachments: &[PathBuf]) -> Vec<OutboundMessage> {
    if text.trim().is_empty() {
        if attachments.is_empty() {
            return vec![OutboundMessage::text(NO_CONTENT)];
        }
        return vec![OutboundMessage {
            content: IMAGE_ONLY_CAPTION.to_string(),
            attachments: attachments.to_vec(),
        }];
    }
    chunk_text(text, MAX_MESSAGE_CHARS)
        .into_iter()
        .enumerate()
        .map(|(i, content)| OutboundMessage {
            content,
            attachments: if i == 0 { attachments.to_vec() } else { Vec::new() },
        })
        .collect()
}

/// User-facing sentence for a failed generation.
pub fn error_reply(err: &GeminiError) -> String {
    match err {
        GeminiError::Timeout(d) => format!(
            "Sorry, the AI took longer than {}s to answer. Please try again.",
            d.as_secs()
        ),
        GeminiError::Network(_) => "Sorry, I couldn't reach the AI service. Please try again in a moment.".to_string(),
        GeminiError::Api { status, message } => {
            format!("Sorry, the AI service returned an error ({}): {}", status, ellipse(message, 300))
        }
        GeminiError::Blocked(reason) => format!("The AI provider refused this prompt ({}).", reason),
        GeminiError::Decode(_) => "Sorry, I couldn't understand the AI service's response.".to_string(),
    }
}

/// Keep the typing indicator alive until the returned guard is dropped.
fn spawn_typing(transport: Arc<dyn Transport>) -> DropGuard {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        loop {
            if let Err(e) = transport.broadcast_typing().await {
                debug!("Discord: typing indicator failed: {}", e);
            }
            tokio::select! {
                _ = tokio::time::sleep(TYPING_REFRESH) => {}
                _ = token.cancelled() => break,
            }
        }
    });
    cancel.drop_guard()
}

pub struct SessionController {
    store: Arc<SessionStore>,
    generator: Arc<dyn ContentGenerator>,
    images: Arc<ImageStore>,
    prefix: String,
    default_system_prompt: String,
}

impl SessionController {
    pub fn new(
        store: Arc<SessionStore>,
        generator: Arc<dyn ContentGenerator>,
        images: Arc<ImageStore>,
        prefix: impl Into<String>,
        default_system_prompt: impl Into<String>,
    ) -> Self {
        Self {
            store,
            generator,
            images,
            prefix: prefix.into(),
            default_system_prompt: default_system_prompt.into(),
        }
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    /// Route a plain message: explicit command, implicit prompt in an active
    /// channel, or nothing.
    pub async fn handle_message(&self, transport: Arc<dyn Transport>, msg: InboundMessage) {
        let content = msg.content.trim();
        if let Some(command) = Command::parse(&self.prefix, content) {
            info!("Discord: {} ran {}{} in channel {}", msg.author, self.prefix, command.name(), msg.channel);
            self.execute(transport, msg.channel, command, msg.image_url).await;
            return;
        }
        if content.starts_with(self.prefix.as_str()) {
            debug!("Discord: ignoring unknown command {:?}", ellipse(content, 40));
            return;
        }
        if !self.store.is_active(msg.channel) {
            return;
        }
        if content.is_empty() {
            debug!("Discord: ignoring empty message in active channel {}", msg.channel);
            return;
        }
        info!(
            "Discord: prompt from {} in active channel {}: {}",
            msg.author,
            msg.channel,
            ellipse(content, 200)
        );
        self.respond(transport, msg.channel, content.to_string(), msg.image_url).await;
    }

    /// Run one command. User errors are answered in chat, never escalated.
    pub async fn execute(
        &self,
        transport: Arc<dyn Transport>,
        channel: ChannelKey,
        command: Command,
        image_url: Option<String>,
    ) {
        if command.requires_manage() && !transport.author_can_manage().await {
            self.say(&*transport, "You need the **Manage Channels** permission to use this command.")
                .await;
            return;
        }

        let p = self.prefix.as_str();
        match command {
            Command::Ask(prompt) => {
                if prompt.is_empty() {
                    self.say(&*transport, &format!("Please provide a question. Usage: `{p}ask <question>`"))
                        .await;
                    return;
                }
                self.respond(transport, channel, prompt, image_url).await;
            }
            Command::Activate(prompt) => {
                let reply = match self.store.activate(channel, prompt) {
                    ActivateOutcome::Activated => "Jarvis is now active in this channel!",
                    ActivateOutcome::AlreadyActive => "Jarvis is already active in this channel.",
                };
                self.say(&*transport, reply).await;
            }
            Command::Deactivate => {
                // Waits out an in-flight reply so its turns cannot outlive the session.
                let turn_lock = self.store.turn_lock(channel);
                let _turn = turn_lock.lock().await;
                let reply = match self.store.deactivate(channel) {
                    DeactivateOutcome::Deactivated => "Jarvis has been deactivated in this channel.",
                    DeactivateOutcome::NotActive => "Jarvis is not active in this channel.",
                };
                self.say(&*transport, reply).await;
            }
            Command::Sys(prompt) => {
                if prompt.is_empty() {
                    self.say(&*transport, &format!("Please provide a prompt. Usage: `{p}sys <new prompt>`"))
                        .await;
                    return;
                }
                let reply = match self.store.set_system_prompt(channel, prompt.clone()) {
                    SystemPromptOutcome::Updated => format!("System prompt updated to: {}", prompt),
                    SystemPromptOutcome::NotActive => {
                        format!("Bot is not activated in this channel. Use `{p}activate` first.")
                    }
                };
                self.say(&*transport, &reply).await;
            }
            Command::Clear => {
                let turn_lock = self.store.turn_lock(channel);
                let _turn = turn_lock.lock().await;
                let reply = match self.store.clear_history(channel) {
                    ClearOutcome::Cleared(_) => "Chat session history has been cleared.",
                    ClearOutcome::NothingToClear => "There is nothing to clear in this channel.",
                };
                self.say(&*transport, reply).await;
            }
            Command::Guide => {
                self.say(&*transport, &help_text(p)).await;
            }
            Command::ListMembers => match transport.member_names().await {
                Ok(Some(names)) => {
                    self.say(&*transport, &format!("Server members: {}", names.join(", "))).await;
                }
                Ok(None) => self.say(&*transport, "This command only works in a server.").await,
                Err(e) => {
                    warn!("Discord: listing members failed: {}", e);
                    self.say(&*transport, "Sorry, I couldn't fetch the member list.").await;
                }
            },
        }
    }

    /// Send text, chunked to the message limit. Send failures are logged.
    async fn say(&self, transport: &dyn Transport, text: &str) {
        for chunk in chunk_text(text, MAX_MESSAGE_CHARS) {
            if let Err(e) = transport.send(OutboundMessage::text(chunk)).await {
                warn!("Discord: {}", e);
                return;
            }
        }
    }

    /// One prompt/reply cycle: typing, generate, reply, record turns, clean up.
    async fn respond(&self, transport: Arc<dyn Transport>, channel: ChannelKey, prompt: String, image_url: Option<String>) {
        let turn_lock = self.store.turn_lock(channel);
        let _turn = turn_lock.lock().await;

        let typing = spawn_typing(transport.clone());
        let session = self.store.snapshot(channel).unwrap_or_default();
        let request = GenerationRequest {
            prompt: prompt.clone(),
            image_url: image_url.clone(),
            history: session.history,
            system_prompt: Some(
                session
                    .system_prompt
                    .unwrap_or_else(|| self.default_system_prompt.clone()),
            ),
        };
        let result = self.generator.generate(request).await;
        drop(typing);

        let result = match result {
            Ok(r) => r,
            Err(e) => {
                warn!("Gemini: generation failed for channel {}: {}", channel, e);
                self.say(&*transport, &error_reply(&e)).await;
                return;
            }
        };

        if result.is_empty() {
            self.say(&*transport, NO_CONTENT).await;
            return;
        }

        let mut paths: Vec<PathBuf> = Vec::with_capacity(result.images.len());
        for img in result.images {
            let images = self.images.clone();
            match tokio::task::spawn_blocking(move || images.persist(&img.mime_type, img.payload)).await {
                Ok(Some(path)) => paths.push(path),
                Ok(None) => {}
                Err(e) => warn!("Images: decode task failed: {}", e),
            }
        }
        let has_text = !result.text.trim().is_empty();

        let mut delivered = false;
        for message in format_reply(&result.text, &paths) {
            match transport.send(message).await {
                Ok(()) => delivered = true,
                Err(e) => {
                    warn!("Discord: {}", e);
                    break;
                }
            }
        }

        if delivered && (has_text || !paths.is_empty()) {
            let model_turn = if has_text {
                result.text
            } else {
                format!("[generated {} image(s)]", paths.len())
            };
            self.store.append_turn(channel, Turn::user(prompt, image_url));
            self.store.append_turn(channel, Turn::model(model_turn));
        }

        self.images.remove_all(&paths);
    }
}
