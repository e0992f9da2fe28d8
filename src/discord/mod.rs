//! Discord Gateway integration.
//!
//! Connects as a bot, registers the slash commands and hands every message
//! and command interaction to the `SessionController`. The two `Transport`
//! implementations here are the only code that talks to the Discord REST API.
//! The token is never logged.

use crate::controller::{Command, InboundMessage, OutboundMessage, SessionController, Transport, TransportError};
use crate::session::ChannelKey;
use async_trait::async_trait;
use serenity::all::{
    ChannelId, Command as SlashCommand, CommandInteraction, CommandOptionType, CreateAttachment, CreateCommand,
    CreateCommandOption, CreateInteractionResponse, CreateInteractionResponseFollowup,
    CreateInteractionResponseMessage, CreateMessage, GuildId, Http, Interaction, Permissions, ResolvedValue, UserId,
};
use serenity::client::{Client, Context, EventHandler};
use serenity::gateway::ShardManager;
use serenity::model::channel::{Attachment, Message};
use serenity::model::gateway::{GatewayIntents, Ready};
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use tracing::{debug, error, info, warn};

/// Shared shard manager for graceful disconnect on shutdown (bot appears offline).
static DISCORD_SHARD_MANAGER: OnceLock<Arc<ShardManager>> = OnceLock::new();

/// Bot user id (set on Ready, used to ignore our own messages).
static BOT_USER_ID: OnceLock<UserId> = OnceLock::new();

/// Upper bound for one member listing request.
const MEMBER_PAGE_LIMIT: u64 = 1000;

struct Handler {
    controller: Arc<SessionController>,
    guild_id: Option<GuildId>,
}

/// Slash command definitions. Configuration commands default to Manage Channels.
fn slash_commands() -> Vec<CreateCommand> {
    let manage = Permissions::MANAGE_CHANNELS;
    vec![
        CreateCommand::new("ask")
            .description("Ask the AI a question")
            .add_option(
                CreateCommandOption::new(CommandOptionType::String, "prompt", "Your question").required(true),
            )
            .add_option(
                CreateCommandOption::new(CommandOptionType::Attachment, "image", "Optional image to ask about")
                    .required(false),
            ),
        CreateCommand::new("activate")
            .description("Answer every message in this channel")
            .default_member_permissions(manage)
            .add_option(
                CreateCommandOption::new(CommandOptionType::String, "prompt", "Optional system prompt")
                    .required(false),
            ),
        CreateCommand::new("deactivate")
            .description("Stop answering every message in this channel")
            .default_member_permissions(manage),
        CreateCommand::new("sys")
            .description("Change the system prompt for this channel")
            .default_member_permissions(manage)
            .add_option(
                CreateCommandOption::new(CommandOptionType::String, "prompt", "New system prompt").required(true),
            ),
        CreateCommand::new("clear").description("Clear the conversation history for this channel"),
        CreateCommand::new("guide").description("Show the bot commands"),
        CreateCommand::new("list_members").description("List the members of this server"),
    ]
}

/// URL of the first image attachment, by content type or file extension.
fn first_image_url(attachments: &[Attachment]) -> Option<String> {
    attachments.iter().find(|a| is_image_attachment(a)).map(|a| a.url.clone())
}

fn is_image_attachment(a: &Attachment) -> bool {
    if let Some(ct) = &a.content_type {
        return ct.to_ascii_lowercase().starts_with("image/");
    }
    let name = a.filename.to_ascii_lowercase();
    [".png", ".jpg", ".jpeg", ".webp", ".gif"].iter().any(|ext| name.ends_with(ext))
}

/// Argument text and image URL from a slash command's options.
fn interaction_arguments(command: &CommandInteraction) -> (String, Option<String>) {
    let mut arg = String::new();
    let mut image_url = None;
    for option in command.data.options() {
        match option.value {
            ResolvedValue::String(s) if option.name == "prompt" => arg = s.to_string(),
            ResolvedValue::Attachment(a) if option.name == "image" => image_url = Some(a.url.clone()),
            _ => {}
        }
    }
    (arg, image_url)
}

async fn load_attachments(paths: &[PathBuf]) -> Result<Vec<CreateAttachment>, TransportError> {
    let mut files = Vec::with_capacity(paths.len());
    for path in paths {
        let file = CreateAttachment::path(path).await.map_err(|e| TransportError::Attachment {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        files.push(file);
    }
    Ok(files)
}

async fn guild_member_names(http: &Http, guild_id: GuildId) -> Result<Vec<String>, TransportError> {
    let members = guild_id
        .members(http, Some(MEMBER_PAGE_LIMIT), None)
        .await
        .map_err(|e| TransportError::Http(e.to_string()))?;
    Ok(members.iter().map(|m| m.display_name().to_string()).collect())
}

/// Whether `user` has Manage Channels in `channel`. Lookup failures deny.
async fn user_can_manage(http: &Arc<Http>, guild_id: GuildId, channel_id: ChannelId, user: UserId) -> bool {
    let member = match guild_id.member(http, user).await {
        Ok(m) => m,
        Err(e) => {
            warn!("Discord: could not fetch member {} for permission check: {}", user, e);
            return false;
        }
    };
    let guild = match guild_id.to_partial_guild(http).await {
        Ok(g) => g,
        Err(e) => {
            warn!("Discord: could not fetch guild {} for permission check: {}", guild_id, e);
            return false;
        }
    };
    let channel = match channel_id.to_channel(http).await.map(|c| c.guild()) {
        Ok(Some(c)) => c,
        Ok(None) => return false,
        Err(e) => {
            warn!("Discord: could not fetch channel {} for permission check: {}", channel_id, e);
            return false;
        }
    };
    guild.user_permissions_in(&channel, &member).manage_channels()
}

/// Replies go to the channel a prefix message came from.
struct ChannelTransport {
    http: Arc<Http>,
    channel_id: ChannelId,
    guild_id: Option<GuildId>,
    author: UserId,
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, message: OutboundMessage) -> Result<(), TransportError> {
        let files = load_attachments(&message.attachments).await?;
        let builder = CreateMessage::new().content(message.content).add_files(files);
        self.channel_id
            .send_message(&self.http, builder)
            .await
            .map(|_| ())
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn broadcast_typing(&self) -> Result<(), TransportError> {
        self.channel_id
            .broadcast_typing(&self.http)
            .await
            .map_err(|e| TransportError::Http(e.to_string()))
    }

    async fn author_can_manage(&self) -> bool {
        match self.guild_id {
            Some(guild_id) => user_can_manage(&self.http, guild_id, self.channel_id, self.author).await,
            None => true,
        }
    }

    async fn member_names(&self) -> Result<Option<Vec<String>>, TransportError> {
        match self.guild_id {
            Some(guild_id) => guild_member_names(&self.http, guild_id).await.map(Some),
            None => Ok(None),
        }
    }
}

/// Replies to a deferred slash command go out as follow-ups.
struct InteractionTransport {
    http: Arc<Http>,
    command: CommandInteraction,
}

#[async_trait]
impl Transport for InteractionTransport {
    async fn send(&self, message: OutboundMessage) -> Result<(), TransportError> {
        let files = load_attachments(&message.attachments).await?;
        let builder = CreateInteractionResponseFollowup::new()
            .content(message.content)
            .add_files(files);
        self.command
            .create_followup(&self.http, builder)
            .await
            .map(|_| ())
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn broadcast_typing(&self) -> Result<(), TransportError> {
        self.command
            .channel_id
            .broadcast_typing(&self.http)
            .await
            .map_err(|e| TransportError::Http(e.to_string()))
    }

    async fn author_can_manage(&self) -> bool {
        if self.command.guild_id.is_none() {
            return true;
        }
        // Interaction payloads carry the invoker's resolved permissions for this channel.
        self.command
            .member
            .as_ref()
            .and_then(|m| m.permissions)
            .is_some_and(|p| p.manage_channels())
    }

    async fn member_names(&self) -> Result<Option<Vec<String>>, TransportError> {
        match self.command.guild_id {
            Some(guild_id) => guild_member_names(&self.http, guild_id).await.map(Some),
            None => Ok(None),
        }
    }
}

#[serenity::async_trait]
impl EventHandler for Handler {
    async fn ready(&self, ctx: Context, data_about_bot: Ready) {
        let id = data_about_bot.user.id;
        let _ = BOT_USER_ID.set(id);
        info!("Discord: Bot connected as {} (id: {})", data_about_bot.user.name, id);

        let commands = slash_commands();
        let n = commands.len();
        match self.guild_id {
            Some(guild_id) => match guild_id.set_commands(&ctx.http, commands).await {
                Ok(_) => info!("Discord: Registered {} slash commands in guild {}", n, guild_id),
                Err(e) => warn!("Discord: Failed to register guild slash commands: {}", e),
            },
            None => match SlashCommand::set_global_commands(&ctx.http, commands).await {
                Ok(_) => info!("Discord: Registered {} global slash commands", n),
                Err(e) => warn!("Discord: Failed to register global slash commands: {}", e),
            },
        }
    }

    async fn message(&self, ctx: Context, new_message: Message) {
        if new_message.author.bot {
            return;
        }
        if BOT_USER_ID.get().is_some_and(|id| *id == new_message.author.id) {
            return;
        }

        let inbound = InboundMessage {
            channel: ChannelKey(new_message.channel_id.get()),
            author: new_message.author.name.clone(),
            content: new_message.content.clone(),
            image_url: first_image_url(&new_message.attachments),
        };
        let transport: Arc<dyn Transport> = Arc::new(ChannelTransport {
            http: ctx.http.clone(),
            channel_id: new_message.channel_id,
            guild_id: new_message.guild_id,
            author: new_message.author.id,
        });
        self.controller.handle_message(transport, inbound).await;
    }

    async fn interaction_create(&self, ctx: Context, interaction: Interaction) {
        let Interaction::Command(command) = interaction else {
            return;
        };
        info!(
            "Discord: /{} from {} (channel {})",
            command.data.name, command.user.name, command.channel_id
        );

        let (arg, image_url) = interaction_arguments(&command);
        let Some(parsed) = Command::from_name(&command.data.name, &arg) else {
            debug!("Discord: ignoring unknown slash command /{}", command.data.name);
            return;
        };

        if let Err(e) = command
            .create_response(
                &ctx.http,
                CreateInteractionResponse::Defer(CreateInteractionResponseMessage::new()),
            )
            .await
        {
            error!("Discord: Failed to defer /{}: {}", command.data.name, e);
            return;
        }

        let channel = ChannelKey(command.channel_id.get());
        let transport: Arc<dyn Transport> = Arc::new(InteractionTransport {
            http: ctx.http.clone(),
            command,
        });
        self.controller.execute(transport, channel, parsed, image_url).await;
    }
}

/// Run the Discord client until the gateway stops.
/// With `guild_id` set, slash commands are registered in that guild only.
pub async fn run_discord_client(
    token: String,
    controller: Arc<SessionController>,
    guild_id: Option<u64>,
) -> anyhow::Result<()> {
    if token.trim().is_empty() {
        anyhow::bail!("Discord token is empty");
    }

    info!("Discord: Connecting to Discord Gateway (discord.com)…");

    let intents = GatewayIntents::GUILDS
        | GatewayIntents::GUILD_MESSAGES
        | GatewayIntents::DIRECT_MESSAGES
        | GatewayIntents::MESSAGE_CONTENT
        | GatewayIntents::GUILD_MEMBERS;

    let handler = Handler {
        controller,
        guild_id: guild_id.map(GuildId::new),
    };
    let mut client = Client::builder(&token, intents)
        .event_handler(handler)
        .await
        .map_err(|e| anyhow::anyhow!("Discord client build failed: {}", e))?;

    // Stored so disconnect_discord() can shut the gateway down on exit.
    let _ = DISCORD_SHARD_MANAGER.set(client.shard_manager.clone());

    info!("Discord: Gateway client built, starting connection…");
    client
        .start()
        .await
        .map_err(|e| anyhow::anyhow!("Discord gateway error: {}", e))?;
    Ok(())
}

/// Disconnect from Discord so the bot appears offline.
/// Safe to call even if the gateway was never started.
pub async fn disconnect_discord() {
    let Some(manager) = DISCORD_SHARD_MANAGER.get() else {
        debug!("Discord: No shard manager (gateway was not started), skipping disconnect");
        return;
    };
    info!("Discord: Logging off (shutting down gateway)…");
    manager.shutdown_all().await;
    info!("Discord: Gateway shut down");
}
