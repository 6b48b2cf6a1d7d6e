use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use std::env;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

use crate::config::BotConfig;
use crate::platforms::PlatformConnection;
use crate::types::ChatMessage;

type WebSocketWriter = Arc<
    RwLock<
        futures_util::stream::SplitSink<
            tokio_tungstenite::WebSocketStream<
                tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
            >,
            Message,
        >,
    >,
>;

/// Connection identity for Twitch IRC.
#[derive(Debug, Clone)]
pub struct TwitchConfig {
    pub username: String,
    pub oauth_token: String, // oauth:your_token_here
    pub channels: Vec<String>,
}

impl TwitchConfig {
    /// Build from the bot configuration, falling back to the
    /// `TWITCH_OAUTH_TOKEN` environment variable for the credential.
    pub fn from_bot_config(config: &BotConfig) -> Result<Self> {
        let oauth_token = if config.oauth_token.is_empty() {
            env::var("TWITCH_OAUTH_TOKEN")
                .context("no oauth_token in config and TWITCH_OAUTH_TOKEN not set")?
        } else {
            config.oauth_token.clone()
        };

        if !oauth_token.starts_with("oauth:") {
            return Err(anyhow::anyhow!("Twitch OAuth token must start with 'oauth:'"));
        }
        if config.channels.is_empty() {
            return Err(anyhow::anyhow!("no channels configured"));
        }

        Ok(Self {
            username: config.bot_name.clone(),
            oauth_token,
            channels: config.channels.clone(),
        })
    }
}

/// Twitch IRC over WebSocket.
pub struct TwitchConnection {
    config: TwitchConfig,
    message_sender: Option<broadcast::Sender<ChatMessage>>,
    websocket_writer: Option<WebSocketWriter>,
    is_connected: Arc<RwLock<bool>>,
}

impl TwitchConnection {
    pub fn new(config: TwitchConfig) -> Self {
        Self {
            config,
            message_sender: None,
            websocket_writer: None,
            is_connected: Arc::new(RwLock::new(false)),
        }
    }
}

/// Parse one WebSocket frame, which may carry several IRC lines.
fn parse_frame(raw: &str) -> Vec<ChatMessage> {
    raw.split('\n')
        .map(str::trim)
        .filter(|line| line.starts_with('@') && line.contains("PRIVMSG"))
        .filter_map(parse_privmsg)
        .collect()
}

/// Parse a tagged PRIVMSG line:
/// `@badges=...;mod=...;vip=... :user!user@host PRIVMSG #channel :message`
fn parse_privmsg(line: &str) -> Option<ChatMessage> {
    let rest = line.strip_prefix('@')?;
    let (tags, rest) = rest.split_once(' ')?;
    let rest = rest.strip_prefix(':')?;
    let (prefix, rest) = rest.split_once(" PRIVMSG ")?;
    let (channel, content) = rest.split_once(" :")?;

    let username = prefix.split('!').next().unwrap_or_default().to_string();
    if username.is_empty() {
        debug!("PRIVMSG without a username prefix: {line}");
        return None;
    }

    let mut display_name = None;
    let mut is_mod = false;
    let mut is_vip = false;
    let mut badges: Option<Vec<String>> = None;

    for tag in tags.split(';') {
        let Some((key, value)) = tag.split_once('=') else {
            continue;
        };
        match key {
            "display-name" if !value.is_empty() => display_name = Some(value.to_string()),
            "mod" => is_mod = value == "1",
            "vip" => is_vip = value == "1",
            "badges" => {
                let list: Vec<String> = value
                    .split(',')
                    .filter(|b| !b.is_empty())
                    .filter_map(|b| b.split('/').next())
                    .map(String::from)
                    .collect();
                is_vip = is_vip || list.iter().any(|b| b == "vip");
                badges = Some(list);
            }
            _ => {}
        }
    }

    Some(ChatMessage {
        channel: channel.trim().trim_start_matches('#').to_string(),
        username,
        display_name,
        content: content.trim_end_matches(['\r', '\n']).to_string(),
        timestamp: chrono::Utc::now(),
        user_badges: badges,
        is_mod,
        is_vip,
    })
}

#[async_trait]
impl PlatformConnection for TwitchConnection {
    async fn connect(&mut self) -> Result<()> {
        info!("Connecting to Twitch IRC...");

        let url = Url::parse("wss://irc-ws.chat.twitch.tv:443")
            .context("failed to parse Twitch WebSocket URL")?;
        let (ws_stream, _) = connect_async(url)
            .await
            .context("failed to connect to Twitch WebSocket")?;

        let (write, read) = ws_stream.split();
        let writer = Arc::new(RwLock::new(write));
        self.websocket_writer = Some(Arc::clone(&writer));

        writer
            .write()
            .await
            .send(Message::Text(format!("PASS {}\r\n", self.config.oauth_token)))
            .await
            .context("failed to send PASS command")?;
        writer
            .write()
            .await
            .send(Message::Text(format!("NICK {}\r\n", self.config.username)))
            .await
            .context("failed to send NICK command")?;
        writer
            .write()
            .await
            .send(Message::Text(
                "CAP REQ :twitch.tv/tags twitch.tv/commands\r\n".to_string(),
            ))
            .await
            .context("failed to request capabilities")?;

        for channel in &self.config.channels {
            writer
                .write()
                .await
                .send(Message::Text(format!("JOIN #{channel}\r\n")))
                .await
                .with_context(|| format!("failed to join channel: {channel}"))?;
            info!("Joined channel: #{channel}");
        }

        let (tx, _) = broadcast::channel(1000);
        self.message_sender = Some(tx.clone());
        *self.is_connected.write().await = true;

        let is_connected = Arc::clone(&self.is_connected);
        tokio::spawn(async move {
            let mut read = read;
            info!("Twitch message reader started");

            loop {
                match read.next().await {
                    Some(Ok(Message::Text(text))) => {
                        if text.starts_with("PING") {
                            let pong = text.replace("PING", "PONG");
                            if let Err(e) = writer.write().await.send(Message::Text(pong)).await {
                                error!("failed to send PONG: {e}");
                            }
                            continue;
                        }
                        for chat_msg in parse_frame(&text) {
                            debug!(
                                "parsed message from {}: {}",
                                chat_msg.username, chat_msg.content
                            );
                            if let Err(e) = tx.send(chat_msg) {
                                warn!("failed to broadcast message: {e}");
                            }
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if let Err(e) = writer.write().await.send(Message::Pong(payload)).await {
                            error!("failed to send pong: {e}");
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        info!("WebSocket connection closed: {frame:?}");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        error!("WebSocket error: {e}");
                        break;
                    }
                    None => {
                        warn!("WebSocket stream ended");
                        break;
                    }
                }
            }

            *is_connected.write().await = false;
            warn!("Twitch connection handler exited");
        });

        info!("Connected to Twitch IRC");
        Ok(())
    }

    async fn send_message(&self, channel: &str, message: &str) -> Result<()> {
        let writer = self
            .websocket_writer
            .as_ref()
            .context("not connected to Twitch")?;
        let privmsg = format!("PRIVMSG #{channel} :{message}\r\n");
        writer
            .write()
            .await
            .send(Message::Text(privmsg))
            .await
            .with_context(|| format!("failed to send message to #{channel}"))?;
        debug!("sent message to #{channel}: {message}");
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        *self.is_connected.read().await
    }

    fn get_message_receiver(&self) -> Option<broadcast::Receiver<ChatMessage>> {
        self.message_sender.as_ref().map(|sender| sender.subscribe())
    }

    fn get_channels(&self) -> Vec<String> {
        self.config.channels.clone()
    }

    async fn disconnect(&mut self) -> Result<()> {
        *self.is_connected.write().await = false;
        self.websocket_writer = None;
        self.message_sender = None;
        info!("Disconnected from Twitch");
        Ok(())
    }
}
