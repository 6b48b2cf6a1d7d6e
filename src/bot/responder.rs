// src/bot/responder.rs - Outbound side: chat lines, media playback, shout-outs

use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::config::BotConfig;
use crate::overlay::OverlayServer;
use crate::types::TextOrList;

/// Shout-outs wait this long so the greeting lands in chat first.
pub const SHOUTOUT_DELAY: Duration = Duration::from_millis(5000);

/// Everything the bot says or plays goes through here. Chat lines are
/// queued on the outbound channel; audio goes to the overlay when one is
/// configured, otherwise to an external player command.
#[derive(Clone)]
pub struct Responder {
    outbound: mpsc::Sender<(String, String)>,
    overlay: Option<Arc<OverlayServer>>,
}

/// Expand `USERNAME` and `_1_`..`_9_` placeholders in one left-to-right
/// pass. Capture indexes above the first missing one are left untouched,
/// and substituted text is never rescanned, so a capture containing a
/// placeholder cannot expand again.
pub fn substitute(template: &str, username: Option<&str>, captures: Option<&[String]>) -> String {
    let empty: &[String] = &[];
    let captures = captures.unwrap_or(empty);
    // Highest contiguous index that resolved; 0 when captures are absent.
    let limit = captures.len().saturating_sub(1).min(9);

    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while !rest.is_empty() {
        if let Some(after) = rest.strip_prefix("USERNAME") {
            match username {
                Some(name) => out.push_str(name),
                None => out.push_str("USERNAME"),
            }
            rest = after;
            continue;
        }
        if let Some(after) = rest.strip_prefix('_') {
            let mut chars = after.chars();
            if let (Some(digit @ '1'..='9'), Some('_')) = (chars.next(), chars.clone().next()) {
                chars.next();
                let idx = digit as usize - '0' as usize;
                if idx <= limit {
                    out.push_str(&captures[idx]);
                    rest = chars.as_str();
                    continue;
                }
            }
        }
        let mut chars = rest.chars();
        if let Some(c) = chars.next() {
            out.push(c);
        }
        rest = chars.as_str();
    }
    out
}

impl Responder {
    pub fn new(
        outbound: mpsc::Sender<(String, String)>,
        overlay: Option<Arc<OverlayServer>>,
    ) -> Self {
        Self { outbound, overlay }
    }

    /// Pick a variant, expand placeholders and queue the line. An empty
    /// target channel or an empty variant list is a silent no-op.
    pub async fn send_chat(
        &self,
        target: &str,
        username: Option<&str>,
        text: &TextOrList,
        captures: Option<&[String]>,
    ) {
        let Some(template) = text.choose() else {
            return;
        };
        self.send_line(target, &substitute(template, username, captures))
            .await;
    }

    pub async fn send_line(&self, target: &str, line: &str) {
        if target.is_empty() || line.is_empty() {
            return;
        }
        if let Err(e) = self.outbound.send((target.to_string(), line.to_string())).await {
            error!("outbound channel closed, dropping line: {e}");
        }
    }

    /// Play a media file. The overlay audio route wins when configured;
    /// otherwise the external player command runs fire-and-forget.
    pub fn play_media(
        &self,
        config: &BotConfig,
        username: Option<&str>,
        media: &TextOrList,
        captures: Option<&[String]>,
    ) {
        let Some(template) = media.choose() else {
            return;
        };
        let file = substitute(template, username, captures);

        if let (Some(overlay), Some(cfg)) = (&self.overlay, &config.overlay) {
            if cfg.audio_file_path.is_some() {
                let name = audio_base_name(&file);
                debug!("routing '{name}' to overlay audio");
                overlay.publish("play_audio", serde_json::json!(name));
                return;
            }
        }

        if let Some(command) = &config.media_player_command {
            let command = substitute(&command.replace("MEDIAFILE", &file), username, None);
            info!("playing media: {command}");
            tokio::spawn(async move {
                match tokio::process::Command::new("sh")
                    .arg("-c")
                    .arg(&command)
                    .output()
                    .await
                {
                    Ok(output) if !output.status.success() => {
                        warn!(
                            "media player exited with {}: {}",
                            output.status,
                            String::from_utf8_lossy(&output.stderr).trim()
                        );
                    }
                    Ok(_) => {}
                    Err(e) => error!("failed to run media player: {e}"),
                }
            });
            return;
        }

        error!("media '{file}' requested but no overlay audio path or player command configured");
    }

    /// Queue `!so <username>` (or whatever command is configured) after a
    /// short delay, so it reads as a follow-up to the greeting.
    pub fn shout_out(
        &self,
        target: &str,
        username: &str,
        command: &str,
        captures: Option<Vec<String>>,
    ) {
        let responder = self.clone();
        let target = target.to_string();
        let username = username.to_string();
        let command = command.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(SHOUTOUT_DELAY).await;
            let line = substitute(&command, Some(&username), captures.as_deref());
            responder.send_line(&target, &line).await;
        });
    }
}

/// Reduce a media path to a bare file name an overlay page can fetch
/// relative to its own document.
fn audio_base_name(path: &str) -> String {
    path.rsplit(['/', '\\'])
        .next()
        .unwrap_or(path)
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        .collect()
}
