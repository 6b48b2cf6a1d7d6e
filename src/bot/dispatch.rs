// src/bot/dispatch.rs - Per-message rule evaluation

use log::{debug, error, info, warn};
use rand::Rng;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::bot::counters::{sanitize_name, CounterStore};
use crate::bot::responder::Responder;
use crate::bot::scheduler::Scheduler;
use crate::bot::seen::{FirstTimeLedger, SeenUsers};
use crate::config::{BotConfig, ConfigManager};
use crate::overlay::OverlayServer;
use crate::types::{ChatMessage, CommandToken};

/// Evaluates every configured rule family against each incoming message.
/// One dispatch works from one config snapshot taken up front, so a reload
/// mid-message can never mix old and new rules.
pub struct Dispatcher {
    config: Arc<ConfigManager>,
    seen: Arc<SeenUsers>,
    ledger: FirstTimeLedger,
    counters: Arc<CounterStore>,
    responder: Responder,
    scheduler: Arc<Scheduler>,
    overlay: Option<Arc<OverlayServer>>,
    shutdown: broadcast::Sender<()>,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<ConfigManager>,
        seen: Arc<SeenUsers>,
        ledger: FirstTimeLedger,
        counters: Arc<CounterStore>,
        responder: Responder,
        scheduler: Arc<Scheduler>,
        overlay: Option<Arc<OverlayServer>>,
        shutdown: broadcast::Sender<()>,
    ) -> Self {
        Self {
            config,
            seen,
            ledger,
            counters,
            responder,
            scheduler,
            overlay,
            shutdown,
        }
    }

    /// Run the full pipeline for one message. Command branches are
    /// exclusive; the scanning families each see every message, so one
    /// line can trip several rules at once.
    pub async fn dispatch(&self, message: &ChatMessage) {
        let config = self.config.snapshot().await;

        if config.is_ignored(&message.username) {
            debug!("ignoring message from '{}'", message.username);
            return;
        }

        let token = CommandToken::parse(&message.content);

        self.run_first_seen(&config, message).await;

        if token.command().starts_with("!!") {
            self.run_admin_command(&config, message, &token).await;
        } else if token.command().starts_with('!') {
            self.run_user_command(&config, message, &token).await;
        }

        self.run_forbidden_scan(&config, message, &token).await;
        self.run_triggered_scan(&config, message, &token).await;
        self.run_random_file_line(&config, message, &token).await;
        self.run_image_link(&config, message, &token).await;
    }

    /// Greet each user the first time they chat this session. The
    /// broadcaster greets themselves far too often while fiddling with
    /// scenes, so they are exempt. Seen and ledger bookkeeping always run;
    /// the `greetings` flag only silences the greeting itself, so toggling
    /// it mid-session never re-greets users who already chatted.
    async fn run_first_seen(&self, config: &BotConfig, message: &ChatMessage) {
        if message.is_broadcaster() {
            return;
        }
        let key = message.name_key();
        if !self.seen.mark_seen(&key).await {
            return;
        }
        let first_time = self.ledger.check_and_record(&key).await;
        self.greet(config, message, first_time).await;
    }

    async fn greet(&self, config: &BotConfig, message: &ChatMessage, first_time: bool) {
        if !config.feature_enabled("greetings") {
            return;
        }
        let resolved =
            config.resolve_greeting(&message.name_key(), message.is_mod, message.is_vip, first_time);
        if let Some(chat) = resolved.chat {
            self.responder
                .send_chat(&message.channel, Some(message.display()), chat, None)
                .await;
        }
        if let Some(media) = resolved.media {
            self.responder
                .play_media(config, Some(message.display()), media, None);
        }
        if let Some(shoutout) = resolved.shoutout {
            self.responder
                .shout_out(&message.channel, message.display(), shoutout, None);
        }
    }

    /// `!!` commands. Non-admins are ignored without a reply, so chat gets
    /// no hint about which account can drive the bot.
    async fn run_admin_command(
        &self,
        config: &BotConfig,
        message: &ChatMessage,
        token: &CommandToken,
    ) {
        if !config.is_admin(&message.username) {
            info!(
                "ignoring admin command from non-admin '{}': {}",
                message.username,
                token.command()
            );
            return;
        }

        match token.command().to_lowercase().as_str() {
            "!!clearseen" => self.seen.clear().await,
            "!!addseen" => {
                if let Some(user) = token.arg(1) {
                    self.seen.add(&user.to_lowercase()).await;
                }
            }
            "!!delseen" => {
                if let Some(user) = token.arg(1) {
                    self.seen.remove(&user.to_lowercase()).await;
                }
            }
            "!!testgreeting" => {
                if let Some(user) = token.arg(1) {
                    let user = user.trim_start_matches('@');
                    let mut preview = message.clone();
                    preview.username = user.to_string();
                    preview.display_name = Some(user.to_string());
                    preview.is_mod = false;
                    preview.is_vip = false;
                    self.greet(config, &preview, false).await;
                }
            }
            "!!reload" => match self.config.reload().await {
                Ok(()) => {
                    self.scheduler.load_periodic_messages().await;
                    info!("configuration reloaded by '{}'", message.username);
                }
                Err(e) => {
                    error!("reload failed: {e:#}");
                    self.responder
                        .send_line(
                            &message.channel,
                            "Could not load configuration file, continuing with existing configuration.",
                        )
                        .await;
                }
            },
            "!!enable" => {
                if let Some(feature) = token.arg(1) {
                    self.config.set_feature(feature, true).await;
                }
            }
            "!!disable" => {
                if let Some(feature) = token.arg(1) {
                    self.config.set_feature(feature, false).await;
                }
            }
            "!!exit" => {
                info!("shutdown requested by '{}'", message.username);
                if self.shutdown.send(()).is_err() {
                    warn!("no shutdown listener registered");
                }
            }
            other => debug!("unknown admin command: {other}"),
        }
    }

    /// Single-`!` commands available to everyone, each behind its feature
    /// flag. Deliberately independent checks rather than one switch, so a
    /// command word that also appears in the response table fires both.
    async fn run_user_command(
        &self,
        config: &BotConfig,
        message: &ChatMessage,
        token: &CommandToken,
    ) {
        let command = token.command().to_lowercase();

        if command == "!dice" && config.feature_enabled("dice") {
            let roll = rand::rng().random_range(1..=6);
            self.responder
                .send_line(
                    &message.channel,
                    &format!("You rolled a {roll}, {}", message.display()),
                )
                .await;
        }

        if command == "!timer" && config.feature_enabled("timer") {
            let minutes = token.arg(1).and_then(|a| a.parse::<f64>().ok());
            match minutes {
                Some(m) if m.is_finite() && m > 0.0 => {
                    let label = token.rest(2);
                    self.responder
                        .send_line(
                            &message.channel,
                            &format!("Starting {m} minute timer {label}"),
                        )
                        .await;
                    self.scheduler
                        .start_timer(&message.channel, message.display(), m, &label);
                }
                _ => {
                    self.responder
                        .send_line(&message.channel, "Missing or invalid timer length in minutes")
                        .await;
                }
            }
        }

        if let Some(op) = counter_op(&command) {
            if config.feature_enabled("counter") {
                self.run_counter_command(message, token, op).await;
            }
        }

        if let Some(reply) = config.response_commands.get(&command) {
            self.responder
                .send_chat(&message.channel, Some(message.display()), reply, None)
                .await;
        }
    }

    async fn run_counter_command(&self, message: &ChatMessage, token: &CommandToken, op: char) {
        let name = sanitize_name(&token.command()[2..]);
        if name.is_empty() {
            return;
        }
        let amount = token.arg(1).and_then(|a| a.parse::<i64>().ok());

        let result = match op {
            '+' => self.counters.increment(&name, amount.unwrap_or(1)).await,
            '-' => self.counters.decrement(&name, amount.unwrap_or(1), 0).await,
            '=' => match amount {
                Some(value) => self.counters.set(&name, value).await,
                None => {
                    self.responder
                        .send_line(&message.channel, "Missing or invalid counter value")
                        .await;
                    return;
                }
            },
            _ => self.counters.get(&name).await,
        };

        match result {
            Ok(value) => {
                self.responder
                    .send_line(
                        &message.channel,
                        &format!("Counter {name} is currently {value}"),
                    )
                    .await;
                if op != '?' {
                    if let Some(overlay) = &self.overlay {
                        overlay.publish(&format!("counter_{name}_update"), serde_json::json!(value));
                    }
                }
            }
            Err(e) => error!("counter '{name}' operation failed: {e:#}"),
        }
    }

    /// Forbidden phrases. Broadcaster is always exempt; mods and VIPs only
    /// when the `forbidden_for_mods_vips` flag is off.
    async fn run_forbidden_scan(
        &self,
        config: &BotConfig,
        message: &ChatMessage,
        token: &CommandToken,
    ) {
        if message.is_broadcaster() {
            return;
        }
        if (message.is_mod || message.is_vip) && !config.feature_enabled("forbidden_for_mods_vips") {
            return;
        }

        for rule in &config.forbidden_phrases {
            let Some(regex) = &rule.compiled else { continue };
            let Some(caps) = regex.captures(&token.text) else {
                continue;
            };
            let captures = collect_captures(&caps);
            info!(
                "forbidden phrase '{}' matched message from '{}'",
                rule.pattern, message.username
            );
            if let Some(chat) = &rule.chat {
                self.responder
                    .send_chat(
                        &message.channel,
                        Some(message.display()),
                        chat,
                        Some(&captures),
                    )
                    .await;
            }
            if let Some(seconds) = rule.timeout_seconds {
                self.responder
                    .send_line(
                        &message.channel,
                        &format!("/timeout {} {seconds}", message.username),
                    )
                    .await;
            }
            if rule.ban {
                self.responder
                    .send_line(&message.channel, &format!("/ban {}", message.username))
                    .await;
            }
        }
    }

    /// Pattern-triggered reactions. Admin command lines from non-admins
    /// skip this family entirely, so a denied `!!` attempt cannot trip a
    /// trigger either.
    async fn run_triggered_scan(
        &self,
        config: &BotConfig,
        message: &ChatMessage,
        token: &CommandToken,
    ) {
        if token.text.starts_with("!!") && !config.is_admin(&message.username) {
            return;
        }

        for rule in &config.triggered_messages {
            let Some(regex) = &rule.compiled else { continue };
            let Some(caps) = regex.captures(&token.text) else {
                continue;
            };
            let captures = collect_captures(&caps);
            debug!(
                "trigger '{}' matched message from '{}'",
                rule.pattern, message.username
            );
            if let Some(chat) = &rule.chat {
                self.responder
                    .send_chat(
                        &message.channel,
                        Some(message.display()),
                        chat,
                        Some(&captures),
                    )
                    .await;
            }
            if let Some(media) = &rule.media {
                self.responder
                    .play_media(config, Some(message.display()), media, Some(&captures));
            }
            if let Some(shoutout) = &rule.shoutout {
                self.responder.shout_out(
                    &message.channel,
                    message.display(),
                    shoutout,
                    Some(captures.clone()),
                );
            }
        }
    }

    /// Commands answered with a random line from a text file (quotes,
    /// facts, eight-ball answers). Keyed on the whole sanitized message.
    async fn run_random_file_line(
        &self,
        config: &BotConfig,
        message: &ChatMessage,
        token: &CommandToken,
    ) {
        let Some(path) = config.random_file_line_commands.get(&token.text) else {
            return;
        };
        match tokio::fs::read_to_string(path).await {
            Ok(contents) => {
                let lines: Vec<&str> = contents
                    .lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .collect();
                if lines.is_empty() {
                    warn!("random line file {} is empty", path.display());
                    return;
                }
                let line = lines[rand::rng().random_range(0..lines.len())];
                self.responder.send_line(&message.channel, line).await;
            }
            Err(e) => error!("failed to read random line file {}: {e}", path.display()),
        }
    }

    /// Mirror bare image links into an HTML snippet an overlay browser
    /// source watches.
    async fn run_image_link(
        &self,
        config: &BotConfig,
        message: &ChatMessage,
        token: &CommandToken,
    ) {
        if !config.feature_enabled("imagelink") {
            return;
        }
        if !config.image_link.compiled.iter().any(|re| re.is_match(&token.text)) {
            return;
        }

        let html = format!(
            "<img src=\"{}\" width=\"100%\" height=\"100%\">",
            token.text
        );
        let path = &config.image_link.output_file;
        if let Some(parent) = path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                error!("failed to create {}: {e}", parent.display());
                return;
            }
        }
        match tokio::fs::write(path, html).await {
            Ok(()) => {
                info!("image link from '{}' written to {}", message.username, path.display());
                if let Some(overlay) = &self.overlay {
                    overlay.publish("image_link", serde_json::json!(token.text));
                }
            }
            Err(e) => error!("failed to write image link file {}: {e}", path.display()),
        }
    }
}

/// `!+name`, `!-name`, `!=name`, `!?name`.
fn counter_op(command: &str) -> Option<char> {
    let mut chars = command.chars();
    match (chars.next(), chars.next()) {
        (Some('!'), Some(op @ ('+' | '-' | '=' | '?'))) => Some(op),
        _ => None,
    }
}

/// Capture groups as owned strings, stopping at the first group that did
/// not participate in the match. Index 0 is the whole match.
fn collect_captures(caps: &regex::Captures<'_>) -> Vec<String> {
    caps.iter()
        .map_while(|m| m.map(|m| m.as_str().to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ForbiddenPhrase, Greeting, TriggeredMessage};
    use crate::storage::FileStorage;
    use crate::types::TextOrList;
    use std::collections::HashMap;
    use tokio::sync::mpsc;

    struct Fixture {
        dispatcher: Dispatcher,
        outbound: mpsc::Receiver<(String, String)>,
        shutdown: broadcast::Receiver<()>,
        manager: Arc<ConfigManager>,
        counters: Arc<CounterStore>,
        seen: Arc<SeenUsers>,
        _dir: tempfile::TempDir,
    }

    fn test_config() -> BotConfig {
        let mut features = HashMap::new();
        for f in ["greetings", "dice", "timer", "counter"] {
            features.insert(f.to_string(), true);
        }
        let mut greetings = HashMap::new();
        greetings.insert(
            "default".to_string(),
            Greeting {
                chat: Some(TextOrList::One("welcome USERNAME".to_string())),
                media: None,
                shoutout: None,
            },
        );
        let mut response_commands = HashMap::new();
        response_commands.insert(
            "!discord".to_string(),
            TextOrList::One("Join us: example.chat/invite".to_string()),
        );
        BotConfig {
            bot_name: "reactbot".to_string(),
            channels: vec!["somechannel".to_string()],
            admin_users: vec!["ops".to_string()],
            ignore_users: vec!["spambot".to_string()],
            features,
            greetings,
            forbidden_phrases: vec![ForbiddenPhrase {
                pattern: "(?i)badword".to_string(),
                compiled: None,
                chat: Some(TextOrList::One("Language, USERNAME!".to_string())),
                timeout_seconds: Some(30),
                ban: false,
            }],
            triggered_messages: vec![TriggeredMessage {
                pattern: r"rolled a (\d+)".to_string(),
                compiled: None,
                chat: Some(TextOrList::One("USERNAME got _1_".to_string())),
                media: None,
                shoutout: None,
            }],
            response_commands,
            ..Default::default()
        }
    }

    fn fixture() -> Fixture {
        fixture_from(test_config())
    }

    fn fixture_from(config: BotConfig) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let storage: Arc<dyn crate::storage::Storage> =
            Arc::new(FileStorage::new(dir.path()));
        let manager = Arc::new(ConfigManager::from_config(config).unwrap());
        let (tx, outbound) = mpsc::channel(32);
        let responder = Responder::new(tx, None);
        let scheduler = Arc::new(Scheduler::new(Arc::clone(&manager), responder.clone()));
        let seen = Arc::new(SeenUsers::new());
        let counters = Arc::new(CounterStore::new(Arc::clone(&storage)));
        let (shutdown_tx, shutdown) = broadcast::channel(1);
        let dispatcher = Dispatcher::new(
            Arc::clone(&manager),
            Arc::clone(&seen),
            FirstTimeLedger::new(storage),
            Arc::clone(&counters),
            responder,
            scheduler,
            None,
            shutdown_tx,
        );
        Fixture {
            dispatcher,
            outbound,
            shutdown,
            manager,
            counters,
            seen,
            _dir: dir,
        }
    }

    fn chat(username: &str, content: &str) -> ChatMessage {
        ChatMessage {
            channel: "somechannel".to_string(),
            username: username.to_string(),
            display_name: None,
            content: content.to_string(),
            timestamp: chrono::Utc::now(),
            user_badges: Some(vec![]),
            is_mod: false,
            is_vip: false,
        }
    }

    fn drain(rx: &mut mpsc::Receiver<(String, String)>) -> Vec<String> {
        let mut lines = Vec::new();
        while let Ok((_, line)) = rx.try_recv() {
            lines.push(line);
        }
        lines
    }

    #[test_log::test(tokio::test)]
    async fn greets_each_user_exactly_once_per_session() {
        let mut fx = fixture();
        fx.dispatcher.dispatch(&chat("Ann", "hi there")).await;
        fx.dispatcher.dispatch(&chat("ann", "hi again")).await;
        assert_eq!(drain(&mut fx.outbound), vec!["welcome Ann"]);
    }

    #[tokio::test]
    async fn seen_bookkeeping_runs_with_greetings_disabled() {
        let mut config = test_config();
        config.features.insert("greetings".to_string(), false);
        let mut fx = fixture_from(config);

        fx.dispatcher.dispatch(&chat("Ann", "hi there")).await;
        assert!(fx.seen.has_seen("ann").await);
        assert!(drain(&mut fx.outbound).is_empty());

        // Flipping the flag back on must not greet users who already
        // chatted while it was off.
        fx.manager.set_feature("greetings", true).await;
        fx.dispatcher.dispatch(&chat("ann", "hi again")).await;
        assert!(drain(&mut fx.outbound).is_empty());
    }

    #[tokio::test]
    async fn broadcaster_is_never_greeted() {
        let mut fx = fixture();
        let mut msg = chat("streamer", "hello");
        msg.user_badges = Some(vec!["broadcaster".to_string()]);
        fx.dispatcher.dispatch(&msg).await;
        assert!(drain(&mut fx.outbound).is_empty());
    }

    #[tokio::test]
    async fn ignored_users_produce_no_side_effects() {
        let mut fx = fixture();
        fx.dispatcher.dispatch(&chat("spambot", "!+deaths badword")).await;
        assert!(drain(&mut fx.outbound).is_empty());
        assert_eq!(fx.counters.get("deaths").await.unwrap(), 0);
        assert!(!fx.seen.has_seen("spambot").await);
    }

    #[tokio::test]
    async fn exit_from_non_admin_is_silently_dropped() {
        let mut fx = fixture();
        fx.seen.add("mallory").await;
        fx.dispatcher.dispatch(&chat("mallory", "!!exit")).await;
        assert!(fx.shutdown.try_recv().is_err());
        assert!(drain(&mut fx.outbound).is_empty());
    }

    #[tokio::test]
    async fn exit_from_admin_signals_shutdown() {
        let mut fx = fixture();
        fx.seen.add("ops").await;
        fx.dispatcher.dispatch(&chat("ops", "!!exit")).await;
        assert!(fx.shutdown.try_recv().is_ok());
    }

    #[test_log::test(tokio::test)]
    async fn forbidden_and_trigger_rules_fire_independently() {
        let mut fx = fixture();
        fx.seen.add("ann").await;
        fx.dispatcher
            .dispatch(&chat("ann", "badword, I rolled a 20"))
            .await;
        let lines = drain(&mut fx.outbound);
        assert!(lines.contains(&"Language, ann!".to_string()));
        assert!(lines.contains(&"/timeout ann 30".to_string()));
        assert!(lines.contains(&"ann got 20".to_string()));
    }

    #[tokio::test]
    async fn mods_skip_forbidden_scan_by_default() {
        let mut fx = fixture();
        fx.seen.add("modfriend").await;
        let mut msg = chat("modfriend", "badword");
        msg.is_mod = true;
        fx.dispatcher.dispatch(&msg).await;
        assert!(drain(&mut fx.outbound).is_empty());
    }

    #[tokio::test]
    async fn counters_accumulate_and_clamp() {
        let mut fx = fixture();
        fx.seen.add("ann").await;
        fx.dispatcher.dispatch(&chat("ann", "!+deaths")).await;
        fx.dispatcher.dispatch(&chat("ann", "!+deaths 2")).await;
        fx.dispatcher.dispatch(&chat("ann", "!-deaths 10")).await;
        fx.dispatcher.dispatch(&chat("ann", "!?deaths")).await;
        assert_eq!(
            drain(&mut fx.outbound),
            vec![
                "Counter deaths is currently 1",
                "Counter deaths is currently 3",
                "Counter deaths is currently 0",
                "Counter deaths is currently 0",
            ]
        );
    }

    #[tokio::test]
    async fn response_command_replies_with_canned_text() {
        let mut fx = fixture();
        fx.seen.add("ann").await;
        fx.dispatcher.dispatch(&chat("ann", "!discord")).await;
        assert_eq!(drain(&mut fx.outbound), vec!["Join us: example.chat/invite"]);
    }

    #[tokio::test]
    async fn dice_respects_feature_flag() {
        let mut fx = fixture();
        fx.seen.add("ann").await;
        fx.dispatcher.dispatch(&chat("ann", "!dice")).await;
        let lines = drain(&mut fx.outbound);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("You rolled a "));
        assert!(lines[0].ends_with(", ann"));
    }

    #[tokio::test]
    async fn invalid_timer_length_is_reported() {
        let mut fx = fixture();
        fx.seen.add("ann").await;
        fx.dispatcher.dispatch(&chat("ann", "!timer soon tea")).await;
        assert_eq!(
            drain(&mut fx.outbound),
            vec!["Missing or invalid timer length in minutes"]
        );
    }

    #[tokio::test]
    async fn testgreeting_strips_at_sign_and_skips_seen_marking() {
        let mut fx = fixture();
        fx.seen.add("ops").await;
        fx.dispatcher.dispatch(&chat("ops", "!!testgreeting @Bob")).await;
        assert_eq!(drain(&mut fx.outbound), vec!["welcome Bob"]);
        assert!(!fx.seen.has_seen("bob").await);
    }

    #[tokio::test]
    async fn denied_admin_line_does_not_trip_triggers() {
        let mut fx = fixture();
        fx.seen.add("mallory").await;
        fx.dispatcher
            .dispatch(&chat("mallory", "!!exit I rolled a 7"))
            .await;
        assert!(drain(&mut fx.outbound).is_empty());
    }

    #[test]
    fn counter_op_recognizes_prefixes_only() {
        assert_eq!(counter_op("!+deaths"), Some('+'));
        assert_eq!(counter_op("!?wins"), Some('?'));
        assert_eq!(counter_op("!dice"), None);
        assert_eq!(counter_op("deaths"), None);
    }
}
