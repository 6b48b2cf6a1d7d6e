// src/bot/mod.rs - Wires the transport, dispatcher and scheduler together

use anyhow::{Context, Result};
use log::{error, info, warn};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, RwLock};

use crate::bot::counters::CounterStore;
use crate::bot::dispatch::Dispatcher;
use crate::bot::responder::Responder;
use crate::bot::scheduler::Scheduler;
use crate::bot::seen::{FirstTimeLedger, SeenUsers};
use crate::config::ConfigManager;
use crate::overlay::OverlayServer;
use crate::platforms::PlatformConnection;
use crate::storage::Storage;

pub mod counters;
pub mod dispatch;
pub mod responder;
pub mod scheduler;
pub mod seen;

/// The running bot: one platform connection, one dispatcher, one scheduler,
/// and the outbound queue between them.
pub struct ChatBot {
    config: Arc<ConfigManager>,
    connection: Arc<RwLock<Box<dyn PlatformConnection>>>,
    dispatcher: Arc<Dispatcher>,
    scheduler: Arc<Scheduler>,
    outbound_rx: Option<mpsc::Receiver<(String, String)>>,
    shutdown: broadcast::Sender<()>,
    degraded: broadcast::Sender<()>,
}

impl ChatBot {
    pub fn new(
        config: Arc<ConfigManager>,
        connection: Box<dyn PlatformConnection>,
        storage: Arc<dyn Storage>,
        overlay: Option<Arc<OverlayServer>>,
    ) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(100);
        let (shutdown, _) = broadcast::channel(1);
        let (degraded, _) = broadcast::channel(1);

        let responder = Responder::new(outbound_tx, overlay.clone());
        let scheduler = Arc::new(Scheduler::new(Arc::clone(&config), responder.clone()));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&config),
            Arc::new(SeenUsers::new()),
            FirstTimeLedger::new(Arc::clone(&storage)),
            Arc::new(CounterStore::new(storage)),
            responder,
            Arc::clone(&scheduler),
            overlay,
            shutdown.clone(),
        ));

        Self {
            config,
            connection: Arc::new(RwLock::new(connection)),
            dispatcher,
            scheduler,
            outbound_rx: Some(outbound_rx),
            shutdown,
            degraded,
        }
    }

    /// Subscribe to the shutdown signal raised by the exit command.
    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown.subscribe()
    }

    /// Subscribe to the degraded signal, raised when the platform message
    /// stream dies after a successful start.
    pub fn subscribe_degraded(&self) -> broadcast::Receiver<()> {
        self.degraded.subscribe()
    }

    /// Connect and start the forwarder and receive loops.
    pub async fn start(&mut self) -> Result<()> {
        self.connection
            .write()
            .await
            .connect()
            .await
            .context("platform connection failed")?;

        let receiver = self
            .connection
            .read()
            .await
            .get_message_receiver()
            .context("platform produced no message receiver")?;

        let mut outbound_rx = self
            .outbound_rx
            .take()
            .context("bot already started")?;

        let connection = Arc::clone(&self.connection);
        tokio::spawn(async move {
            while let Some((channel, line)) = outbound_rx.recv().await {
                if let Err(e) = connection.read().await.send_message(&channel, &line).await {
                    error!("failed to send to #{channel}: {e:#}");
                }
            }
            info!("outbound forwarder stopped");
        });

        let dispatcher = Arc::clone(&self.dispatcher);
        let degraded = self.degraded.clone();
        tokio::spawn(async move {
            let mut receiver = receiver;
            loop {
                match receiver.recv().await {
                    // Messages are dispatched one at a time, in arrival
                    // order, so rule side effects never interleave.
                    Ok(message) => dispatcher.dispatch(&message).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("receive loop lagged, {n} messages dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        warn!("platform message stream closed");
                        if degraded.send(()).is_err() {
                            warn!("no degraded listener registered");
                        }
                        break;
                    }
                }
            }
        });

        self.scheduler.load_periodic_messages().await;
        info!("bot started");
        Ok(())
    }

    /// Best-effort notice to chat that the bot is limping. Used from the
    /// top level when a subsystem died but the connection may still work.
    pub async fn notify_degraded(&self) {
        let config = self.config.snapshot().await;
        let line = format!("{} technical difficulties, please check logs!", config.bot_name);
        let connection = self.connection.read().await;
        if let Err(e) = connection.send_message(config.primary_channel(), &line).await {
            error!("could not post degraded notice: {e:#}");
        }
    }

    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
        if let Err(e) = self.connection.write().await.disconnect().await {
            warn!("disconnect failed: {e:#}");
        }
        info!("bot stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BotConfig;
    use crate::storage::FileStorage;
    use crate::types::{ChatMessage, TextOrList};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use tokio::sync::Mutex;

    struct FakePlatform {
        receiver: std::sync::Mutex<Option<broadcast::Receiver<ChatMessage>>>,
        sent: Arc<Mutex<Vec<(String, String)>>>,
        connected: bool,
    }

    #[async_trait]
    impl PlatformConnection for FakePlatform {
        async fn connect(&mut self) -> Result<()> {
            self.connected = true;
            Ok(())
        }

        async fn send_message(&self, channel: &str, message: &str) -> Result<()> {
            self.sent
                .lock()
                .await
                .push((channel.to_string(), message.to_string()));
            Ok(())
        }

        async fn is_connected(&self) -> bool {
            self.connected
        }

        fn get_message_receiver(&self) -> Option<broadcast::Receiver<ChatMessage>> {
            self.receiver.lock().unwrap().take()
        }

        fn get_channels(&self) -> Vec<String> {
            vec!["somechannel".to_string()]
        }

        async fn disconnect(&mut self) -> Result<()> {
            self.connected = false;
            Ok(())
        }
    }

    fn test_config() -> BotConfig {
        let mut features = HashMap::new();
        features.insert("greetings".to_string(), true);
        let mut greetings = HashMap::new();
        greetings.insert(
            "default".to_string(),
            crate::config::Greeting {
                chat: Some(TextOrList::One("welcome USERNAME".to_string())),
                media: None,
                shoutout: None,
            },
        );
        BotConfig {
            bot_name: "reactbot".to_string(),
            channels: vec!["somechannel".to_string()],
            features,
            greetings,
            ..Default::default()
        }
    }

    struct Rig {
        bot: ChatBot,
        incoming: broadcast::Sender<ChatMessage>,
        sent: Arc<Mutex<Vec<(String, String)>>>,
        _dir: tempfile::TempDir,
    }

    fn rig() -> Rig {
        let dir = tempfile::tempdir().unwrap();
        let (incoming, rx) = broadcast::channel(16);
        let sent = Arc::new(Mutex::new(Vec::new()));
        let platform = FakePlatform {
            receiver: std::sync::Mutex::new(Some(rx)),
            sent: Arc::clone(&sent),
            connected: false,
        };
        let manager = Arc::new(ConfigManager::from_config(test_config()).unwrap());
        let bot = ChatBot::new(
            manager,
            Box::new(platform),
            Arc::new(FileStorage::new(dir.path())),
            None,
        );
        Rig {
            bot,
            incoming,
            sent,
            _dir: dir,
        }
    }

    fn message(username: &str, content: &str) -> ChatMessage {
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

    async fn wait_for_sent(sent: &Arc<Mutex<Vec<(String, String)>>>) -> Vec<(String, String)> {
        for _ in 0..100 {
            {
                let lines = sent.lock().await;
                if !lines.is_empty() {
                    return lines.clone();
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        sent.lock().await.clone()
    }

    #[tokio::test]
    async fn incoming_message_flows_out_as_reply() {
        let mut rig = rig();
        rig.bot.start().await.unwrap();
        rig.incoming.send(message("ann", "hello")).unwrap();
        let sent = wait_for_sent(&rig.sent).await;
        assert_eq!(
            sent,
            vec![("somechannel".to_string(), "welcome ann".to_string())]
        );
    }

    #[tokio::test]
    async fn closed_message_stream_raises_degraded_signal() {
        let mut rig = rig();
        let mut degraded = rig.bot.subscribe_degraded();
        rig.bot.start().await.unwrap();

        drop(rig.incoming);
        degraded.recv().await.unwrap();

        rig.bot.notify_degraded().await;
        let sent = wait_for_sent(&rig.sent).await;
        assert_eq!(
            sent,
            vec![(
                "somechannel".to_string(),
                "reactbot technical difficulties, please check logs!".to_string()
            )]
        );
    }
}
