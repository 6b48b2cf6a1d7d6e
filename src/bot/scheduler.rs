// src/bot/scheduler.rs - Viewer timers and periodic channel messages

use log::{debug, info};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::bot::responder::Responder;
use crate::config::ConfigManager;
use crate::types::TextOrList;

/// Owns every background timer task. Viewer timers are one-shot and
/// fire-and-forget; periodic messages are long-lived and tracked so a
/// config reload replaces them instead of stacking duplicates.
pub struct Scheduler {
    config: Arc<ConfigManager>,
    responder: Responder,
    periodic: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(config: Arc<ConfigManager>, responder: Responder) -> Self {
        Self {
            config,
            responder,
            periodic: Mutex::new(Vec::new()),
        }
    }

    /// Start a one-shot viewer timer. The alert template is read when the
    /// timer fires, so a reload in between takes effect.
    pub fn start_timer(&self, target: &str, username: &str, minutes: f64, label: &str) {
        let config = Arc::clone(&self.config);
        let responder = self.responder.clone();
        let target = target.to_string();
        let username = username.to_string();
        let label = label.to_string();
        info!("timer '{label}' started by {username}: {minutes} minutes");

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs_f64(minutes * 60.0)).await;
            let snapshot = config.snapshot().await;
            let Some(alert) = &snapshot.timer_alert else {
                debug!("timer '{label}' expired but no timer_alert is configured");
                return;
            };
            if let Some(chat) = &alert.chat {
                let text = TextOrList::One(chat.replace("TIMERNAME", &label));
                responder
                    .send_chat(&target, Some(&username), &text, None)
                    .await;
            }
            if let Some(media) = &alert.media {
                let media = TextOrList::One(media.replace("TIMERNAME", &label));
                responder.play_media(&snapshot, Some(&username), &media, None);
            }
        });
    }

    /// (Re)install the periodic message tasks from the current snapshot.
    /// Existing tasks are aborted first, so calling this after every reload
    /// is idempotent: one task per configured entry, never more.
    pub async fn load_periodic_messages(&self) {
        let mut handles = self.periodic.lock().await;
        for handle in handles.drain(..) {
            handle.abort();
        }

        let snapshot = self.config.snapshot().await;
        let target = snapshot.primary_channel().to_string();
        for entry in &snapshot.periodic_messages {
            let responder = self.responder.clone();
            let config = Arc::clone(&self.config);
            let target = target.clone();
            let name = entry.name.clone();
            let chat = entry.chat.clone();
            let media = entry.media.clone();
            let period = Duration::from_secs(entry.interval_minutes * 60);
            info!(
                "periodic message '{}' every {} minutes",
                name, entry.interval_minutes
            );

            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                // The first tick completes immediately; skip it so the
                // first message lands one full period after installation.
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    debug!("periodic message '{name}' firing");
                    if let Some(chat) = &chat {
                        responder.send_chat(&target, None, chat, None).await;
                    }
                    if let Some(media) = &media {
                        let snapshot = config.snapshot().await;
                        responder.play_media(&snapshot, None, media, None);
                    }
                }
            }));
        }
    }

    /// Number of live periodic tasks.
    pub async fn active_periodic_tasks(&self) -> usize {
        self.periodic.lock().await.len()
    }

    pub async fn shutdown(&self) {
        let mut handles = self.periodic.lock().await;
        for handle in handles.drain(..) {
            handle.abort();
        }
        info!("scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BotConfig, PeriodicMessage, TimerAlert};
    use tokio::sync::mpsc;

    fn test_config() -> BotConfig {
        BotConfig {
            bot_name: "reactbot".to_string(),
            channels: vec!["somechannel".to_string()],
            timer_alert: Some(TimerAlert {
                chat: Some("Timer TIMERNAME expired, USERNAME".to_string()),
                media: None,
            }),
            periodic_messages: vec![
                PeriodicMessage {
                    name: "hydrate".to_string(),
                    interval_minutes: 1,
                    chat: Some(TextOrList::One("Drink water!".to_string())),
                    media: None,
                },
                PeriodicMessage {
                    name: "lurk".to_string(),
                    interval_minutes: 2,
                    chat: Some(TextOrList::One("Thanks for lurking".to_string())),
                    media: None,
                },
            ],
            ..Default::default()
        }
    }

    fn scheduler(outbound: mpsc::Sender<(String, String)>) -> Scheduler {
        let manager = Arc::new(ConfigManager::from_config(test_config()).unwrap());
        Scheduler::new(manager, Responder::new(outbound, None))
    }

    #[tokio::test]
    async fn timer_alert_substitutes_label_and_username() {
        tokio::time::pause();
        let (tx, mut rx) = mpsc::channel(4);
        let scheduler = scheduler(tx);
        scheduler.start_timer("somechannel", "ann", 0.5, "tea");
        tokio::time::advance(Duration::from_secs(31)).await;
        let (channel, line) = rx.recv().await.unwrap();
        assert_eq!(channel, "somechannel");
        assert_eq!(line, "Timer tea expired, ann");
    }

    #[test_log::test(tokio::test)]
    async fn reload_replaces_periodic_tasks_instead_of_stacking() {
        let (tx, _rx) = mpsc::channel(4);
        let scheduler = scheduler(tx);
        scheduler.load_periodic_messages().await;
        scheduler.load_periodic_messages().await;
        scheduler.load_periodic_messages().await;
        assert_eq!(scheduler.active_periodic_tasks().await, 2);
        scheduler.shutdown().await;
        assert_eq!(scheduler.active_periodic_tasks().await, 0);
    }

    #[tokio::test]
    async fn first_periodic_message_waits_one_full_period() {
        tokio::time::pause();
        let (tx, mut rx) = mpsc::channel(16);
        let scheduler = scheduler(tx);
        scheduler.load_periodic_messages().await;

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(rx.try_recv().is_err());

        tokio::time::advance(Duration::from_secs(2)).await;
        let (_, line) = rx.recv().await.unwrap();
        assert_eq!(line, "Drink water!");
    }
}
