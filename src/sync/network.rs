use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Device connectivity flag with transition notifications.
///
/// Cheap to clone; every clone observes the same flag.
#[derive(Debug, Clone)]
pub struct NetworkMonitor {
    tx: Arc<watch::Sender<bool>>,
}

impl NetworkMonitor {
    pub fn new(initially_online: bool) -> Self {
        let (tx, _) = watch::channel(initially_online);
        Self { tx: Arc::new(tx) }
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Record the current state. Receivers are only woken on an actual change.
    pub fn set_online(&self, online: bool) {
        let changed = self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            tracing::info!("Connectivity changed: {}", if online { "online" } else { "offline" });
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Poll `url` every `interval`: any HTTP reply means online, a transport
    /// failure means offline.
    pub fn spawn_probe(&self, url: String, interval: Duration) -> JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            let client = match reqwest::Client::builder().timeout(interval).build() {
                Ok(client) => client,
                Err(e) => {
                    tracing::error!("Connectivity probe disabled: {}", e);
                    return;
                }
            };
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let online = match client.head(&url).send().await {
                    Ok(_) => true,
                    Err(e) => {
                        tracing::debug!("Connectivity probe to {} failed: {}", url, e);
                        false
                    }
                };
                monitor.set_online(online);
            }
        })
    }
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}
