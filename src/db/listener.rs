//! Change feed via LISTEN/NOTIFY.

use std::time::Duration;

use sqlx::postgres::PgListener;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::EVENTS_CHANNEL;
use crate::error::{Error, Result};
use crate::store::WatchEvent;

const EVENT_CAPACITY: usize = 1024;

impl super::Db {
    /// Start listening for promotion changes.
    ///
    /// A background task owns the listener and forwards decoded events
    /// until every receiver has been dropped.
    pub async fn listen(&self) -> Result<broadcast::Receiver<WatchEvent>> {
        let mut listener = PgListener::connect_with(self.pool()).await?;
        listener.listen(EVENTS_CHANNEL).await?;
        info!(channel = EVENTS_CHANNEL, "listening for promotion changes");

        let (tx, rx) = broadcast::channel(EVENT_CAPACITY);
        tokio::spawn(async move {
            loop {
                match listener.recv().await {
                    Ok(notification) => match decode(notification.payload()) {
                        Ok(event) => {
                            if tx.send(event).is_err() {
                                debug!("no watch subscribers left, stopping listener");
                                return;
                            }
                        }
                        Err(e) => warn!(error = %e, "undecodable promotion notification"),
                    },
                    Err(e) => {
                        // PgListener reconnects on the next recv; events in
                        // the gap are recovered by resync.
                        warn!(error = %e, "promotion listener error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        Ok(rx)
    }
}

fn decode(payload: &str) -> Result<WatchEvent> {
    serde_json::from_str(payload).map_err(|e| Error::Other(format!("bad notification: {e}")))
}
