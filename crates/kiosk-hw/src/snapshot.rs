//! Pull-based still-image stream adapted into a continuous feed.
//!
//! The URL is fetched on a fixed interval; between successful fetches the
//! last frame stays current, so readers see a steady redraw.

use crate::frame::Frame;
use crate::source::{FrameSink, SourceError, SourceKind, VideoSource};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

const FETCH_TIMEOUT: Duration = Duration::from_secs(5);

pub struct SnapshotSource {
    url: Option<String>,
    interval: Duration,
    client: reqwest::Client,
    task: Option<JoinHandle<()>>,
}

impl SnapshotSource {
    pub fn new(url: Option<String>, interval: Duration) -> Self {
        Self {
            url,
            interval,
            client: reqwest::Client::new(),
            task: None,
        }
    }
}

#[async_trait]
impl VideoSource for SnapshotSource {
    async fn start(&mut self, sink: FrameSink) -> Result<(), SourceError> {
        if self.task.is_some() {
            return Err(SourceError::AlreadyStarted);
        }
        let url = self.url.clone().ok_or(SourceError::MissingUrl)?;

        let first = fetch_frame(&self.client, &url, 0).await?;
        tracing::info!(
            url = %url,
            width = first.width(),
            height = first.height(),
            "snapshot source started"
        );
        sink.send_replace(Some(Arc::new(first)));

        let client = self.client.clone();
        let period = self.interval;
        self.task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            let mut sequence = 1u32;
            loop {
                ticker.tick().await;
                match fetch_frame(&client, &url, sequence).await {
                    Ok(frame) => {
                        sequence = sequence.wrapping_add(1);
                        if sink.send(Some(Arc::new(frame))).is_err() {
                            tracing::debug!("snapshot feed closed");
                            break;
                        }
                    }
                    Err(e) => tracing::debug!(error = %e, "snapshot refresh failed, keeping last frame"),
                }
            }
        }));
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            tracing::info!("snapshot source stopped");
        }
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Snapshot
    }
}

impl Drop for SnapshotSource {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn fetch_frame(client: &reqwest::Client, url: &str, sequence: u32) -> Result<Frame, SourceError> {
    let bytes = client
        .get(url)
        .timeout(FETCH_TIMEOUT)
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|e| SourceError::Snapshot(e.to_string()))?
        .bytes()
        .await
        .map_err(|e| SourceError::Snapshot(e.to_string()))?;

    let image = image::load_from_memory(&bytes)
        .map_err(|e| SourceError::Snapshot(format!("undecodable image: {e}")))?
        .to_rgb8();
    Ok(Frame::new(image, sequence))
}
