//! PBX event feed connection.
//!
//! Holds the websocket session to the SPOP feed, reconnects with capped
//! exponential backoff, and drives the correlation engine one message at a
//! time. Lifecycle signals leave over a channel so orchestration never
//! blocks the read loop.

pub mod status;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use reqwest::Url;
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use status::{ConnectionState, FeedState, FeedStatusHandle};

use crate::config::PbxConfig;
use crate::control::Monitor;
use crate::correlation::{CorrelationEngine, LifecycleSignal, PbxEvent};

const MAX_BACKOFF_EXPONENT: u32 = 6;

/// Delay before reconnect attempt `attempt` (1-based).
pub fn backoff_delay(attempt: u32, max_delay: Duration) -> Duration {
    let exp = attempt.min(MAX_BACKOFF_EXPONENT);
    Duration::from_secs(2u64.pow(exp)).min(max_delay)
}

/// Feed URL with credentials as query parameters.
pub fn feed_url(config: &PbxConfig) -> Result<Url> {
    Url::parse_with_params(
        &config.wss_url,
        &[
            ("username", config.username.as_str()),
            ("password", config.password.as_str()),
        ],
    )
    .with_context(|| format!("Invalid PBX feed URL: {}", config.wss_url))
}

/// Same URL with the password masked, for logs.
pub fn redacted_feed_url(config: &PbxConfig) -> String {
    let mut url = match Url::parse(&config.wss_url) {
        Ok(url) => url,
        Err(_) => return config.wss_url.clone(),
    };
    url.query_pairs_mut()
        .append_pair("username", &config.username)
        .append_pair("password", "***");
    url.to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Server sent a close frame.
    Closed,
    /// The stream ended without a close frame.
    StreamEnded,
    Cancelled,
}

pub struct ConnectionManager {
    config: PbxConfig,
    engine: CorrelationEngine,
    signals: mpsc::UnboundedSender<LifecycleSignal>,
    status: FeedStatusHandle,
    attempt: u32,
}

impl ConnectionManager {
    pub fn new(
        config: PbxConfig,
        signals: mpsc::UnboundedSender<LifecycleSignal>,
        status: FeedStatusHandle,
    ) -> Self {
        let engine = CorrelationEngine::new(config.own_extension());
        Self {
            config,
            engine,
            signals,
            status,
            attempt: 0,
        }
    }

    pub fn engine(&self) -> &CorrelationEngine {
        &self.engine
    }

    pub fn status(&self) -> FeedStatusHandle {
        self.status.clone()
    }

    /// Reconnect forever until `cancel` fires.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<()> {
        let url = feed_url(&self.config)?;
        info!("PBX feed: {}", redacted_feed_url(&self.config));

        loop {
            self.status.connecting(self.attempt).await;
            info!("Connecting to PBX feed (attempt {})", self.attempt + 1);

            match self.run_once(&url, &cancel).await {
                Ok(SessionEnd::Cancelled) => {
                    self.status.disconnected().await;
                    info!("PBX feed session cancelled");
                    return Ok(());
                }
                Ok(end) => {
                    warn!("PBX feed session ended ({:?}), reconnecting", end);
                    self.status.disconnected().await;
                }
                Err(e) => {
                    error!("PBX feed error: {:#}", e);
                    self.status.failed(format!("{:#}", e)).await;
                }
            }

            self.attempt += 1;
            let wait = backoff_delay(
                self.attempt,
                Duration::from_secs(self.config.max_reconnect_delay_secs),
            );
            info!("Retrying PBX feed in {}s", wait.as_secs());

            tokio::select! {
                _ = cancel.cancelled() => {
                    self.status.disconnected().await;
                    return Ok(());
                }
                _ = sleep(wait) => {}
            }
        }
    }

    /// One connected session. Returns when the session ends.
    pub async fn run_once(&mut self, url: &Url, cancel: &CancellationToken) -> Result<SessionEnd> {
        let (ws, _) = tokio::select! {
            _ = cancel.cancelled() => return Ok(SessionEnd::Cancelled),
            connected = connect_async(url.as_str()) => {
                connected.context("Failed to connect to PBX feed")?
            }
        };

        self.attempt = 0;
        self.status.connected().await;
        info!("Connected to PBX feed");

        let (mut write, mut read) = ws.split();
        let ping_interval = self.config.ping_interval();
        let ping_timeout = self.config.ping_timeout();
        let mut ping = tokio::time::interval_at(Instant::now() + ping_interval, ping_interval);
        let mut awaiting_pong: Option<Instant> = None;

        loop {
            let pong_deadline = awaiting_pong.map(|sent| sent + ping_timeout);

            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(SessionEnd::Cancelled);
                }
                _ = ping.tick() => {
                    if awaiting_pong.is_none() {
                        write
                            .send(Message::Ping(Vec::new().into()))
                            .await
                            .context("Failed to send keepalive ping")?;
                        awaiting_pong = Some(Instant::now());
                    }
                }
                _ = deadline(pong_deadline) => {
                    return Err(anyhow!(
                        "No keepalive response within {}s",
                        ping_timeout.as_secs()
                    ));
                }
                message = read.next() => {
                    let message = match message {
                        None => return Ok(SessionEnd::StreamEnded),
                        Some(message) => message.context("PBX feed read failed")?,
                    };
                    awaiting_pong = None;

                    match message {
                        Message::Text(text) => self.handle_message(text.as_str()).await,
                        Message::Binary(bytes) => match std::str::from_utf8(&bytes) {
                            Ok(text) => self.handle_message(text).await,
                            Err(_) => debug!("Ignoring non-UTF-8 binary frame"),
                        },
                        Message::Close(frame) => {
                            info!("PBX feed closed by server: {:?}", frame);
                            return Ok(SessionEnd::Closed);
                        }
                        Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
                    }
                }
            }
        }
    }

    /// Parse one feed message and forward any resulting signal. Bad input
    /// is logged and dropped.
    pub async fn handle_message(&mut self, text: &str) {
        let event = match PbxEvent::parse(text) {
            Ok(Some(event)) => event,
            Ok(None) => {
                debug!("Ignoring feed message without call id");
                return;
            }
            Err(_) => {
                let preview: String = text.chars().take(100).collect();
                debug!("Received non-JSON message: {}", preview);
                return;
            }
        };

        self.status.event_processed().await;

        if let Some(signal) = self.engine.process(&event) {
            if self.signals.send(signal).is_err() {
                warn!("Signal worker is not running, dropping signal for {}", event.call_id);
            }
        }
    }
}

fn deadline(at: Option<Instant>) -> impl Future<Output = ()> {
    async move {
        match at {
            Some(at) => tokio::time::sleep_until(at).await,
            None => std::future::pending().await,
        }
    }
}

#[async_trait]
impl Monitor for ConnectionManager {
    async fn run(&mut self, cancel: CancellationToken) -> Result<()> {
        ConnectionManager::run(self, cancel).await
    }
}
