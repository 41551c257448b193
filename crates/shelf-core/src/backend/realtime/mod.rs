//! Realtime change feed
//!
//! Maintains a long-lived websocket to the hosted realtime service and
//! forwards bookmark row changes to the subscriber. Handles reconnection
//! automatically with exponential backoff.
//!
//! ## Protocol
//!
//! 1. Connect to `<project>/realtime/v1/websocket?apikey=...&vsn=1.0.0`
//! 2. Join `realtime:bookmarks-changes` with postgres change bindings
//! 3. Wait for the join reply
//! 4. Forward `postgres_changes` frames; heartbeat every 25 seconds
//!
//! `subscribe` returns once the first join succeeds (or the first attempt
//! fails), so a fetch started afterwards cannot miss changes committed
//! while the join was pending.
//!
//! Outages are reported in-band: one `Dropped` when the connection is
//! lost, one `Resumed` once a new join succeeds. Changes made in between
//! are not replayed by the service. A change frame that cannot be read is
//! reported the same way, as a `Dropped` immediately followed by `Resumed`.

mod message;

use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

pub use message::{PhoenixMessage, ServerMessage, BOOKMARKS_TOPIC};

use super::feed::{ChangeEvent, FeedMessage, FeedSubscription, OwnerFilter};
use super::ChangeFeed;
use crate::error::StoreResult;
use message::JOIN_REF;

type WsRead = futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Capacity of the subscriber's delivery channel
const FEED_BUFFER: usize = 64;

/// Configuration for the realtime feed
#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    /// Project URL, e.g. `https://abc.supabase.co`
    pub base_url: String,
    /// Public (anon) API key
    pub api_key: String,
    /// User access token, required for row-level security on changes
    pub access_token: Option<String>,
    /// Interval between heartbeats
    pub heartbeat_interval: Duration,
    /// How long to wait for the join reply
    pub join_timeout: Duration,
    /// How long `subscribe` holds the caller while the first join is pending
    pub ready_timeout: Duration,
    /// Initial reconnect delay
    pub initial_reconnect_delay: Duration,
    /// Maximum reconnect delay
    pub max_reconnect_delay: Duration,
}

impl RealtimeConfig {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            access_token: None,
            heartbeat_interval: Duration::from_secs(25),
            join_timeout: Duration::from_secs(10),
            ready_timeout: Duration::from_secs(10),
            initial_reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(30),
        }
    }

    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    /// Websocket endpoint derived from the project URL
    pub fn socket_url(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        let base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            base.to_string()
        };
        format!(
            "{}/realtime/v1/websocket?apikey={}&vsn=1.0.0",
            base, self.api_key
        )
    }
}

/// Change feed backed by the hosted realtime service
pub struct RealtimeFeed {
    config: RealtimeConfig,
}

impl RealtimeFeed {
    pub fn new(config: RealtimeConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ChangeFeed for RealtimeFeed {
    async fn subscribe(&self, filter: OwnerFilter) -> StoreResult<FeedSubscription> {
        let (tx, subscription) = FeedSubscription::channel(FEED_BUFFER);
        let (joined_tx, joined_rx) = oneshot::channel();
        tokio::spawn(feed_task_loop(self.config.clone(), filter, tx, joined_tx));

        match tokio::time::timeout(self.config.ready_timeout, joined_rx).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => debug!("Realtime feed not joined yet, a Resumed follows the join"),
            Err(_) => warn!(
                "Realtime join still pending after {:?}, a Resumed follows the join",
                self.config.ready_timeout
            ),
        }
        Ok(subscription)
    }
}

/// How a connection ended
enum Disconnect {
    /// Subscriber went away; stop for good
    Unsubscribed,
    /// Server closed the socket
    Closed,
}

/// Main feed loop with reconnection
async fn feed_task_loop(
    config: RealtimeConfig,
    filter: OwnerFilter,
    tx: mpsc::Sender<FeedMessage>,
    joined: oneshot::Sender<()>,
) {
    let mut reconnect_delay = config.initial_reconnect_delay;
    let mut outage = false;
    let mut joined = Some(joined);

    loop {
        let result = connect_and_listen(&config, &filter, &tx, &mut outage, &mut joined).await;
        // Release a subscriber still waiting for the first join
        joined = None;

        let reason = match result {
            Ok(Disconnect::Unsubscribed) => break,
            Ok(Disconnect::Closed) => {
                // Connection closed normally, reset backoff
                reconnect_delay = config.initial_reconnect_delay;
                "connection closed by server".to_string()
            }
            Err(e) => format!("connection error: {}", e),
        };

        if !outage {
            warn!("Realtime feed dropped: {}", reason);
            outage = true;
            if tx.send(FeedMessage::Dropped(reason)).await.is_err() {
                break;
            }
        } else {
            debug!("Realtime reconnect failed: {}", reason);
        }

        // Wait before reconnecting, but stop if the subscriber is gone
        tokio::select! {
            _ = tokio::time::sleep(reconnect_delay) => {
                reconnect_delay = (reconnect_delay * 2).min(config.max_reconnect_delay);
            }
            _ = tx.closed() => break,
        }
    }

    debug!("Realtime feed for {} stopped", filter.owner_id);
}

/// Connect, join the channel, and forward changes until disconnection
async fn connect_and_listen(
    config: &RealtimeConfig,
    filter: &OwnerFilter,
    tx: &mpsc::Sender<FeedMessage>,
    outage: &mut bool,
    joined: &mut Option<oneshot::Sender<()>>,
) -> Result<Disconnect> {
    let (ws_stream, _) = connect_async(config.socket_url()).await?;
    let (mut write, mut read) = ws_stream.split();

    let join = PhoenixMessage::join(&filter.owner_id, config.access_token.as_deref());
    write.send(Message::Text(join.encode()?)).await?;
    wait_for_join(&mut read, config.join_timeout).await?;

    info!("Realtime feed joined for {}", filter.owner_id);
    // A subscriber that stopped waiting may have fetched before the join
    let gave_up = joined.take().map_or(false, |ready| ready.send(()).is_err());
    if *outage || gave_up {
        *outage = false;
        if tx.send(FeedMessage::Resumed).await.is_err() {
            return Ok(Disconnect::Unsubscribed);
        }
    }

    let mut heartbeat = tokio::time::interval(config.heartbeat_interval);
    heartbeat.tick().await;
    let mut next_ref: u64 = 2;

    loop {
        tokio::select! {
            _ = tx.closed() => {
                let leave = PhoenixMessage::leave(next_ref);
                write.send(Message::Text(leave.encode()?)).await.ok();
                write.close().await.ok();
                return Ok(Disconnect::Unsubscribed);
            }

            _ = heartbeat.tick() => {
                let frame = PhoenixMessage::heartbeat(next_ref);
                next_ref += 1;
                write.send(Message::Text(frame.encode()?)).await?;
            }

            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => match classify(&text) {
                        Inbound::Deliver(event) => {
                            if tx.send(FeedMessage::Event(event)).await.is_err() {
                                return Ok(Disconnect::Unsubscribed);
                            }
                        }
                        Inbound::Gap(reason) => {
                            warn!("Realtime change could not be read: {}", reason);
                            if tx.send(FeedMessage::Dropped(reason)).await.is_err()
                                || tx.send(FeedMessage::Resumed).await.is_err()
                            {
                                return Ok(Disconnect::Unsubscribed);
                            }
                        }
                        Inbound::Fail(reason) => bail!("{}", reason),
                        Inbound::Ignore => {}
                    },
                    Some(Ok(Message::Close(_))) | None => return Ok(Disconnect::Closed),
                    Some(Err(e)) => return Err(e.into()),
                    _ => {}
                }
            }
        }
    }
}

/// What to do with one frame received after the join
#[derive(Debug, PartialEq)]
enum Inbound {
    Deliver(ChangeEvent),
    /// A change may have been sent but could not be read
    Gap(String),
    /// The channel is unusable; reconnect
    Fail(String),
    Ignore,
}

fn classify(text: &str) -> Inbound {
    let frame = match PhoenixMessage::decode(text) {
        Ok(frame) => frame,
        Err(e) => return Inbound::Gap(format!("undecodable frame: {}", e)),
    };
    let is_change = frame.event == "postgres_changes";

    match frame.into_server_message() {
        Ok(ServerMessage::Change(event)) => Inbound::Deliver(event),
        Ok(ServerMessage::ChannelClosed(event)) => {
            Inbound::Fail(format!("channel ended by server ({})", event))
        }
        Ok(ServerMessage::System { failed: true, message }) => {
            Inbound::Fail(format!("realtime subscription failed: {}", message))
        }
        Ok(_) => Inbound::Ignore,
        Err(e) if is_change => Inbound::Gap(format!("unreadable change: {}", e)),
        Err(e) => {
            debug!("Ignoring realtime frame: {}", e);
            Inbound::Ignore
        }
    }
}

/// Wait for the reply to our join frame
async fn wait_for_join(read: &mut WsRead, timeout: Duration) -> Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            bail!("Timeout waiting for realtime join reply");
        }

        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let frame = PhoenixMessage::decode(&text)?;
                        if frame.topic != BOOKMARKS_TOPIC {
                            continue;
                        }
                        if let ServerMessage::Reply { reference, ok, response } = frame.into_server_message()? {
                            if reference.as_deref() == Some(JOIN_REF) {
                                if ok {
                                    return Ok(());
                                }
                                bail!("Realtime join rejected: {}", response);
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        bail!("Realtime server closed connection during join");
                    }
                    Some(Err(e)) => bail!("Realtime connection error: {}", e),
                    _ => {}
                }
            }
            _ = tokio::time::sleep(remaining) => {
                bail!("Timeout waiting for realtime join reply");
            }
        }
    }
}
