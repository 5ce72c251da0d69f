//! Stream consumer
//!
//! One [`Consumer`] owns one connection at a time. Messages are read, decoded
//! and dispatched serially, so dispatch order is cursor order. The cursor is
//! persisted after each event is dispatched, which makes redelivery after a
//! crash possible but never skips an event.
//!
//! ```text
//! Idle -> Connecting -> Connected -> Closing -> Idle
//!             ^             |
//!             |             v
//!             +------ Reconnecting -> Failed
//! ```

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use smol_str::SmolStr;
use tokio::sync::watch;
use url::Url;

use crate::config::{Config, StreamVariant};
use crate::cursor_store::{AnyCursorStore, CursorStore};
use crate::dispatch::{Dispatcher, TaskDispatcher};
use crate::error::{BoxError, ConfigError, ConsumerError, CursorStoreError, EventDecodeError};
use crate::event::Event;
use crate::firehose;
use crate::jetstream::{self, JetstreamParams};
use crate::websocket::tungstenite_client::TungsteniteClient;
use crate::websocket::{CloseFrame, WebSocketClient, WebSocketConnection, WsMessage};

/// NSID of the firehose subscription endpoint
pub const SUBSCRIBE_REPOS: &str = "com.atproto.sync.subscribeRepos";

/// Delay before reconnect attempt `attempt` (1-based)
///
/// `min(base * 2^(attempt - 1), max)`
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    base.checked_mul(1u32 << exponent)
        .map_or(max, |delay| delay.min(max))
}

/// Lifecycle state of a [`Consumer`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConsumerState {
    /// Not running
    #[default]
    Idle,
    /// Opening a connection
    Connecting,
    /// Reading messages
    Connected,
    /// Waiting out the backoff before reconnect attempt `attempt`
    Reconnecting {
        /// 1-based attempt number
        attempt: u32,
    },
    /// Stop requested, closing the connection
    Closing,
    /// Reconnect attempts exhausted
    Failed,
}

/// Cloneable handle that stops a running consumer
///
/// Stopping is idempotent and may happen before the consumer starts, in
/// which case `run` returns immediately. A stop is permanent: the flag is
/// never cleared, so every later `run` on the same consumer returns `Ok(())`
/// without connecting.
#[derive(Debug, Clone)]
pub struct StopHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    /// Request a stop
    pub fn stop(&self) {
        if !self.tx.send_replace(true) {
            tracing::info!("stop requested");
        }
    }

    /// Whether a stop has been requested
    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Wire protocol of a subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Protocol {
    /// Jetstream JSON stream rooted at `base`
    Jetstream {
        /// Instance URL, with or without the `/subscribe` path
        base: Url,
    },
    /// Firehose binary stream from relay `host`
    Firehose {
        /// Bare hostname
        host: SmolStr,
    },
}

impl Protocol {
    /// Protocol selected by `config`
    pub fn from_config(config: &Config) -> Self {
        match config.variant {
            StreamVariant::Jetstream => Protocol::Jetstream {
                base: config.jetstream_url.clone(),
            },
            StreamVariant::Firehose => Protocol::Firehose {
                host: config.firehose_host.clone(),
            },
        }
    }

    /// Variant this protocol speaks
    pub fn variant(&self) -> StreamVariant {
        match self {
            Protocol::Jetstream { .. } => StreamVariant::Jetstream,
            Protocol::Firehose { .. } => StreamVariant::Firehose,
        }
    }

    /// Subscription URL for `cursor`, narrowed to what `dispatcher` can use
    pub fn subscription_url(
        &self,
        cursor: Option<i64>,
        dispatcher: &Dispatcher,
    ) -> Result<Url, ConfigError> {
        match self {
            Protocol::Jetstream { base } => {
                let params = JetstreamParams {
                    wanted_collections: dispatcher.wanted_collections(),
                    wanted_dids: dispatcher.wanted_dids(),
                    cursor,
                };
                params
                    .subscription_url(base)
                    .map_err(|_| ConfigError::InvalidEndpoint(base.to_string()))
            }
            Protocol::Firehose { host } => {
                let mut url = Url::parse(&format!("wss://{}/xrpc/{}", host.trim(), SUBSCRIBE_REPOS))
                    .map_err(|_| ConfigError::InvalidEndpoint(host.to_string()))?;
                if let Some(cursor) = cursor {
                    url.query_pairs_mut()
                        .append_pair("cursor", &cursor.to_string());
                }
                Ok(url)
            }
        }
    }

    /// Decode one data message into events
    pub fn decode(&self, message: &WsMessage) -> Result<Vec<Event>, EventDecodeError> {
        match (self, message) {
            (Protocol::Jetstream { .. }, WsMessage::Text(text)) => {
                Ok(vec![jetstream::decode_message(text)?])
            }
            (Protocol::Firehose { .. }, WsMessage::Binary(frame)) => firehose::decode_frame(frame),
            (Protocol::Jetstream { .. }, WsMessage::Binary(_)) => {
                Err(EventDecodeError::UnexpectedMessage("binary"))
            }
            (Protocol::Firehose { .. }, WsMessage::Text(_)) => {
                Err(EventDecodeError::UnexpectedMessage("text"))
            }
            (_, WsMessage::Close(_)) => Ok(Vec::new()),
        }
    }
}

/// Whatever identifying fields an undecodable message still carries
#[derive(Debug, Default, PartialEq)]
struct MessageContext {
    did: Option<SmolStr>,
    kind: Option<SmolStr>,
    collection: Option<SmolStr>,
}

impl MessageContext {
    fn of(message: &WsMessage) -> Self {
        match message {
            WsMessage::Text(text) => Self::from_json(text),
            WsMessage::Binary(frame) => Self::from_frame(frame),
            WsMessage::Close(_) => Self::default(),
        }
    }

    fn from_json(text: &str) -> Self {
        let Ok(value) = serde_json::from_str::<serde_json::Value>(text) else {
            return Self::default();
        };
        let field = |v: &serde_json::Value, key: &str| v.get(key)?.as_str().map(SmolStr::new);
        Self {
            did: field(&value, "did"),
            kind: field(&value, "kind"),
            collection: value.get("commit").and_then(|c| field(c, "collection")),
        }
    }

    fn from_frame(frame: &[u8]) -> Self {
        use shuttle_common::cbor;

        let Ok((header, used)) = cbor::decode_prefix(frame) else {
            return Self::default();
        };
        let mut context = Self {
            kind: header
                .get("t")
                .and_then(|t| t.as_str())
                .map(|t| SmolStr::new(t.trim_start_matches('#'))),
            ..Self::default()
        };
        let Some(Ok((payload, _))) = frame.get(used..).map(cbor::decode_prefix) else {
            return context;
        };
        context.did = payload
            .get("repo")
            .or_else(|| payload.get("did"))
            .and_then(|v| v.as_str())
            .map(SmolStr::new);
        context.collection = payload
            .get("ops")
            .and_then(|ops| ops.as_array()?.first()?.get("path")?.as_str())
            .and_then(|path| path.split_once('/'))
            .map(|(collection, _)| SmolStr::new(collection));
        context
    }
}

/// How one connection ended
enum Session {
    Stopped,
    Closed(Option<BoxError>),
}

/// Event stream consumer
///
/// Generic over the WebSocket transport and the cursor store so both can be
/// swapped; [`Consumer::from_config`] picks the defaults.
pub struct Consumer<C, S> {
    protocol: Protocol,
    config: Config,
    client: C,
    store: S,
    dispatcher: Dispatcher,
    state: watch::Sender<ConsumerState>,
    stop: Arc<watch::Sender<bool>>,
}

impl Consumer<TungsteniteClient, AnyCursorStore> {
    /// Consumer over tokio-tungstenite with the configured cursor backend
    ///
    /// Attaches a [`TaskDispatcher`] sized by `config.deferred` unless the
    /// dispatcher already has one.
    pub fn from_config(config: Config, dispatcher: Dispatcher) -> Result<Self, ConfigError> {
        config.validate()?;
        let store = AnyCursorStore::from_config(&config.cursor)?;
        let dispatcher = if dispatcher.has_deferred() {
            dispatcher
        } else {
            dispatcher.with_deferred(TaskDispatcher::new(
                config.deferred.queue.clone(),
                config.deferred.max_concurrency,
            ))
        };
        Ok(Self::new(config, dispatcher, TungsteniteClient::new(), store))
    }
}

impl<C, S> Consumer<C, S>
where
    C: WebSocketClient,
    S: CursorStore,
{
    /// Create a consumer from its parts
    pub fn new(config: Config, dispatcher: Dispatcher, client: C, store: S) -> Self {
        let (state, _) = watch::channel(ConsumerState::Idle);
        let (stop, _) = watch::channel(false);
        Self {
            protocol: Protocol::from_config(&config),
            config,
            client,
            store,
            dispatcher,
            state,
            stop: Arc::new(stop),
        }
    }

    /// Handle for stopping this consumer from another task
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            tx: self.stop.clone(),
        }
    }

    /// Request a stop
    pub fn stop(&self) {
        self.stop_handle().stop();
    }

    /// Observe lifecycle state changes
    pub fn state(&self) -> watch::Receiver<ConsumerState> {
        self.state.subscribe()
    }

    /// Protocol in use
    pub fn protocol(&self) -> &Protocol {
        &self.protocol
    }

    /// Registered signals
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Cursor store
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Consume until stopped or reconnection is exhausted
    ///
    /// `cursor` overrides the stored cursor for the first connection; `Some(0)`
    /// starts from the live tip without consulting the store.
    ///
    /// A consumer cannot be restarted after [`stop`](Self::stop). Once stopped,
    /// `run` returns `Ok(())` at once without connecting; build a new consumer
    /// to resume from the stored cursor.
    pub async fn run(&mut self, cursor: Option<i64>) -> Result<(), ConsumerError> {
        self.config.validate()?;
        self.dispatcher.validate()?;

        let mut stop = self.stop.subscribe();
        if *stop.borrow_and_update() {
            tracing::debug!("consumer stopped before start");
            return Ok(());
        }

        let variant = self.protocol.variant();
        let max_attempts = self.config.reconnect.max_attempts;
        let mut attempts: u32 = 0;
        let mut last_cursor: Option<i64> = None;
        let mut first = true;

        loop {
            let resolved = self.resolve_cursor(cursor, last_cursor, first).await?;
            first = false;
            let url = self.protocol.subscription_url(resolved, &self.dispatcher)?;

            self.set_state(ConsumerState::Connecting);
            tracing::info!(%variant, %url, cursor = ?resolved, "connecting");

            let connected = tokio::select! {
                biased;
                _ = stopped(&mut stop) => break,
                result = self.client.connect(url) => result,
            };

            let failure = match connected {
                Ok(connection) => {
                    attempts = 0;
                    self.set_state(ConsumerState::Connected);
                    tracing::info!(%variant, "connected");
                    match self.consume(connection, &mut stop, &mut last_cursor).await {
                        Session::Stopped => break,
                        Session::Closed(failure) => failure,
                    }
                }
                Err(error) => {
                    tracing::warn!(%variant, %error, "connection failed");
                    Some(Box::new(error) as BoxError)
                }
            };

            attempts += 1;
            if attempts > max_attempts {
                self.set_state(ConsumerState::Failed);
                tracing::error!(%variant, attempts = max_attempts, "reconnect attempts exhausted");
                return Err(ConsumerError::Connection {
                    attempts: max_attempts,
                    source: failure,
                });
            }

            let delay = backoff_delay(
                attempts,
                self.config.reconnect.base_delay,
                self.config.reconnect.max_delay,
            );
            self.set_state(ConsumerState::Reconnecting { attempt: attempts });
            tracing::warn!(
                %variant,
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                "reconnecting"
            );
            tokio::select! {
                biased;
                _ = stopped(&mut stop) => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.set_state(ConsumerState::Idle);
        tracing::info!(%variant, "consumer stopped");
        Ok(())
    }

    async fn resolve_cursor(
        &self,
        explicit: Option<i64>,
        last: Option<i64>,
        first: bool,
    ) -> Result<Option<i64>, CursorStoreError> {
        if last.is_some() {
            return Ok(last);
        }
        match explicit {
            Some(0) if first => Ok(None),
            Some(cursor) if cursor != 0 => Ok(Some(cursor)),
            _ => self.store.get().await,
        }
    }

    async fn consume(
        &self,
        connection: WebSocketConnection,
        stop: &mut watch::Receiver<bool>,
        last_cursor: &mut Option<i64>,
    ) -> Session {
        let (tx, rx) = connection.split();
        let mut tx = tx.into_inner();
        let mut rx = rx.into_inner();

        loop {
            let next = tokio::select! {
                biased;
                _ = stopped(stop) => {
                    self.set_state(ConsumerState::Closing);
                    let close = CloseFrame::new(CloseFrame::NORMAL, "consumer stopped");
                    if let Err(error) = tx.send(WsMessage::Close(Some(close))).await {
                        tracing::debug!(%error, "close frame not sent");
                    }
                    return Session::Stopped;
                }
                next = rx.next() => next,
            };

            let message = match next {
                None => {
                    tracing::info!("connection closed");
                    return Session::Closed(None);
                }
                Some(Err(error)) => {
                    tracing::warn!(%error, "connection error");
                    return Session::Closed(Some(Box::new(error)));
                }
                Some(Ok(WsMessage::Close(frame))) => {
                    tracing::info!(
                        code = frame.as_ref().map(|f| f.code),
                        reason = frame.as_ref().map(|f| f.reason.as_str()),
                        "server closed connection"
                    );
                    return Session::Closed(None);
                }
                Some(Ok(message)) => message,
            };

            let events = match self.protocol.decode(&message) {
                Ok(events) => events,
                Err(error) => {
                    let context = MessageContext::of(&message);
                    tracing::warn!(
                        %error,
                        did = context.did.as_deref(),
                        kind = context.kind.as_deref(),
                        collection = context.collection.as_deref(),
                        "skipping undecodable message"
                    );
                    continue;
                }
            };

            for event in events {
                let cursor = event.time_us;
                let event = Arc::new(event);
                let summary = self.dispatcher.dispatch(&event);
                tracing::trace!(
                    did = %event.author_id,
                    kind = %event.kind(),
                    cursor,
                    matched = summary.matched,
                    "dispatched"
                );
                *last_cursor = Some(cursor);
                if let Err(error) = self.store.set(cursor).await {
                    tracing::warn!(cursor, %error, "failed to persist cursor");
                }
            }
        }
    }

    fn set_state(&self, state: ConsumerState) {
        self.state.send_replace(state);
    }
}

impl<C, S> std::fmt::Debug for Consumer<C, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("protocol", &self.protocol)
            .field("state", &*self.state.borrow())
            .field("dispatcher", &self.dispatcher)
            .finish_non_exhaustive()
    }
}

async fn stopped(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stopped| *stopped).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;
    use crate::signal::FnSignal;

    #[test]
    fn backoff_doubles_then_caps() {
        let base = Duration::from_secs(5);
        let max = Duration::from_secs(60);
        let delays: Vec<u64> = (1..=6)
            .map(|attempt| backoff_delay(attempt, base, max).as_secs())
            .collect();
        assert_eq!(delays, vec![5, 10, 20, 40, 60, 60]);
        assert_eq!(backoff_delay(u32::MAX, base, max), max);
    }

    #[test]
    fn jetstream_url_follows_registrations() {
        let mut dispatcher = Dispatcher::new();
        dispatcher
            .register(
                FnSignal::new("feed", [EventKind::Commit], |_| Ok(()))
                    .collections(["app.bsky.feed.*"]),
            )
            .unwrap();
        let protocol = Protocol::from_config(&Config::default());

        let url = protocol.subscription_url(Some(1725519626134432), &dispatcher).unwrap();
        assert_eq!(
            url.as_str(),
            "wss://jetstream2.us-east.bsky.network/subscribe?cursor=1725519626134432&wantedCollections=app.bsky.feed.*"
        );

        dispatcher
            .register(FnSignal::new("all", [EventKind::Commit], |_| Ok(())))
            .unwrap();
        let url = protocol.subscription_url(None, &dispatcher).unwrap();
        assert_eq!(url.as_str(), "wss://jetstream2.us-east.bsky.network/subscribe");
    }

    #[test]
    fn firehose_url() {
        let config = Config::new()
            .variant(StreamVariant::Firehose)
            .firehose_host("relay.example.com")
            .build();
        let protocol = Protocol::from_config(&config);
        let dispatcher = Dispatcher::new();

        assert_eq!(
            protocol.subscription_url(None, &dispatcher).unwrap().as_str(),
            "wss://relay.example.com/xrpc/com.atproto.sync.subscribeRepos"
        );
        assert_eq!(
            protocol.subscription_url(Some(42), &dispatcher).unwrap().as_str(),
            "wss://relay.example.com/xrpc/com.atproto.sync.subscribeRepos?cursor=42"
        );
    }

    #[test]
    fn messages_must_match_protocol() {
        let jetstream = Protocol::from_config(&Config::default());
        assert!(matches!(
            jetstream.decode(&WsMessage::Binary(vec![0xa0].into())),
            Err(EventDecodeError::UnexpectedMessage("binary"))
        ));
        assert!(matches!(
            jetstream.decode(&WsMessage::from("{not json")),
            Err(EventDecodeError::Json(_))
        ));

        let firehose = Protocol::Firehose {
            host: "bsky.network".into(),
        };
        assert!(matches!(
            firehose.decode(&WsMessage::from("{}")),
            Err(EventDecodeError::UnexpectedMessage("text"))
        ));
    }

    #[test]
    fn undecodable_jetstream_message_keeps_identifying_fields() {
        // commit without rev or operation
        let text = r#"{"did":"did:plc:abc","time_us":1,"kind":"commit","commit":{"collection":"app.bsky.feed.post"}}"#;
        let jetstream = Protocol::from_config(&Config::default());
        let message = WsMessage::from(text);
        assert!(jetstream.decode(&message).is_err());

        assert_eq!(
            MessageContext::of(&message),
            MessageContext {
                did: Some("did:plc:abc".into()),
                kind: Some("commit".into()),
                collection: Some("app.bsky.feed.post".into()),
            }
        );
        assert_eq!(
            MessageContext::of(&WsMessage::from("{not json")),
            MessageContext::default()
        );
    }

    #[test]
    fn undecodable_firehose_frame_keeps_identifying_fields() {
        use ipld_core::ipld::Ipld;
        use std::collections::BTreeMap;

        let header = Ipld::Map(BTreeMap::from([
            ("op".to_string(), Ipld::Integer(1)),
            ("t".to_string(), Ipld::String("#commit".into())),
        ]));
        let op = Ipld::Map(BTreeMap::from([(
            "path".to_string(),
            Ipld::String("app.bsky.feed.like/3k".into()),
        )]));
        // commit without seq, rev or blocks
        let payload = Ipld::Map(BTreeMap::from([
            ("repo".to_string(), Ipld::String("did:plc:xyz".into())),
            ("ops".to_string(), Ipld::List(vec![op])),
        ]));
        let mut frame = serde_ipld_dagcbor::to_vec(&header).unwrap();
        frame.extend(serde_ipld_dagcbor::to_vec(&payload).unwrap());

        let firehose = Protocol::Firehose {
            host: "bsky.network".into(),
        };
        let message = WsMessage::Binary(frame.into());
        assert!(firehose.decode(&message).is_err());

        assert_eq!(
            MessageContext::of(&message),
            MessageContext {
                did: Some("did:plc:xyz".into()),
                kind: Some("commit".into()),
                collection: Some("app.bsky.feed.like".into()),
            }
        );

        // header only
        let truncated = serde_ipld_dagcbor::to_vec(&header).unwrap();
        assert_eq!(
            MessageContext::of(&WsMessage::Binary(truncated.into())),
            MessageContext {
                kind: Some("commit".into()),
                ..MessageContext::default()
            }
        );
    }

    #[test]
    fn stop_handle_is_idempotent() {
        let (tx, _) = watch::channel(false);
        let handle = StopHandle { tx: Arc::new(tx) };
        assert!(!handle.is_stopped());
        handle.stop();
        handle.clone().stop();
        assert!(handle.is_stopped());
    }
}
