//! Scripted WebSocket transport for consumer tests

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use futures::stream;
use shuttle::{StreamError, WebSocketClient, WebSocketConnection, WsMessage, WsSink, WsStream};
use url::Url;

/// What the next connection attempt does
pub enum Script {
    /// Connection is refused
    Refuse,
    /// Connection opens, delivers the messages, then the server hangs up
    Deliver(Vec<WsMessage>),
    /// Connection opens, delivers the messages, then stays open silently
    Hold(Vec<WsMessage>),
}

#[derive(Debug, thiserror::Error)]
#[error("connection refused")]
pub struct Refused;

/// Replays one [`Script`] per connection attempt, refusing once they run out
#[derive(Clone, Default)]
pub struct ScriptedClient {
    scripts: Arc<Mutex<VecDeque<Script>>>,
    urls: Arc<Mutex<Vec<Url>>>,
    sent: Arc<Mutex<Vec<WsMessage>>>,
}

impl ScriptedClient {
    pub fn new(scripts: impl IntoIterator<Item = Script>) -> Self {
        Self {
            scripts: Arc::new(Mutex::new(scripts.into_iter().collect())),
            ..Default::default()
        }
    }

    /// URLs of every connection attempt, in order
    pub fn urls(&self) -> Vec<Url> {
        self.urls.lock().unwrap().clone()
    }

    /// Messages the consumer sent to the server
    pub fn sent(&self) -> Vec<WsMessage> {
        self.sent.lock().unwrap().clone()
    }
}

impl WebSocketClient for ScriptedClient {
    type Error = Refused;

    async fn connect(&self, url: Url) -> Result<WebSocketConnection, Refused> {
        self.urls.lock().unwrap().push(url);
        let script = self.scripts.lock().unwrap().pop_front();

        let (messages, hold) = match script {
            None | Some(Script::Refuse) => return Err(Refused),
            Some(Script::Deliver(messages)) => (messages, false),
            Some(Script::Hold(messages)) => (messages, true),
        };

        let delivered = stream::iter(messages.into_iter().map(Ok::<_, StreamError>));
        let rx = if hold {
            WsStream::new(futures::StreamExt::chain(delivered, stream::pending()))
        } else {
            WsStream::new(delivered)
        };

        let sent = self.sent.clone();
        let tx = WsSink::new(futures::sink::unfold(
            sent,
            |sent, message: WsMessage| async move {
                sent.lock().unwrap().push(message);
                Ok::<_, StreamError>(sent)
            },
        ));

        Ok(WebSocketConnection::new(tx, rx))
    }
}

/// One Jetstream commit line
pub fn jetstream_post(did: &str, time_us: i64, rkey: &str) -> WsMessage {
    WsMessage::from(
        serde_json::json!({
            "did": did,
            "time_us": time_us,
            "kind": "commit",
            "commit": {
                "rev": "3l3qo2vutsw2b",
                "operation": "create",
                "collection": "app.bsky.feed.post",
                "rkey": rkey,
                "record": { "$type": "app.bsky.feed.post", "text": "hello" },
                "cid": "bafyreidwaivazkwu67xztlmuobx35hs2lnfh3kolmgfmucldvhd3sgzcqi"
            }
        })
        .to_string(),
    )
}
