//! AT Protocol event stream consumer
//!
//! Subscribes to either Jetstream (JSON) or the relay firehose (binary),
//! normalizes both into one [`Event`] model, and fans each event out to the
//! [`Signal`]s whose filters match it.
//!
//! - [`Consumer`]: connection lifecycle, reconnect backoff, cursor persistence
//! - [`Dispatcher`]: filter evaluation and per-signal failure isolation
//! - [`CursorStore`]: where the resume position lives between runs
//!
//! # Example
//!
//! ```no_run
//! use shuttle::{Config, Consumer, Dispatcher, EventKind, FnSignal, Operation};
//!
//! # async fn run() -> miette::Result<()> {
//! let mut dispatcher = Dispatcher::new();
//! dispatcher.register(
//!     FnSignal::new("new-posts", [EventKind::Commit], |event| {
//!         if let Some(commit) = event.commit() {
//!             println!("{} posted {}", event.author_id, commit.record_key);
//!         }
//!         Ok(())
//!     })
//!     .collections(["app.bsky.feed.post"])
//!     .operations([Operation::Create]),
//! )?;
//!
//! let mut consumer = Consumer::from_config(Config::default(), dispatcher)?;
//! let stop = consumer.stop_handle();
//! tokio::spawn(async move {
//!     tokio::signal::ctrl_c().await.ok();
//!     stop.stop();
//! });
//! consumer.run(None).await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod config;
pub mod consumer;
pub mod cursor_store;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod firehose;
pub mod jetstream;
pub mod signal;
pub mod websocket;

pub use config::{
    Config, CursorBackend, CursorConfig, DeferredConfig, ReconnectConfig, StreamVariant,
};
pub use consumer::{Consumer, ConsumerState, Protocol, StopHandle, backoff_delay};
pub use cursor_store::{AnyCursorStore, CursorStore, FileCursorStore, MemoryCursorStore};
pub use dispatch::{DeferredDispatcher, DispatchSummary, Dispatcher, TaskDispatcher, run_signal};
pub use error::{
    BoxError, ConfigError, ConsumerError, CursorStoreError, DispatchError, EventDecodeError,
    StreamError, StreamErrorKind,
};
pub use event::{Account, Commit, Event, EventKind, EventPayload, Identity, Operation};
pub use signal::{CollectionFilter, FnSignal, QueueMode, Registration, Signal, collection_matches};
pub use websocket::{
    CloseFrame, WebSocketClient, WebSocketConnection, WsMessage, WsSink, WsStream,
};
