//! PubNub subscribe/presence client over HTTP long-polling.
//!
//! Implements the long-running half of the PubNub client: a multiplexed
//! subscription to any set of channels and channel groups, delivered to
//! application listeners in order, with presence heartbeats and automatic
//! reconnection.
//!
//! # Features
//! - Long-poll subscribe loop with timetoken/region cursor tracking
//! - Channel-set changes applied mid-flight without losing the cursor
//! - Linear or exponential reconnection backoff with a retry cap
//! - Independent presence heartbeat worker and best-effort leave
//! - Listener fan-out with bounded, ordered per-listener queues
//! - One-shot REST endpoints (grant, push provisions) over the same transport
//!
//! # Example
//! ```no_run
//! # async fn example() -> Result<(), pubnub_subscriber::Error> {
//! use pubnub_subscriber::{Config, Event, SubscribeOperation, Subscriber};
//!
//! let config = Config::new("sub-c-my-key", "my-user");
//! let subscriber = Subscriber::with_http(config)?;
//! let mut listener = subscriber.add_listener();
//!
//! subscriber
//!     .subscribe(SubscribeOperation::channels(["my-channel"]).with_presence())
//!     .await?;
//!
//! while let Some(event) = listener.next().await {
//!     match event {
//!         Event::Message(msg) => println!("{}: {}", msg.channel, msg.payload),
//!         Event::Presence(p) => println!("{:?} on {}", p.action, p.channel),
//!         Event::Status(s) => println!("status: {:?}", s.category),
//!     }
//! }
//! # Ok(())
//! # }
//! ```

mod config;
mod connection;
mod heartbeat;
mod listener;
pub mod protocol;
mod reconnect;
pub mod rest;
mod state;
mod subscribe;
mod transport;
mod types;

pub use config::{Config, DEFAULT_ORIGIN, HeartbeatNotifications, TimingConfig};
pub use connection::LoopState;
pub use listener::{Listener, ListenerId};
pub use reconnect::{FailureKind, ReconnectionPolicy, ReconnectionState, RetryDecision};
pub use state::Cursor;
pub use subscribe::Subscriber;
pub use transport::{
    HttpTransport, Method, Request, Response, Transport, TransportError, TransportErrorKind,
};
pub use types::{
    Error, Event, Message, MessageKind, Operation, Presence, PresenceAction, Status,
    StatusCategory, SubscribeEnvelope, SubscribeOperation, UnsubscribeOperation,
};
