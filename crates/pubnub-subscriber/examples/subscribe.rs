//! Subscribe to channels and print what arrives.
//!
//! ```sh
//! PUBNUB_SUBSCRIBE_KEY=sub-c-... cargo run -p pubnub-subscriber --example subscribe \
//!     -- <CHANNEL>[,<CHANNEL>...] [USER_ID]
//! ```
//!
//! Set `PUBNUB_AUTH_KEY` when access manager is enabled on the keyset and
//! `PUBNUB_ORIGIN` to point at another host. Message payloads are printed to
//! stdout (pipe to `jq` for formatting); status and presence go to stderr.

use pubnub_subscriber::{Config, Event, StatusCategory, SubscribeOperation, Subscriber};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let channels = args
        .first()
        .ok_or("usage: subscribe <CHANNEL>[,<CHANNEL>...] [USER_ID]")?;
    let user_id = args.get(1).cloned().unwrap_or_else(|| "example-subscriber".to_string());
    let subscribe_key =
        std::env::var("PUBNUB_SUBSCRIBE_KEY").map_err(|_| "PUBNUB_SUBSCRIBE_KEY is not set")?;

    let mut config = Config::new(subscribe_key, user_id);
    config.auth_key = std::env::var("PUBNUB_AUTH_KEY").ok();
    if let Ok(origin) = std::env::var("PUBNUB_ORIGIN") {
        config.origin = origin;
    }

    let sub = Subscriber::with_http(config)?;
    let mut listener = sub.add_listener();
    let channels: Vec<&str> = channels.split(',').filter(|c| !c.is_empty()).collect();
    eprintln!("subscribing to {channels:?} ...");
    sub.subscribe(SubscribeOperation::channels(channels).with_presence())
        .await?;

    loop {
        let event = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = listener.next() => event,
        };
        let Some(event) = event else { break };
        match event {
            Event::Message(msg) => {
                eprintln!(
                    "[{:?}] channel={} tt={} from={}",
                    msg.kind,
                    msg.channel,
                    msg.timetoken,
                    msg.publisher.as_deref().unwrap_or("-"),
                );
                println!("{}", msg.payload);
            }
            Event::Presence(p) => {
                eprintln!(
                    "[presence] {:?} channel={} uuid={} occupancy={}",
                    p.action,
                    p.channel,
                    p.uuid.as_deref().unwrap_or("-"),
                    p.occupancy,
                );
            }
            Event::Status(status) => {
                eprintln!(
                    "[status] {:?} {:?} {}",
                    status.category,
                    status.operation,
                    status.error.as_deref().unwrap_or(""),
                );
                if matches!(
                    status.category,
                    StatusCategory::AccessDenied | StatusCategory::BadRequest
                ) {
                    break;
                }
            }
        }
    }

    sub.close().await;
    Ok(())
}
