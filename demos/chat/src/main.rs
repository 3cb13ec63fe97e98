use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tether::prelude::*;
use tether::telemetry;

const ADDRESS: &str = "127.0.0.1";
const PORT: u16 = 7777;

/// Host settings as an application would keep them on disk.
const HOST_CONFIG: &str = r#"{
    "local_name": "host",
    "rpc": { "default_timeout": { "secs": 10, "nanos": 0 } },
    "stats": { "sample_interval": { "secs": 1, "nanos": 0 } }
}"#;

// ---------------------------------------------------------------------------
// Chat types
// ---------------------------------------------------------------------------

/// One chat line. Has no registered codec, so it travels as JSON.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct ChatLine {
    from: String,
    text: String,
}

// ---------------------------------------------------------------------------
// Host
// ---------------------------------------------------------------------------

fn build_host(hub: &MemoryHub, config: TetherConfig) -> Node {
    let (transport, events) = hub.endpoint();
    let host = Node::new(config, Arc::new(transport), events);

    let codec = Arc::clone(host.codec());
    host.register_request_handler(RequestKind::Ping, move |req| {
        let n: i32 = req.payload.get(&codec, "n").unwrap_or(0);
        Ok(Some(
            Response::reply(req, ResponseCode::Success, "pong").with(&codec, "n", &(n + 1)),
        ))
    });

    let codec = Arc::clone(host.codec());
    let outlet = host.outlet();
    host.register_request_handler(RequestKind::Chat, move |req| {
        let text: String = req.payload.get(&codec, "text").unwrap_or_default();
        if text.trim().is_empty() {
            return Err("empty chat line".into());
        }
        let line = ChatLine {
            from: req.sender_id.clone(),
            text,
        };
        let mut echo = Response::new(RequestId::generate(), ResponseCode::Success, "chat")
            .with(&codec, "line", &line);
        echo.kind = Some(RequestKind::Chat);
        let delivered = outlet.broadcast(&echo);
        tracing::info!(from = %line.from, delivered, "chat relayed");
        Ok(None)
    });

    host
}

fn build_client(hub: &MemoryHub, name: &str) -> Node {
    let (transport, events) = hub.endpoint();
    let client = Node::new(
        TetherConfig::default().with_local_name(name),
        Arc::new(transport),
        events,
    );

    let codec = Arc::clone(client.codec());
    let me = name.to_string();
    client.register_response_handler(RequestKind::Chat, move |response| {
        let line: ChatLine = response.payload.get(&codec, "line").unwrap_or_default();
        println!("[{me}] {}: {}", line.from, line.text);
    });

    client
}

fn chat(node: &Node, text: &str) -> Result<(), TetherError> {
    let request = Request::new(RequestKind::Chat).with(node.codec(), "text", &text.to_string());
    node.send(request, None, None)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    telemetry::init_tracing("info,tether=debug");

    let hub = MemoryHub::new();
    let host = build_host(&hub, TetherConfig::from_json(HOST_CONFIG)?);
    host.start_host(ADDRESS, PORT)?;

    let alice = build_client(&hub, "alice");
    let bob = build_client(&hub, "bob");
    alice.start_client(ADDRESS, PORT)?;
    bob.start_client(ADDRESS, PORT)?;
    println!("host {:?}, alice {:?}, bob {:?}", host.current_state(), alice.current_state(), bob.current_state());

    let ping = Request::new(RequestKind::Ping).with(alice.codec(), "n", &41i32);
    let pong = alice.request(ping, None).await;
    let n: Option<i32> = pong.payload.get(alice.codec(), "n");
    println!("ping -> {} {:?} (n = {n:?})", pong.code, pong.message);

    chat(&alice, "hello from alice")?;
    chat(&bob, "hi alice")?;

    let missing = bob.request(Request::new(RequestKind::Inventory), None).await;
    println!("inventory -> {} {:?}", missing.code, missing.message);

    tokio::time::sleep(Duration::from_millis(1200)).await;
    println!("alice stats: {}", serde_json::to_string(&alice.stats())?);
    println!("host stats:  {}", serde_json::to_string(&host.stats())?);

    for record in host.recent_errors(10) {
        println!("host error: {record}");
    }

    bob.disconnect();
    alice.disconnect();
    host.disconnect();
    println!("host {:?}", host.current_state());
    Ok(())
}
