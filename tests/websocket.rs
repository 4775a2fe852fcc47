//! End-to-end tests against a WebSocket CDP peer.
//!
//! The peer is a small fake browser served with `tokio-tungstenite`. It
//! answers a handful of methods and emits the target lifecycle events a
//! real browser sends for flattened sessions.

// ============================================================================
// Imports
// ============================================================================

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing_subscriber::EnvFilter;

use cdp_wire::protocol::event::SESSION_DETACHED;
use cdp_wire::{
    CloseCode, ConnectOptions, Connection, ConnectionState, Error, SessionMultiplexer, TargetId,
    TransportEvent, TransportKind,
};

// ============================================================================
// Helpers
// ============================================================================

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_test_writer()
        .try_init();
}

/// Starts a fake browser and returns its endpoint.
async fn spawn_browser() -> Result<String> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr: SocketAddr = listener.local_addr()?;

    tokio::spawn(async move {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
            return;
        };

        while let Some(Ok(message)) = ws.next().await {
            let WsMessage::Text(text) = message else {
                continue;
            };
            let Ok(request) = serde_json::from_str::<Value>(text.as_str()) else {
                continue;
            };

            if request["method"] == "Test.closeSocket" {
                let _ = ws.close(None).await;
                continue;
            }

            for reply in answer(&request) {
                if ws.send(WsMessage::text(reply.to_string())).await.is_err() {
                    return;
                }
            }
        }
    });

    Ok(format!("ws://{addr}/devtools/browser/fake"))
}

/// Replies of the fake browser to one request, in send order.
fn answer(request: &Value) -> Vec<Value> {
    let id = request["id"].clone();
    let method = request["method"].as_str().unwrap_or_default();

    if let Some(session) = request.get("sessionId") {
        return vec![json!({"id": id, "sessionId": session, "result": {"method": method}})];
    }

    match method {
        "Browser.getVersion" => vec![json!({"id": id, "result": {"product": "FakeBrowser/1.0"}})],
        "Target.attachToTarget" => {
            let target = request["params"]["targetId"].as_str().unwrap_or_default();
            let session = format!("S-{target}");
            vec![
                json!({
                    "method": "Target.attachedToTarget",
                    "params": {
                        "sessionId": session,
                        "targetInfo": {
                            "targetId": target,
                            "type": "page",
                            "title": "",
                            "url": "about:blank",
                            "attached": true
                        },
                        "waitingForDebugger": false
                    }
                }),
                json!({"id": id, "result": {"sessionId": session}}),
            ]
        }
        "Target.detachFromTarget" => vec![
            json!({
                "method": "Target.detachedFromTarget",
                "params": {"sessionId": request["params"]["sessionId"]}
            }),
            json!({"id": id, "result": {}}),
        ],
        _ => vec![json!({
            "id": id,
            "error": {"code": -32601, "message": format!("'{method}' wasn't found")}
        })],
    }
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_connection_round_trip() -> Result<()> {
    init_logging();
    let endpoint = spawn_browser().await?;

    let (connection, mut events) = Connection::connect(&endpoint, &ConnectOptions::default()).await?;
    assert_eq!(connection.state(), ConnectionState::Open);

    connection
        .send_text(r#"{"id":1,"method":"Browser.getVersion","params":{}}"#)
        .await?;

    let event = tokio::time::timeout(TEST_TIMEOUT, events.recv())
        .await?
        .context("event stream ended")?;
    match event {
        TransportEvent::Message(text) => {
            let value: Value = serde_json::from_str(&text)?;
            assert_eq!(value["id"], 1);
            assert_eq!(value["result"]["product"], "FakeBrowser/1.0");
        }
        other => panic!("unexpected event: {other:?}"),
    }

    let info = connection.close_with(CloseCode::Normal, "done").await?;
    assert_eq!(info.code, CloseCode::Normal);
    assert!(!info.remote);
    assert_eq!(connection.state(), ConnectionState::Closed);
    Ok(())
}

#[tokio::test]
async fn test_multiplexer_session_lifecycle() -> Result<()> {
    init_logging();
    let endpoint = spawn_browser().await?;

    let mux = SessionMultiplexer::connect(&endpoint, &ConnectOptions::default(), None).await?;
    assert_eq!(mux.transport_kind(), TransportKind::WebSocket);

    let version = mux.root().call("Browser.getVersion", None).await?;
    assert_eq!(version["product"], "FakeBrowser/1.0");

    let target = TargetId::new("T1");
    let page = tokio::time::timeout(TEST_TIMEOUT, mux.create_session(&target)).await??;
    assert_eq!(page.id().map(|id| id.as_str()), Some("S-T1"));
    assert_eq!(page.target_type(), "page");

    let echoed = page.call("Page.enable", None).await?;
    assert_eq!(echoed["method"], "Page.enable");

    match mux.root().call("Nope.missing", None).await {
        Err(Error::Command { code, message, .. }) => {
            assert_eq!(code, -32601);
            assert!(message.contains("Nope.missing"));
        }
        other => panic!("unexpected result: {other:?}"),
    }

    let mut detached = mux.root().subscribe(SESSION_DETACHED);
    page.detach().await?;
    let event = tokio::time::timeout(TEST_TIMEOUT, detached.recv())
        .await?
        .context("no sessiondetached")?;
    assert_eq!(event.params["sessionId"], "S-T1");
    assert!(page.is_closed());
    assert!(mux.sessions().is_empty());

    mux.close().await?;
    assert!(mux.is_closed());
    Ok(())
}

#[tokio::test]
async fn test_server_close_rejects_pending_commands() -> Result<()> {
    init_logging();
    let endpoint = spawn_browser().await?;

    let mux = SessionMultiplexer::connect(&endpoint, &ConnectOptions::default(), None).await?;
    let pending = mux.root().send("Test.closeSocket", None).await?;

    tokio::time::timeout(TEST_TIMEOUT, mux.closed()).await?;
    assert!(mux.root().is_closed());
    assert!(matches!(pending.await, Err(Error::SessionClosed { .. })));
    Ok(())
}
