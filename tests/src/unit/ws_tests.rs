use super::{eventually, message_json};
use campus_core::protocol::{Frame, EVENT_NEW_MESSAGE};
use campus_core::{ConnectionState, RealtimeChannel, WsConnector};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;

async fn next_frame(ws: &mut WebSocketStream<TcpStream>) -> Frame {
    loop {
        match ws.next().await {
            Some(Ok(WsMessage::Text(text))) => return Frame::decode(&text).expect("frame"),
            Some(Ok(_)) => continue,
            other => panic!("socket ended early: {other:?}"),
        }
    }
}

#[tokio::test]
async fn websocket_link_authenticates_and_relays_frames() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let (seen_tx, seen_rx) = oneshot::channel::<(Option<String>, Frame, Frame)>();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        let header = Arc::new(Mutex::new(None));
        let captured = header.clone();
        let capture = move |req: &Request, res: Response| -> Result<Response, ErrorResponse> {
            *captured.lock() = req
                .headers()
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            Ok(res)
        };
        let mut ws = tokio_tungstenite::accept_hdr_async(stream, capture)
            .await
            .expect("handshake");

        let auth = next_frame(&mut ws).await;
        let joined = next_frame(&mut ws).await;

        let push = Frame::new(
            EVENT_NEW_MESSAGE,
            message_json("m-1", "teacher-1", "parent-1", "hello over the wire"),
        )
        .encode()
        .expect("encode");
        ws.send(WsMessage::Text(push)).await.expect("push");
        let _ = seen_tx.send((header.lock().clone(), auth, joined));
        ws.close(None).await.ok();
    });

    let channel = RealtimeChannel::new(Arc::new(WsConnector::new(format!("ws://{addr}/ws"))));
    let received = Arc::new(Mutex::new(Vec::new()));
    {
        let received = received.clone();
        channel.on_new_message(move |message| received.lock().push(message.content));
    }
    let reasons = Arc::new(Mutex::new(Vec::new()));
    {
        let reasons = reasons.clone();
        channel.on_disconnect(move |reason| reasons.lock().push(reason));
    }

    channel.connect("ws-token").await.expect("connect");
    channel.join_conversation("teacher-1").expect("join");

    let (header, auth, joined) = seen_rx.await.expect("server report");
    assert_eq!(header.as_deref(), Some("Bearer ws-token"));
    assert_eq!(auth.event, "auth");
    assert_eq!(auth.data, json!({ "token": "ws-token" }));
    assert_eq!(joined.event, "joinConversation");
    assert_eq!(joined.data, json!({ "otherUserId": "teacher-1" }));

    assert!(eventually(|| received.lock().len() == 1).await);
    assert_eq!(received.lock()[0], "hello over the wire");

    assert!(eventually(|| channel.status().state == ConnectionState::Disconnected).await);
    assert_eq!(reasons.lock().len(), 1);
    server.await.expect("server task");
}

#[tokio::test]
async fn unreachable_server_fails_to_connect() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let channel = RealtimeChannel::new(Arc::new(WsConnector::new(format!("ws://{addr}/ws"))));
    assert!(channel.connect("token").await.is_err());
    assert_eq!(channel.status().state, ConnectionState::Disconnected);
    assert!(channel.status().last_error.is_some());
}
