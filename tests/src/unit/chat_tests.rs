use super::{eventually, message_json, profile, signed_in_client};
use campus_core::connector::MemoryPeer;
use campus_core::protocol::{
    EVENT_CONNECT, EVENT_DISCONNECT, EVENT_MESSAGE_SENT, EVENT_NEW_MESSAGE, EVENT_USER_OFFLINE,
    EVENT_USER_ONLINE, EVENT_USER_TYPING,
};
use campus_core::{CampusClient, ChatStore, TransportError};
use serde_json::json;
use std::time::Duration;
use tempfile::TempDir;
use wiremock::matchers::{body_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const ME: &str = "parent-1";
const TEACHER: &str = "teacher-1";

struct Harness {
    _dir: TempDir,
    client: CampusClient,
    chat: ChatStore,
    peer: MemoryPeer,
}

async fn connected(server: &MockServer) -> Harness {
    let dir = TempDir::new().expect("temp dir");
    let (client, connector) = signed_in_client(server, &dir, profile(ME, "Pat"));
    let chat = client.open_chat().expect("chat");
    client.connect_realtime().await.expect("connect");
    let peer = connector.latest().expect("peer");
    Harness {
        _dir: dir,
        client,
        chat,
        peer,
    }
}

fn ids(chat: &ChatStore, other: &str) -> Vec<String> {
    chat.messages(other).into_iter().map(|m| m.id).collect()
}

fn contents(chat: &ChatStore, other: &str) -> Vec<String> {
    chat.messages(other).into_iter().map(|m| m.content).collect()
}

fn joined(peer: &MemoryPeer, other: &str) -> bool {
    peer.received()
        .iter()
        .any(|f| f.event == "joinConversation" && f.data == json!({ "otherUserId": other }))
}

#[tokio::test]
async fn realtime_messages_keep_arrival_order() {
    let server = MockServer::start().await;
    let h = connected(&server).await;

    h.peer
        .push(EVENT_NEW_MESSAGE, message_json("m-1", TEACHER, ME, "hello"));
    h.peer.push(
        EVENT_NEW_MESSAGE,
        message_json("m-2", TEACHER, ME, "how are you"),
    );

    assert!(eventually(|| h.chat.messages(TEACHER).len() == 2).await);
    assert_eq!(contents(&h.chat, TEACHER), vec!["hello", "how are you"]);
    // Keyed by counterpart, never by the receiver id.
    assert!(h.chat.messages(ME).is_empty());
}

#[tokio::test]
async fn history_fetch_keeps_messages_that_arrive_meanwhile() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("/api/messages/{TEACHER}")))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!([
                    message_json("m-1", TEACHER, ME, "first"),
                    message_json("m-2", ME, TEACHER, "second"),
                ]))
                .set_delay(Duration::from_millis(300)),
        )
        .expect(1)
        .mount(&server)
        .await;
    let h = connected(&server).await;

    let (fetched, _) = tokio::join!(h.chat.fetch_messages(TEACHER), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        h.peer
            .push(EVENT_NEW_MESSAGE, message_json("m-2", ME, TEACHER, "second"));
        h.peer
            .push(EVENT_NEW_MESSAGE, message_json("m-3", TEACHER, ME, "third"));
        assert!(eventually(|| h.chat.messages(TEACHER).len() == 2).await);
    });

    let fetched: Vec<String> = fetched
        .expect("history")
        .into_iter()
        .map(|m| m.id)
        .collect();
    assert_eq!(fetched, vec!["m-1", "m-2", "m-3"]);
    assert_eq!(ids(&h.chat, TEACHER), vec!["m-1", "m-2", "m-3"]);
    assert!(!h.chat.is_loading());
}

#[tokio::test]
async fn send_replaces_the_optimistic_copy() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/messages"))
        .and(body_json(json!({ "receiverId": TEACHER, "content": "on my way" })))
        .respond_with(
            ResponseTemplate::new(201)
                .set_body_json(message_json("m-9", ME, TEACHER, "on my way"))
                .set_delay(Duration::from_millis(200)),
        )
        .expect(1)
        .mount(&server)
        .await;
    let h = connected(&server).await;

    let (sent, _) = tokio::join!(h.chat.send_message(TEACHER, "on my way"), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let pending = h.chat.messages(TEACHER);
        assert_eq!(pending.len(), 1);
        assert!(pending[0].is_local());
    });
    assert_eq!(sent.expect("sent").map(|m| m.id).as_deref(), Some("m-9"));
    assert_eq!(ids(&h.chat, TEACHER), vec!["m-9"]);

    // The server echoing the stored message must not duplicate it.
    h.peer
        .push(EVENT_MESSAGE_SENT, message_json("m-9", ME, TEACHER, "on my way"));
    h.peer
        .push(EVENT_NEW_MESSAGE, message_json("m-10", TEACHER, ME, "great"));
    assert!(eventually(|| h.chat.messages(TEACHER).len() == 2).await);
    assert_eq!(ids(&h.chat, TEACHER), vec!["m-9", "m-10"]);
}

#[tokio::test]
async fn failed_send_drops_the_optimistic_copy() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/messages"))
        .respond_with(ResponseTemplate::new(500).set_body_json(json!({ "message": "db down" })))
        .expect(1)
        .mount(&server)
        .await;
    let h = connected(&server).await;

    let err = h
        .chat
        .send_message(TEACHER, "anyone there?")
        .await
        .expect_err("server error");
    assert_eq!(err.status().map(|s| s.as_u16()), Some(500));
    assert!(matches!(err, TransportError::Status { .. }));
    assert!(h.chat.messages(TEACHER).is_empty());
    assert!(h
        .chat
        .last_error()
        .is_some_and(|e| e.contains("db down")));
}

#[tokio::test]
async fn blank_messages_are_not_sent() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/messages"))
        .respond_with(ResponseTemplate::new(201))
        .expect(0)
        .mount(&server)
        .await;
    let h = connected(&server).await;

    assert_eq!(h.chat.send_message(TEACHER, "   ").await.expect("noop"), None);
    assert!(h.chat.messages(TEACHER).is_empty());
}

#[tokio::test]
async fn switching_conversations_leaves_before_joining() {
    let server = MockServer::start().await;
    let h = connected(&server).await;

    h.chat.set_current_conversation(Some("teacher-1"));
    h.chat.set_current_conversation(Some("teacher-1"));
    h.chat.set_current_conversation(Some("teacher-2"));
    h.chat.set_current_conversation(None);
    assert_eq!(h.chat.current_conversation(), None);

    let frames: Vec<(String, serde_json::Value)> = h
        .peer
        .received()
        .into_iter()
        .skip(1)
        .map(|f| (f.event, f.data))
        .collect();
    assert_eq!(
        frames,
        vec![
            ("joinConversation".into(), json!({ "otherUserId": "teacher-1" })),
            ("leaveConversation".into(), json!({ "otherUserId": "teacher-1" })),
            ("joinConversation".into(), json!({ "otherUserId": "teacher-2" })),
            ("leaveConversation".into(), json!({ "otherUserId": "teacher-2" })),
        ]
    );
}

#[tokio::test]
async fn focused_conversation_is_rejoined_after_reconnect() {
    let server = MockServer::start().await;
    let dir = TempDir::new().expect("temp dir");
    let (client, connector) = signed_in_client(&server, &dir, profile(ME, "Pat"));
    let chat = client.open_chat().expect("chat");

    // Focus is chosen before any connection exists.
    chat.set_current_conversation(Some(TEACHER));
    client.connect_realtime().await.expect("connect");
    let first = connector.latest().expect("first peer");
    assert!(eventually(|| joined(&first, TEACHER)).await);

    first.close("server restarting");
    assert!(eventually(|| !client.channel().is_connected()).await);

    client.connect_realtime().await.expect("reconnect");
    let second = connector.latest().expect("second peer");
    assert!(eventually(|| joined(&second, TEACHER)).await);
    assert_eq!(connector.links(), 2);
}

#[tokio::test]
async fn dropped_stores_release_their_handlers() {
    let server = MockServer::start().await;
    let dir = TempDir::new().expect("temp dir");
    let (client, _connector) = signed_in_client(&server, &dir, profile(ME, "Pat"));
    let channel = client.channel();

    for _ in 0..3 {
        let chat = client.open_chat().expect("chat");
        let copy = chat.clone();
        drop(chat);
        // A live clone keeps the store attached.
        assert_eq!(channel.handler_count(EVENT_NEW_MESSAGE), 1);
        drop(copy);
    }
    for event in [EVENT_NEW_MESSAGE, EVENT_CONNECT, EVENT_DISCONNECT] {
        assert_eq!(channel.handler_count(event), 0, "{event}");
    }

    let kept = client.open_chat().expect("chat");
    assert_eq!(channel.handler_count(EVENT_NEW_MESSAGE), 1);
    kept.detach();
    assert_eq!(channel.handler_count(EVENT_NEW_MESSAGE), 0);
}

#[tokio::test]
async fn presence_and_typing_follow_the_connection() {
    let server = MockServer::start().await;
    let h = connected(&server).await;

    h.peer
        .push(EVENT_USER_ONLINE, json!({ "userId": TEACHER, "name": "Ms Hopper" }));
    h.peer
        .push(EVENT_USER_ONLINE, json!({ "userId": "teacher-2", "name": "Mr Knuth" }));
    h.peer.push(
        EVENT_USER_TYPING,
        json!({ "userId": TEACHER, "userName": "Ms Hopper", "isTyping": true }),
    );
    assert!(eventually(|| h.chat.typing_users().len() == 1).await);
    assert_eq!(h.chat.online_users(), vec![TEACHER, "teacher-2"]);
    assert_eq!(h.chat.typing_users()[0].user_name, "Ms Hopper");

    h.peer.push(EVENT_USER_OFFLINE, json!({ "userId": TEACHER }));
    assert!(eventually(|| !h.chat.is_online(TEACHER)).await);
    assert!(h.chat.typing_users().is_empty());

    h.peer.close("server restarting");
    assert!(eventually(|| h.chat.online_users().is_empty()).await);
    assert!(!h.client.channel().is_connected());
}

#[tokio::test]
async fn available_users_carry_presence() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/messages/users"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [
                { "id": ME, "name": "Pat" },
                { "id": TEACHER, "name": "Ms Hopper", "role": "teacher" },
                { "id": "teacher-2", "name": "Mr Knuth", "role": "teacher" }
            ]
        })))
        .expect(1)
        .mount(&server)
        .await;
    let h = connected(&server).await;

    h.chat.fetch_available_users().await.expect("users");
    h.peer
        .push(EVENT_USER_ONLINE, json!({ "userId": "teacher-2", "name": "Mr Knuth" }));
    assert!(eventually(|| h.chat.is_online("teacher-2")).await);

    let users: Vec<(String, bool)> = h
        .chat
        .available_users()
        .into_iter()
        .map(|u| (u.user.id, u.is_online))
        .collect();
    assert_eq!(
        users,
        vec![(TEACHER.to_string(), false), ("teacher-2".to_string(), true)]
    );
}

#[tokio::test]
async fn unread_counts_track_focus_and_mark_as_read() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/messages/conversations"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {
                "user": { "id": TEACHER, "name": "Ms Hopper" },
                "lastMessage": message_json("m-1", TEACHER, ME, "reminder"),
                "unreadCount": 2
            },
            {
                "user": { "id": "teacher-2", "name": "Mr Knuth" },
                "unreadCount": 0
            }
        ])))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path(format!("/api/messages/{TEACHER}/read")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "success": true })))
        .expect(1)
        .mount(&server)
        .await;
    let h = connected(&server).await;

    h.chat.fetch_conversations().await.expect("conversations");
    assert_eq!(h.chat.total_unread(), 2);

    h.peer
        .push(EVENT_NEW_MESSAGE, message_json("m-2", TEACHER, ME, "one more"));
    assert!(eventually(|| h.chat.total_unread() == 3).await);

    // Messages for the focused conversation do not count as unread.
    h.chat.set_current_conversation(Some("teacher-2"));
    h.peer.push(
        EVENT_NEW_MESSAGE,
        message_json("m-3", "teacher-2", ME, "seen live"),
    );
    assert!(eventually(|| h.chat.messages("teacher-2").len() == 1).await);
    assert_eq!(h.chat.total_unread(), 3);
    assert_eq!(h.chat.conversations()[0].user.id, "teacher-2");

    h.chat.mark_as_read(TEACHER).await.expect("read");
    assert_eq!(h.chat.total_unread(), 0);
    assert!(h.chat.messages(TEACHER).iter().all(|m| m.is_read));
}
