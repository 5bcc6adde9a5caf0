/// End-to-end behaviour of the dispatcher over an in-memory SQLite store:
/// each connection is driven through its handle and its outbound queue is
/// inspected directly.
mod common;

use std::collections::HashSet;
use std::time::Duration;

use jsonwebtoken::{EncodingKey, Header, encode};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use tvdesk_gateway::{Dispatcher, GatewayConfig, Viewer};
use tvdesk_types::api::{Claims, Handshake};
use tvdesk_types::events::{ClientCommand, ServerEvent};
use tvdesk_types::models::Role;

use common::*;

fn join(room: &str) -> ClientCommand {
    ClientCommand::JoinRoom { room_id: room.into() }
}

fn say(room: &str, body: &str) -> ClientCommand {
    ClientCommand::SendMessage {
        room_id: room.into(),
        body: body.into(),
    }
}

fn mark_read(room: &str) -> ClientCommand {
    ClientCommand::MarkRead { room_id: room.into() }
}

fn bodies(events: &[ServerEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            ServerEvent::MessageCreated(m) => Some(m.body.clone()),
            _ => None,
        })
        .collect()
}

async fn wait_for_notifications(db: &tvdesk_db::Database, user_id: &str, expected: u32) {
    for _ in 0..200 {
        if db.count_notifications(user_id, false).unwrap() >= expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("{user_id} never received {expected} notifications");
}

#[tokio::test]
async fn connect_sends_ready_then_presence() {
    let db = seeded_db();
    let dispatcher = dispatcher(&db);

    let mut ana = dispatcher.connect(&user("u1", "Ana")).await;
    let events = ana.drain();

    match &events[0] {
        ServerEvent::Ready { identity } => {
            assert_eq!(identity.user_id, "u1");
            assert_eq!(identity.role, Role::User);
            assert_eq!(identity.display_name, "Ana");
        }
        other => panic!("expected ready, got {other:?}"),
    }
    assert_eq!(events[1].name(), "online_users_update");
    assert_eq!(unread_updates(&events), vec![(None, 0)]);
}

#[tokio::test]
async fn message_reaches_room_and_needs_explicit_mark_read() {
    let db = seeded_db();
    let dispatcher = dispatcher(&db);

    let mut ana = dispatcher.connect(&user("u1", "Ana")).await;
    ana.send(join("c1")).await;
    let mut support = dispatcher.connect(&admin("a1", "Support")).await;
    support.send(join("c1")).await;
    ana.drain();
    support.drain();

    ana.send(say("c1", "hello")).await;

    let ana_events = ana.drain();
    let support_events = support.drain();
    assert_eq!(bodies(&ana_events), vec!["hello"]);
    assert_eq!(bodies(&support_events), vec!["hello"]);

    // Being in the room does not mark anything read.
    assert_eq!(
        unread_updates(&support_events),
        vec![(Some("c1".to_string()), 1), (None, 1)]
    );
    assert!(unread_updates(&ana_events).is_empty());
    assert_eq!(dispatcher.unread_total(&Viewer::Admins).await, 1);

    support.send(mark_read("c1")).await;
    assert_eq!(
        unread_updates(&support.drain()),
        vec![(Some("c1".to_string()), 0), (None, 0)]
    );
    assert_eq!(db.count_unread("c1", false).unwrap(), 0);
    assert!(ana.drain().is_empty());
}

#[tokio::test]
async fn guest_numbers_are_reused_after_disconnect() {
    let db = seeded_db();
    let dispatcher = dispatcher(&db);

    let first = dispatcher.connect(&guest()).await;
    let second = dispatcher.connect(&guest()).await;

    assert_eq!(first.identity().role, Role::Guest);
    assert!(first.identity().user_id.starts_with("guest-"));
    assert_eq!(first.identity().display_name, "Guest 1");
    assert_eq!(second.identity().display_name, "Guest 2");

    first.close().await;
    let third = dispatcher.connect(&guest()).await;
    assert_eq!(third.identity().display_name, "Guest 1");
    assert_ne!(third.identity().display_name, second.identity().display_name);
}

#[tokio::test]
async fn offline_user_gets_admin_reply_on_next_connect() {
    let db = seeded_db();
    let dispatcher = dispatcher(&db);

    let support = dispatcher.connect(&admin("a1", "Support")).await;
    support.send(say("c1", "Your line is fixed")).await;
    assert_eq!(db.count_unread("c1", true).unwrap(), 1);
    wait_for_notifications(&db, "u1", 1).await;

    let mut ana = dispatcher.connect(&user("u1", "Ana")).await;
    assert_eq!(
        unread_updates(&ana.drain()),
        vec![(Some("c1".to_string()), 1), (None, 1)]
    );

    ana.send(ClientCommand::FetchNotifications {
        limit: None,
        offset: None,
    })
    .await;
    let events = ana.drain();
    match named(&events, "notifications_list").as_slice() {
        [ServerEvent::NotificationsList {
            notifications,
            unread_count,
            has_more,
        }] => {
            assert_eq!(notifications.len(), 1);
            assert_eq!(*unread_count, 1);
            assert!(!has_more);
            // Rendered in the recipient's locale.
            assert_eq!(notifications[0].title, "Nouveau message de Support");
            assert_eq!(notifications[0].data["conversationId"], "c1");
        }
        other => panic!("expected one notifications_list, got {other:?}"),
    }
}

#[tokio::test]
async fn repeated_join_broadcasts_twice_with_one_member() {
    let db = seeded_db();
    let dispatcher = dispatcher(&db);

    let mut ana = dispatcher.connect(&user("u1", "Ana")).await;
    ana.drain();
    ana.send(join("c1")).await;
    ana.send(join("c1")).await;

    let events = ana.drain();
    let updates = named(&events, "room_users_update");
    assert_eq!(updates.len(), 2);
    for update in updates {
        match update {
            ServerEvent::RoomUsersUpdate { room_id, users } => {
                assert_eq!(room_id, "c1");
                assert_eq!(users.len(), 1);
                assert_eq!(users[0].user_id, "u1");
            }
            _ => unreachable!(),
        }
    }
}

#[tokio::test]
async fn several_sockets_of_one_user_are_one_member() {
    let db = seeded_db();
    let dispatcher = dispatcher(&db);

    let phone = dispatcher.connect(&user("u1", "Ana")).await;
    let laptop = dispatcher.connect(&user("u1", "Ana")).await;
    let mut support = dispatcher.connect(&admin("a1", "Support")).await;
    for handle in [&phone, &laptop, &support] {
        handle.send(join("c1")).await;
    }
    assert_eq!(dispatcher.room_members("c1").await.len(), 2);
    assert_eq!(dispatcher.online_users().await.len(), 2);

    support.drain();
    phone.close().await;
    let events = support.drain();
    match named(&events, "room_users_update").as_slice() {
        [ServerEvent::RoomUsersUpdate { users, .. }] => {
            let ids: Vec<&str> = users.iter().map(|u| u.user_id.as_str()).collect();
            assert_eq!(ids, ["u1", "a1"]);
        }
        other => panic!("expected one room update, got {other:?}"),
    }

    laptop.close().await;
    let events = support.drain();
    match named(&events, "room_users_update").as_slice() {
        [ServerEvent::RoomUsersUpdate { users, .. }] => assert_eq!(users.len(), 1),
        other => panic!("expected one room update, got {other:?}"),
    }
}

#[tokio::test]
async fn leaving_notifies_remaining_members_only() {
    let db = seeded_db();
    let dispatcher = dispatcher(&db);

    let mut ana = dispatcher.connect(&user("u1", "Ana")).await;
    let mut support = dispatcher.connect(&admin("a1", "Support")).await;
    ana.send(join("c1")).await;
    support.send(join("c1")).await;
    ana.drain();
    support.drain();

    ana.send(ClientCommand::LeaveRoom { room_id: "c1".into() }).await;
    assert!(named(&ana.drain(), "room_users_update").is_empty());
    assert_eq!(named(&support.drain(), "room_users_update").len(), 1);

    // Last member leaving discards the room without a broadcast.
    support.send(ClientCommand::LeaveRoom { room_id: "c1".into() }).await;
    assert!(support.drain().is_empty());
    assert!(dispatcher.room_members("c1").await.is_empty());
    assert!(dispatcher.rooms_of(support.id()).await.is_empty());
}

#[tokio::test]
async fn online_users_request_answers_only_the_requester() {
    let db = seeded_db();
    let dispatcher = dispatcher(&db);

    let mut ana = dispatcher.connect(&user("u1", "Ana")).await;
    let mut ben = dispatcher.connect(&user("u2", "Ben")).await;
    ana.drain();
    ben.drain();

    ana.send(ClientCommand::RequestOnlineUsers {}).await;
    match ana.drain().as_slice() {
        [ServerEvent::OnlineUsersUpdate(users)] => assert_eq!(users.len(), 2),
        other => panic!("unexpected {other:?}"),
    }
    assert!(ben.drain().is_empty());
}

#[tokio::test]
async fn presence_matches_live_connections_under_random_churn() {
    let db = seeded_db();
    let dispatcher = dispatcher(&db);
    let mut rng = StdRng::seed_from_u64(0xC0FFEE);
    let pool: [fn() -> Handshake; 5] = [
        || user("u1", "Ana"),
        || user("u2", "Ben"),
        || admin("a1", "Support"),
        guest,
        guest,
    ];

    let mut live = Vec::new();
    for _ in 0..300 {
        if live.is_empty() || rng.random_bool(0.55) {
            let handshake = pool[rng.random_range(0..pool.len())]();
            live.push(dispatcher.connect(&handshake).await);
        } else {
            let idx = rng.random_range(0..live.len());
            live.swap_remove(idx).close().await;
        }

        let snapshot = dispatcher.online_users().await;
        let listed: Vec<&str> = snapshot.iter().map(|i| i.user_id.as_str()).collect();
        let unique: HashSet<&str> = listed.iter().copied().collect();
        assert_eq!(unique.len(), listed.len(), "duplicate userId in presence");

        let expected: HashSet<&str> = live.iter().map(|h| h.identity().user_id.as_str()).collect();
        assert_eq!(unique, expected);

        let guest_names: Vec<&str> = live
            .iter()
            .filter(|h| h.identity().role == Role::Guest)
            .map(|h| h.identity().display_name.as_str())
            .collect();
        let distinct: HashSet<&str> = guest_names.iter().copied().collect();
        assert_eq!(distinct.len(), guest_names.len(), "guest names collide");
    }

    for handle in live {
        handle.close().await;
    }
    assert_eq!(dispatcher.connection_count().await, 0);
}

#[tokio::test]
async fn unread_total_is_sum_of_rooms_under_random_traffic() {
    let db = seeded_db();
    db.create_conversation("c3", "u1", None).unwrap();
    let dispatcher = dispatcher(&db);
    let mut rng = StdRng::seed_from_u64(42);

    let ana = dispatcher.connect(&user("u1", "Ana")).await;
    let ben = dispatcher.connect(&user("u2", "Ben")).await;
    let support = dispatcher.connect(&admin("a1", "Support")).await;

    let rooms_of = |viewer: &Viewer| -> &'static [&'static str] {
        match viewer {
            Viewer::Admins => &["c1", "c2", "c3"],
            Viewer::User(id) if id == "u1" => &["c1", "c3"],
            Viewer::User(_) => &["c2"],
        }
    };
    let viewers = [
        Viewer::Admins,
        Viewer::User("u1".to_string()),
        Viewer::User("u2".to_string()),
    ];

    for step in 0..150 {
        match rng.random_range(0..6) {
            0 => ana.send(say(["c1", "c3"][rng.random_range(0..2)], "ping")).await,
            1 => ben.send(say("c2", "ping")).await,
            2 => support.send(say(["c1", "c2", "c3"][rng.random_range(0..3)], "pong")).await,
            3 => ana.send(mark_read(["c1", "c3"][rng.random_range(0..2)])).await,
            4 => ben.send(mark_read("c2")).await,
            _ => support.send(mark_read(["c1", "c2", "c3"][rng.random_range(0..3)])).await,
        }

        for viewer in &viewers {
            let mut sum = 0;
            for room in rooms_of(viewer) {
                let cached = dispatcher.unread_count(viewer, room).await;
                let stored = db
                    .count_unread(room, viewer.reads_admin_messages())
                    .unwrap();
                assert_eq!(cached, stored, "step {step}: {viewer:?} drifted in {room}");
                sum += cached;
            }
            assert_eq!(dispatcher.unread_total(viewer).await, sum, "step {step}: {viewer:?}");
        }
    }
}

#[tokio::test]
async fn per_sender_order_is_preserved() {
    let db = seeded_db();
    let dispatcher = dispatcher(&db);

    let ana = dispatcher.connect(&user("u1", "Ana")).await;
    let mut support = dispatcher.connect(&admin("a1", "Support")).await;
    ana.send(join("c1")).await;
    support.send(join("c1")).await;
    support.drain();

    let sent: Vec<String> = (0..20).map(|i| format!("m{i}")).collect();
    for body in &sent {
        ana.send(say("c1", body)).await;
    }
    assert_eq!(bodies(&support.drain()), sent);
}

#[tokio::test]
async fn invalid_sends_only_answer_the_sender() {
    let db = seeded_db();
    let dispatcher = dispatcher(&db);

    let mut ana = dispatcher.connect(&user("u1", "Ana")).await;
    let mut support = dispatcher.connect(&admin("a1", "Support")).await;
    ana.send(join("c1")).await;
    support.send(join("c1")).await;
    ana.drain();
    support.drain();

    ana.send(say("c1", "   ")).await;
    ana.send(say("", "hi")).await;
    ana.send(say("c2", "not my conversation")).await;
    ana.send(say("missing", "hi")).await;

    let errors: Vec<(String, String)> = ana
        .drain()
        .into_iter()
        .filter_map(|e| match e {
            ServerEvent::Error { command, message } => Some((command, message)),
            _ => None,
        })
        .collect();
    assert_eq!(
        errors,
        vec![
            ("send_message".to_string(), "message body is empty".to_string()),
            ("send_message".to_string(), "roomId is required".to_string()),
            ("send_message".to_string(), "not allowed to post in this conversation".to_string()),
            ("send_message".to_string(), "conversation not found".to_string()),
        ]
    );
    assert!(support.drain().is_empty());
    assert!(db.get_messages("c1", 10).unwrap().is_empty());
}

#[tokio::test]
async fn guests_cannot_post_but_get_empty_lists() {
    let db = seeded_db();
    let dispatcher = dispatcher(&db);

    let mut visitor = dispatcher.connect(&guest()).await;
    visitor.drain();
    visitor.send(say("c1", "hello?")).await;
    visitor.send(ClientCommand::FetchNotifications {
        limit: Some(5),
        offset: None,
    })
    .await;
    visitor.send(ClientCommand::RequestUnreadCounts {}).await;

    let events = visitor.drain();
    assert_eq!(named(&events, "error").len(), 1);
    match named(&events, "notifications_list").as_slice() {
        [ServerEvent::NotificationsList { notifications, .. }] => assert!(notifications.is_empty()),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(unread_updates(&events), vec![(None, 0)]);
}

#[tokio::test]
async fn edits_and_deletes_are_broadcast_and_keep_counts_straight() {
    let db = seeded_db();
    let dispatcher = dispatcher(&db);

    let mut ana = dispatcher.connect(&user("u1", "Ana")).await;
    let mut support = dispatcher.connect(&admin("a1", "Support")).await;
    ana.send(join("c1")).await;
    support.send(join("c1")).await;
    ana.send(say("c1", "helo")).await;
    let message_id = match named(&ana.drain(), "message_created").as_slice() {
        [ServerEvent::MessageCreated(m)] => m.id.clone(),
        other => panic!("unexpected {other:?}"),
    };
    support.drain();

    ana.send(ClientCommand::EditMessage {
        room_id: "c1".into(),
        message_id: message_id.clone(),
        body: "hello".into(),
    })
    .await;
    match named(&support.drain(), "message_updated").as_slice() {
        [ServerEvent::MessageUpdated(m)] => {
            assert_eq!(m.body, "hello");
            assert!(m.edited_at.is_some());
        }
        other => panic!("unexpected {other:?}"),
    }

    // Someone else's message in someone else's conversation.
    let mut ben = dispatcher.connect(&user("u2", "Ben")).await;
    ben.drain();
    ben.send(ClientCommand::DeleteMessage {
        room_id: "c1".into(),
        message_id: message_id.clone(),
    })
    .await;
    assert_eq!(named(&ben.drain(), "error").len(), 1);

    assert_eq!(dispatcher.unread_total(&Viewer::Admins).await, 1);
    support.send(ClientCommand::DeleteMessage {
        room_id: "c1".into(),
        message_id: message_id.clone(),
    })
    .await;

    let events = ana.drain();
    match named(&events, "message_deleted").as_slice() {
        [ServerEvent::MessageDeleted { room_id, message_id: gone }] => {
            assert_eq!(room_id, "c1");
            assert_eq!(gone, &message_id);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(dispatcher.unread_total(&Viewer::Admins).await, 0);
    assert_eq!(
        unread_updates(&support.drain()),
        vec![(Some("c1".to_string()), 0), (None, 0)]
    );
}

#[tokio::test]
async fn refresh_rebroadcasts_the_whole_conversation() {
    let db = seeded_db();
    let dispatcher = dispatcher(&db);

    let mut ana = dispatcher.connect(&user("u1", "Ana")).await;
    let mut support = dispatcher.connect(&admin("a1", "Support")).await;
    ana.send(join("c1")).await;
    support.send(join("c1")).await;
    ana.send(say("c1", "one")).await;
    ana.send(say("c1", "two")).await;
    ana.drain();
    support.drain();

    ana.send(ClientCommand::RefreshConversation { room_id: "c1".into() }).await;
    for events in [ana.drain(), support.drain()] {
        match named(&events, "conversation_updated").as_slice() {
            [ServerEvent::ConversationUpdated(full)] => {
                assert_eq!(full.conversation.id, "c1");
                let bodies: Vec<&str> = full.messages.iter().map(|m| m.body.as_str()).collect();
                assert_eq!(bodies, ["one", "two"]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    assert!(!dispatcher.sync_conversation("nope").await.unwrap());
}

#[tokio::test]
async fn live_notification_and_mark_read_refresh_every_socket() {
    let db = seeded_db();
    let dispatcher = dispatcher(&db);

    let mut ana = dispatcher.connect(&user("u1", "Ana")).await;
    let mut ana_tv = dispatcher.connect(&user("u1", "Ana")).await;
    let support = dispatcher.connect(&admin("a1", "Support")).await;

    support.send(say("c1", "Payment issue solved")).await;
    match next_named(&mut ana, "notification").await {
        ServerEvent::Notification(n) => {
            assert_eq!(n.user_id, "u1");
            assert_eq!(n.body, "Payment issue solved");
            assert!(n.read_at.is_none());
        }
        _ => unreachable!(),
    }
    next_named(&mut ana_tv, "notification").await;

    ana.send(ClientCommand::MarkNotificationsRead { ids: None }).await;
    for handle in [&mut ana, &mut ana_tv] {
        match next_named(handle, "notifications_list").await {
            ServerEvent::NotificationsList { unread_count, .. } => assert_eq!(unread_count, 0),
            _ => unreachable!(),
        }
    }
}

#[tokio::test]
async fn request_unread_counts_resyncs_from_the_store() {
    let db = seeded_db();
    let dispatcher = dispatcher(&db);

    let mut support = dispatcher.connect(&admin("a1", "Support")).await;
    support.drain();

    // Written behind the gateway's back, e.g. by the web app.
    db.insert_message(&tvdesk_db::models::MessageRow {
        id: "m-external".into(),
        conversation_id: "c2".into(),
        sender_id: "u2".into(),
        sender_name: "Ben".into(),
        sender_is_admin: false,
        body: "is anyone there?".into(),
        created_at: tvdesk_db::now_timestamp(),
        edited_at: None,
        read_at: None,
    })
    .unwrap();

    support.send(ClientCommand::RequestUnreadCounts {}).await;
    assert_eq!(
        unread_updates(&support.drain()),
        vec![(Some("c2".to_string()), 1), (None, 1)]
    );
}

#[tokio::test]
async fn signed_tokens_beat_raw_handshake_fields() {
    let db = seeded_db();
    let config = GatewayConfig {
        trust_handshake: false,
        ..common::config()
    };
    let dispatcher = Dispatcher::new(
        config,
        std::sync::Arc::new(tvdesk_gateway::SqliteStore::new(db.clone())),
    );

    let claims = Claims {
        sub: "u2".into(),
        role: Role::User,
        name: Some("Ben".into()),
        exp: (chrono::Utc::now().timestamp() + 3600) as usize,
    };
    let token = encode(&Header::default(), &claims, &EncodingKey::from_secret(JWT_SECRET.as_bytes())).unwrap();

    let ben = dispatcher
        .connect(&Handshake {
            token: Some(token),
            ..Handshake::default()
        })
        .await;
    assert_eq!(ben.identity().user_id, "u2");
    assert_eq!(ben.identity().display_name, "Ben");

    // Untrusted raw fields and forged tokens both fall back to a guest.
    let spoof = dispatcher.connect(&admin("a1", "Support")).await;
    assert_eq!(spoof.identity().role, Role::Guest);
    let forged = dispatcher
        .connect(&Handshake {
            token: Some("not.a.jwt".into()),
            ..Handshake::default()
        })
        .await;
    assert_eq!(forged.identity().role, Role::Guest);
}

#[tokio::test]
async fn dropping_a_handle_still_cleans_up() {
    let db = seeded_db();
    let dispatcher = dispatcher(&db);

    let mut support = dispatcher.connect(&admin("a1", "Support")).await;
    {
        let ana = dispatcher.connect(&user("u1", "Ana")).await;
        ana.send(join("c1")).await;
    }
    support.drain();

    let event = next_named(&mut support, "online_users_update").await;
    match event {
        ServerEvent::OnlineUsersUpdate(users) => {
            assert_eq!(users.len(), 1);
            assert_eq!(users[0].user_id, "a1");
        }
        _ => unreachable!(),
    }
    assert!(dispatcher.room_members("c1").await.is_empty());
}
