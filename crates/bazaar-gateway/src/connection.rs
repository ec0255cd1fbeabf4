use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tracing::{error, info, warn};
use uuid::Uuid;

use bazaar_db::{ChatError, Database};
use bazaar_types::events::{GatewayCommand, GatewayEvent, RejectReason};

use crate::dispatcher::Dispatcher;
use crate::identity::{self, Identity};

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// The first frame must be an `identify` command within this window.
const IDENTIFY_TIMEOUT: Duration = Duration::from_secs(10);

/// Handle a single WebSocket connection: identify handshake, ready event,
/// then the command/fan-out loop until the transport closes.
pub async fn handle_connection(
    socket: WebSocket,
    dispatcher: Dispatcher,
    db: Arc<Database>,
    jwt_secret: String,
) {
    let (mut sender, mut receiver) = socket.split();

    let identity = match wait_for_identify(&mut receiver, &db, &jwt_secret).await {
        Some(identity) => identity,
        None => {
            warn!("WebSocket client failed to identify, closing");
            return;
        }
    };

    info!(
        "{} ({}) connected to gateway",
        identity.display_name, identity.user_id
    );

    let ready = GatewayEvent::Ready {
        user_id: identity.user_id,
        display_name: identity.display_name.clone(),
    };
    if send_event(&mut sender, &ready).await.is_err() {
        return;
    }

    run_connection_loop(sender, receiver, dispatcher, db, identity).await;
}

async fn run_connection_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    dispatcher: Dispatcher,
    db: Arc<Database>,
    identity: Identity,
) {
    let (conn_id, mut event_rx) = dispatcher.register().await;

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Forward dispatcher events to the client, with heartbeat.
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                event = event_rx.recv() => {
                    let Some(event) = event else { break };
                    if send_event(&mut sender, &event).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Read commands from the client.
    let dispatcher_recv = dispatcher.clone();
    let db_recv = db.clone();
    let identity_recv = identity.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<GatewayCommand>(&text) {
                    Ok(cmd) => {
                        handle_command(&dispatcher_recv, &db_recv, &identity_recv, conn_id, cmd)
                            .await;
                    }
                    Err(e) => {
                        let preview: String = text.chars().take(200).collect();
                        warn!(
                            "{} ({}) bad command: {} -- raw: {}",
                            identity_recv.display_name, identity_recv.user_id, e, preview
                        );
                    }
                },
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Wait for either task to finish
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    dispatcher.unregister(conn_id).await;
    info!(
        "{} ({}) disconnected from gateway",
        identity.display_name, identity.user_id
    );
}

async fn send_event(
    sender: &mut SplitSink<WebSocket, Message>,
    event: &GatewayEvent,
) -> Result<(), axum::Error> {
    let Ok(text) = serde_json::to_string(event) else {
        return Ok(());
    };
    sender.send(Message::Text(text.into())).await
}

async fn wait_for_identify(
    receiver: &mut SplitStream<WebSocket>,
    db: &Arc<Database>,
    jwt_secret: &str,
) -> Option<Identity> {
    let handshake = tokio::time::timeout(IDENTIFY_TIMEOUT, async {
        while let Some(Ok(msg)) = receiver.next().await {
            if let Message::Text(text) = msg {
                if let Ok(GatewayCommand::Identify { token }) =
                    serde_json::from_str::<GatewayCommand>(&text)
                {
                    let db = db.clone();
                    let secret = jwt_secret.to_string();
                    return tokio::task::spawn_blocking(move || {
                        identity::verify_credential(&db, &secret, &token)
                    })
                    .await
                    .ok()?
                    .ok();
                }
            }
        }
        None
    });

    handshake.await.ok().flatten()
}

async fn handle_command(
    dispatcher: &Dispatcher,
    db: &Arc<Database>,
    identity: &Identity,
    conn_id: Uuid,
    cmd: GatewayCommand,
) {
    match cmd {
        GatewayCommand::Identify { .. } => {} // Already handled at the handshake

        GatewayCommand::JoinChat { chat_id } => {
            join_chat(dispatcher, db, identity, conn_id, chat_id).await;
        }

        GatewayCommand::SendMessage { chat_id, body } => {
            send_message(dispatcher, db, identity, conn_id, chat_id, body).await;
        }
    }
}

/// Join the room for a chat. The chat id comes from the client, so the same
/// participant assertion as the send path runs before the room membership is
/// granted; a refusal is answered with a targeted `send_rejected`.
async fn join_chat(
    dispatcher: &Dispatcher,
    db: &Arc<Database>,
    identity: &Identity,
    conn_id: Uuid,
    chat_id: Uuid,
) {
    let check = {
        let db = db.clone();
        let user_id = identity.user_id;
        tokio::task::spawn_blocking(move || db.assert_participant(chat_id, user_id)).await
    };

    match check {
        Ok(Ok(())) => {
            dispatcher.join_room(chat_id, conn_id).await;
            dispatcher
                .send_to_conn(conn_id, GatewayEvent::ChatJoined { chat_id })
                .await;
        }
        Ok(Err(err)) => {
            warn!(
                "{} ({}) denied join of chat {}: {}",
                identity.display_name, identity.user_id, chat_id, err
            );
            dispatcher
                .send_to_conn(
                    conn_id,
                    GatewayEvent::SendRejected {
                        chat_id,
                        reason: reject_reason(&err),
                    },
                )
                .await;
        }
        Err(e) => {
            error!("spawn_blocking join error: {e}");
            dispatcher
                .send_to_conn(
                    conn_id,
                    GatewayEvent::SendRejected {
                        chat_id,
                        reason: RejectReason::Internal,
                    },
                )
                .await;
        }
    }
}

/// The authorized send path: assert participancy, persist, fan out to the
/// room (sender included), ack the sender. Every failure becomes a targeted
/// `send_rejected` carrying the taxonomy kind — nothing is silently dropped,
/// nothing is persisted or broadcast on refusal.
async fn send_message(
    dispatcher: &Dispatcher,
    db: &Arc<Database>,
    identity: &Identity,
    conn_id: Uuid,
    chat_id: Uuid,
    body: String,
) {
    let appended = {
        let db = db.clone();
        let sender_id = identity.user_id;
        tokio::task::spawn_blocking(move || {
            db.assert_participant(chat_id, sender_id)?;
            db.append_message(chat_id, sender_id, &body)
        })
        .await
    };

    let row = match appended {
        Ok(Ok(row)) => row,
        Ok(Err(err)) => {
            warn!(
                "{} ({}) rejected send into chat {}: {}",
                identity.display_name, identity.user_id, chat_id, err
            );
            dispatcher
                .send_to_conn(
                    conn_id,
                    GatewayEvent::SendRejected {
                        chat_id,
                        reason: reject_reason(&err),
                    },
                )
                .await;
            return;
        }
        Err(e) => {
            error!("spawn_blocking join error: {e}");
            dispatcher
                .send_to_conn(
                    conn_id,
                    GatewayEvent::SendRejected {
                        chat_id,
                        reason: RejectReason::Internal,
                    },
                )
                .await;
            return;
        }
    };

    let message = row.into_response();
    let message_id = message.id;
    dispatcher
        .send_to_room(chat_id, GatewayEvent::ReceiveMessage { message })
        .await;
    dispatcher
        .send_to_conn(conn_id, GatewayEvent::MessageAck { chat_id, message_id })
        .await;
}

fn reject_reason(err: &ChatError) -> RejectReason {
    match err {
        ChatError::InvalidRequest(_) => RejectReason::InvalidRequest,
        ChatError::Forbidden => RejectReason::Forbidden,
        ChatError::NotFound(_) => RejectReason::NotFound,
        ChatError::Db(_) | ChatError::Internal(_) => RejectReason::Internal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bazaar_types::models::ListingRef;

    fn seed_user(db: &Database, name: &str) -> Identity {
        let id = Uuid::new_v4();
        db.create_user(id, name, "argon2-hash", name).unwrap();
        Identity {
            user_id: id,
            display_name: name.to_string(),
        }
    }

    fn seed_chat(db: &Database, a: &Identity, b: &Identity) -> Uuid {
        db.get_or_create_chat(a.user_id, Some(b.user_id), ListingRef::None)
            .unwrap()
            .id
            .parse()
            .unwrap()
    }

    #[tokio::test]
    async fn send_fans_out_to_the_room_and_acks_the_sender() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let dispatcher = Dispatcher::new();
        let alice = seed_user(&db, "alice");
        let bob = seed_user(&db, "bob");
        let chat = seed_chat(&db, &alice, &bob);

        let (conn_a, mut rx_a) = dispatcher.register().await;
        let (conn_b, mut rx_b) = dispatcher.register().await;
        join_chat(&dispatcher, &db, &alice, conn_a, chat).await;
        join_chat(&dispatcher, &db, &bob, conn_b, chat).await;
        assert!(matches!(
            rx_a.try_recv().unwrap(),
            GatewayEvent::ChatJoined { .. }
        ));
        assert!(matches!(
            rx_b.try_recv().unwrap(),
            GatewayEvent::ChatJoined { .. }
        ));

        send_message(&dispatcher, &db, &alice, conn_a, chat, "hello".into()).await;

        // Both room members get the broadcast, the sender included.
        let GatewayEvent::ReceiveMessage { message } = rx_b.try_recv().unwrap() else {
            panic!("expected receive_message for bob");
        };
        assert_eq!(message.body, "hello");
        assert_eq!(message.sender_name, "alice");
        assert!(matches!(
            rx_a.try_recv().unwrap(),
            GatewayEvent::ReceiveMessage { .. }
        ));
        assert!(matches!(
            rx_a.try_recv().unwrap(),
            GatewayEvent::MessageAck { .. }
        ));

        // And the message is durable.
        let history = db.list_and_mark_read(chat, bob.user_id).unwrap();
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn outsiders_cannot_join_or_send() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let dispatcher = Dispatcher::new();
        let alice = seed_user(&db, "alice");
        let bob = seed_user(&db, "bob");
        let mallory = seed_user(&db, "mallory");
        let chat = seed_chat(&db, &alice, &bob);

        let (conn_a, mut rx_a) = dispatcher.register().await;
        join_chat(&dispatcher, &db, &alice, conn_a, chat).await;
        let _ = rx_a.try_recv();

        let (conn_m, mut rx_m) = dispatcher.register().await;
        join_chat(&dispatcher, &db, &mallory, conn_m, chat).await;
        assert!(matches!(
            rx_m.try_recv().unwrap(),
            GatewayEvent::SendRejected {
                reason: RejectReason::Forbidden,
                ..
            }
        ));
        assert_eq!(dispatcher.room_size(chat).await, 1);

        send_message(&dispatcher, &db, &mallory, conn_m, chat, "intruding".into()).await;
        assert!(matches!(
            rx_m.try_recv().unwrap(),
            GatewayEvent::SendRejected {
                reason: RejectReason::Forbidden,
                ..
            }
        ));

        // No row was written, and the room heard nothing.
        assert!(db.list_and_mark_read(chat, alice.user_id).unwrap().is_empty());
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn invalid_sends_are_rejected_with_a_reason() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let dispatcher = Dispatcher::new();
        let alice = seed_user(&db, "alice");
        let bob = seed_user(&db, "bob");
        let chat = seed_chat(&db, &alice, &bob);

        let (conn_a, mut rx_a) = dispatcher.register().await;
        join_chat(&dispatcher, &db, &alice, conn_a, chat).await;
        let _ = rx_a.try_recv();

        send_message(&dispatcher, &db, &alice, conn_a, chat, "   ".into()).await;
        assert!(matches!(
            rx_a.try_recv().unwrap(),
            GatewayEvent::SendRejected {
                reason: RejectReason::InvalidRequest,
                ..
            }
        ));

        send_message(
            &dispatcher,
            &db,
            &alice,
            conn_a,
            Uuid::new_v4(),
            "anyone there?".into(),
        )
        .await;
        assert!(matches!(
            rx_a.try_recv().unwrap(),
            GatewayEvent::SendRejected {
                reason: RejectReason::NotFound,
                ..
            }
        ));
    }
}
