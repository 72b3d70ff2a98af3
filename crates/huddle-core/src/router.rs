//! Inbound event dispatch.
//!
//! Every decoded envelope passes through [`dispatch`], which applies the
//! per-message rate limit, refreshes liveness, and fans the event out to the
//! registry, presence subsystem, staging queue, and broadcast paths. An
//! error raised while handling a frame becomes an `error` frame for that
//! sender and never crosses connection boundaries.
//!
//! Dispatch is synchronous: frames from one connection are handled and
//! broadcast strictly in receipt order. No ordering is guaranteed across
//! connections or rooms.

use crate::hub::Hub;
use crate::presence::TYPING_TTL;
use crate::queue::StagedMessage;
use crate::registry::RegistryError;
use crate::room::{RoomId, UserId};
use huddle_protocol::{
    code, Audience, ClientEnvelope, ClientEvent, RoomMetadata, ServerEnvelope, ServerEvent,
};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// A frame-level rejection, reported to the sender only.
#[derive(Debug, Error)]
pub enum RouteError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// The event needs a room id but carried none.
    #[error("Missing room id")]
    MissingRoom,
}

impl RouteError {
    /// Error-frame code for this rejection.
    #[must_use]
    pub fn code(&self) -> u16 {
        match self {
            RouteError::Registry(RegistryError::RoomFull { .. }) => code::ERR_CAPACITY,
            RouteError::Registry(RegistryError::NotAMember { .. }) => code::ERR_ROUTING,
            RouteError::Registry(RegistryError::InvalidRoom(_)) | RouteError::MissingRoom => {
                code::ERR_PROTOCOL
            }
        }
    }
}

/// Route one validated envelope from a connection.
pub fn dispatch(hub: &Arc<Hub>, connection_id: &str, envelope: ClientEnvelope) {
    if !hub.limiter().check_and_consume(connection_id) {
        hub.send_error(
            connection_id,
            code::ERR_RATE_LIMITED,
            "message rate limit exceeded",
        );
        return;
    }

    hub.touch(connection_id);
    hub.record_message();

    let ClientEnvelope {
        event,
        timestamp,
        user_id,
        room_id: envelope_room,
    } = envelope;

    debug!(connection = %connection_id, event = event.name(), "Dispatching frame");

    let outcome = match event {
        ClientEvent::JoinRoom {
            room_id,
            user_id,
            metadata,
        } => join_room(hub, connection_id, &room_id, &user_id, metadata),
        ClientEvent::LeaveRoom { room_id } => leave_room(hub, connection_id, &room_id, &user_id),
        ClientEvent::Message {
            room_id,
            content,
            message_type,
        } => message(hub, &room_id, &user_id, content, message_type, timestamp),
        ClientEvent::Presence { status, room_id } => {
            presence(hub, &user_id, status, room_id.or(envelope_room));
            Ok(())
        }
        ClientEvent::Typing { room_id, is_typing } => {
            typing(hub, &room_id, &user_id, is_typing);
            Ok(())
        }
        ClientEvent::SearchSync {
            query,
            results,
            room_id,
        } => search_sync(hub, &user_id, query, &results, room_id.or(envelope_room)),
        ClientEvent::Activity {
            activity_type,
            data,
            room_id,
            audience,
        } => activity(
            hub,
            &user_id,
            activity_type,
            data,
            room_id.or(envelope_room),
            audience,
        ),
    };

    if let Err(e) = outcome {
        warn!(connection = %connection_id, error = %e, "Frame rejected");
        hub.send_error(connection_id, e.code(), &e.to_string());
    }
}

fn join_room(
    hub: &Arc<Hub>,
    connection_id: &str,
    room_id: &str,
    user_id: &str,
    metadata: Option<RoomMetadata>,
) -> Result<(), RouteError> {
    let outcome = hub.registry().join(room_id, user_id, metadata)?;
    hub.bind_user(connection_id, user_id);
    hub.add_room(connection_id, room_id);

    let now = hub.now();
    let ack = ServerEnvelope::server(
        ServerEvent::RoomJoined {
            room_id: room_id.to_string(),
            members: outcome.members,
        },
        now,
    )
    .with_room(room_id);
    hub.send_to_conn(connection_id, &ack);

    if outcome.newly_joined {
        let joined = ServerEnvelope::from_user(
            ServerEvent::UserJoined {
                room_id: room_id.to_string(),
                user_id: user_id.to_string(),
            },
            user_id,
            now,
        )
        .with_room(room_id);
        hub.broadcast_to_room(room_id, &joined, Some(user_id));
    }

    Ok(())
}

fn leave_room(
    hub: &Arc<Hub>,
    connection_id: &str,
    room_id: &str,
    user_id: &str,
) -> Result<(), RouteError> {
    let outcome = hub.registry().leave(room_id, user_id)?;
    hub.remove_room(connection_id, room_id);
    hub.typing().disarm(user_id, room_id);

    let now = hub.now();
    let ack = ServerEnvelope::server(
        ServerEvent::RoomLeft {
            room_id: room_id.to_string(),
        },
        now,
    )
    .with_room(room_id);
    hub.send_to_conn(connection_id, &ack);

    if !outcome.remaining.is_empty() {
        let left = ServerEnvelope::from_user(
            ServerEvent::UserLeft {
                room_id: room_id.to_string(),
                user_id: user_id.to_string(),
                reason: None,
            },
            user_id,
            now,
        )
        .with_room(room_id);
        hub.broadcast_to_room(room_id, &left, Some(user_id));
    }

    Ok(())
}

fn message(
    hub: &Arc<Hub>,
    room_id: &str,
    user_id: &str,
    content: String,
    message_type: Option<String>,
    timestamp: u64,
) -> Result<(), RouteError> {
    if !hub.registry().is_member(room_id, user_id) {
        return Err(RegistryError::NotAMember {
            room_id: room_id.to_string(),
            user_id: user_id.to_string(),
        }
        .into());
    }

    hub.queues().push(StagedMessage {
        room_id: room_id.to_string(),
        user_id: user_id.to_string(),
        content: content.clone(),
        message_type: message_type.clone(),
        timestamp,
    });

    // Local echo: the sender receives its own message back.
    let echo = ServerEnvelope::from_user(
        ServerEvent::Message {
            room_id: room_id.to_string(),
            content,
            message_type,
        },
        user_id,
        timestamp,
    )
    .with_room(room_id);
    hub.broadcast_to_room(room_id, &echo, None);

    Ok(())
}

fn presence(hub: &Arc<Hub>, user_id: &str, status: String, target: Option<RoomId>) {
    let now = hub.now();
    hub.presence().set(user_id, status.clone(), now);

    let update = ServerEnvelope::from_user(
        ServerEvent::PresenceUpdate {
            user_id: user_id.to_string(),
            status,
        },
        user_id,
        now,
    );

    match target {
        Some(room_id) => {
            hub.broadcast_to_room(&room_id, &update.clone().with_room(room_id.clone()), None);
        }
        None => {
            for room_id in hub.user_rooms(user_id) {
                hub.broadcast_to_room(&room_id, &update.clone().with_room(room_id.clone()), None);
            }
        }
    }
}

fn typing(hub: &Arc<Hub>, room_id: &str, user_id: &str, is_typing: bool) {
    let indicator = ServerEnvelope::from_user(
        ServerEvent::TypingIndicator {
            room_id: room_id.to_string(),
            user_id: user_id.to_string(),
            is_typing,
        },
        user_id,
        hub.now(),
    )
    .with_room(room_id);
    hub.broadcast_to_room(room_id, &indicator, Some(user_id));

    if is_typing {
        let task_hub = Arc::clone(hub);
        let user: UserId = user_id.to_string();
        let room: RoomId = room_id.to_string();
        let task = tokio::spawn(async move {
            tokio::time::sleep(TYPING_TTL).await;
            task_hub.typing().complete(&user, &room);

            let stop = ServerEnvelope::from_user(
                ServerEvent::TypingIndicator {
                    room_id: room.clone(),
                    user_id: user.clone(),
                    is_typing: false,
                },
                user.clone(),
                task_hub.now(),
            )
            .with_room(room.clone());
            task_hub.broadcast_to_room(&room, &stop, Some(&user));
        });
        // A fresh start supersedes (and cancels) any pending auto-stop.
        hub.typing().arm(user_id, room_id, task);
    } else {
        hub.typing().disarm(user_id, room_id);
    }
}

fn search_sync(
    hub: &Arc<Hub>,
    user_id: &str,
    query: String,
    results: &Value,
    target: Option<RoomId>,
) -> Result<(), RouteError> {
    let room_id = target.ok_or(RouteError::MissingRoom)?;
    let result_count = results.as_array().map_or(0, Vec::len);

    let summary = ServerEnvelope::from_user(
        ServerEvent::SearchSync {
            room_id: room_id.clone(),
            query,
            result_count,
        },
        user_id,
        hub.now(),
    )
    .with_room(room_id.clone());
    hub.broadcast_to_room(&room_id, &summary, Some(user_id));

    Ok(())
}

fn activity(
    hub: &Arc<Hub>,
    user_id: &str,
    activity_type: String,
    data: Value,
    target: Option<RoomId>,
    audience: Option<Audience>,
) -> Result<(), RouteError> {
    let audience = audience.unwrap_or(if target.is_some() {
        Audience::Room
    } else {
        Audience::Global
    });

    let envelope = ServerEnvelope::from_user(
        ServerEvent::Activity {
            activity_type,
            data,
            audience,
        },
        user_id,
        hub.now(),
    );

    match audience {
        Audience::Room => {
            let room_id = target.ok_or(RouteError::MissingRoom)?;
            hub.broadcast_to_room(&room_id, &envelope.with_room(room_id.clone()), Some(user_id));
        }
        Audience::Global => {
            hub.broadcast_global(&envelope, Some(user_id));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{client, connect, drain_frames, test_hub};
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn test_join_notifies_peers_not_joiner() {
        let (hub, _clock) = test_hub(|_| {});
        let (conn_a, mut rx_a) = connect(&hub, "alice");
        let (conn_b, mut rx_b) = connect(&hub, "bob");

        dispatch(
            &hub,
            &conn_a,
            client(
                ClientEvent::JoinRoom {
                    room_id: "r1".into(),
                    user_id: "alice".into(),
                    metadata: None,
                },
                "alice",
            ),
        );
        drain_frames(&mut rx_a);

        dispatch(
            &hub,
            &conn_b,
            client(
                ClientEvent::JoinRoom {
                    room_id: "r1".into(),
                    user_id: "bob".into(),
                    metadata: None,
                },
                "bob",
            ),
        );

        // A sees bob join; B only gets its own ack.
        let frames_a = drain_frames(&mut rx_a);
        assert_eq!(frames_a.len(), 1);
        match &frames_a[0].event {
            ServerEvent::UserJoined { user_id, .. } => assert_eq!(user_id, "bob"),
            other => panic!("Expected user_joined, got {other:?}"),
        }

        let frames_b = drain_frames(&mut rx_b);
        assert_eq!(frames_b.len(), 1);
        match &frames_b[0].event {
            ServerEvent::RoomJoined { members, .. } => {
                let mut members = members.clone();
                members.sort();
                assert_eq!(members, vec!["alice".to_string(), "bob".to_string()]);
            }
            other => panic!("Expected room_joined, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_message_echoes_to_all_and_stages_once() {
        let (hub, _clock) = test_hub(|_| {});
        let (conn_a, mut rx_a) = connect(&hub, "alice");
        let (conn_b, mut rx_b) = connect(&hub, "bob");

        for (conn, user) in [(&conn_a, "alice"), (&conn_b, "bob")] {
            dispatch(
                &hub,
                conn,
                client(
                    ClientEvent::JoinRoom {
                        room_id: "r1".into(),
                        user_id: user.into(),
                        metadata: None,
                    },
                    user,
                ),
            );
        }
        drain_frames(&mut rx_a);
        drain_frames(&mut rx_b);

        dispatch(
            &hub,
            &conn_a,
            client(
                ClientEvent::Message {
                    room_id: "r1".into(),
                    content: "hi".into(),
                    message_type: None,
                },
                "alice",
            ),
        );

        for rx in [&mut rx_a, &mut rx_b] {
            let frames = drain_frames(rx);
            assert_eq!(frames.len(), 1);
            assert_eq!(frames[0].user_id, "alice");
            match &frames[0].event {
                ServerEvent::Message { content, .. } => assert_eq!(content, "hi"),
                other => panic!("Expected message, got {other:?}"),
            }
        }

        assert_eq!(hub.queues().len("r1"), 1);
    }

    #[tokio::test]
    async fn test_message_from_non_member_is_rejected() {
        let (hub, _clock) = test_hub(|_| {});
        let (conn_a, mut rx_a) = connect(&hub, "alice");

        dispatch(
            &hub,
            &conn_a,
            client(
                ClientEvent::Message {
                    room_id: "r1".into(),
                    content: "hi".into(),
                    message_type: None,
                },
                "alice",
            ),
        );

        let frames = drain_frames(&mut rx_a);
        assert_eq!(frames.len(), 1);
        match &frames[0].event {
            ServerEvent::Error { code: c, .. } => assert_eq!(*c, code::ERR_ROUTING),
            other => panic!("Expected error, got {other:?}"),
        }
        assert_eq!(hub.queues().len("r1"), 0);
    }

    #[tokio::test]
    async fn test_rate_limited_frame_gets_error_and_connection_survives() {
        let (hub, _clock) = test_hub(|config| config.rate_limit.max_messages = 1);
        let (conn_a, mut rx_a) = connect(&hub, "alice");

        let join = || {
            client(
                ClientEvent::JoinRoom {
                    room_id: "r1".into(),
                    user_id: "alice".into(),
                    metadata: None,
                },
                "alice",
            )
        };

        dispatch(&hub, &conn_a, join());
        drain_frames(&mut rx_a);

        dispatch(&hub, &conn_a, join());
        let frames = drain_frames(&mut rx_a);
        assert_eq!(frames.len(), 1);
        match &frames[0].event {
            ServerEvent::Error { code: c, .. } => assert_eq!(*c, code::ERR_RATE_LIMITED),
            other => panic!("Expected error, got {other:?}"),
        }
        assert_eq!(hub.connection_count(), 1);
        assert_eq!(hub.messages_processed(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_typing_auto_stops_after_ttl() {
        let (hub, _clock) = test_hub(|_| {});
        let (conn_a, mut rx_a) = connect(&hub, "alice");
        let (conn_b, mut rx_b) = connect(&hub, "bob");

        for (conn, user) in [(&conn_a, "alice"), (&conn_b, "bob")] {
            dispatch(
                &hub,
                conn,
                client(
                    ClientEvent::JoinRoom {
                        room_id: "r1".into(),
                        user_id: user.into(),
                        metadata: None,
                    },
                    user,
                ),
            );
        }
        drain_frames(&mut rx_a);
        drain_frames(&mut rx_b);

        dispatch(
            &hub,
            &conn_a,
            client(
                ClientEvent::Typing {
                    room_id: "r1".into(),
                    is_typing: true,
                },
                "alice",
            ),
        );

        // Immediate start indicator for the peer, nothing echoed to alice.
        let frames = drain_frames(&mut rx_b);
        assert_eq!(frames.len(), 1);
        assert!(matches!(
            frames[0].event,
            ServerEvent::TypingIndicator { is_typing: true, .. }
        ));
        assert!(drain_frames(&mut rx_a).is_empty());

        tokio::time::sleep(TYPING_TTL + Duration::from_millis(100)).await;

        let frames = drain_frames(&mut rx_b);
        assert_eq!(frames.len(), 1);
        assert!(matches!(
            frames[0].event,
            ServerEvent::TypingIndicator {
                is_typing: false,
                ..
            }
        ));
        assert_eq!(hub.typing().pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_typing_start_cancels_pending_stop() {
        let (hub, _clock) = test_hub(|_| {});
        let (conn_a, mut rx_a) = connect(&hub, "alice");
        let (conn_b, mut rx_b) = connect(&hub, "bob");

        for (conn, user) in [(&conn_a, "alice"), (&conn_b, "bob")] {
            dispatch(
                &hub,
                conn,
                client(
                    ClientEvent::JoinRoom {
                        room_id: "r1".into(),
                        user_id: user.into(),
                        metadata: None,
                    },
                    user,
                ),
            );
        }
        drain_frames(&mut rx_a);
        drain_frames(&mut rx_b);

        let start_typing = || {
            client(
                ClientEvent::Typing {
                    room_id: "r1".into(),
                    is_typing: true,
                },
                "alice",
            )
        };

        dispatch(&hub, &conn_a, start_typing());
        tokio::time::sleep(Duration::from_secs(3)).await;
        dispatch(&hub, &conn_a, start_typing());
        drain_frames(&mut rx_b);

        // The first timer's deadline passes without a stop broadcast.
        tokio::time::sleep(Duration::from_millis(2_100)).await;
        assert!(drain_frames(&mut rx_b).is_empty());

        // The superseding timer fires exactly once.
        tokio::time::sleep(Duration::from_secs(3)).await;
        let frames = drain_frames(&mut rx_b);
        assert_eq!(frames.len(), 1);
        assert!(matches!(
            frames[0].event,
            ServerEvent::TypingIndicator {
                is_typing: false,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_presence_broadcasts_to_every_joined_room() {
        let (hub, _clock) = test_hub(|_| {});
        let (conn_a, mut rx_a) = connect(&hub, "alice");
        let (conn_b, mut rx_b) = connect(&hub, "bob");
        let (conn_c, mut rx_c) = connect(&hub, "carol");

        let joins = [
            (&conn_a, "alice", "r1"),
            (&conn_a, "alice", "r2"),
            (&conn_b, "bob", "r1"),
            (&conn_c, "carol", "r2"),
        ];
        for (conn, user, room) in joins {
            dispatch(
                &hub,
                conn,
                client(
                    ClientEvent::JoinRoom {
                        room_id: room.into(),
                        user_id: user.into(),
                        metadata: None,
                    },
                    user,
                ),
            );
        }
        drain_frames(&mut rx_a);
        drain_frames(&mut rx_b);
        drain_frames(&mut rx_c);

        dispatch(
            &hub,
            &conn_a,
            client(
                ClientEvent::Presence {
                    status: "away".into(),
                    room_id: None,
                },
                "alice",
            ),
        );

        for rx in [&mut rx_b, &mut rx_c] {
            let frames = drain_frames(rx);
            assert_eq!(frames.len(), 1);
            match &frames[0].event {
                ServerEvent::PresenceUpdate { user_id, status } => {
                    assert_eq!(user_id, "alice");
                    assert_eq!(status, "away");
                }
                other => panic!("Expected presence_update, got {other:?}"),
            }
        }
        assert_eq!(hub.presence().get("alice").unwrap().status, "away");
    }

    #[tokio::test]
    async fn test_search_sync_summarizes_and_excludes_sender() {
        let (hub, _clock) = test_hub(|_| {});
        let (conn_a, mut rx_a) = connect(&hub, "alice");
        let (conn_b, mut rx_b) = connect(&hub, "bob");

        for (conn, user) in [(&conn_a, "alice"), (&conn_b, "bob")] {
            dispatch(
                &hub,
                conn,
                client(
                    ClientEvent::JoinRoom {
                        room_id: "r1".into(),
                        user_id: user.into(),
                        metadata: None,
                    },
                    user,
                ),
            );
        }
        drain_frames(&mut rx_a);
        drain_frames(&mut rx_b);

        dispatch(
            &hub,
            &conn_a,
            client(
                ClientEvent::SearchSync {
                    query: "rust".into(),
                    results: json!([{"id": 1}, {"id": 2}, {"id": 3}]),
                    room_id: Some("r1".into()),
                },
                "alice",
            ),
        );

        assert!(drain_frames(&mut rx_a).is_empty());
        let frames = drain_frames(&mut rx_b);
        assert_eq!(frames.len(), 1);
        match &frames[0].event {
            ServerEvent::SearchSync {
                query,
                result_count,
                ..
            } => {
                assert_eq!(query, "rust");
                assert_eq!(*result_count, 3);
            }
            other => panic!("Expected search_sync, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_global_activity_reaches_everyone_but_sender() {
        let (hub, _clock) = test_hub(|_| {});
        let (conn_a, mut rx_a) = connect(&hub, "alice");
        let (_conn_b, mut rx_b) = connect(&hub, "bob");
        let (_conn_c, mut rx_c) = connect(&hub, "carol");

        dispatch(
            &hub,
            &conn_a,
            client(
                ClientEvent::Activity {
                    activity_type: "deploy".into(),
                    data: json!({"service": "api"}),
                    room_id: None,
                    audience: Some(Audience::Global),
                },
                "alice",
            ),
        );

        assert!(drain_frames(&mut rx_a).is_empty());
        for rx in [&mut rx_b, &mut rx_c] {
            let frames = drain_frames(rx);
            assert_eq!(frames.len(), 1);
            match &frames[0].event {
                ServerEvent::Activity {
                    activity_type,
                    audience,
                    ..
                } => {
                    assert_eq!(activity_type, "deploy");
                    assert_eq!(*audience, Audience::Global);
                }
                other => panic!("Expected activity, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_leave_deletes_empty_room_and_notifies_peers() {
        let (hub, _clock) = test_hub(|_| {});
        let (conn_a, mut rx_a) = connect(&hub, "alice");
        let (conn_b, mut rx_b) = connect(&hub, "bob");

        for (conn, user) in [(&conn_a, "alice"), (&conn_b, "bob")] {
            dispatch(
                &hub,
                conn,
                client(
                    ClientEvent::JoinRoom {
                        room_id: "r1".into(),
                        user_id: user.into(),
                        metadata: None,
                    },
                    user,
                ),
            );
        }
        drain_frames(&mut rx_a);
        drain_frames(&mut rx_b);

        dispatch(
            &hub,
            &conn_a,
            client(
                ClientEvent::LeaveRoom {
                    room_id: "r1".into(),
                },
                "alice",
            ),
        );

        let frames_a = drain_frames(&mut rx_a);
        assert_eq!(frames_a.len(), 1);
        assert!(matches!(frames_a[0].event, ServerEvent::RoomLeft { .. }));

        let frames_b = drain_frames(&mut rx_b);
        assert_eq!(frames_b.len(), 1);
        assert!(matches!(frames_b[0].event, ServerEvent::UserLeft { .. }));
        assert!(hub.registry().contains("r1"));

        dispatch(
            &hub,
            &conn_b,
            client(
                ClientEvent::LeaveRoom {
                    room_id: "r1".into(),
                },
                "bob",
            ),
        );
        assert!(!hub.registry().contains("r1"));
    }
}
