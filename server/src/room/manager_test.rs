//! Tests for room membership and signaling routing.

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::sync::mpsc;
    use uuid::Uuid;

    use crate::agent::testutil::{CannedLlm, RecordingVector, ToyEmbedder};
    use crate::agent::UnconfiguredCustomerDirectory;
    use crate::config::Config;
    use crate::persistence::MemoryPersistence;
    use crate::room::manager::{Collaborators, RoomManager};
    use crate::signal::messages::{ClientEvent, Envelope, ServerEvent};
    use crate::signal::ClientHandle;

    fn test_manager() -> Arc<RoomManager> {
        let collaborators = Collaborators {
            persistence: Arc::new(MemoryPersistence::new()),
            llm: Arc::new(CannedLlm),
            vector: Arc::new(RecordingVector::new()),
            embedder: Arc::new(ToyEmbedder),
            customers: Arc::new(UnconfiguredCustomerDirectory),
            stt: None,
        };
        Arc::new(
            RoomManager::new(Arc::new(Config::default_for_test()), collaborators)
                .expect("manager builds"),
        )
    }

    fn connect(manager: &Arc<RoomManager>) -> (ClientHandle, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(64);
        let handle = ClientHandle::new(Uuid::new_v4(), tx);
        manager.register_client(handle.clone());
        (handle, rx)
    }

    fn join_event(room: &str, nickname: &str, agent_code: Option<&str>) -> ClientEvent {
        ClientEvent::JoinRoom {
            room_name: room.into(),
            nickname: nickname.into(),
            phone_number: None,
            agent_code: agent_code.map(ToString::to_string),
        }
    }

    async fn next_event(rx: &mut mpsc::Receiver<Envelope>) -> ServerEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("event stalled")
            .expect("channel closed")
            .event
    }

    #[tokio::test]
    async fn join_creates_room_and_reports_roster() {
        let manager = test_manager();
        let (handle, mut rx) = connect(&manager);

        manager
            .route(handle.peer_id, join_event("R", "상담사김", Some("A-7")))
            .await;

        match next_event(&mut rx).await {
            ServerEvent::RoomJoined {
                room_name,
                peer_count,
                other_peers,
                ..
            } => {
                assert_eq!(room_name, "R");
                assert_eq!(peer_count, 1);
                assert!(other_peers.is_empty());
            }
            other => panic!("expected room_joined, got {other:?}"),
        }
        assert!(matches!(
            next_event(&mut rx).await,
            ServerEvent::AgentReady { .. }
        ));
        assert_eq!(manager.room_count().await, 1);
    }

    #[tokio::test]
    async fn second_joiner_lands_in_same_room_and_is_announced() {
        let manager = test_manager();
        let (agent, mut agent_rx) = connect(&manager);
        let (customer, mut customer_rx) = connect(&manager);

        manager
            .route(agent.peer_id, join_event("R", "상담사김", Some("A-7")))
            .await;
        let _ = next_event(&mut agent_rx).await;
        let _ = next_event(&mut agent_rx).await;

        manager
            .route(customer.peer_id, join_event("R", "고객이", None))
            .await;

        match next_event(&mut customer_rx).await {
            ServerEvent::RoomJoined {
                peer_count,
                other_peers,
                ..
            } => {
                assert_eq!(peer_count, 2);
                assert_eq!(other_peers.len(), 1);
                assert_eq!(other_peers[0].nickname, "상담사김");
            }
            other => panic!("expected room_joined, got {other:?}"),
        }

        match next_event(&mut agent_rx).await {
            ServerEvent::UserJoined {
                peer_id,
                nickname,
                peer_count,
                ..
            } => {
                assert_eq!(peer_id, customer.peer_id);
                assert_eq!(nickname, "고객이");
                assert_eq!(peer_count, 2);
            }
            other => panic!("expected user_joined, got {other:?}"),
        }

        assert_eq!(manager.room_count().await, 1);
    }

    #[tokio::test]
    async fn duplicate_join_is_rejected() {
        let manager = test_manager();
        let (handle, mut rx) = connect(&manager);

        manager
            .route(handle.peer_id, join_event("R", "고객이", None))
            .await;
        let _ = next_event(&mut rx).await;
        let _ = next_event(&mut rx).await;

        manager
            .route(handle.peer_id, join_event("R", "고객이", None))
            .await;

        match next_event(&mut rx).await {
            ServerEvent::Error { message } => {
                assert!(message.contains("already joined"), "got: {message}");
            }
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn join_leave_restores_membership_and_destroys_empty_room() {
        let manager = test_manager();
        let (handle, mut rx) = connect(&manager);

        manager
            .route(handle.peer_id, join_event("R", "고객이", None))
            .await;
        let _ = next_event(&mut rx).await;
        let _ = next_event(&mut rx).await;
        assert_eq!(manager.room_count().await, 1);

        manager
            .route(handle.peer_id, ClientEvent::LeaveRoom {})
            .await;

        assert_eq!(manager.room_count().await, 0);
    }

    #[tokio::test]
    async fn join_to_ended_room_is_rejected() {
        let manager = test_manager();
        let (first, mut first_rx) = connect(&manager);

        manager
            .route(first.peer_id, join_event("R", "상담사김", Some("A-7")))
            .await;
        let _ = next_event(&mut first_rx).await;
        let _ = next_event(&mut first_rx).await;

        manager.get_room("R").await.unwrap().end().await;

        let (second, mut second_rx) = connect(&manager);
        manager
            .route(second.peer_id, join_event("R", "고객이", None))
            .await;

        match next_event(&mut second_rx).await {
            ServerEvent::Error { message } => {
                assert!(message.contains("room closed"), "got: {message}");
            }
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn simultaneous_joins_share_one_room_instance() {
        let manager = test_manager();
        let (a, mut a_rx) = connect(&manager);
        let (b, mut b_rx) = connect(&manager);

        let manager_a = Arc::clone(&manager);
        let manager_b = Arc::clone(&manager);
        let a_id = a.peer_id;
        let b_id = b.peer_id;
        let (left, right) = tokio::join!(
            tokio::spawn(async move {
                manager_a
                    .route(a_id, join_event("동시", "상담사김", Some("A-7")))
                    .await;
            }),
            tokio::spawn(async move {
                manager_b.route(b_id, join_event("동시", "고객이", None)).await;
            }),
        );
        left.unwrap();
        right.unwrap();

        assert_eq!(manager.room_count().await, 1);
        let room = manager.get_room("동시").await.unwrap();
        assert_eq!(room.peer_count().await, 2);
        assert!(room.get_peer(a_id).await.is_some());
        assert!(room.get_peer(b_id).await.is_some());

        assert!(matches!(
            next_event(&mut a_rx).await,
            ServerEvent::RoomJoined { .. }
        ));
        assert!(matches!(
            next_event(&mut b_rx).await,
            ServerEvent::RoomJoined { .. }
        ));
    }

    #[tokio::test]
    async fn reconnecting_peer_is_a_new_identity() {
        let manager = test_manager();
        let (old, mut old_rx) = connect(&manager);

        manager
            .route(old.peer_id, join_event("R", "고객이", None))
            .await;
        let _ = next_event(&mut old_rx).await;
        let _ = next_event(&mut old_rx).await;

        // Transport drop: the peer leaves and its id is retired.
        manager.disconnect(old.peer_id).await;
        assert_eq!(manager.room_count().await, 0);

        // The same human reconnects with the same nickname; the server
        // minted a fresh id and the old one has no standing.
        let (fresh, mut fresh_rx) = connect(&manager);
        assert_ne!(fresh.peer_id, old.peer_id);
        manager
            .route(fresh.peer_id, join_event("R", "고객이", None))
            .await;
        assert!(matches!(
            next_event(&mut fresh_rx).await,
            ServerEvent::RoomJoined { .. }
        ));

        let room = manager.get_room("R").await.unwrap();
        assert!(room.get_peer(old.peer_id).await.is_none());
        assert!(room.get_peer(fresh.peer_id).await.is_some());
    }

    #[tokio::test]
    async fn offer_without_membership_is_a_resource_error() {
        let manager = test_manager();
        let (handle, mut rx) = connect(&manager);

        manager
            .route(
                handle.peer_id,
                ClientEvent::Offer {
                    sdp: "v=0".into(),
                    kind: "offer".into(),
                },
            )
            .await;

        match next_event(&mut rx).await {
            ServerEvent::Error { message } => {
                assert!(message.contains("not in a room"), "got: {message}");
            }
            other => panic!("expected error, got {other:?}"),
        }
    }
}
