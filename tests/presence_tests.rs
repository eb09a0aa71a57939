//! Presence tests through the channel dispatcher: the store's open
//! participations track the live registry.

use huddle::{
    db::Store,
    rooms::{
        channel::Signaling,
        msg::{ClientEvent, JoinRoom, Negotiation, PeerAddress, ServerEvent},
        registry::Registry,
    },
};
use serde_json::json;
use tokio::sync::mpsc;

async fn setup() -> Result<Signaling, anyhow::Error> {
    let store = Store::in_memory().await?;
    let alice = store.get_or_create_user("alice").await?;
    store.create_room("abc123", "Standup", alice).await?;
    Ok(Signaling::new(store, Registry::new(), 64))
}

fn join(username: &str) -> ClientEvent {
    ClientEvent::JoinRoom(JoinRoom {
        room_id: Some("abc123".into()),
        username: Some(username.into()),
        user_id: None,
    })
}

fn drain(rx: &mut mpsc::Receiver<ServerEvent>) -> Vec<ServerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

async fn assert_consistent(signaling: &Signaling) -> Result<(), anyhow::Error> {
    let open = signaling.presence().store().count_active_participants("abc123").await?;
    let live = signaling.registry().peer_count("abc123").await;
    assert_eq!(open, live as i64, "open participations must match live peers");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_joins_and_disconnects_stay_consistent() -> Result<(), anyhow::Error> {
    let signaling = setup().await?;

    let mut tasks = Vec::new();
    for i in 0..16 {
        let signaling = signaling.clone();
        tasks.push(tokio::spawn(async move {
            let (mut ctx, _rx) = signaling.connect(None);
            signaling.handle(&mut ctx, join(&format!("user{i}"))).await;
            if i % 2 == 0 {
                signaling.disconnect(&mut ctx).await;
            }
            ctx
        }));
    }

    let mut remaining = Vec::new();
    for task in tasks {
        remaining.push(task.await?);
    }

    assert_eq!(signaling.registry().peer_count("abc123").await, 8);
    assert_consistent(&signaling).await?;

    for mut ctx in remaining {
        signaling.disconnect(&mut ctx).await;
    }
    assert_consistent(&signaling).await?;
    assert!(signaling.registry().existing("abc123").is_none());

    Ok(())
}

#[tokio::test]
async fn test_same_user_twice_keeps_one_open_participation() -> Result<(), anyhow::Error> {
    let signaling = setup().await?;
    let (mut first, _rx1) = signaling.connect(None);
    let (mut second, _rx2) = signaling.connect(None);

    signaling.handle(&mut first, join("bob")).await;
    signaling.handle(&mut second, join("bob")).await;

    assert_eq!(signaling.presence().store().count_active_participants("abc123").await?, 1);
    assert_consistent(&signaling).await?;

    // the replaced channel closing must not take bob out of the room
    signaling.disconnect(&mut first).await;
    assert_eq!(signaling.registry().peer_count("abc123").await, 1);
    assert_consistent(&signaling).await?;

    signaling.disconnect(&mut second).await;
    assert_consistent(&signaling).await?;

    Ok(())
}

/// Alice and Bob join, exchange an offer and an answer, and Bob drops.
#[tokio::test]
async fn test_two_party_call() -> Result<(), anyhow::Error> {
    let signaling = setup().await?;
    let (mut alice, mut alice_rx) = signaling.connect(None);
    let (mut bob, mut bob_rx) = signaling.connect(None);

    signaling.handle(&mut alice, join("alice")).await;
    signaling.handle(&mut bob, join("bob")).await;

    let alice_id = alice.membership().map(|m| m.user_id).unwrap_or_default();
    let bob_id = bob.membership().map(|m| m.user_id).unwrap_or_default();

    let alice_events = drain(&mut alice_rx);
    assert!(matches!(alice_events.last(), Some(ServerEvent::UserJoined { user_id, .. }) if *user_id == bob_id));
    let bob_events = drain(&mut bob_rx);
    assert!(matches!(bob_events.last(), Some(ServerEvent::RoomUsers(roster)) if roster.len() == 2));

    signaling
        .handle(
            &mut alice,
            ClientEvent::WebrtcOffer(Negotiation {
                room_id: Some("abc123".into()),
                from_user: None,
                target_user: Some(PeerAddress::Id(bob_id)),
                payload: Some(json!({ "type": "offer", "sdp": "v=0" })),
            }),
        )
        .await;
    assert_eq!(
        drain(&mut bob_rx),
        vec![ServerEvent::WebrtcOffer {
            offer: json!({ "type": "offer", "sdp": "v=0" }),
            from_user: PeerAddress::Id(alice_id),
            target_user: Some(PeerAddress::Id(bob_id)),
        }]
    );

    signaling
        .handle(
            &mut bob,
            ClientEvent::WebrtcAnswer(Negotiation {
                room_id: Some("abc123".into()),
                from_user: Some(PeerAddress::Name("bob".into())),
                target_user: Some(PeerAddress::Name("alice".into())),
                payload: Some(json!({ "type": "answer", "sdp": "v=0" })),
            }),
        )
        .await;
    assert!(matches!(drain(&mut alice_rx).as_slice(), [ServerEvent::WebrtcAnswer { .. }]));

    signaling.disconnect(&mut bob).await;
    signaling.disconnect(&mut bob).await;
    assert_eq!(
        drain(&mut alice_rx),
        vec![ServerEvent::UserLeft {
            username: "bob".into(),
            user_id: bob_id,
        }]
    );
    assert_consistent(&signaling).await?;

    Ok(())
}

#[tokio::test]
async fn test_restart_closes_orphaned_participations() -> Result<(), anyhow::Error> {
    let signaling = setup().await?;
    let (mut bob, _rx) = signaling.connect(None);
    signaling.handle(&mut bob, join("bob")).await;

    // a fresh registry over the same store, as after a restart
    let store = signaling.presence().store().clone();
    assert_eq!(store.close_orphaned_participations().await?, 1);
    let restarted = Signaling::new(store, Registry::new(), 64);
    assert_consistent(&restarted).await?;

    Ok(())
}

#[tokio::test]
async fn test_rejected_identities_leave_no_live_peer() -> Result<(), anyhow::Error> {
    let signaling = setup().await?;
    let (mut ctx, _rx) = signaling.connect(None);

    signaling
        .handle(
            &mut ctx,
            ClientEvent::JoinRoom(JoinRoom {
                room_id: Some("abc123".into()),
                username: Some("bob".into()),
                user_id: Some(999),
            }),
        )
        .await;

    assert!(ctx.membership().is_none());
    assert_eq!(signaling.registry().peer_count("abc123").await, 0);
    assert_consistent(&signaling).await?;

    Ok(())
}
