use std::sync::Arc;
use std::time::Duration;

use huddle_common::key::layout;
use huddle_common::{
    HuddleError, MediaError, MembershipRecord, ParticipantId, PresenceRecord, RoomId,
};
use tokio::sync::mpsc;

use super::*;
use crate::identity::Participant;
use crate::media::DeviceKind;
use crate::medium::memory::{MemoryClient, MemoryMedium};
use crate::medium::SignalingMedium;
use crate::session::{Role, SessionPhase};
use crate::testing::{wait_for, SimFactory, SimMedia};
use crate::transport::ConnectionState;

struct Node {
    id: ParticipantId,
    mesh: MeshCoordinator,
    events: mpsc::UnboundedReceiver<MeshEvent>,
    client: Arc<MemoryClient>,
    media: Arc<SimMedia>,
    factory: SimFactory,
}

fn config() -> MeshConfig {
    MeshConfig::default()
}

fn node(medium: &MemoryMedium, id: &str, config: MeshConfig) -> Node {
    let client = Arc::new(medium.connect());
    let media = Arc::new(SimMedia::new());
    let factory = SimFactory::new();
    let (mesh, events) = MeshCoordinator::spawn(
        Participant::new(id, id.to_uppercase()),
        client.clone(),
        Arc::new(factory.clone()),
        media.clone(),
        config,
    );
    Node {
        id: ParticipantId::from(id),
        mesh,
        events,
        client,
        media,
        factory,
    }
}

fn room() -> RoomId {
    RoomId::from("lobby")
}

/// Wait until the node's snapshot satisfies `check`.
async fn settle(node: &Node, check: impl Fn(&MeshSnapshot) -> bool) -> MeshSnapshot {
    let mut rx = node.mesh.watch();
    let result = tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| check(s))).await;
    match result {
        Ok(Ok(snapshot)) => snapshot.clone(),
        _ => panic!("{} never settled: {:#?}", node.id, node.mesh.snapshot()),
    }
}

fn fully_connected(snapshot: &MeshSnapshot, peers: usize) -> bool {
    snapshot.peers.len() == peers
        && snapshot.connected_peers().len() == peers
        && snapshot.remote_streams.len() == peers
}

/// Skip events until one matches.
async fn expect_event(node: &mut Node, matches: impl Fn(&MeshEvent) -> bool) -> MeshEvent {
    let wait = async {
        while let Some(event) = node.events.recv().await {
            if matches(&event) {
                return event;
            }
        }
        panic!("event channel closed");
    };
    tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .unwrap_or_else(|_| panic!("expected event not seen by {}", node.id))
}

#[tokio::test]
async fn three_members_form_three_pairs() {
    let medium = MemoryMedium::new();
    let nodes = [
        node(&medium, "a", config()),
        node(&medium, "b", config()),
        node(&medium, "c", config()),
    ];
    for n in &nodes {
        n.mesh.join(room()).await.unwrap();
    }

    let mut offers = 0;
    for n in &nodes {
        let snapshot = settle(n, |s| fully_connected(s, 2)).await;
        assert!(!snapshot.peers.contains_key(&n.id));
        for (remote, peer) in &snapshot.peers {
            assert_eq!(peer.role, Role::for_pair(&n.id, remote));
            if peer.role == Role::Offerer {
                offers += 1;
            }
        }
    }
    // One offerer per pair.
    assert_eq!(offers, 3);

    let a = settle(&nodes[0], |s| fully_connected(s, 2)).await;
    assert!(a.peers.values().all(|p| p.role == Role::Offerer));
    let c = settle(&nodes[2], |s| fully_connected(s, 2)).await;
    assert!(c.peers.values().all(|p| p.role == Role::Answerer));
}

#[tokio::test]
async fn concurrent_joins_all_connect() {
    let medium = MemoryMedium::new();
    let nodes: Vec<Node> = ["d", "b", "e", "a", "c"]
        .iter()
        .map(|id| node(&medium, id, config()))
        .collect();

    let joins = nodes.iter().map(|n| n.mesh.join(room()));
    for result in futures_util::future::join_all(joins).await {
        result.unwrap();
    }

    for n in &nodes {
        let snapshot = settle(n, |s| fully_connected(s, 4)).await;
        assert!(snapshot
            .peers
            .values()
            .all(|p| p.phase == SessionPhase::Connected));
    }
}

#[tokio::test]
async fn leave_cleans_up_everything_it_wrote() {
    let medium = MemoryMedium::new();
    let mut a = node(&medium, "a", config());
    let b = node(&medium, "b", config());
    a.mesh.join(room()).await.unwrap();
    b.mesh.join(room()).await.unwrap();
    settle(&a, |s| fully_connected(s, 1)).await;
    settle(&b, |s| fully_connected(s, 1)).await;

    a.mesh.leave().await.unwrap();
    expect_event(&mut a, |e| matches!(e, MeshEvent::Left { .. })).await;

    let snapshot = a.mesh.snapshot();
    assert!(!snapshot.is_joined());
    assert!(snapshot.peers.is_empty());
    assert_eq!(snapshot.local_stream, None);
    assert_eq!(a.media.open_streams(), 0);
    assert_eq!(a.factory.log("b").closed, 1);

    assert!(medium.get(&layout::member(&room(), &a.id)).is_none());
    // Only the presence write stays armed.
    assert_eq!(a.client.pending_disconnect_writes(), 1);

    settle(&b, |s| s.peers.is_empty()).await;
    let root = layout::room_root(&room());
    wait_for(|| {
        let records = medium.records_under(&root);
        records.len() == 1 && records[0].0 == layout::member(&room(), &b.id)
    })
    .await;
}

#[tokio::test]
async fn severed_medium_tears_down_both_sides() {
    let medium = MemoryMedium::new();
    let mut a = node(&medium, "a", config());
    let mut b = node(&medium, "b", config());
    a.mesh.join(room()).await.unwrap();
    b.mesh.join(room()).await.unwrap();
    settle(&a, |s| fully_connected(s, 1)).await;
    settle(&b, |s| fully_connected(s, 1)).await;

    b.client.sever();

    let presence = medium.get(&layout::presence(&b.id)).unwrap();
    assert_eq!(presence["is_online"], false);
    assert!(medium.get(&layout::member(&room(), &b.id)).is_none());

    expect_event(&mut a, |e| matches!(e, MeshEvent::ParticipantLeft { .. })).await;
    let snapshot = settle(&a, |s| s.peers.is_empty()).await;
    assert!(snapshot.remote_streams.is_empty());

    expect_event(&mut b, |e| *e == MeshEvent::SignalingUnavailable).await;
    let snapshot = settle(&b, |s| !s.connected_to_medium).await;
    assert!(snapshot.peers.is_empty());
    assert!(snapshot.is_joined());

    // Back online: presence, membership and the pair come back.
    b.client.restore();
    expect_event(&mut b, |e| *e == MeshEvent::Reconnected).await;
    settle(&a, |s| fully_connected(s, 1)).await;
    settle(&b, |s| fully_connected(s, 1)).await;
    wait_for(|| {
        medium
            .get(&layout::presence(&b.id))
            .is_some_and(|v| v["is_online"] == true)
    })
    .await;
}

#[tokio::test]
async fn offline_member_is_evicted() {
    let medium = MemoryMedium::new();
    let mut a = node(&medium, "a", config());
    a.mesh.join(room()).await.unwrap();

    // A member whose client vanished without its disconnect writes firing.
    let ghost = ParticipantId::from("ghost");
    let writer = medium.connect();
    writer
        .put(
            &layout::member(&room(), &ghost),
            MembershipRecord::new(ghost.clone(), "Ghost").to_value(),
        )
        .await
        .unwrap();
    settle(&a, |s| s.peers.contains_key(&ghost)).await;

    writer
        .put(&layout::presence(&ghost), PresenceRecord::offline().to_value())
        .await
        .unwrap();

    let event = expect_event(&mut a, |e| matches!(e, MeshEvent::Evicted { .. })).await;
    assert_eq!(event, MeshEvent::Evicted { participant: ghost.clone() });
    settle(&a, |s| s.peers.is_empty()).await;
    assert!(medium.get(&layout::member(&room(), &ghost)).is_none());
    assert!(medium.get(&layout::offer(&room(), &ghost, &a.id)).is_none());
}

#[tokio::test]
async fn presence_from_before_joining_does_not_evict() {
    let medium = MemoryMedium::new();
    let writer = medium.connect();
    let ghost = ParticipantId::from("ghost");
    writer
        .put(&layout::presence(&ghost), PresenceRecord::offline().to_value())
        .await
        .unwrap();
    writer
        .put(
            &layout::member(&room(), &ghost),
            MembershipRecord::new(ghost.clone(), "Ghost").to_value(),
        )
        .await
        .unwrap();

    let a = node(&medium, "a", config());
    a.mesh.join(room()).await.unwrap();
    settle(&a, |s| s.peers.contains_key(&ghost)).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(medium.get(&layout::member(&room(), &ghost)).is_some());
}

#[tokio::test]
async fn mute_and_deafen() {
    let medium = MemoryMedium::new();
    let mut a = node(&medium, "a", config());
    a.mesh.join(room()).await.unwrap();
    let stream = a.media.last_stream().unwrap();

    a.mesh.set_muted(true).await.unwrap();
    assert!(stream.is_muted());
    assert!(a.mesh.snapshot().muted);
    expect_event(&mut a, |e| *e == MeshEvent::MuteChanged { muted: true }).await;

    a.mesh.set_muted(false).await.unwrap();
    assert!(!stream.is_muted());

    a.mesh.set_deafened(true).await.unwrap();
    let snapshot = a.mesh.snapshot();
    assert!(snapshot.deafened);
    assert!(snapshot.muted);
    assert!(stream.is_muted());

    // Undeafening does not unmute.
    a.mesh.set_deafened(false).await.unwrap();
    let snapshot = a.mesh.snapshot();
    assert!(!snapshot.deafened);
    assert!(snapshot.muted);
}

#[tokio::test]
async fn mute_carries_into_the_next_join() {
    let medium = MemoryMedium::new();
    let a = node(&medium, "a", config());
    a.mesh.set_muted(true).await.unwrap();
    a.mesh.join(room()).await.unwrap();
    assert!(a.media.last_stream().unwrap().is_muted());
}

#[tokio::test]
async fn switching_devices_rejoins_with_the_new_stream() {
    let medium = MemoryMedium::new();
    let mut a = node(&medium, "a", config());
    let b = node(&medium, "b", config());
    a.mesh.join(room()).await.unwrap();
    b.mesh.join(room()).await.unwrap();
    settle(&a, |s| fully_connected(s, 1)).await;

    a.mesh
        .select_input_device(Some("usb-mic".into()))
        .await
        .unwrap();
    expect_event(&mut a, |e| matches!(e, MeshEvent::InputDeviceChanged { .. })).await;

    let stream = a.media.last_stream().unwrap();
    assert_eq!(stream.device.as_deref(), Some("usb-mic"));
    assert_eq!(a.media.open_streams(), 1);

    let snapshot = settle(&a, |s| fully_connected(s, 1)).await;
    assert_eq!(snapshot.local_stream.as_deref(), Some(stream.id.as_str()));
    assert_eq!(snapshot.input_device.as_deref(), Some("usb-mic"));
    settle(&b, |s| fully_connected(s, 1)).await;
}

#[tokio::test]
async fn failed_device_switch_keeps_the_current_stream() {
    let medium = MemoryMedium::new();
    let a = node(&medium, "a", config());
    a.mesh.join(room()).await.unwrap();
    let before = a.mesh.snapshot();

    a.media.remove_device("broken");
    let err = a
        .mesh
        .select_input_device(Some("broken".into()))
        .await
        .unwrap_err();
    assert!(matches!(err, HuddleError::Media(MediaError::DeviceNotFound(_))));

    let after = a.mesh.snapshot();
    assert_eq!(after.local_stream, before.local_stream);
    assert_eq!(after.input_device, None);
    assert!(after.is_joined());
}

#[tokio::test]
async fn device_selection_outside_a_room_is_remembered() {
    let medium = MemoryMedium::new();
    let a = node(&medium, "a", config());
    a.mesh
        .select_input_device(Some("usb-mic".into()))
        .await
        .unwrap();
    assert_eq!(a.media.open_streams(), 0);

    a.mesh.join(room()).await.unwrap();
    let stream = a.media.last_stream().unwrap();
    assert_eq!(stream.device.as_deref(), Some("usb-mic"));
}

#[tokio::test]
async fn devices_are_listed_by_kind() {
    let medium = MemoryMedium::new();
    let a = node(&medium, "a", config());
    a.media.remove_device("speakers");

    let devices = a.mesh.devices().await.unwrap();
    let ids = |kind| {
        crate::media::devices_of(&devices, kind)
            .into_iter()
            .map(|d| d.id)
            .collect::<Vec<_>>()
    };
    assert_eq!(ids(DeviceKind::Input), vec!["default", "usb-mic"]);
    assert_eq!(ids(DeviceKind::Output), vec!["default", "headset"]);
}

#[tokio::test]
async fn output_device_selection_is_checked_and_published() {
    let medium = MemoryMedium::new();
    let mut a = node(&medium, "a", config());

    a.mesh
        .select_output_device(Some("headset".into()))
        .await
        .unwrap();
    expect_event(&mut a, |e| {
        matches!(e, MeshEvent::OutputDeviceChanged { device } if device.as_deref() == Some("headset"))
    })
    .await;
    assert_eq!(a.media.output().as_deref(), Some("headset"));
    settle(&a, |s| s.output_device.as_deref() == Some("headset")).await;

    // Inputs are not outputs.
    let err = a
        .mesh
        .select_output_device(Some("usb-mic".into()))
        .await
        .unwrap_err();
    assert!(matches!(err, HuddleError::Media(MediaError::DeviceNotFound(_))));
    assert_eq!(a.mesh.snapshot().output_device.as_deref(), Some("headset"));

    a.mesh.select_output_device(None).await.unwrap();
    assert_eq!(a.media.output(), None);
    settle(&a, |s| s.output_device.is_none()).await;
}

#[tokio::test]
async fn configured_output_device_is_applied_at_start() {
    let medium = MemoryMedium::new();
    let with_speakers = MeshConfig {
        output_device: Some("speakers".into()),
        ..config()
    };
    let a = node(&medium, "a", with_speakers);
    settle(&a, |s| s.output_device.as_deref() == Some("speakers")).await;
    assert_eq!(a.media.output().as_deref(), Some("speakers"));

    let missing = MeshConfig {
        output_device: Some("hdmi".into()),
        ..config()
    };
    let b = node(&medium, "b", missing);
    // The actor has finished starting once it answers a command.
    b.mesh.devices().await.unwrap();
    assert_eq!(b.mesh.snapshot().output_device, None);
    assert_eq!(b.media.output(), None);
}

#[tokio::test]
async fn media_failure_aborts_join_without_writes() {
    let medium = MemoryMedium::new();
    let a = node(&medium, "a", config());
    a.media.remove_device("default");

    let err = a.mesh.join(room()).await.unwrap_err();
    assert!(matches!(err, HuddleError::Media(_)));
    assert!(!a.mesh.snapshot().is_joined());
    assert!(medium.records_under(&layout::room_root(&room())).is_empty());
}

#[tokio::test]
async fn full_room_rejects_join() {
    let medium = MemoryMedium::new();
    let small = MeshConfig {
        max_participants: 2,
        ..config()
    };
    let a = node(&medium, "a", small.clone());
    let b = node(&medium, "b", small.clone());
    let c = node(&medium, "c", small);
    a.mesh.join(room()).await.unwrap();
    b.mesh.join(room()).await.unwrap();

    let err = c.mesh.join(room()).await.unwrap_err();
    assert!(matches!(err, HuddleError::RoomFull(_)));
    assert!(medium.get(&layout::member(&room(), &c.id)).is_none());
    assert_eq!(c.media.open_streams(), 0);
    assert!(!c.mesh.snapshot().is_joined());
}

#[tokio::test]
async fn joining_twice_is_rejected() {
    let medium = MemoryMedium::new();
    let a = node(&medium, "a", config());
    a.mesh.join(room()).await.unwrap();
    let err = a.mesh.join(room()).await.unwrap_err();
    assert!(matches!(err, HuddleError::AlreadyJoined(_)));
}

#[tokio::test]
async fn disabled_voice_rejects_join() {
    let medium = MemoryMedium::new();
    let disabled = MeshConfig {
        enabled: false,
        ..config()
    };
    let a = node(&medium, "a", disabled);
    let err = a.mesh.join(room()).await.unwrap_err();
    assert!(matches!(err, HuddleError::Disabled));
    assert_eq!(a.media.acquired(), 0);
}

#[tokio::test]
async fn transport_failure_is_scoped_to_the_pair() {
    let medium = MemoryMedium::new();
    let mut a = node(&medium, "a", config());
    let b = node(&medium, "b", config());
    let c = node(&medium, "c", config());
    for n in [&a, &b, &c] {
        n.mesh.join(room()).await.unwrap();
    }
    settle(&a, |s| fully_connected(s, 2)).await;

    a.factory.report_state("b", ConnectionState::Failed);
    expect_event(&mut a, |e| matches!(e, MeshEvent::PeerFailed { .. })).await;

    let snapshot = settle(&a, |s| {
        s.peers
            .get(&ParticipantId::from("b"))
            .is_some_and(|p| p.phase == SessionPhase::Failed)
    })
    .await;
    let c_peer = &snapshot.peers[&ParticipantId::from("c")];
    assert_eq!(c_peer.phase, SessionPhase::Connected);
    assert!(!snapshot.remote_streams.contains_key(&ParticipantId::from("b")));
    assert!(snapshot.remote_streams.contains_key(&ParticipantId::from("c")));
}

#[tokio::test]
async fn shutdown_deactivates_presence() {
    let medium = MemoryMedium::new();
    let a = node(&medium, "a", config());
    a.mesh.join(room()).await.unwrap();
    wait_for(|| {
        medium
            .get(&layout::presence(&a.id))
            .is_some_and(|v| v["is_online"] == true)
    })
    .await;

    a.mesh.shutdown().await.unwrap();
    let presence = medium.get(&layout::presence(&a.id)).unwrap();
    assert_eq!(presence["is_online"], false);
    assert_eq!(a.client.pending_disconnect_writes(), 0);
    assert!(matches!(a.mesh.leave().await, Err(HuddleError::Stopped)));
}
