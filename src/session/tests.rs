use std::sync::Arc;

use super::*;
use crate::error::{MediaError, RelayError};
use crate::relay::MemoryRelay;
use crate::signaling::WireFormat;
use crate::testing::{candidate, description, FailingMedia, Participant};

async fn logged_in(relay: &Arc<MemoryRelay>, name: &str) -> Participant {
    let mut participant = Participant::new(relay.clone());
    participant.session.login(name).await.unwrap();
    participant.take_events();
    participant
}

/// alice calls bob and both sides process everything that follows.
async fn connected_pair(relay: &Arc<MemoryRelay>) -> (Participant, Participant) {
    let mut alice = logged_in(relay, "alice").await;
    let mut bob = logged_in(relay, "bob").await;
    alice.session.call("bob").await.unwrap();
    bob.pump().await;
    alice.pump().await;
    assert_eq!(alice.session.phase(), Phase::Connected);
    assert_eq!(bob.session.phase(), Phase::Connected);
    alice.take_events();
    bob.take_events();
    (alice, bob)
}

fn candidate_record(from: &str, line: &str) -> MailboxRecord {
    Signal::Candidate(candidate(line))
        .to_record(from, WireFormat::Json)
        .unwrap()
}

fn disconnect_alerts(events: &[SessionEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, SessionEvent::PeerDisconnected { .. }))
        .count()
}

#[tokio::test]
async fn login_reaches_local_media_ready() {
    let relay = Arc::new(MemoryRelay::new());
    let mut alice = Participant::new(relay.clone());
    alice.session.login("alice").await.unwrap();

    assert_eq!(alice.session.phase(), Phase::LocalMediaReady);
    assert_eq!(alice.session.local_user(), Some("alice"));
    assert!(alice.session.media().is_some());
    assert_eq!(
        alice.take_events(),
        vec![
            SessionEvent::LocalMediaReady,
            SessionEvent::PhaseChanged(Phase::LocalMediaReady)
        ]
    );
}

#[tokio::test]
async fn happy_path_connects_both_sides() {
    let relay = Arc::new(MemoryRelay::new());
    let mut alice = logged_in(&relay, "alice").await;
    let mut bob = logged_in(&relay, "bob").await;
    let mut bob_slot = relay.subscribe("bob").await.unwrap();
    let mut alice_slot = relay.subscribe("alice").await.unwrap();

    alice.session.call("bob").await.unwrap();
    assert_eq!(alice.session.phase(), Phase::Offering);

    let offer = match bob_slot.try_recv().unwrap() {
        SlotUpdate::Record(record) => record,
        other => panic!("unexpected {other:?}"),
    };
    assert_eq!(offer.kind, SignalKind::Offer);
    assert_eq!(offer.from, "alice");
    assert!(offer.offer.is_some());
    assert!(bob_slot.try_recv().is_err());

    bob.pump().await;
    assert_eq!(bob.session.phase(), Phase::Connected);
    assert_eq!(bob.session.remote_user(), Some("alice"));

    let answer = match alice_slot.try_recv().unwrap() {
        SlotUpdate::Record(record) => record,
        other => panic!("unexpected {other:?}"),
    };
    assert_eq!(answer.kind, SignalKind::Answer);
    assert_eq!(answer.from, "bob");
    assert!(answer.answer.is_some());

    alice.pump().await;
    assert_eq!(alice.session.phase(), Phase::Connected);
    assert!(alice.factory.last().remote_description().is_some());
    assert_eq!(alice.factory.last().attached(), 1);
    assert_eq!(bob.factory.last().attached(), 1);

    assert_eq!(
        bob.take_events(),
        vec![
            SessionEvent::PhaseChanged(Phase::OfferReceived),
            SessionEvent::PhaseChanged(Phase::AnswerSent),
            SessionEvent::PhaseChanged(Phase::Connected),
        ]
    );
}

#[tokio::test]
async fn media_connected_is_reported_with_peer_name() {
    let relay = Arc::new(MemoryRelay::new());
    let (mut alice, _bob) = connected_pair(&relay).await;

    alice.factory.last().report(ConnectivityStatus::Checking);
    alice.factory.last().report(ConnectivityStatus::Connected);
    alice.pump().await;

    assert_eq!(
        alice.take_events(),
        vec![SessionEvent::MediaConnected {
            peer: "bob".into()
        }]
    );
}

#[tokio::test]
async fn candidates_trickle_in_discovery_order() {
    let relay = Arc::new(MemoryRelay::new());
    let mut alice = logged_in(&relay, "alice").await;
    let mut bob = logged_in(&relay, "bob").await;
    let mut bob_slot = relay.subscribe("bob").await.unwrap();

    alice.session.call("bob").await.unwrap();
    let conn = alice.factory.last();
    for line in ["c1", "c2", "c3"] {
        conn.discover(&format!("candidate:{line} 1 udp 1 10.0.0.1 5000 typ host"));
    }
    alice.pump().await;

    let mut records = Vec::new();
    while let Ok(SlotUpdate::Record(record)) = bob_slot.try_recv() {
        records.push(record);
    }
    assert_eq!(records.len(), 4);
    assert_eq!(records[0].kind, SignalKind::Offer);
    let lines: Vec<_> = records[1..]
        .iter()
        .map(|r| {
            assert_eq!(r.kind, SignalKind::Candidate);
            assert_eq!(r.from, "alice");
            Signal::from_record(r).unwrap().into_candidate().unwrap().candidate
        })
        .collect();
    assert!(lines[0].starts_with("candidate:c1"));
    assert!(lines[1].starts_with("candidate:c2"));
    assert!(lines[2].starts_with("candidate:c3"));

    // c1 overtakes the offer; it waits for the remote description
    bob.session.handle_record(records[1].clone()).await;
    assert_eq!(bob.session.phase(), Phase::LocalMediaReady);
    assert!(bob.factory.last().applied_candidates().is_empty());

    bob.session.handle_record(records[0].clone()).await;
    bob.session.handle_record(records[2].clone()).await;
    bob.session.handle_record(records[3].clone()).await;

    assert_eq!(bob.session.phase(), Phase::Connected);
    let applied = bob.factory.last().applied_candidates();
    assert_eq!(applied.len(), 3);
    assert!(applied[0].starts_with("candidate:c1"));
    assert!(applied[2].starts_with("candidate:c3"));
}

#[tokio::test]
async fn candidates_found_before_the_offer_is_sent_are_flushed_after_it() {
    let relay = Arc::new(MemoryRelay::new());
    let mut alice = logged_in(&relay, "alice").await;
    let _bob = logged_in(&relay, "bob").await;

    alice
        .factory
        .last()
        .discover("candidate:0 1 udp 1 10.0.0.1 5000 typ host");
    alice.pump().await;
    assert_eq!(relay.snapshot("bob"), None);

    alice.session.call("bob").await.unwrap();
    let slot = relay.snapshot("bob").unwrap();
    assert_eq!(slot.kind, SignalKind::Candidate);
    assert!(slot.offer.is_some());
}

#[tokio::test]
async fn voluntary_hangup_clears_slots_without_alert() {
    let relay = Arc::new(MemoryRelay::new());
    let (mut alice, mut bob) = connected_pair(&relay).await;
    let alice_conn = alice.factory.last();
    let bob_conn = bob.factory.last();

    alice.session.end_call().await;
    assert_eq!(alice.session.phase(), Phase::Idle);
    assert_eq!(relay.snapshot("alice"), None);
    assert_eq!(relay.snapshot("bob"), None);
    assert!(alice_conn.is_closed());

    bob.pump().await;
    assert_eq!(bob.session.phase(), Phase::Idle);
    assert!(bob_conn.is_closed());

    let alice_events = alice.take_events();
    let bob_events = bob.take_events();
    assert_eq!(disconnect_alerts(&alice_events), 0);
    assert_eq!(disconnect_alerts(&bob_events), 0);
    assert!(alice_events.contains(&SessionEvent::CallEnded {
        peer: Some("bob".into()),
        reason: EndReason::LocalHangup,
    }));
    assert!(bob_events.contains(&SessionEvent::CallEnded {
        peer: Some("alice".into()),
        reason: EndReason::RemoteHangup,
    }));
    assert_eq!(relay.snapshot("alice"), None);
    assert_eq!(relay.snapshot("bob"), None);
}

#[tokio::test]
async fn involuntary_loss_alerts_and_tears_down() {
    let relay = Arc::new(MemoryRelay::new());
    let (mut alice, mut bob) = connected_pair(&relay).await;

    bob.factory.last().report(ConnectivityStatus::Failed);
    bob.pump().await;

    assert_eq!(bob.session.phase(), Phase::Idle);
    let events = bob.take_events();
    assert!(events.contains(&SessionEvent::PeerDisconnected {
        peer: "alice".into()
    }));
    assert!(events.contains(&SessionEvent::CallEnded {
        peer: Some("alice".into()),
        reason: EndReason::ConnectionLost,
    }));
    assert!(bob.session.media().is_none());
    assert_eq!(relay.snapshot("alice"), None);
    assert_eq!(relay.snapshot("bob"), None);

    alice.pump().await;
    assert_eq!(alice.session.phase(), Phase::Idle);
}

#[tokio::test]
async fn teardown_twice_is_harmless() {
    let relay = Arc::new(MemoryRelay::new());
    let mut alice = logged_in(&relay, "alice").await;

    alice.session.teardown().await;
    alice.session.teardown().await;

    assert_eq!(alice.session.phase(), Phase::Idle);
    assert_eq!(alice.session.local_user(), None);
    assert_eq!(relay.snapshot("alice"), None);
    assert!(!alice.session.is_listening());

    // logging out while idle does nothing either
    alice.session.end_call().await;
    assert_eq!(alice.session.phase(), Phase::Idle);
}

#[tokio::test]
async fn login_discards_stale_records() {
    let relay = Arc::new(MemoryRelay::new());
    relay
        .write_merge("alice", &candidate_record("mallory", "candidate:9 1 udp 1 1.1.1.1 1 typ host"))
        .await
        .unwrap();

    let mut alice = logged_in(&relay, "alice").await;
    assert_eq!(relay.snapshot("alice"), None);

    alice.pump().await;
    assert_eq!(alice.session.phase(), Phase::LocalMediaReady);
    assert!(alice.take_events().is_empty());
    assert!(alice.factory.last().applied_candidates().is_empty());
}

#[tokio::test]
async fn malformed_candidate_is_dropped() {
    let relay = Arc::new(MemoryRelay::new());
    let (_alice, mut bob) = connected_pair(&relay).await;
    let before = bob.factory.last().applied_candidates();

    relay
        .write_merge(
            "bob",
            &MailboxRecord::new(SignalKind::Candidate, "alice", "%%% not a candidate"),
        )
        .await
        .unwrap();
    bob.pump().await;

    assert_eq!(bob.session.phase(), Phase::Connected);
    assert_eq!(bob.factory.last().applied_candidates(), before);
    assert!(bob.take_events().is_empty());
}

#[tokio::test]
async fn candidate_from_a_stranger_is_ignored() {
    let relay = Arc::new(MemoryRelay::new());
    let (_alice, mut bob) = connected_pair(&relay).await;
    let before = bob.factory.last().applied_candidates();

    relay
        .write_merge("bob", &candidate_record("mallory", "candidate:7 1 udp 1 6.6.6.6 1 typ host"))
        .await
        .unwrap();
    bob.pump().await;

    assert_eq!(bob.factory.last().applied_candidates(), before);
}

#[tokio::test]
async fn denied_media_keeps_session_idle() {
    let relay = Arc::new(MemoryRelay::new());
    let mut alice = Participant::with_media(relay.clone(), Arc::new(FailingMedia::Denied));

    let err = alice.session.login("alice").await.unwrap_err();
    assert!(matches!(
        err,
        SessionError::MediaAcquisition(MediaError::PermissionDenied)
    ));
    assert_eq!(alice.session.phase(), Phase::Idle);
    assert!(alice.factory.created().is_empty());
}

#[tokio::test]
async fn connection_failure_keeps_session_idle() {
    let relay = Arc::new(MemoryRelay::new());
    let mut alice = Participant::new(relay.clone());
    alice.factory.set_failing(true);

    let err = alice.session.login("alice").await.unwrap_err();
    assert!(matches!(err, SessionError::ConnectionInit(_)));
    assert_eq!(alice.session.phase(), Phase::Idle);
    assert!(!alice.session.is_listening());
}

#[tokio::test]
async fn failed_offer_write_aborts_the_call_only() {
    let relay = Arc::new(MemoryRelay::new());
    let mut alice = logged_in(&relay, "alice").await;
    relay.inject_fault("bob");

    let err = alice.session.call("bob").await.unwrap_err();
    assert!(matches!(err, SessionError::Relay(RelayError::Unavailable(_))));
    assert_eq!(alice.session.phase(), Phase::LocalMediaReady);
    assert_eq!(alice.session.remote_user(), None);

    let created = alice.factory.created();
    assert_eq!(created.len(), 2);
    assert!(created[0].is_closed());
    assert!(!created[1].is_closed());

    relay.clear_faults();
    let _bob = logged_in(&relay, "bob").await;
    alice.session.call("bob").await.unwrap();
    assert_eq!(alice.session.phase(), Phase::Offering);
}

#[tokio::test]
async fn malformed_answer_ends_the_negotiation() {
    let relay = Arc::new(MemoryRelay::new());
    let mut alice = logged_in(&relay, "alice").await;
    alice.session.call("bob").await.unwrap();

    relay
        .write_merge("alice", &MailboxRecord::new(SignalKind::Answer, "bob", "{broken"))
        .await
        .unwrap();
    alice.pump().await;

    assert_eq!(alice.session.phase(), Phase::Idle);
    assert!(alice.take_events().contains(&SessionEvent::CallEnded {
        peer: Some("bob".into()),
        reason: EndReason::NegotiationFailed,
    }));
    assert_eq!(relay.snapshot("alice"), None);
    assert_eq!(relay.snapshot("bob"), None);
}

#[tokio::test]
async fn answer_without_offer_is_out_of_order() {
    let relay = Arc::new(MemoryRelay::new());
    let (_alice, mut bob) = connected_pair(&relay).await;
    bob.session.set_phase(Phase::AnswerSent);

    let answer = Signal::Answer(description("answer", "v=0\r\n"))
        .to_record("alice", WireFormat::Json)
        .unwrap();
    bob.session.handle_record(answer).await;

    assert_eq!(bob.session.phase(), Phase::Idle);
    assert!(bob.take_events().contains(&SessionEvent::CallEnded {
        peer: Some("alice".into()),
        reason: EndReason::NegotiationFailed,
    }));
}

#[tokio::test]
async fn hanging_up_before_the_answer_leaves_slots_clean() {
    let relay = Arc::new(MemoryRelay::new());
    let mut alice = logged_in(&relay, "alice").await;
    let mut bob = logged_in(&relay, "bob").await;

    alice.session.call("bob").await.unwrap();
    alice.session.end_call().await;
    assert_eq!(alice.session.phase(), Phase::Idle);

    bob.pump().await;
    assert_eq!(bob.session.phase(), Phase::Idle);
    assert_eq!(relay.snapshot("alice"), None);
    assert_eq!(relay.snapshot("bob"), None);
    assert_eq!(disconnect_alerts(&bob.take_events()), 0);
}

#[tokio::test]
async fn second_offer_is_not_resolved() {
    let relay = Arc::new(MemoryRelay::new());
    let (_alice, mut bob) = connected_pair(&relay).await;

    let offer = Signal::Offer(description("offer", "v=0\r\n"))
        .to_record("carol", WireFormat::Json)
        .unwrap();
    bob.session.handle_record(offer).await;

    assert_eq!(bob.session.phase(), Phase::Connected);
    assert_eq!(bob.session.remote_user(), Some("alice"));
}

#[tokio::test]
async fn mute_toggles_need_local_media() {
    let relay = Arc::new(MemoryRelay::new());
    let mut alice = Participant::new(relay.clone());
    assert!(!alice.session.set_audio_enabled(false));

    alice.session.login("alice").await.unwrap();
    assert!(alice.session.set_video_enabled(false));
    let media = alice.session.media().unwrap();
    assert!(!media.video().is_enabled());
    assert!(media.audio().is_enabled());
}

#[tokio::test]
async fn offer_without_sender_is_dropped() {
    let relay = Arc::new(MemoryRelay::new());
    let mut bob = logged_in(&relay, "bob").await;

    let offer = Signal::Offer(description("offer", "v=0\r\n"))
        .to_record("", WireFormat::Json)
        .unwrap();
    bob.session.handle_record(offer).await;

    assert_eq!(bob.session.phase(), Phase::LocalMediaReady);
    assert_eq!(bob.session.remote_user(), None);
    assert!(bob.factory.last().remote_description().is_none());
    assert!(bob.take_events().is_empty());

    // a later teardown has no foreign slot to touch
    bob.session.teardown().await;
    assert_eq!(bob.session.phase(), Phase::Idle);
}

#[tokio::test]
async fn callee_candidates_wait_for_the_answer() {
    let relay = Arc::new(MemoryRelay::new());
    let mut alice = logged_in(&relay, "alice").await;
    let mut bob = logged_in(&relay, "bob").await;
    let mut alice_slot = relay.subscribe("alice").await.unwrap();

    alice.session.call("bob").await.unwrap();

    // gathered before bob has looked at the offer
    bob.session
        .handle_connection_event(ConnectionEvent::LocalCandidate(candidate(
            "candidate:5 1 udp 1 10.0.0.5 5000 typ host",
        )))
        .await;
    assert_eq!(relay.snapshot("alice"), None);

    bob.pump().await;
    assert_eq!(bob.session.phase(), Phase::Connected);

    let mut records = Vec::new();
    while let Ok(SlotUpdate::Record(record)) = alice_slot.try_recv() {
        records.push(record);
    }
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].kind, SignalKind::Answer);
    assert_eq!(records[1].kind, SignalKind::Candidate);
    assert_eq!(records[1].from, "bob");
    assert!(records[1].answer.is_some());

    alice.pump().await;
    assert_eq!(alice.session.phase(), Phase::Connected);
    assert_eq!(alice.factory.last().applied_candidates().len(), 1);
}

#[tokio::test]
async fn missing_device_keeps_session_idle() {
    let relay = Arc::new(MemoryRelay::new());
    let mut alice = Participant::with_media(relay.clone(), Arc::new(FailingMedia::NoDevice));

    let err = alice.session.login("alice").await.unwrap_err();
    assert!(matches!(err, SessionError::MediaAcquisition(MediaError::NoDevice)));
    assert_eq!(alice.session.phase(), Phase::Idle);
}
