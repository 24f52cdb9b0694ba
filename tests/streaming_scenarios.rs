mod common;

use std::time::Duration;

use chat_stream_sync::config::StreamSettings;
use chat_stream_sync::protocol::{ClientCommand, CommandKind, RejectCode, ServerEvent};
use chat_stream_sync::registry::Subscription;

use common::{next_event, next_stream_event, pending, ControlledGeneration, Harness};

fn start(conversation_id: &str, stream_id: &str) -> ServerEvent {
    ServerEvent::Start {
        conversation_id: conversation_id.to_string(),
        stream_id: stream_id.to_string(),
    }
}

fn fragment(stream_id: &str, index: u32, text: &str) -> ServerEvent {
    ServerEvent::Fragment {
        stream_id: stream_id.to_string(),
        index,
        text: text.to_string(),
    }
}

#[tokio::test]
async fn submit_streams_and_persists_one_message() {
    let mut h = Harness::new();
    let c1 = h.conversation().await;
    let (conn, mut rx) = h.svc.connect("alice").await;
    assert_eq!(next_event(&mut rx).await, ServerEvent::Connected);

    let s1 = h.svc.submit("alice", conn, &c1, "hi").await.unwrap();
    assert_eq!(next_event(&mut rx).await, pending(&c1, true));
    assert_eq!(next_event(&mut rx).await, start(&c1, &s1));

    let generation = h.next_generation().await;
    assert_eq!(generation.request.user_content, "hi");
    assert!(generation.request.prior_messages.is_empty());
    generation.delta("He");
    generation.delta("llo");
    generation.done();

    assert_eq!(next_event(&mut rx).await, fragment(&s1, 0, "He"));
    assert_eq!(next_event(&mut rx).await, fragment(&s1, 1, "llo"));
    let ServerEvent::Complete { stream_id, message_id, final_text } = next_event(&mut rx).await
    else {
        panic!("expected complete");
    };
    assert_eq!(stream_id, s1);
    assert_eq!(final_text, "Hello");
    assert_eq!(next_event(&mut rx).await, pending(&c1, false));

    assert_eq!(h.assistant_messages(&c1).await, vec![(message_id, "Hello".to_string())]);
    assert!(!h.svc.registry().is_active(&c1));
}

#[tokio::test]
async fn second_turn_replays_prior_history() {
    let mut h = Harness::new();
    let c1 = h.conversation().await;
    let (conn, mut rx) = h.svc.connect("alice").await;

    h.svc.submit("alice", conn, &c1, "hi").await.unwrap();
    let first = h.next_generation().await;
    first.delta("Hello");
    first.done();
    while !matches!(next_event(&mut rx).await, ServerEvent::Complete { .. }) {}

    h.svc.submit("alice", conn, &c1, "again").await.unwrap();
    let second = h.next_generation().await;
    let history: Vec<&str> = second
        .request
        .prior_messages
        .iter()
        .map(|m| m.content.as_str())
        .collect();
    assert_eq!(history, vec!["hi", "Hello"]);
}

#[tokio::test]
async fn reconnect_catches_up_from_accumulated_text() {
    let mut h = Harness::new();
    let c1 = h.conversation().await;
    let (first_conn, mut first_rx) = h.svc.connect("alice").await;
    next_event(&mut first_rx).await;

    let s1 = h.svc.submit("alice", first_conn, &c1, "hi").await.unwrap();
    let generation = h.next_generation().await;
    generation.delta("He");
    assert_eq!(next_stream_event(&mut first_rx).await, start(&c1, &s1));
    assert_eq!(next_stream_event(&mut first_rx).await, fragment(&s1, 0, "He"));

    // Drop the connection; the generation must keep running.
    h.svc.disconnect(first_conn);

    let (conn, mut rx) = h.svc.connect("alice").await;
    assert_eq!(next_event(&mut rx).await, ServerEvent::Connected);
    assert_eq!(next_event(&mut rx).await, pending(&c1, true));

    h.svc
        .handle_command("alice", conn, ClientCommand::Subscribe { conversation_id: c1.clone() })
        .await;
    assert_eq!(
        next_event(&mut rx).await,
        ServerEvent::SubscriptionConfirmed {
            conversation_id: c1.clone(),
            stream_id: s1.clone(),
            accumulated_text: "He".to_string(),
            next_index: 1,
        }
    );

    generation.delta("llo");
    generation.done();
    assert_eq!(next_event(&mut rx).await, fragment(&s1, 1, "llo"));
    assert!(matches!(
        next_event(&mut rx).await,
        ServerEvent::Complete { ref final_text, .. } if final_text == "Hello"
    ));
    assert_eq!(next_event(&mut rx).await, pending(&c1, false));
}

#[tokio::test]
async fn submit_during_active_stream_is_rejected() {
    let mut h = Harness::new();
    let c1 = h.conversation().await;
    let (conn, mut rx) = h.svc.connect("alice").await;
    next_event(&mut rx).await;

    let s1 = h.svc.submit("alice", conn, &c1, "hi").await.unwrap();
    let generation = h.next_generation().await;
    generation.delta("He");

    h.svc
        .handle_command(
            "alice",
            conn,
            ClientCommand::Submit { conversation_id: c1.clone(), content: "again".into() },
        )
        .await;

    let mut saw_rejection = false;
    for _ in 0..4 {
        match next_stream_event(&mut rx).await {
            ServerEvent::Rejected { command, code, conversation_id, .. } => {
                assert_eq!(command, CommandKind::Submit);
                assert_eq!(code, RejectCode::Conflict);
                assert_eq!(conversation_id.as_deref(), Some(c1.as_str()));
                saw_rejection = true;
                break;
            }
            ServerEvent::Start { stream_id, .. } => assert_eq!(stream_id, s1),
            ServerEvent::Fragment { stream_id, .. } => assert_eq!(stream_id, s1),
            other => panic!("unexpected event {other:?}"),
        }
    }
    assert!(saw_rejection);

    let err = h.svc.submit("alice", conn, &c1, "third").await.unwrap_err();
    assert!(err.is_conflict());

    // No second generation, original stream untouched, no extra user message.
    assert!(h.generations.try_recv().is_err());
    match h.svc.registry().subscribe(&c1) {
        Subscription::Active(snapshot) => {
            assert_eq!(snapshot.stream_id, s1);
            assert_eq!(snapshot.accumulated_text, "He");
        }
        other => panic!("expected active stream, got {other:?}"),
    }
    let messages = h.svc.get_messages(&c1).await.unwrap();
    assert_eq!(messages.len(), 1);
}

#[tokio::test]
async fn stop_completes_with_partial_text() {
    let mut h = Harness::new();
    let c1 = h.conversation().await;
    let (conn, mut rx) = h.svc.connect("alice").await;
    next_event(&mut rx).await;

    let s1 = h.svc.submit("alice", conn, &c1, "hi").await.unwrap();
    let generation = h.next_generation().await;
    generation.delta("He");
    generation.delta("l");
    assert_eq!(next_stream_event(&mut rx).await, start(&c1, &s1));
    assert_eq!(next_stream_event(&mut rx).await, fragment(&s1, 0, "He"));
    assert_eq!(next_stream_event(&mut rx).await, fragment(&s1, 1, "l"));

    h.svc
        .handle_command(
            "alice",
            conn,
            ClientCommand::Stop { conversation_id: c1.clone(), stream_id: s1.clone() },
        )
        .await;
    assert!(generation.cancel.is_cancelled());

    let ServerEvent::Complete { message_id, final_text, .. } = next_stream_event(&mut rx).await
    else {
        panic!("expected complete after stop");
    };
    assert_eq!(final_text, "Hel");
    assert_eq!(next_event(&mut rx).await, pending(&c1, false));
    assert_eq!(h.assistant_messages(&c1).await, vec![(message_id, "Hel".to_string())]);
}

#[tokio::test]
async fn stop_is_bounded_when_generation_ignores_it() {
    let settings = StreamSettings {
        stop_grace: Duration::from_millis(50),
        ..StreamSettings::default()
    };
    let mut h = Harness::with(ControlledGeneration::ignoring_cancel(), settings);
    let c1 = h.conversation().await;
    let (conn, mut rx) = h.svc.connect("alice").await;
    next_event(&mut rx).await;

    let s1 = h.svc.submit("alice", conn, &c1, "hi").await.unwrap();
    let generation = h.next_generation().await;
    generation.delta("Partial");
    assert_eq!(next_stream_event(&mut rx).await, start(&c1, &s1));
    assert_eq!(next_stream_event(&mut rx).await, fragment(&s1, 0, "Partial"));

    h.svc.stop(&c1, &s1).unwrap();
    assert!(matches!(
        next_stream_event(&mut rx).await,
        ServerEvent::Complete { ref final_text, .. } if final_text == "Partial"
    ));
    assert_eq!(next_event(&mut rx).await, pending(&c1, false));
}

#[tokio::test]
async fn stop_before_any_text_ends_with_error() {
    let mut h = Harness::new();
    let c1 = h.conversation().await;
    let (conn, mut rx) = h.svc.connect("alice").await;
    next_event(&mut rx).await;

    let s1 = h.svc.submit("alice", conn, &c1, "hi").await.unwrap();
    let _generation = h.next_generation().await;
    h.svc.stop(&c1, &s1).unwrap();

    assert_eq!(next_stream_event(&mut rx).await, start(&c1, &s1));
    assert!(matches!(
        next_stream_event(&mut rx).await,
        ServerEvent::Error { ref stream_id, .. } if *stream_id == s1
    ));
    assert!(h.assistant_messages(&c1).await.is_empty());
}

#[tokio::test]
async fn generation_failure_keeps_partial_text_and_clears_pending() {
    let mut h = Harness::new();
    let c1 = h.conversation().await;
    let (conn, mut rx) = h.svc.connect("alice").await;
    next_event(&mut rx).await;

    let s1 = h.svc.submit("alice", conn, &c1, "hi").await.unwrap();
    let generation = h.next_generation().await;
    generation.delta("Half");
    generation.fail("model crashed");

    assert_eq!(next_stream_event(&mut rx).await, start(&c1, &s1));
    assert_eq!(next_stream_event(&mut rx).await, fragment(&s1, 0, "Half"));
    assert_eq!(
        next_event(&mut rx).await,
        ServerEvent::Error { stream_id: s1.clone(), message: "model crashed".into() }
    );
    assert_eq!(next_event(&mut rx).await, pending(&c1, false));
    assert!(h.assistant_messages(&c1).await.is_empty());

    // The conversation is free for a retry.
    assert!(h.svc.submit("alice", conn, &c1, "retry").await.is_ok());
}

#[tokio::test]
async fn unavailable_generation_service_reports_error() {
    let mut h = Harness::with(ControlledGeneration::unavailable(), StreamSettings::default());
    let c1 = h.conversation().await;
    let (conn, mut rx) = h.svc.connect("alice").await;
    next_event(&mut rx).await;

    let s1 = h.svc.submit("alice", conn, &c1, "hi").await.unwrap();
    assert_eq!(next_stream_event(&mut rx).await, start(&c1, &s1));
    assert!(matches!(next_stream_event(&mut rx).await, ServerEvent::Error { .. }));
    assert!(!h.svc.registry().is_active(&c1));
    assert!(h.generations.try_recv().is_err());
}

#[tokio::test]
async fn disconnect_does_not_cancel_generation() {
    let mut h = Harness::new();
    let c1 = h.conversation().await;
    let (conn, _rx) = h.svc.connect("alice").await;

    h.svc.submit("alice", conn, &c1, "hi").await.unwrap();
    let generation = h.next_generation().await;
    h.svc.disconnect(conn);
    assert!(!generation.cancel.is_cancelled());

    generation.delta("Still here");
    generation.done();

    for _ in 0..50 {
        if !h.assistant_messages(&c1).await.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(h.assistant_messages(&c1).await.len(), 1);
}

#[tokio::test]
async fn late_subscriber_within_retention_learns_outcome() {
    let mut h = Harness::new();
    let c1 = h.conversation().await;
    let (conn, mut rx) = h.svc.connect("alice").await;
    next_event(&mut rx).await;

    let s1 = h.svc.submit("alice", conn, &c1, "hi").await.unwrap();
    let generation = h.next_generation().await;
    generation.delta("Hello");
    generation.done();
    while !matches!(next_event(&mut rx).await, ServerEvent::Pending { pending: false, .. }) {}

    let (late, mut late_rx) = h.svc.connect("alice").await;
    assert_eq!(next_event(&mut late_rx).await, ServerEvent::Connected);
    h.svc.subscribe(late, &c1).await;

    assert!(matches!(
        next_event(&mut late_rx).await,
        ServerEvent::SubscriptionConfirmed { ref stream_id, ref accumulated_text, .. }
            if *stream_id == s1 && accumulated_text == "Hello"
    ));
    assert!(matches!(
        next_event(&mut late_rx).await,
        ServerEvent::Complete { ref stream_id, .. } if *stream_id == s1
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn subscribing_while_fragments_flow_leaves_no_gap_or_duplicate() {
    let mut h = Harness::new();
    let c1 = h.conversation().await;
    let (conn, mut rx) = h.svc.connect("alice").await;
    next_event(&mut rx).await;

    let s1 = h.svc.submit("alice", conn, &c1, "count").await.unwrap();
    let generation = h.next_generation().await;
    let pieces: Vec<String> = (0..100).map(|i| format!("{i},")).collect();
    let expected = pieces.concat();

    let (late, mut late_rx) = h.svc.connect("alice").await;
    assert_eq!(next_event(&mut late_rx).await, ServerEvent::Connected);

    // The driver appends these on another worker while the subscribe runs.
    for piece in &pieces[..50] {
        generation.delta(piece);
    }
    h.svc.subscribe(late, &c1).await;
    for piece in &pieces[50..] {
        generation.delta(piece);
    }
    generation.done();

    let mut snapshot = None;
    let mut fragments = Vec::new();
    let final_text = loop {
        match next_stream_event(&mut late_rx).await {
            ServerEvent::SubscriptionConfirmed { stream_id, accumulated_text, next_index, .. } => {
                assert_eq!(stream_id, s1);
                assert!(snapshot.is_none(), "confirmed twice");
                snapshot = Some((accumulated_text, next_index));
            }
            ServerEvent::Fragment { stream_id, index, text } => {
                assert_eq!(stream_id, s1);
                fragments.push((index, text));
            }
            ServerEvent::Complete { final_text, .. } => break final_text,
            other => panic!("unexpected event {other:?}"),
        }
    };
    assert_eq!(final_text, expected);

    // Fragments below the watermark are already in the snapshot; the rest
    // must pick up exactly where it ends.
    let (accumulated, next_index) = snapshot.expect("no subscription_confirmed");
    let mut live: Vec<(u32, String)> =
        fragments.into_iter().filter(|(index, _)| *index >= next_index).collect();
    live.sort_by_key(|(index, _)| *index);
    let indexes: Vec<u32> = live.iter().map(|(index, _)| *index).collect();
    let contiguous: Vec<u32> = (next_index..next_index + live.len() as u32).collect();
    assert_eq!(indexes, contiguous);

    let rebuilt: String =
        std::iter::once(accumulated).chain(live.into_iter().map(|(_, text)| text)).collect();
    assert_eq!(rebuilt, expected);
}

#[tokio::test]
async fn subscribe_without_stream_reports_none() {
    let h = Harness::new();
    let c1 = h.conversation().await;
    let (conn, mut rx) = h.svc.connect("alice").await;
    next_event(&mut rx).await;

    h.svc.subscribe(conn, &c1).await;
    assert_eq!(
        next_event(&mut rx).await,
        ServerEvent::NoActiveStream { conversation_id: c1.clone() }
    );
}

#[tokio::test]
async fn pending_reaches_background_connections_without_fragments() {
    let mut h = Harness::new();
    let c1 = h.conversation().await;
    let (viewer, mut viewer_rx) = h.svc.connect("alice").await;
    let (_elsewhere, mut elsewhere_rx) = h.svc.connect("alice").await;
    next_event(&mut viewer_rx).await;
    next_event(&mut elsewhere_rx).await;

    h.svc.submit("alice", viewer, &c1, "hi").await.unwrap();
    let generation = h.next_generation().await;
    generation.delta("Hello");
    generation.done();

    assert_eq!(next_event(&mut elsewhere_rx).await, pending(&c1, true));
    assert_eq!(next_event(&mut elsewhere_rx).await, pending(&c1, false));
    while !matches!(next_event(&mut viewer_rx).await, ServerEvent::Pending { pending: false, .. }) {}
    assert!(elsewhere_rx.try_recv().is_err());
}

#[tokio::test]
async fn conversations_stream_concurrently() {
    let mut h = Harness::new();
    let c1 = h.conversation().await;
    let c2 = h.conversation().await;
    let (conn, _rx) = h.svc.connect("alice").await;

    h.svc.submit("alice", conn, &c1, "one").await.unwrap();
    let first = h.next_generation().await;
    h.svc.submit("alice", conn, &c2, "two").await.unwrap();
    let second = h.next_generation().await;
    assert!(h.svc.registry().is_active(&c1));
    assert!(h.svc.registry().is_active(&c2));

    second.delta("B");
    second.done();
    first.delta("A");
    first.done();

    for _ in 0..50 {
        if h.assistant_messages(&c1).await.len() == 1 && h.assistant_messages(&c2).await.len() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(h.assistant_messages(&c1).await[0].1, "A");
    assert_eq!(h.assistant_messages(&c2).await[0].1, "B");
}

#[tokio::test]
async fn invalid_submissions_are_rejected_without_a_stream() {
    let mut h = Harness::new();
    let c1 = h.conversation().await;
    let (conn, mut rx) = h.svc.connect("alice").await;
    next_event(&mut rx).await;

    h.svc
        .handle_command(
            "alice",
            conn,
            ClientCommand::Submit { conversation_id: c1.clone(), content: "   ".into() },
        )
        .await;
    assert!(matches!(
        next_event(&mut rx).await,
        ServerEvent::Rejected { code: RejectCode::InvalidInput, .. }
    ));

    h.svc
        .handle_command(
            "alice",
            conn,
            ClientCommand::Submit { conversation_id: "missing".into(), content: "hi".into() },
        )
        .await;
    assert!(matches!(
        next_event(&mut rx).await,
        ServerEvent::Rejected { code: RejectCode::NotFound, .. }
    ));

    assert!(!h.svc.registry().is_active(&c1));
    assert!(h.generations.try_recv().is_err());
}

#[tokio::test]
async fn stop_for_unknown_stream_is_rejected() {
    let h = Harness::new();
    let c1 = h.conversation().await;
    let (conn, mut rx) = h.svc.connect("alice").await;
    next_event(&mut rx).await;

    h.svc
        .handle_command(
            "alice",
            conn,
            ClientCommand::Stop { conversation_id: c1.clone(), stream_id: "nope".into() },
        )
        .await;
    assert!(matches!(
        next_event(&mut rx).await,
        ServerEvent::Rejected { command: CommandKind::Stop, code: RejectCode::NotFound, .. }
    ));
}
