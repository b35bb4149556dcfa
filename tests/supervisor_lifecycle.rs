use std::time::Duration;

use meshbadge::error::{ConnectError, SendError};
use meshbadge::queue::HandoffQueue;
use meshbadge::supervisor::{
    Backoff, LinkHandle, LinkState, Supervisor, SupervisorSettings, Transition,
};
use meshbadge::transport::memory::{self, MemoryRadio};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

fn settings(max_attempts: u32) -> SupervisorSettings {
    SupervisorSettings {
        backoff: Backoff {
            base: Duration::from_millis(100),
            cap: Duration::from_millis(250),
        },
        max_attempts,
        probe_interval: Duration::from_secs(1),
        probe_timeout: Duration::from_millis(200),
        probe_failure_threshold: 2,
        drain_timeout: Duration::from_millis(100),
    }
}

struct Harness {
    radio: MemoryRadio,
    handle: LinkHandle,
    transitions: mpsc::UnboundedReceiver<Transition>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

fn spawn(max_attempts: u32, prepare: impl FnOnce(&MemoryRadio)) -> Harness {
    spawn_with(settings(max_attempts), prepare)
}

fn spawn_with(settings: SupervisorSettings, prepare: impl FnOnce(&MemoryRadio)) -> Harness {
    let (connector, radio) = memory::pair();
    prepare(&radio);
    let (shutdown, shutdown_rx) = watch::channel(false);
    let (supervisor, handle, transitions) = Supervisor::new(
        connector,
        settings,
        HandoffQueue::new(8),
        shutdown_rx,
    );
    let task = tokio::spawn(supervisor.run());
    Harness {
        radio,
        handle,
        transitions,
        shutdown,
        task,
    }
}

async fn collect_until(
    rx: &mut mpsc::UnboundedReceiver<Transition>,
    stop: impl Fn(&[Transition]) -> bool,
) -> Vec<Transition> {
    let mut seen = Vec::new();
    while let Some(t) = rx.recv().await {
        seen.push(t);
        if stop(&seen) {
            break;
        }
    }
    seen
}

fn unavailable() -> ConnectError {
    ConnectError::LinkUnavailable("no such device".into())
}

#[tokio::test(start_paused = true)]
async fn three_failures_then_success() {
    let mut h = spawn(0, |r| r.fail_next_connects(3, unavailable()));

    let seen = collect_until(&mut h.transitions, |s| {
        s.last().map(|t| t.to) == Some(LinkState::Connected)
    })
    .await;
    let states: Vec<LinkState> = seen.iter().map(|t| t.to).collect();
    assert_eq!(
        states,
        vec![
            LinkState::Connecting,
            LinkState::Disconnected,
            LinkState::Connecting,
            LinkState::Disconnected,
            LinkState::Connecting,
            LinkState::Disconnected,
            LinkState::Connecting,
            LinkState::Connected,
        ]
    );
    assert_eq!(h.handle.status().attempt_count, 0);
    assert!(h.handle.status().last_error.is_none());

    h.shutdown.send(true).unwrap();
    h.task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn retries_follow_capped_exponential_backoff() {
    let mut h = spawn(0, |r| r.fail_next_connects(4, unavailable()));
    collect_until(&mut h.transitions, |s| {
        s.last().map(|t| t.to) == Some(LinkState::Connected)
    })
    .await;

    let calls = h.radio.connect_calls();
    assert_eq!(calls.len(), 5);
    let gaps: Vec<u128> = calls.windows(2).map(|w| (w[1] - w[0]).as_millis()).collect();
    let expected = [100u128, 200, 250, 250];
    for (gap, want) in gaps.iter().zip(expected) {
        assert!(
            *gap >= want && *gap < want + 10,
            "gap {}ms, expected about {}ms (all gaps: {:?})",
            gap,
            want,
            gaps
        );
    }

    h.shutdown.send(true).unwrap();
    h.task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn exhausted_link_waits_for_operator() {
    let mut h = spawn(2, |r| r.fail_next_connects(2, unavailable()));
    let mut status = h.handle.subscribe();
    while status.borrow_and_update().exhausted.is_none() {
        status.changed().await.unwrap();
    }
    let exhausted = h.handle.status().exhausted.unwrap();
    assert_eq!(exhausted.attempts, 2);
    assert!(exhausted.last_error.contains("no such device"));

    // parked: no further attempts however long we wait
    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(h.radio.connect_calls().len(), 2);
    assert_eq!(h.handle.status().state, LinkState::Disconnected);
    assert_eq!(
        h.handle.send_text(7, "anyone?").await,
        Err(SendError::NotConnected)
    );

    h.handle.reconnect();
    let seen = collect_until(&mut h.transitions, |s| {
        s.last().map(|t| t.to) == Some(LinkState::Connected)
    })
    .await;
    assert_eq!(seen.last().map(|t| t.reason.as_str()), Some("handshake complete"));
    assert!(h.handle.status().exhausted.is_none());
    assert_eq!(h.radio.connect_calls().len(), 3);

    h.shutdown.send(true).unwrap();
    h.task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn failing_probes_degrade_then_reconnect_without_backoff() {
    let mut h = spawn(0, |_| {});
    collect_until(&mut h.transitions, |s| {
        s.last().map(|t| t.to) == Some(LinkState::Connected)
    })
    .await;

    h.radio.set_probe_ok(false);
    let seen = collect_until(&mut h.transitions, |s| {
        s.iter().any(|t| t.to == LinkState::Degraded)
            && s.last().map(|t| t.to) == Some(LinkState::Connected)
    })
    .await;
    let states: Vec<LinkState> = seen.iter().map(|t| t.to).collect();
    assert_eq!(states, vec![LinkState::Degraded, LinkState::Connected]);
    assert!(seen[0].reason.contains("2 consecutive probe failures"));

    // two probe periods to degrade, then an immediate reconnect
    let calls = h.radio.connect_calls();
    assert_eq!(calls.len(), 2);
    let gap = calls[1] - calls[0];
    assert!(gap >= Duration::from_secs(2) && gap < Duration::from_millis(2_500), "{:?}", gap);
    assert!(h.radio.closes() >= 1);

    h.radio.set_probe_ok(true);
    h.shutdown.send(true).unwrap();
    h.task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn lost_link_reconnects_and_shutdown_closes() {
    let mut h = spawn(0, |_| {});
    collect_until(&mut h.transitions, |s| {
        s.last().map(|t| t.to) == Some(LinkState::Connected)
    })
    .await;

    h.radio.drop_link();
    let seen = collect_until(&mut h.transitions, |s| {
        s.last().map(|t| t.to) == Some(LinkState::Connected)
    })
    .await;
    assert_eq!(seen[0].to, LinkState::Disconnected);
    assert!(seen[0].reason.contains("memory link dropped"));

    h.shutdown.send(true).unwrap();
    h.task.await.unwrap();
    let rest = collect_until(&mut h.transitions, |_| false).await;
    assert_eq!(rest.last().map(|t| t.to), Some(LinkState::Closed));
    assert_eq!(h.handle.status().state, LinkState::Closed);
}

#[tokio::test(start_paused = true)]
async fn sends_reach_the_live_link() {
    let mut h = spawn(0, |_| {});
    collect_until(&mut h.transitions, |s| {
        s.last().map(|t| t.to) == Some(LinkState::Connected)
    })
    .await;

    h.handle.send_text(0x42, "hello mesh").await.unwrap();
    assert_eq!(h.radio.sent(), vec![(0x42, "hello mesh".to_string())]);

    h.radio
        .set_send_failure(Some(SendError::Link("radio busy".into())));
    assert_eq!(
        h.handle.send_text(0x43, "again").await,
        Err(SendError::Link("radio busy".into()))
    );

    h.shutdown.send(true).unwrap();
    h.task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn zero_probe_interval_keeps_the_link_served() {
    let mut zero = settings(0);
    zero.probe_interval = Duration::ZERO;
    let mut h = spawn_with(zero, |_| {});
    collect_until(&mut h.transitions, |s| {
        s.last().map(|t| t.to) == Some(LinkState::Connected)
    })
    .await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    h.handle.send_text(0x44, "still here").await.unwrap();
    assert_eq!(h.handle.status().state, LinkState::Connected);
    assert!(!h.task.is_finished());

    h.shutdown.send(true).unwrap();
    h.task.await.unwrap();
}
