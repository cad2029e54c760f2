use std::time::{Duration, Instant};

use crate::eventloop::{TimerEvent, Timers};

#[test]
fn test_timer_fires_after_deadline() {
    let mut timers = Timers::new();
    timers.after(Duration::from_millis(3000), TimerEvent::BootstrapTick);

    let now = Instant::now();
    assert!(timers.expired(now).is_empty());
    assert_eq!(timers.pending(), 1);

    let events = timers.expired(now + Duration::from_millis(3500));
    assert_eq!(events, vec![TimerEvent::BootstrapTick]);
    assert_eq!(timers.pending(), 0);
}

#[test]
fn test_missed_ticks_collapse_to_one_firing() {
    let mut timers = Timers::new();
    timers.after(Duration::from_millis(10), TimerEvent::BootstrapTick);

    // way past the deadline: still exactly one event
    let events = timers.expired(Instant::now() + Duration::from_secs(60));
    assert_eq!(events.len(), 1);
    assert!(timers.expired(Instant::now() + Duration::from_secs(120)).is_empty());
}

#[test]
fn test_cancel_is_idempotent() {
    let mut timers = Timers::new();
    let id = timers.after(Duration::from_millis(100), TimerEvent::BootstrapTick);
    timers.cancel(id);
    assert_eq!(timers.pending(), 0);
    // cancelling again is a no-op
    timers.cancel(id);
    assert!(timers
        .expired(Instant::now() + Duration::from_secs(1))
        .is_empty());
}

#[test]
fn test_expiry_order_and_deadline() {
    let mut timers = Timers::new();
    timers.after(Duration::from_millis(500), TimerEvent::BootstrapTick);
    let first = timers.after(
        Duration::from_millis(100),
        TimerEvent::SvcRetry(crate::services::SvcKey::new("/bin/x", 1)),
    );

    let deadline = timers.next_deadline().unwrap();
    assert!(deadline <= Instant::now() + Duration::from_millis(100));

    let events = timers.expired(Instant::now() + Duration::from_secs(1));
    assert_eq!(events.len(), 2);
    // earliest deadline first
    assert!(matches!(events[0], TimerEvent::SvcRetry(_)));
    let _ = first;
}

#[test]
fn test_poll_timeout_reflects_next_deadline() {
    let mut timers = Timers::new();
    assert_eq!(timers.poll_timeout_ms(Instant::now()), None);

    timers.after(Duration::from_millis(200), TimerEvent::BootstrapTick);
    let ms = timers.poll_timeout_ms(Instant::now()).unwrap();
    assert!(ms <= 200);

    // an overdue timer yields a zero timeout, not a negative one
    let ms = timers
        .poll_timeout_ms(Instant::now() + Duration::from_secs(5))
        .unwrap();
    assert_eq!(ms, 0);
}
