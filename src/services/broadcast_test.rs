use super::*;

#[tokio::test]
async fn publish_reaches_all_subscribers() {
    let feed = ChangeBroadcaster::new();
    let (_a, mut rx_a) = feed.subscribe();
    let (_b, mut rx_b) = feed.subscribe();

    let event = ChangeEvent::new("budget", "created");
    assert_eq!(feed.publish(&event), 2);

    assert_eq!(rx_a.recv().await.expect("subscriber A should receive"), event);
    assert_eq!(rx_b.recv().await.expect("subscriber B should receive"), event);
}

#[tokio::test]
async fn full_mailbox_drops_for_that_subscriber_only() {
    let feed = ChangeBroadcaster::new();
    let (_slow, mut slow_rx) = feed.subscribe();
    let (_fast, mut fast_rx) = feed.subscribe();

    // Saturate the slow subscriber's mailbox without draining it.
    for i in 0..MAILBOX_CAPACITY {
        feed.publish(&ChangeEvent::new("transaction", format!("created-{i}")));
    }
    while fast_rx.try_recv().is_ok() {}

    let overflow = ChangeEvent::new("budget", "updated");
    // Slow mailbox is full: only the fast subscriber accepts.
    assert_eq!(feed.publish(&overflow), 1);

    assert_eq!(fast_rx.recv().await.expect("fast subscriber should receive"), overflow);

    // The slow subscriber kept its earlier events; the overflow one is gone.
    let mut drained = Vec::new();
    while let Ok(ev) = slow_rx.try_recv() {
        drained.push(ev);
    }
    assert_eq!(drained.len(), MAILBOX_CAPACITY);
    assert!(drained.iter().all(|ev| ev != &overflow));
}

#[test]
fn publish_never_blocks_on_slow_subscribers() {
    let feed = ChangeBroadcaster::new();
    let (_slow, _slow_rx) = feed.subscribe();

    // Far more events than mailbox capacity; publish must return each time.
    for i in 0..(MAILBOX_CAPACITY * 10) {
        feed.publish(&ChangeEvent::new("subscription", format!("updated-{i}")));
    }
}

#[tokio::test]
async fn unsubscribe_closes_mailbox() {
    let feed = ChangeBroadcaster::new();
    let (id, mut rx) = feed.subscribe();
    assert_eq!(feed.subscriber_count(), 1);

    feed.unsubscribe(id);
    assert_eq!(feed.subscriber_count(), 0);
    assert_eq!(feed.publish(&ChangeEvent::new("budget", "deleted")), 0);
    assert!(rx.recv().await.is_none());
}

#[test]
fn publish_prunes_dropped_receivers() {
    let feed = ChangeBroadcaster::new();
    let (_id, rx) = feed.subscribe();
    drop(rx);
    assert_eq!(feed.subscriber_count(), 1);

    assert_eq!(feed.publish(&ChangeEvent::new("budget", "created")), 0);
    assert_eq!(feed.subscriber_count(), 0);
}

#[test]
fn change_event_wire_shape() {
    let event = ChangeEvent::new("savings_goal", "updated");
    let json = serde_json::to_value(&event).expect("serialize");
    assert_eq!(json.get("type").and_then(|v| v.as_str()), Some("savings_goal"));
    assert_eq!(json.get("action").and_then(|v| v.as_str()), Some("updated"));
    assert!(json.get("timestamp").and_then(serde_json::Value::as_i64).is_some());
}
