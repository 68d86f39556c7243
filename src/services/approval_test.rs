use super::*;
use serde_json::json;

fn test_gateway() -> ApprovalGateway {
    ApprovalGateway::with_config(ApprovalConfig {
        ttl: Duration::from_secs(60),
        bucket_width: Duration::from_secs(600),
    })
}

fn ttl_ms(gateway_ttl_secs: i64) -> i64 {
    gateway_ttl_secs * 1000
}

#[test]
fn register_dedupes_within_bucket() {
    let gw = test_gateway();
    let user = Uuid::new_v4();
    let now = 1_700_000_000_000;

    let input = json!({"to": "bob", "amount": 10});
    let first = gw.register_at(user, "send_money", input.clone(), "send $10 to bob", Duration::from_secs(60), now);
    let second = gw.register_at(user, "send_money", input, "send $10 to bob", Duration::from_secs(60), now + 5_000);

    assert_eq!(first.id, second.id);
    assert_eq!(first.expires_at, second.expires_at);
}

#[test]
fn register_in_next_bucket_creates_new_action() {
    let gw = test_gateway();
    let user = Uuid::new_v4();
    // Align to a bucket start so now + width lands in the next bucket.
    let now = 600_000 * 2_834_000;

    let input = json!({"to": "bob", "amount": 10});
    let first = gw.register_at(user, "send_money", input.clone(), "s", Duration::from_secs(60), now);
    // The first action has expired by then; a later bucket mints a fresh id.
    let second = gw.register_at(user, "send_money", input, "s", Duration::from_secs(60), now + 600_000);

    assert_ne!(first.id, second.id);
}

#[test]
fn register_is_insensitive_to_input_key_order() {
    let gw = test_gateway();
    let user = Uuid::new_v4();
    let now = 1_700_000_000_000;

    let a = gw.register_at(user, "send_money", json!({"to": "bob", "amount": 10}), "s", Duration::from_secs(60), now);
    let b = gw.register_at(user, "send_money", json!({"amount": 10, "to": "bob"}), "s", Duration::from_secs(60), now);

    assert_eq!(a.id, b.id);
}

#[test]
fn distinct_users_do_not_collide() {
    let gw = test_gateway();
    let now = 1_700_000_000_000;
    let input = json!({"to": "bob", "amount": 10});

    let a = gw.register_at(Uuid::new_v4(), "send_money", input.clone(), "s", Duration::from_secs(60), now);
    let b = gw.register_at(Uuid::new_v4(), "send_money", input, "s", Duration::from_secs(60), now);

    assert_ne!(a.id, b.id);
}

#[test]
fn confirm_returns_action_once() {
    let gw = test_gateway();
    let user = Uuid::new_v4();
    let now = 1_700_000_000_000;

    let action = gw.register_at(user, "send_money", json!({}), "s", Duration::from_secs(60), now);

    let confirmed = gw.confirm_at(user, action.id, now + 1_000).expect("confirm should succeed");
    assert_eq!(confirmed.id, action.id);
    assert_eq!(confirmed.tool, "send_money");

    // A second confirm must not hand the action out again.
    assert_eq!(gw.confirm_at(user, action.id, now + 2_000), Err(GatewayError::NotFound));
}

#[test]
fn confirm_after_expiry_fails_expired() {
    let gw = test_gateway();
    let user = Uuid::new_v4();
    let now = 1_700_000_000_000;

    let action = gw.register_at(user, "send_money", json!({}), "s", Duration::from_secs(5), now);

    assert_eq!(gw.confirm_at(user, action.id, now + 6_000), Err(GatewayError::Expired));
    assert!(gw.lookup_at(user, action.id, now + 6_000).is_none());
}

#[test]
fn confirm_after_sweep_still_reports_expired() {
    let gw = test_gateway();
    let user = Uuid::new_v4();
    let now = 1_700_000_000_000;

    let action = gw.register_at(user, "send_money", json!({}), "s", Duration::from_secs(5), now);

    assert_eq!(gw.sweep_expired_at(now + ttl_ms(6)), 1);
    assert_eq!(gw.confirm_at(user, action.id, now + ttl_ms(7)), Err(GatewayError::Expired));
}

#[test]
fn confirm_unknown_or_wrong_user_is_not_found() {
    let gw = test_gateway();
    let user = Uuid::new_v4();
    let now = 1_700_000_000_000;

    assert_eq!(gw.confirm_at(user, Uuid::new_v4(), now), Err(GatewayError::NotFound));

    let action = gw.register_at(user, "send_money", json!({}), "s", Duration::from_secs(60), now);
    assert_eq!(gw.confirm_at(Uuid::new_v4(), action.id, now), Err(GatewayError::NotFound));
    // The owner can still confirm.
    assert!(gw.confirm_at(user, action.id, now).is_ok());
}

#[test]
fn cancel_is_idempotent() {
    let gw = test_gateway();
    let user = Uuid::new_v4();
    let now = 1_700_000_000_000;

    let action = gw.register_at(user, "send_money", json!({}), "s", Duration::from_secs(60), now);

    assert!(gw.cancel_at(user, action.id, now + 1_000).is_ok());
    assert!(gw.cancel_at(user, action.id, now + 2_000).is_ok());
    // Cancelling a confirmed action is also tolerated.
    let other = gw.register_at(user, "pay_bill", json!({}), "s", Duration::from_secs(60), now);
    gw.confirm_at(user, other.id, now).expect("confirm should succeed");
    assert!(gw.cancel_at(user, other.id, now + 1_000).is_ok());
}

#[test]
fn cancel_never_seen_is_not_found() {
    let gw = test_gateway();
    assert_eq!(gw.cancel_at(Uuid::new_v4(), Uuid::new_v4(), 1_700_000_000_000), Err(GatewayError::NotFound));
}

#[test]
fn cancelled_action_frees_idempotency_key() {
    let gw = test_gateway();
    let user = Uuid::new_v4();
    let now = 1_700_000_000_000;
    let input = json!({"to": "bob", "amount": 10});

    let first = gw.register_at(user, "send_money", input.clone(), "s", Duration::from_secs(60), now);
    gw.cancel_at(user, first.id, now + 1_000).expect("cancel should succeed");

    // The user changed their mind; a re-request gets a fresh approval window.
    let second = gw.register_at(user, "send_money", input, "s", Duration::from_secs(60), now + 2_000);
    assert_ne!(first.id, second.id);
}

#[test]
fn sweep_prunes_old_tombstones() {
    let gw = test_gateway();
    let user = Uuid::new_v4();
    let now = 1_700_000_000_000;

    let action = gw.register_at(user, "send_money", json!({}), "s", Duration::from_secs(5), now);
    gw.sweep_expired_at(now + 6_000);
    assert_eq!(gw.confirm_at(user, action.id, now + 7_000), Err(GatewayError::Expired));

    // Past the retention window the tombstone is gone.
    gw.sweep_expired_at(now + 607_000);
    assert_eq!(gw.confirm_at(user, action.id, now + 608_000), Err(GatewayError::NotFound));
}

#[test]
fn register_with_ttl_overrides_default() {
    let gw = test_gateway();
    let user = Uuid::new_v4();
    let now = 1_700_000_000_000;

    let action = gw.register_at(user, "close_account", json!({}), "s", Duration::from_secs(120), now);
    assert_eq!(action.expires_at, now + 120_000);
    // Still confirmable where the default window would already be shut.
    assert!(gw.confirm_at(user, action.id, now + 90_000).is_ok());
}

#[test]
fn lookup_hides_expired_actions() {
    let gw = test_gateway();
    let user = Uuid::new_v4();
    let now = 1_700_000_000_000;

    let action = gw.register_at(user, "send_money", json!({}), "s", Duration::from_secs(5), now);
    assert!(gw.lookup_at(user, action.id, now + 4_999).is_some());
    assert!(gw.lookup_at(user, action.id, now + 5_000).is_none());
}

#[test]
fn canonical_json_sorts_nested_objects() {
    let a = canonical_json(&json!({"b": {"y": 1, "x": [1, {"q": 2, "p": 3}]}, "a": null}));
    let b = canonical_json(&json!({"a": null, "b": {"x": [1, {"p": 3, "q": 2}], "y": 1}}));
    assert_eq!(a, b);
    assert_eq!(a, r#"{"a":null,"b":{"x":[1,{"p":3,"q":2}],"y":1}}"#);
}

#[test]
fn bucket_index_is_stable_within_width() {
    let width = Duration::from_secs(600);
    let start = 1_700_000_400_000; // arbitrary, not bucket aligned
    let base = bucket_index(start, width);
    assert_eq!(bucket_index(start + 1, width), base);
    assert_ne!(bucket_index(start + 600_000, width), base);
}
