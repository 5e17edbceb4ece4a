//! Unit tests for the notification store and retry re-arm.

use chrono::{Duration, Utc};
use rusqlite::Connection;
use scholar_types::{NotificationChannel, NotificationPriority, NotificationStatus};
use uuid::Uuid;

use crate::error::NotifyError;
use crate::model::{NewNotification, NotificationContent, Recipient};
use crate::retry::{is_retry_eligible, rearm_eligible};
use crate::store::{
    cancel, claim, delete_finished_before, expire_stale_claims, find_by_correlation, get, insert,
    insert_once, list_retry_due, mark_delivered, mark_failed, mark_sent, ready_candidates, rearm,
    status_counts, CLAIM_EXPIRED_ERROR, NEVER_DUE_RETRY_COUNT,
};

/// Creates an in-memory SQLite database with migrations applied.
fn test_db() -> Connection {
    let conn = Connection::open_in_memory().expect("should open in-memory db");
    scholar_db::run_migrations(&conn).expect("migrations should succeed");
    conn
}

fn email(body: &str) -> NewNotification {
    NewNotification::new(
        NotificationChannel::Email,
        Recipient::email("guardian@example.com").with_display_name("Mrs Obi"),
        NotificationContent::new(Some("Welcome".to_string()), body),
    )
}

// ── insert / get ─────────────────────────────────────────────────────

#[test]
fn insert_round_trips_every_field() {
    let conn = test_db();
    let now = Utc::now();
    let new = email("Ada has been enrolled")
        .correlation_id("msg-1")
        .priority(NotificationPriority::High)
        .scheduled_at(now + Duration::minutes(5))
        .metadata("studentId", "s-1");

    let inserted = insert(&conn, &new, now).expect("insert should succeed");
    let loaded = get(&conn, inserted.id).expect("get should succeed");

    assert_eq!(loaded, inserted);
    assert_eq!(loaded.status, NotificationStatus::Pending);
    assert_eq!(loaded.retry_count, 0);
    assert_eq!(loaded.metadata.get("studentId").map(String::as_str), Some("s-1"));
}

#[test]
fn get_missing_is_not_found() {
    let conn = test_db();
    let id = Uuid::new_v4();
    assert!(matches!(get(&conn, id), Err(NotifyError::NotFound(found)) if found == id));
}

#[test]
fn find_by_correlation_returns_matching_rows() {
    let conn = test_db();
    let now = Utc::now();
    insert(&conn, &email("a").correlation_id("msg-1"), now).expect("insert");
    insert(&conn, &email("b").correlation_id("msg-2"), now).expect("insert");

    let found = find_by_correlation(&conn, "msg-1").expect("query");
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].content.body, "a");
    assert!(find_by_correlation(&conn, "msg-3").expect("query").is_empty());
}

#[test]
fn insert_once_skips_an_existing_correlation_id() {
    let conn = test_db();
    let now = Utc::now();
    let first = insert_once(&conn, &email("first").correlation_id("msg-7"), now)
        .expect("insert")
        .expect("first insert creates a row");
    let second =
        insert_once(&conn, &email("second").correlation_id("msg-7"), now).expect("insert");
    assert!(second.is_none());

    let rows = find_by_correlation(&conn, "msg-7").expect("query");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].id, first.id);
    assert_eq!(rows[0].content.body, "first");

    assert!(
        insert(&conn, &email("third").correlation_id("msg-7"), now).is_err(),
        "plain insert must not bypass the unique correlation id"
    );
}

#[test]
fn uncorrelated_rows_never_conflict() {
    let conn = test_db();
    let now = Utc::now();
    assert!(insert_once(&conn, &email("a"), now).expect("insert").is_some());
    assert!(insert_once(&conn, &email("b"), now).expect("insert").is_some());
}

// ── claim ────────────────────────────────────────────────────────────

#[test]
fn ready_candidates_order_by_priority_then_age() {
    let conn = test_db();
    let now = Utc::now();
    let old_low = insert(
        &conn,
        &email("low").priority(NotificationPriority::Low),
        now - Duration::minutes(10),
    )
    .expect("insert");
    let new_critical = insert(
        &conn,
        &email("critical").priority(NotificationPriority::Critical),
        now,
    )
    .expect("insert");
    let old_normal = insert(&conn, &email("normal-old"), now - Duration::minutes(5)).expect("insert");
    let new_normal = insert(&conn, &email("normal-new"), now - Duration::minutes(1)).expect("insert");
    let _future = insert(
        &conn,
        &email("later").scheduled_at(now + Duration::hours(1)),
        now,
    )
    .expect("insert");

    let ids = ready_candidates(&conn, now, 10).expect("query");
    assert_eq!(
        ids,
        vec![new_critical.id, old_normal.id, new_normal.id, old_low.id]
    );
}

#[test]
fn claim_is_exclusive() {
    let conn = test_db();
    let now = Utc::now();
    let n = insert(&conn, &email("hi"), now).expect("insert");

    let first = claim(&conn, n.id, now).expect("claim").expect("first claim wins");
    assert_eq!(first.status, NotificationStatus::Processing);
    assert_eq!(first.version, 1);
    assert!(claim(&conn, n.id, now).expect("claim").is_none());
}

#[test]
fn claim_respects_schedule() {
    let conn = test_db();
    let now = Utc::now();
    let n = insert(&conn, &email("later").scheduled_at(now + Duration::minutes(1)), now)
        .expect("insert");
    assert!(claim(&conn, n.id, now).expect("claim").is_none());
    assert!(claim(&conn, n.id, now + Duration::minutes(2))
        .expect("claim")
        .is_some());
}

// ── transitions ──────────────────────────────────────────────────────

#[test]
fn happy_path_sent_then_delivered() {
    let conn = test_db();
    let now = Utc::now();
    let n = insert(&conn, &email("hi"), now).expect("insert");
    claim(&conn, n.id, now).expect("claim").expect("claimed");

    mark_sent(&conn, n.id, now).expect("sent");
    let sent = get(&conn, n.id).expect("get");
    assert_eq!(sent.status, NotificationStatus::Sent);
    assert!(sent.sent_at.is_some());

    mark_delivered(&conn, n.id, now + Duration::seconds(3)).expect("delivered");
    let delivered = get(&conn, n.id).expect("get");
    assert_eq!(delivered.status, NotificationStatus::Delivered);
    assert_eq!(delivered.sent_at, sent.sent_at);
    assert!(delivered.delivered_at.is_some());
}

#[test]
fn sending_an_unclaimed_row_is_invalid() {
    let conn = test_db();
    let n = insert(&conn, &email("hi"), Utc::now()).expect("insert");
    let err = mark_sent(&conn, n.id, Utc::now()).expect_err("pending cannot be sent");
    assert!(matches!(
        err,
        NotifyError::InvalidTransition {
            from: NotificationStatus::Pending,
            to: NotificationStatus::Sent,
            ..
        }
    ));
}

#[test]
fn delivered_is_terminal() {
    let conn = test_db();
    let now = Utc::now();
    let n = insert(&conn, &email("hi"), now).expect("insert");
    claim(&conn, n.id, now).expect("claim").expect("claimed");
    mark_delivered(&conn, n.id, now).expect("delivered");

    assert!(matches!(
        cancel(&conn, n.id, now),
        Err(NotifyError::InvalidTransition { .. })
    ));
    assert!(matches!(
        mark_failed(&conn, n.id, "late", now),
        Err(NotifyError::InvalidTransition { .. })
    ));
}

#[test]
fn transition_on_missing_row_is_not_found() {
    let conn = test_db();
    assert!(matches!(
        mark_sent(&conn, Uuid::new_v4(), Utc::now()),
        Err(NotifyError::NotFound(_))
    ));
}

#[test]
fn failure_counts_attempts_and_rearm_checks_version() {
    let conn = test_db();
    let now = Utc::now();
    let n = insert(&conn, &email("hi"), now).expect("insert");
    claim(&conn, n.id, now).expect("claim").expect("claimed");
    mark_failed(&conn, n.id, "smtp 421", now).expect("failed");

    let failed = get(&conn, n.id).expect("get");
    assert_eq!(failed.status, NotificationStatus::Failed);
    assert_eq!(failed.retry_count, 1);
    assert_eq!(failed.error_message.as_deref(), Some("smtp 421"));

    assert!(!rearm(&conn, n.id, failed.version - 1, now).expect("stale rearm"));
    assert!(rearm(&conn, n.id, failed.version, now).expect("rearm"));
    assert_eq!(get(&conn, n.id).expect("get").status, NotificationStatus::Pending);
}

#[test]
fn cancel_from_pending_processing_and_failed() {
    let conn = test_db();
    let now = Utc::now();

    let pending = insert(&conn, &email("a"), now).expect("insert");
    cancel(&conn, pending.id, now).expect("cancel pending");

    let processing = insert(&conn, &email("b"), now).expect("insert");
    claim(&conn, processing.id, now).expect("claim").expect("claimed");
    cancel(&conn, processing.id, now).expect("cancel processing");

    let failed = insert(&conn, &email("c"), now).expect("insert");
    claim(&conn, failed.id, now).expect("claim").expect("claimed");
    mark_failed(&conn, failed.id, "x", now).expect("fail");
    cancel(&conn, failed.id, now).expect("cancel failed");

    for id in [pending.id, processing.id, failed.id] {
        assert_eq!(get(&conn, id).expect("get").status, NotificationStatus::Cancelled);
    }
}

// ── retry and maintenance ────────────────────────────────────────────

fn failed_with_retries(conn: &Connection, created_ago: Duration, retries: u32) -> Uuid {
    let now = Utc::now();
    let n = insert(conn, &email("retry me"), now - created_ago).expect("insert");
    for _ in 0..retries {
        claim(conn, n.id, now).expect("claim").expect("claimed");
        mark_failed(conn, n.id, "provider down", now).expect("fail");
        let current = get(conn, n.id).expect("get");
        if current.retry_count < retries {
            assert!(rearm(conn, n.id, current.version, now).expect("rearm"));
        }
    }
    n.id
}

#[test]
fn rearm_eligible_honours_backoff_boundary() {
    let conn = test_db();
    let too_early = failed_with_retries(&conn, Duration::seconds(3 * 60 + 59), 2);
    let due = failed_with_retries(&conn, Duration::seconds(4 * 60 + 1), 2);

    let rearmed = rearm_eligible(&conn, Utc::now(), 100).expect("rearm pass");
    assert_eq!(rearmed, 1);
    assert_eq!(get(&conn, too_early).expect("get").status, NotificationStatus::Failed);
    assert_eq!(get(&conn, due).expect("get").status, NotificationStatus::Pending);
}

#[test]
fn rows_not_yet_due_do_not_starve_due_ones() {
    let conn = test_db();
    // Older row, next due in roughly 2^12 minutes.
    let backed_off = failed_with_retries(&conn, Duration::hours(2), 12);
    let due = failed_with_retries(&conn, Duration::minutes(10), 1);

    let now = Utc::now();
    let listed = list_retry_due(&conn, now, 1).expect("list due");
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, due);
    assert!(is_retry_eligible(&listed[0], now));

    let rearmed = rearm_eligible(&conn, now, 1).expect("rearm pass");
    assert_eq!(rearmed, 1);
    assert_eq!(get(&conn, due).expect("get").status, NotificationStatus::Pending);
    assert_eq!(get(&conn, backed_off).expect("get").status, NotificationStatus::Failed);
}

#[test]
fn most_overdue_rows_are_rearmed_first() {
    let conn = test_db();
    // Due one minute ago.
    let barely_due = failed_with_retries(&conn, Duration::minutes(5), 2);
    // Due eight minutes ago.
    let long_overdue = failed_with_retries(&conn, Duration::minutes(10), 1);

    let listed = list_retry_due(&conn, Utc::now(), 10).expect("list due");
    let ids: Vec<Uuid> = listed.iter().map(|n| n.id).collect();
    assert_eq!(ids, vec![long_overdue, barely_due]);
}

#[test]
fn huge_retry_counts_are_never_due() {
    let conn = test_db();
    let id = failed_with_retries(&conn, Duration::days(3650), 1);
    conn.execute(
        "UPDATE notifications SET retry_count = ?1 WHERE id = ?2",
        rusqlite::params![NEVER_DUE_RETRY_COUNT + 30, id.to_string()],
    )
    .expect("bump retry count");

    assert!(list_retry_due(&conn, Utc::now(), 10).expect("list due").is_empty());
}

#[test]
fn stale_claims_expire_to_failed() {
    let conn = test_db();
    let now = Utc::now();
    let n = insert(&conn, &email("stuck"), now - Duration::hours(1)).expect("insert");
    claim(&conn, n.id, now - Duration::minutes(30))
        .expect("claim")
        .expect("claimed");

    let expired = expire_stale_claims(&conn, now - Duration::minutes(10), now).expect("expire");
    assert_eq!(expired, 1);
    let row = get(&conn, n.id).expect("get");
    assert_eq!(row.status, NotificationStatus::Failed);
    assert_eq!(row.retry_count, 1);
    assert_eq!(row.error_message.as_deref(), Some(CLAIM_EXPIRED_ERROR));
}

#[test]
fn delete_finished_before_keeps_live_and_recent_rows() {
    let conn = test_db();
    let now = Utc::now();
    let long_ago = now - Duration::days(120);

    let old_sent = insert(&conn, &email("old sent"), long_ago).expect("insert");
    claim(&conn, old_sent.id, long_ago).expect("claim").expect("claimed");
    mark_sent(&conn, old_sent.id, long_ago).expect("sent");

    let old_cancelled = insert(&conn, &email("old cancelled"), long_ago).expect("insert");
    cancel(&conn, old_cancelled.id, long_ago).expect("cancel");

    let old_failed = insert(&conn, &email("old failed"), long_ago).expect("insert");
    claim(&conn, old_failed.id, long_ago).expect("claim").expect("claimed");
    mark_failed(&conn, old_failed.id, "x", long_ago).expect("fail");

    let old_pending = insert(&conn, &email("old pending"), long_ago).expect("insert");

    let recent = insert(&conn, &email("recent"), now).expect("insert");
    claim(&conn, recent.id, now).expect("claim").expect("claimed");
    mark_delivered(&conn, recent.id, now).expect("delivered");

    let deleted = delete_finished_before(&conn, now - Duration::days(90), 1).expect("delete");
    assert_eq!(deleted, 2);
    assert!(get(&conn, old_sent.id).is_err());
    assert!(get(&conn, old_cancelled.id).is_err());
    assert!(get(&conn, old_failed.id).is_ok());
    assert!(get(&conn, old_pending.id).is_ok());
    assert!(get(&conn, recent.id).is_ok());
}

#[test]
fn status_counts_group_by_status() {
    let conn = test_db();
    let now = Utc::now();
    insert(&conn, &email("a"), now).expect("insert");
    insert(&conn, &email("b"), now).expect("insert");
    let c = insert(&conn, &email("c"), now).expect("insert");
    claim(&conn, c.id, now).expect("claim").expect("claimed");
    mark_sent(&conn, c.id, now).expect("sent");
    let old = insert(&conn, &email("old"), now - Duration::hours(5)).expect("insert");
    cancel(&conn, old.id, now - Duration::hours(5)).expect("cancel");

    let all = status_counts(&conn, None).expect("counts");
    assert_eq!(all.pending, 2);
    assert_eq!(all.sent, 1);
    assert_eq!(all.cancelled, 1);
    assert_eq!(all.total(), 4);

    let last_hour = status_counts(&conn, Some(now - Duration::hours(1))).expect("counts");
    assert_eq!(last_hour.cancelled, 0);
    assert_eq!(last_hour.total(), 3);
}
