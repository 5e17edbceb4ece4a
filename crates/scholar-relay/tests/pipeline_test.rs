use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use scholar_db::{create_pool, run_blocking, run_migrations, DbPool, DbRuntimeSettings};
use scholar_notify::{
    find_by_correlation, LogSender, NewNotification, NotificationContent, NotificationQueue,
    Recipient,
};
use scholar_outbox::{enqueue, OutboxError};
use scholar_relay::background::{run_retry_once, RetryPass};
use scholar_relay::config::{Config, PublisherMode};
use scholar_relay::{start, StartupError};
use scholar_types::{
    AttendanceMarkedEvent, AttendanceStatus, NotificationChannel, NotificationStatus,
    StudentEnrolledEvent,
};
use tempfile::TempDir;
use uuid::Uuid;

fn test_pool() -> (TempDir, DbPool) {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let path = dir.path().join("relay.db");
    let pool = create_pool(path.to_str().expect("utf-8 path"), DbRuntimeSettings::default())
        .expect("failed to create pool");
    let conn = pool.get().expect("failed to get connection");
    run_migrations(&conn).expect("failed to run migrations");
    (dir, pool)
}

fn fast_config() -> Config {
    let mut config = Config::default();
    config.outbox.processing_interval_secs = 1;
    config.outbox.read_retry_delay_ms = 1;
    config.notifications.poll_interval_ms = 20;
    config.metrics.interval_secs = 1;
    config
}

#[tokio::test]
async fn outbox_events_become_sent_notifications() {
    let (_dir, pool) = test_pool();

    let (enrolled_id, absent_id) = {
        let mut conn = pool.get().expect("conn");
        // Business change and outbox row commit together.
        let tx = conn.transaction().expect("begin");
        let enrolled = enqueue(
            &tx,
            &StudentEnrolledEvent {
                student_id: Uuid::new_v4(),
                student_name: "Ada Obi".to_string(),
                class_name: "JSS 1A".to_string(),
                guardian_email: Some("guardian@example.com".to_string()),
                guardian_user_id: None,
            },
        )
        .expect("enqueue enrollment");
        let absent = enqueue(
            &tx,
            &AttendanceMarkedEvent {
                student_id: Uuid::new_v4(),
                student_name: "Ada Obi".to_string(),
                date: NaiveDate::from_ymd_opt(2026, 9, 14).expect("valid date"),
                status: AttendanceStatus::Absent,
                guardian_phone: Some("+2348000000000".to_string()),
            },
        )
        .expect("enqueue attendance");
        tx.commit().expect("commit");
        (enrolled.id, absent.id)
    };

    let relay = start(&fast_config(), pool.clone(), Arc::new(LogSender)).expect("relay starts");
    assert_eq!(relay.supervisor.len(), 6);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    loop {
        let counts = relay.queue.status_counts(None).await.expect("counts");
        if counts.sent == 2 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "notifications not sent in time: {counts:?}"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    for (outbox_id, channel) in [
        (enrolled_id, NotificationChannel::Email),
        (absent_id, NotificationChannel::Sms),
    ] {
        let row = run_blocking(&pool, move |conn| scholar_outbox::get(conn, outbox_id))
            .await
            .expect("outbox lookup")
            .expect("row exists");
        assert!(row.processed_at.is_some());
        assert_eq!(row.error, None);

        let correlation = outbox_id.to_string();
        let notifications =
            run_blocking(&pool, move |conn| find_by_correlation(conn, &correlation))
                .await
                .expect("notification lookup");
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].channel, channel);
        assert_eq!(notifications[0].status, NotificationStatus::Sent);
    }

    let broker = relay.broker.clone().expect("broker mode");
    let receiver = broker
        .receiver("school-events", "notification-service")
        .expect("subscription exists");
    assert!(receiver.dead_letters().is_empty());

    let report = relay.supervisor.shutdown(Duration::from_secs(5)).await;
    assert_eq!(report.stopped.len(), 6);
    assert_eq!(report.aborted, 0);
}

#[tokio::test]
async fn http_mode_requires_an_endpoint() {
    let (_dir, pool) = test_pool();
    let mut config = Config::default();
    config.broker.mode = PublisherMode::Http;

    let result = start(&config, pool, Arc::new(LogSender));
    assert!(matches!(result, Err(StartupError::MissingEndpoint)));
}

#[tokio::test]
async fn http_mode_runs_without_a_local_consumer() {
    let (_dir, pool) = test_pool();
    let mut config = Config::default();
    config.broker.mode = PublisherMode::Http;
    config.broker.endpoint = Some("http://127.0.0.1:9/events".to_string());

    let relay = start(&config, pool, Arc::new(LogSender)).expect("relay starts");
    assert!(relay.broker.is_none());
    assert_eq!(relay.supervisor.len(), 5);
    let report = relay.supervisor.shutdown(Duration::from_secs(5)).await;
    assert_eq!(report.aborted, 0);
}

#[tokio::test]
async fn retry_pass_expires_stale_claims_and_rearms_due_rows() {
    let (_dir, pool) = test_pool();
    let queue = NotificationQueue::new(pool.clone(), Duration::from_secs(1));
    let email = || {
        NewNotification::new(
            NotificationChannel::Email,
            Recipient::email("guardian@example.com"),
            NotificationContent::new(None, "hello"),
        )
    };

    // Failed long enough ago to be due again.
    let due = queue.enqueue(email()).await.expect("enqueue");
    queue.dequeue_batch(1).await.expect("claim");
    queue
        .mark_failed(due.id, "smtp 451".to_string())
        .await
        .expect("fail");
    let due_id = due.id.to_string();
    run_blocking(&pool, move |conn| {
        conn.execute(
            "UPDATE notifications SET created_at = ?1 WHERE id = ?2",
            rusqlite::params![
                scholar_db::format_timestamp(Utc::now() - chrono::Duration::minutes(10)),
                due_id
            ],
        )
        .map_err(OutboxError::from)
    })
    .await
    .expect("backdate");

    // Claimed and never finished.
    let stuck = queue.enqueue(email()).await.expect("enqueue");
    queue.dequeue_batch(1).await.expect("claim");
    tokio::time::sleep(Duration::from_millis(5)).await;

    let pass = run_retry_once(&queue, Duration::ZERO, 100)
        .await
        .expect("retry pass");
    assert_eq!(
        pass,
        RetryPass {
            expired: 1,
            rearmed: 1,
        }
    );

    assert_eq!(
        queue.get(due.id).await.expect("get").status,
        NotificationStatus::Pending
    );
    let expired = queue.get(stuck.id).await.expect("get");
    assert_eq!(expired.status, NotificationStatus::Failed);
    assert_eq!(expired.retry_count, 1);
}
