use chrono::Duration;
use exam_core::model::{AttemptSummary, Part, SessionId};
use exam_core::time::fixed_now;
use storage::repository::{AttemptRepository, StorageError};
use storage::sqlite::SqliteRepository;

fn summary(session: &str, completed_after_mins: i64, expired: bool) -> AttemptSummary {
    let started = fixed_now();
    AttemptSummary::from_persisted(
        SessionId::new(session).unwrap(),
        started,
        started + Duration::minutes(completed_after_mins),
        [2, 1, 0],
        95,
        expired,
    )
    .unwrap()
}

#[tokio::test]
async fn sqlite_roundtrip_persists_attempt() {
    let repo = SqliteRepository::connect("sqlite:file:memdb_attempt_roundtrip?mode=memory&cache=shared")
        .await
        .expect("connect");
    repo.migrate().await.expect("migrate");

    let id = repo
        .append_attempt(&summary("abc-1", 14, true))
        .await
        .expect("append");
    let fetched = repo.get_attempt(id).await.expect("fetch");

    assert_eq!(fetched.session_id().as_str(), "abc-1");
    assert_eq!(fetched.recordings_in(Part::One), 2);
    assert_eq!(fetched.recordings_in(Part::Two), 1);
    assert_eq!(fetched.total_recorded_secs(), 95);
    assert!(fetched.expired());
    assert_eq!(fetched.completed_at(), fixed_now() + Duration::minutes(14));
}

#[tokio::test]
async fn sqlite_lists_newest_first_and_rejects_duplicates() {
    let repo = SqliteRepository::connect("sqlite:file:memdb_attempt_list?mode=memory&cache=shared")
        .await
        .expect("connect");
    repo.migrate().await.expect("migrate");
    // Migrations are idempotent.
    repo.migrate().await.expect("migrate twice");
    let applied: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM schema_migrations")
        .fetch_one(repo.pool())
        .await
        .expect("count migrations");
    assert_eq!(applied, 1);

    repo.append_attempt(&summary("s1", 3, false)).await.unwrap();
    repo.append_attempt(&summary("s2", 8, false)).await.unwrap();
    repo.append_attempt(&summary("s3", 5, false)).await.unwrap();

    let rows = repo.list_attempts(10).await.unwrap();
    let order: Vec<&str> = rows.iter().map(|r| r.summary.session_id().as_str()).collect();
    assert_eq!(order, vec!["s2", "s3", "s1"]);

    let err = repo
        .append_attempt(&summary("s2", 9, false))
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::Conflict));

    assert!(matches!(
        repo.get_attempt(999).await,
        Err(StorageError::NotFound)
    ));
}
