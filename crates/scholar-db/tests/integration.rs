use scholar_db::{create_pool, run_migrations, DbRuntimeSettings};

#[test]
fn db_initialization_creates_relay_tables() {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let path = dir.path().join("relay.db");
    let pool = create_pool(path.to_str().expect("utf-8 path"), DbRuntimeSettings::default())
        .expect("failed to create pool");
    let conn = pool.get().expect("failed to get connection");
    let applied = run_migrations(&conn).expect("failed to run migrations");
    assert_eq!(applied, 2);

    let mut stmt = conn
        .prepare(
            "SELECT name FROM sqlite_master
             WHERE type='table' AND name NOT LIKE 'sqlite_%'
             ORDER BY name",
        )
        .expect("failed to prepare table query");
    let tables: Vec<String> = stmt
        .query_map([], |row| row.get(0))
        .expect("failed to execute table query")
        .map(|r| r.expect("failed to read table name"))
        .collect();

    assert_eq!(
        tables,
        vec![
            "_scholar_migrations".to_string(),
            "notifications".to_string(),
            "outbox_messages".to_string(),
        ]
    );
}

#[test]
fn migrations_survive_reopen() {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let path = dir.path().join("relay.db");
    let path = path.to_str().expect("utf-8 path");

    {
        let pool = create_pool(path, DbRuntimeSettings::default()).expect("first pool");
        let conn = pool.get().expect("connection");
        assert_eq!(run_migrations(&conn).expect("first run"), 2);
    }

    let pool = create_pool(path, DbRuntimeSettings::default()).expect("second pool");
    let conn = pool.get().expect("connection");
    assert_eq!(run_migrations(&conn).expect("second run"), 0);
}
