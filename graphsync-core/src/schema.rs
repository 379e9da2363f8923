/// DDL to create the schema_version tracking table.
///
/// Applied unconditionally on every DB open (before checking the version),
/// using `IF NOT EXISTS` so it is safe to run multiple times.
pub const SCHEMA_VERSION_DDL: &str = "
    CREATE TABLE IF NOT EXISTS schema_version (
        version INTEGER NOT NULL
    ) STRICT;
";

/// DDL for the v1 workspace schema.
///
/// - `hidden_refs`: one row per hidden branch or tag, keyed by ref id. Ids carry
///   their repository path, so one workspace database serves every repository.
/// - `columns`: user overrides for graph column width and visibility. `NULL`
///   means "use the default".
/// - `dismissed_banners`: banners the user closed.
pub const SCHEMA_V1_SQL: &str = "
    CREATE TABLE IF NOT EXISTS hidden_refs (
        id        TEXT PRIMARY KEY,
        ref_type  TEXT NOT NULL CHECK(ref_type IN ('head', 'remote', 'tag')),
        name      TEXT NOT NULL,
        owner     TEXT
    ) STRICT;

    CREATE TABLE IF NOT EXISTS columns (
        name       TEXT PRIMARY KEY
                        CHECK(name IN ('ref','graph','message','author','datetime','sha')),
        width      INTEGER,
        is_hidden  INTEGER
    ) STRICT;

    CREATE TABLE IF NOT EXISTS dismissed_banners (
        key           TEXT PRIMARY KEY CHECK(key IN ('preview', 'trial')),
        dismissed_at  INTEGER NOT NULL
    ) STRICT;
";

/// Runs forward-only schema migration to bring the DB to the latest version.
///
/// Idempotent: safe to call on every startup.
///
/// # Errors
///
/// Returns `rusqlite::Error` if the DDL fails or the version row cannot be read.
pub fn migrate(db: &mut rusqlite::Connection) -> rusqlite::Result<()> {
    db.execute_batch(SCHEMA_VERSION_DDL)?;

    let version: i64 = db
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |r| r.get(0),
        )
        .unwrap_or(0);

    if version < 1 {
        let tx = db.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
        tx.execute_batch(SCHEMA_V1_SQL)?;
        tx.execute("INSERT INTO schema_version (version) VALUES (1)", [])?;
        tx.commit()?;
    }

    Ok(())
}
