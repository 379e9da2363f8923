use std::collections::BTreeMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio_rusqlite::Connection;

use crate::types::{BannerKey, ColumnConfig, ColumnName, HiddenRef, RefType};

/// Failure of a workspace storage operation.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error(transparent)]
    Database(#[from] tokio_rusqlite::Error<rusqlite::Error>),
    #[error("stored value `{value}` is not a valid {field}")]
    Corrupt { field: &'static str, value: String },
}

/// Opens (or creates) the SQLite database at `path`, configures WAL mode,
/// and applies schema migrations via the `schema_version` table.
///
/// `busy_timeout` is set via the `Connection` method rather than a PRAGMA string
/// so the setting takes effect regardless of pragma caching.
///
/// # Errors
///
/// Returns [`StorageError::Database`] if the file cannot be opened, WAL
/// configuration fails, or schema DDL fails.
pub async fn open_db(path: &str) -> Result<Connection, StorageError> {
    let conn = Connection::open(path)
        .await
        .map_err(tokio_rusqlite::Error::Error)?;

    conn.call(|db| -> rusqlite::Result<()> {
        db.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;",
        )?;
        db.busy_timeout(Duration::from_secs(5))?;
        Ok(())
    })
    .await?;

    // Leftover WAL from a previous run.
    conn.call(|db| -> rusqlite::Result<()> {
        db.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
        Ok(())
    })
    .await?;

    conn.call(|db| -> rusqlite::Result<()> { crate::schema::migrate(db) })
        .await?;

    Ok(conn)
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Loads every stored hidden ref, across all repositories, keyed by ref id.
///
/// Filtering to the active repository is the caller's job; entries for other
/// repositories stay stored but are never surfaced.
///
/// # Errors
///
/// Returns [`StorageError::Corrupt`] if a row holds an unknown `ref_type`.
pub async fn load_hidden_refs(
    conn: &Connection,
) -> Result<BTreeMap<String, HiddenRef>, StorageError> {
    let rows = conn
        .call(|db| -> rusqlite::Result<Vec<(String, String, String, Option<String>)>> {
            let mut stmt = db.prepare("SELECT id, ref_type, name, owner FROM hidden_refs")?;
            let rows = stmt
                .query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await?;

    rows.into_iter()
        .map(|(id, ref_type, name, owner)| {
            let ref_type = RefType::parse(&ref_type).ok_or(StorageError::Corrupt {
                field: "ref type",
                value: ref_type,
            })?;
            Ok((id.clone(), HiddenRef { id, ref_type, name, owner }))
        })
        .collect()
}

/// Hides (`visible == false`) or reveals (`visible == true`) each ref in `refs`.
///
/// All changes are applied in a single `BEGIN IMMEDIATE` transaction. Hiding an
/// already-hidden ref replaces its stored name and owner.
///
/// # Errors
///
/// Returns [`StorageError::Database`] if the transaction fails.
pub async fn update_hidden_refs(
    conn: &Connection,
    refs: Vec<HiddenRef>,
    visible: bool,
) -> Result<(), StorageError> {
    conn.call(move |db| -> rusqlite::Result<()> {
        let tx = db.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
        for r in &refs {
            if visible {
                tx.execute("DELETE FROM hidden_refs WHERE id = ?1", rusqlite::params![&r.id])?;
            } else {
                tx.execute(
                    "INSERT INTO hidden_refs (id, ref_type, name, owner)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(id)
                     DO UPDATE SET ref_type = excluded.ref_type,
                                   name = excluded.name,
                                   owner = excluded.owner",
                    rusqlite::params![&r.id, r.ref_type.as_str(), &r.name, &r.owner],
                )?;
            }
        }
        tx.commit()?;
        Ok(())
    })
    .await?;
    Ok(())
}

/// Loads user column overrides. Columns never touched are absent.
///
/// # Errors
///
/// Returns [`StorageError::Corrupt`] if a row names an unknown column.
pub async fn load_columns(
    conn: &Connection,
) -> Result<BTreeMap<ColumnName, ColumnConfig>, StorageError> {
    let rows = conn
        .call(|db| -> rusqlite::Result<Vec<(String, Option<i64>, Option<bool>)>> {
            let mut stmt = db.prepare("SELECT name, width, is_hidden FROM columns")?;
            let rows = stmt
                .query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await?;

    rows.into_iter()
        .map(|(name, width, is_hidden)| {
            let column = ColumnName::parse(&name).ok_or(StorageError::Corrupt {
                field: "column name",
                value: name,
            })?;
            let width = width.map(|w| w.clamp(0, u32::MAX as i64) as u32);
            Ok((column, ColumnConfig { width, is_hidden }))
        })
        .collect()
}

/// Stores the override for a single column, replacing any previous one.
///
/// # Errors
///
/// Returns [`StorageError::Database`] if the upsert fails.
pub async fn save_column(
    conn: &Connection,
    name: ColumnName,
    config: ColumnConfig,
) -> Result<(), StorageError> {
    conn.call(move |db| -> rusqlite::Result<()> {
        db.execute(
            "INSERT INTO columns (name, width, is_hidden)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(name)
             DO UPDATE SET width = excluded.width,
                           is_hidden = excluded.is_hidden",
            rusqlite::params![name.as_str(), config.width.map(i64::from), config.is_hidden],
        )?;
        Ok(())
    })
    .await?;
    Ok(())
}

/// Returns the banners the user has dismissed.
///
/// Unknown keys are skipped rather than treated as corruption; a newer build
/// may have written banners this one does not know.
///
/// # Errors
///
/// Returns [`StorageError::Database`] if the query fails.
pub async fn load_dismissed_banners(conn: &Connection) -> Result<Vec<BannerKey>, StorageError> {
    let keys = conn
        .call(|db| -> rusqlite::Result<Vec<String>> {
            let mut stmt = db.prepare("SELECT key FROM dismissed_banners")?;
            let rows = stmt
                .query_map([], |r| r.get(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await?;
    Ok(keys.iter().filter_map(|k| BannerKey::parse(k)).collect())
}

/// Records that `key` was dismissed. Dismissing twice keeps the first timestamp.
///
/// # Errors
///
/// Returns [`StorageError::Database`] if the insert fails.
pub async fn dismiss_banner(conn: &Connection, key: BannerKey) -> Result<(), StorageError> {
    conn.call(move |db| -> rusqlite::Result<()> {
        db.execute(
            "INSERT OR IGNORE INTO dismissed_banners (key, dismissed_at) VALUES (?1, ?2)",
            rusqlite::params![key.as_str(), now_secs()],
        )?;
        Ok(())
    })
    .await?;
    Ok(())
}
