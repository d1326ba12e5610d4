//! Raw durable-store access for buffered backup retry entries.

use diesel::sql_query;
use diesel::sql_types::{BigInt, Integer, Nullable, Text};
use diesel::QueryableByName;
use diesel_async::RunQueryDsl;

use crate::db::{DbConnection, StorageError};

/// One buffered record awaiting re-delivery to the backup target.
#[derive(Debug, Clone, QueryableByName)]
pub struct RetryEntry {
    #[diesel(sql_type = BigInt)]
    pub entry_id: i64,
    #[diesel(sql_type = Text)]
    pub record_json: String,
    #[diesel(sql_type = Integer)]
    pub attempts: i32,
    #[diesel(sql_type = BigInt)]
    pub next_attempt_at_ms: i64,
    #[diesel(sql_type = Nullable<Text>)]
    pub last_error: Option<String>,
}

#[derive(Debug, QueryableByName)]
struct RowIdRow {
    #[diesel(sql_type = BigInt)]
    id: i64,
}

#[derive(Debug, QueryableByName)]
struct CountRow {
    #[diesel(sql_type = BigInt)]
    count: i64,
}

const ENTRY_COLUMNS: &str = "entry_id, record_json, attempts, next_attempt_at_ms, last_error";

/// Persists one new retry entry and returns its assigned id.
pub async fn insert_entry(
    conn: &mut DbConnection,
    record_json: &str,
    attempts: i32,
    next_attempt_at_ms: i64,
    last_error: &str,
) -> Result<i64, StorageError> {
    sql_query(
        "INSERT INTO sync_retry_entries \
         (record_json, attempts, next_attempt_at_ms, last_error) \
         VALUES (?, ?, ?, ?)",
    )
    .bind::<Text, _>(record_json)
    .bind::<Integer, _>(attempts)
    .bind::<BigInt, _>(next_attempt_at_ms)
    .bind::<Text, _>(last_error)
    .execute(conn)
    .await?;

    let mut rows: Vec<RowIdRow> = sql_query("SELECT last_insert_rowid() AS id")
        .load(conn)
        .await?;

    rows.pop()
        .map(|row| row.id)
        .ok_or_else(|| StorageError::InvalidValue("last_insert_rowid returned no row".to_string()))
}

/// Records the outcome of one failed re-delivery attempt.
pub async fn update_entry(
    conn: &mut DbConnection,
    entry_id: i64,
    attempts: i32,
    next_attempt_at_ms: i64,
    last_error: &str,
) -> Result<usize, StorageError> {
    let affected = sql_query(
        "UPDATE sync_retry_entries \
         SET attempts = ?, next_attempt_at_ms = ?, last_error = ? \
         WHERE entry_id = ?",
    )
    .bind::<Integer, _>(attempts)
    .bind::<BigInt, _>(next_attempt_at_ms)
    .bind::<Text, _>(last_error)
    .bind::<BigInt, _>(entry_id)
    .execute(conn)
    .await?;

    Ok(affected)
}

/// Removes one entry, on success or permanent failure alike.
pub async fn delete_entry(conn: &mut DbConnection, entry_id: i64) -> Result<bool, StorageError> {
    let affected = sql_query("DELETE FROM sync_retry_entries WHERE entry_id = ?")
        .bind::<BigInt, _>(entry_id)
        .execute(conn)
        .await?;

    Ok(affected > 0)
}

/// Lists entries whose backoff window has elapsed, oldest first.
pub async fn list_due(
    conn: &mut DbConnection,
    now_ms: i64,
) -> Result<Vec<RetryEntry>, StorageError> {
    let rows: Vec<RetryEntry> = sql_query(format!(
        "SELECT {ENTRY_COLUMNS} FROM sync_retry_entries \
         WHERE next_attempt_at_ms <= ? \
         ORDER BY entry_id ASC"
    ))
    .bind::<BigInt, _>(now_ms)
    .load(conn)
    .await?;

    Ok(rows)
}

/// Counts all buffered entries, due or not.
pub async fn count_entries(conn: &mut DbConnection) -> Result<i64, StorageError> {
    let mut rows: Vec<CountRow> =
        sql_query("SELECT COUNT(*) AS count FROM sync_retry_entries")
            .load(conn)
            .await?;

    Ok(rows.pop().map(|row| row.count).unwrap_or(0))
}
