//! Raw durable-store access for queue items.
//!
//! Every write here is a single statement, so each item mutation is atomic;
//! batch semantics are the in-memory store's concern.

use diesel::sql_query;
use diesel::sql_types::{BigInt, Binary, Nullable, Text};
use diesel::QueryableByName;
use diesel_async::RunQueryDsl;

use crate::db::{from_millis, to_millis, DbConnection, StorageError};
use crate::provider::ExtractedRecord;

use super::types::{ItemStatus, QueueItem};

#[doc(hidden)]
#[derive(Debug, QueryableByName)]
pub struct ItemRow {
    #[diesel(sql_type = Text)]
    pub id: String,
    #[diesel(sql_type = BigInt)]
    pub seq: i64,
    #[diesel(sql_type = Text)]
    pub file_name: String,
    #[diesel(sql_type = Text)]
    pub mime_type: String,
    #[diesel(sql_type = Binary)]
    pub payload: Vec<u8>,
    #[diesel(sql_type = Text)]
    pub status: String,
    #[diesel(sql_type = Nullable<Text>)]
    pub result_json: Option<String>,
    #[diesel(sql_type = Nullable<Text>)]
    pub error: Option<String>,
    #[diesel(sql_type = BigInt)]
    pub enqueued_at_ms: i64,
    #[diesel(sql_type = Nullable<BigInt>)]
    pub started_at_ms: Option<i64>,
}

#[doc(hidden)]
#[derive(Debug, QueryableByName)]
pub struct SeqRow {
    #[diesel(sql_type = BigInt)]
    pub seq: i64,
}

const ITEM_COLUMNS: &str = "id, seq, file_name, mime_type, payload, status, result_json, error, \
     enqueued_at_ms, started_at_ms";

fn map_item_row(row: ItemRow) -> Result<QueueItem, StorageError> {
    let result = row
        .result_json
        .as_deref()
        .map(serde_json::from_str::<ExtractedRecord>)
        .transpose()?;

    Ok(QueueItem {
        id: row.id,
        seq: row.seq,
        file_name: row.file_name,
        mime_type: row.mime_type,
        payload: row.payload,
        status: ItemStatus::from_db_str(&row.status)?,
        result,
        error: row.error,
        enqueued_at: from_millis(row.enqueued_at_ms)?,
        started_at: row.started_at_ms.map(from_millis).transpose()?,
    })
}

/// Persists one new queue item.
pub async fn insert_item(conn: &mut DbConnection, item: &QueueItem) -> Result<(), StorageError> {
    let result_json = item
        .result
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    sql_query(
        "INSERT INTO queue_items \
         (id, seq, file_name, mime_type, payload, status, result_json, error, \
          enqueued_at_ms, started_at_ms) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind::<Text, _>(item.id.as_str())
    .bind::<BigInt, _>(item.seq)
    .bind::<Text, _>(item.file_name.as_str())
    .bind::<Text, _>(item.mime_type.as_str())
    .bind::<Binary, _>(item.payload.as_slice())
    .bind::<Text, _>(item.status.as_db_str())
    .bind::<Nullable<Text>, _>(result_json.as_deref())
    .bind::<Nullable<Text>, _>(item.error.as_deref())
    .bind::<BigInt, _>(to_millis(item.enqueued_at))
    .bind::<Nullable<BigInt>, _>(item.started_at.map(to_millis))
    .execute(conn)
    .await?;

    Ok(())
}

/// Reads one item by id, if present.
pub async fn get_item(
    conn: &mut DbConnection,
    id: &str,
) -> Result<Option<QueueItem>, StorageError> {
    let mut rows: Vec<ItemRow> = sql_query(format!(
        "SELECT {ITEM_COLUMNS} FROM queue_items WHERE id = ? LIMIT 1"
    ))
    .bind::<Text, _>(id)
    .load(conn)
    .await?;

    rows.pop().map(map_item_row).transpose()
}

/// Lists every item in FIFO order (`enqueued_at`, then assignment order).
pub async fn list_items(conn: &mut DbConnection) -> Result<Vec<QueueItem>, StorageError> {
    let rows: Vec<ItemRow> = sql_query(format!(
        "SELECT {ITEM_COLUMNS} FROM queue_items ORDER BY enqueued_at_ms ASC, seq ASC"
    ))
    .load(conn)
    .await?;

    rows.into_iter().map(map_item_row).collect()
}

/// Rewrites the mutable columns of one item in a single atomic statement.
///
/// All four columns are set together so the "result iff completed, error iff
/// failed" invariant can never be observed half-applied.
pub async fn update_status(
    conn: &mut DbConnection,
    id: &str,
    status: ItemStatus,
    result_json: Option<&str>,
    error: Option<&str>,
    started_at_ms: Option<i64>,
) -> Result<usize, StorageError> {
    let affected = sql_query(
        "UPDATE queue_items \
         SET status = ?, result_json = ?, error = ?, started_at_ms = ? \
         WHERE id = ?",
    )
    .bind::<Text, _>(status.as_db_str())
    .bind::<Nullable<Text>, _>(result_json)
    .bind::<Nullable<Text>, _>(error)
    .bind::<Nullable<BigInt>, _>(started_at_ms)
    .bind::<Text, _>(id)
    .execute(conn)
    .await?;

    Ok(affected)
}

/// Deletes one item; returns whether a row existed.
pub async fn delete_item(conn: &mut DbConnection, id: &str) -> Result<bool, StorageError> {
    let affected = sql_query("DELETE FROM queue_items WHERE id = ?")
        .bind::<Text, _>(id)
        .execute(conn)
        .await?;

    Ok(affected > 0)
}

/// Deletes every item currently in `status`.
pub async fn delete_by_status(
    conn: &mut DbConnection,
    status: ItemStatus,
) -> Result<usize, StorageError> {
    let affected = sql_query("DELETE FROM queue_items WHERE status = ?")
        .bind::<Text, _>(status.as_db_str())
        .execute(conn)
        .await?;

    Ok(affected)
}

/// Deletes every item.
pub async fn delete_all(conn: &mut DbConnection) -> Result<usize, StorageError> {
    let affected = sql_query("DELETE FROM queue_items").execute(conn).await?;
    Ok(affected)
}

/// Forces every `processing` item back to `pending` with `started_at` cleared.
///
/// Cold-start recovery: `processing` can only be validly observed while a
/// processor is running, so any such row at startup marks work interrupted
/// mid-extraction that must be redone.
pub async fn requeue_processing(conn: &mut DbConnection) -> Result<usize, StorageError> {
    let affected = sql_query(
        "UPDATE queue_items \
         SET status = ?, started_at_ms = NULL \
         WHERE status = ?",
    )
    .bind::<Text, _>(ItemStatus::Pending.as_db_str())
    .bind::<Text, _>(ItemStatus::Processing.as_db_str())
    .execute(conn)
    .await?;

    Ok(affected)
}

/// Returns the highest assigned sequence number, or 0 when the table is empty.
pub async fn max_seq(conn: &mut DbConnection) -> Result<i64, StorageError> {
    let mut rows: Vec<SeqRow> =
        sql_query("SELECT COALESCE(MAX(seq), 0) AS seq FROM queue_items")
            .load(conn)
            .await?;

    Ok(rows.pop().map(|row| row.seq).unwrap_or(0))
}
