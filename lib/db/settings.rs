//! Persisted string key/value settings.
//!
//! Holds small durable configuration such as the active extraction provider
//! selection. Values survive restarts and win over environment defaults.

use diesel::sql_query;
use diesel::sql_types::Text;
use diesel::QueryableByName;
use diesel_async::RunQueryDsl;

use super::{DbConnection, StorageError};

#[doc(hidden)]
#[derive(Debug, QueryableByName)]
pub struct SettingRow {
    #[diesel(sql_type = Text)]
    pub value: String,
}

/// Reads one setting by name, if present.
pub async fn get_setting(
    conn: &mut DbConnection,
    name: &str,
) -> Result<Option<String>, StorageError> {
    let mut rows: Vec<SettingRow> = sql_query("SELECT value FROM settings WHERE name = ? LIMIT 1")
        .bind::<Text, _>(name)
        .load(conn)
        .await?;

    Ok(rows.pop().map(|row| row.value))
}

/// Writes one setting, replacing any previous value atomically.
pub async fn put_setting(
    conn: &mut DbConnection,
    name: &str,
    value: &str,
) -> Result<(), StorageError> {
    sql_query(
        "INSERT INTO settings (name, value) VALUES (?, ?) \
         ON CONFLICT (name) DO UPDATE SET value = excluded.value",
    )
    .bind::<Text, _>(name)
    .bind::<Text, _>(value)
    .execute(conn)
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_in_memory;

    #[tokio::test]
    async fn put_then_get_returns_latest_value() {
        let mut conn = open_in_memory().expect("failed to open in-memory store");

        assert_eq!(
            get_setting(&mut conn, "provider.use_remote")
                .await
                .expect("get failed"),
            None
        );

        put_setting(&mut conn, "provider.use_remote", "false")
            .await
            .expect("put failed");
        put_setting(&mut conn, "provider.use_remote", "true")
            .await
            .expect("overwrite failed");

        assert_eq!(
            get_setting(&mut conn, "provider.use_remote")
                .await
                .expect("get failed"),
            Some("true".to_string())
        );
    }
}
