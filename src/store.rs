use sqlx::{sqlite::SqlitePoolOptions, Row, SqlitePool};

use crate::types::{now_local, ContactRow, ConversationRow};

pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!();

pub async fn connect(database_url: &str) -> Result<SqlitePool, String> {
    let db = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await
        .map_err(|err| format!("failed to open database {database_url}: {err}"))?;
    MIGRATOR
        .run(&db)
        .await
        .map_err(|err| format!("failed to run migrations: {err}"))?;
    Ok(db)
}

/// Appends one exchange. Manual sends store an empty incoming message.
pub async fn save_conversation(
    db: &SqlitePool,
    phone_number: &str,
    incoming_message: &str,
    response_message: &str,
) -> Result<(), String> {
    sqlx::query(
        "INSERT INTO conversations (phone_number, incoming_message, response_message, timestamp) \
         VALUES (?1, ?2, ?3, ?4)",
    )
    .bind(phone_number)
    .bind(incoming_message)
    .bind(response_message)
    .bind(now_local())
    .execute(db)
    .await
    .map_err(|err| format!("failed to save conversation: {err}"))?;
    Ok(())
}

pub async fn conversations_by_phone(
    db: &SqlitePool,
    phone_number: &str,
) -> Result<Vec<ConversationRow>, String> {
    let rows = sqlx::query(
        "SELECT id, phone_number, incoming_message, response_message, timestamp \
         FROM conversations WHERE phone_number = ?1 ORDER BY timestamp ASC, id ASC",
    )
    .bind(phone_number)
    .fetch_all(db)
    .await
    .map_err(|err| format!("failed to load conversations: {err}"))?;

    Ok(rows
        .into_iter()
        .map(|row| ConversationRow {
            id: row.get("id"),
            phone_number: row.get("phone_number"),
            incoming_message: row.get("incoming_message"),
            response_message: row.get("response_message"),
            timestamp: row.get("timestamp"),
        })
        .collect())
}

/// Distinct senders with the timestamp of their latest record, newest first.
pub async fn contacts(db: &SqlitePool) -> Result<Vec<ContactRow>, String> {
    let rows = sqlx::query(
        "SELECT phone_number, MAX(timestamp) AS last_message \
         FROM conversations GROUP BY phone_number ORDER BY last_message DESC",
    )
    .fetch_all(db)
    .await
    .map_err(|err| format!("failed to load contacts: {err}"))?;

    Ok(rows
        .into_iter()
        .map(|row| ContactRow {
            phone_number: row.get("phone_number"),
            last_message: row.get("last_message"),
        })
        .collect())
}

/// A sender with no row is treated as enabled.
pub async fn bot_status(db: &SqlitePool, phone_number: &str) -> Result<bool, String> {
    let row = sqlx::query("SELECT is_active FROM bot_status WHERE phone_number = ?1")
        .bind(phone_number)
        .fetch_optional(db)
        .await
        .map_err(|err| format!("failed to read bot status: {err}"))?;
    Ok(row.map(|r| r.get::<bool, _>("is_active")).unwrap_or(true))
}

pub async fn set_bot_status(
    db: &SqlitePool,
    phone_number: &str,
    is_active: bool,
) -> Result<(), String> {
    sqlx::query(
        "INSERT INTO bot_status (phone_number, is_active) VALUES (?1, ?2) \
         ON CONFLICT(phone_number) DO UPDATE SET is_active = ?2",
    )
    .bind(phone_number)
    .bind(is_active)
    .execute(db)
    .await
    .map_err(|err| format!("failed to update bot status: {err}"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_db() -> SqlitePool {
        let db = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("open in-memory db");
        MIGRATOR.run(&db).await.expect("run migrations");
        db
    }

    #[tokio::test]
    async fn bot_status_defaults_to_enabled() {
        let db = test_db().await;
        assert!(bot_status(&db, "56911112222").await.unwrap());
    }

    #[tokio::test]
    async fn bot_status_toggle_round_trips() {
        let db = test_db().await;
        set_bot_status(&db, "56911112222", false).await.unwrap();
        assert!(!bot_status(&db, "56911112222").await.unwrap());
        set_bot_status(&db, "56911112222", true).await.unwrap();
        assert!(bot_status(&db, "56911112222").await.unwrap());
    }

    #[tokio::test]
    async fn conversations_come_back_in_arrival_order() {
        let db = test_db().await;
        save_conversation(&db, "56911112222", "hola", "buenas")
            .await
            .unwrap();
        save_conversation(&db, "56911112222", "precio?", "desde 10.000")
            .await
            .unwrap();
        save_conversation(&db, "56933334444", "otro", "tema")
            .await
            .unwrap();

        let rows = conversations_by_phone(&db, "56911112222").await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].incoming_message, "hola");
        assert_eq!(rows[0].response_message, "buenas");
        assert_eq!(rows[1].incoming_message, "precio?");
    }

    #[tokio::test]
    async fn contacts_lists_each_sender_once() {
        let db = test_db().await;
        save_conversation(&db, "111", "a", "b").await.unwrap();
        save_conversation(&db, "111", "c", "d").await.unwrap();
        save_conversation(&db, "222", "e", "f").await.unwrap();

        let contacts = contacts(&db).await.unwrap();
        assert_eq!(contacts.len(), 2);
        assert!(contacts.iter().any(|c| c.phone_number == "111"));
        assert!(contacts.iter().any(|c| c.phone_number == "222"));
    }
}
