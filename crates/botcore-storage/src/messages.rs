//! Chat message log used to infer the "source" message of a command.

use crate::Storage;
use botcore_ipc::MessageRef;
use botcore_types::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, OptionalExtension, Row};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub struct MessageRecord {
    pub chat_id: i64,
    pub message_id: i64,
    pub actor_id: Option<i64>,
    pub date: DateTime<Utc>,
    pub text: Option<String>,
    pub module: Option<String>,
    pub command: Option<String>,
    /// The message text itself was a command (as opposed to a message that
    /// only had a command attributed to it afterwards).
    pub command_explicit: bool,
}

impl MessageRecord {
    pub fn from_message(message: &MessageRef) -> Self {
        Self {
            chat_id: message.chat_id,
            message_id: message.message_id,
            actor_id: message.actor_id,
            date: message.date.unwrap_or_else(Utc::now),
            text: message.text.clone(),
            module: None,
            command: None,
            command_explicit: message.is_command(),
        }
    }

    pub fn with_command(mut self, module: &str, command: &str) -> Self {
        self.module = Some(module.to_string());
        self.command = Some(command.to_string());
        self
    }

    pub fn to_message_ref(&self) -> MessageRef {
        MessageRef {
            message_id: self.message_id,
            chat_id: self.chat_id,
            actor_id: self.actor_id,
            text: self.text.clone(),
            date: Some(self.date),
        }
    }
}

const SELECT_COLUMNS: &str = "chat_id, message_id, actor_id, date, text, module, command, command_explicit";

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<MessageRecord> {
    let date: String = row.get(3)?;
    let date = DateTime::parse_from_rfc3339(&date)
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
        })?
        .with_timezone(&Utc);
    Ok(MessageRecord {
        chat_id: row.get(0)?,
        message_id: row.get(1)?,
        actor_id: row.get(2)?,
        date,
        text: row.get(4)?,
        module: row.get(5)?,
        command: row.get(6)?,
        command_explicit: row.get::<_, i64>(7)? != 0,
    })
}

#[derive(Clone)]
pub struct MessageLog {
    storage: Arc<Storage>,
}

impl MessageLog {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    /// Upserts on (chat_id, message_id); an edited message replaces its text.
    pub fn record(&self, record: &MessageRecord) -> Result<()> {
        debug!(
            chat_id = record.chat_id,
            message_id = record.message_id,
            command = record.command.as_deref().unwrap_or(""),
            "Recording chat message"
        );
        self.storage.write(|conn| {
            conn.execute(
                "INSERT INTO chat_message
                    (chat_id, message_id, actor_id, date, text, module, command, command_explicit)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(chat_id, message_id) DO UPDATE SET
                    actor_id = excluded.actor_id,
                    text = excluded.text,
                    module = COALESCE(excluded.module, chat_message.module),
                    command = COALESCE(excluded.command, chat_message.command),
                    command_explicit = excluded.command_explicit",
                params![
                    record.chat_id,
                    record.message_id,
                    record.actor_id,
                    record.date.to_rfc3339_opts(SecondsFormat::Secs, true),
                    record.text,
                    record.module,
                    record.command,
                    record.command_explicit as i64,
                ],
            )?;
            Ok(())
        })
    }

    pub fn get(&self, chat_id: i64, message_id: i64) -> Result<Option<MessageRecord>> {
        let sql = format!(
            "SELECT {} FROM chat_message WHERE chat_id = ?1 AND message_id = ?2",
            SELECT_COLUMNS
        );
        self.storage.read(|conn| {
            Ok(conn
                .query_row(&sql, params![chat_id, message_id], row_to_record)
                .optional()?)
        })
    }

    /// Most recent message in `chat`, optionally by `actor`; `explicit`
    /// restricts to messages whose text was a command.
    pub fn latest(
        &self,
        chat_id: i64,
        actor_id: Option<i64>,
        explicit: bool,
    ) -> Result<Option<MessageRecord>> {
        let sql = format!(
            "SELECT {} FROM chat_message
             WHERE chat_id = ?1
               AND (?2 IS NULL OR actor_id = ?2)
               AND (?3 = 0 OR command_explicit = 1)
             ORDER BY date DESC, message_id DESC
             LIMIT 1",
            SELECT_COLUMNS
        );
        self.storage.read(|conn| {
            Ok(conn
                .query_row(&sql, params![chat_id, actor_id, explicit as i64], row_to_record)
                .optional()?)
        })
    }

    /// Most recent command-bearing message in `chat` older than
    /// `before_message_id` when given.
    pub fn latest_command(
        &self,
        chat_id: i64,
        before_message_id: Option<i64>,
    ) -> Result<Option<MessageRecord>> {
        let sql = format!(
            "SELECT {} FROM chat_message
             WHERE chat_id = ?1
               AND command IS NOT NULL
               AND (?2 IS NULL OR message_id < ?2)
             ORDER BY date DESC, message_id DESC
             LIMIT 1",
            SELECT_COLUMNS
        );
        self.storage.read(|conn| {
            Ok(conn
                .query_row(&sql, params![chat_id, before_message_id], row_to_record)
                .optional()?)
        })
    }

    /// Messages of `chat` with `from <= date < to`, oldest first.
    pub fn range(
        &self,
        chat_id: i64,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<MessageRecord>> {
        let sql = format!(
            "SELECT {} FROM chat_message
             WHERE chat_id = ?1 AND date >= ?2 AND date < ?3
             ORDER BY date ASC, message_id ASC",
            SELECT_COLUMNS
        );
        self.storage.read(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(
                params![
                    chat_id,
                    from.to_rfc3339_opts(SecondsFormat::Secs, true),
                    to.to_rfc3339_opts(SecondsFormat::Secs, true)
                ],
                row_to_record,
            )?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::temp_db_path;
    use chrono::{Duration, TimeZone};

    fn log(name: &str) -> MessageLog {
        let storage = Storage::new(temp_db_path(name)).expect("storage");
        MessageLog::new(Arc::new(storage))
    }

    fn message(id: i64, secs: i64, text: &str) -> MessageRef {
        let base = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        MessageRef::new(7, id)
            .from_actor(3)
            .with_text(text)
            .with_date(base + Duration::seconds(secs))
    }

    #[test]
    fn latest_command_skips_plain_and_newer_messages() {
        let log = log("latest-command");
        log.record(&MessageRecord::from_message(&message(1, 0, "/pick 42")).with_command("docs", "pick"))
            .expect("pick");
        log.record(&MessageRecord::from_message(&message(2, 10, "hello")))
            .expect("plain");
        log.record(&MessageRecord::from_message(&message(3, 20, "/show")).with_command("docs", "show"))
            .expect("show");

        let found = log.latest_command(7, Some(3)).expect("query").expect("some");
        assert_eq!(found.message_id, 1);
        assert_eq!(found.command.as_deref(), Some("pick"));

        let newest = log.latest_command(7, None).expect("query").expect("some");
        assert_eq!(newest.message_id, 3);
        assert!(log.latest_command(8, None).expect("query").is_none());
    }

    #[test]
    fn latest_filters_by_actor_and_explicit_commands() {
        let log = log("latest");
        log.record(&MessageRecord::from_message(&message(1, 0, "/new inbox")))
            .expect("cmd");
        log.record(&MessageRecord::from_message(&message(2, 5, "plain text")))
            .expect("plain");
        let other = MessageRef::new(7, 3)
            .from_actor(9)
            .with_text("from someone else")
            .with_date(Utc.with_ymd_and_hms(2024, 5, 1, 13, 0, 0).unwrap());
        log.record(&MessageRecord::from_message(&other)).expect("other");

        assert_eq!(log.latest(7, None, false).expect("q").map(|m| m.message_id), Some(3));
        assert_eq!(log.latest(7, Some(3), false).expect("q").map(|m| m.message_id), Some(2));
        assert_eq!(log.latest(7, Some(3), true).expect("q").map(|m| m.message_id), Some(1));
    }

    #[test]
    fn record_upserts_and_keeps_attributed_command() {
        let log = log("upsert");
        log.record(&MessageRecord::from_message(&message(1, 0, "/pick 4")).with_command("docs", "pick"))
            .expect("first");
        log.record(&MessageRecord::from_message(&message(1, 0, "/pick 42")))
            .expect("edit");
        let stored = log.get(7, 1).expect("get").expect("row");
        assert_eq!(stored.text.as_deref(), Some("/pick 42"));
        assert_eq!(stored.command.as_deref(), Some("pick"));
        assert_eq!(stored.to_message_ref().chat_id, 7);
    }

    #[test]
    fn range_is_half_open_and_ordered() {
        let log = log("range");
        for (id, secs) in [(1, 0), (2, 30), (3, 60)] {
            log.record(&MessageRecord::from_message(&message(id, secs, "x")))
                .expect("record");
        }
        let base = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let rows = log
            .range(7, base, base + Duration::seconds(60))
            .expect("range");
        let ids: Vec<i64> = rows.iter().map(|m| m.message_id).collect();
        assert_eq!(ids, vec![1, 2]);
    }
}
