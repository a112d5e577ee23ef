use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

use crate::collaborators::ConversationStore;
use crate::conversation::{
    Conversation, ConversationPatch, ConversationSummary, DirectiveFields, Message, MessagePatch,
    Page, Speaker,
};

pub struct ChatDatabase {
    conn: Mutex<Connection>,
}

fn parse_time(raw: &str, column: usize) -> rusqlite::Result<DateTime<Utc>> {
    raw.parse().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn parse_directives(raw: &str, column: usize) -> rusqlite::Result<DirectiveFields> {
    serde_json::from_str(raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(e))
    })
}

impl ChatDatabase {
    /// Helper to lock the connection
    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Database lock poisoned: {}", e))
    }

    /// Create or open the database
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create database dir {:?}", parent))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {:?}", path))?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.ensure_schema()?;
        Ok(db)
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                icon TEXT,
                model TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
                position INTEGER NOT NULL,
                sender TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at TEXT NOT NULL,
                response_time_ms INTEGER,
                directives TEXT NOT NULL DEFAULT '{}'
            );

            CREATE INDEX IF NOT EXISTS idx_messages_conversation
                ON messages(conversation_id, position);

            CREATE TABLE IF NOT EXISTS pages (
                id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL,
                message_id TEXT NOT NULL,
                title TEXT NOT NULL,
                body TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            "#,
        )
        .context("Failed to create database schema")?;
        Ok(())
    }

    fn load_messages(conn: &Connection, conversation_id: &str) -> Result<Vec<Message>> {
        let mut stmt = conn.prepare(
            "SELECT id, conversation_id, sender, content, created_at, response_time_ms, directives
             FROM messages
             WHERE conversation_id = ?1
             ORDER BY position ASC",
        )?;

        let messages = stmt
            .query_map([conversation_id], |row| {
                let sender_raw: String = row.get(2)?;
                let created_at_str: String = row.get(4)?;
                let response_time_ms: Option<i64> = row.get(5)?;
                let directives_raw: String = row.get(6)?;
                Ok(Message {
                    id: row.get(0)?,
                    conversation_id: row.get(1)?,
                    sender: Speaker::from_db(&sender_raw),
                    content: row.get(3)?,
                    created_at: parse_time(&created_at_str, 4)?,
                    response_time_ms: response_time_ms.map(|ms| ms.max(0) as u64),
                    directives: parse_directives(&directives_raw, 6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(messages)
    }

    pub fn get_page(&self, page_id: &str) -> Result<Option<Page>> {
        let conn = self.lock_conn()?;
        let page = conn
            .query_row(
                "SELECT id, conversation_id, message_id, title, body, created_at
                 FROM pages WHERE id = ?1",
                [page_id],
                |row| {
                    let created_at_str: String = row.get(5)?;
                    Ok(Page {
                        id: row.get(0)?,
                        conversation_id: row.get(1)?,
                        message_id: row.get(2)?,
                        title: row.get(3)?,
                        body: row.get(4)?,
                        created_at: parse_time(&created_at_str, 5)?,
                    })
                },
            )
            .optional()?;
        Ok(page)
    }

    pub fn delete_conversation(&self, conversation_id: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute("DELETE FROM messages WHERE conversation_id = ?1", [conversation_id])?;
        conn.execute("DELETE FROM conversations WHERE id = ?1", [conversation_id])?;
        Ok(())
    }
}

impl ConversationStore for ChatDatabase {
    /// Create a new conversation and return it.
    fn create_conversation(&self, title: Option<&str>, model: &str) -> Result<Conversation> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        let now_str = now.to_rfc3339();
        let title = title
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("Chat {}", now.format("%Y-%m-%d %H:%M")));

        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO conversations (id, title, icon, model, created_at, updated_at)
             VALUES (?1, ?2, NULL, ?3, ?4, ?5)",
            params![id, title, model, now_str.clone(), now_str],
        )?;

        Ok(Conversation {
            id,
            title,
            icon: None,
            messages: Vec::new(),
            model: model.to_string(),
            created_at: now,
            updated_at: now,
        })
    }

    /// Fetch one conversation by ID, messages in insertion order.
    fn load_conversation(&self, conversation_id: &str) -> Result<Option<Conversation>> {
        let conn = self.lock_conn()?;
        let row = conn
            .query_row(
                "SELECT id, title, icon, model, created_at, updated_at
                 FROM conversations WHERE id = ?1",
                [conversation_id],
                |row| {
                    let created_at_str: String = row.get(4)?;
                    let updated_at_str: String = row.get(5)?;
                    Ok(Conversation {
                        id: row.get(0)?,
                        title: row.get(1)?,
                        icon: row.get(2)?,
                        messages: Vec::new(),
                        model: row.get(3)?,
                        created_at: parse_time(&created_at_str, 4)?,
                        updated_at: parse_time(&updated_at_str, 5)?,
                    })
                },
            )
            .optional()?;

        let Some(mut conversation) = row else {
            return Ok(None);
        };
        conversation.messages = Self::load_messages(&conn, conversation_id)?;
        Ok(Some(conversation))
    }

    /// List recent conversations, newest activity first.
    fn list_conversations(&self, limit: usize) -> Result<Vec<ConversationSummary>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            r#"SELECT
                   c.id,
                   c.title,
                   c.icon,
                   c.model,
                   c.updated_at,
                   COUNT(m.id) as message_count
               FROM conversations c
               LEFT JOIN messages m ON m.conversation_id = c.id
               GROUP BY c.id
               ORDER BY c.updated_at DESC
               LIMIT ?1"#,
        )?;

        let conversations = stmt
            .query_map([limit as i64], |row| {
                let updated_at_str: String = row.get(4)?;
                Ok(ConversationSummary {
                    id: row.get(0)?,
                    title: row.get(1)?,
                    icon: row.get(2)?,
                    model: row.get(3)?,
                    updated_at: parse_time(&updated_at_str, 4)?,
                    message_count: row.get::<_, i64>(5)? as usize,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(conversations)
    }

    fn add_message_to_conversation(&self, conversation_id: &str, message: &Message) -> Result<()> {
        let directives = serde_json::to_string(&message.directives)
            .context("Failed to serialize directive fields")?;
        let now = Utc::now().to_rfc3339();

        let conn = self.lock_conn()?;
        let position: i64 = conn.query_row(
            "SELECT COALESCE(MAX(position), -1) + 1 FROM messages WHERE conversation_id = ?1",
            [conversation_id],
            |row| row.get(0),
        )?;
        conn.execute(
            "INSERT INTO messages (id, conversation_id, position, sender, content, created_at, response_time_ms, directives)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                message.id,
                conversation_id,
                position,
                message.sender.as_db_str(),
                message.content,
                message.created_at.to_rfc3339(),
                message.response_time_ms.map(|ms| ms as i64),
                directives,
            ],
        )
        .with_context(|| format!("Failed to insert message into conversation {}", conversation_id))?;
        conn.execute(
            "UPDATE conversations SET updated_at = ?2 WHERE id = ?1",
            params![conversation_id, now],
        )?;
        Ok(())
    }

    fn update_message_in_conversation(&self, message_id: &str, patch: &MessagePatch) -> Result<()> {
        if patch.is_empty() {
            return Ok(());
        }
        let directives = patch
            .directives
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("Failed to serialize directive fields")?;

        let conn = self.lock_conn()?;
        let updated = conn.execute(
            "UPDATE messages
             SET content = COALESCE(?2, content),
                 response_time_ms = COALESCE(?3, response_time_ms),
                 directives = COALESCE(?4, directives)
             WHERE id = ?1",
            params![
                message_id,
                patch.content,
                patch.response_time_ms.map(|ms| ms as i64),
                directives,
            ],
        )?;
        if updated == 0 {
            anyhow::bail!("Message {} not found", message_id);
        }
        Ok(())
    }

    fn update_conversation(&self, conversation_id: &str, patch: &ConversationPatch) -> Result<()> {
        let updated_at = patch.updated_at.unwrap_or_else(Utc::now).to_rfc3339();
        let conn = self.lock_conn()?;
        let updated = conn.execute(
            "UPDATE conversations
             SET title = COALESCE(?2, title),
                 icon = COALESCE(?3, icon),
                 model = COALESCE(?4, model),
                 updated_at = ?5
             WHERE id = ?1",
            params![conversation_id, patch.title, patch.icon, patch.model, updated_at],
        )?;
        if updated == 0 {
            anyhow::bail!("Conversation {} not found", conversation_id);
        }
        Ok(())
    }

    fn create_page(&self, page: &Page) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO pages (id, conversation_id, message_id, title, body, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                page.id,
                page.conversation_id,
                page.message_id,
                page.title,
                page.body,
                page.created_at.to_rfc3339(),
            ],
        )
        .context("Failed to insert page")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::{SearchResults, SearchStep};
    use std::path::PathBuf;

    fn temp_db_path(name: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("parley_{}_{}.db", name, uuid::Uuid::new_v4()));
        path
    }

    #[test]
    fn messages_keep_order_and_directive_fields() {
        let db = ChatDatabase::open_in_memory().expect("db init");
        let conversation = db
            .create_conversation(Some("Order test"), "llama3.2")
            .expect("create conversation");

        let user = Message::user(&conversation.id, "search rust news");
        let mut assistant = Message::assistant(&conversation.id);
        assistant.content = "<SEARCH>rust news</SEARCH>".to_string();
        assistant.directives.search_request = Some("rust news".to_string());
        assistant.directives.multi_search = vec![SearchStep::queued("rust news")];

        db.add_message_to_conversation(&conversation.id, &user)
            .expect("insert user");
        db.add_message_to_conversation(&conversation.id, &assistant)
            .expect("insert assistant");

        let loaded = db
            .load_conversation(&conversation.id)
            .expect("load")
            .expect("conversation exists");
        assert_eq!(loaded.messages.len(), 2);
        assert_eq!(loaded.messages[0].sender, Speaker::User);
        assert_eq!(loaded.messages[1].content, "<SEARCH>rust news</SEARCH>");
        assert_eq!(loaded.messages[1].directives, assistant.directives);
    }

    #[test]
    fn patch_updates_only_given_columns() {
        let db = ChatDatabase::open_in_memory().expect("db init");
        let conversation = db.create_conversation(None, "m").expect("create");
        let mut message = Message::assistant(&conversation.id);
        message.content = "partial".to_string();
        db.add_message_to_conversation(&conversation.id, &message)
            .expect("insert");

        let mut directives = DirectiveFields::default();
        directives.search_completed = true;
        directives.search_results = Some(SearchResults {
            answer: "42".to_string(),
            query: "q".to_string(),
            ..Default::default()
        });
        db.update_message_in_conversation(
            &message.id,
            &MessagePatch {
                response_time_ms: Some(1200),
                directives: Some(directives.clone()),
                ..Default::default()
            },
        )
        .expect("patch");

        let loaded = db.load_conversation(&conversation.id).unwrap().unwrap();
        let stored = &loaded.messages[0];
        assert_eq!(stored.content, "partial");
        assert_eq!(stored.response_time_ms, Some(1200));
        assert_eq!(stored.directives, directives);

        assert!(db
            .update_message_in_conversation(
                "missing",
                &MessagePatch {
                    content: Some("x".to_string()),
                    ..Default::default()
                }
            )
            .is_err());
    }

    #[test]
    fn conversations_persist_across_reopen() {
        let path = temp_db_path("reopen");
        let id = {
            let db = ChatDatabase::new(&path).expect("db init");
            let conversation = db.create_conversation(Some("First"), "m").unwrap();
            db.update_conversation(
                &conversation.id,
                &ConversationPatch {
                    title: Some("Renamed".to_string()),
                    icon: Some("🔎".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
            let page = Page::from_markdown(&conversation.id, "msg", "# Notes\nbody");
            db.create_page(&page).unwrap();
            assert_eq!(db.get_page(&page.id).unwrap().unwrap().title, "Notes");
            conversation.id
        };

        let db = ChatDatabase::new(&path).expect("db reopen");
        let summaries = db.list_conversations(10).unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].id, id);
        assert_eq!(summaries[0].title, "Renamed");
        assert_eq!(summaries[0].icon.as_deref(), Some("🔎"));

        db.delete_conversation(&id).unwrap();
        assert!(db.load_conversation(&id).unwrap().is_none());
        let _ = std::fs::remove_file(&path);
    }
}
