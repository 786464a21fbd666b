use std::collections::HashSet;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::params;

use crate::db::{
    connection::Database,
    helpers::{id_list_json, parse_datetime, parse_id_list, parse_optional_datetime},
};
use crate::models::{Knowledge, Todo};

impl Database {
    pub async fn upsert_knowledge(&self, knowledge: &Knowledge) -> Result<()> {
        let record = knowledge.clone();
        self.execute(move |conn| {
            conn.execute(
                "INSERT INTO knowledge (id, title, description, keywords_json, action_id, source_ids_json, created_at, deleted_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(id) DO UPDATE SET
                    title = excluded.title,
                    description = excluded.description,
                    keywords_json = excluded.keywords_json,
                    action_id = excluded.action_id,
                    source_ids_json = excluded.source_ids_json",
                params![
                    record.id,
                    record.title,
                    record.description,
                    id_list_json(&record.keywords)?,
                    record.action_id,
                    id_list_json(&record.source_ids)?,
                    record.created_at.to_rfc3339(),
                    record.deleted_at.map(|dt| dt.to_rfc3339()),
                ],
            )
            .with_context(|| "failed to upsert knowledge")?;
            Ok(())
        })
        .await
    }

    pub async fn get_knowledge_created_in_timeframe(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Knowledge>> {
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, title, description, keywords_json, action_id, source_ids_json, created_at, deleted_at
                 FROM knowledge
                 WHERE deleted_at IS NULL AND created_at >= ?1 AND created_at <= ?2
                 ORDER BY created_at ASC",
            )?;

            let mut rows = stmt.query(params![start.to_rfc3339(), end.to_rfc3339()])?;
            let mut items = Vec::new();
            while let Some(row) = rows.next()? {
                items.push(Knowledge {
                    id: row.get(0)?,
                    title: row.get(1)?,
                    description: row.get(2)?,
                    keywords: parse_id_list(&row.get::<_, String>(3)?, "keywords_json")?,
                    action_id: row.get(4)?,
                    source_ids: parse_id_list(&row.get::<_, String>(5)?, "source_ids_json")?,
                    created_at: parse_datetime(&row.get::<_, String>(6)?, "created_at")?,
                    deleted_at: parse_optional_datetime(
                        row.get::<_, Option<String>>(7)?,
                        "deleted_at",
                    )?,
                });
            }

            Ok(items)
        })
        .await
    }

    /// Action ids already mined for knowledge, soft-deleted rows included.
    pub async fn get_knowledge_source_ids(&self) -> Result<HashSet<String>> {
        self.execute(|conn| {
            let mut stmt = conn.prepare("SELECT source_ids_json FROM knowledge")?;
            let mut rows = stmt.query([])?;
            let mut ids = HashSet::new();
            while let Some(row) = rows.next()? {
                let raw: String = row.get(0)?;
                for id in parse_id_list(&raw, "source_ids_json")? {
                    ids.insert(id);
                }
            }
            Ok(ids)
        })
        .await
    }

    pub async fn soft_delete_knowledge(&self, knowledge_id: &str) -> Result<()> {
        let knowledge_id = knowledge_id.to_string();
        self.execute(move |conn| {
            conn.execute(
                "UPDATE knowledge SET deleted_at = ?1 WHERE id = ?2",
                params![Utc::now().to_rfc3339(), knowledge_id],
            )
            .with_context(|| "failed to soft-delete knowledge")?;
            Ok(())
        })
        .await
    }

    pub async fn upsert_todo(&self, todo: &Todo) -> Result<()> {
        let record = todo.clone();
        self.execute(move |conn| {
            conn.execute(
                "INSERT INTO todos (id, title, description, keywords_json, action_id, source_ids_json, created_at, deleted_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(id) DO UPDATE SET
                    title = excluded.title,
                    description = excluded.description,
                    keywords_json = excluded.keywords_json,
                    action_id = excluded.action_id,
                    source_ids_json = excluded.source_ids_json",
                params![
                    record.id,
                    record.title,
                    record.description,
                    id_list_json(&record.keywords)?,
                    record.action_id,
                    id_list_json(&record.source_ids)?,
                    record.created_at.to_rfc3339(),
                    record.deleted_at.map(|dt| dt.to_rfc3339()),
                ],
            )
            .with_context(|| "failed to upsert todo")?;
            Ok(())
        })
        .await
    }

    pub async fn get_todos_created_in_timeframe(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Todo>> {
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, title, description, keywords_json, action_id, source_ids_json, created_at, deleted_at
                 FROM todos
                 WHERE deleted_at IS NULL AND created_at >= ?1 AND created_at <= ?2
                 ORDER BY created_at ASC",
            )?;

            let mut rows = stmt.query(params![start.to_rfc3339(), end.to_rfc3339()])?;
            let mut items = Vec::new();
            while let Some(row) = rows.next()? {
                items.push(Todo {
                    id: row.get(0)?,
                    title: row.get(1)?,
                    description: row.get(2)?,
                    keywords: parse_id_list(&row.get::<_, String>(3)?, "keywords_json")?,
                    action_id: row.get(4)?,
                    source_ids: parse_id_list(&row.get::<_, String>(5)?, "source_ids_json")?,
                    created_at: parse_datetime(&row.get::<_, String>(6)?, "created_at")?,
                    deleted_at: parse_optional_datetime(
                        row.get::<_, Option<String>>(7)?,
                        "deleted_at",
                    )?,
                });
            }

            Ok(items)
        })
        .await
    }

    /// Action ids already mined for todos, soft-deleted rows included.
    pub async fn get_todo_source_ids(&self) -> Result<HashSet<String>> {
        self.execute(|conn| {
            let mut stmt = conn.prepare("SELECT source_ids_json FROM todos")?;
            let mut rows = stmt.query([])?;
            let mut ids = HashSet::new();
            while let Some(row) = rows.next()? {
                let raw: String = row.get(0)?;
                for id in parse_id_list(&raw, "source_ids_json")? {
                    ids.insert(id);
                }
            }
            Ok(ids)
        })
        .await
    }

    pub async fn soft_delete_todo(&self, todo_id: &str) -> Result<()> {
        let todo_id = todo_id.to_string();
        self.execute(move |conn| {
            conn.execute(
                "UPDATE todos SET deleted_at = ?1 WHERE id = ?2",
                params![Utc::now().to_rfc3339(), todo_id],
            )
            .with_context(|| "failed to soft-delete todo")?;
            Ok(())
        })
        .await
    }
}
