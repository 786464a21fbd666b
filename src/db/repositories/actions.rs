use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::params;

use crate::db::{
    connection::Database,
    helpers::{id_list_json, parse_datetime, parse_id_list, parse_optional_datetime},
};
use crate::models::Action;

impl Database {
    /// Idempotent save: re-saving the same id overwrites the mutable fields.
    pub async fn upsert_action(&self, action: &Action) -> Result<()> {
        let record = action.clone();
        self.execute(move |conn| {
            conn.execute(
                "INSERT INTO actions (id, title, description, start_time, end_time, source_ids_json, created_at, deleted_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(id) DO UPDATE SET
                    title = excluded.title,
                    description = excluded.description,
                    start_time = excluded.start_time,
                    end_time = excluded.end_time,
                    source_ids_json = excluded.source_ids_json",
                params![
                    record.id,
                    record.title,
                    record.description,
                    record.start_time.to_rfc3339(),
                    record.end_time.to_rfc3339(),
                    id_list_json(&record.source_ids)?,
                    record.created_at.to_rfc3339(),
                    record.deleted_at.map(|dt| dt.to_rfc3339()),
                ],
            )
            .with_context(|| "failed to upsert action")?;
            Ok(())
        })
        .await
    }

    pub async fn get_actions_in_timeframe(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Action>> {
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, title, description, start_time, end_time, source_ids_json, created_at, deleted_at
                 FROM actions
                 WHERE deleted_at IS NULL AND start_time >= ?1 AND start_time <= ?2
                 ORDER BY start_time ASC",
            )?;

            let mut rows = stmt.query(params![start.to_rfc3339(), end.to_rfc3339()])?;
            let mut actions = Vec::new();
            while let Some(row) = rows.next()? {
                actions.push(Action {
                    id: row.get(0)?,
                    title: row.get(1)?,
                    description: row.get(2)?,
                    start_time: parse_datetime(&row.get::<_, String>(3)?, "start_time")?,
                    end_time: parse_datetime(&row.get::<_, String>(4)?, "end_time")?,
                    source_ids: parse_id_list(&row.get::<_, String>(5)?, "source_ids_json")?,
                    created_at: parse_datetime(&row.get::<_, String>(6)?, "created_at")?,
                    deleted_at: parse_optional_datetime(
                        row.get::<_, Option<String>>(7)?,
                        "deleted_at",
                    )?,
                });
            }

            Ok(actions)
        })
        .await
    }

    pub async fn soft_delete_action(&self, action_id: &str) -> Result<()> {
        let action_id = action_id.to_string();
        self.execute(move |conn| {
            conn.execute(
                "UPDATE actions SET deleted_at = ?1 WHERE id = ?2",
                params![Utc::now().to_rfc3339(), action_id],
            )
            .with_context(|| "failed to soft-delete action")?;
            Ok(())
        })
        .await
    }
}
