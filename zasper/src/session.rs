//! Durable mapping of (path, name, type) to kernel id, backed by a single
//! sqlite table (§4.6 Session Registry).

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::mkm::MultiKernelManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionType {
    Notebook,
    File,
    Console,
}

impl SessionType {
    fn as_str(&self) -> &'static str {
        match self {
            SessionType::Notebook => "notebook",
            SessionType::File => "file",
            SessionType::Console => "console",
        }
    }

    fn from_str(s: &str) -> Option<SessionType> {
        match s {
            "notebook" => Some(SessionType::Notebook),
            "file" => Some(SessionType::File),
            "console" => Some(SessionType::Console),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionModel {
    pub session_id: String,
    pub path: String,
    pub name: String,
    #[serde(rename = "type")]
    pub session_type: SessionType,
    pub kernel_id: String,
}

/// Fields a caller may change via `PATCH /api/sessions/{id}` (§4.6 `update`).
#[derive(Debug, Default, Deserialize)]
pub struct SessionPatch {
    pub path: Option<String>,
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub session_type: Option<SessionType>,
    pub kernel_id: Option<String>,
}

pub struct SessionRegistry {
    pool: SqlitePool,
    mkm: Arc<MultiKernelManager>,
}

struct SessionRow {
    session_id: String,
    path: String,
    name: String,
    session_type: String,
    kernel_id: String,
}

fn row_to_model(row: SessionRow) -> Result<SessionModel> {
    Ok(SessionModel {
        session_id: row.session_id,
        path: row.path,
        name: row.name,
        session_type: SessionType::from_str(&row.session_type)
            .ok_or_else(|| AppError::Internal(format!("bad session type `{}`", row.session_type)))?,
        kernel_id: row.kernel_id,
    })
}

impl SessionRegistry {
    pub async fn new(pool: SqlitePool, mkm: Arc<MultiKernelManager>) -> Result<Self> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS session (
                session_id TEXT PRIMARY KEY,
                path TEXT NOT NULL,
                name TEXT NOT NULL,
                type TEXT NOT NULL,
                kernel_id TEXT NOT NULL
            )",
        )
        .execute(&pool)
        .await?;
        Ok(SessionRegistry { pool, mkm })
    }

    /// §4.6 two-phase create: the pending row isn't persisted (sqlite
    /// autocommit makes the final insert itself the commit point), but the
    /// kernel is bound or started before it, matching the spec's ordering.
    pub async fn create(
        &self,
        path: String,
        name: String,
        session_type: SessionType,
        kernel_name: Option<String>,
        kernel_id: Option<String>,
    ) -> Result<SessionModel> {
        let session_id = Uuid::new_v4().to_string();

        let kernel_id = match kernel_id {
            Some(id) if self.mkm.get_model(&id).await.is_ok() => id,
            _ => {
                let cwd = Path::new(&path).parent().map(|p| p.to_path_buf());
                self.mkm
                    .start(kernel_name, None, HashMap::new(), cwd)
                    .await?
            }
        };

        sqlx::query(
            "INSERT INTO session (session_id, path, name, type, kernel_id) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&session_id)
        .bind(&path)
        .bind(&name)
        .bind(session_type.as_str())
        .bind(&kernel_id)
        .execute(&self.pool)
        .await?;

        Ok(SessionModel {
            session_id,
            path,
            name,
            session_type,
            kernel_id,
        })
    }

    /// §4.6 `get`: invalidates (deletes) the row in place if its kernel has
    /// disappeared from the pool, returning not-found rather than a dangling
    /// record.
    pub async fn get(&self, session_id: &str) -> Result<SessionModel> {
        let row = sqlx::query(
            "SELECT session_id, path, name, type, kernel_id FROM session WHERE session_id = ?",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("no such session: {session_id}")))?;

        let model = row_to_model(SessionRow {
            session_id: row.try_get("session_id")?,
            path: row.try_get("path")?,
            name: row.try_get("name")?,
            session_type: row.try_get("type")?,
            kernel_id: row.try_get("kernel_id")?,
        })?;

        if self.mkm.get_model(&model.kernel_id).await.is_err() {
            self.delete(session_id).await?;
            return Err(AppError::NotFound(format!("no such session: {session_id}")));
        }
        Ok(model)
    }

    /// Finds the session bound to `path`/`name`/`type`/`kernel_id`, a linear
    /// scan over the handful of rows sessions are expected to have (§4.6).
    pub async fn find(
        &self,
        path: Option<&str>,
        name: Option<&str>,
        session_type: Option<SessionType>,
        kernel_id: Option<&str>,
    ) -> Result<Option<SessionModel>> {
        for model in self.list().await? {
            if path.is_some_and(|p| p != model.path) {
                continue;
            }
            if name.is_some_and(|n| n != model.name) {
                continue;
            }
            if session_type.is_some_and(|t| t != model.session_type) {
                continue;
            }
            if kernel_id.is_some_and(|k| k != model.kernel_id) {
                continue;
            }
            return Ok(Some(model));
        }
        Ok(None)
    }

    pub async fn list(&self) -> Result<Vec<SessionModel>> {
        let rows = sqlx::query("SELECT session_id, path, name, type, kernel_id FROM session")
            .fetch_all(&self.pool)
            .await?;

        let mut models = Vec::with_capacity(rows.len());
        for row in rows {
            let session_id: String = row.try_get("session_id")?;
            let model = row_to_model(SessionRow {
                session_id: session_id.clone(),
                path: row.try_get("path")?,
                name: row.try_get("name")?,
                session_type: row.try_get("type")?,
                kernel_id: row.try_get("kernel_id")?,
            })?;
            if self.mkm.get_model(&model.kernel_id).await.is_ok() {
                models.push(model);
            } else {
                let _ = self.delete(&session_id).await;
            }
        }
        Ok(models)
    }

    pub async fn update(&self, session_id: &str, patch: SessionPatch) -> Result<SessionModel> {
        let current = self.get(session_id).await?;
        let path = patch.path.unwrap_or(current.path);
        let name = patch.name.unwrap_or(current.name);
        let session_type = patch.session_type.unwrap_or(current.session_type);
        let kernel_id = patch.kernel_id.unwrap_or(current.kernel_id);

        sqlx::query("UPDATE session SET path = ?, name = ?, type = ?, kernel_id = ? WHERE session_id = ?")
            .bind(&path)
            .bind(&name)
            .bind(session_type.as_str())
            .bind(&kernel_id)
            .bind(session_id)
            .execute(&self.pool)
            .await?;

        Ok(SessionModel {
            session_id: session_id.to_string(),
            path,
            name,
            session_type,
            kernel_id,
        })
    }

    pub async fn delete(&self, session_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM session WHERE session_id = ?")
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_type_round_trips_through_wire_tag() {
        for t in [SessionType::Notebook, SessionType::File, SessionType::Console] {
            assert_eq!(SessionType::from_str(t.as_str()), Some(t));
        }
    }

    #[test]
    fn unknown_session_type_tag_is_none() {
        assert_eq!(SessionType::from_str("bogus"), None);
    }
}
