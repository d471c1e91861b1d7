//! SQLite-backed [`DataStore`].
//!
//! Each entity table keeps its identity and filter columns alongside a
//! JSON `data` blob holding the full entity; the blob is authoritative,
//! the columns exist for lookups and ordering. All writes go through one
//! connection guarded by a mutex, which is the transaction serialization
//! point the optimistic version counters rely on.

use super::{
    paginate, DataStore, Page, Pagination, StoreError, TaskFilter,
};
use crate::ecs::arn::{family_and_revision, Identifiers};
use crate::ecs::cluster::Cluster;
use crate::ecs::service::Service;
use crate::ecs::task::{LaunchType, Task};
use crate::ecs::task_definition::{TaskDefinition, TaskDefinitionStatus};
use crate::ecs::task_set::TaskSet;
use crate::ecs::{AccountSetting, Attribute, Tag};
use async_trait::async_trait;
use log::trace;
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS clusters (
    name        TEXT PRIMARY KEY,
    arn         TEXT NOT NULL UNIQUE,
    created_at  INTEGER NOT NULL,
    version     INTEGER NOT NULL,
    data        TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS task_definitions (
    family      TEXT NOT NULL,
    revision    INTEGER NOT NULL,
    arn         TEXT NOT NULL UNIQUE,
    status      TEXT NOT NULL,
    created_at  INTEGER NOT NULL,
    version     INTEGER NOT NULL,
    data        TEXT NOT NULL,
    PRIMARY KEY (family, revision)
);
CREATE TABLE IF NOT EXISTS tasks (
    arn             TEXT PRIMARY KEY,
    task_id         TEXT NOT NULL,
    cluster_arn     TEXT NOT NULL,
    family          TEXT NOT NULL,
    desired_status  TEXT NOT NULL,
    launch_type     TEXT NOT NULL,
    task_group      TEXT,
    started_by      TEXT,
    container_instance_arn TEXT,
    created_at      INTEGER NOT NULL,
    version         INTEGER NOT NULL,
    data            TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_tasks_cluster ON tasks (cluster_arn, created_at, arn);
CREATE TABLE IF NOT EXISTS services (
    cluster_arn TEXT NOT NULL,
    name        TEXT NOT NULL,
    arn         TEXT NOT NULL UNIQUE,
    launch_type TEXT NOT NULL,
    created_at  INTEGER NOT NULL,
    version     INTEGER NOT NULL,
    data        TEXT NOT NULL,
    PRIMARY KEY (cluster_arn, name)
);
CREATE TABLE IF NOT EXISTS task_sets (
    service_arn TEXT NOT NULL,
    id          TEXT NOT NULL,
    arn         TEXT NOT NULL UNIQUE,
    created_at  INTEGER NOT NULL,
    version     INTEGER NOT NULL,
    data        TEXT NOT NULL,
    PRIMARY KEY (service_arn, id)
);
CREATE TABLE IF NOT EXISTS tags (
    arn   TEXT NOT NULL,
    key   TEXT NOT NULL,
    value TEXT NOT NULL,
    PRIMARY KEY (arn, key)
);
CREATE TABLE IF NOT EXISTS account_settings (
    principal TEXT NOT NULL,
    name      TEXT NOT NULL,
    value     TEXT NOT NULL,
    PRIMARY KEY (principal, name)
);
CREATE TABLE IF NOT EXISTS attributes (
    cluster_arn TEXT NOT NULL,
    target_id   TEXT NOT NULL,
    name        TEXT NOT NULL,
    value       TEXT,
    target_type TEXT,
    PRIMARY KEY (cluster_arn, target_id, name)
);
";

/// Principal key used for account-default settings.
const DEFAULT_PRINCIPAL: &str = "__default__";

pub struct SqliteDataStore {
    conn: Arc<Mutex<Connection>>,
    identifiers: Identifiers,
}

impl SqliteDataStore {
    pub fn open(path: &Path, identifiers: Identifiers) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Internal(format!("creating store directory: {}", e)))?;
        }
        let conn = Connection::open(path)?;
        Self::from_connection(conn, identifiers)
    }

    /// Store living only as long as the process; used by tests and by
    /// test mode.
    pub fn open_in_memory(identifiers: Identifiers) -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?, identifiers)
    }

    fn from_connection(conn: Connection, identifiers: Identifiers) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(SqliteDataStore {
            conn: Arc::new(Mutex::new(conn)),
            identifiers,
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Internal("store mutex poisoned".to_string()))
    }

    fn decode<T: DeserializeOwned>(data: String) -> Result<T, StoreError> {
        Ok(serde_json::from_str(&data)?)
    }

    fn encode<T: Serialize>(entity: &T) -> Result<String, StoreError> {
        Ok(serde_json::to_string(entity)?)
    }

    fn map_insert_error(e: rusqlite::Error, identity: &str) -> StoreError {
        match &e {
            rusqlite::Error::SqliteFailure(inner, _)
                if inner.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                StoreError::Duplicate(identity.to_string())
            }
            _ => StoreError::Sqlite(e),
        }
    }

    /// All rows of a table in list order, decoded.
    fn load_ordered<T: DeserializeOwned>(
        conn: &Connection,
        sql: &str,
        sql_params: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<(i64, String, T)>, StoreError> {
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(sql_params, |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;
        let mut decoded = Vec::new();
        for row in rows {
            let (created_at, arn, data) = row?;
            decoded.push((created_at, arn, Self::decode::<T>(data)?));
        }
        Ok(decoded)
    }
}

#[async_trait]
impl DataStore for SqliteDataStore {
    async fn create_cluster(&self, cluster: &Cluster) -> Result<(), StoreError> {
        trace!("create_cluster - {}", cluster.cluster_name);
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO clusters (name, arn, created_at, version, data) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                cluster.cluster_name,
                cluster.cluster_arn,
                cluster.created_at.timestamp_millis(),
                cluster.version,
                Self::encode(cluster)?,
            ],
        )
        .map_err(|e| Self::map_insert_error(e, &cluster.cluster_name))?;
        Ok(())
    }

    async fn get_cluster(&self, name: &str) -> Result<Option<Cluster>, StoreError> {
        let conn = self.lock()?;
        let data: Option<String> = conn
            .query_row(
                "SELECT data FROM clusters WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        data.map(Self::decode).transpose()
    }

    async fn update_cluster(&self, cluster: &Cluster) -> Result<Cluster, StoreError> {
        let mut updated = cluster.clone();
        updated.version = cluster.version + 1;
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE clusters SET data = ?1, version = ?2 WHERE name = ?3 AND version = ?4",
            params![
                Self::encode(&updated)?,
                updated.version,
                cluster.cluster_name,
                cluster.version,
            ],
        )?;
        if changed == 1 {
            return Ok(updated);
        }
        let exists: Option<i64> = conn
            .query_row(
                "SELECT version FROM clusters WHERE name = ?1",
                params![cluster.cluster_name],
                |row| row.get(0),
            )
            .optional()?;
        match exists {
            Some(_) => Err(StoreError::Conflict(cluster.cluster_name.clone())),
            None => Err(StoreError::NotFound(cluster.cluster_name.clone())),
        }
    }

    async fn delete_cluster(&self, name: &str) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let changed = conn.execute("DELETE FROM clusters WHERE name = ?1", params![name])?;
        if changed == 0 {
            return Err(StoreError::NotFound(name.to_string()));
        }
        Ok(())
    }

    async fn list_clusters(&self, page: &Pagination) -> Result<Page<Cluster>, StoreError> {
        let rows = {
            let conn = self.lock()?;
            Self::load_ordered::<Cluster>(
                &conn,
                "SELECT created_at, arn, data FROM clusters ORDER BY created_at, arn",
                &[],
            )?
        };
        paginate(rows, page, |(created_at, arn, _)| (*created_at, arn.clone())).map(|p| Page {
            items: p.items.into_iter().map(|(_, _, c)| c).collect(),
            next_token: p.next_token,
        })
    }

    async fn register_task_definition(
        &self,
        definition: TaskDefinition,
    ) -> Result<TaskDefinition, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let next_revision: i64 = tx.query_row(
            "SELECT COALESCE(MAX(revision), 0) + 1 FROM task_definitions WHERE family = ?1",
            params![definition.family],
            |row| row.get(0),
        )?;
        let mut registered = definition;
        registered.revision = next_revision;
        registered.task_definition_arn = self
            .identifiers
            .task_definition_arn(&registered.family, next_revision);
        registered.version = 1;
        tx.execute(
            "INSERT INTO task_definitions (family, revision, arn, status, created_at, version, data)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                registered.family,
                registered.revision,
                registered.task_definition_arn,
                registered.status.as_str(),
                registered.registered_at.timestamp_millis(),
                registered.version,
                Self::encode(&registered)?,
            ],
        )
        .map_err(|e| Self::map_insert_error(e, &registered.task_definition_arn))?;
        tx.commit()?;
        trace!(
            "register_task_definition - {} revision {}",
            registered.family,
            registered.revision
        );
        Ok(registered)
    }

    async fn get_task_definition(
        &self,
        family: &str,
        revision: i64,
    ) -> Result<Option<TaskDefinition>, StoreError> {
        let conn = self.lock()?;
        let data: Option<String> = conn
            .query_row(
                "SELECT data FROM task_definitions WHERE family = ?1 AND revision = ?2",
                params![family, revision],
                |row| row.get(0),
            )
            .optional()?;
        data.map(Self::decode).transpose()
    }

    async fn latest_task_definition(
        &self,
        family: &str,
    ) -> Result<Option<TaskDefinition>, StoreError> {
        let conn = self.lock()?;
        let data: Option<String> = conn
            .query_row(
                "SELECT data FROM task_definitions WHERE family = ?1
                 ORDER BY revision DESC LIMIT 1",
                params![family],
                |row| row.get(0),
            )
            .optional()?;
        data.map(Self::decode).transpose()
    }

    async fn update_task_definition_status(
        &self,
        family: &str,
        revision: i64,
        status: TaskDefinitionStatus,
    ) -> Result<TaskDefinition, StoreError> {
        let identity = format!("{}:{}", family, revision);
        let conn = self.lock()?;
        let data: Option<String> = conn
            .query_row(
                "SELECT data FROM task_definitions WHERE family = ?1 AND revision = ?2",
                params![family, revision],
                |row| row.get(0),
            )
            .optional()?;
        let mut definition: TaskDefinition =
            Self::decode(data.ok_or_else(|| StoreError::NotFound(identity.clone()))?)?;
        definition.status = status;
        if status == TaskDefinitionStatus::Inactive && definition.deregistered_at.is_none() {
            definition.deregistered_at = Some(chrono::Utc::now());
        }
        definition.version += 1;
        conn.execute(
            "UPDATE task_definitions SET status = ?1, version = ?2, data = ?3
             WHERE family = ?4 AND revision = ?5",
            params![
                status.as_str(),
                definition.version,
                Self::encode(&definition)?,
                family,
                revision,
            ],
        )?;
        Ok(definition)
    }

    async fn list_task_definitions(
        &self,
        family: Option<String>,
        status: Option<TaskDefinitionStatus>,
        page: &Pagination,
    ) -> Result<Page<TaskDefinition>, StoreError> {
        let rows = {
            let conn = self.lock()?;
            match &family {
                Some(f) => Self::load_ordered::<TaskDefinition>(
                    &conn,
                    "SELECT created_at, arn, data FROM task_definitions WHERE family = ?1
                     ORDER BY created_at, arn",
                    &[f],
                )?,
                None => Self::load_ordered::<TaskDefinition>(
                    &conn,
                    "SELECT created_at, arn, data FROM task_definitions ORDER BY created_at, arn",
                    &[],
                )?,
            }
        };
        let filtered: Vec<_> = rows
            .into_iter()
            .filter(|(_, _, d)| status.map(|s| d.status == s).unwrap_or(true))
            .collect();
        paginate(filtered, page, |(created_at, arn, _)| {
            (*created_at, arn.clone())
        })
        .map(|p| Page {
            items: p.items.into_iter().map(|(_, _, d)| d).collect(),
            next_token: p.next_token,
        })
    }

    async fn list_task_definition_families(
        &self,
        prefix: Option<String>,
        status: Option<TaskDefinitionStatus>,
        page: &Pagination,
    ) -> Result<Page<String>, StoreError> {
        let families: Vec<String> = {
            let conn = self.lock()?;
            match status {
                Some(s) => {
                    let mut stmt = conn.prepare(
                        "SELECT DISTINCT family FROM task_definitions WHERE status = ?1
                         ORDER BY family",
                    )?;
                    let rows =
                        stmt.query_map(params![s.as_str()], |row| row.get::<_, String>(0))?;
                    rows.collect::<Result<Vec<_>, _>>()?
                }
                None => {
                    let mut stmt = conn
                        .prepare("SELECT DISTINCT family FROM task_definitions ORDER BY family")?;
                    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
                    rows.collect::<Result<Vec<_>, _>>()?
                }
            }
        };
        let filtered: Vec<String> = families
            .into_iter()
            .filter(|f| prefix.as_ref().map(|p| f.starts_with(p)).unwrap_or(true))
            .collect();
        // families sort lexicographically; the time half of the key is unused
        paginate(filtered, page, |family| (0, family.clone()))
    }

    async fn create_task(&self, task: &Task) -> Result<(), StoreError> {
        let (family, _) = family_and_revision(&task.task_definition_arn);
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO tasks (arn, task_id, cluster_arn, family, desired_status, launch_type,
                                task_group, started_by, container_instance_arn, created_at,
                                version, data)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                task.task_arn,
                task.task_id(),
                task.cluster_arn,
                family,
                task.desired_status.as_str(),
                task.launch_type.as_str(),
                task.group,
                task.started_by,
                task.container_instance_arn,
                task.created_at.timestamp_millis(),
                task.version,
                Self::encode(task)?,
            ],
        )
        .map_err(|e| Self::map_insert_error(e, &task.task_arn))?;
        Ok(())
    }

    async fn get_task(
        &self,
        cluster_arn: &str,
        task_id_or_arn: &str,
    ) -> Result<Option<Task>, StoreError> {
        let conn = self.lock()?;
        let data: Option<String> = if task_id_or_arn.starts_with("arn:") {
            conn.query_row(
                "SELECT data FROM tasks WHERE arn = ?1",
                params![task_id_or_arn],
                |row| row.get(0),
            )
            .optional()?
        } else {
            conn.query_row(
                "SELECT data FROM tasks WHERE cluster_arn = ?1 AND task_id = ?2",
                params![cluster_arn, task_id_or_arn],
                |row| row.get(0),
            )
            .optional()?
        };
        data.map(Self::decode).transpose()
    }

    async fn update_task(&self, task: &Task) -> Result<Task, StoreError> {
        let mut updated = task.clone();
        updated.version = task.version + 1;
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE tasks SET desired_status = ?1, version = ?2, data = ?3,
                              container_instance_arn = ?4
             WHERE arn = ?5 AND version = ?6",
            params![
                updated.desired_status.as_str(),
                updated.version,
                Self::encode(&updated)?,
                updated.container_instance_arn,
                task.task_arn,
                task.version,
            ],
        )?;
        if changed == 1 {
            return Ok(updated);
        }
        let exists: Option<i64> = conn
            .query_row(
                "SELECT version FROM tasks WHERE arn = ?1",
                params![task.task_arn],
                |row| row.get(0),
            )
            .optional()?;
        match exists {
            Some(_) => Err(StoreError::Conflict(task.task_arn.clone())),
            None => Err(StoreError::NotFound(task.task_arn.clone())),
        }
    }

    async fn list_tasks(
        &self,
        filter: &TaskFilter,
        page: &Pagination,
    ) -> Result<Page<Task>, StoreError> {
        let rows = {
            let conn = self.lock()?;
            Self::load_ordered::<Task>(
                &conn,
                "SELECT created_at, arn, data FROM tasks WHERE cluster_arn = ?1
                 ORDER BY created_at, arn",
                &[&filter.cluster_arn],
            )?
        };
        let filtered: Vec<_> = rows
            .into_iter()
            .filter(|(_, _, t)| filter.matches(t))
            .collect();
        paginate(filtered, page, |(created_at, arn, _)| {
            (*created_at, arn.clone())
        })
        .map(|p| Page {
            items: p.items.into_iter().map(|(_, _, t)| t).collect(),
            next_token: p.next_token,
        })
    }

    async fn create_service(&self, service: &Service) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO services (cluster_arn, name, arn, launch_type, created_at, version, data)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                service.cluster_arn,
                service.service_name,
                service.service_arn,
                service.launch_type.as_str(),
                service.created_at.timestamp_millis(),
                service.version,
                Self::encode(service)?,
            ],
        )
        .map_err(|e| Self::map_insert_error(e, &service.service_arn))?;
        Ok(())
    }

    async fn get_service(
        &self,
        cluster_arn: &str,
        service_name: &str,
    ) -> Result<Option<Service>, StoreError> {
        let conn = self.lock()?;
        let data: Option<String> = conn
            .query_row(
                "SELECT data FROM services WHERE cluster_arn = ?1 AND name = ?2",
                params![cluster_arn, service_name],
                |row| row.get(0),
            )
            .optional()?;
        data.map(Self::decode).transpose()
    }

    async fn update_service(&self, service: &Service) -> Result<Service, StoreError> {
        let mut updated = service.clone();
        updated.version = service.version + 1;
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE services SET version = ?1, data = ?2
             WHERE cluster_arn = ?3 AND name = ?4 AND version = ?5",
            params![
                updated.version,
                Self::encode(&updated)?,
                service.cluster_arn,
                service.service_name,
                service.version,
            ],
        )?;
        if changed == 1 {
            return Ok(updated);
        }
        let exists: Option<i64> = conn
            .query_row(
                "SELECT version FROM services WHERE cluster_arn = ?1 AND name = ?2",
                params![service.cluster_arn, service.service_name],
                |row| row.get(0),
            )
            .optional()?;
        match exists {
            Some(_) => Err(StoreError::Conflict(service.service_arn.clone())),
            None => Err(StoreError::NotFound(service.service_arn.clone())),
        }
    }

    async fn list_services(
        &self,
        cluster_arn: &str,
        launch_type: Option<LaunchType>,
        page: &Pagination,
    ) -> Result<Page<Service>, StoreError> {
        let rows = {
            let conn = self.lock()?;
            Self::load_ordered::<Service>(
                &conn,
                "SELECT created_at, arn, data FROM services WHERE cluster_arn = ?1
                 ORDER BY created_at, arn",
                &[&cluster_arn],
            )?
        };
        let filtered: Vec<_> = rows
            .into_iter()
            .filter(|(_, _, s)| launch_type.map(|lt| s.launch_type == lt).unwrap_or(true))
            .collect();
        paginate(filtered, page, |(created_at, arn, _)| {
            (*created_at, arn.clone())
        })
        .map(|p| Page {
            items: p.items.into_iter().map(|(_, _, s)| s).collect(),
            next_token: p.next_token,
        })
    }

    async fn create_task_set(&self, task_set: &TaskSet) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO task_sets (service_arn, id, arn, created_at, version, data)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                task_set.service_arn,
                task_set.id,
                task_set.task_set_arn,
                task_set.created_at.timestamp_millis(),
                task_set.version,
                Self::encode(task_set)?,
            ],
        )
        .map_err(|e| Self::map_insert_error(e, &task_set.task_set_arn))?;
        Ok(())
    }

    async fn get_task_set(
        &self,
        service_arn: &str,
        task_set_id: &str,
    ) -> Result<Option<TaskSet>, StoreError> {
        let conn = self.lock()?;
        let data: Option<String> = conn
            .query_row(
                "SELECT data FROM task_sets WHERE service_arn = ?1 AND id = ?2",
                params![service_arn, task_set_id],
                |row| row.get(0),
            )
            .optional()?;
        data.map(Self::decode).transpose()
    }

    async fn update_task_set(&self, task_set: &TaskSet) -> Result<TaskSet, StoreError> {
        let mut updated = task_set.clone();
        updated.version = task_set.version + 1;
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE task_sets SET version = ?1, data = ?2
             WHERE service_arn = ?3 AND id = ?4 AND version = ?5",
            params![
                updated.version,
                Self::encode(&updated)?,
                task_set.service_arn,
                task_set.id,
                task_set.version,
            ],
        )?;
        if changed == 1 {
            return Ok(updated);
        }
        let exists: Option<i64> = conn
            .query_row(
                "SELECT version FROM task_sets WHERE service_arn = ?1 AND id = ?2",
                params![task_set.service_arn, task_set.id],
                |row| row.get(0),
            )
            .optional()?;
        match exists {
            Some(_) => Err(StoreError::Conflict(task_set.task_set_arn.clone())),
            None => Err(StoreError::NotFound(task_set.task_set_arn.clone())),
        }
    }

    async fn delete_task_set(
        &self,
        service_arn: &str,
        task_set_id: &str,
    ) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "DELETE FROM task_sets WHERE service_arn = ?1 AND id = ?2",
            params![service_arn, task_set_id],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(task_set_id.to_string()));
        }
        Ok(())
    }

    async fn list_task_sets(&self, service_arn: &str) -> Result<Vec<TaskSet>, StoreError> {
        let rows = {
            let conn = self.lock()?;
            Self::load_ordered::<TaskSet>(
                &conn,
                "SELECT created_at, arn, data FROM task_sets WHERE service_arn = ?1
                 ORDER BY created_at, arn",
                &[&service_arn],
            )?
        };
        Ok(rows.into_iter().map(|(_, _, ts)| ts).collect())
    }

    async fn put_tags(&self, arn: &str, tags: &[Tag]) -> Result<(), StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        for tag in tags {
            tx.execute(
                "INSERT INTO tags (arn, key, value) VALUES (?1, ?2, ?3)
                 ON CONFLICT (arn, key) DO UPDATE SET value = excluded.value",
                params![arn, tag.key, tag.value],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    async fn remove_tags(&self, arn: &str, keys: &[String]) -> Result<(), StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        for key in keys {
            tx.execute(
                "DELETE FROM tags WHERE arn = ?1 AND key = ?2",
                params![arn, key],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    async fn list_tags(&self, arn: &str) -> Result<Vec<Tag>, StoreError> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT key, value FROM tags WHERE arn = ?1 ORDER BY key")?;
        let rows = stmt.query_map(params![arn], |row| {
            Ok(Tag {
                key: row.get(0)?,
                value: row.get(1)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    async fn put_account_setting(&self, setting: &AccountSetting) -> Result<(), StoreError> {
        let principal = setting
            .principal_arn
            .clone()
            .unwrap_or_else(|| DEFAULT_PRINCIPAL.to_string());
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO account_settings (principal, name, value) VALUES (?1, ?2, ?3)
             ON CONFLICT (principal, name) DO UPDATE SET value = excluded.value",
            params![principal, setting.name, setting.value],
        )?;
        Ok(())
    }

    async fn delete_account_setting(
        &self,
        principal_arn: Option<String>,
        name: &str,
    ) -> Result<(), StoreError> {
        let principal = principal_arn.unwrap_or_else(|| DEFAULT_PRINCIPAL.to_string());
        let conn = self.lock()?;
        conn.execute(
            "DELETE FROM account_settings WHERE principal = ?1 AND name = ?2",
            params![principal, name],
        )?;
        Ok(())
    }

    async fn list_account_settings(&self) -> Result<Vec<AccountSetting>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT principal, name, value FROM account_settings ORDER BY principal, name",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;
        let mut settings = Vec::new();
        for row in rows {
            let (principal, name, value) = row?;
            settings.push(AccountSetting {
                name,
                value,
                principal_arn: (principal != DEFAULT_PRINCIPAL).then_some(principal),
            });
        }
        Ok(settings)
    }

    async fn put_attributes(
        &self,
        cluster_arn: &str,
        attributes: &[Attribute],
    ) -> Result<(), StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        for attribute in attributes {
            tx.execute(
                "INSERT INTO attributes (cluster_arn, target_id, name, value, target_type)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (cluster_arn, target_id, name)
                 DO UPDATE SET value = excluded.value, target_type = excluded.target_type",
                params![
                    cluster_arn,
                    attribute.target_id.as_deref().unwrap_or_default(),
                    attribute.name,
                    attribute.value,
                    attribute.target_type,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    async fn delete_attributes(
        &self,
        cluster_arn: &str,
        attributes: &[Attribute],
    ) -> Result<(), StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        for attribute in attributes {
            tx.execute(
                "DELETE FROM attributes WHERE cluster_arn = ?1 AND target_id = ?2 AND name = ?3",
                params![
                    cluster_arn,
                    attribute.target_id.as_deref().unwrap_or_default(),
                    attribute.name,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    async fn list_attributes(&self, cluster_arn: &str) -> Result<Vec<Attribute>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT name, value, target_type, target_id FROM attributes
             WHERE cluster_arn = ?1 ORDER BY target_id, name",
        )?;
        let rows = stmt.query_map(params![cluster_arn], |row| {
            Ok(Attribute {
                name: row.get(0)?,
                value: row.get(1)?,
                target_type: row.get(2)?,
                target_id: row.get(3)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ecs::cluster::ClusterStatus;
    use crate::ecs::task::{
        Connectivity, HealthStatus, TaskDesiredStatus, TaskLastStatus,
    };
    use chrono::{Duration, Utc};

    fn store() -> SqliteDataStore {
        SqliteDataStore::open_in_memory(Identifiers::default()).unwrap()
    }

    fn cluster(name: &str, offset_millis: i64) -> Cluster {
        let identifiers = Identifiers::default();
        Cluster {
            cluster_arn: identifiers.cluster_arn(name),
            cluster_name: name.to_string(),
            status: ClusterStatus::Active,
            region: identifiers.region().to_string(),
            k8s_cluster_name: crate::ecs::arn::k8s_cluster_name(name),
            tags: vec![],
            capacity_providers: vec![],
            default_capacity_provider_strategy: vec![],
            registered_container_instances_count: 0,
            running_tasks_count: 0,
            pending_tasks_count: 0,
            active_services_count: 0,
            created_at: Utc::now() + Duration::milliseconds(offset_millis),
            version: 1,
        }
    }

    fn task(cluster_name: &str, id: &str, offset_millis: i64) -> Task {
        let identifiers = Identifiers::default();
        Task {
            task_arn: identifiers.task_arn(cluster_name, id),
            cluster_arn: identifiers.cluster_arn(cluster_name),
            task_definition_arn: identifiers.task_definition_arn("web", 1),
            desired_status: TaskDesiredStatus::Running,
            last_status: TaskLastStatus::Pending,
            launch_type: crate::ecs::task::LaunchType::Fargate,
            containers: vec![],
            containers_json: None,
            attachments: vec![],
            started_by: None,
            group: Some("family:web".to_string()),
            connectivity: Connectivity::Connected,
            health_status: HealthStatus::Unknown,
            stop_code: None,
            stopped_reason: None,
            created_at: Utc::now() + Duration::milliseconds(offset_millis),
            pull_started_at: None,
            pull_stopped_at: None,
            started_at: None,
            stopping_at: None,
            stopped_at: None,
            execution_stopped_at: None,
            container_instance_arn: None,
            pod_name: None,
            namespace: None,
            version: 1,
        }
    }

    fn definition(family: &str) -> TaskDefinition {
        TaskDefinition {
            task_definition_arn: String::new(),
            family: family.to_string(),
            revision: 0,
            status: TaskDefinitionStatus::Active,
            container_definitions: vec![],
            network_mode: Default::default(),
            cpu: None,
            memory: None,
            volumes: vec![],
            placement_constraints: vec![],
            requires_compatibilities: vec![],
            tags: vec![],
            registered_at: Utc::now(),
            deregistered_at: None,
            version: 0,
        }
    }

    #[tokio::test]
    async fn test_cluster_crud() {
        let store = store();
        let cluster = cluster("production", 0);
        store.create_cluster(&cluster).await.unwrap();
        let loaded = store.get_cluster("production").await.unwrap().unwrap();
        assert_eq!(cluster, loaded);
        assert!(store.get_cluster("missing").await.unwrap().is_none());
        store.delete_cluster("production").await.unwrap();
        assert!(matches!(
            store.delete_cluster("production").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_duplicate_cluster_create_conflicts() {
        let store = store();
        let cluster = cluster("production", 0);
        store.create_cluster(&cluster).await.unwrap();
        assert!(matches!(
            store.create_cluster(&cluster).await,
            Err(StoreError::Duplicate(_))
        ));
    }

    #[tokio::test]
    async fn test_optimistic_update_conflicts_on_stale_version() {
        let store = store();
        let cluster = cluster("production", 0);
        store.create_cluster(&cluster).await.unwrap();

        let updated = store.update_cluster(&cluster).await.unwrap();
        assert_eq!(cluster.version + 1, updated.version);

        // a second writer still holding version 1 must fail
        assert!(matches!(
            store.update_cluster(&cluster).await,
            Err(StoreError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_revision_assignment_is_monotonic_per_family() {
        let store = store();
        let first = store.register_task_definition(definition("web")).await.unwrap();
        let second = store.register_task_definition(definition("web")).await.unwrap();
        let other = store.register_task_definition(definition("api")).await.unwrap();
        assert_eq!(1, first.revision);
        assert_eq!(2, second.revision);
        assert_eq!(1, other.revision);
        assert!(second
            .task_definition_arn
            .ends_with("task-definition/web:2"));
    }

    #[tokio::test]
    async fn test_deregister_retains_record() {
        let store = store();
        store.register_task_definition(definition("web")).await.unwrap();
        let inactive = store
            .update_task_definition_status("web", 1, TaskDefinitionStatus::Inactive)
            .await
            .unwrap();
        assert_eq!(TaskDefinitionStatus::Inactive, inactive.status);
        assert!(inactive.deregistered_at.is_some());

        // still describable
        let described = store.get_task_definition("web", 1).await.unwrap().unwrap();
        assert_eq!(TaskDefinitionStatus::Inactive, described.status);

        // but filtered from ACTIVE listings
        let active = store
            .list_task_definitions(None, Some(TaskDefinitionStatus::Active), &Pagination::default())
            .await
            .unwrap();
        assert!(active.items.is_empty());
    }

    #[tokio::test]
    async fn test_list_clusters_paginates_150_disjoint() {
        let store = store();
        for i in 0..150 {
            store
                .create_cluster(&cluster(&format!("c{:03}", i), i))
                .await
                .unwrap();
        }
        let first = store
            .list_clusters(&Pagination::first_page(Some(100)))
            .await
            .unwrap();
        assert_eq!(100, first.items.len());
        let token = first.next_token.clone().unwrap();

        let second = store
            .list_clusters(&Pagination {
                max_results: Some(100),
                next_token: Some(token),
            })
            .await
            .unwrap();
        assert_eq!(50, second.items.len());
        assert!(second.next_token.is_none());

        let mut names: Vec<String> = first
            .items
            .iter()
            .chain(second.items.iter())
            .map(|c| c.cluster_name.clone())
            .collect();
        names.sort();
        names.dedup();
        assert_eq!(150, names.len());
    }

    #[tokio::test]
    async fn test_invalid_token_surfaces() {
        let store = store();
        let result = store
            .list_clusters(&Pagination {
                max_results: None,
                next_token: Some("not-a-token".to_string()),
            })
            .await;
        assert!(matches!(result, Err(StoreError::InvalidToken)));
    }

    #[tokio::test]
    async fn test_task_listing_filters() {
        let store = store();
        let mut service_task = task("production", "aaaaaaaaaaaaaaaa", 0);
        service_task.started_by = Some("ecs-svc/web".to_string());
        service_task.group = Some("service:web".to_string());
        let mut stopped_task = task("production", "bbbbbbbbbbbbbbbb", 1);
        stopped_task.desired_status = TaskDesiredStatus::Stopped;
        store.create_task(&service_task).await.unwrap();
        store.create_task(&stopped_task).await.unwrap();

        let mut filter = TaskFilter::for_cluster(&service_task.cluster_arn);
        filter.service_name = Some("web".to_string());
        let by_service = store.list_tasks(&filter, &Pagination::default()).await.unwrap();
        assert_eq!(1, by_service.items.len());
        assert_eq!(service_task.task_arn, by_service.items[0].task_arn);

        let mut filter = TaskFilter::for_cluster(&service_task.cluster_arn);
        filter.desired_status = Some(TaskDesiredStatus::Stopped);
        let by_status = store.list_tasks(&filter, &Pagination::default()).await.unwrap();
        assert_eq!(1, by_status.items.len());
        assert_eq!(stopped_task.task_arn, by_status.items[0].task_arn);
    }

    #[tokio::test]
    async fn test_get_task_by_id_or_arn() {
        let store = store();
        let task = task("production", "cccccccccccccccc", 0);
        store.create_task(&task).await.unwrap();
        let by_id = store
            .get_task(&task.cluster_arn, "cccccccccccccccc")
            .await
            .unwrap();
        assert!(by_id.is_some());
        let by_arn = store.get_task(&task.cluster_arn, &task.task_arn).await.unwrap();
        assert!(by_arn.is_some());
    }

    #[tokio::test]
    async fn test_task_update_not_found_for_unknown() {
        let store = store();
        let task = task("production", "dddddddddddddddd", 0);
        assert!(matches!(
            store.update_task(&task).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_tags_round_trip() {
        let store = store();
        let arn = "arn:aws:ecs:us-east-1:000000000000:cluster/production";
        store
            .put_tags(
                arn,
                &[
                    Tag {
                        key: "env".to_string(),
                        value: "prod".to_string(),
                    },
                    Tag {
                        key: "team".to_string(),
                        value: "core".to_string(),
                    },
                ],
            )
            .await
            .unwrap();
        store
            .put_tags(
                arn,
                &[Tag {
                    key: "env".to_string(),
                    value: "staging".to_string(),
                }],
            )
            .await
            .unwrap();
        let tags = store.list_tags(arn).await.unwrap();
        assert_eq!(2, tags.len());
        assert!(tags.contains(&Tag {
            key: "env".to_string(),
            value: "staging".to_string()
        }));
        store.remove_tags(arn, &["env".to_string()]).await.unwrap();
        assert_eq!(1, store.list_tags(arn).await.unwrap().len());
    }

    #[tokio::test]
    async fn test_account_settings_default_principal() {
        let store = store();
        store
            .put_account_setting(&AccountSetting {
                name: "taskLongArnFormat".to_string(),
                value: "enabled".to_string(),
                principal_arn: None,
            })
            .await
            .unwrap();
        let settings = store.list_account_settings().await.unwrap();
        assert_eq!(1, settings.len());
        assert!(settings[0].principal_arn.is_none());
        store
            .delete_account_setting(None, "taskLongArnFormat")
            .await
            .unwrap();
        assert!(store.list_account_settings().await.unwrap().is_empty());
    }
}
