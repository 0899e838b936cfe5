//! Rollout flag persistence for the SQLite repository.

use async_trait::async_trait;
use payfirst_core::{FlagAction, RolloutChange, RolloutFlag};
use rusqlite::{params, Connection, OptionalExtension};

use super::super::{FlagRepository, RepositoryError};
use super::{from_millis, sql_err, to_millis, SqliteRepository};

fn load_flag_sync(conn: &Connection, name: &str) -> Result<Option<RolloutFlag>, RepositoryError> {
    let row: Option<(bool, i64, String, i64)> = conn
        .query_row(
            "SELECT enabled, rollout_percentage, target_groups, updated_at
             FROM rollout_flags WHERE name = ?1",
            params![name],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )
        .optional()
        .map_err(sql_err("load flag"))?;

    let Some((enabled, percentage, target_groups, updated_at)) = row else {
        return Ok(None);
    };
    let target_groups: Vec<String> = serde_json::from_str(&target_groups)
        .map_err(|_| RepositoryError::corruption("flag target groups JSON"))?;

    let mut stmt = conn
        .prepare(
            "SELECT action, old_percentage, new_percentage, reason, changed_by, changed_at
             FROM rollout_flag_history WHERE flag_name = ?1 ORDER BY id",
        )
        .map_err(sql_err("load flag history"))?;
    let raw = stmt
        .query_map(params![name], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, i64>(5)?,
            ))
        })
        .map_err(sql_err("load flag history"))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(sql_err("load flag history"))?;

    let mut history = Vec::with_capacity(raw.len());
    for (action, old, new, reason, changed_by, at) in raw {
        history.push(RolloutChange {
            action: FlagAction::parse(&action)
                .ok_or_else(|| RepositoryError::corruption(format!("flag action {action:?}")))?,
            old_percentage: percentage_from_i64(old)?,
            new_percentage: percentage_from_i64(new)?,
            reason,
            changed_by,
            at: from_millis(at, "flag history")?,
        });
    }

    Ok(Some(RolloutFlag {
        name: name.to_string(),
        enabled,
        rollout_percentage: percentage_from_i64(percentage)?,
        target_groups,
        updated_at: from_millis(updated_at, "flag updated_at")?,
        history,
    }))
}

fn percentage_from_i64(value: i64) -> Result<u8, RepositoryError> {
    u8::try_from(value)
        .ok()
        .filter(|p| *p <= 100)
        .ok_or_else(|| RepositoryError::corruption(format!("rollout percentage {value}")))
}

fn encode_groups(flag: &RolloutFlag) -> Result<String, RepositoryError> {
    serde_json::to_string(&flag.target_groups)
        .map_err(|e| RepositoryError::storage("serialize target groups", e.to_string()))
}

fn insert_history_sync(
    conn: &Connection,
    name: &str,
    change: &RolloutChange,
) -> Result<(), RepositoryError> {
    conn.execute(
        "INSERT INTO rollout_flag_history
             (flag_name, action, old_percentage, new_percentage, reason, changed_by, changed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            name,
            change.action.as_str(),
            change.old_percentage,
            change.new_percentage,
            change.reason,
            change.changed_by,
            to_millis(change.at)
        ],
    )
    .map_err(sql_err("append flag history"))?;
    Ok(())
}

#[async_trait]
impl FlagRepository for SqliteRepository {
    async fn load_flag(&self, name: &str) -> Result<Option<RolloutFlag>, RepositoryError> {
        let name = name.to_string();
        self.with_conn("load flag", move |conn| load_flag_sync(conn, &name))
            .await
    }

    async fn create_flag_if_absent(
        &self,
        flag: &RolloutFlag,
    ) -> Result<RolloutFlag, RepositoryError> {
        let flag = flag.clone();
        let groups = encode_groups(&flag)?;
        self.with_conn("create flag", move |conn| {
            let tx = conn.transaction().map_err(sql_err("create flag"))?;
            let inserted = tx
                .execute(
                    "INSERT OR IGNORE INTO rollout_flags
                         (name, enabled, rollout_percentage, target_groups, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        flag.name,
                        flag.enabled,
                        flag.rollout_percentage,
                        groups,
                        to_millis(flag.updated_at)
                    ],
                )
                .map_err(sql_err("create flag"))?;
            if inserted > 0 {
                for change in &flag.history {
                    insert_history_sync(&tx, &flag.name, change)?;
                }
            }
            let stored = load_flag_sync(&tx, &flag.name)?;
            tx.commit().map_err(sql_err("create flag"))?;
            stored.ok_or_else(|| RepositoryError::storage("create flag", "flag vanished"))
        })
        .await
    }

    async fn save_flag(
        &self,
        flag: &RolloutFlag,
        change: &RolloutChange,
    ) -> Result<(), RepositoryError> {
        let flag = flag.clone();
        let change = change.clone();
        let groups = encode_groups(&flag)?;
        self.with_conn("save flag", move |conn| {
            let tx = conn.transaction().map_err(sql_err("save flag"))?;
            tx.execute(
                "INSERT INTO rollout_flags (name, enabled, rollout_percentage, target_groups, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(name) DO UPDATE SET
                     enabled = excluded.enabled,
                     rollout_percentage = excluded.rollout_percentage,
                     target_groups = excluded.target_groups,
                     updated_at = excluded.updated_at",
                params![
                    flag.name,
                    flag.enabled,
                    flag.rollout_percentage,
                    groups,
                    to_millis(flag.updated_at)
                ],
            )
            .map_err(sql_err("save flag"))?;
            insert_history_sync(&tx, &flag.name, &change)?;
            tx.commit().map_err(sql_err("save flag"))
        })
        .await
    }
}
