use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use coordinator::{InsertOutcome, JoinOutcome, SharedStore};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use shared::{
    domain::{
        Intention, Participant, Phase, PlaceId, Room, RoomCode, SelectedPlace, Selection, UserId,
        Vote,
    },
    geo::AreaPolygon,
    protocol::{ChangeSignal, StoreTable},
};

const CHANGE_FEED_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
    changes: broadcast::Sender<ChangeSignal>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Ok(Self { pool, changes })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    /// Returns the identity for `username`, creating it on first login.
    pub async fn login(&self, username: &str) -> Result<UserId> {
        let rec = sqlx::query(
            "INSERT INTO users (id, username) VALUES (?, ?)
             ON CONFLICT(username) DO UPDATE SET username=excluded.username
             RETURNING id",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(username)
        .fetch_one(&self.pool)
        .await?;
        parse_user_id(&rec.get::<String, _>(0))
    }

    pub async fn username_for_user(&self, user_id: UserId) -> Result<Option<String>> {
        let row = sqlx::query("SELECT username FROM users WHERE id = ?")
            .bind(user_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<String, _>(0)))
    }

    fn publish(&self, table: StoreTable, code: &RoomCode) {
        // No receivers is fine; nobody is watching this room.
        let _ = self.changes.send(ChangeSignal {
            table,
            room_code: code.clone(),
        });
    }
}

fn parse_user_id(raw: &str) -> Result<UserId> {
    UserId::from_str(raw).with_context(|| format!("malformed user id '{raw}' in store"))
}

fn parse_room_code(raw: &str) -> Result<RoomCode> {
    RoomCode::parse(raw).with_context(|| format!("malformed room code '{raw}' in store"))
}

fn room_from_row(row: &SqliteRow) -> Result<Room> {
    let phase: String = row.try_get("phase")?;
    let area = row
        .try_get::<Option<String>, _>("area_polygon")?
        .map(|raw| AreaPolygon::from_json_str(&raw))
        .transpose()
        .context("stored area polygon is not valid GeoJSON")?;
    Ok(Room {
        code: parse_room_code(&row.try_get::<String, _>("code")?)?,
        owner_id: parse_user_id(&row.try_get::<String, _>("owner_id")?)?,
        phase: Phase::from_str(&phase)?,
        area,
    })
}

fn selection_from_row(code: &RoomCode, row: &SqliteRow) -> Result<Selection> {
    let raw: String = row.try_get("selections")?;
    let places: Vec<SelectedPlace> =
        serde_json::from_str(&raw).context("stored selections are not valid JSON")?;
    Ok(Selection {
        room_code: code.clone(),
        user_id: parse_user_id(&row.try_get::<String, _>("player_id")?)?,
        places,
        ready: row.try_get("ready")?,
    })
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[async_trait]
impl SharedStore for Storage {
    async fn insert_room(&self, code: &RoomCode, owner_id: UserId) -> Result<InsertOutcome> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query("INSERT INTO rooms (code, owner_id, phase) VALUES (?, ?, ?)")
            .bind(code.as_str())
            .bind(owner_id.to_string())
            .bind(Phase::Lobby.as_str())
            .execute(&mut *tx)
            .await;
        match inserted {
            Ok(_) => {}
            Err(sqlx::Error::Database(err)) if err.is_unique_violation() => {
                debug!(room_code = %code, "room code collision");
                return Ok(InsertOutcome::Collision);
            }
            Err(err) => return Err(err).context("failed to insert room"),
        }

        sqlx::query(
            "INSERT INTO room_participants (room_code, user_id, is_owner, joined_at)
             VALUES (?, ?, 1, ?)",
        )
        .bind(code.as_str())
        .bind(owner_id.to_string())
        .bind(Utc::now())
        .execute(&mut *tx)
        .await
        .context("failed to add room owner as participant")?;

        tx.commit().await?;
        self.publish(StoreTable::Rooms, code);
        self.publish(StoreTable::Participants, code);
        Ok(InsertOutcome::Inserted)
    }

    async fn load_room(&self, code: &RoomCode) -> Result<Option<Room>> {
        let row =
            sqlx::query("SELECT code, owner_id, phase, area_polygon FROM rooms WHERE code = ?")
                .bind(code.as_str())
                .fetch_optional(&self.pool)
                .await?;
        row.as_ref().map(room_from_row).transpose()
    }

    async fn update_phase(
        &self,
        code: &RoomCode,
        from: Phase,
        to: Phase,
        owner_id: Option<UserId>,
    ) -> Result<bool> {
        let result = match owner_id {
            Some(owner_id) => {
                sqlx::query(
                    "UPDATE rooms SET phase = ? WHERE code = ? AND phase = ? AND owner_id = ?",
                )
                .bind(to.as_str())
                .bind(code.as_str())
                .bind(from.as_str())
                .bind(owner_id.to_string())
                .execute(&self.pool)
                .await?
            }
            None => {
                sqlx::query("UPDATE rooms SET phase = ? WHERE code = ? AND phase = ?")
                    .bind(to.as_str())
                    .bind(code.as_str())
                    .bind(from.as_str())
                    .execute(&self.pool)
                    .await?
            }
        };
        let updated = result.rows_affected() > 0;
        if updated {
            self.publish(StoreTable::Rooms, code);
        }
        Ok(updated)
    }

    async fn update_area(
        &self,
        code: &RoomCode,
        owner_id: UserId,
        area: Option<&AreaPolygon>,
    ) -> Result<bool> {
        let result = sqlx::query("UPDATE rooms SET area_polygon = ? WHERE code = ? AND owner_id = ?")
            .bind(area.map(AreaPolygon::to_json_string))
            .bind(code.as_str())
            .bind(owner_id.to_string())
            .execute(&self.pool)
            .await?;
        let updated = result.rows_affected() > 0;
        if updated {
            self.publish(StoreTable::Rooms, code);
        }
        Ok(updated)
    }

    async fn insert_participant_within(
        &self,
        code: &RoomCode,
        user_id: UserId,
        capacity: usize,
    ) -> Result<JoinOutcome> {
        let result = sqlx::query(
            "INSERT INTO room_participants (room_code, user_id, is_owner, joined_at)
             SELECT ?, ?, 0, ?
             WHERE (SELECT COUNT(*) FROM room_participants WHERE room_code = ?) < ?
             ON CONFLICT(room_code, user_id) DO NOTHING",
        )
        .bind(code.as_str())
        .bind(user_id.to_string())
        .bind(Utc::now())
        .bind(code.as_str())
        .bind(i64::try_from(capacity).unwrap_or(i64::MAX))
        .execute(&self.pool)
        .await
        .context("failed to add participant")?;
        if result.rows_affected() > 0 {
            self.publish(StoreTable::Participants, code);
            return Ok(JoinOutcome::Joined);
        }

        let member = sqlx::query(
            "SELECT 1 FROM room_participants WHERE room_code = ? AND user_id = ?",
        )
        .bind(code.as_str())
        .bind(user_id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        Ok(if member.is_some() {
            JoinOutcome::AlreadyMember
        } else {
            JoinOutcome::RoomFull
        })
    }

    async fn list_participants(&self, code: &RoomCode) -> Result<Vec<Participant>> {
        let rows = sqlx::query(
            "SELECT user_id, is_owner, joined_at FROM room_participants
             WHERE room_code = ? ORDER BY id",
        )
        .bind(code.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|r| {
                Ok(Participant {
                    room_code: code.clone(),
                    user_id: parse_user_id(&r.get::<String, _>(0))?,
                    is_owner: r.get::<bool, _>(1),
                    joined_at: r.get::<DateTime<Utc>, _>(2),
                })
            })
            .collect()
    }

    async fn count_participants(&self, code: &RoomCode) -> Result<usize> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM room_participants WHERE room_code = ?")
                .bind(code.as_str())
                .fetch_one(&self.pool)
                .await?;
        Ok(count as usize)
    }

    async fn upsert_selection(
        &self,
        code: &RoomCode,
        user_id: UserId,
        places: &[SelectedPlace],
        ready: bool,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO player_selections (session_id, player_id, selections, ready)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(session_id, player_id) DO UPDATE SET
                selections = excluded.selections,
                ready = excluded.ready,
                updated_at = CURRENT_TIMESTAMP",
        )
        .bind(code.as_str())
        .bind(user_id.to_string())
        .bind(serde_json::to_string(places)?)
        .bind(ready)
        .execute(&self.pool)
        .await?;
        self.publish(StoreTable::Selections, code);
        Ok(())
    }

    async fn insert_selection_if_absent(
        &self,
        code: &RoomCode,
        user_id: UserId,
        places: &[SelectedPlace],
    ) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO player_selections (session_id, player_id, selections, ready)
             VALUES (?, ?, ?, 1)
             ON CONFLICT(session_id, player_id) DO NOTHING",
        )
        .bind(code.as_str())
        .bind(user_id.to_string())
        .bind(serde_json::to_string(places)?)
        .execute(&self.pool)
        .await?;
        let inserted = result.rows_affected() > 0;
        if inserted {
            self.publish(StoreTable::Selections, code);
        }
        Ok(inserted)
    }

    async fn list_selections(&self, code: &RoomCode) -> Result<Vec<Selection>> {
        let rows = sqlx::query(
            "SELECT player_id, selections, ready FROM player_selections
             WHERE session_id = ? ORDER BY id",
        )
        .bind(code.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(|r| selection_from_row(code, r)).collect()
    }

    async fn count_ready_selections(&self, code: &RoomCode) -> Result<usize> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM player_selections WHERE session_id = ? AND ready = 1",
        )
        .bind(code.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(count as usize)
    }

    async fn upsert_vote(
        &self,
        code: &RoomCode,
        user_id: UserId,
        place_id: &PlaceId,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO place_votes (room_code, user_id, place_id) VALUES (?, ?, ?)
             ON CONFLICT(room_code, user_id) DO UPDATE SET
                place_id = excluded.place_id,
                cast_at = CURRENT_TIMESTAMP",
        )
        .bind(code.as_str())
        .bind(user_id.to_string())
        .bind(place_id.as_str())
        .execute(&self.pool)
        .await?;
        self.publish(StoreTable::Votes, code);
        Ok(())
    }

    async fn delete_vote(&self, code: &RoomCode, user_id: UserId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM place_votes WHERE room_code = ? AND user_id = ?")
            .bind(code.as_str())
            .bind(user_id.to_string())
            .execute(&self.pool)
            .await?;
        let deleted = result.rows_affected() > 0;
        if deleted {
            self.publish(StoreTable::Votes, code);
        }
        Ok(deleted)
    }

    async fn list_votes(&self, code: &RoomCode) -> Result<Vec<Vote>> {
        let rows = sqlx::query(
            "SELECT user_id, place_id FROM place_votes WHERE room_code = ? ORDER BY id",
        )
        .bind(code.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|r| {
                Ok(Vote {
                    room_code: code.clone(),
                    user_id: parse_user_id(&r.get::<String, _>(0))?,
                    place_id: PlaceId::new(r.get::<String, _>(1)),
                })
            })
            .collect()
    }

    async fn upsert_intention(
        &self,
        code: &RoomCode,
        user_id: UserId,
        task_description: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO planning_intentions (room_code, user_id, task_description)
             VALUES (?, ?, ?)
             ON CONFLICT(room_code, user_id) DO UPDATE SET
                task_description = excluded.task_description,
                updated_at = CURRENT_TIMESTAMP",
        )
        .bind(code.as_str())
        .bind(user_id.to_string())
        .bind(task_description)
        .execute(&self.pool)
        .await?;
        self.publish(StoreTable::Intentions, code);
        Ok(())
    }

    async fn list_intentions(&self, code: &RoomCode) -> Result<Vec<Intention>> {
        let rows = sqlx::query(
            "SELECT i.user_id, u.username, i.task_description
             FROM planning_intentions i
             LEFT JOIN users u ON u.id = i.user_id
             WHERE i.room_code = ?
             ORDER BY i.id",
        )
        .bind(code.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|r| {
                Ok(Intention {
                    user_id: parse_user_id(&r.get::<String, _>(0))?,
                    username: r.get::<Option<String>, _>(1),
                    task_description: r.get::<String, _>(2),
                })
            })
            .collect()
    }

    fn changes(&self) -> broadcast::Receiver<ChangeSignal> {
        self.changes.subscribe()
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
