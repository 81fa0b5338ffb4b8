//! PostgreSQL-backed [`Store`].
//!
//! Queries are checked at runtime (`sqlx::query_as`) so the crate builds
//! without a live database. Rows are read into `*Row` structs and mapped to
//! domain types.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use encore_protocol::{ConnectionId, DeviceId, InvitationId, RoomId, RunId, UserId};
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::{
    Device, DiscoveredRoom, DiscoveryFilter, Geofence, Invitation, LastPosition, NewDevice,
    NewInvitation, Room, Store, StoreError, User,
};

const ROOM_COLUMNS: &str = "r.id, r.run_id, r.creator_id, r.name, r.is_open, \
     r.is_open_only_invited_users_can_vote, r.geofence_lat, r.geofence_lng, \
     r.geofence_radius_meters, r.is_constrained, r.created_at";

const DEVICE_COLUMNS: &str =
    "id, user_id, connection_id, name, is_emitting, lat, lng, position_updated_at, created_at";

const INVITATION_COLUMNS: &str =
    "id, room_id, inviting_user_id, invited_user_id, created_at";

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

#[derive(FromRow)]
struct UserRow {
    id: Uuid,
    nickname: String,
    current_room_id: Option<Uuid>,
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        Self {
            id: UserId(row.id),
            nickname: row.nickname,
            current_room: row.current_room_id.map(RoomId),
        }
    }
}

#[derive(FromRow)]
struct DeviceRow {
    id: Uuid,
    user_id: Uuid,
    connection_id: Uuid,
    name: String,
    is_emitting: bool,
    lat: Option<f64>,
    lng: Option<f64>,
    position_updated_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl From<DeviceRow> for Device {
    fn from(row: DeviceRow) -> Self {
        Self {
            id: DeviceId(row.id),
            user_id: UserId(row.user_id),
            connection_id: ConnectionId::from_uuid(row.connection_id),
            name: row.name,
            is_emitting: row.is_emitting,
            last_position: row.position_updated_at.map(|updated_at| LastPosition {
                lat: row.lat,
                lng: row.lng,
                updated_at,
            }),
            created_at: row.created_at,
        }
    }
}

#[derive(FromRow)]
struct RoomRow {
    id: Uuid,
    run_id: Uuid,
    creator_id: Uuid,
    name: String,
    is_open: bool,
    is_open_only_invited_users_can_vote: bool,
    geofence_lat: Option<f64>,
    geofence_lng: Option<f64>,
    geofence_radius_meters: Option<f64>,
    is_constrained: bool,
    created_at: DateTime<Utc>,
}

impl TryFrom<RoomRow> for Room {
    type Error = StoreError;

    fn try_from(row: RoomRow) -> Result<Self, Self::Error> {
        let geofence = match (row.geofence_lat, row.geofence_lng, row.geofence_radius_meters) {
            (Some(lat), Some(lng), Some(radius_meters)) => Some(Geofence {
                lat,
                lng,
                radius_meters,
                is_constrained: row.is_constrained,
            }),
            (None, None, None) => None,
            _ => {
                return Err(StoreError::CorruptRow(format!(
                    "room {} has a partial geofence",
                    row.id
                )));
            }
        };
        Ok(Self {
            id: RoomId(row.id),
            run_id: RunId(row.run_id),
            creator_id: UserId(row.creator_id),
            name: row.name,
            is_open: row.is_open,
            is_open_only_invited_users_can_vote: row.is_open_only_invited_users_can_vote,
            geofence,
            created_at: row.created_at,
        })
    }
}

#[derive(FromRow)]
struct DiscoveredRoomRow {
    #[sqlx(flatten)]
    room: RoomRow,
    is_invited: bool,
}

#[derive(FromRow)]
struct InvitationRow {
    id: Uuid,
    room_id: Uuid,
    inviting_user_id: Uuid,
    invited_user_id: Uuid,
    created_at: DateTime<Utc>,
}

impl From<InvitationRow> for Invitation {
    fn from(row: InvitationRow) -> Self {
        Self {
            id: InvitationId(row.id),
            room_id: RoomId(row.room_id),
            inviting_user_id: UserId(row.inviting_user_id),
            invited_user_id: UserId(row.invited_user_id),
            created_at: row.created_at,
        }
    }
}

/// Escapes `%`, `_` and `\` so user input matches literally inside `ILIKE`.
fn like_pattern(search: &str) -> String {
    let mut escaped = String::with_capacity(search.len() + 2);
    escaped.push('%');
    for c in search.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('%');
    escaped
}

// ---------------------------------------------------------------------------
// PgStore
// ---------------------------------------------------------------------------

/// A [`Store`] over a PostgreSQL connection pool.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Opens a pool against `database_url`.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "failed to connect to database");
                StoreError::from(e)
            })?;
        tracing::info!(max_connections, "database pool ready");
        Ok(Self { pool })
    }

    /// Applies the embedded schema migrations.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        tracing::info!("database migrations applied");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

impl std::fmt::Debug for PgStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgStore").finish_non_exhaustive()
    }
}

#[async_trait]
impl Store for PgStore {
    async fn insert_user(&self, user: &User) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO users (id, nickname, current_room_id) VALUES ($1, $2, $3)")
            .bind(user.id.as_uuid())
            .bind(&user.nickname)
            .bind(user.current_room.map(|r| r.as_uuid()))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_user(&self, id: UserId) -> Result<Option<User>, StoreError> {
        let row: Option<UserRow> =
            sqlx::query_as("SELECT id, nickname, current_room_id FROM users WHERE id = $1")
                .bind(id.as_uuid())
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(User::from))
    }

    async fn set_current_room(
        &self,
        user: UserId,
        room: Option<RoomId>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE users SET current_room_id = $2 WHERE id = $1")
            .bind(user.as_uuid())
            .bind(room.map(|r| r.as_uuid()))
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict(format!("user {user} does not exist")));
        }
        Ok(())
    }

    async fn clear_current_room_for(&self, room: RoomId) -> Result<Vec<UserId>, StoreError> {
        let ids: Vec<(Uuid,)> = sqlx::query_as(
            "UPDATE users SET current_room_id = NULL WHERE current_room_id = $1 RETURNING id",
        )
        .bind(room.as_uuid())
        .fetch_all(&self.pool)
        .await?;
        let mut users: Vec<UserId> = ids.into_iter().map(|(id,)| UserId(id)).collect();
        users.sort();
        Ok(users)
    }

    async fn list_users_in_room(&self, room: RoomId) -> Result<Vec<UserId>, StoreError> {
        let ids: Vec<(Uuid,)> =
            sqlx::query_as("SELECT id FROM users WHERE current_room_id = $1 ORDER BY id")
                .bind(room.as_uuid())
                .fetch_all(&self.pool)
                .await?;
        Ok(ids.into_iter().map(|(id,)| UserId(id)).collect())
    }

    async fn insert_device(&self, device: NewDevice) -> Result<Device, StoreError> {
        let row: DeviceRow = sqlx::query_as(&format!(
            "INSERT INTO devices (id, user_id, connection_id, name) VALUES ($1, $2, $3, $4) \
             RETURNING {DEVICE_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(device.user_id.as_uuid())
        .bind(device.connection_id.into_inner())
        .bind(&device.name)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }

    async fn get_device(&self, id: DeviceId) -> Result<Option<Device>, StoreError> {
        let row: Option<DeviceRow> =
            sqlx::query_as(&format!("SELECT {DEVICE_COLUMNS} FROM devices WHERE id = $1"))
                .bind(id.as_uuid())
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(Device::from))
    }

    async fn find_device_by_connection(
        &self,
        connection: ConnectionId,
    ) -> Result<Option<Device>, StoreError> {
        let row: Option<DeviceRow> = sqlx::query_as(&format!(
            "SELECT {DEVICE_COLUMNS} FROM devices WHERE connection_id = $1"
        ))
        .bind(connection.into_inner())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Device::from))
    }

    async fn list_user_devices(&self, user: UserId) -> Result<Vec<Device>, StoreError> {
        let rows: Vec<DeviceRow> = sqlx::query_as(&format!(
            "SELECT {DEVICE_COLUMNS} FROM devices WHERE user_id = $1 ORDER BY created_at, id"
        ))
        .bind(user.as_uuid())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Device::from).collect())
    }

    async fn delete_device(&self, id: DeviceId) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM devices WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_emitting_device(
        &self,
        user: UserId,
        device: Option<DeviceId>,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        // Clear first: the partial unique index allows one emitter per user.
        sqlx::query("UPDATE devices SET is_emitting = FALSE WHERE user_id = $1 AND is_emitting")
            .bind(user.as_uuid())
            .execute(&mut *tx)
            .await?;

        if let Some(device) = device {
            let result = sqlx::query(
                "UPDATE devices SET is_emitting = TRUE WHERE id = $1 AND user_id = $2",
            )
            .bind(device.as_uuid())
            .bind(user.as_uuid())
            .execute(&mut *tx)
            .await?;
            if result.rows_affected() == 0 {
                tx.rollback().await?;
                return Err(StoreError::Conflict(format!(
                    "device {device} is not owned by {user}"
                )));
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn update_device_position(
        &self,
        device: DeviceId,
        lat: f64,
        lng: f64,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE devices SET lat = $2, lng = $3, position_updated_at = $4 WHERE id = $1",
        )
        .bind(device.as_uuid())
        .bind(lat)
        .bind(lng)
        .bind(at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict(format!("device {device} does not exist")));
        }
        Ok(())
    }

    async fn insert_room(&self, room: &Room) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO rooms (
                id, run_id, creator_id, name, is_open, is_open_only_invited_users_can_vote,
                geofence_lat, geofence_lng, geofence_radius_meters, is_constrained, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(room.id.as_uuid())
        .bind(room.run_id.as_uuid())
        .bind(room.creator_id.as_uuid())
        .bind(&room.name)
        .bind(room.is_open)
        .bind(room.is_open_only_invited_users_can_vote)
        .bind(room.geofence.map(|g| g.lat))
        .bind(room.geofence.map(|g| g.lng))
        .bind(room.geofence.map(|g| g.radius_meters))
        .bind(room.geofence.is_some_and(|g| g.is_constrained))
        .bind(room.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_room(&self, id: RoomId) -> Result<Option<Room>, StoreError> {
        let row: Option<RoomRow> =
            sqlx::query_as(&format!("SELECT {ROOM_COLUMNS} FROM rooms r WHERE r.id = $1"))
                .bind(id.as_uuid())
                .fetch_optional(&self.pool)
                .await?;
        row.map(Room::try_from).transpose()
    }

    async fn delete_room(&self, id: RoomId) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM rooms WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn add_room_member(&self, room: RoomId, user: UserId) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO room_members (room_id, user_id) VALUES ($1, $2) ON CONFLICT DO NOTHING",
        )
        .bind(room.as_uuid())
        .bind(user.as_uuid())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove_room_member(&self, room: RoomId, user: UserId) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM room_members WHERE room_id = $1 AND user_id = $2")
            .bind(room.as_uuid())
            .bind(user.as_uuid())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_room_members(&self, room: RoomId) -> Result<Vec<UserId>, StoreError> {
        let ids: Vec<(Uuid,)> =
            sqlx::query_as("SELECT user_id FROM room_members WHERE room_id = $1 ORDER BY user_id")
                .bind(room.as_uuid())
                .fetch_all(&self.pool)
                .await?;
        Ok(ids.into_iter().map(|(id,)| UserId(id)).collect())
    }

    async fn get_or_insert_invitation(
        &self,
        invitation: NewInvitation,
    ) -> Result<(Invitation, bool), StoreError> {
        let inserted: Option<InvitationRow> = sqlx::query_as(&format!(
            "INSERT INTO invitations (id, room_id, inviting_user_id, invited_user_id) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (room_id, invited_user_id) DO NOTHING \
             RETURNING {INVITATION_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(invitation.room_id.as_uuid())
        .bind(invitation.inviting_user_id.as_uuid())
        .bind(invitation.invited_user_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = inserted {
            return Ok((row.into(), true));
        }

        // Lost the race or already invited: read the winner.
        match self
            .find_invitation(invitation.room_id, invitation.invited_user_id)
            .await?
        {
            Some(existing) => Ok((existing, false)),
            None => Err(StoreError::Conflict(format!(
                "invitation to {} for {} vanished after conflict",
                invitation.room_id, invitation.invited_user_id
            ))),
        }
    }

    async fn find_invitation(
        &self,
        room: RoomId,
        invited_user: UserId,
    ) -> Result<Option<Invitation>, StoreError> {
        let row: Option<InvitationRow> = sqlx::query_as(&format!(
            "SELECT {INVITATION_COLUMNS} FROM invitations \
             WHERE room_id = $1 AND invited_user_id = $2"
        ))
        .bind(room.as_uuid())
        .bind(invited_user.as_uuid())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Invitation::from))
    }

    async fn delete_invitations_for_room(&self, room: RoomId) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM invitations WHERE room_id = $1")
            .bind(room.as_uuid())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn discover_rooms(
        &self,
        filter: &DiscoveryFilter,
    ) -> Result<(Vec<DiscoveredRoom>, u64), StoreError> {
        let pattern = filter
            .search
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(like_pattern);

        // $1 viewer, $2 excluded room, $3 name pattern.
        let visible = r#"
            FROM rooms r
            LEFT JOIN invitations i
                ON i.room_id = r.id AND i.invited_user_id = $1
            WHERE (r.is_open OR i.id IS NOT NULL)
              AND ($2::uuid IS NULL OR r.id <> $2)
              AND ($3::text IS NULL OR r.name ILIKE $3)
        "#;

        let (total,): (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) {visible}"))
            .bind(filter.user_id.as_uuid())
            .bind(filter.exclude_room.map(|r| r.as_uuid()))
            .bind(pattern.as_deref())
            .fetch_one(&self.pool)
            .await?;

        let rows: Vec<DiscoveredRoomRow> = sqlx::query_as(&format!(
            r#"
            SELECT {ROOM_COLUMNS}, (i.id IS NOT NULL) AS is_invited
            {visible}
            ORDER BY
                CASE
                    WHEN NOT r.is_open AND i.id IS NOT NULL THEN 0
                    WHEN r.is_open AND i.id IS NOT NULL THEN 1
                    ELSE 2
                END,
                r.created_at,
                r.id
            OFFSET $4 LIMIT $5
            "#
        ))
        .bind(filter.user_id.as_uuid())
        .bind(filter.exclude_room.map(|r| r.as_uuid()))
        .bind(pattern.as_deref())
        .bind(i64::try_from(filter.offset).unwrap_or(i64::MAX))
        .bind(i64::try_from(filter.limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        let rooms = rows
            .into_iter()
            .map(|row| {
                Ok(DiscoveredRoom {
                    is_invited: row.is_invited,
                    room: Room::try_from(row.room)?,
                })
            })
            .collect::<Result<Vec<_>, StoreError>>()?;

        Ok((rooms, u64::try_from(total).unwrap_or(0)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_like_pattern_escapes_wildcards() {
        assert_eq!(like_pattern("jazz"), "%jazz%");
        assert_eq!(like_pattern("100%_off\\"), "%100\\%\\_off\\\\%");
    }

    #[test]
    fn test_partial_geofence_is_corrupt() {
        let row = RoomRow {
            id: Uuid::nil(),
            run_id: Uuid::nil(),
            creator_id: Uuid::nil(),
            name: "r".into(),
            is_open: true,
            is_open_only_invited_users_can_vote: false,
            geofence_lat: Some(1.0),
            geofence_lng: None,
            geofence_radius_meters: Some(10.0),
            is_constrained: true,
            created_at: Utc::now(),
        };
        assert!(matches!(Room::try_from(row), Err(StoreError::CorruptRow(_))));
    }

    #[test]
    fn test_device_row_without_fix_has_no_position() {
        let row = DeviceRow {
            id: Uuid::nil(),
            user_id: Uuid::nil(),
            connection_id: Uuid::nil(),
            name: "d".into(),
            is_emitting: false,
            lat: None,
            lng: None,
            position_updated_at: None,
            created_at: Utc::now(),
        };
        assert_eq!(Device::from(row).last_position, None);
    }
}
