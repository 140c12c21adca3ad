use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgExecutor, Postgres, QueryBuilder};
use time::OffsetDateTime;

const COLUMNS: &str = "id, email, username, password_hash, name, role, \
     moodle_user_id, moodle_username, is_active, created_at, updated_at";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "user_role", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Admin,
    Student,
    Tutor,
    Parent,
}

impl UserRole {
    pub const VALID: &'static str = "admin, student, tutor, parent";

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "admin" => Some(Self::Admin),
            "student" => Some(Self::Student),
            "tutor" => Some(Self::Tutor),
            "parent" => Some(Self::Parent),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct User {
    pub id: i32,
    pub email: String,
    pub username: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub name: String,
    pub role: UserRole,
    pub moodle_user_id: Option<i32>,
    pub moodle_username: Option<String>,
    pub is_active: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Column values for a fresh row; linkage fields are set when the account
/// was mirrored into Moodle before the insert.
#[derive(Debug)]
pub struct NewUserRow<'a> {
    pub email: &'a str,
    pub username: &'a str,
    pub password_hash: &'a str,
    pub name: &'a str,
    pub role: UserRole,
    pub moodle_user_id: Option<i32>,
    pub moodle_username: Option<&'a str>,
}

/// Selective patch; `None` leaves the column untouched.
#[derive(Debug, Clone, Default)]
pub struct UserPatch {
    pub email: Option<String>,
    pub username: Option<String>,
    pub name: Option<String>,
    pub role: Option<UserRole>,
    pub is_active: Option<bool>,
}

impl UserPatch {
    pub fn is_empty(&self) -> bool {
        self.email.is_none()
            && self.username.is_none()
            && self.name.is_none()
            && self.role.is_none()
            && self.is_active.is_none()
    }

    /// Whether the patch changes fields mirrored into the LMS profile.
    pub fn touches_moodle_profile(&self) -> bool {
        self.name.is_some() || self.email.is_some()
    }
}

pub async fn find_by_id<'e>(db: impl PgExecutor<'e>, id: i32) -> sqlx::Result<Option<User>> {
    sqlx::query_as::<_, User>(&format!("SELECT {COLUMNS} FROM users WHERE id = $1"))
        .bind(id)
        .fetch_optional(db)
        .await
}

pub async fn find_by_email<'e>(db: impl PgExecutor<'e>, email: &str) -> sqlx::Result<Option<User>> {
    sqlx::query_as::<_, User>(&format!("SELECT {COLUMNS} FROM users WHERE email = $1"))
        .bind(email)
        .fetch_optional(db)
        .await
}

pub async fn count_all<'e>(db: impl PgExecutor<'e>) -> sqlx::Result<i64> {
    sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM users")
        .fetch_one(db)
        .await
}

pub async fn list<'e>(db: impl PgExecutor<'e>, limit: i64, offset: i64) -> sqlx::Result<Vec<User>> {
    sqlx::query_as::<_, User>(&format!(
        "SELECT {COLUMNS} FROM users ORDER BY created_at DESC LIMIT $1 OFFSET $2"
    ))
    .bind(limit)
    .bind(offset)
    .fetch_all(db)
    .await
}

pub async fn insert<'e>(db: impl PgExecutor<'e>, row: &NewUserRow<'_>) -> sqlx::Result<User> {
    sqlx::query_as::<_, User>(&format!(
        "INSERT INTO users (email, username, password_hash, name, role, moodle_user_id, moodle_username) \
         VALUES ($1, $2, $3, $4, $5, $6, $7) \
         RETURNING {COLUMNS}"
    ))
    .bind(row.email)
    .bind(row.username)
    .bind(row.password_hash)
    .bind(row.name)
    .bind(row.role)
    .bind(row.moodle_user_id)
    .bind(row.moodle_username)
    .fetch_one(db)
    .await
}

pub async fn update<'e>(db: impl PgExecutor<'e>, id: i32, patch: &UserPatch) -> sqlx::Result<User> {
    let mut qb = build_update(id, patch);
    qb.build_query_as::<User>().fetch_one(db).await
}

/// `UPDATE users SET <provided fields>, updated_at = now() WHERE id = …`.
fn build_update(id: i32, patch: &UserPatch) -> QueryBuilder<'static, Postgres> {
    let mut qb = QueryBuilder::new("UPDATE users SET ");
    {
        let mut sep = qb.separated(", ");
        if let Some(email) = &patch.email {
            sep.push("email = ").push_bind_unseparated(email.clone());
        }
        if let Some(username) = &patch.username {
            sep.push("username = ").push_bind_unseparated(username.clone());
        }
        if let Some(name) = &patch.name {
            sep.push("name = ").push_bind_unseparated(name.clone());
        }
        if let Some(role) = patch.role {
            sep.push("role = ").push_bind_unseparated(role);
        }
        if let Some(is_active) = patch.is_active {
            sep.push("is_active = ").push_bind_unseparated(is_active);
        }
        sep.push("updated_at = now()");
    }
    qb.push(" WHERE id = ");
    qb.push_bind(id);
    qb.push(format!(" RETURNING {COLUMNS}"));
    qb
}

pub async fn soft_delete<'e>(db: impl PgExecutor<'e>, id: i32) -> sqlx::Result<()> {
    sqlx::query("UPDATE users SET is_active = false, updated_at = now() WHERE id = $1")
        .bind(id)
        .execute(db)
        .await?;
    Ok(())
}

pub async fn set_moodle_link<'e>(
    db: impl PgExecutor<'e>,
    id: i32,
    moodle_user_id: i32,
    moodle_username: &str,
) -> sqlx::Result<User> {
    sqlx::query_as::<_, User>(&format!(
        "UPDATE users SET moodle_user_id = $1, moodle_username = $2, updated_at = now() \
         WHERE id = $3 RETURNING {COLUMNS}"
    ))
    .bind(moodle_user_id)
    .bind(moodle_username)
    .bind(id)
    .fetch_one(db)
    .await
}
