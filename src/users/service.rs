use lazy_static::lazy_static;
use regex::Regex;
use sqlx::PgPool;
use tracing::{info, warn};

use crate::error::UserError;
use crate::moodle::{MoodleClient, MoodleUserPatch, NewMoodleUser};
use crate::users::password::{generate_one_time_password, hash_password};
use crate::users::repo::{self, NewUserRow, User, UserPatch, UserRole};

pub(crate) fn is_valid_email(email: &str) -> bool {
    lazy_static! {
        static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
    }
    EMAIL_RE.is_match(email)
}

/// Moodle keeps first and last name separately; the local store keeps one
/// display name. First whitespace token becomes the firstname, the remainder
/// the lastname, and a single-token name is used for both.
pub(crate) fn split_name(name: &str) -> (String, String) {
    let trimmed = name.trim();
    let mut parts = trimmed.split_whitespace();
    let firstname = match parts.next() {
        Some(first) => first.to_string(),
        None => trimmed.to_string(),
    };
    let rest = parts.collect::<Vec<_>>().join(" ");
    let lastname = if rest.is_empty() {
        trimmed.to_string()
    } else {
        rest
    };
    (firstname, lastname)
}

#[derive(Debug)]
pub struct CreateUserInput {
    pub email: String,
    pub username: String,
    pub password: String,
    pub name: String,
    pub role: UserRole,
    pub sync_to_moodle: bool,
}

/// What happened to the LMS mirror during `create_user`; the API layer words
/// its response message from this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    NotRequested,
    Synced,
    Failed,
}

pub async fn list_users(
    db: &PgPool,
    limit: i64,
    offset: i64,
) -> Result<(Vec<User>, i64), UserError> {
    let total = repo::count_all(db).await?;
    let users = repo::list(db, limit, offset).await?;
    Ok((users, total))
}

pub async fn get_user(db: &PgPool, id: i32) -> Result<Option<User>, UserError> {
    Ok(repo::find_by_id(db, id).await?)
}

/// Create a local account, optionally mirroring it into Moodle first.
/// The LMS call is best-effort: its failure downgrades the outcome but never
/// blocks the local insert.
pub async fn create_user(
    db: &PgPool,
    moodle: &dyn MoodleClient,
    input: CreateUserInput,
) -> Result<(User, SyncOutcome), UserError> {
    let mut tx = db.begin().await?;

    if repo::find_by_email(&mut *tx, &input.email).await?.is_some() {
        return Err(UserError::DuplicateEmail);
    }

    let password_hash =
        hash_password(&input.password).map_err(|e| UserError::Password(e.to_string()))?;
    let (firstname, lastname) = split_name(&input.name);

    let mut moodle_user_id = None;
    let mut moodle_username = None;
    let mut outcome = SyncOutcome::NotRequested;

    if input.sync_to_moodle {
        let remote = NewMoodleUser {
            username: input.username.clone(),
            password: input.password.clone(),
            firstname,
            lastname,
            email: input.email.clone(),
        };
        match moodle.create_user(&remote).await {
            Ok(remote_id) => {
                info!(moodle_user_id = remote_id, username = %input.username, "user synced to moodle");
                moodle_user_id = Some(remote_id);
                moodle_username = Some(input.username.clone());
                outcome = SyncOutcome::Synced;
            }
            Err(e) => {
                warn!(error = %e, username = %input.username, "moodle sync failed; creating local account anyway");
                outcome = SyncOutcome::Failed;
            }
        }
    }

    let row = NewUserRow {
        email: &input.email,
        username: &input.username,
        password_hash: &password_hash,
        name: &input.name,
        role: input.role,
        moodle_user_id,
        moodle_username: moodle_username.as_deref(),
    };
    let user = repo::insert(&mut *tx, &row)
        .await
        .map_err(map_unique_violation)?;

    tx.commit().await?;
    info!(user_id = user.id, email = %user.email, "user created");
    Ok((user, outcome))
}

/// Patch the provided fields only. When the account is linked and the patch
/// touches the mirrored profile (name/email), push a best-effort LMS update.
pub async fn update_user(
    db: &PgPool,
    moodle: &dyn MoodleClient,
    id: i32,
    patch: UserPatch,
) -> Result<User, UserError> {
    let mut tx = db.begin().await?;

    let existing = repo::find_by_id(&mut *tx, id)
        .await?
        .ok_or(UserError::NotFound)?;

    if patch.is_empty() {
        return Ok(existing);
    }

    let updated = repo::update(&mut *tx, id, &patch)
        .await
        .map_err(map_unique_violation)?;

    if let Some(moodle_id) = existing.moodle_user_id {
        if patch.touches_moodle_profile() {
            let name = patch.name.as_deref().unwrap_or(&existing.name);
            let (firstname, lastname) = split_name(name);
            let remote_patch = MoodleUserPatch {
                firstname: patch.name.is_some().then_some(firstname),
                lastname: patch.name.is_some().then_some(lastname),
                email: patch.email.clone(),
            };
            if moodle.update_user(moodle_id, &remote_patch).await {
                info!(user_id = id, moodle_user_id = moodle_id, "user updated in moodle");
            } else {
                warn!(user_id = id, moodle_user_id = moodle_id, "moodle update failed; local change kept");
            }
        }
    }

    tx.commit().await?;
    Ok(updated)
}

/// Soft delete: flips `is_active`, never removes the row. Linked accounts get
/// a best-effort suspend on the Moodle side.
pub async fn delete_user(db: &PgPool, moodle: &dyn MoodleClient, id: i32) -> Result<(), UserError> {
    let mut tx = db.begin().await?;

    let existing = repo::find_by_id(&mut *tx, id)
        .await?
        .ok_or(UserError::NotFound)?;

    repo::soft_delete(&mut *tx, id).await?;

    if let Some(moodle_id) = existing.moodle_user_id {
        if moodle.delete_user(moodle_id).await {
            info!(user_id = id, moodle_user_id = moodle_id, "user suspended in moodle");
        } else {
            warn!(user_id = id, moodle_user_id = moodle_id, "moodle delete failed; local soft delete kept");
        }
    }

    tx.commit().await?;
    info!(user_id = id, "user soft-deleted");
    Ok(())
}

/// Manual reconciliation. Linked accounts are updated in place; unlinked
/// accounts (or failed updates) fall back to a remote create using the given
/// password or a generated one-time credential. Fails only when both paths
/// fail. The local row is the source of truth; whatever linkage the LMS
/// reports afterwards is cached back into it.
pub async fn sync_user_to_moodle(
    db: &PgPool,
    moodle: &dyn MoodleClient,
    id: i32,
    password: Option<String>,
) -> Result<User, UserError> {
    let mut tx = db.begin().await?;

    let user = repo::find_by_id(&mut *tx, id)
        .await?
        .ok_or(UserError::NotFound)?;

    let (firstname, lastname) = split_name(&user.name);
    let mut linkage: Option<(i32, String)> = None;

    if let Some(moodle_id) = user.moodle_user_id {
        let remote_patch = MoodleUserPatch {
            firstname: Some(firstname.clone()),
            lastname: Some(lastname.clone()),
            email: Some(user.email.clone()),
        };
        if moodle.update_user(moodle_id, &remote_patch).await {
            info!(user_id = id, moodle_user_id = moodle_id, "existing moodle account updated");
            let username = user
                .moodle_username
                .clone()
                .unwrap_or_else(|| user.username.clone());
            linkage = Some((moodle_id, username));
        } else {
            warn!(user_id = id, moodle_user_id = moodle_id, "moodle update failed; falling back to create");
        }
    }

    let (moodle_id, moodle_username) = match linkage {
        Some(resolved) => resolved,
        None => {
            let sync_password = password.unwrap_or_else(generate_one_time_password);
            let remote = NewMoodleUser {
                username: user.username.clone(),
                password: sync_password,
                firstname,
                lastname,
                email: user.email.clone(),
            };
            match moodle.create_user(&remote).await {
                Ok(remote_id) => {
                    info!(user_id = id, moodle_user_id = remote_id, "moodle account created during sync");
                    (remote_id, user.username.clone())
                }
                Err(e) => return Err(UserError::SyncFailed(e.to_string())),
            }
        }
    };
    let updated = repo::set_moodle_link(&mut *tx, id, moodle_id, &moodle_username).await?;

    tx.commit().await?;
    Ok(updated)
}

/// Unique-constraint violations on email surface as the duplicate-user
/// condition instead of a bare database error.
fn map_unique_violation(e: sqlx::Error) -> UserError {
    if let sqlx::Error::Database(db_err) = &e {
        if db_err.constraint() == Some("users_email_key") {
            return UserError::DuplicateEmail;
        }
    }
    UserError::Database(e)
}


#[cfg(test)]
mod lifecycle_tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use sqlx::PgPool;

    use super::*;
    use crate::moodle::{ConnectionStatus, MoodleError, MoodleUserRef};

    /// LMS that refuses every call, as if the host were down.
    struct DownMoodle;

    #[async_trait]
    impl MoodleClient for DownMoodle {
        async fn create_user(&self, _new: &NewMoodleUser) -> Result<i32, MoodleError> {
            Err(MoodleError::Unreachable("http://moodle.invalid".into()))
        }
        async fn get_user_by_username(&self, _username: &str) -> Option<MoodleUserRef> {
            None
        }
        async fn update_user(&self, _id: i32, _patch: &MoodleUserPatch) -> bool {
            false
        }
        async fn delete_user(&self, _id: i32) -> bool {
            false
        }
        async fn test_connection(&self) -> ConnectionStatus {
            ConnectionStatus {
                success: false,
                message: "unreachable".into(),
            }
        }
    }

    /// LMS that accepts everything and counts account creations.
    struct LiveMoodle {
        remote_id: i32,
        creates: AtomicUsize,
    }

    impl LiveMoodle {
        fn new(remote_id: i32) -> Self {
            Self {
                remote_id,
                creates: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl MoodleClient for LiveMoodle {
        async fn create_user(&self, _new: &NewMoodleUser) -> Result<i32, MoodleError> {
            self.creates.fetch_add(1, Ordering::SeqCst);
            Ok(self.remote_id)
        }
        async fn get_user_by_username(&self, username: &str) -> Option<MoodleUserRef> {
            Some(MoodleUserRef {
                id: self.remote_id,
                username: username.to_string(),
            })
        }
        async fn update_user(&self, _id: i32, _patch: &MoodleUserPatch) -> bool {
            true
        }
        async fn delete_user(&self, _id: i32) -> bool {
            true
        }
        async fn test_connection(&self) -> ConnectionStatus {
            ConnectionStatus {
                success: true,
                message: "ok".into(),
            }
        }
    }

    fn input(email: &str, username: &str, sync_to_moodle: bool) -> CreateUserInput {
        CreateUserInput {
            email: email.into(),
            username: username.into(),
            password: "pw123456".into(),
            name: "Alice Wong".into(),
            role: UserRole::Student,
            sync_to_moodle,
        }
    }

    #[sqlx::test]
    async fn create_succeeds_locally_when_moodle_is_down(db: PgPool) {
        let (user, outcome) = create_user(&db, &DownMoodle, input("a@x.com", "alice", true))
            .await
            .expect("local create must not depend on the LMS");

        assert_eq!(outcome, SyncOutcome::Failed);
        assert_eq!(user.moodle_user_id, None);
        assert_eq!(user.moodle_username, None);
        assert!(user.is_active);

        let stored = repo::find_by_id(&db, user.id).await.unwrap().unwrap();
        assert_eq!(stored.email, "a@x.com");
    }

    #[sqlx::test]
    async fn create_persists_linkage_when_sync_succeeds(db: PgPool) {
        let moodle = LiveMoodle::new(42);
        let (user, outcome) = create_user(&db, &moodle, input("a@x.com", "alice", true))
            .await
            .expect("create");

        assert_eq!(outcome, SyncOutcome::Synced);
        assert_eq!(user.moodle_user_id, Some(42));
        assert_eq!(user.moodle_username.as_deref(), Some("alice"));
    }

    #[sqlx::test]
    async fn create_rejects_duplicate_email_regardless_of_username(db: PgPool) {
        create_user(&db, &DownMoodle, input("a@x.com", "alice", false))
            .await
            .expect("first create");

        let err = create_user(&db, &DownMoodle, input("a@x.com", "bob", false))
            .await
            .unwrap_err();
        assert!(matches!(err, UserError::DuplicateEmail));
    }

    #[sqlx::test]
    async fn partial_update_preserves_untouched_fields(db: PgPool) {
        let (user, _) = create_user(&db, &DownMoodle, input("a@x.com", "alice", false))
            .await
            .expect("create");

        let patch = UserPatch {
            name: Some("Alice Chen".into()),
            ..Default::default()
        };
        let updated = update_user(&db, &DownMoodle, user.id, patch)
            .await
            .expect("update");

        assert_eq!(updated.name, "Alice Chen");
        assert_eq!(updated.email, user.email);
        assert_eq!(updated.username, user.username);
        assert_eq!(updated.role, user.role);
        assert_eq!(updated.is_active, user.is_active);
        assert!(updated.updated_at >= user.updated_at);
    }

    #[sqlx::test]
    async fn linked_mutations_survive_moodle_outage(db: PgPool) {
        let (user, _) = create_user(&db, &DownMoodle, input("a@x.com", "alice", false))
            .await
            .expect("create");
        repo::set_moodle_link(&db, user.id, 55, "alice")
            .await
            .expect("link");

        let patch = UserPatch {
            email: Some("new@x.com".into()),
            ..Default::default()
        };
        let updated = update_user(&db, &DownMoodle, user.id, patch)
            .await
            .expect("update despite LMS outage");
        assert_eq!(updated.email, "new@x.com");
        assert_eq!(updated.moodle_user_id, Some(55));

        delete_user(&db, &DownMoodle, user.id)
            .await
            .expect("delete despite LMS outage");
        let row = repo::find_by_id(&db, user.id).await.unwrap().unwrap();
        assert!(!row.is_active);
    }

    #[sqlx::test]
    async fn soft_delete_is_idempotent_and_retains_the_row(db: PgPool) {
        let (user, _) = create_user(&db, &DownMoodle, input("a@x.com", "alice", false))
            .await
            .expect("create");

        delete_user(&db, &DownMoodle, user.id)
            .await
            .expect("first delete");
        delete_user(&db, &DownMoodle, user.id)
            .await
            .expect("second delete");

        let row = repo::find_by_id(&db, user.id).await.unwrap().unwrap();
        assert!(!row.is_active);
        assert_eq!(row.email, "a@x.com");
    }

    #[sqlx::test]
    async fn sync_creates_once_then_updates_in_place(db: PgPool) {
        let (user, _) = create_user(&db, &DownMoodle, input("a@x.com", "alice", false))
            .await
            .expect("create");
        let moodle = LiveMoodle::new(77);

        let first = sync_user_to_moodle(&db, &moodle, user.id, None)
            .await
            .expect("first sync");
        assert_eq!(first.moodle_user_id, Some(77));
        assert_eq!(first.moodle_username.as_deref(), Some("alice"));

        let second = sync_user_to_moodle(&db, &moodle, user.id, None)
            .await
            .expect("second sync");
        assert_eq!(second.moodle_user_id, Some(77));

        // Linked accounts are updated in place, not re-created.
        assert_eq!(moodle.creates.load(Ordering::SeqCst), 1);
    }

    #[sqlx::test]
    async fn sync_fails_only_when_update_and_create_both_fail(db: PgPool) {
        let (user, _) = create_user(&db, &DownMoodle, input("a@x.com", "alice", false))
            .await
            .expect("create");

        let err = sync_user_to_moodle(&db, &DownMoodle, user.id, None)
            .await
            .unwrap_err();
        assert!(matches!(err, UserError::SyncFailed(_)));

        let row = repo::find_by_id(&db, user.id).await.unwrap().unwrap();
        assert_eq!(row.moodle_user_id, None);
    }

    #[sqlx::test]
    async fn mutations_on_missing_id_return_not_found(db: PgPool) {
        let patch = UserPatch {
            name: Some("X".into()),
            ..Default::default()
        };
        assert!(matches!(
            update_user(&db, &DownMoodle, 9999, patch).await.unwrap_err(),
            UserError::NotFound
        ));
        assert!(matches!(
            delete_user(&db, &DownMoodle, 9999).await.unwrap_err(),
            UserError::NotFound
        ));
        assert!(matches!(
            sync_user_to_moodle(&db, &DownMoodle, 9999, None)
                .await
                .unwrap_err(),
            UserError::NotFound
        ));
    }

    #[sqlx::test]
    async fn pagination_returns_newest_first_with_full_total(db: PgPool) {
        for i in 0..3 {
            create_user(
                &db,
                &DownMoodle,
                input(&format!("u{i}@x.com"), &format!("user{i}"), false),
            )
            .await
            .expect("create");
        }

        let (page, total) = list_users(&db, 2, 0).await.expect("list");
        assert_eq!(page.len(), 2);
        assert_eq!(total, 3);
        assert!(page[0].created_at >= page[1].created_at);

        let (rest, total) = list_users(&db, 2, 2).await.expect("list offset");
        assert_eq!(rest.len(), 1);
        assert_eq!(total, 3);

        let (empty, total) = list_users(&db, 10, 50).await.expect("list out of range");
        assert!(empty.is_empty());
        assert_eq!(total, 3);
    }
}
