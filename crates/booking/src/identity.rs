//! Identity/profile collaborator
//!
//! Read-only view of users: role, guardian-child relationships, date of
//! birth, contact details, and the gateway billing-identity reference.
//! Profile CRUD itself lives outside this engine; the only write this
//! seam allows is persisting a lazily created billing reference.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::PgPool;
use time::Date;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{BookingError, BookingResult};
use crate::model::{Profile, Role};

#[async_trait]
pub trait IdentityDirectory: Send + Sync {
    async fn profile(&self, user_id: Uuid) -> BookingResult<Profile>;

    /// Guardian of a student, if one exists.
    async fn guardian_of(&self, student_id: Uuid) -> BookingResult<Option<Profile>>;

    /// Persist the billing identity created for a payer on first payment.
    async fn set_billing_ref(&self, user_id: Uuid, billing_ref: &str) -> BookingResult<()>;
}

// ---------------------------------------------------------------------------
// Postgres implementation
// ---------------------------------------------------------------------------

#[derive(Debug, sqlx::FromRow)]
struct ProfileRow {
    id: Uuid,
    role: String,
    full_name: String,
    email: String,
    date_of_birth: Option<Date>,
    billing_ref: Option<String>,
}

impl ProfileRow {
    fn into_profile(self, children: Vec<Uuid>) -> BookingResult<Profile> {
        let role = Role::from_str(&self.role)
            .ok_or_else(|| BookingError::Database(format!("unknown role '{}'", self.role)))?;
        Ok(Profile {
            id: self.id,
            role,
            full_name: self.full_name,
            email: self.email,
            date_of_birth: self.date_of_birth,
            children,
            billing_ref: self.billing_ref,
        })
    }
}

#[derive(Clone)]
pub struct PgIdentityDirectory {
    pool: PgPool,
}

impl PgIdentityDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn children_of(&self, guardian_id: Uuid) -> BookingResult<Vec<Uuid>> {
        let rows: Vec<(Uuid,)> =
            sqlx::query_as("SELECT student_id FROM guardian_children WHERE guardian_id = $1")
                .bind(guardian_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }
}

#[async_trait]
impl IdentityDirectory for PgIdentityDirectory {
    async fn profile(&self, user_id: Uuid) -> BookingResult<Profile> {
        let row: Option<ProfileRow> = sqlx::query_as(
            r#"
            SELECT id, role, full_name, email, date_of_birth, billing_ref
            FROM users
            WHERE id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        let row = row.ok_or(BookingError::ProfileNotFound(user_id))?;
        let children = self.children_of(user_id).await?;
        row.into_profile(children)
    }

    async fn guardian_of(&self, student_id: Uuid) -> BookingResult<Option<Profile>> {
        let row: Option<ProfileRow> = sqlx::query_as(
            r#"
            SELECT u.id, u.role, u.full_name, u.email, u.date_of_birth, u.billing_ref
            FROM users u
            JOIN guardian_children gc ON gc.guardian_id = u.id
            WHERE gc.student_id = $1
            LIMIT 1
            "#,
        )
        .bind(student_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let children = self.children_of(row.id).await?;
                Ok(Some(row.into_profile(children)?))
            }
            None => Ok(None),
        }
    }

    async fn set_billing_ref(&self, user_id: Uuid, billing_ref: &str) -> BookingResult<()> {
        // Keep the first reference if a concurrent first-time payment
        // already created one; duplicate billing identities are worse
        // than a lost write here
        let result = sqlx::query(
            r#"
            UPDATE users
            SET billing_ref = $2
            WHERE id = $1 AND billing_ref IS NULL
            "#,
        )
        .bind(user_id)
        .bind(billing_ref)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            tracing::debug!(
                user_id = %user_id,
                "Billing reference already set, keeping the existing one"
            );
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

/// In-memory directory for tests and local development.
#[derive(Clone, Default)]
pub struct MemoryIdentityDirectory {
    profiles: Arc<Mutex<HashMap<Uuid, Profile>>>,
}

impl MemoryIdentityDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn upsert(&self, profile: Profile) {
        self.profiles.lock().await.insert(profile.id, profile);
    }
}

#[async_trait]
impl IdentityDirectory for MemoryIdentityDirectory {
    async fn profile(&self, user_id: Uuid) -> BookingResult<Profile> {
        self.profiles
            .lock()
            .await
            .get(&user_id)
            .cloned()
            .ok_or(BookingError::ProfileNotFound(user_id))
    }

    async fn guardian_of(&self, student_id: Uuid) -> BookingResult<Option<Profile>> {
        Ok(self
            .profiles
            .lock()
            .await
            .values()
            .find(|p| p.is_guardian_of(student_id))
            .cloned())
    }

    async fn set_billing_ref(&self, user_id: Uuid, billing_ref: &str) -> BookingResult<()> {
        let mut profiles = self.profiles.lock().await;
        let profile = profiles
            .get_mut(&user_id)
            .ok_or(BookingError::ProfileNotFound(user_id))?;
        if profile.billing_ref.is_none() {
            profile.billing_ref = Some(billing_ref.to_string());
        }
        Ok(())
    }
}
