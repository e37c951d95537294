use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Duration, Utc};
use cuid2::CuidConstructor;
use lendahand_config::AuthConfig;
use lendahand_realtime::{Identity, IdentityVerifier, StoreError};
use once_cell::sync::Lazy;
use rand::RngCore;
use serde::Serialize;
use sqlx::{Row, SqlitePool, Transaction};
use thiserror::Error;
use tracing::info;

static CUID: Lazy<CuidConstructor> = Lazy::new(CuidConstructor::new);

/// Verifies bearer tokens against the sessions table and provisions users.
///
/// Token issuance is deliberately narrow: sessions are minted by the seed
/// command and by tests, there is no login flow in this service.
#[derive(Clone)]
pub struct Authenticator {
    pool: SqlitePool,
    session_ttl: Duration,
}

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("user already exists")]
    UserExists,
    #[error("unknown session token")]
    InvalidToken,
    #[error("session expired")]
    SessionExpired,
    #[error("invalid session record")]
    InvalidSession,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, Clone, Serialize)]
pub struct User {
    #[serde(skip_serializing)]
    pub id: i64,
    pub public_id: String,
    pub email: String,
    pub display_name: String,
}

#[derive(Debug, Clone)]
pub struct AuthSession {
    pub token: String,
    pub user_id: i64,
    pub expires_at: DateTime<Utc>,
}

impl Authenticator {
    pub fn new(pool: SqlitePool, config: AuthConfig) -> Self {
        let session_ttl = Duration::seconds(config.session_ttl_seconds as i64);

        Self { pool, session_ttl }
    }

    pub fn pool(&self) -> SqlitePool {
        self.pool.clone()
    }

    pub async fn create_user(&self, email: &str, display_name: &str) -> Result<User, IdentityError> {
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query("SELECT id FROM users WHERE email = ?")
            .bind(email)
            .fetch_optional(&mut *tx)
            .await?;

        if existing.is_some() {
            return Err(IdentityError::UserExists);
        }

        let user = self.insert_user(&mut tx, email, display_name).await?;
        tx.commit().await?;

        info!(user = %user.public_id, "created user");
        Ok(user)
    }

    /// Issue a fresh session for an existing user, honouring the configured
    /// TTL.
    pub async fn mint_session(&self, user_id: i64) -> Result<AuthSession, IdentityError> {
        let token = self.generate_session_token();
        let now = Utc::now();
        let expires_at = now + self.session_ttl;

        sqlx::query(
            "INSERT INTO sessions (user_id, token, created_at, expires_at) VALUES (?, ?, ?, ?)",
        )
        .bind(user_id)
        .bind(&token)
        .bind(now.to_rfc3339())
        .bind(expires_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(AuthSession {
            token,
            user_id,
            expires_at,
        })
    }

    /// Resolve a bearer token to the identity behind it. Expired sessions
    /// are deleted on sight.
    pub async fn verify_token(&self, token: &str) -> Result<Identity, IdentityError> {
        let row = sqlx::query("SELECT user_id, expires_at FROM sessions WHERE token = ?")
            .bind(token)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Err(IdentityError::InvalidToken);
        };

        let user_id: i64 = row.try_get("user_id")?;
        let expires_at: String = row.try_get("expires_at")?;

        let expires_at = DateTime::parse_from_rfc3339(&expires_at)
            .map_err(|_| IdentityError::InvalidSession)?
            .with_timezone(&Utc);

        if expires_at <= Utc::now() {
            sqlx::query("DELETE FROM sessions WHERE token = ?")
                .bind(token)
                .execute(&self.pool)
                .await?;
            return Err(IdentityError::SessionExpired);
        }

        self.fetch_identity(user_id).await
    }

    pub async fn user_profile(&self, user_id: i64) -> Result<User, IdentityError> {
        let row = sqlx::query("SELECT id, public_id, email, display_name FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await?;

        Ok(User {
            id: row.try_get("id")?,
            public_id: row.try_get("public_id")?,
            email: row.try_get("email")?,
            display_name: row.try_get("display_name")?,
        })
    }

    async fn insert_user(
        &self,
        tx: &mut Transaction<'_, sqlx::Sqlite>,
        email: &str,
        display_name: &str,
    ) -> Result<User, IdentityError> {
        let now = Utc::now().to_rfc3339();
        let public_id = new_public_id();

        sqlx::query(
            "INSERT INTO users (public_id, email, display_name, created_at, updated_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&public_id)
        .bind(email)
        .bind(display_name)
        .bind(&now)
        .bind(&now)
        .execute(&mut **tx)
        .await?;

        let row = sqlx::query("SELECT id FROM users WHERE public_id = ?")
            .bind(&public_id)
            .fetch_one(&mut **tx)
            .await?;

        Ok(User {
            id: row.try_get("id")?,
            public_id,
            email: email.to_owned(),
            display_name: display_name.to_owned(),
        })
    }

    async fn fetch_identity(&self, user_id: i64) -> Result<Identity, IdentityError> {
        let row = sqlx::query("SELECT public_id, display_name FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await?;

        Ok(Identity {
            user_id,
            public_id: row.try_get("public_id")?,
            display_name: row.try_get("display_name")?,
        })
    }

    fn generate_session_token(&self) -> String {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        URL_SAFE_NO_PAD.encode(bytes)
    }
}

impl IdentityVerifier for Authenticator {
    async fn verify(&self, token: &str) -> Result<Option<Identity>, StoreError> {
        match self.verify_token(token).await {
            Ok(identity) => Ok(Some(identity)),
            Err(
                IdentityError::InvalidToken
                | IdentityError::SessionExpired
                | IdentityError::InvalidSession,
            ) => Ok(None),
            Err(err) => Err(StoreError::Unavailable(err.to_string())),
        }
    }
}

fn new_public_id() -> String {
    CUID.create_id()
}
