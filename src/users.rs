use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnonymousUser {
    pub id: String,
    pub created_at: String,
}

#[derive(Clone)]
pub struct UserStore {
    pool: SqlitePool,
}

impl UserStore {
    /// Create the store and its tables.
    pub async fn new(pool: SqlitePool) -> Result<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                email TEXT NOT NULL UNIQUE,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await
        .context("Failed to create users table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS anonymous_users (
                id TEXT PRIMARY KEY,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await
        .context("Failed to create anonymous_users table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS otp_codes (
                email TEXT PRIMARY KEY,
                code_hash TEXT NOT NULL,
                expires_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await
        .context("Failed to create otp_codes table")?;

        Ok(Self { pool })
    }

    /// Find a user by email, creating the row on first sign-in.
    pub async fn create_or_get_user(&self, email: &str) -> Result<User> {
        if let Some(user) = self.find_by_email(email).await? {
            return Ok(user);
        }

        let id = uuid::Uuid::new_v4().to_string();
        let now = chrono::Utc::now().to_rfc3339();

        // A concurrent verify for the same address may have inserted first.
        sqlx::query(
            r#"
            INSERT INTO users (id, email, created_at)
            VALUES (?, ?, ?)
            ON CONFLICT(email) DO NOTHING
            "#,
        )
        .bind(&id)
        .bind(email)
        .bind(&now)
        .execute(&self.pool)
        .await
        .context("Failed to insert user")?;

        self.find_by_email(email)
            .await?
            .ok_or_else(|| anyhow::anyhow!("User vanished after insert: {}", email))
    }

    pub async fn find_by_email(&self, email: &str) -> Result<Option<User>> {
        let row = sqlx::query_as::<_, (String, String, String)>(
            "SELECT id, email, created_at FROM users WHERE email = ?",
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch user by email")?;

        Ok(row.map(|(id, email, created_at)| User {
            id,
            email,
            created_at,
        }))
    }

    pub async fn get_user(&self, id: &str) -> Result<Option<User>> {
        let row = sqlx::query_as::<_, (String, String, String)>(
            "SELECT id, email, created_at FROM users WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch user")?;

        Ok(row.map(|(id, email, created_at)| User {
            id,
            email,
            created_at,
        }))
    }

    /// Mint a new anonymous session.
    pub async fn create_anonymous(&self) -> Result<AnonymousUser> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = chrono::Utc::now().to_rfc3339();

        sqlx::query("INSERT INTO anonymous_users (id, created_at) VALUES (?, ?)")
            .bind(&id)
            .bind(&now)
            .execute(&self.pool)
            .await
            .context("Failed to insert anonymous user")?;

        Ok(AnonymousUser {
            id,
            created_at: now,
        })
    }

    pub async fn get_anonymous(&self, id: &str) -> Result<Option<AnonymousUser>> {
        let row = sqlx::query_as::<_, (String, String)>(
            "SELECT id, created_at FROM anonymous_users WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch anonymous user")?;

        Ok(row.map(|(id, created_at)| AnonymousUser { id, created_at }))
    }

    /// Store a hashed one-time code for an address. One active code per
    /// email; a new request replaces the old code.
    pub async fn store_otp(&self, email: &str, code_hash: &str, expires_at: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO otp_codes (email, code_hash, expires_at)
            VALUES (?, ?, ?)
            ON CONFLICT(email) DO UPDATE SET
                code_hash = excluded.code_hash,
                expires_at = excluded.expires_at
            "#,
        )
        .bind(email)
        .bind(code_hash)
        .bind(expires_at)
        .execute(&self.pool)
        .await
        .context("Failed to store OTP code")?;

        Ok(())
    }

    /// Verify and consume a one-time code. The row is deleted on success so
    /// a code can never be replayed.
    pub async fn consume_otp(&self, email: &str, code_hash: &str) -> Result<bool> {
        let row = sqlx::query_as::<_, (String, String)>(
            "SELECT code_hash, expires_at FROM otp_codes WHERE email = ?",
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch OTP code")?;

        let Some((stored_hash, expires_at)) = row else {
            return Ok(false);
        };

        let now = chrono::Utc::now().to_rfc3339();
        if stored_hash != code_hash || expires_at < now {
            return Ok(false);
        }

        sqlx::query("DELETE FROM otp_codes WHERE email = ?")
            .bind(email)
            .execute(&self.pool)
            .await
            .context("Failed to delete consumed OTP code")?;

        Ok(true)
    }
}
