use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

/// The identity a request belongs to: a signed-in user or an anonymous
/// session, never both.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Owner {
    User(String),
    Anonymous(String),
}

impl Owner {
    pub fn user_id(&self) -> Option<&str> {
        match self {
            Owner::User(id) => Some(id),
            Owner::Anonymous(_) => None,
        }
    }

    pub fn anonymous_id(&self) -> Option<&str> {
        match self {
            Owner::User(_) => None,
            Owner::Anonymous(id) => Some(id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Draft,
    LyricsReady,
    Generating,
    Delivered,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Draft => "draft",
            RequestStatus::LyricsReady => "lyrics_ready",
            RequestStatus::Generating => "generating",
            RequestStatus::Delivered => "delivered",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "lyrics_ready" => RequestStatus::LyricsReady,
            "generating" => RequestStatus::Generating,
            "delivered" => RequestStatus::Delivered,
            _ => RequestStatus::Draft,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SongRequest {
    pub id: String,
    pub user_id: Option<String>,
    pub anonymous_id: Option<String>,
    pub recipient_name: String,
    pub occasion: String,
    pub languages: Vec<String>,
    pub mood: Option<String>,
    pub story: String,
    pub status: RequestStatus,
    pub approved_draft_id: Option<String>,
    pub paid: bool,
    pub created_at: String,
    pub updated_at: String,
}

impl SongRequest {
    pub fn owned_by(&self, owner: &Owner) -> bool {
        match owner {
            Owner::User(id) => self.user_id.as_deref() == Some(id),
            Owner::Anonymous(id) => self.anonymous_id.as_deref() == Some(id),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SongRequestCreate {
    pub recipient_name: String,
    pub occasion: String,
    #[serde(default)]
    pub languages: Vec<String>,
    pub mood: Option<String>,
    pub story: String,
}

/// Who produced a lyrics draft version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DraftSource {
    Llm,
    User,
}

impl DraftSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            DraftSource::Llm => "llm",
            DraftSource::User => "user",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "user" => DraftSource::User,
            _ => DraftSource::Llm,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LyricsDraft {
    pub id: String,
    pub request_id: String,
    pub version: i64,
    pub content: String,
    pub source: DraftSource,
    pub created_at: String,
}

type RequestRow = (
    String,
    Option<String>,
    Option<String>,
    String,
    String,
    String,
    Option<String>,
    String,
    String,
    Option<String>,
    i64,
    String,
    String,
);

fn request_from_row(row: RequestRow) -> SongRequest {
    let (
        id,
        user_id,
        anonymous_id,
        recipient_name,
        occasion,
        languages,
        mood,
        story,
        status,
        approved_draft_id,
        paid,
        created_at,
        updated_at,
    ) = row;

    SongRequest {
        id,
        user_id,
        anonymous_id,
        recipient_name,
        occasion,
        languages: serde_json::from_str(&languages).unwrap_or_default(),
        mood,
        story,
        status: RequestStatus::from_str(&status),
        approved_draft_id,
        paid: paid != 0,
        created_at,
        updated_at,
    }
}

const REQUEST_COLUMNS: &str = "id, user_id, anonymous_id, recipient_name, occasion, languages, \
     mood, story, status, approved_draft_id, paid, created_at, updated_at";

#[derive(Clone)]
pub struct RequestStore {
    pool: SqlitePool,
}

impl RequestStore {
    /// Create the store and its tables.
    pub async fn new(pool: SqlitePool) -> Result<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS song_requests (
                id TEXT PRIMARY KEY,
                user_id TEXT,
                anonymous_id TEXT,
                recipient_name TEXT NOT NULL,
                occasion TEXT NOT NULL,
                languages TEXT NOT NULL,
                mood TEXT,
                story TEXT NOT NULL,
                status TEXT NOT NULL,
                approved_draft_id TEXT,
                paid INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await
        .context("Failed to create song_requests table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS lyrics_drafts (
                id TEXT PRIMARY KEY,
                request_id TEXT NOT NULL,
                version INTEGER NOT NULL,
                content TEXT NOT NULL,
                source TEXT NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE (request_id, version),
                FOREIGN KEY (request_id) REFERENCES song_requests(id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(&pool)
        .await
        .context("Failed to create lyrics_drafts table")?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_lyrics_drafts_request_id
            ON lyrics_drafts(request_id)
            "#,
        )
        .execute(&pool)
        .await
        .context("Failed to create drafts index")?;

        Ok(Self { pool })
    }

    pub async fn create(&self, owner: &Owner, create: SongRequestCreate) -> Result<SongRequest> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = chrono::Utc::now().to_rfc3339();
        let languages = serde_json::to_string(&create.languages)?;

        sqlx::query(
            r#"
            INSERT INTO song_requests
                (id, user_id, anonymous_id, recipient_name, occasion, languages,
                 mood, story, status, approved_draft_id, paid, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, NULL, 0, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(owner.user_id())
        .bind(owner.anonymous_id())
        .bind(&create.recipient_name)
        .bind(&create.occasion)
        .bind(&languages)
        .bind(&create.mood)
        .bind(&create.story)
        .bind(RequestStatus::Draft.as_str())
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .context("Failed to insert song request")?;

        Ok(SongRequest {
            id,
            user_id: owner.user_id().map(str::to_string),
            anonymous_id: owner.anonymous_id().map(str::to_string),
            recipient_name: create.recipient_name,
            occasion: create.occasion,
            languages: create.languages,
            mood: create.mood,
            story: create.story,
            status: RequestStatus::Draft,
            approved_draft_id: None,
            paid: false,
            created_at: now.clone(),
            updated_at: now,
        })
    }

    pub async fn get(&self, id: &str) -> Result<Option<SongRequest>> {
        let row = sqlx::query_as::<_, RequestRow>(&format!(
            "SELECT {} FROM song_requests WHERE id = ?",
            REQUEST_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch song request")?;

        Ok(row.map(request_from_row))
    }

    /// List an owner's requests, newest first, optionally filtered by a
    /// case-insensitive substring over recipient, occasion, and story.
    pub async fn list_for_owner(&self, owner: &Owner, q: Option<&str>) -> Result<Vec<SongRequest>> {
        let (column, owner_id) = match owner {
            Owner::User(id) => ("user_id", id.as_str()),
            Owner::Anonymous(id) => ("anonymous_id", id.as_str()),
        };

        let rows = if let Some(q) = q.filter(|q| !q.trim().is_empty()) {
            let pattern = format!("%{}%", q.trim().to_lowercase());
            sqlx::query_as::<_, RequestRow>(&format!(
                r#"
                SELECT {} FROM song_requests
                WHERE {} = ?
                  AND (LOWER(recipient_name) LIKE ?
                       OR LOWER(occasion) LIKE ?
                       OR LOWER(story) LIKE ?)
                ORDER BY created_at DESC
                "#,
                REQUEST_COLUMNS, column
            ))
            .bind(owner_id)
            .bind(&pattern)
            .bind(&pattern)
            .bind(&pattern)
            .fetch_all(&self.pool)
            .await
        } else {
            sqlx::query_as::<_, RequestRow>(&format!(
                "SELECT {} FROM song_requests WHERE {} = ? ORDER BY created_at DESC",
                REQUEST_COLUMNS, column
            ))
            .bind(owner_id)
            .fetch_all(&self.pool)
            .await
        }
        .context("Failed to list song requests")?;

        Ok(rows.into_iter().map(request_from_row).collect())
    }

    pub async fn set_status(&self, id: &str, status: RequestStatus) -> Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        sqlx::query("UPDATE song_requests SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(&now)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to update request status")?;
        Ok(())
    }

    pub async fn mark_paid(&self, id: &str) -> Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        sqlx::query("UPDATE song_requests SET paid = 1, updated_at = ? WHERE id = ?")
            .bind(&now)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to mark request paid")?;
        Ok(())
    }

    /// Append a new draft version. Versions only ever grow; edits never
    /// overwrite a stored version.
    pub async fn add_draft(
        &self,
        request_id: &str,
        content: String,
        source: DraftSource,
    ) -> Result<LyricsDraft> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = chrono::Utc::now().to_rfc3339();

        let version = sqlx::query_scalar::<_, Option<i64>>(
            "SELECT MAX(version) FROM lyrics_drafts WHERE request_id = ?",
        )
        .bind(request_id)
        .fetch_one(&self.pool)
        .await
        .context("Failed to read draft versions")?
        .unwrap_or(0)
            + 1;

        sqlx::query(
            r#"
            INSERT INTO lyrics_drafts (id, request_id, version, content, source, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(request_id)
        .bind(version)
        .bind(&content)
        .bind(source.as_str())
        .bind(&now)
        .execute(&self.pool)
        .await
        .context("Failed to insert lyrics draft")?;

        Ok(LyricsDraft {
            id,
            request_id: request_id.to_string(),
            version,
            content,
            source,
            created_at: now,
        })
    }

    pub async fn list_drafts(&self, request_id: &str) -> Result<Vec<LyricsDraft>> {
        let rows = sqlx::query_as::<_, (String, String, i64, String, String, String)>(
            r#"
            SELECT id, request_id, version, content, source, created_at
            FROM lyrics_drafts
            WHERE request_id = ?
            ORDER BY version
            "#,
        )
        .bind(request_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list lyrics drafts")?;

        Ok(rows
            .into_iter()
            .map(|(id, request_id, version, content, source, created_at)| LyricsDraft {
                id,
                request_id,
                version,
                content,
                source: DraftSource::from_str(&source),
                created_at,
            })
            .collect())
    }

    pub async fn get_draft(&self, draft_id: &str) -> Result<Option<LyricsDraft>> {
        let row = sqlx::query_as::<_, (String, String, i64, String, String, String)>(
            r#"
            SELECT id, request_id, version, content, source, created_at
            FROM lyrics_drafts
            WHERE id = ?
            "#,
        )
        .bind(draft_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch lyrics draft")?;

        Ok(row.map(
            |(id, request_id, version, content, source, created_at)| LyricsDraft {
                id,
                request_id,
                version,
                content,
                source: DraftSource::from_str(&source),
                created_at,
            },
        ))
    }

    /// Approve a draft for generation. The draft must belong to the request.
    pub async fn approve_draft(&self, request_id: &str, draft_id: &str) -> Result<bool> {
        let belongs = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM lyrics_drafts WHERE id = ? AND request_id = ?",
        )
        .bind(draft_id)
        .bind(request_id)
        .fetch_one(&self.pool)
        .await
        .context("Failed to check draft ownership")?;

        if belongs == 0 {
            return Ok(false);
        }

        let now = chrono::Utc::now().to_rfc3339();
        sqlx::query(
            r#"
            UPDATE song_requests
            SET approved_draft_id = ?, status = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(draft_id)
        .bind(RequestStatus::LyricsReady.as_str())
        .bind(&now)
        .bind(request_id)
        .execute(&self.pool)
        .await
        .context("Failed to approve draft")?;

        Ok(true)
    }
}
