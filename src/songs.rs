use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

use crate::requests::Owner;
use crate::status::{promote, round_duration, SongStatus, VariantUpdate};

/// One generated audio candidate for a song.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SongVariant {
    pub variant_index: i64,
    pub provider_variant_id: Option<String>,
    pub title: Option<String>,
    pub stream_url: Option<String>,
    pub audio_url: Option<String>,
    pub image_url: Option<String>,
    pub duration_secs: Option<i64>,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Song {
    pub id: String,
    pub request_id: String,
    pub task_id: Option<String>,
    pub status: SongStatus,
    pub title: Option<String>,
    pub stream_url: Option<String>,
    pub audio_url: Option<String>,
    pub image_url: Option<String>,
    pub duration_secs: Option<i64>,
    pub error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub variants: Vec<SongVariant>,
}

impl Song {
    /// The best URL a client can play right now: final audio if present,
    /// preview stream otherwise.
    pub fn playable_url(&self) -> Option<&str> {
        self.audio_url.as_deref().or(self.stream_url.as_deref())
    }
}

type SongRow = (
    String,
    String,
    Option<String>,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<i64>,
    Option<String>,
    String,
    String,
);

const SONG_COLUMNS: &str = "id, request_id, task_id, status, title, stream_url, audio_url, \
     image_url, duration_secs, error, created_at, updated_at";

fn song_from_row(row: SongRow, variants: Vec<SongVariant>) -> Song {
    let (
        id,
        request_id,
        task_id,
        status,
        title,
        stream_url,
        audio_url,
        image_url,
        duration_secs,
        error,
        created_at,
        updated_at,
    ) = row;

    Song {
        id,
        request_id,
        task_id,
        status: SongStatus::from_str(&status),
        title,
        stream_url,
        audio_url,
        image_url,
        duration_secs,
        error,
        created_at,
        updated_at,
        variants,
    }
}

#[derive(Clone)]
pub struct SongStore {
    pool: SqlitePool,
}

impl SongStore {
    /// Create the store and its tables.
    pub async fn new(pool: SqlitePool) -> Result<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS songs (
                id TEXT PRIMARY KEY,
                request_id TEXT NOT NULL,
                task_id TEXT,
                status TEXT NOT NULL,
                title TEXT,
                stream_url TEXT,
                audio_url TEXT,
                image_url TEXT,
                duration_secs INTEGER,
                error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                FOREIGN KEY (request_id) REFERENCES song_requests(id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(&pool)
        .await
        .context("Failed to create songs table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS song_variants (
                song_id TEXT NOT NULL,
                variant_index INTEGER NOT NULL,
                provider_variant_id TEXT,
                title TEXT,
                stream_url TEXT,
                audio_url TEXT,
                image_url TEXT,
                duration_secs INTEGER,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (song_id, variant_index),
                FOREIGN KEY (song_id) REFERENCES songs(id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(&pool)
        .await
        .context("Failed to create song_variants table")?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_songs_task_id ON songs(task_id)
            "#,
        )
        .execute(&pool)
        .await
        .context("Failed to create songs task index")?;

        Ok(Self { pool })
    }

    /// Insert a pending song bound to a request and a provider task.
    pub async fn create_for_request(
        &self,
        request_id: &str,
        task_id: &str,
        title: Option<String>,
    ) -> Result<Song> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = chrono::Utc::now().to_rfc3339();

        sqlx::query(
            r#"
            INSERT INTO songs (id, request_id, task_id, status, title, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(request_id)
        .bind(task_id)
        .bind(SongStatus::Pending.as_str())
        .bind(&title)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .context("Failed to insert song")?;

        Ok(Song {
            id,
            request_id: request_id.to_string(),
            task_id: Some(task_id.to_string()),
            status: SongStatus::Pending,
            title,
            stream_url: None,
            audio_url: None,
            image_url: None,
            duration_secs: None,
            error: None,
            created_at: now.clone(),
            updated_at: now,
            variants: Vec::new(),
        })
    }

    pub async fn get(&self, id: &str) -> Result<Option<Song>> {
        let row = sqlx::query_as::<_, SongRow>(&format!(
            "SELECT {} FROM songs WHERE id = ?",
            SONG_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch song")?;

        match row {
            Some(row) => {
                let variants = self.get_variants(id).await?;
                Ok(Some(song_from_row(row, variants)))
            }
            None => Ok(None),
        }
    }

    /// Look up a song by its provider task id (webhook path).
    pub async fn find_by_task(&self, task_id: &str) -> Result<Option<Song>> {
        let row = sqlx::query_as::<_, SongRow>(&format!(
            "SELECT {} FROM songs WHERE task_id = ?",
            SONG_COLUMNS
        ))
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch song by task")?;

        match row {
            Some(row) => {
                let id = row.0.clone();
                let variants = self.get_variants(&id).await?;
                Ok(Some(song_from_row(row, variants)))
            }
            None => Ok(None),
        }
    }

    /// List an owner's songs across all of their requests, newest first.
    pub async fn list_for_owner(&self, owner: &Owner) -> Result<Vec<Song>> {
        let (column, owner_id) = match owner {
            Owner::User(id) => ("user_id", id.as_str()),
            Owner::Anonymous(id) => ("anonymous_id", id.as_str()),
        };

        let rows = sqlx::query_as::<_, SongRow>(&format!(
            r#"
            SELECT s.id, s.request_id, s.task_id, s.status, s.title, s.stream_url,
                   s.audio_url, s.image_url, s.duration_secs, s.error,
                   s.created_at, s.updated_at
            FROM songs s
            JOIN song_requests r ON s.request_id = r.id
            WHERE r.{} = ?
            ORDER BY s.created_at DESC
            "#,
            column
        ))
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list songs for owner")?;

        let mut songs = Vec::with_capacity(rows.len());
        for row in rows {
            let id = row.0.clone();
            let variants = self.get_variants(&id).await?;
            songs.push(song_from_row(row, variants));
        }
        Ok(songs)
    }

    pub async fn find_by_request(&self, request_id: &str) -> Result<Vec<Song>> {
        let rows = sqlx::query_as::<_, SongRow>(&format!(
            "SELECT {} FROM songs WHERE request_id = ? ORDER BY created_at DESC",
            SONG_COLUMNS
        ))
        .bind(request_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch songs for request")?;

        let mut songs = Vec::with_capacity(rows.len());
        for row in rows {
            let id = row.0.clone();
            let variants = self.get_variants(&id).await?;
            songs.push(song_from_row(row, variants));
        }
        Ok(songs)
    }

    async fn get_variants(&self, song_id: &str) -> Result<Vec<SongVariant>> {
        let rows = sqlx::query_as::<
            _,
            (
                i64,
                Option<String>,
                Option<String>,
                Option<String>,
                Option<String>,
                Option<String>,
                Option<i64>,
                String,
            ),
        >(
            r#"
            SELECT variant_index, provider_variant_id, title, stream_url,
                   audio_url, image_url, duration_secs, updated_at
            FROM song_variants
            WHERE song_id = ?
            ORDER BY variant_index
            "#,
        )
        .bind(song_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch song variants")?;

        Ok(rows
            .into_iter()
            .map(
                |(
                    variant_index,
                    provider_variant_id,
                    title,
                    stream_url,
                    audio_url,
                    image_url,
                    duration_secs,
                    updated_at,
                )| SongVariant {
                    variant_index,
                    provider_variant_id,
                    title,
                    stream_url,
                    audio_url,
                    image_url,
                    duration_secs,
                    updated_at,
                },
            )
            .collect())
    }

    /// Apply a provider update. This is the single write routine shared by
    /// the webhook handler and the poll handler.
    ///
    /// A song already stored `COMPLETE` is returned unchanged, so replayed
    /// webhook deliveries and concurrent polls are no-ops. Variants are
    /// upserted by `(song_id, variant_index)` and URL columns only ever fill
    /// in (a later payload that omits a URL does not erase it), so repeated
    /// deliveries of the same facts converge on the same row state.
    pub async fn apply_update(
        &self,
        song_id: &str,
        candidate: SongStatus,
        variants: &[VariantUpdate],
    ) -> Result<Option<Song>> {
        let Some(current) = self.get(song_id).await? else {
            return Ok(None);
        };

        if current.status == SongStatus::Complete {
            tracing::debug!("Song {} already complete, skipping update", song_id);
            return Ok(Some(current));
        }

        let now = chrono::Utc::now().to_rfc3339();

        for (index, variant) in variants.iter().enumerate() {
            let duration = variant.duration.map(|d| i64::from(round_duration(d)));
            sqlx::query(
                r#"
                INSERT INTO song_variants
                    (song_id, variant_index, provider_variant_id, title,
                     stream_url, audio_url, image_url, duration_secs, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(song_id, variant_index) DO UPDATE SET
                    provider_variant_id = COALESCE(excluded.provider_variant_id, provider_variant_id),
                    title = COALESCE(excluded.title, title),
                    stream_url = COALESCE(excluded.stream_url, stream_url),
                    audio_url = COALESCE(excluded.audio_url, audio_url),
                    image_url = COALESCE(excluded.image_url, image_url),
                    duration_secs = COALESCE(excluded.duration_secs, duration_secs),
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(song_id)
            .bind(index as i64)
            .bind(&variant.id)
            .bind(&variant.title)
            .bind(variant.stream_url())
            .bind(variant.download_url())
            .bind(variant.image_url.as_deref().filter(|s| !s.is_empty()))
            .bind(duration)
            .bind(&now)
            .execute(&self.pool)
            .await
            .context("Failed to upsert song variant")?;
        }

        // Recompute the song-level columns from the stored variants: the
        // first variant with a stream URL fills the song's stream URL, the
        // first with a final audio URL fills the download URL.
        let stored = self.get_variants(song_id).await?;
        let stream_url = stored.iter().find_map(|v| v.stream_url.clone());
        let audio_url = stored.iter().find_map(|v| v.audio_url.clone());
        let image_url = stored.iter().find_map(|v| v.image_url.clone());
        let duration_secs = stored.iter().find_map(|v| v.duration_secs);
        let title = stored.iter().find_map(|v| v.title.clone());

        let status = promote(current.status, candidate);

        sqlx::query(
            r#"
            UPDATE songs SET
                status = ?,
                title = COALESCE(title, ?),
                stream_url = COALESCE(?, stream_url),
                audio_url = COALESCE(?, audio_url),
                image_url = COALESCE(?, image_url),
                duration_secs = COALESCE(?, duration_secs),
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(&title)
        .bind(&stream_url)
        .bind(&audio_url)
        .bind(&image_url)
        .bind(duration_secs)
        .bind(&now)
        .bind(song_id)
        .execute(&self.pool)
        .await
        .context("Failed to update song")?;

        self.get(song_id).await
    }

    /// Record a generation failure. A song already `COMPLETE` keeps its
    /// state; error callbacks arriving after completion are ignored.
    pub async fn mark_failed(&self, song_id: &str, error: &str) -> Result<Option<Song>> {
        let Some(current) = self.get(song_id).await? else {
            return Ok(None);
        };

        if current.status == SongStatus::Complete {
            tracing::debug!("Song {} already complete, ignoring failure", song_id);
            return Ok(Some(current));
        }

        let now = chrono::Utc::now().to_rfc3339();
        sqlx::query("UPDATE songs SET status = ?, error = ?, updated_at = ? WHERE id = ?")
            .bind(SongStatus::Failed.as_str())
            .bind(error)
            .bind(&now)
            .bind(song_id)
            .execute(&self.pool)
            .await
            .context("Failed to mark song failed")?;

        self.get(song_id).await
    }
}
