//! LLM lyrics provider client
//!
//! Wraps the Gemini `generateContent` REST endpoint behind a trait so
//! handlers and tests can swap in a mock writer.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;

/// Everything the writer needs to know about the requested song.
#[derive(Debug, Clone, Serialize)]
pub struct SongBrief {
    pub recipient_name: String,
    pub occasion: String,
    pub languages: Vec<String>,
    pub mood: Option<String>,
    pub story: String,
}

impl SongBrief {
    /// Assemble the generation prompt from the request fields.
    fn prompt(&self) -> String {
        let mut prompt = format!(
            "Write song lyrics for {} for the occasion: {}.\n",
            self.recipient_name, self.occasion
        );
        if !self.languages.is_empty() {
            prompt.push_str(&format!("Languages: {}.\n", self.languages.join(", ")));
        }
        if let Some(mood) = &self.mood {
            prompt.push_str(&format!("Mood: {}.\n", mood));
        }
        prompt.push_str(&format!(
            "Their story: {}\n\nStructure the lyrics with [Verse] and [Chorus] section \
             markers. Keep it under 2500 characters. Return only the lyrics.",
            self.story
        ));
        prompt
    }
}

#[async_trait]
pub trait LyricsWriter: Send + Sync {
    /// Unique provider name (e.g. "gemini").
    fn name(&self) -> &str;

    /// Write a fresh set of lyrics for the brief.
    async fn write(&self, brief: &SongBrief) -> Result<String>;

    /// Rework existing lyrics according to the user's notes.
    async fn refine(&self, current: &str, notes: &str) -> Result<String>;
}

pub struct GeminiLyricsWriter {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const GEMINI_MODEL: &str = "gemini-2.0-flash";

impl GeminiLyricsWriter {
    pub fn new(api_key: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .context("Failed to build lyrics HTTP client")?;

        Ok(Self {
            client,
            base_url: GEMINI_BASE_URL.to_string(),
            api_key,
            model: GEMINI_MODEL.to_string(),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    async fn generate(&self, prompt: &str) -> Result<String> {
        let body = serde_json::json!({
            "contents": [{ "parts": [{ "text": prompt }] }]
        });

        let response = self
            .client
            .post(format!(
                "{}/models/{}:generateContent",
                self.base_url, self.model
            ))
            .query(&[("key", self.api_key.as_str())])
            .json(&body)
            .send()
            .await
            .context("Lyrics generation request failed")?;

        if !response.status().is_success() {
            anyhow::bail!("Lyrics API returned HTTP {}", response.status());
        }

        let value: serde_json::Value = response
            .json()
            .await
            .context("Failed to decode lyrics response")?;

        let text = value["candidates"][0]["content"]["parts"][0]["text"]
            .as_str()
            .context("Lyrics response carried no text candidate")?;

        Ok(strip_code_fences(text))
    }
}

/// The model occasionally wraps its answer in a markdown code fence.
fn strip_code_fences(text: &str) -> String {
    let trimmed = text.trim();
    if let Some(inner) = trimmed.strip_prefix("```") {
        let inner = inner.trim_start_matches(|c: char| c.is_alphanumeric());
        if let Some(body) = inner.strip_suffix("```") {
            return body.trim().to_string();
        }
    }
    trimmed.to_string()
}

#[async_trait]
impl LyricsWriter for GeminiLyricsWriter {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn write(&self, brief: &SongBrief) -> Result<String> {
        tracing::debug!("Writing lyrics for recipient: {}", brief.recipient_name);
        self.generate(&brief.prompt()).await
    }

    async fn refine(&self, current: &str, notes: &str) -> Result<String> {
        tracing::debug!("Refining lyrics with notes: {}", notes);
        let prompt = format!(
            "Rework these song lyrics according to the notes below. Keep the \
             [Verse]/[Chorus] structure. Return only the lyrics.\n\nLyrics:\n{}\n\nNotes:\n{}",
            current, notes
        );
        self.generate(&prompt).await
    }
}

/// Canned writer for tests and offline development.
pub struct MockLyricsWriter;

#[async_trait]
impl LyricsWriter for MockLyricsWriter {
    fn name(&self) -> &str {
        "mock"
    }

    async fn write(&self, brief: &SongBrief) -> Result<String> {
        Ok(format!(
            "[Verse]\nA song for {} on this {}\nEvery word is true\n\n[Chorus]\nThis one is for you",
            brief.recipient_name, brief.occasion
        ))
    }

    async fn refine(&self, current: &str, notes: &str) -> Result<String> {
        Ok(format!("{}\n\n[Bridge]\n{}", current, notes))
    }
}
