//! Song status reconciliation
//!
//! The generation provider reports progress through two independent paths: a
//! webhook push carrying a callback type plus variant payloads, and a status
//! poll against the provider's API. Both paths feed the pure functions in
//! this module and persist through the same store routine, so repeated
//! deliveries and concurrent polls converge on the same stored state.

use serde::{Deserialize, Serialize};

/// Readiness of a single generated audio variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VariantStatus {
    Pending,
    StreamReady,
    DownloadReady,
}

/// Aggregated status of a song across its variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SongStatus {
    Pending,
    StreamAvailable,
    Complete,
    Failed,
}

impl SongStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SongStatus::Pending => "PENDING",
            SongStatus::StreamAvailable => "STREAM_AVAILABLE",
            SongStatus::Complete => "COMPLETE",
            SongStatus::Failed => "FAILED",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s.to_uppercase().as_str() {
            "STREAM_AVAILABLE" | "STREAM_READY" => SongStatus::StreamAvailable,
            "COMPLETE" | "DOWNLOAD_READY" => SongStatus::Complete,
            "FAILED" | "ERROR" => SongStatus::Failed,
            _ => SongStatus::Pending,
        }
    }

    /// Whether a client can start playback at this status.
    pub fn is_ready(&self) -> bool {
        matches!(self, SongStatus::StreamAvailable | SongStatus::Complete)
    }

    fn rank(self) -> u8 {
        match self {
            SongStatus::Pending => 0,
            SongStatus::StreamAvailable => 1,
            SongStatus::Complete => 2,
            // Failed ranks between StreamAvailable and Complete: an
            // informational update never clears it, a Complete does.
            SongStatus::Failed => 1,
        }
    }
}

/// The provider's callback type on webhook deliveries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackKind {
    First,
    Complete,
    Error,
    Unknown,
}

impl CallbackKind {
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "first" => CallbackKind::First,
            "complete" => CallbackKind::Complete,
            "error" => CallbackKind::Error,
            _ => CallbackKind::Unknown,
        }
    }
}

/// One variant payload as reported by the provider.
///
/// Field aliases cover both the webhook body and the status API, which name
/// the same URLs differently.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VariantUpdate {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default, alias = "stream_audio_url", alias = "streamAudioUrl")]
    pub stream_url: Option<String>,
    #[serde(default, alias = "audio_url", alias = "audioUrl")]
    pub download_url: Option<String>,
    #[serde(default, alias = "image_url", alias = "imageUrl")]
    pub image_url: Option<String>,
    #[serde(default)]
    pub duration: Option<f64>,
}

/// Treat empty strings the same as absent URLs.
fn present(url: &Option<String>) -> Option<&str> {
    url.as_deref().filter(|s| !s.trim().is_empty())
}

impl VariantUpdate {
    pub fn stream_url(&self) -> Option<&str> {
        present(&self.stream_url)
    }

    pub fn download_url(&self) -> Option<&str> {
        present(&self.download_url)
    }
}

/// Classify a single variant from the URLs it carries.
///
/// A variant with a download URL is never `Pending`, regardless of whether
/// the stream URL arrived with it.
pub fn variant_status(variant: &VariantUpdate) -> VariantStatus {
    if variant.download_url().is_some() {
        VariantStatus::DownloadReady
    } else if variant.stream_url().is_some() {
        VariantStatus::StreamReady
    } else {
        VariantStatus::Pending
    }
}

/// Aggregate per-variant readiness into a song-level status.
pub fn aggregate_status(variants: &[VariantStatus]) -> SongStatus {
    if variants.is_empty() {
        return SongStatus::Pending;
    }
    if variants.iter().all(|v| *v == VariantStatus::DownloadReady) {
        return SongStatus::Complete;
    }
    if variants.iter().any(|v| *v != VariantStatus::Pending) {
        return SongStatus::StreamAvailable;
    }
    SongStatus::Pending
}

/// Monotonic promotion: a song already `Complete` is never demoted, and an
/// informational update never clears a stored `Failed`.
pub fn promote(current: SongStatus, candidate: SongStatus) -> SongStatus {
    if current == SongStatus::Complete || candidate == SongStatus::Complete {
        return SongStatus::Complete;
    }
    if current == SongStatus::Failed {
        return SongStatus::Failed;
    }
    if candidate.rank() >= current.rank() {
        candidate
    } else {
        current
    }
}

/// Resolve the status a webhook delivery implies for a song.
pub fn apply_callback(
    current: SongStatus,
    kind: CallbackKind,
    variants: &[VariantUpdate],
) -> SongStatus {
    match kind {
        CallbackKind::Error => {
            if current == SongStatus::Complete {
                SongStatus::Complete
            } else {
                SongStatus::Failed
            }
        }
        CallbackKind::Complete => SongStatus::Complete,
        CallbackKind::First | CallbackKind::Unknown => {
            let statuses: Vec<VariantStatus> = variants.iter().map(variant_status).collect();
            promote(current, aggregate_status(&statuses))
        }
    }
}

/// Map the poll API's task state onto a song status.
///
/// `processing` (and anything unrecognized) falls back to what the variant
/// payloads say: any ready variant means streaming can start.
pub fn status_from_provider(state: &str, variants: &[VariantUpdate]) -> SongStatus {
    match state.to_lowercase().as_str() {
        "completed" | "complete" | "success" => SongStatus::Complete,
        "failed" | "error" => SongStatus::Failed,
        _ => {
            let statuses: Vec<VariantStatus> = variants.iter().map(variant_status).collect();
            match aggregate_status(&statuses) {
                SongStatus::Complete | SongStatus::StreamAvailable => SongStatus::StreamAvailable,
                other => other,
            }
        }
    }
}

/// Round a fractional duration to whole seconds, half-up.
pub fn round_duration(secs: f64) -> u32 {
    if secs <= 0.0 {
        return 0;
    }
    (secs + 0.5) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn variant(stream: Option<&str>, download: Option<&str>) -> VariantUpdate {
        VariantUpdate {
            stream_url: stream.map(str::to_string),
            download_url: download.map(str::to_string),
            ..Default::default()
        }
    }

    #[test]
    fn variant_with_no_urls_is_pending() {
        assert_eq!(variant_status(&variant(None, None)), VariantStatus::Pending);
        assert_eq!(variant_status(&variant(Some(""), None)), VariantStatus::Pending);
    }

    #[test]
    fn download_url_wins_over_missing_stream() {
        // An empty stream URL next to a real download URL is never pending.
        let v = variant(Some(""), Some("https://cdn.example.com/a.mp3"));
        assert_eq!(variant_status(&v), VariantStatus::DownloadReady);
    }

    #[test]
    fn all_download_ready_completes_the_song() {
        let statuses = vec![VariantStatus::DownloadReady, VariantStatus::DownloadReady];
        assert_eq!(aggregate_status(&statuses), SongStatus::Complete);
    }

    #[test]
    fn one_ready_variant_makes_streaming_available() {
        let statuses = vec![VariantStatus::StreamReady, VariantStatus::Pending];
        assert_eq!(aggregate_status(&statuses), SongStatus::StreamAvailable);
    }

    #[test]
    fn empty_variant_list_stays_pending() {
        assert_eq!(aggregate_status(&[]), SongStatus::Pending);
    }

    #[test]
    fn complete_is_never_demoted() {
        assert_eq!(
            promote(SongStatus::Complete, SongStatus::Pending),
            SongStatus::Complete
        );
        assert_eq!(
            apply_callback(SongStatus::Complete, CallbackKind::Error, &[]),
            SongStatus::Complete
        );
    }

    #[test]
    fn error_callback_fails_an_unfinished_song() {
        assert_eq!(
            apply_callback(SongStatus::StreamAvailable, CallbackKind::Error, &[]),
            SongStatus::Failed
        );
    }

    #[test]
    fn first_callback_promotes_from_variants() {
        let variants = vec![variant(Some("https://cdn.example.com/s.m3u8"), None)];
        assert_eq!(
            apply_callback(SongStatus::Pending, CallbackKind::First, &variants),
            SongStatus::StreamAvailable
        );
    }

    #[test]
    fn informational_update_does_not_clear_failure() {
        let variants = vec![variant(Some("https://cdn.example.com/s.m3u8"), None)];
        assert_eq!(
            apply_callback(SongStatus::Failed, CallbackKind::Unknown, &variants),
            SongStatus::Failed
        );
    }

    #[test]
    fn completed_poll_supersedes_failure() {
        assert_eq!(
            promote(SongStatus::Failed, SongStatus::Complete),
            SongStatus::Complete
        );
        assert_eq!(status_from_provider("completed", &[]), SongStatus::Complete);
    }

    #[test]
    fn processing_maps_from_variant_payloads() {
        let ready = vec![variant(Some("https://cdn.example.com/s.m3u8"), None)];
        assert_eq!(
            status_from_provider("processing", &ready),
            SongStatus::StreamAvailable
        );
        assert_eq!(status_from_provider("processing", &[]), SongStatus::Pending);
    }

    #[test]
    fn duration_rounds_half_up() {
        assert_eq!(round_duration(181.49), 181);
        assert_eq!(round_duration(181.5), 182);
        assert_eq!(round_duration(-3.0), 0);
    }

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            SongStatus::Pending,
            SongStatus::StreamAvailable,
            SongStatus::Complete,
            SongStatus::Failed,
        ] {
            assert_eq!(SongStatus::from_str(status.as_str()), status);
        }
    }
}
