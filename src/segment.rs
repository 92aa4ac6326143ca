//! Lyric-line timestamp segmentation
//!
//! Generated songs come back with plain lyrics and a total duration but no
//! per-line timing. These helpers split the lyrics into lines and spread the
//! duration across them proportionally to line length, producing the timed
//! lines the player scrolls through and an LRC rendering for export.

use serde::{Deserialize, Serialize};

/// Minimum span a non-empty line keeps, even in a very short song.
const MIN_LINE_MS: u64 = 1_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LyricLine {
    pub index: usize,
    pub start_ms: u64,
    pub end_ms: u64,
    pub text: String,
}

/// Section markers like `[Verse 1]` or `[Chorus]` that the LLM emits but the
/// player never displays.
fn is_section_marker(line: &str) -> bool {
    line.starts_with('[') && line.ends_with(']')
}

/// Split lyrics into displayable lines and distribute `duration_secs` across
/// them, weighting each line by its character count.
///
/// Spans are contiguous and non-overlapping; the last line always ends at
/// the full duration so the sum of spans covers the song exactly.
pub fn segment_lines(lyrics: &str, duration_secs: u32) -> Vec<LyricLine> {
    let texts: Vec<&str> = lyrics
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !is_section_marker(l))
        .collect();

    if texts.is_empty() || duration_secs == 0 {
        return Vec::new();
    }

    let total_ms = u64::from(duration_secs) * 1_000;
    let total_chars: u64 = texts.iter().map(|l| l.chars().count() as u64).sum();

    let mut lines = Vec::with_capacity(texts.len());
    let mut cursor = 0u64;

    for (index, text) in texts.iter().enumerate() {
        let end_ms = if index == texts.len() - 1 {
            total_ms
        } else {
            let weight = text.chars().count() as u64;
            let span = (total_ms * weight / total_chars.max(1)).max(MIN_LINE_MS);
            (cursor + span).min(total_ms)
        };

        lines.push(LyricLine {
            index,
            start_ms: cursor,
            end_ms,
            text: (*text).to_string(),
        });
        cursor = end_ms;
    }

    lines
}

/// Render timed lines as standard LRC (`[mm:ss.xx]text`).
pub fn to_lrc(lines: &[LyricLine]) -> String {
    let mut out = String::new();
    for line in lines {
        let total_secs = line.start_ms / 1_000;
        let minutes = total_secs / 60;
        let seconds = total_secs % 60;
        let centis = (line.start_ms % 1_000) / 10;
        out.push_str(&format!(
            "[{:02}:{:02}.{:02}]{}\n",
            minutes, seconds, centis, line.text
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const LYRICS: &str = "[Verse 1]\nHappy birthday dear Maya\nThe candles burn so bright\n\n[Chorus]\nSing along tonight";

    #[test]
    fn skips_blanks_and_section_markers() {
        let lines = segment_lines(LYRICS, 30);
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0].text, "Happy birthday dear Maya");
        assert_eq!(lines[2].text, "Sing along tonight");
    }

    #[test]
    fn spans_are_contiguous_and_cover_the_duration() {
        let lines = segment_lines(LYRICS, 30);
        assert_eq!(lines[0].start_ms, 0);
        for pair in lines.windows(2) {
            assert_eq!(pair[0].end_ms, pair[1].start_ms);
        }
        assert_eq!(lines.last().unwrap().end_ms, 30_000);
    }

    #[test]
    fn longer_lines_get_longer_spans() {
        let lines = segment_lines("Short\nA considerably longer lyric line here\nEnd", 60);
        let span = |l: &LyricLine| l.end_ms - l.start_ms;
        assert!(span(&lines[1]) > span(&lines[0]));
    }

    #[test]
    fn empty_input_yields_no_lines() {
        assert!(segment_lines("", 120).is_empty());
        assert!(segment_lines("[Chorus]\n\n", 120).is_empty());
        assert!(segment_lines("Hello", 0).is_empty());
    }

    #[test]
    fn lrc_rendering_formats_timestamps() {
        let lines = vec![
            LyricLine {
                index: 0,
                start_ms: 0,
                end_ms: 4_000,
                text: "First line".to_string(),
            },
            LyricLine {
                index: 1,
                start_ms: 64_250,
                end_ms: 70_000,
                text: "Second line".to_string(),
            },
        ];
        let lrc = to_lrc(&lines);
        assert_eq!(lrc, "[00:00.00]First line\n[01:04.25]Second line\n");
    }
}
