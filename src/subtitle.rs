use crate::api::{AlignmentBackend, WordStamp};
use crate::config::SubtitlePosition;
use crate::error::StageResult;
use crate::speech::NarrationTrack;
use tracing::{info, warn};

/// Lower bound on a cue's on-screen time. Character-proportional allocation
/// on very short segments would otherwise produce cues too brief to read.
pub const MIN_CUE_SECS: f64 = 0.3;

/// A timed subtitle fragment in narration-track time.
#[derive(Debug, Clone, PartialEq)]
pub struct SubtitleCue {
    pub text: String,
    pub start: f64,
    pub end: f64,
}

/// Derive subtitle cues for the narration. The external alignment service is
/// preferred when configured; any failure there falls back to the local
/// heuristic, because subtitles are an enhancement and never fail the job.
pub async fn align(
    aligner: Option<&dyn AlignmentBackend>,
    track: &NarrationTrack,
    words_per_cue: usize,
) -> Vec<SubtitleCue> {
    if let Some(backend) = aligner {
        match external_cues(backend, track, words_per_cue).await {
            Ok(cues) if !cues.is_empty() => {
                info!(cues = cues.len(), "subtitle timing from alignment service");
                return cues;
            }
            Ok(_) => warn!("alignment service returned no cues; using local heuristic"),
            Err(err) => warn!("alignment service failed ({err}); using local heuristic"),
        }
    }

    let cues = heuristic_cues(track, words_per_cue);
    info!(cues = cues.len(), "subtitle timing from local heuristic");
    cues
}

/// Each segment is submitted on its own and the word timestamps shifted by
/// the segment's known start, so external timing can never bleed across
/// segment boundaries.
async fn external_cues(
    backend: &dyn AlignmentBackend,
    track: &NarrationTrack,
    words_per_cue: usize,
) -> StageResult<Vec<SubtitleCue>> {
    let offsets = track.segment_offsets();
    let mut stamps = Vec::new();
    for (segment, offset) in track.segments.iter().zip(offsets) {
        let words = backend.align(&segment.path).await?;
        stamps.extend(words.into_iter().map(|w| WordStamp {
            word: w.word,
            start: w.start + offset,
            end: (w.end + offset).min(offset + segment.duration),
        }));
    }
    Ok(group_word_stamps(&stamps, words_per_cue, track.total_duration))
}

/// Collapse word-level timestamps into cue-sized groups, clamped into the
/// track and forced monotonic and non-overlapping.
pub fn group_word_stamps(
    stamps: &[WordStamp],
    words_per_cue: usize,
    total_duration: f64,
) -> Vec<SubtitleCue> {
    let group = words_per_cue.max(1);
    let mut sorted: Vec<&WordStamp> = stamps.iter().collect();
    sorted.sort_by(|a, b| a.start.total_cmp(&b.start));

    let mut cues = Vec::new();
    let mut prev_end = 0.0_f64;
    for chunk in sorted.chunks(group) {
        let first = match chunk.first() {
            Some(w) => w,
            None => continue,
        };
        let last = chunk[chunk.len() - 1];

        let start = first.start.max(prev_end).max(0.0);
        let end = last.end.min(total_duration);
        if end <= start {
            continue;
        }

        let text = chunk
            .iter()
            .map(|w| w.word.trim())
            .filter(|w| !w.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        if text.is_empty() {
            continue;
        }

        prev_end = end;
        cues.push(SubtitleCue { text, start, end });
    }
    cues
}

/// Character-weighted time division. Each sentence segment's duration is
/// known exactly, so word groups get a slice of it proportional to their
/// character share. Cues never cross their owning segment's boundaries.
/// Best-effort timing, not frame-accurate.
pub fn heuristic_cues(track: &NarrationTrack, words_per_cue: usize) -> Vec<SubtitleCue> {
    let group = words_per_cue.max(1);
    let mut cues = Vec::new();
    let mut base = 0.0_f64;

    for segment in &track.segments {
        let d = segment.duration;
        let words: Vec<&str> = segment.text.split_whitespace().collect();
        if words.is_empty() || d <= 0.0 {
            base += d;
            continue;
        }

        // Chunk into word groups, then merge forward until each group's
        // proportional slice is at least MIN_CUE_SECS.
        let total_chars: usize = words.iter().map(|w| w.chars().count()).sum::<usize>().max(1);
        let mut groups: Vec<(String, usize)> = Vec::new();
        let mut acc_text = String::new();
        let mut acc_chars = 0usize;
        for chunk in words.chunks(group) {
            if !acc_text.is_empty() {
                acc_text.push(' ');
            }
            acc_text.push_str(&chunk.join(" "));
            acc_chars += chunk.iter().map(|w| w.chars().count()).sum::<usize>();

            let slice = acc_chars as f64 / total_chars as f64 * d;
            if slice >= MIN_CUE_SECS {
                groups.push((std::mem::take(&mut acc_text), acc_chars));
                acc_chars = 0;
            }
        }
        if !acc_text.is_empty() {
            if let Some(last) = groups.last_mut() {
                last.0.push(' ');
                last.0.push_str(&acc_text);
                last.1 += acc_chars;
            } else {
                groups.push((acc_text, acc_chars));
            }
        }

        let mut t = base;
        let count = groups.len();
        for (i, (text, chars)) in groups.into_iter().enumerate() {
            let end = if i + 1 == count {
                // Last group absorbs rounding so the segment is fully covered.
                base + d
            } else {
                t + chars as f64 / total_chars as f64 * d
            };
            cues.push(SubtitleCue {
                text,
                start: t,
                end,
            });
            t = end;
        }
        base += d;
    }

    cues
}

fn format_srt_time(seconds: f64) -> String {
    let total_ms = (seconds * 1000.0).round() as u64;
    let ms = total_ms % 1000;
    let total_sec = total_ms / 1000;
    let s = total_sec % 60;
    let total_min = total_sec / 60;
    let m = total_min % 60;
    let h = total_min / 60;
    format!("{h:02}:{m:02}:{s:02},{ms:03}")
}

/// Render cues as SRT for the ffmpeg subtitles filter.
pub fn render_srt(cues: &[SubtitleCue]) -> String {
    let mut out = String::new();
    for (i, cue) in cues.iter().enumerate() {
        out.push_str(&format!(
            "{}\n{} --> {}\n{}\n\n",
            i + 1,
            format_srt_time(cue.start),
            format_srt_time(cue.end),
            cue.text
        ));
    }
    out
}

/// ASS color override ("#RRGGBB" hex to &HAABBGGRR).
pub fn ass_color(hex: &str) -> Option<String> {
    let digits = hex.strip_prefix('#')?;
    if digits.len() != 6 || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    let r = u8::from_str_radix(&digits[0..2], 16).ok()?;
    let g = u8::from_str_radix(&digits[2..4], 16).ok()?;
    let b = u8::from_str_radix(&digits[4..6], 16).ok()?;
    Some(format!("&H00{b:02X}{g:02X}{r:02X}&"))
}

/// force_style string for the burn-in filter.
pub fn force_style(position: SubtitlePosition, color: &str) -> String {
    let primary = ass_color(color).unwrap_or_else(|| "&H00FFFFFF&".to_string());
    let margin = match position {
        SubtitlePosition::Center => 0,
        _ => 60,
    };
    format!(
        "Fontsize=22,PrimaryColour={primary},OutlineColour=&H00000000&,Outline=2,Shadow=0,Alignment={},MarginV={margin}",
        position.ass_alignment()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::speech::AudioSegment;
    use std::path::PathBuf;

    fn track(parts: &[(&str, f64)]) -> NarrationTrack {
        NarrationTrack::new(
            parts
                .iter()
                .map(|(text, duration)| AudioSegment {
                    text: text.to_string(),
                    path: PathBuf::new(),
                    duration: *duration,
                })
                .collect(),
        )
    }

    fn assert_well_formed(cues: &[SubtitleCue], total: f64) {
        for (i, cue) in cues.iter().enumerate() {
            assert!(cue.start >= -1e-9, "cue {i} starts before zero");
            assert!(cue.end > cue.start, "cue {i} is empty or inverted");
            assert!(cue.end <= total + 1e-6, "cue {i} past track end");
            if i > 0 {
                assert!(
                    cue.start >= cues[i - 1].end - 1e-9,
                    "cue {i} overlaps its predecessor"
                );
            }
        }
    }

    #[test]
    fn heuristic_cues_are_sorted_bounded_and_non_overlapping() {
        let track = track(&[
            ("Chess began in India many centuries ago.", 4.0),
            ("It spread through Persia and into Europe.", 3.5),
        ]);
        let cues = heuristic_cues(&track, 3);

        assert!(!cues.is_empty());
        assert_well_formed(&cues, track.total_duration);
        // Segment boundaries are respected: some cue ends exactly at 4.0.
        assert!(cues.iter().any(|c| (c.end - 4.0).abs() < 1e-9));
        // Full coverage: last cue ends at the track end.
        let last = cues.last().expect("cues");
        assert!((last.end - track.total_duration).abs() < 1e-9);
    }

    #[test]
    fn heuristic_allocates_time_by_character_share() {
        let track = track(&[("aa bbbbbbbb", 10.0)]);
        let cues = heuristic_cues(&track, 1);
        assert_eq!(cues.len(), 2);
        // "aa" holds 2 of 10 chars.
        assert!((cues[0].end - 2.0).abs() < 1e-9);
        assert!((cues[1].end - 10.0).abs() < 1e-9);
    }

    #[test]
    fn sub_second_segments_merge_into_a_minimum_duration_cue() {
        let track = track(&[("a flurry of tiny words spoken very fast indeed", 0.5)]);
        let cues = heuristic_cues(&track, 2);
        // 0.5s cannot host multiple MIN_CUE_SECS cues.
        assert_eq!(cues.len(), 1);
        assert!((cues[0].end - cues[0].start - 0.5).abs() < 1e-9);
        assert!(cues[0].text.contains("flurry"));
        assert!(cues[0].text.contains("indeed"));
    }

    #[test]
    fn heuristic_is_deterministic() {
        let track = track(&[("Repeatable input gives repeatable timing.", 3.2)]);
        let first = heuristic_cues(&track, 2);
        let second = heuristic_cues(&track, 2);
        assert_eq!(first, second);
    }

    #[test]
    fn grouped_word_stamps_clamp_and_stay_monotonic() {
        let stamps = vec![
            WordStamp { word: "one".into(), start: 0.0, end: 0.4 },
            WordStamp { word: "two".into(), start: 0.4, end: 0.9 },
            WordStamp { word: "three".into(), start: 0.8, end: 1.4 },
            WordStamp { word: "four".into(), start: 1.4, end: 99.0 },
        ];
        let cues = group_word_stamps(&stamps, 2, 2.0);
        assert_eq!(cues.len(), 2);
        assert_well_formed(&cues, 2.0);
        assert_eq!(cues[0].text, "one two");
        // The runaway final stamp is clamped to the track duration.
        assert!((cues[1].end - 2.0).abs() < 1e-9);
    }

    #[test]
    fn srt_rendering_formats_timestamps() {
        let cues = vec![SubtitleCue {
            text: "hello world".into(),
            start: 1.5,
            end: 3.25,
        }];
        let srt = render_srt(&cues);
        assert!(srt.starts_with("1\n00:00:01,500 --> 00:00:03,250\nhello world\n"));
    }

    #[test]
    fn ass_color_converts_rgb_to_bgr() {
        assert_eq!(ass_color("#FFFF00").as_deref(), Some("&H0000FFFF&"));
        assert_eq!(ass_color("#FF0000").as_deref(), Some("&H000000FF&"));
        assert!(ass_color("FFFF00").is_none());
        assert!(ass_color("#XYZ123").is_none());
    }

    #[test]
    fn force_style_reflects_position() {
        let style = force_style(SubtitlePosition::Bottom, "#FFFFFF");
        assert!(style.contains("Alignment=2"));
        assert!(style.contains("MarginV=60"));
        let centered = force_style(SubtitlePosition::Center, "#FFFFFF");
        assert!(centered.contains("Alignment=5"));
        assert!(centered.contains("MarginV=0"));
    }
}
