use crate::api::{with_retries, TextGenerator};
use crate::config::JobRequest;
use crate::error::{PipelineError, StageResult};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{info, warn};

pub const SEARCH_TERM_COUNT: usize = 5;
const SCRIPT_ATTEMPTS: u32 = 3;
const TERMS_ATTEMPTS: u32 = 2;
const MAX_TERM_WORDS: usize = 5;

/// Narration script plus the disjoint stock-footage search terms, produced
/// once per job and immutable afterwards.
#[derive(Debug, Clone)]
pub struct Script {
    pub sentences: Vec<String>,
    pub search_terms: Vec<String>,
}

impl Script {
    pub fn full_text(&self) -> String {
        self.sentences.join(" ")
    }

    /// Rough narration length in seconds, from total character count at the
    /// configured speaking rate. Used to size the footage target before the
    /// real narration duration is known.
    pub fn estimated_duration(&self, chars_per_sec: f64) -> f64 {
        let chars: usize = self.sentences.iter().map(|s| s.chars().count()).sum();
        chars as f64 / chars_per_sec.max(1.0)
    }
}

static BRACKETED_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[[^\]]*\]|\([^)]*\)").expect("bracket regex"));
static SENTENCE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^.!?]+[.!?]*").expect("sentence regex"));
static JSON_ARRAY_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)\[.*\]").expect("array regex"));
static QUOTED_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r#""([^"]+)""#).expect("quoted regex"));

fn build_script_prompt(req: &JobRequest) -> String {
    let base = match &req.extra_prompt {
        Some(custom) if !custom.trim().is_empty() => custom.clone(),
        _ => "Generate a narration script for a short video about the given subject.\n\
              Get straight to the point; never open with filler like \"welcome to this video\".\n\
              Return only the raw spoken text: no markdown, no titles, no speaker labels,\n\
              and never mention this prompt, the paragraph count, or the script itself."
            .to_string(),
    };

    format!(
        "{base}\n\nSubject: {}\nNumber of paragraphs: {}\n",
        req.topic, req.paragraph_count
    )
}

fn build_terms_prompt(topic: &str, amount: usize, script: &str) -> String {
    format!(
        "Generate {amount} search terms for stock videos related to the subject of a video.\n\
         Subject: {topic}\n\n\
         Return ONLY a JSON array of strings, each term 1-{MAX_TERM_WORDS} words,\n\
         for example: [\"term one\", \"term two\"]. Do not return the script.\n\n\
         For context, here is the full script:\n{script}\n"
    )
}

/// Strip markdown leftovers and cut the response down to the requested
/// paragraph count.
pub fn clean_script(raw: &str, paragraph_count: u32) -> StageResult<String> {
    let without_marks = raw.replace(['*', '#'], "");
    let without_brackets = BRACKETED_RE.replace_all(&without_marks, "");

    let paragraphs: Vec<&str> = without_brackets
        .split("\n\n")
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .take(paragraph_count as usize)
        .collect();

    let text = paragraphs.join("\n\n");
    if text.trim().is_empty() {
        return Err(PipelineError::MalformedResponse(
            "script response was empty after cleanup".into(),
        ));
    }
    Ok(text)
}

pub fn split_sentences(text: &str) -> Vec<String> {
    SENTENCE_RE
        .find_iter(text)
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !s.is_empty() && s.chars().any(|c| c.is_alphanumeric()))
        .collect()
}

/// Layered recovery parse for the search-term response: strict JSON first,
/// then a bracketed-array scrape, then bare quoted strings.
pub fn parse_search_terms(raw: &str) -> Option<Vec<String>> {
    let direct: Option<Vec<String>> = serde_json::from_str(raw).ok();
    let parsed = direct.or_else(|| {
        let candidate = JSON_ARRAY_RE.find(raw)?.as_str();
        serde_json::from_str(candidate).ok().or_else(|| {
            let scraped: Vec<String> = QUOTED_RE
                .captures_iter(raw)
                .map(|c| c[1].to_string())
                .collect();
            if scraped.is_empty() { None } else { Some(scraped) }
        })
    })?;

    let mut seen = std::collections::HashSet::new();
    let terms: Vec<String> = parsed
        .into_iter()
        .map(|t| t.trim().to_string())
        .filter(|t| {
            let words = t.split_whitespace().count();
            (1..=MAX_TERM_WORDS).contains(&words)
        })
        .filter(|t| seen.insert(t.to_lowercase()))
        .take(SEARCH_TERM_COUNT)
        .collect();

    if terms.is_empty() { None } else { Some(terms) }
}

/// Topic-derived terms used when the generated ones cannot be recovered.
/// Search terms are not narration content, so falling back here is safe.
pub fn fallback_terms(topic: &str) -> Vec<String> {
    vec![
        topic.to_string(),
        format!("{topic} close up"),
        format!("{topic} background"),
        "cinematic b-roll".to_string(),
        "abstract texture".to_string(),
    ]
}

/// Turn a topic into a narration script and a set of footage search terms.
pub async fn generate(text_gen: &dyn TextGenerator, req: &JobRequest) -> StageResult<Script> {
    let prompt = build_script_prompt(req);
    let raw = with_retries("script generation", SCRIPT_ATTEMPTS, || {
        text_gen.complete(req.model, &prompt)
    })
    .await?;

    let text = clean_script(&raw, req.paragraph_count)?;
    let sentences = split_sentences(&text);
    if sentences.is_empty() {
        return Err(PipelineError::MalformedResponse(
            "script contained no sentences".into(),
        ));
    }

    let terms_prompt = build_terms_prompt(&req.topic, SEARCH_TERM_COUNT, &text);
    let search_terms = match with_retries("search terms", TERMS_ATTEMPTS, || {
        text_gen.complete(req.model, &terms_prompt)
    })
    .await
    {
        Ok(raw_terms) => parse_search_terms(&raw_terms).unwrap_or_else(|| {
            warn!("search-term response could not be parsed; using topic-derived terms");
            fallback_terms(&req.topic)
        }),
        Err(err) => {
            warn!("search-term generation failed ({err}); using topic-derived terms");
            fallback_terms(&req.topic)
        }
    };

    info!(
        sentences = sentences.len(),
        terms = search_terms.len(),
        "script generated"
    );
    Ok(Script {
        sentences,
        search_terms,
    })
}

/// Title and description for the hosting platform, derived from the script.
pub async fn generate_metadata(
    text_gen: &dyn TextGenerator,
    req: &JobRequest,
    script: &Script,
) -> StageResult<(String, String)> {
    let title_prompt = format!(
        "Generate a catchy, SEO-friendly title for a short vertical video about {}. \
         Return only the title text.",
        req.topic
    );
    let title = text_gen.complete(req.model, &title_prompt).await?;

    let description_prompt = format!(
        "Write a brief, engaging description for a short vertical video about {}. \
         The video is based on this script:\n{}\n",
        req.topic,
        script.full_text()
    );
    let description = text_gen.complete(req.model, &description_prompt).await?;

    Ok((
        title.trim().trim_matches('"').to_string(),
        description.trim().to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_script_strips_markdown_and_selects_paragraphs() {
        let raw = "**First** paragraph about chess. It has history.\n\n\
                   Second paragraph [citation] continues.\n\n\
                   Third paragraph should be dropped.";
        let cleaned = clean_script(raw, 2).expect("cleaned");
        assert!(!cleaned.contains('*'));
        assert!(!cleaned.contains('['));
        assert!(cleaned.contains("First paragraph"));
        assert!(cleaned.contains("Second paragraph"));
        assert!(!cleaned.contains("Third paragraph"));
    }

    #[test]
    fn clean_script_rejects_empty_responses() {
        assert!(clean_script("***", 1).is_err());
        assert!(clean_script("", 3).is_err());
    }

    #[test]
    fn split_sentences_handles_mixed_punctuation() {
        let sentences = split_sentences("Chess is ancient. Did you know? It began in India!");
        assert_eq!(sentences.len(), 3);
        assert_eq!(sentences[0], "Chess is ancient.");
        assert_eq!(sentences[1], "Did you know?");
        assert_eq!(sentences[2], "It began in India!");
    }

    #[test]
    fn split_sentences_drops_noise() {
        let sentences = split_sentences("... \n  Real sentence here.");
        assert_eq!(sentences.len(), 1);
    }

    #[test]
    fn parse_search_terms_direct_json() {
        let terms = parse_search_terms(r#"["chess board", "old chess pieces", "chess match"]"#)
            .expect("terms");
        assert_eq!(terms.len(), 3);
        assert_eq!(terms[0], "chess board");
    }

    #[test]
    fn parse_search_terms_recovers_from_chatty_response() {
        let raw = "Sure! Here are your terms:\n[\"chess board\", \"chess pieces\"]\nEnjoy!";
        let terms = parse_search_terms(raw).expect("terms");
        assert_eq!(terms, vec!["chess board", "chess pieces"]);
    }

    #[test]
    fn parse_search_terms_dedupes_and_bounds_length() {
        let raw = r#"["chess", "Chess", "a very long search term with far too many words inside"]"#;
        let terms = parse_search_terms(raw).expect("terms");
        assert_eq!(terms, vec!["chess"]);
    }

    #[test]
    fn parse_search_terms_rejects_garbage() {
        assert!(parse_search_terms("no terms here at all").is_none());
    }

    #[test]
    fn estimated_duration_scales_with_length() {
        let script = Script {
            sentences: vec!["a".repeat(150)],
            search_terms: vec![],
        };
        let secs = script.estimated_duration(15.0);
        assert!((secs - 10.0).abs() < 1e-9);
    }
}
