//! Transcript parsing: locate the structured JSON block the agent was asked
//! to emit and turn it into an [`AnalysisResult`].
//!
//! Agents ramble. The parser takes the *last* fenced ```json block so
//! preamble, thinking, and quoted examples earlier in the reply do not win;
//! with no fence it falls back to the last balanced JSON object in the text.

use crate::errors::{ParseError, ParseResult};
use crate::types::{AnalysisResult, Confidence};
use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;

/// The agent-emitted payload, before the pipeline stamps identities onto it.
#[derive(Debug, Clone, Deserialize)]
pub struct ParsedAnalysis {
    #[serde(default)]
    pub problem_type: String,
    #[serde(default)]
    pub problem_type_en: Option<String>,
    #[serde(default)]
    pub root_cause: String,
    #[serde(default)]
    pub root_cause_en: Option<String>,
    #[serde(default)]
    pub confidence: Confidence,
    #[serde(default)]
    pub confidence_reason: Option<String>,
    #[serde(default)]
    pub key_evidence: Vec<String>,
    #[serde(default)]
    pub user_reply: Option<String>,
    #[serde(default)]
    pub user_reply_en: Option<String>,
    #[serde(default)]
    pub needs_engineer: bool,
    #[serde(default)]
    pub requires_more_info: bool,
    #[serde(default)]
    pub next_steps: Vec<String>,
    #[serde(default)]
    pub fix_suggestion: Option<String>,
}

impl ParsedAnalysis {
    /// Stamp identities and produce the persisted record. The matched rule
    /// and effective agent always come from the pipeline, never the agent.
    pub fn into_result(
        self,
        task_id: Uuid,
        issue_id: String,
        matched_rule_id: String,
        agent_name: String,
    ) -> AnalysisResult {
        AnalysisResult {
            task_id,
            issue_id,
            problem_type: self.problem_type,
            problem_type_en: self.problem_type_en,
            root_cause: self.root_cause,
            root_cause_en: self.root_cause_en,
            confidence: self.confidence,
            confidence_reason: self.confidence_reason,
            key_evidence: self.key_evidence,
            user_reply: self.user_reply,
            user_reply_en: self.user_reply_en,
            needs_engineer: self.needs_engineer,
            requires_more_info: self.requires_more_info,
            next_steps: self.next_steps,
            fix_suggestion: self.fix_suggestion,
            matched_rule_id,
            agent_name,
            created_at: Utc::now(),
        }
    }
}

/// Parse a transcript into the structured analysis.
pub fn parse_transcript(transcript: &str) -> ParseResult<ParsedAnalysis> {
    let block = locate_json_block(transcript).ok_or(ParseError::NoStructuredBlock)?;
    let parsed: ParsedAnalysis =
        serde_json::from_str(&block).map_err(|e| ParseError::InvalidJson(e.to_string()))?;

    if parsed.problem_type.trim().is_empty() {
        return Err(ParseError::MissingField("problem_type"));
    }
    if parsed.root_cause.trim().is_empty() {
        return Err(ParseError::MissingField("root_cause"));
    }
    Ok(parsed)
}

/// Last fenced ```json block, else the last balanced top-level JSON object.
fn locate_json_block(transcript: &str) -> Option<String> {
    if let Some(block) = last_fenced_block(transcript) {
        return Some(block);
    }
    last_balanced_object(transcript)
}

fn last_fenced_block(transcript: &str) -> Option<String> {
    let mut result = None;
    let mut rest = transcript;
    while let Some(start) = rest.find("```json") {
        let after = &rest[start + "```json".len()..];
        let after = after.strip_prefix('\n').unwrap_or(after);
        if let Some(end) = after.find("```") {
            result = Some(after[..end].trim().to_string());
            rest = &after[end + 3..];
        } else {
            break;
        }
    }
    result
}

/// Forward scan for top-level JSON objects: at each `{`, attempt a streaming
/// parse of exactly one value. A successful parse consumes nested objects,
/// so only top-level candidates register; the last one wins. Prose braces
/// simply fail to parse and are skipped.
fn last_balanced_object(transcript: &str) -> Option<String> {
    let mut result = None;
    let mut offset = 0;
    while let Some(open) = transcript[offset..].find('{') {
        let start = offset + open;
        let mut stream =
            serde_json::Deserializer::from_str(&transcript[start..]).into_iter::<serde_json::Value>();
        match stream.next() {
            Some(Ok(value)) if value.is_object() => {
                let end = start + stream.byte_offset();
                result = Some(transcript[start..end].to_string());
                offset = end;
            }
            _ => offset = start + 1,
        }
    }
    result
}
