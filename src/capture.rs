//! Capture scorer and queue (§4.8 "Capture scorer & queue")
//!
//! Scores conversation events for memorability using additive regex-driven
//! signals, the same family-of-patterns approach as the graph worker's
//! entity extraction (`graph::extract_entities`), then manages the
//! pending/approved/rejected lifecycle of the resulting candidates.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use uuid::Uuid;

use crate::error::{CapsuleError, Result};
use crate::storage::{queries, Storage};
use crate::types::{
    CandidateStatus, CaptureCandidate, CaptureCategory, CaptureEvent, CreateMemoryInput, EventRole, MutationOutcome,
    Tenancy,
};
use crate::write::WritePipeline;

struct CategoryPattern {
    category: CaptureCategory,
    regex: Regex,
    weight: f32,
}

static CATEGORY_PATTERNS: Lazy<Vec<CategoryPattern>> = Lazy::new(|| {
    vec![
        CategoryPattern {
            category: CaptureCategory::Preference,
            regex: Regex::new(r"(?i)\b(i (prefer|like|love|hate|dislike)|my favorite|i'd rather|i want you to)\b").unwrap(),
            weight: 0.35,
        },
        CategoryPattern {
            category: CaptureCategory::Fact,
            regex: Regex::new(r"(?i)\b(my name is|i (am|work|live|was born)|i'm a|call me)\b").unwrap(),
            weight: 0.35,
        },
        CategoryPattern {
            category: CaptureCategory::Task,
            regex: Regex::new(r"(?i)\b(remind me to|i need to|todo|follow up|due (by|on))\b").unwrap(),
            weight: 0.35,
        },
        CategoryPattern {
            category: CaptureCategory::Context,
            regex: Regex::new(r"(?i)\b(for context|background|fyi|as discussed|to clarify)\b").unwrap(),
            weight: 0.20,
        },
    ]
});

static MEMORY_VERB: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(remember|note|log|save|don'?t forget)\b").unwrap());
static PERSISTENT_RULE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\b(always|never|every time)\b").unwrap());
static EMAIL: Lazy<Regex> = Lazy::new(|| Regex::new(r"[\w.+-]+@[\w-]+\.[\w.-]+").unwrap());
static PHONE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\+?\d[\d\-. ]{8,}\d").unwrap());
static POSTAL_ADDRESS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b\d+\s+[a-z0-9.' ]+\s(street|st|avenue|ave|road|rd|drive|dr|lane|ln|blvd)\b").unwrap());
static SCHEDULE_CUE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(tomorrow|next (week|month|monday|tuesday|wednesday|thursday|friday|saturday|sunday)|at \d{1,2}(:\d{2})?\s?(am|pm)?|on \w+day)\b").unwrap());
static NEGATIVE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)(just chatting|lorem ipsum)").unwrap());

/// Conversation-event metadata consulted by the scorer (§4.8)
#[derive(Debug, Clone, Default)]
pub struct EventHints {
    pub explicit_memory: bool,
    pub priority: Option<Priority>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    High,
    Low,
}

fn hints_from_metadata(metadata: &Option<serde_json::Value>) -> EventHints {
    let Some(value) = metadata else {
        return EventHints::default();
    };
    let explicit_memory = value.get("explicitMemory").and_then(|v| v.as_bool()).unwrap_or(false);
    let priority = match value.get("priority").and_then(|v| v.as_str()) {
        Some("high") => Some(Priority::High),
        Some("low") => Some(Priority::Low),
        _ => None,
    };
    let tags = value
        .get("tags")
        .and_then(|v| v.as_array())
        .map(|arr| arr.iter().filter_map(|t| t.as_str().map(str::to_string)).collect())
        .unwrap_or_default();
    EventHints { explicit_memory, priority, tags }
}

/// Result of scoring a conversation event (§4.8)
#[derive(Debug, Clone)]
pub struct ScoreResult {
    pub score: f32,
    pub recommended: bool,
    pub category: CaptureCategory,
    pub reasons: Vec<String>,
}

/// Score a conversation event against threshold `theta` (§4.8 "Scoring")
pub fn score_event(event: &CaptureEvent, theta: f32) -> ScoreResult {
    let hints = hints_from_metadata(&event.metadata);
    let content = event.content.as_str();
    let mut score = 0.0f32;
    let mut reasons = Vec::new();
    let mut category = CaptureCategory::Other;

    if hints.explicit_memory {
        score += 0.5;
        reasons.push("explicit-memory-flag".to_string());
    }

    let mut best_category_weight = 0.0f32;
    for pattern in CATEGORY_PATTERNS.iter() {
        if pattern.regex.is_match(content) {
            score += pattern.weight;
            reasons.push(format!("category-match:{:?}", pattern.category));
            if pattern.weight > best_category_weight {
                best_category_weight = pattern.weight;
                category = pattern.category;
            }
        }
    }

    score += match event.role {
        EventRole::User => 0.25,
        EventRole::Assistant => -0.05,
        EventRole::System => 0.0,
    };
    reasons.push(format!("role:{:?}", event.role));

    let len = content.chars().count();
    if len >= 160 {
        score += 0.12;
        reasons.push("length>=160".to_string());
    } else if len >= 100 {
        score += 0.08;
        reasons.push("length>=100".to_string());
    } else if len < 40 {
        score -= 0.10;
        reasons.push("length<40".to_string());
    }

    if content.trim_end().ends_with('?') {
        score -= 0.10;
        reasons.push("trailing-question".to_string());
    }

    if MEMORY_VERB.is_match(content) {
        score += 0.25;
        reasons.push("memory-verb".to_string());
    }
    if PERSISTENT_RULE.is_match(content) {
        score += 0.10;
        reasons.push("persistent-rule-words".to_string());
    }
    if EMAIL.is_match(content) {
        score += 0.20;
        reasons.push("email-pattern".to_string());
    }
    if PHONE.is_match(content) {
        score += 0.20;
        reasons.push("phone-pattern".to_string());
    }
    if POSTAL_ADDRESS.is_match(content) {
        score += 0.20;
        reasons.push("postal-address".to_string());
    }
    if SCHEDULE_CUE.is_match(content) {
        score += 0.15;
        reasons.push("schedule-cue".to_string());
    }
    if NEGATIVE.is_match(content) {
        score -= 0.30;
        reasons.push("negative-pattern".to_string());
    }

    match hints.priority {
        Some(Priority::High) => {
            score += 0.10;
            reasons.push("priority:high".to_string());
        }
        Some(Priority::Low) => {
            score -= 0.05;
            reasons.push("priority:low".to_string());
        }
        None => {}
    }
    if hints.tags.iter().any(|t| t == "memory") {
        score += 0.10;
        reasons.push("tag:memory".to_string());
    }

    score = score.clamp(0.0, 1.0);
    let recommended = score >= theta;

    ScoreResult { score, recommended, category, reasons }
}

/// Outcome of submitting an event for capture (§4.8 "Queue lifecycle")
#[derive(Debug, Serialize)]
pub struct CaptureOutcome {
    pub candidate: CaptureCandidate,
    pub memory: Option<MutationOutcome>,
}

fn category_label(category: CaptureCategory) -> &'static str {
    match category {
        CaptureCategory::Preference => "preference",
        CaptureCategory::Fact => "fact",
        CaptureCategory::Task => "task",
        CaptureCategory::Context => "context",
        CaptureCategory::Other => "other",
    }
}

/// Capture pipeline dependencies (§2 "Capture scorer & queue")
pub struct CapturePipeline {
    storage: Storage,
    writer: WritePipeline,
    threshold: f32,
}

impl CapturePipeline {
    pub fn new(storage: Storage, writer: WritePipeline, threshold: f32) -> Self {
        Self { storage, writer, threshold }
    }

    /// Score a conversation event and enqueue or auto-accept it (§4.8 "Queue lifecycle")
    pub async fn submit(&self, tenancy: &Tenancy, event: CaptureEvent) -> Result<CaptureOutcome> {
        let result = score_event(&event, self.threshold);
        tracing::info!(
            event = "evaluation",
            score = result.score,
            recommended = result.recommended,
            category = category_label(result.category),
            "capture event scored"
        );

        let now = chrono::Utc::now();
        let mut candidate = CaptureCandidate {
            id: Uuid::new_v4(),
            org_id: tenancy.org_id.clone(),
            project_id: tenancy.project_id.clone(),
            subject_id: tenancy.subject_id.clone(),
            source_event_id: event.source_event_id.clone(),
            role: event.role,
            content: event.content.clone(),
            metadata: event.metadata.clone(),
            score: result.score,
            threshold: self.threshold,
            recommended: result.recommended,
            category: result.category,
            reasons: result.reasons,
            status: CandidateStatus::Ignored,
            auto_accepted: None,
            auto_decision_reason: None,
            memory_id: None,
            created_at: now,
            updated_at: now,
        };

        let mut memory = None;
        if result.recommended && event.auto_accept {
            let outcome = self
                .writer
                .create(
                    tenancy,
                    CreateMemoryInput {
                        content: event.content.clone(),
                        memory_type: Some(category_label(result.category).to_string()),
                        ..Default::default()
                    },
                )
                .await?
                .into_inner();
            candidate.status = CandidateStatus::Approved;
            candidate.auto_accepted = Some(true);
            candidate.auto_decision_reason = Some("score met threshold with autoAccept requested".to_string());
            candidate.memory_id = Some(outcome.memory.id);
            memory = Some(outcome);
        } else if result.recommended {
            candidate.status = CandidateStatus::Pending;
        } else {
            candidate.status = CandidateStatus::Ignored;
        }

        self.storage.with_connection(|conn| queries::insert_candidate(conn, &candidate))?;

        tracing::info!(
            event = "decision",
            candidate_id = %candidate.id,
            status = ?candidate.status,
            "capture candidate decided"
        );

        Ok(CaptureOutcome { candidate, memory })
    }

    /// List capture candidates under a tenancy, optionally filtered by status (§4.8)
    pub fn list(&self, tenancy: &Tenancy, status: Option<CandidateStatus>, limit: i64) -> Result<Vec<CaptureCandidate>> {
        self.storage.with_connection(|conn| queries::list_candidates(conn, tenancy, status, limit))
    }

    /// Approve a pending candidate, creating its memory (§4.8 "Approve")
    pub async fn approve(&self, tenancy: &Tenancy, id: Uuid) -> Result<CaptureOutcome> {
        let mut candidate = self.fetch_owned(tenancy, id)?;
        if candidate.status != CandidateStatus::Pending {
            return Err(CapsuleError::InvalidState(format!(
                "candidate {id} is not pending (status: {:?})",
                candidate.status
            )));
        }

        let outcome = self
            .writer
            .create(
                tenancy,
                CreateMemoryInput {
                    content: candidate.content.clone(),
                    memory_type: Some(category_label(candidate.category).to_string()),
                    ..Default::default()
                },
            )
            .await?
            .into_inner();

        self.storage
            .with_connection(|conn| queries::update_candidate_status(conn, id, CandidateStatus::Approved, Some(outcome.memory.id)))?;

        candidate.status = CandidateStatus::Approved;
        candidate.memory_id = Some(outcome.memory.id);

        tracing::info!(event = "decision", candidate_id = %id, status = "approved", "capture candidate decided");

        Ok(CaptureOutcome { candidate, memory: Some(outcome) })
    }

    /// Reject a pending candidate (§4.8 "Reject")
    pub fn reject(&self, tenancy: &Tenancy, id: Uuid, reason: Option<String>) -> Result<CaptureCandidate> {
        let mut candidate = self.fetch_owned(tenancy, id)?;
        if candidate.status != CandidateStatus::Pending {
            return Err(CapsuleError::InvalidState(format!(
                "candidate {id} is not pending (status: {:?})",
                candidate.status
            )));
        }

        self.storage
            .with_connection(|conn| queries::reject_candidate(conn, id, reason.as_deref()))?;
        candidate.status = CandidateStatus::Rejected;
        candidate.auto_decision_reason = reason;

        tracing::info!(event = "decision", candidate_id = %id, status = "rejected", "capture candidate decided");

        Ok(candidate)
    }

    fn fetch_owned(&self, tenancy: &Tenancy, id: Uuid) -> Result<CaptureCandidate> {
        self.storage
            .with_connection(|conn| queries::get_candidate(conn, id))?
            .filter(|c| c.tenancy() == *tenancy)
            .ok_or_else(|| CapsuleError::NotFound(format!("capture candidate {id} not found")))
    }
}
