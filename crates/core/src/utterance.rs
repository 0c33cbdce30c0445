//! Transcript utterance types
//!
//! An utterance is one speech segment. Its text evolves through draft
//! revisions (`Partial`, `Stable`) until it reaches a terminal state
//! (`Finalized` or `Cancelled`).

use crate::error::{Error, Result};
use crate::timestamp::Timestamp;
use serde::{Deserialize, Serialize};

/// Utterance identifier (assigned by the transcription pipeline)
pub type UtteranceId = String;

/// Session identifier (assigned by the transcription pipeline)
pub type SessionId = String;

/// Lifecycle state of an utterance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UtteranceState {
    /// Draft text, still changing with every recognizer hypothesis
    Partial,
    /// Draft text that the recognizer considers stable but not final
    Stable,
    /// Final text, no further revisions expected
    Finalized,
    /// Discarded by the pipeline
    Cancelled,
}

impl UtteranceState {
    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, UtteranceState::Finalized | UtteranceState::Cancelled)
    }

    /// Position in the lifecycle, used when merging conflicting revisions.
    pub fn rank(&self) -> u8 {
        match self {
            UtteranceState::Partial => 0,
            UtteranceState::Stable => 1,
            UtteranceState::Finalized => 2,
            UtteranceState::Cancelled => 3,
        }
    }

    /// Short lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            UtteranceState::Partial => "partial",
            UtteranceState::Stable => "stable",
            UtteranceState::Finalized => "finalized",
            UtteranceState::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for UtteranceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One speech segment produced by the transcription pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptUtterance {
    /// Utterance id, unique across sessions
    pub id: UtteranceId,
    /// Owning session
    pub session_id: SessionId,
    /// Lifecycle state
    pub state: UtteranceState,
    /// Current (draft) text
    pub text: String,
    /// Final text once the recognizer committed it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_text: Option<String>,
    /// Recognizer confidence in `[0.0, 1.0]`
    pub confidence: f32,
    /// First time this utterance was seen
    pub created_at: Timestamp,
    /// Last revision time
    pub updated_at: Timestamp,
    /// Time the utterance reached a terminal state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finalized_at: Option<Timestamp>,
}

impl TranscriptUtterance {
    /// Create a new partial utterance stamped with the current time.
    pub fn new(
        id: impl Into<UtteranceId>,
        session_id: impl Into<SessionId>,
        text: impl Into<String>,
    ) -> Self {
        let now = Timestamp::now();
        TranscriptUtterance {
            id: id.into(),
            session_id: session_id.into(),
            state: UtteranceState::Partial,
            text: text.into(),
            final_text: None,
            confidence: 0.0,
            created_at: now,
            updated_at: now,
            finalized_at: None,
        }
    }

    /// Set both creation and update time (builder pattern).
    pub fn at(mut self, ts: Timestamp) -> Self {
        self.created_at = ts;
        self.updated_at = ts;
        self
    }

    /// Set confidence (builder pattern).
    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = confidence;
        self
    }

    /// Move to the finalized state with the given final text.
    pub fn finalize(mut self, final_text: impl Into<String>, at: Timestamp) -> Self {
        let final_text = final_text.into();
        self.text = final_text.clone();
        self.final_text = Some(final_text);
        self.state = UtteranceState::Finalized;
        self.updated_at = at;
        self.finalized_at = Some(at);
        self
    }

    /// Whether the utterance reached a terminal state
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Best available text: final text if committed, draft otherwise.
    pub fn display_text(&self) -> &str {
        self.final_text.as_deref().unwrap_or(&self.text)
    }

    /// Capture the fields an update needs to prove its prior state.
    pub fn snapshot(&self) -> UtteranceSnapshot {
        UtteranceSnapshot {
            state: self.state,
            text: self.text.clone(),
            final_text: self.final_text.clone(),
            confidence: self.confidence,
            updated_at: self.updated_at,
        }
    }

    /// Reject utterances the persistence layer cannot key.
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(Error::InvalidUtterance("empty utterance id".to_string()));
        }
        if self.session_id.is_empty() {
            return Err(Error::InvalidUtterance(format!(
                "utterance {} has an empty session id",
                self.id
            )));
        }
        if !self.confidence.is_finite() || !(0.0..=1.0).contains(&self.confidence) {
            return Err(Error::InvalidUtterance(format!(
                "utterance {} has confidence {} outside [0, 1]",
                self.id, self.confidence
            )));
        }
        Ok(())
    }

    /// Diff against a newer revision of the same utterance.
    pub fn diff(&self, newer: &TranscriptUtterance) -> UtterancePatch {
        UtterancePatch {
            state: (self.state != newer.state).then_some(newer.state),
            text: (self.text != newer.text).then(|| newer.text.clone()),
            final_text: (self.final_text != newer.final_text)
                .then(|| newer.final_text.clone())
                .flatten(),
            confidence: (self.confidence != newer.confidence).then_some(newer.confidence),
            updated_at: newer.updated_at,
        }
    }
}

/// Field-level replacement set carried by an update entry.
///
/// `None` means "unchanged".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UtterancePatch {
    /// New lifecycle state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<UtteranceState>,
    /// New draft text
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// New final text
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_text: Option<String>,
    /// New confidence
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    /// Revision time
    pub updated_at: Timestamp,
}

impl UtterancePatch {
    /// Patch that only replaces the draft text.
    pub fn text(text: impl Into<String>, updated_at: Timestamp) -> Self {
        UtterancePatch {
            text: Some(text.into()),
            updated_at,
            ..Default::default()
        }
    }

    /// Apply the patch in place.
    pub fn apply_to(&self, utterance: &mut TranscriptUtterance) {
        if let Some(state) = self.state {
            if state.is_terminal() && !utterance.state.is_terminal() {
                utterance.finalized_at = Some(self.updated_at);
            }
            utterance.state = state;
        }
        if let Some(text) = &self.text {
            utterance.text = text.clone();
        }
        if let Some(final_text) = &self.final_text {
            utterance.final_text = Some(final_text.clone());
        }
        if let Some(confidence) = self.confidence {
            utterance.confidence = confidence;
        }
        if self.updated_at > utterance.updated_at {
            utterance.updated_at = self.updated_at;
        }
    }

    /// Build a placeholder utterance when the patch target is unknown.
    pub fn into_utterance(
        &self,
        id: impl Into<UtteranceId>,
        session_id: impl Into<SessionId>,
    ) -> TranscriptUtterance {
        let state = self.state.unwrap_or(UtteranceState::Partial);
        TranscriptUtterance {
            id: id.into(),
            session_id: session_id.into(),
            state,
            text: self
                .text
                .clone()
                .or_else(|| self.final_text.clone())
                .unwrap_or_default(),
            final_text: self.final_text.clone(),
            confidence: self.confidence.unwrap_or(0.0),
            created_at: self.updated_at,
            updated_at: self.updated_at,
            finalized_at: state.is_terminal().then_some(self.updated_at),
        }
    }

    /// Whether the patch changes nothing but the revision time.
    pub fn is_empty(&self) -> bool {
        self.state.is_none()
            && self.text.is_none()
            && self.final_text.is_none()
            && self.confidence.is_none()
    }
}

/// Prior state of an utterance, written alongside an update so recovery
/// can verify the patch applied on top of what it expected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UtteranceSnapshot {
    /// State before the update
    pub state: UtteranceState,
    /// Draft text before the update
    pub text: String,
    /// Final text before the update
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_text: Option<String>,
    /// Confidence before the update
    pub confidence: f32,
    /// Revision time before the update
    pub updated_at: Timestamp,
}

impl UtteranceSnapshot {
    /// Whether the utterance is still in the state this snapshot describes.
    pub fn matches(&self, utterance: &TranscriptUtterance) -> bool {
        self.state == utterance.state
            && self.text == utterance.text
            && self.final_text == utterance.final_text
            && self.updated_at == utterance.updated_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> TranscriptUtterance {
        TranscriptUtterance::new("u1", "s1", "hello").at(Timestamp::from_millis(1_000))
    }

    #[test]
    fn test_terminal_states() {
        assert!(!UtteranceState::Partial.is_terminal());
        assert!(!UtteranceState::Stable.is_terminal());
        assert!(UtteranceState::Finalized.is_terminal());
        assert!(UtteranceState::Cancelled.is_terminal());
    }

    #[test]
    fn test_finalize_sets_text_and_time() {
        let u = sample().finalize("Hello.", Timestamp::from_millis(2_000));
        assert_eq!(u.state, UtteranceState::Finalized);
        assert_eq!(u.display_text(), "Hello.");
        assert_eq!(u.finalized_at, Some(Timestamp::from_millis(2_000)));
    }

    #[test]
    fn test_validate_rejects_bad_input() {
        let mut u = sample();
        assert!(u.validate().is_ok());

        u.session_id.clear();
        assert!(matches!(u.validate(), Err(Error::InvalidUtterance(_))));

        let mut u = sample();
        u.confidence = 1.5;
        assert!(u.validate().is_err());

        let mut u = sample();
        u.confidence = f32::NAN;
        assert!(u.validate().is_err());
    }

    #[test]
    fn test_diff_then_apply_reaches_newer_state() {
        let old = sample();
        let newer = old.clone().finalize("hello world", Timestamp::from_millis(3_000));

        let patch = old.diff(&newer);
        let mut patched = old.clone();
        patch.apply_to(&mut patched);

        assert_eq!(patched, newer);
    }

    #[test]
    fn test_patch_into_placeholder() {
        let patch = UtterancePatch::text("hello world", Timestamp::from_millis(5));
        let u = patch.into_utterance("u9", "s2");
        assert_eq!(u.text, "hello world");
        assert_eq!(u.state, UtteranceState::Partial);
        assert_eq!(u.session_id, "s2");
    }

    #[test]
    fn test_snapshot_matches() {
        let u = sample();
        let snap = u.snapshot();
        assert!(snap.matches(&u));

        let mut changed = u.clone();
        changed.text = "other".to_string();
        assert!(!snap.matches(&changed));
    }

    #[test]
    fn test_json_shape() {
        let json = serde_json::to_value(sample()).unwrap();
        assert_eq!(json["state"], "partial");
        assert_eq!(json["created_at"], 1_000);
        assert!(json.get("final_text").is_none());
    }
}
