//! Session reconstruction
//!
//! `SessionReconstructor` folds decoded entries, in log order, into
//! per-session utterance lists.
//!
//! # Rules
//!
//! - Insert appends. If the id already exists and the stored revision
//!   differs, the conflict policy picks the survivor.
//! - Update patches in place. An update without a prior-state snapshot,
//!   with a snapshot that no longer matches, or targeting an unknown id
//!   (a placeholder is built from the patch) marks the utterance uncertain.
//!   An update older than the stored revision is a conflict.
//! - Delete removes the utterance; unknown ids are ignored.
//! - Session delete removes the whole session.
//!
//! Deletes leave tombstones keyed by timestamp: any later-replayed entry
//! for the same target stamped at or before the tombstone is dropped, so
//! a duplicate written by a timed-out flush cannot resurrect deleted data.

use crate::format::{EntryPayload, WalEntry};
use scribe_core::{
    SessionId, Timestamp, TranscriptUtterance, UtteranceId, UtterancePatch, UtteranceSnapshot,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use std::time::Duration;

/// Which revision survives when two revisions of one utterance disagree
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictPolicy {
    /// Later `updated_at` wins; ties go to the entry replayed last
    #[default]
    Newest,
    /// Earlier `updated_at` wins; ties keep the stored revision
    Oldest,
    /// Field-level merge (see [`merge_revisions`])
    Merge,
}

impl ConflictPolicy {
    /// Lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictPolicy::Newest => "newest",
            ConflictPolicy::Oldest => "oldest",
            ConflictPolicy::Merge => "merge",
        }
    }

    /// Pick the surviving revision.
    pub fn resolve(
        &self,
        stored: TranscriptUtterance,
        incoming: TranscriptUtterance,
    ) -> TranscriptUtterance {
        match self {
            ConflictPolicy::Newest => {
                if incoming.updated_at >= stored.updated_at {
                    incoming
                } else {
                    stored
                }
            }
            ConflictPolicy::Oldest => {
                if incoming.updated_at < stored.updated_at {
                    incoming
                } else {
                    stored
                }
            }
            ConflictPolicy::Merge => {
                if incoming.updated_at >= stored.updated_at {
                    merge_revisions(stored, incoming)
                } else {
                    merge_revisions(incoming, stored)
                }
            }
        }
    }
}

impl std::fmt::Display for ConflictPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "newest" => Ok(ConflictPolicy::Newest),
            "oldest" => Ok(ConflictPolicy::Oldest),
            "merge" => Ok(ConflictPolicy::Merge),
            other => Err(format!(
                "unknown conflict policy '{}' (expected newest, oldest or merge)",
                other
            )),
        }
    }
}

/// Merge two revisions of one utterance.
///
/// Lifecycle state never regresses (highest rank wins), committed final
/// text is never lost, and draft text and confidence come from the newer
/// revision.
pub fn merge_revisions(
    older: TranscriptUtterance,
    newer: TranscriptUtterance,
) -> TranscriptUtterance {
    let state = if older.state.rank() > newer.state.rank() {
        older.state
    } else {
        newer.state
    };
    let finalized_at = match (older.finalized_at, newer.finalized_at) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    };
    TranscriptUtterance {
        state,
        final_text: newer.final_text.or(older.final_text),
        created_at: older.created_at.min(newer.created_at),
        updated_at: older.updated_at.max(newer.updated_at),
        finalized_at: if state.is_terminal() { finalized_at } else { None },
        ..newer
    }
}

/// Reconstructed state of one session.
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveredSession {
    /// Session id
    pub session_id: SessionId,
    /// Utterances in first-insertion order
    pub utterances: Vec<TranscriptUtterance>,
    /// Utterances whose revisions could not be verified, in first-flagged order
    pub uncertain_entries: Vec<UtteranceId>,
    /// Conflicting revisions resolved by policy
    pub conflicts: u32,
    /// Last utterance terminal and the session idle long enough
    pub complete: bool,
    /// Latest entry timestamp applied to the session
    pub last_activity: Timestamp,
}

impl RecoveredSession {
    fn new(session_id: SessionId, at: Timestamp) -> Self {
        RecoveredSession {
            session_id,
            utterances: Vec::new(),
            uncertain_entries: Vec::new(),
            conflicts: 0,
            complete: false,
            last_activity: at,
        }
    }

    /// Look up an utterance
    pub fn get(&self, utterance_id: &str) -> Option<&TranscriptUtterance> {
        self.utterances.iter().find(|u| u.id == utterance_id)
    }

    /// Whether the utterance was flagged uncertain
    pub fn is_uncertain(&self, utterance_id: &str) -> bool {
        self.uncertain_entries.iter().any(|id| id == utterance_id)
    }

    /// The utterance with the latest `updated_at` (last one on ties)
    pub fn latest(&self) -> Option<&TranscriptUtterance> {
        self.utterances
            .iter()
            .enumerate()
            .max_by_key(|(pos, u)| (u.updated_at, *pos))
            .map(|(_, u)| u)
    }

    fn position(&self, utterance_id: &str) -> Option<usize> {
        self.utterances.iter().position(|u| u.id == utterance_id)
    }

    fn touch(&mut self, at: Timestamp) {
        if at > self.last_activity {
            self.last_activity = at;
        }
    }

    fn flag_uncertain(&mut self, utterance_id: &str) -> bool {
        if self.is_uncertain(utterance_id) {
            return false;
        }
        self.uncertain_entries.push(utterance_id.to_string());
        true
    }

    /// Completeness heuristic: the most recently updated utterance is
    /// terminal and nothing happened for `idle`.
    ///
    /// A long pause in a live session is misread as complete.
    pub fn evaluate_completeness(&mut self, now: Timestamp, idle: Duration) {
        let terminal = self.latest().map(|u| u.is_terminal()).unwrap_or(false);
        self.complete = terminal && now.saturating_duration_since(self.last_activity) >= idle;
    }
}

/// What applying one entry did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// State changed
    Applied,
    /// Resolved against a conflicting revision
    Conflict,
    /// Stamped at or before a tombstone
    Tombstoned,
    /// Delete for an unknown utterance
    UnknownDelete,
    /// Replayed revision identical to the stored one
    Duplicate,
    /// Control or recovery entry, no session effect
    Control,
}

/// Counters kept while reconstructing
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconstructStats {
    /// Entries that changed state
    pub applied: u64,
    /// Conflicts resolved by policy
    pub conflicts: u64,
    /// Entries dropped by tombstones
    pub tombstoned: u64,
    /// Deletes for unknown utterances
    pub unknown_deletes: u64,
    /// Identical replays
    pub duplicates: u64,
    /// Control and recovery entries
    pub control: u64,
    /// Utterances flagged uncertain
    pub uncertain: u64,
    /// Sessions removed by session deletes
    pub sessions_deleted: u64,
}

/// Accumulates sessions from replayed entries.
#[derive(Debug)]
pub struct SessionReconstructor {
    policy: ConflictPolicy,
    sessions: BTreeMap<SessionId, RecoveredSession>,
    session_tombstones: HashMap<SessionId, Timestamp>,
    utterance_tombstones: HashMap<UtteranceId, Timestamp>,
    stats: ReconstructStats,
}

impl SessionReconstructor {
    /// Create an empty reconstructor
    pub fn new(policy: ConflictPolicy) -> Self {
        SessionReconstructor {
            policy,
            sessions: BTreeMap::new(),
            session_tombstones: HashMap::new(),
            utterance_tombstones: HashMap::new(),
            stats: ReconstructStats::default(),
        }
    }

    /// Counters so far
    pub fn stats(&self) -> ReconstructStats {
        self.stats
    }

    /// Apply one entry.
    pub fn apply(&mut self, entry: &WalEntry) -> ApplyOutcome {
        let at = entry.timestamp;
        let outcome = match &entry.payload {
            EntryPayload::UtteranceInsert { utterance } => self.insert(utterance, at),
            EntryPayload::UtteranceUpdate {
                utterance_id,
                session_id,
                patch,
                previous,
            } => self.update(utterance_id, session_id, patch, previous.as_ref(), at),
            EntryPayload::UtteranceDelete {
                utterance_id,
                session_id,
            } => self.delete(utterance_id, session_id, at),
            EntryPayload::SessionCreate { session_id, .. } => {
                if self.session_tombstoned(session_id, at) {
                    ApplyOutcome::Tombstoned
                } else {
                    self.session_mut(session_id, at).touch(at);
                    ApplyOutcome::Applied
                }
            }
            EntryPayload::SessionDelete { session_id, .. } => {
                self.tombstone_session(session_id, at);
                if self.sessions.remove(session_id).is_some() {
                    self.stats.sessions_deleted += 1;
                }
                ApplyOutcome::Applied
            }
            EntryPayload::Checkpoint { .. }
            | EntryPayload::FlushMarker { .. }
            | EntryPayload::RotationMarker { .. }
            | EntryPayload::RecoveryStart { .. }
            | EntryPayload::RecoveryEnd { .. } => ApplyOutcome::Control,
        };

        match outcome {
            ApplyOutcome::Applied => self.stats.applied += 1,
            ApplyOutcome::Conflict => self.stats.conflicts += 1,
            ApplyOutcome::Tombstoned => self.stats.tombstoned += 1,
            ApplyOutcome::UnknownDelete => self.stats.unknown_deletes += 1,
            ApplyOutcome::Duplicate => self.stats.duplicates += 1,
            ApplyOutcome::Control => self.stats.control += 1,
        }
        outcome
    }

    /// Finish: evaluate completeness and hand back the sessions.
    pub fn finish(
        mut self,
        now: Timestamp,
        completion_idle: Duration,
    ) -> (BTreeMap<SessionId, RecoveredSession>, ReconstructStats) {
        for session in self.sessions.values_mut() {
            session.evaluate_completeness(now, completion_idle);
        }
        (self.sessions, self.stats)
    }

    fn insert(&mut self, utterance: &TranscriptUtterance, at: Timestamp) -> ApplyOutcome {
        if self.session_tombstoned(&utterance.session_id, at)
            || self.utterance_tombstoned(&utterance.id, at)
        {
            return ApplyOutcome::Tombstoned;
        }

        let policy = self.policy;
        let session = self.session_mut(&utterance.session_id, at);
        session.touch(at);
        match session.position(&utterance.id) {
            None => {
                session.utterances.push(utterance.clone());
                ApplyOutcome::Applied
            }
            Some(pos) if session.utterances[pos] == *utterance => ApplyOutcome::Duplicate,
            Some(pos) => {
                let stored = session.utterances[pos].clone();
                session.utterances[pos] = policy.resolve(stored, utterance.clone());
                session.conflicts += 1;
                ApplyOutcome::Conflict
            }
        }
    }

    fn update(
        &mut self,
        utterance_id: &str,
        session_id: &str,
        patch: &UtterancePatch,
        previous: Option<&UtteranceSnapshot>,
        at: Timestamp,
    ) -> ApplyOutcome {
        if self.session_tombstoned(session_id, at) || self.utterance_tombstoned(utterance_id, at) {
            return ApplyOutcome::Tombstoned;
        }

        let policy = self.policy;
        let session = self.session_mut(session_id, at);
        session.touch(at);

        let Some(pos) = session.position(utterance_id) else {
            session
                .utterances
                .push(patch.into_utterance(utterance_id, session_id));
            let flagged = session.flag_uncertain(utterance_id);
            if flagged {
                self.stats.uncertain += 1;
            }
            return ApplyOutcome::Applied;
        };

        let stored = session.utterances[pos].clone();
        let verified = previous.map(|snap| snap.matches(&stored)).unwrap_or(false);

        let mut patched = stored.clone();
        patch.apply_to(&mut patched);
        if patched == stored {
            return ApplyOutcome::Duplicate;
        }

        let outcome = if patch.updated_at < stored.updated_at {
            // Revision older than what is stored
            patched.updated_at = patch.updated_at;
            session.utterances[pos] = policy.resolve(stored, patched);
            session.conflicts += 1;
            ApplyOutcome::Conflict
        } else {
            session.utterances[pos] = patched;
            ApplyOutcome::Applied
        };

        if !verified && session.flag_uncertain(utterance_id) {
            self.stats.uncertain += 1;
        }
        outcome
    }

    fn delete(&mut self, utterance_id: &str, session_id: &str, at: Timestamp) -> ApplyOutcome {
        let tombstone = self
            .utterance_tombstones
            .entry(utterance_id.to_string())
            .or_insert(at);
        if at > *tombstone {
            *tombstone = at;
        }

        let Some(session) = self.sessions.get_mut(session_id) else {
            return ApplyOutcome::UnknownDelete;
        };
        match session.position(utterance_id) {
            Some(pos) => {
                session.utterances.remove(pos);
                session.uncertain_entries.retain(|id| id != utterance_id);
                session.touch(at);
                ApplyOutcome::Applied
            }
            None => ApplyOutcome::UnknownDelete,
        }
    }

    fn session_mut(&mut self, session_id: &str, at: Timestamp) -> &mut RecoveredSession {
        self.sessions
            .entry(session_id.to_string())
            .or_insert_with(|| RecoveredSession::new(session_id.to_string(), at))
    }

    fn tombstone_session(&mut self, session_id: &str, at: Timestamp) {
        let tombstone = self
            .session_tombstones
            .entry(session_id.to_string())
            .or_insert(at);
        if at > *tombstone {
            *tombstone = at;
        }
    }

    fn session_tombstoned(&self, session_id: &str, at: Timestamp) -> bool {
        self.session_tombstones
            .get(session_id)
            .map(|t| at <= *t)
            .unwrap_or(false)
    }

    fn utterance_tombstoned(&self, utterance_id: &str, at: Timestamp) -> bool {
        self.utterance_tombstones
            .get(utterance_id)
            .map(|t| at <= *t)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scribe_core::UtteranceState;

    fn ts(ms: u64) -> Timestamp {
        Timestamp::from_millis(ms)
    }

    fn utt(id: &str, text: &str, at: u64) -> TranscriptUtterance {
        TranscriptUtterance::new(id, "s1", text).at(ts(at))
    }

    fn rebuild(
        policy: ConflictPolicy,
        entries: &[WalEntry],
    ) -> BTreeMap<SessionId, RecoveredSession> {
        let mut r = SessionReconstructor::new(policy);
        for e in entries {
            r.apply(e);
        }
        r.finish(ts(1_000_000), Duration::from_secs(60)).0
    }

    #[test]
    fn test_insert_then_verified_update() {
        let u = utt("u1", "hello", 100);
        let patch = UtterancePatch::text("hello world", ts(200));
        let entries = vec![
            WalEntry::insert(u.clone()),
            WalEntry::update("u1", "s1", patch, Some(u.snapshot())),
        ];
        let sessions = rebuild(ConflictPolicy::Newest, &entries);
        let s = &sessions["s1"];
        assert_eq!(s.get("u1").unwrap().text, "hello world");
        assert!(s.uncertain_entries.is_empty());
        assert_eq!(s.last_activity, ts(200));
    }

    #[test]
    fn test_blind_update_is_uncertain() {
        let entries = vec![
            WalEntry::insert(utt("u1", "hello", 100)),
            WalEntry::update("u1", "s1", UtterancePatch::text("hello world", ts(200)), None),
        ];
        let sessions = rebuild(ConflictPolicy::Newest, &entries);
        let s = &sessions["s1"];
        assert_eq!(s.get("u1").unwrap().text, "hello world");
        assert_eq!(s.uncertain_entries, vec!["u1".to_string()]);
    }

    #[test]
    fn test_mismatched_snapshot_is_uncertain() {
        let u = utt("u1", "hello", 100);
        let mut stale = u.snapshot();
        stale.text = "something else".to_string();
        let entries = vec![
            WalEntry::insert(u),
            WalEntry::update("u1", "s1", UtterancePatch::text("x", ts(200)), Some(stale)),
        ];
        assert!(rebuild(ConflictPolicy::Newest, &entries)["s1"].is_uncertain("u1"));
    }

    #[test]
    fn test_update_for_unknown_id_builds_placeholder() {
        let entries = vec![WalEntry::update(
            "ghost",
            "s2",
            UtterancePatch::text("orphan", ts(50)),
            None,
        )];
        let sessions = rebuild(ConflictPolicy::Newest, &entries);
        let s = &sessions["s2"];
        assert_eq!(s.get("ghost").unwrap().text, "orphan");
        assert!(s.is_uncertain("ghost"));
    }

    #[test]
    fn test_unknown_delete_ignored() {
        let mut r = SessionReconstructor::new(ConflictPolicy::Newest);
        r.apply(&WalEntry::insert(utt("u1", "a", 1)));
        assert_eq!(
            r.apply(&WalEntry::delete("nope", "s1", ts(2))),
            ApplyOutcome::UnknownDelete
        );
        assert_eq!(
            r.apply(&WalEntry::delete("nope", "s9", ts(2))),
            ApplyOutcome::UnknownDelete
        );
        let (sessions, stats) = r.finish(ts(10), Duration::from_secs(60));
        assert_eq!(sessions["s1"].utterances.len(), 1);
        assert_eq!(stats.unknown_deletes, 2);
    }

    #[test]
    fn test_conflict_policies() {
        let older = utt("u1", "first", 100);
        let newer = utt("u1", "second", 200);
        let entries = vec![WalEntry::insert(newer.clone()), WalEntry::insert(older.clone())];

        let newest = rebuild(ConflictPolicy::Newest, &entries);
        assert_eq!(newest["s1"].get("u1").unwrap().text, "second");
        assert_eq!(newest["s1"].conflicts, 1);

        let oldest = rebuild(ConflictPolicy::Oldest, &entries);
        assert_eq!(oldest["s1"].get("u1").unwrap().text, "first");
    }

    #[test]
    fn test_merge_keeps_final_state() {
        let finalized = utt("u1", "draft", 100).finalize("Final.", ts(150));
        let late_partial = utt("u1", "late draft", 200);
        let merged = ConflictPolicy::Merge.resolve(finalized, late_partial);
        assert_eq!(merged.state, UtteranceState::Finalized);
        assert_eq!(merged.final_text.as_deref(), Some("Final."));
        assert_eq!(merged.text, "late draft");
        assert_eq!(merged.updated_at, ts(200));
        assert_eq!(merged.finalized_at, Some(ts(150)));
    }

    #[test]
    fn test_duplicate_replay_is_not_a_conflict() {
        let u = utt("u1", "hello", 100);
        let entries = vec![WalEntry::insert(u.clone()), WalEntry::insert(u)];
        let sessions = rebuild(ConflictPolicy::Newest, &entries);
        assert_eq!(sessions["s1"].conflicts, 0);
        assert_eq!(sessions["s1"].utterances.len(), 1);
    }

    #[test]
    fn test_stale_update_under_newest_is_dropped() {
        let u = utt("u1", "current", 500);
        let entries = vec![
            WalEntry::insert(u),
            WalEntry::update("u1", "s1", UtterancePatch::text("stale", ts(300)), None),
        ];
        let sessions = rebuild(ConflictPolicy::Newest, &entries);
        assert_eq!(sessions["s1"].get("u1").unwrap().text, "current");
        assert_eq!(sessions["s1"].conflicts, 1);
    }

    #[test]
    fn test_session_delete_is_authoritative() {
        let u = utt("u1", "secret", 100);
        let entries = vec![
            WalEntry::insert(u.clone()),
            WalEntry::session_delete("s1", "privacy", ts(200)),
            // Duplicate from a retried flush lands after the delete
            WalEntry::insert(u),
        ];
        let sessions = rebuild(ConflictPolicy::Newest, &entries);
        assert!(!sessions.contains_key("s1"));
    }

    #[test]
    fn test_session_reused_after_delete() {
        let entries = vec![
            WalEntry::insert(utt("u1", "old", 100)),
            WalEntry::session_delete("s1", "privacy", ts(200)),
            WalEntry::insert(utt("u2", "new", 300)),
        ];
        let sessions = rebuild(ConflictPolicy::Newest, &entries);
        let s = &sessions["s1"];
        assert!(s.get("u1").is_none());
        assert_eq!(s.get("u2").unwrap().text, "new");
    }

    #[test]
    fn test_utterance_delete_tombstone() {
        let u = utt("u1", "gone", 100);
        let entries = vec![
            WalEntry::insert(u.clone()),
            WalEntry::delete("u1", "s1", ts(150)),
            WalEntry::insert(u),
        ];
        let sessions = rebuild(ConflictPolicy::Newest, &entries);
        assert!(sessions["s1"].utterances.is_empty());
    }

    #[test]
    fn test_completeness() {
        let done = utt("u1", "a", 100).finalize("A.", ts(1_000));
        let mut r = SessionReconstructor::new(ConflictPolicy::Newest);
        r.apply(&WalEntry::insert(done));

        let (sessions, _) = r.finish(ts(1_000 + 59_000), Duration::from_secs(60));
        assert!(!sessions["s1"].complete);

        let mut s = sessions["s1"].clone();
        s.evaluate_completeness(ts(1_000 + 60_000), Duration::from_secs(60));
        assert!(s.complete);

        s.utterances.push(utt("u2", "still talking", 2_000));
        s.evaluate_completeness(ts(1_000_000), Duration::from_secs(60));
        assert!(!s.complete);
    }

    #[test]
    fn test_control_entries_ignored() {
        let mut r = SessionReconstructor::new(ConflictPolicy::Newest);
        let marker = WalEntry::new(
            ts(1),
            EntryPayload::FlushMarker {
                sequence: 1,
                entry_count: 3,
            },
        );
        assert_eq!(r.apply(&marker), ApplyOutcome::Control);
        let (sessions, stats) = r.finish(ts(2), Duration::from_secs(60));
        assert!(sessions.is_empty());
        assert_eq!(stats.control, 1);
    }

    #[test]
    fn test_policy_from_str() {
        assert_eq!("Newest".parse::<ConflictPolicy>(), Ok(ConflictPolicy::Newest));
        assert_eq!("merge".parse::<ConflictPolicy>(), Ok(ConflictPolicy::Merge));
        assert!("latest".parse::<ConflictPolicy>().is_err());
    }
}
