//! Report → human/json string formatting.
//!
//! Two modes:
//! - **Human** (default): aligned text, one entry per line
//! - **JSON** (`--json`): `serde_json::to_string_pretty`

use scribe_durability::{
    EntryPayload, RecoveryReport, StorageReport, StreamItem, WalEntry, WalFileInfo,
};
use serde_json::{json, Value};

use crate::wal_file::Inspection;

/// Output formatting mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Human,
    Json,
}

/// Format an error.
pub fn format_error(err: &str, mode: OutputMode) -> String {
    match mode {
        OutputMode::Json => pretty(json!({ "error": err })),
        OutputMode::Human => format!("(error) {}", err),
    }
}

/// Format an `inspect` result.
pub fn format_inspection(inspection: &Inspection, mode: OutputMode) -> String {
    match mode {
        OutputMode::Json => pretty(inspection_json(inspection)),
        OutputMode::Human => inspection_human(inspection),
    }
}

/// Format a dry-run recovery report.
pub fn format_recovery(report: &RecoveryReport, mode: OutputMode, list: bool) -> String {
    match mode {
        OutputMode::Json => pretty(recovery_json(report, list)),
        OutputMode::Human => recovery_human(report, list),
    }
}

/// Format a storage evaluation with the files it was sampled from.
pub fn format_status(report: &StorageReport, files: &[WalFileInfo], mode: OutputMode) -> String {
    match mode {
        OutputMode::Json => {
            let files: Vec<Value> = files
                .iter()
                .map(|f| {
                    json!({
                        "file": f.file_name(),
                        "created_at": f.created_at.as_millis(),
                        "size": f.size,
                    })
                })
                .collect();
            let report = serde_json::to_value(report)
                .unwrap_or_else(|e| json!({ "error": e.to_string() }));
            pretty(json!({ "report": report, "files": files }))
        }
        OutputMode::Human => status_human(report, files),
    }
}

fn pretty(value: Value) -> String {
    serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string())
}

fn entry_summary(entry: &WalEntry) -> String {
    match &entry.payload {
        EntryPayload::UtteranceInsert { utterance } => format!(
            "{}/{} [{}] {:?}",
            utterance.session_id,
            utterance.id,
            utterance.state.as_str(),
            utterance.display_text()
        ),
        EntryPayload::UtteranceUpdate {
            utterance_id,
            session_id,
            patch,
            previous,
        } => {
            let mut fields = Vec::new();
            if let Some(state) = patch.state {
                fields.push(format!("state={}", state.as_str()));
            }
            if let Some(text) = &patch.text {
                fields.push(format!("text={:?}", text));
            }
            if let Some(final_text) = &patch.final_text {
                fields.push(format!("final={:?}", final_text));
            }
            if let Some(confidence) = patch.confidence {
                fields.push(format!("confidence={:.2}", confidence));
            }
            if previous.is_none() {
                fields.push("no-previous".to_string());
            }
            format!("{}/{} {}", session_id, utterance_id, fields.join(" "))
        }
        EntryPayload::UtteranceDelete {
            utterance_id,
            session_id,
        } => format!("{}/{}", session_id, utterance_id),
        EntryPayload::SessionCreate { session_id, .. } => session_id.clone(),
        EntryPayload::SessionDelete { session_id, reason } => {
            format!("{} reason={}", session_id, reason)
        }
        EntryPayload::Checkpoint {
            sequence,
            session_count,
            utterance_count,
        } => format!(
            "#{} sessions={} utterances={}",
            sequence, session_count, utterance_count
        ),
        EntryPayload::FlushMarker {
            sequence,
            entry_count,
        } => format!("#{} entries={}", sequence, entry_count),
        EntryPayload::RotationMarker {
            previous_file,
            reason,
        } => format!("from {} reason={}", previous_file, reason),
        EntryPayload::RecoveryStart { node_id } => format!("node={}", node_id),
        EntryPayload::RecoveryEnd {
            status,
            sessions_recovered,
            utterances_recovered,
        } => format!(
            "{} sessions={} utterances={}",
            status, sessions_recovered, utterances_recovered
        ),
    }
}

fn inspection_human(inspection: &Inspection) -> String {
    let mut out = Vec::new();
    out.push(format!("{} ({} bytes)", inspection.path.display(), inspection.len));
    match &inspection.header {
        Ok(header) => {
            out.push(format!(
                "header: v{} created={} node={}{}",
                header.version,
                header.created_at,
                header.node_id,
                header
                    .session_id
                    .as_ref()
                    .map(|s| format!(" session={}", s))
                    .unwrap_or_default()
            ));
        }
        Err(e) => out.push(format!("header: (invalid) {}", e)),
    }

    for item in &inspection.items {
        match item {
            StreamItem::Entry(decoded) => out.push(format!(
                "{:>8}  {:<17} {:>15}  {}",
                decoded.offset,
                decoded.entry.entry_type().description(),
                decoded.entry.timestamp.to_string(),
                entry_summary(&decoded.entry)
            )),
            StreamItem::Skipped(skip) => out.push(format!(
                "{:>8}  (skipped {} bytes) {}",
                skip.offset, skip.skipped_bytes, skip.reason
            )),
        }
    }

    let mut footer = format!(
        "{} entries, {} bytes skipped",
        inspection.entry_count(),
        inspection.skipped_bytes()
    );
    if inspection.truncated {
        footer.push_str(" (limit reached)");
    }
    out.push(footer);
    out.join("\n")
}

fn inspection_json(inspection: &Inspection) -> Value {
    let header = match &inspection.header {
        Ok(header) => json!({
            "version": header.version,
            "created_at": header.created_at.as_millis(),
            "node_id": header.node_id.to_string(),
            "session_id": header.session_id,
        }),
        Err(e) => json!({ "error": e }),
    };
    let items: Vec<Value> = inspection
        .items
        .iter()
        .map(|item| match item {
            StreamItem::Entry(decoded) => json!({
                "offset": decoded.offset,
                "len": decoded.len,
                "type": decoded.entry.entry_type().description(),
                "timestamp": decoded.entry.timestamp.as_millis(),
                "session_id": decoded.entry.session_id(),
                "utterance_id": decoded.entry.utterance_id(),
                "summary": entry_summary(&decoded.entry),
            }),
            StreamItem::Skipped(skip) => json!({
                "offset": skip.offset,
                "skipped_bytes": skip.skipped_bytes,
                "reason": skip.reason.to_string(),
            }),
        })
        .collect();
    json!({
        "path": inspection.path.display().to_string(),
        "bytes": inspection.len,
        "header": header,
        "items": items,
        "entries": inspection.entry_count(),
        "skipped_bytes": inspection.skipped_bytes(),
        "truncated": inspection.truncated,
    })
}

fn recovery_human(report: &RecoveryReport, list: bool) -> String {
    let stats = &report.stats;
    let mut out = vec![
        format!(
            "status: {} in {}ms",
            report.status,
            report.duration.as_millis()
        ),
        format!(
            "files: {} discovered, {} processed, {} failed, {} capped",
            stats.files_discovered, stats.files_processed, stats.files_failed, stats.files_capped
        ),
        format!(
            "entries: {} read, {} applied, {} tombstoned, {} duplicates, {} control",
            stats.entries_read,
            stats.entries_applied,
            stats.entries_tombstoned,
            stats.duplicates,
            stats.control_entries
        ),
        format!(
            "corruption: {} regions, {} bytes skipped",
            stats.corrupted_regions, stats.skipped_bytes
        ),
        format!(
            "conflicts: {}, uncertain: {}, sessions deleted: {}",
            stats.conflicts, stats.uncertain_entries, stats.sessions_deleted
        ),
        format!(
            "recovered: {} sessions, {} utterances",
            stats.sessions_recovered, stats.utterances_recovered
        ),
    ];

    for session in report.sessions.values() {
        out.push(format!(
            "  {} utterances={} uncertain={} conflicts={} {}",
            session.session_id,
            session.utterances.len(),
            session.uncertain_entries.len(),
            session.conflicts,
            if session.complete { "complete" } else { "open" }
        ));
        if list {
            for utterance in &session.utterances {
                let flag = if session.is_uncertain(&utterance.id) {
                    " (uncertain)"
                } else {
                    ""
                };
                out.push(format!(
                    "    {} [{}] {:?}{}",
                    utterance.id,
                    utterance.state.as_str(),
                    utterance.display_text(),
                    flag
                ));
            }
        }
    }

    for warning in &report.warnings {
        out.push(format!("warning: {}", warning));
    }
    for error in &report.errors {
        out.push(format!("error: {}", error));
    }
    out.join("\n")
}

fn recovery_json(report: &RecoveryReport, list: bool) -> Value {
    let stats = &report.stats;
    let sessions: Vec<Value> = report
        .sessions
        .values()
        .map(|session| {
            let mut value = json!({
                "session_id": session.session_id,
                "utterances": session.utterances.len(),
                "uncertain_entries": session.uncertain_entries,
                "conflicts": session.conflicts,
                "complete": session.complete,
                "last_activity": session.last_activity.as_millis(),
            });
            if list {
                value["items"] = serde_json::to_value(&session.utterances)
                    .unwrap_or_else(|e| json!({ "error": e.to_string() }));
            }
            value
        })
        .collect();
    json!({
        "status": report.status.as_str(),
        "duration_ms": report.duration.as_millis() as u64,
        "stats": {
            "files_discovered": stats.files_discovered,
            "files_capped": stats.files_capped,
            "files_processed": stats.files_processed,
            "files_failed": stats.files_failed,
            "entries_read": stats.entries_read,
            "entries_applied": stats.entries_applied,
            "entries_tombstoned": stats.entries_tombstoned,
            "duplicates": stats.duplicates,
            "unknown_deletes": stats.unknown_deletes,
            "control_entries": stats.control_entries,
            "corrupted_regions": stats.corrupted_regions,
            "skipped_bytes": stats.skipped_bytes,
            "conflicts": stats.conflicts,
            "uncertain_entries": stats.uncertain_entries,
            "sessions_deleted": stats.sessions_deleted,
            "sessions_recovered": stats.sessions_recovered,
            "utterances_recovered": stats.utterances_recovered,
        },
        "sessions": sessions,
        "warnings": report.warnings,
        "errors": report.errors.iter().map(ToString::to_string).collect::<Vec<_>>(),
    })
}

fn status_human(report: &StorageReport, files: &[WalFileInfo]) -> String {
    let mut out = vec![format!("status: {}", report.status)];
    if let Some(sample) = &report.latest {
        out.push(format!(
            "wal: {} bytes in {} files",
            sample.wal_size, sample.file_count
        ));
        if let Some(used) = sample.disk_used_percent() {
            out.push(format!("disk: {:.1}% used", used));
        }
    }
    if let Some(rate) = report.growth_rate {
        out.push(format!("growth: {:.0} bytes/hour", rate));
    }
    if let Some(eta) = report.time_to_full {
        out.push(format!("time to limit: {}s", eta.as_secs()));
    }
    for alert in &report.alerts {
        out.push(format!("alert [{}] {}", alert.severity, alert.message));
    }
    for file in files {
        out.push(format!("  {:<28} {:>12}", file.file_name(), file.size));
    }
    out.join("\n")
}
