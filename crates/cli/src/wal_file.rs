//! Reading a single WAL file for `inspect`.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use scribe_durability::{StreamItem, WalDecoder, WalFileHeader};

/// Everything `inspect` prints about one file.
#[derive(Debug)]
pub struct Inspection {
    pub path: PathBuf,
    /// Bytes after decompression
    pub len: usize,
    pub header: Result<WalFileHeader, String>,
    pub items: Vec<StreamItem>,
    /// More entries follow past the `--limit`
    pub truncated: bool,
}

impl Inspection {
    pub fn entry_count(&self) -> usize {
        self.items
            .iter()
            .filter(|item| matches!(item, StreamItem::Entry(_)))
            .count()
    }

    pub fn skipped_bytes(&self) -> usize {
        self.items
            .iter()
            .map(|item| match item {
                StreamItem::Skipped(skip) => skip.skipped_bytes,
                StreamItem::Entry(_) => 0,
            })
            .sum()
    }
}

/// Read `path` (gunzipping `.gz` archives) and decode it.
///
/// A bad file header is reported, not fatal: entries are then decoded from
/// the start of the file so a damaged header does not hide intact entries.
pub fn inspect_file(path: &Path, limit: Option<usize>) -> Result<Inspection, String> {
    let bytes = read_wal_bytes(path)?;
    let (header, offset) = match WalFileHeader::from_bytes(&bytes) {
        Ok((header, len)) => (Ok(header), len),
        Err(e) => (Err(e.to_string()), 0),
    };

    let limit = limit.unwrap_or(usize::MAX);
    let mut items = Vec::new();
    let mut entries = 0usize;
    let mut truncated = false;
    for item in WalDecoder::stream_from(&bytes, offset) {
        if matches!(item, StreamItem::Entry(_)) {
            if entries == limit {
                truncated = true;
                break;
            }
            entries += 1;
        }
        items.push(item);
    }

    Ok(Inspection {
        path: path.to_path_buf(),
        len: bytes.len(),
        header,
        items,
        truncated,
    })
}

fn read_wal_bytes(path: &Path) -> Result<Vec<u8>, String> {
    let raw = fs::read(path).map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
    if path.extension().and_then(|ext| ext.to_str()) != Some("gz") {
        return Ok(raw);
    }
    let mut bytes = Vec::new();
    GzDecoder::new(raw.as_slice())
        .read_to_end(&mut bytes)
        .map_err(|e| format!("cannot decompress {}: {}", path.display(), e))?;
    Ok(bytes)
}
