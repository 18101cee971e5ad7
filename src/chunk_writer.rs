//! Chunked destination writes for the active transfer request
//!
//! Parts carry no offset on the wire; strictly increasing part order is the
//! sole correctness guarantee.

use anyhow::{bail, Context, Result};
use filetime::{set_file_mtime, FileTime};
use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

use crate::session::TransferRequest;

/// Write one received part to `path` at the offset implied by the request's
/// part index. Returns true when this was the last part; the file's mtime is
/// then stamped with the request's last_modified. Returns false after
/// advancing the request to the next part.
///
/// A zero-length payload is invalid: nothing is written, the part index is
/// not advanced, and the caller should re-request the same part.
pub fn manage_write_data(request: &mut TransferRequest, bytes: &[u8], path: &Path) -> Result<bool> {
    if bytes.is_empty() {
        bail!("received empty part {} for {}", request.part_index, path.display());
    }

    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .open(path)
        .with_context(|| format!("open {}", path.display()))?;

    if request.part_index == 0 {
        // Pre-size to the declared size (full pre-allocation for items) or
        // to the observed chunk when no size was declared (metadata). Also
        // drops stale bytes when replacing a longer existing file.
        let len = request.size.max(bytes.len() as u64);
        file.set_len(len).with_context(|| format!("pre-size {}", path.display()))?;
    }

    let offset = request.part_index as u64 * request.part_max_size;
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(bytes).with_context(|| format!("write {}", path.display()))?;
    drop(file);

    if request.part_index + 1 == request.parts {
        set_file_mtime(path, FileTime::from_unix_time(request.last_modified, 0))
            .with_context(|| format!("set mtime on {}", path.display()))?;
        return Ok(true);
    }

    request.advance_part();
    Ok(false)
}
