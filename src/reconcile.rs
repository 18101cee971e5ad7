//! Per-album diff between the host's and the client's item lists

use std::collections::HashSet;

/// Result of reconciling one album.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AlbumDiff {
    /// Host item names absent from the client list; these were deleted on
    /// the client and should be deleted here too.
    pub deletions: Vec<String>,
    /// Client item indices absent from the host list, in reverse
    /// client-list order. The client reports newest first, so reverse order
    /// transfers the oldest missing items ahead of the newest.
    pub additions: Vec<usize>,
}

/// Compare one album's host and client manifests. Items present on both
/// sides are untouched.
pub fn diff_album(host_items: &[String], client_items: &[String]) -> AlbumDiff {
    let host: HashSet<&str> = host_items.iter().map(String::as_str).collect();
    let client: HashSet<&str> = client_items.iter().map(String::as_str).collect();

    let deletions = host_items
        .iter()
        .filter(|name| !client.contains(name.as_str()))
        .cloned()
        .collect();

    let additions = client_items
        .iter()
        .enumerate()
        .rev()
        .filter(|(_, name)| !host.contains(name.as_str()))
        .map(|(index, _)| index)
        .collect();

    AlbumDiff { deletions, additions }
}
