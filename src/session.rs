//! Sync protocol state machine
//!
//! One session exists per process. Inbound control messages and binary
//! frames arrive from the transport; the three sync operations are invoked
//! by the hosting application. All state lives behind one mutex, so the
//! operations may be called from any thread while a connection is live.

use anyhow::{bail, Result};
use filetime::FileTime;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;

use crate::chunk_writer;
use crate::events::EventBus;
use crate::library::{AlbumLibrary, ItemFilter};
use crate::protocol::{ClientMessage, HostMessage, MAX_FRAME_SIZE};
use crate::reconcile;

/// item_index value marking an album-level metadata transfer.
pub const METADATA_INDEX: i64 = -1;

/// The transfer being filled right now; at most one is active.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub album_index: usize,
    /// Client item index, or -1 for an album-level metadata transfer.
    pub item_index: i64,
    pub last_modified: i64,
    pub size: u64,
    pub part_index: u32,
    pub part_max_size: u64,
    pub parts: u32,
}

impl TransferRequest {
    pub fn for_item(
        album_index: usize,
        item_index: usize,
        last_modified: i64,
        size: u64,
        max_part_size: u64,
        parts: u32,
    ) -> Self {
        Self {
            album_index,
            item_index: item_index as i64,
            last_modified,
            size,
            part_index: 0,
            part_max_size: max_part_size,
            parts,
        }
    }

    /// Metadata declares no size up front and arrives as a single frame.
    pub fn for_metadata(album_index: usize, last_modified: i64) -> Self {
        Self {
            album_index,
            item_index: METADATA_INDEX,
            last_modified,
            size: 0,
            part_index: 0,
            part_max_size: 0,
            parts: 1,
        }
    }

    pub fn advance_part(&mut self) {
        self.part_index += 1;
    }

    pub fn is_metadata(&self) -> bool {
        self.item_index < 0
    }
}

/// One pending unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueItem {
    pub album_index: usize,
    pub item_index: i64,
}

/// Frames queued for the connection's writer task.
#[derive(Debug)]
pub enum Outbound {
    Text(String),
    Binary(Vec<u8>),
}

#[derive(Default)]
struct SessionState {
    is_running: bool,
    is_connected: bool,
    is_syncing: bool,
    client_manifests: Vec<Vec<String>>,
    queue: Vec<QueueItem>,
    queue_cursor: i64,
    active_request: Option<TransferRequest>,
    outbound: Option<UnboundedSender<Outbound>>,
}

pub struct SyncSession {
    library: AlbumLibrary,
    events: Arc<EventBus>,
    state: Mutex<SessionState>,
}

impl SyncSession {
    pub fn new(library: AlbumLibrary, events: Arc<EventBus>) -> Self {
        Self { library, events, state: Mutex::new(SessionState::default()) }
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().is_connected
    }

    pub fn is_syncing(&self) -> bool {
        self.state.lock().is_syncing
    }

    pub fn set_running(&self, running: bool) {
        self.state.lock().is_running = running;
    }

    /// A connection was accepted; outbound frames go through `tx`.
    pub fn connection_opened(&self, tx: UnboundedSender<Outbound>) {
        let mut st = self.state.lock();
        st.is_connected = true;
        st.outbound = Some(tx);
    }

    /// The connection closed. Discards manifests, queue and active request;
    /// there is no resume across reconnects.
    pub fn connection_closed(&self) {
        let mut st = self.state.lock();
        st.is_connected = false;
        st.is_syncing = false;
        st.client_manifests.clear();
        st.queue.clear();
        st.queue_cursor = 0;
        st.active_request = None;
        st.outbound = None;
    }

    fn send(st: &SessionState, msg: HostMessage) {
        if let Some(tx) = &st.outbound {
            let _ = tx.send(Outbound::Text(msg.to_json()));
        }
    }

    fn send_binary(st: &SessionState, bytes: Vec<u8>) {
        if let Some(tx) = &st.outbound {
            let _ = tx.send(Outbound::Binary(bytes));
        }
    }

    fn can_use(&self, st: &SessionState, op: &str) -> bool {
        if !st.is_running {
            self.events.log(&format!("{op} skipped: server is not running"));
            false
        } else if !st.is_connected {
            self.events.log(&format!("{op} skipped: no client connected"));
            false
        } else if st.is_syncing {
            self.events.log(&format!("{op} skipped: a sync is already in progress"));
            false
        } else {
            true
        }
    }

    // Inbound dispatch

    /// Handle one inbound control message. Malformed or unknown messages
    /// are logged and discarded without touching any state.
    pub fn handle_text(&self, raw: &str) {
        let msg: ClientMessage = match serde_json::from_str(raw) {
            Ok(msg) => msg,
            Err(e) => {
                self.events.log(&format!("Discarding unrecognized message: {e}"));
                return;
            }
        };
        match msg {
            ClientMessage::EndSync { message } => self.action_end_sync(message),
            ClientMessage::Albums { albums } => self.action_albums(albums),
            ClientMessage::ItemInfo {
                album_index,
                item_index,
                last_modified,
                size,
                max_part_size,
                parts,
            } => self.action_item_info(album_index, item_index, last_modified, size, max_part_size, parts),
            ClientMessage::MetadataInfo { album_index, last_modified } => {
                self.action_metadata_info(album_index, last_modified)
            }
            ClientMessage::RequestMetadataInfo { album_index } => {
                self.action_send_metadata_info(album_index)
            }
            ClientMessage::RequestMetadataData { album_index } => {
                self.action_send_metadata_data(album_index)
            }
        }
    }

    fn action_end_sync(&self, message: Option<String>) {
        let mut st = self.state.lock();
        st.is_syncing = false;
        st.queue.clear();
        st.active_request = None;
        drop(st);
        if let Some(message) = message {
            self.events.log(&message);
        }
    }

    fn action_albums(&self, albums: Vec<Vec<String>>) {
        let count = albums.len();
        self.state.lock().client_manifests = albums;
        self.events.log(&format!("Received client albums list ({count} albums)"));
    }

    fn action_item_info(
        &self,
        album_index: usize,
        item_index: usize,
        last_modified: i64,
        size: u64,
        max_part_size: u64,
        parts: u32,
    ) {
        let mut st = self.state.lock();
        if !st.is_syncing {
            drop(st);
            self.events.log("Ignoring itemInfo outside of a sync");
            return;
        }
        st.active_request = Some(TransferRequest::for_item(
            album_index,
            item_index,
            last_modified,
            size,
            max_part_size,
            parts,
        ));
        Self::send(&st, HostMessage::RequestItemData { album_index, item_index, part: 0 });
    }

    fn action_metadata_info(&self, album_index: usize, last_modified: i64) {
        let mut st = self.state.lock();
        if !st.is_syncing {
            drop(st);
            self.events.log("Ignoring metadataInfo outside of a sync");
            return;
        }
        st.active_request = Some(TransferRequest::for_metadata(album_index, last_modified));
        Self::send(&st, HostMessage::RequestMetadataData { album_index });
    }

    // Serving path: the client pulls the host's metadata during an upload.

    fn action_send_metadata_info(&self, album_index: usize) {
        let Some(link) = self.library.links().get(album_index) else {
            self.events.log(&format!("Ignoring requestMetadataInfo for unknown album {album_index}"));
            return;
        };
        let last_modified = match std::fs::metadata(&link.metadata_path) {
            Ok(md) => FileTime::from_last_modification_time(&md).unix_seconds(),
            Err(e) => {
                self.events
                    .log(&format!("Cannot stat {}: {e}", link.metadata_path.display()));
                return;
            }
        };
        let st = self.state.lock();
        Self::send(&st, HostMessage::MetadataInfo { album_index, last_modified });
    }

    fn action_send_metadata_data(&self, album_index: usize) {
        let Some(link) = self.library.links().get(album_index) else {
            self.events.log(&format!("Ignoring requestMetadataData for unknown album {album_index}"));
            return;
        };
        let bytes = match std::fs::read(&link.metadata_path) {
            Ok(bytes) => bytes,
            Err(e) => {
                self.events
                    .log(&format!("Cannot read {}: {e}", link.metadata_path.display()));
                return;
            }
        };
        if bytes.len() > MAX_FRAME_SIZE {
            self.events.log(&format!(
                "Metadata file {} exceeds the frame limit ({} bytes)",
                link.metadata_path.display(),
                bytes.len()
            ));
            return;
        }
        // Sending is never chunked, only receiving is
        let st = self.state.lock();
        Self::send_binary(&st, bytes);
    }

    // Binary routing

    /// Route a binary frame to the chunked writer against the active
    /// request. item_index >= 0 means item data, -1 metadata data.
    pub fn handle_binary(&self, bytes: &[u8]) {
        let mut st = self.state.lock();
        let Some(mut request) = st.active_request.take() else {
            drop(st);
            self.events.log("Discarding binary frame: no active request");
            return;
        };

        let destination = match self.destination_for(&st, &request) {
            Ok(path) => path,
            Err(e) => {
                self.events.log(&format!("Discarding binary frame: {e}"));
                st.active_request = Some(request);
                return;
            }
        };

        match chunk_writer::manage_write_data(&mut request, bytes, &destination) {
            Ok(true) => {
                let position = (st.queue_cursor + 1).max(0) as usize;
                let total = st.queue.len();
                let percent = if total > 0 { position * 100 / total } else { 100 };
                self.events.log(&format!(
                    "Transferred {} ({position}/{total}, {percent}%)",
                    destination.display()
                ));
                if request.is_metadata() {
                    self.request_next_queue_metadata(&mut st);
                } else {
                    self.request_next_queue_item(&mut st);
                }
            }
            Ok(false) => {
                // Ask for the next part; the writer advanced part_index
                self.request_part(&st, &request);
                st.active_request = Some(request);
            }
            Err(e) => {
                // Invalid part: state untouched, re-request the same part
                self.events.log(&format!("{e:#}; requesting part again"));
                self.request_part(&st, &request);
                st.active_request = Some(request);
            }
        }
    }

    fn request_part(&self, st: &SessionState, request: &TransferRequest) {
        if request.is_metadata() {
            Self::send(st, HostMessage::RequestMetadataData { album_index: request.album_index });
        } else {
            Self::send(
                st,
                HostMessage::RequestItemData {
                    album_index: request.album_index,
                    item_index: request.item_index as usize,
                    part: request.part_index,
                },
            );
        }
    }

    fn destination_for(&self, st: &SessionState, request: &TransferRequest) -> Result<PathBuf> {
        let Some(link) = self.library.links().get(request.album_index) else {
            bail!("no link for album {}", request.album_index);
        };
        if request.is_metadata() {
            return Ok(link.metadata_path.clone());
        }
        let name = st
            .client_manifests
            .get(request.album_index)
            .and_then(|manifest| manifest.get(request.item_index as usize));
        let Some(name) = name else {
            bail!("no client manifest entry for album {} item {}", request.album_index, request.item_index);
        };
        safe_item_name(name)?;
        Ok(link.album_path.join(name))
    }

    // Sync operations

    /// Reconcile every album against the client's manifests: delete host
    /// items the client no longer has, then pull missing items one by one.
    pub fn download_albums(&self) {
        let mut st = self.state.lock();
        if !self.can_use(&st, "Album download") {
            return;
        }

        let filter = ItemFilter::all();
        let mut host_manifests = Vec::with_capacity(self.library.links().len());
        for link in self.library.links() {
            match self.library.list_items(&link.album_path, &filter) {
                Ok(items) => host_manifests.push(items),
                Err(e) => {
                    self.events.log(&format!("Album download aborted: {e:#}"));
                    return;
                }
            }
        }

        if st.client_manifests.is_empty() {
            self.events
                .log("Album download aborted: no albums list received from the client yet");
            return;
        }
        if st.client_manifests.len() != host_manifests.len() {
            self.events.log(&format!(
                "Album download aborted: album count mismatch (host has {}, client reports {})",
                host_manifests.len(),
                st.client_manifests.len()
            ));
            return;
        }

        st.is_syncing = true;
        st.queue.clear();
        let client_manifests = st.client_manifests.clone();
        let mut deleted = 0usize;
        for (album_index, client_items) in client_manifests.iter().enumerate() {
            let diff = reconcile::diff_album(&host_manifests[album_index], client_items);
            let album_path = &self.library.links()[album_index].album_path;
            for name in &diff.deletions {
                let path = album_path.join(name);
                match std::fs::remove_file(&path) {
                    Ok(()) => {
                        deleted += 1;
                        self.events.log(&format!("Deleted {} (removed on client)", path.display()));
                    }
                    Err(e) => {
                        self.events.log(&format!("Failed to delete {}: {e}", path.display()));
                    }
                }
            }
            for item_index in diff.additions {
                st.queue.push(QueueItem { album_index, item_index: item_index as i64 });
            }
        }

        self.events.log(&format!(
            "Album download started ({} items queued, {deleted} deleted)",
            st.queue.len()
        ));
        st.queue_cursor = -1;
        self.request_next_queue_item(&mut st);
    }

    /// Pull every album's metadata file from the client.
    pub fn download_metadata(&self) {
        let mut st = self.state.lock();
        if !self.can_use(&st, "Metadata download") {
            return;
        }
        if !self.require_metadata_files("Metadata download") {
            return;
        }

        st.is_syncing = true;
        st.queue = self
            .library
            .links()
            .iter()
            .enumerate()
            .map(|(album_index, _)| QueueItem { album_index, item_index: METADATA_INDEX })
            .collect();
        self.events
            .log(&format!("Metadata download started ({} albums)", st.queue.len()));
        st.queue_cursor = -1;
        self.request_next_queue_metadata(&mut st);
    }

    /// Offer the host's metadata files to the client; the client drives the
    /// rest of the exchange and finishes with endSync.
    pub fn upload_metadata(&self) {
        let mut st = self.state.lock();
        if !self.can_use(&st, "Metadata upload") {
            return;
        }
        if !self.require_metadata_files("Metadata upload") {
            return;
        }

        st.is_syncing = true;
        Self::send(&st, HostMessage::StartMetadataRequest);
        self.events.log("Metadata upload started; waiting for client requests");
    }

    fn require_metadata_files(&self, op: &str) -> bool {
        for link in self.library.links() {
            if !link.metadata_path.exists() {
                self.events.log(&format!(
                    "{op} aborted: missing metadata file {}",
                    link.metadata_path.display()
                ));
                return false;
            }
        }
        true
    }

    // Queue advance

    fn request_next_queue_item(&self, st: &mut SessionState) {
        if !st.is_connected {
            return;
        }
        st.queue_cursor += 1;
        let cursor = st.queue_cursor as usize;
        if cursor >= st.queue.len() {
            st.is_syncing = false;
            st.active_request = None;
            self.events
                .log(&format!("Album download complete ({} items)", st.queue.len()));
            return;
        }
        let entry = st.queue[cursor];
        Self::send(
            st,
            HostMessage::RequestItemInfo {
                album_index: entry.album_index,
                item_index: entry.item_index as usize,
                queue_index: cursor,
                queue_size: st.queue.len(),
            },
        );
    }

    fn request_next_queue_metadata(&self, st: &mut SessionState) {
        if !st.is_connected {
            return;
        }
        st.queue_cursor += 1;
        let cursor = st.queue_cursor as usize;
        if cursor >= st.queue.len() {
            st.is_syncing = false;
            st.active_request = None;
            self.events
                .log(&format!("Metadata download complete ({} albums)", st.queue.len()));
            return;
        }
        let entry = st.queue[cursor];
        Self::send(
            st,
            HostMessage::RequestMetadataInfo {
                album_index: entry.album_index,
                queue_index: cursor,
                queue_size: st.queue.len(),
            },
        );
    }

    #[cfg(test)]
    fn queue_len(&self) -> usize {
        self.state.lock().queue.len()
    }
}

/// Client-supplied item names become path components on the host; anything
/// that could escape the album directory is rejected.
fn safe_item_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\\')
        || name.contains('\0')
    {
        bail!("unsafe item name {name:?}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::library::Link;
    use serde_json::Value;
    use tempfile::TempDir;
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    struct Fixture {
        session: SyncSession,
        rx: UnboundedReceiver<Outbound>,
        dir: TempDir,
    }

    /// Build a library with one album dir + metadata file per entry, and a
    /// connected, running session.
    fn fixture(albums: &[(&str, &[&str])]) -> Fixture {
        let dir = TempDir::new().unwrap();
        let mut links = Vec::new();
        for (album, items) in albums {
            let album_path = dir.path().join(album);
            std::fs::create_dir_all(&album_path).unwrap();
            for item in *items {
                std::fs::write(album_path.join(item), b"host-data").unwrap();
            }
            let metadata_path = dir.path().join(format!("{album}.json"));
            std::fs::write(&metadata_path, format!("{{\"album\":\"{album}\"}}")).unwrap();
            links.push(Link { album_path, metadata_path });
        }

        let session = SyncSession::new(AlbumLibrary::new(links), Arc::new(EventBus::new()));
        let (tx, rx) = mpsc::unbounded_channel();
        session.set_running(true);
        session.connection_opened(tx);
        Fixture { session, rx, dir }
    }

    fn drain(rx: &mut UnboundedReceiver<Outbound>) -> Vec<Outbound> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    fn as_json(out: &Outbound) -> Value {
        match out {
            Outbound::Text(s) => serde_json::from_str(s).unwrap(),
            Outbound::Binary(_) => panic!("expected text frame"),
        }
    }

    fn send_albums(session: &SyncSession, albums: &[&[&str]]) {
        let lists: Vec<Vec<&str>> = albums.iter().map(|a| a.to_vec()).collect();
        let json = serde_json::json!({ "action": "albums", "albums": lists });
        session.handle_text(&json.to_string());
    }

    fn item_info_json(album: usize, item: usize, mtime: i64, size: u64, max: u64, parts: u32) -> String {
        serde_json::json!({
            "action": "itemInfo",
            "albumIndex": album,
            "itemIndex": item,
            "lastModified": mtime,
            "size": size,
            "maxPartSize": max,
            "parts": parts,
        })
        .to_string()
    }

    #[test]
    fn operations_require_connection_and_idle_state() {
        let Fixture { session, mut rx, dir: _dir } = fixture(&[("album", &["a.jpg"])]);

        // Force the syncing flag through a fake upload, then try again
        send_albums(&session, &[&["a.jpg"]]);
        session.upload_metadata();
        assert!(session.is_syncing());
        drain(&mut rx);

        session.download_albums();
        session.download_metadata();
        session.upload_metadata();
        assert!(drain(&mut rx).is_empty());
        assert_eq!(session.queue_len(), 0);

        // Disconnected session refuses operations too
        session.connection_closed();
        session.download_albums();
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn album_count_mismatch_aborts_before_queueing() {
        let Fixture { session, mut rx, dir: _dir } =
            fixture(&[("one", &["a.jpg"]), ("two", &["b.jpg"])]);
        send_albums(&session, &[&["a.jpg"], &["b.jpg"], &["c.jpg"]]);
        drain(&mut rx);

        session.download_albums();
        assert!(!session.is_syncing());
        assert_eq!(session.queue_len(), 0);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn download_requires_client_manifests() {
        let Fixture { session, mut rx, dir: _dir } = fixture(&[("album", &["a.jpg"])]);
        session.download_albums();
        assert!(!session.is_syncing());
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn album_download_deletes_and_pulls() {
        let Fixture { session, mut rx, dir } = fixture(&[("album", &["a.jpg", "b.jpg"])]);
        let album_path = dir.path().join("album");
        send_albums(&session, &[&["b.jpg", "c.jpg"]]);
        drain(&mut rx);

        session.download_albums();
        assert!(session.is_syncing());
        // a.jpg was removed on the client, so it goes away immediately
        assert!(!album_path.join("a.jpg").exists());
        assert!(album_path.join("b.jpg").exists());

        let out = drain(&mut rx);
        assert_eq!(out.len(), 1);
        let msg = as_json(&out[0]);
        assert_eq!(msg["action"], "requestItemInfo");
        assert_eq!(msg["albumIndex"], 0);
        assert_eq!(msg["itemIndex"], 1);
        assert_eq!(msg["queueIndex"], 0);
        assert_eq!(msg["queueSize"], 1);

        // Client answers with item info; host asks for part 0
        session.handle_text(&item_info_json(0, 1, 1_600_000_000, 4, 1024, 1));
        let out = drain(&mut rx);
        let msg = as_json(&out[0]);
        assert_eq!(msg["action"], "requestItemData");
        assert_eq!(msg["part"], 0);

        // Single part finishes the item and the queue
        session.handle_binary(b"cccc");
        assert!(!session.is_syncing());
        let written = std::fs::read(album_path.join("c.jpg")).unwrap();
        assert_eq!(written, b"cccc");
        let mtime = FileTime::from_last_modification_time(
            &std::fs::metadata(album_path.join("c.jpg")).unwrap(),
        );
        assert_eq!(mtime.unix_seconds(), 1_600_000_000);
    }

    #[test]
    fn multi_part_item_requests_each_part_in_order() {
        let Fixture { session, mut rx, dir } = fixture(&[("album", &[])]);
        send_albums(&session, &[&["big.jpg"]]);
        session.download_albums();
        session.handle_text(&item_info_json(0, 0, 1_650_000_000, 8, 4, 2));
        drain(&mut rx);

        session.handle_binary(b"aaaa");
        assert!(session.is_syncing());
        let out = drain(&mut rx);
        let msg = as_json(&out[0]);
        assert_eq!(msg["action"], "requestItemData");
        assert_eq!(msg["part"], 1);

        session.handle_binary(b"bbbb");
        assert!(!session.is_syncing());
        assert_eq!(std::fs::read(dir.path().join("album/big.jpg")).unwrap(), b"aaaabbbb");
    }

    #[test]
    fn empty_part_is_rerequested() {
        let Fixture { session, mut rx, dir: _dir } = fixture(&[("album", &[])]);
        send_albums(&session, &[&["x.jpg"]]);
        session.download_albums();
        session.handle_text(&item_info_json(0, 0, 1_650_000_000, 8, 4, 2));
        drain(&mut rx);

        session.handle_binary(b"");
        assert!(session.is_syncing());
        let out = drain(&mut rx);
        assert_eq!(out.len(), 1);
        let msg = as_json(&out[0]);
        assert_eq!(msg["action"], "requestItemData");
        assert_eq!(msg["part"], 0, "same part again");
    }

    #[test]
    fn unsafe_item_names_never_escape_the_album() {
        let Fixture { session, mut rx, dir } = fixture(&[("album", &[])]);
        send_albums(&session, &[&["../evil.jpg"]]);
        session.download_albums();
        session.handle_text(&item_info_json(0, 0, 1_650_000_000, 4, 1024, 1));
        drain(&mut rx);

        session.handle_binary(b"evil");
        assert!(!dir.path().join("evil.jpg").exists());
        assert!(!dir.path().join("album/../evil.jpg").exists());
    }

    #[test]
    fn metadata_download_round_trip() {
        let Fixture { session, mut rx, dir } =
            fixture(&[("one", &["a.jpg"]), ("two", &["b.jpg"])]);
        send_albums(&session, &[&["a.jpg"], &["b.jpg"]]);
        drain(&mut rx);

        session.download_metadata();
        assert!(session.is_syncing());
        let out = drain(&mut rx);
        let msg = as_json(&out[0]);
        assert_eq!(msg["action"], "requestMetadataInfo");
        assert_eq!(msg["albumIndex"], 0);
        assert_eq!(msg["queueSize"], 2);

        session.handle_text(r#"{"action":"metadataInfo","albumIndex":0,"lastModified":1700000000}"#);
        let out = drain(&mut rx);
        let msg = as_json(&out[0]);
        assert_eq!(msg["action"], "requestMetadataData");
        assert_eq!(msg["albumIndex"], 0);

        session.handle_binary(b"{\"replaced\":true}");
        assert!(session.is_syncing(), "second album still pending");
        let meta_path = dir.path().join("one.json");
        assert_eq!(std::fs::read(&meta_path).unwrap(), b"{\"replaced\":true}");
        let mtime = FileTime::from_last_modification_time(&std::fs::metadata(&meta_path).unwrap());
        assert_eq!(mtime.unix_seconds(), 1_700_000_000);

        let out = drain(&mut rx);
        let msg = as_json(&out[0]);
        assert_eq!(msg["action"], "requestMetadataInfo");
        assert_eq!(msg["albumIndex"], 1);
        assert_eq!(msg["queueIndex"], 1);

        session.handle_text(r#"{"action":"metadataInfo","albumIndex":1,"lastModified":1700000001}"#);
        drain(&mut rx);
        session.handle_binary(b"{}");
        assert!(!session.is_syncing());
    }

    #[test]
    fn metadata_download_aborts_on_missing_file() {
        let Fixture { session, mut rx, dir } = fixture(&[("one", &[]), ("two", &[])]);
        std::fs::remove_file(dir.path().join("two.json")).unwrap();
        send_albums(&session, &[&[], &[]]);
        drain(&mut rx);

        session.download_metadata();
        assert!(!session.is_syncing());
        assert!(drain(&mut rx).is_empty());

        session.upload_metadata();
        assert!(!session.is_syncing());
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn metadata_upload_serves_info_and_data() {
        let Fixture { session, mut rx, dir } = fixture(&[("one", &[])]);
        session.upload_metadata();
        assert!(session.is_syncing());
        let out = drain(&mut rx);
        assert_eq!(as_json(&out[0])["action"], "startMetadataRequest");

        session.handle_text(r#"{"action":"requestMetadataInfo","albumIndex":0}"#);
        let out = drain(&mut rx);
        let msg = as_json(&out[0]);
        assert_eq!(msg["action"], "metadataInfo");
        assert_eq!(msg["albumIndex"], 0);
        let expected = FileTime::from_last_modification_time(
            &std::fs::metadata(dir.path().join("one.json")).unwrap(),
        )
        .unix_seconds();
        assert_eq!(msg["lastModified"], expected);

        session.handle_text(r#"{"action":"requestMetadataData","albumIndex":0}"#);
        let out = drain(&mut rx);
        match &out[0] {
            Outbound::Binary(bytes) => {
                assert_eq!(bytes, &std::fs::read(dir.path().join("one.json")).unwrap());
            }
            other => panic!("expected binary frame, got {other:?}"),
        }

        // Out-of-range album indices are ignored
        session.handle_text(r#"{"action":"requestMetadataInfo","albumIndex":9}"#);
        assert!(drain(&mut rx).is_empty());

        session.handle_text(r#"{"action":"endSync","message":"upload done"}"#);
        assert!(!session.is_syncing());
    }

    #[test]
    fn end_sync_discards_queue_and_request() {
        let Fixture { session, mut rx, dir: _dir } = fixture(&[("album", &[])]);
        send_albums(&session, &[&["x.jpg", "y.jpg"]]);
        session.download_albums();
        assert!(session.is_syncing());
        assert_eq!(session.queue_len(), 2);
        drain(&mut rx);

        session.handle_text(r#"{"action":"endSync"}"#);
        assert!(!session.is_syncing());
        assert_eq!(session.queue_len(), 0);
    }

    #[test]
    fn garbage_and_stray_frames_are_discarded() {
        let Fixture { session, mut rx, dir: _dir } = fixture(&[("album", &[])]);
        session.handle_text("not json");
        session.handle_text(r#"{"action":"launchMissiles"}"#);
        session.handle_text(r#"{"albums":[]}"#);
        session.handle_binary(b"stray payload");
        assert!(drain(&mut rx).is_empty());
        assert!(!session.is_syncing());
    }

    #[test]
    fn item_info_outside_sync_is_ignored() {
        let Fixture { session, mut rx, dir } = fixture(&[("album", &[])]);
        send_albums(&session, &[&["x.jpg"]]);
        drain(&mut rx);

        session.handle_text(&item_info_json(0, 0, 1_650_000_000, 4, 1024, 1));
        assert!(drain(&mut rx).is_empty());
        session.handle_binary(b"data");
        assert!(!dir.path().join("album/x.jpg").exists());
    }

    #[test]
    fn safe_item_name_rules() {
        assert!(safe_item_name("photo.jpg").is_ok());
        assert!(safe_item_name("with space.png").is_ok());
        assert!(safe_item_name("").is_err());
        assert!(safe_item_name("..").is_err());
        assert!(safe_item_name("../up.jpg").is_err());
        assert!(safe_item_name("a/b.jpg").is_err());
        assert!(safe_item_name("a\\b.jpg").is_err());
        assert!(safe_item_name("nul\0.jpg").is_err());
    }
}
