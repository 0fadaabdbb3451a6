//! The shared document model for a single room.
//!
//! A [`Document`] owns one Yrs doc with two named root maps:
//!
//! - `"files"` — filename → shared text (one entry per editable file)
//! - `"config"` — room-level settings (e.g. the active `"language"` tag)
//!
//! Every replica of a room holds one `Document`. Updates produced by any
//! replica can be applied to any other in any order; the Yrs merge rules
//! (per-replica counters, deterministic tie-break) guarantee convergence.
//!
//! All mutations on one `Document` are serialized through an internal
//! exclusive section. The type is `Send + Sync` and is shared behind `Arc`
//! by the relay server and the sync client alike.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{
    Doc, GetString, Map, MapRef, Observable, Origin, ReadTxn, StateVector, Subscription, Text,
    TextPrelim, TextRef, Transact, Update,
};

/// Name of the root map holding filename → shared text entries.
const FILES_MAP: &str = "files";

/// Name of the root map holding room-level configuration.
const CONFIG_MAP: &str = "config";

/// Transaction origin tag for updates received from a remote replica.
const REMOTE_TAG: &str = "remote";

/// Errors surfaced by [`Document`] operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentError {
    /// The document has been retired; the room is being torn down.
    Closed,
    /// The file entry behind this handle was replaced or deleted; the
    /// holder must call [`Document::get_file`] again and rebind.
    StaleHandle { file: String },
    /// An update or state vector could not be decoded or applied.
    InvalidUpdate(String),
}

impl std::fmt::Display for DocumentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "document is closed"),
            Self::StaleHandle { file } => {
                write!(f, "stale handle for file {file:?}: entry was replaced")
            }
            Self::InvalidUpdate(e) => write!(f, "invalid update: {e}"),
        }
    }
}

impl std::error::Error for DocumentError {}

/// Where a committed mutation originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOrigin {
    /// Produced by an operation on this replica.
    Local,
    /// Received from another replica via [`Document::apply_update`].
    Remote,
}

/// A versioned handle to one file's shared text.
///
/// The version token identifies one *instance* of the map entry. Recreating
/// a file under the same name produces a new instance with a higher token;
/// edits through the old handle are rejected with
/// [`DocumentError::StaleHandle`]. Consumers bind to the `(text, version)`
/// pair and rebind whenever a fresh `get_file` returns a different token.
#[derive(Clone)]
pub struct FileHandle {
    name: String,
    text: TextRef,
    version: u64,
}

impl std::fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileHandle")
            .field("name", &self.name)
            .field("version", &self.version)
            .finish()
    }
}

impl FileHandle {
    /// Filename this handle refers to.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Instance token for rebinding checks. Tokens compare equal exactly
    /// when two handles refer to the same map-entry instance.
    pub fn version(&self) -> u64 {
        self.version
    }
}

/// A collaborative multi-file document, the unit of CRDT consistency for
/// one room.
pub struct Document {
    room_id: String,
    doc: Doc,
    files: MapRef,
    config: MapRef,
    /// Instance counter per filename, bumped by the files-map observer on
    /// every entry replacement or removal, local or remote.
    versions: Arc<Mutex<HashMap<String, u64>>>,
    /// Exclusive section serializing all transactions on `doc`.
    op_lock: Mutex<()>,
    closed: AtomicBool,
    _files_sub: Subscription,
}

impl Document {
    /// Create an empty document for the given room id. Room ids are opaque
    /// strings supplied by the caller.
    pub fn new(room_id: impl Into<String>) -> Self {
        let doc = Doc::new();
        let files = doc.get_or_insert_map(FILES_MAP);
        let config = doc.get_or_insert_map(CONFIG_MAP);

        let versions: Arc<Mutex<HashMap<String, u64>>> = Arc::new(Mutex::new(HashMap::new()));
        let observed = versions.clone();
        let files_sub = files.observe(move |txn, event| {
            let mut map = observed.lock().expect("versions lock poisoned");
            for key in event.keys(txn).keys() {
                *map.entry(key.to_string()).or_insert(0) += 1;
            }
        });

        Self {
            room_id: room_id.into(),
            doc,
            files,
            config,
            versions,
            op_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
            _files_sub: files_sub,
        }
    }

    /// Room id this document belongs to.
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Mark the document retired. Every subsequent operation fails with
    /// [`DocumentError::Closed`]. Called by the room registry when the last
    /// connection leaves.
    pub fn close(&self) {
        let _guard = self.op_lock.lock().expect("op lock poisoned");
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Enter the exclusive section, refusing if the document is retired.
    fn guard(&self) -> Result<MutexGuard<'_, ()>, DocumentError> {
        let guard = self.op_lock.lock().expect("op lock poisoned");
        if self.closed.load(Ordering::SeqCst) {
            return Err(DocumentError::Closed);
        }
        Ok(guard)
    }

    fn version_of(&self, name: &str) -> u64 {
        self.versions
            .lock()
            .expect("versions lock poisoned")
            .get(name)
            .copied()
            .unwrap_or(0)
    }

    // ── files ───────────────────────────────────────────────────────

    /// Look up the shared text for `name`, returning a versioned handle,
    /// or `None` if no such file exists.
    pub fn get_file(&self, name: &str) -> Result<Option<FileHandle>, DocumentError> {
        let _guard = self.guard()?;
        let txn = self.doc.transact();
        let Some(value) = self.files.get(&txn, name) else {
            return Ok(None);
        };
        let Ok(text) = value.cast::<TextRef>() else {
            // A non-text value under "files" cannot be produced through this
            // API; treat it as absent rather than panicking on foreign data.
            log::warn!("files entry {name:?} in room {} is not a text", self.room_id);
            return Ok(None);
        };
        drop(txn);
        Ok(Some(FileHandle {
            name: name.to_string(),
            text,
            version: self.version_of(name),
        }))
    }

    /// Create or replace the file `name` with `content`.
    ///
    /// Always inserts a *fresh* shared-text instance, even when an entry
    /// already exists — concurrent recreates then merge by the map's
    /// last-writer-wins rule, and holders of the previous instance observe
    /// a version-token change and rebind.
    pub fn set_file(&self, name: &str, content: &str) -> Result<FileHandle, DocumentError> {
        let _guard = self.guard()?;
        let text = {
            let mut txn = self.doc.transact_mut();
            self.files.insert(&mut txn, name, TextPrelim::new(content))
        };
        Ok(FileHandle {
            name: name.to_string(),
            text,
            version: self.version_of(name),
        })
    }

    /// Create the file only when absent, returning a handle to whichever
    /// instance ends up in the map. Used to seed a room's default file
    /// without clobbering content that synced in first.
    pub fn set_file_if_absent(&self, name: &str, content: &str) -> Result<FileHandle, DocumentError> {
        if let Some(existing) = self.get_file(name)? {
            return Ok(existing);
        }
        self.set_file(name, content)
    }

    /// Remove the file `name`. Returns `false` when no such entry existed
    /// (removing an already-removed file is a no-op).
    pub fn delete_file(&self, name: &str) -> Result<bool, DocumentError> {
        let _guard = self.guard()?;
        let mut txn = self.doc.transact_mut();
        Ok(self.files.remove(&mut txn, name).is_some())
    }

    /// All filenames, sorted.
    pub fn list_files(&self) -> Result<Vec<String>, DocumentError> {
        let _guard = self.guard()?;
        let txn = self.doc.transact();
        let mut names: Vec<String> = self.files.keys(&txn).map(|k| k.to_string()).collect();
        names.sort();
        Ok(names)
    }

    /// Current plain-text content of `name`, for collaborators that consume
    /// file contents (execution, formatting).
    pub fn file_content(&self, name: &str) -> Result<Option<String>, DocumentError> {
        let _guard = self.guard()?;
        let txn = self.doc.transact();
        let content = self
            .files
            .get(&txn, name)
            .and_then(|v| v.cast::<TextRef>().ok())
            .map(|text| text.get_string(&txn));
        Ok(content)
    }

    // ── edits through a handle ──────────────────────────────────────

    /// Verify `handle` still refers to the live map entry.
    fn check_current(&self, handle: &FileHandle) -> Result<(), DocumentError> {
        if self.version_of(&handle.name) != handle.version {
            return Err(DocumentError::StaleHandle {
                file: handle.name.clone(),
            });
        }
        Ok(())
    }

    /// Whether `handle` still refers to the live instance of its file.
    pub fn is_current(&self, handle: &FileHandle) -> Result<bool, DocumentError> {
        let _guard = self.guard()?;
        Ok(self.version_of(&handle.name) == handle.version)
    }

    /// Insert `content` at character `index` in the file behind `handle`.
    pub fn insert(
        &self,
        handle: &FileHandle,
        index: u32,
        content: &str,
    ) -> Result<(), DocumentError> {
        let _guard = self.guard()?;
        self.check_current(handle)?;
        let mut txn = self.doc.transact_mut();
        handle.text.insert(&mut txn, index, content);
        Ok(())
    }

    /// Delete `len` characters starting at `index` in the file behind
    /// `handle`.
    pub fn delete(&self, handle: &FileHandle, index: u32, len: u32) -> Result<(), DocumentError> {
        let _guard = self.guard()?;
        self.check_current(handle)?;
        let mut txn = self.doc.transact_mut();
        handle.text.remove_range(&mut txn, index, len);
        Ok(())
    }

    /// Current content of the file behind `handle`. Reads are allowed
    /// through a stale handle — only writes are rejected.
    pub fn content(&self, handle: &FileHandle) -> Result<String, DocumentError> {
        let _guard = self.guard()?;
        let txn = self.doc.transact();
        Ok(handle.text.get_string(&txn))
    }

    /// Length in characters of the file behind `handle`.
    pub fn len(&self, handle: &FileHandle) -> Result<u32, DocumentError> {
        let _guard = self.guard()?;
        let txn = self.doc.transact();
        Ok(handle.text.len(&txn))
    }

    // ── config ──────────────────────────────────────────────────────

    /// Read a room configuration value.
    pub fn get_config(&self, key: &str) -> Result<Option<String>, DocumentError> {
        let _guard = self.guard()?;
        let txn = self.doc.transact();
        Ok(self
            .config
            .get(&txn, key)
            .and_then(|v| v.cast::<String>().ok()))
    }

    /// Write a room configuration value (last writer wins per key).
    pub fn set_config(&self, key: &str, value: &str) -> Result<(), DocumentError> {
        let _guard = self.guard()?;
        let mut txn = self.doc.transact_mut();
        self.config.insert(&mut txn, key, value.to_string());
        Ok(())
    }

    // ── sync surface ────────────────────────────────────────────────

    /// Encoded state vector: the compact summary of what this replica has
    /// seen, sent as the first step of the sync handshake.
    pub fn state_vector(&self) -> Result<Vec<u8>, DocumentError> {
        let _guard = self.guard()?;
        let txn = self.doc.transact();
        Ok(txn.state_vector().encode_v1())
    }

    /// The update delta a peer with `remote_state_vector` is missing.
    pub fn diff(&self, remote_state_vector: &[u8]) -> Result<Vec<u8>, DocumentError> {
        let _guard = self.guard()?;
        let sv = StateVector::decode_v1(remote_state_vector)
            .map_err(|e| DocumentError::InvalidUpdate(e.to_string()))?;
        let txn = self.doc.transact();
        Ok(txn.encode_diff_v1(&sv))
    }

    /// Full state encoded as a single update, suitable for checkpointing
    /// and for restoring via [`apply_update`](Self::apply_update).
    pub fn snapshot(&self) -> Result<Vec<u8>, DocumentError> {
        self.diff(&StateVector::default().encode_v1())
    }

    /// Merge an update produced by another replica. Commutative and
    /// idempotent: arrival order does not matter and re-applying an
    /// already-seen update is a no-op.
    pub fn apply_update(&self, update: &[u8]) -> Result<(), DocumentError> {
        let _guard = self.guard()?;
        let decoded =
            Update::decode_v1(update).map_err(|e| DocumentError::InvalidUpdate(e.to_string()))?;
        let mut txn = self.doc.transact_mut_with(Origin::from(REMOTE_TAG));
        txn.apply_update(decoded)
            .map_err(|e| DocumentError::InvalidUpdate(e.to_string()))?;
        Ok(())
    }

    // ── observation ─────────────────────────────────────────────────

    /// Observe every committed mutation as an encoded incremental update,
    /// tagged with where it originated. The sync client forwards
    /// `Local`-origin updates to the relay and stays silent for `Remote`
    /// ones, which it produced itself via `apply_update`.
    pub fn observe_update(
        &self,
        callback: impl Fn(UpdateOrigin, &[u8]) + Send + Sync + 'static,
    ) -> Subscription {
        let remote: Origin = Origin::from(REMOTE_TAG);
        self.doc
            .observe_update_v1(move |txn, event| {
                let origin = if txn.origin() == Some(&remote) {
                    UpdateOrigin::Remote
                } else {
                    UpdateOrigin::Local
                };
                callback(origin, &event.update);
            })
            .expect("failed to observe document updates")
    }

    /// Observe changes to the file table (entries added, replaced or
    /// removed, locally or remotely). The callback receives the affected
    /// filenames; holders of handles to those files should re-acquire them
    /// and compare version tokens.
    pub fn observe_files(
        &self,
        callback: impl Fn(&[String]) + Send + Sync + 'static,
    ) -> Subscription {
        self.files.observe(move |txn, event| {
            let changed: Vec<String> = event.keys(txn).keys().map(|k| k.to_string()).collect();
            callback(&changed);
        })
    }

    /// Observe mutations to one file's text through its handle.
    pub fn observe_file(
        &self,
        handle: &FileHandle,
        callback: impl Fn() + Send + Sync + 'static,
    ) -> Result<Subscription, DocumentError> {
        let _guard = self.guard()?;
        Ok(handle.text.observe(move |_txn, _event| callback()))
    }
}

impl std::fmt::Debug for Document {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Document")
            .field("room_id", &self.room_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}
