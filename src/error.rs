//! Error taxonomy for object, program, map, and event-stream operations.
//!
//! Every kernel-call failure carries the underlying OS error text so callers
//! can diagnose rejections without reaching for strace.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// All failure modes surfaced by this crate.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// Operation requires a loaded object.
    #[error("BPF object not loaded")]
    NotLoaded,

    /// `load()` called on an already-loaded object.
    #[error("BPF object already loaded")]
    AlreadyLoaded,

    /// The object file could not be opened or parsed.
    #[error("failed to open BPF object '{path}': {err}")]
    OpenFailed { path: String, err: String },

    /// The kernel rejected the object during load.
    #[error("failed to load BPF object '{path}': {err}")]
    LoadFailed { path: String, err: String },

    /// A path contained an interior NUL and cannot cross the C boundary.
    #[error("invalid object path '{path}'")]
    InvalidPath { path: String },

    /// No program with this name exists in the object.
    #[error("program '{name}' not found")]
    ProgramNotFound { name: String },

    /// No map with this name exists in the object.
    #[error("map '{name}' not found")]
    MapNotFound { name: String },

    /// `attach()` called while a link is already held.
    #[error("program '{name}' is already attached")]
    AlreadyAttached { name: String },

    /// The owning object was destroyed before this handle.
    #[error("parent BPF object has been destroyed")]
    ParentGone,

    /// The kernel rejected the attach request.
    #[error("failed to attach program '{name}': {err}")]
    AttachFailed { name: String, err: String },

    /// The kernel failed to destroy an attachment link.
    #[error("failed to detach program '{name}': {err}")]
    DetachFailed { name: String, err: String },

    /// Direct lookup or delete on a key the map does not hold.
    #[error("key not found in map")]
    KeyNotFound,

    /// The kernel rejected a map update.
    #[error("map update failed: {err}")]
    UpdateFailed { err: String },

    /// The kernel rejected a map delete.
    #[error("map delete failed: {err}")]
    DeleteFailed { err: String },

    /// The kernel rejected a map lookup or key iteration.
    #[error("map lookup failed: {err}")]
    LookupFailed { err: String },

    /// A value does not fit the fixed-size buffer it must encode into.
    #[error("value of {size} bytes does not fit in a {capacity}-byte buffer")]
    ValueTooLarge { size: usize, capacity: usize },

    /// A value kind with no fixed-size byte encoding.
    #[error("cannot encode {kind} value into a fixed-size buffer")]
    UnsupportedType { kind: &'static str },

    /// Event streams require a perf event array map.
    #[error("map '{name}' is not a perf event array (type {ty})")]
    WrongMapType { name: String, ty: String },

    /// Perf ring sizing must be a positive power of two.
    #[error("page count must be a positive power of two, got {pages}")]
    InvalidPageCount { pages: usize },

    /// The kernel refused to create the perf buffer.
    #[error("failed to create perf buffer: {err}")]
    CreationFailed { err: String },

    /// The kernel poll or consume call failed.
    #[error("perf buffer poll failed: {err}")]
    PollFailed { err: String },

    /// No struct with this name is registered for decoding.
    #[error("unknown struct '{name}'")]
    UnknownStruct { name: String },

    /// A sample is smaller than the struct layout it should decode as.
    #[error("sample of {got} bytes is too short for struct '{name}' ({need} bytes)")]
    SampleTooShort {
        name: String,
        need: usize,
        got: usize,
    },
}
