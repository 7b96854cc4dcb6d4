//! Perf event streaming
//!
//! Wraps a perf event array map in a kernel poll context and dispatches
//! decoded samples to user callbacks. The blocking poll never holds the
//! callback lock; exclusive access to the callbacks is taken per dispatch,
//! so other threads keep running while the kernel wait is in flight.

use std::any::Any;
use std::fmt;
use std::os::raw::{c_int, c_void};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use log::{debug, error, warn};
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::map::{BpfMap, MapType};
use crate::structs::StructRegistry;
use crate::util;
use crate::value::Value;

/// Ring pages per CPU when the builder is not told otherwise.
pub const DEFAULT_PAGE_COUNT: usize = 8;

/// Per-sample callback: originating CPU and decoded payload.
pub type SampleCallback = Box<dyn FnMut(i32, Value) + Send>;

/// Lost-sample callback: originating CPU and number of dropped samples.
pub type LostCallback = Box<dyn FnMut(i32, u64) + Send>;

/// Configures a [`PerfEventStream`] over a perf event array map.
///
/// The sample callback is mandatory and supplied up front; pages default to
/// [`DEFAULT_PAGE_COUNT`] and must be a positive power of two.
pub struct PerfEventStreamBuilder {
    map: Arc<BpfMap>,
    pages: usize,
    struct_name: Option<String>,
    sample_cb: SampleCallback,
    lost_cb: Option<LostCallback>,
}

impl PerfEventStreamBuilder {
    /// Start building a stream over `map` delivering samples to `sample_cb`.
    pub fn new<F>(map: Arc<BpfMap>, sample_cb: F) -> Self
    where
        F: FnMut(i32, Value) + Send + 'static,
    {
        Self {
            map,
            pages: DEFAULT_PAGE_COUNT,
            struct_name: None,
            sample_cb: Box::new(sample_cb),
            lost_cb: None,
        }
    }

    /// Ring pages per CPU; must be a positive power of two.
    pub fn pages(mut self, pages: usize) -> Self {
        self.pages = pages;
        self
    }

    /// Decode samples as the named struct from the parent object's
    /// registry instead of passing raw bytes through.
    pub fn decode_as(mut self, struct_name: impl Into<String>) -> Self {
        self.struct_name = Some(struct_name.into());
        self
    }

    /// Callback for kernel drop-count reports. Without one, losses are
    /// logged rather than silently discarded.
    pub fn lost_cb<F>(mut self, lost_cb: F) -> Self
    where
        F: FnMut(i32, u64) + Send + 'static,
    {
        self.lost_cb = Some(Box::new(lost_cb));
        self
    }

    /// Validate the configuration and create the kernel poll context.
    ///
    /// Validation precedes any kernel resource: the map type check, then
    /// ring sizing, then decode configuration.
    pub fn build(self) -> Result<PerfEventStream> {
        if self.map.map_type() != MapType::PerfEventArray {
            return Err(Error::WrongMapType {
                name: self.map.name().to_string(),
                ty: self.map.map_type().to_string(),
            });
        }

        if self.pages == 0 || !self.pages.is_power_of_two() {
            return Err(Error::InvalidPageCount { pages: self.pages });
        }

        let decoder = match self.struct_name {
            Some(name) => {
                let parent = self.map.upgrade_parent()?;
                let registry = parent
                    .struct_registry()
                    .ok_or_else(|| Error::UnknownStruct { name: name.clone() })?;
                Some((registry, name))
            }
            None => None,
        };

        // The pointer registered with the kernel is the owning allocation
        // itself, reboxed only in Drop after the perf buffer is freed.
        let ctx = Box::into_raw(Box::new(DispatchCtx {
            sample_cb: Mutex::new(self.sample_cb),
            lost_cb: Mutex::new(self.lost_cb),
            decoder,
            dispatched: AtomicUsize::new(0),
        }));

        let opts = libbpf_sys::perf_buffer_opts {
            sz: std::mem::size_of::<libbpf_sys::perf_buffer_opts>() as libbpf_sys::size_t,
            ..Default::default()
        };

        let pb = unsafe {
            libbpf_sys::perf_buffer__new(
                self.map.fd(),
                self.pages as libbpf_sys::size_t,
                Some(sample_trampoline),
                Some(lost_trampoline),
                ctx.cast(),
                &opts,
            )
        };
        if pb.is_null() {
            let err = util::last_errno_string();
            // No trampoline can hold the pointer when creation fails.
            drop(unsafe { Box::from_raw(ctx) });
            return Err(Error::CreationFailed { err });
        }

        debug!(
            "perf buffer created over map '{}' ({} pages per cpu)",
            self.map.name(),
            self.pages
        );
        Ok(PerfEventStream {
            pb,
            ctx,
            map: self.map,
            pages: self.pages,
        })
    }
}

/// A kernel poll context over one perf event array map.
///
/// Samples are delivered during [`poll`](Self::poll) and
/// [`consume`](Self::consume) calls on the calling thread. The stream keeps
/// the wrapped map handle alive; the owning object is still free to go away,
/// at which point the kernel stops producing into the rings.
pub struct PerfEventStream {
    pb: *mut libbpf_sys::perf_buffer,
    /// Dispatch state the kernel trampolines point into, owned through the
    /// same `Box::into_raw` pointer the kernel holds. Reboxed and dropped
    /// in `Drop` after the perf buffer, never before.
    ctx: *mut DispatchCtx,
    map: Arc<BpfMap>,
    pages: usize,
}

// SAFETY: the perf buffer pointer is owned exclusively by this stream, the
// dispatch context is an owned heap allocation freed only in Drop, and both
// callbacks are required to be Send. The stream is not Sync, so polls cannot
// race from two threads.
unsafe impl Send for PerfEventStream {}

impl PerfEventStream {
    fn ctx(&self) -> &DispatchCtx {
        // SAFETY: created by Box::into_raw in the builder and freed only in
        // Drop, so the pointer is valid for as long as the stream exists.
        unsafe { &*self.ctx }
    }

    /// Block until samples are ready and dispatch them on the calling thread.
    ///
    /// A timeout with nothing ready returns `Ok(0)`.
    ///
    /// # Arguments
    ///
    /// * `timeout_ms` - Milliseconds to wait; negative blocks indefinitely
    ///
    /// # Returns
    ///
    /// Number of samples that reached the sample callback during this call
    pub fn poll(&self, timeout_ms: i32) -> Result<usize> {
        self.ctx().dispatched.store(0, Ordering::Relaxed);
        let ret = unsafe { libbpf_sys::perf_buffer__poll(self.pb, timeout_ms as c_int) };
        if ret < 0 {
            return Err(Error::PollFailed {
                err: util::errno_string(-ret),
            });
        }
        Ok(self.ctx().dispatched.load(Ordering::Relaxed))
    }

    /// Drain whatever is already buffered without blocking, with the same
    /// dispatch semantics as [`poll`](Self::poll).
    ///
    /// # Returns
    ///
    /// Number of samples that reached the sample callback during this call
    pub fn consume(&self) -> Result<usize> {
        self.ctx().dispatched.store(0, Ordering::Relaxed);
        let ret = unsafe { libbpf_sys::perf_buffer__consume(self.pb) };
        if ret < 0 {
            return Err(Error::PollFailed {
                err: util::errno_string(-ret),
            });
        }
        Ok(self.ctx().dispatched.load(Ordering::Relaxed))
    }

    /// Epoll file descriptor of the poll context, for callers integrating
    /// the stream into their own event loop.
    pub fn epoll_fd(&self) -> i32 {
        unsafe { libbpf_sys::perf_buffer__epoll_fd(self.pb) }
    }

    /// The wrapped map handle.
    pub fn map(&self) -> &BpfMap {
        &self.map
    }

    /// Ring pages per CPU the stream was built with.
    pub fn pages(&self) -> usize {
        self.pages
    }
}

impl Drop for PerfEventStream {
    fn drop(&mut self) {
        // Free the kernel poll context first so no trampoline can fire
        // while the dispatch context is reclaimed.
        unsafe {
            libbpf_sys::perf_buffer__free(self.pb);
            drop(Box::from_raw(self.ctx));
        }
    }
}

impl fmt::Debug for PerfEventStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PerfEventStream")
            .field("map", &self.map.name())
            .field("pages", &self.pages)
            .finish()
    }
}

/// Shared state between the stream and the kernel-invoked trampolines.
struct DispatchCtx {
    sample_cb: Mutex<SampleCallback>,
    lost_cb: Mutex<Option<LostCallback>>,
    decoder: Option<(Arc<StructRegistry>, String)>,
    /// Samples delivered during the current poll/consume call.
    dispatched: AtomicUsize,
}

impl DispatchCtx {
    fn dispatch_sample(&self, cpu: i32, data: &[u8]) {
        let payload = match &self.decoder {
            Some((registry, name)) => match registry.decode(name, data) {
                Ok(value) => value,
                Err(err) => {
                    // One bad sample must not stop the stream.
                    warn!("dropping undecodable sample from cpu {}: {}", cpu, err);
                    return;
                }
            },
            None => Value::Bytes(data.to_vec()),
        };

        self.dispatched.fetch_add(1, Ordering::Relaxed);

        let mut cb = self.sample_cb.lock();
        if let Err(cause) = catch_unwind(AssertUnwindSafe(|| (*cb)(cpu, payload))) {
            error!("sample callback panicked: {}", describe_panic(cause.as_ref()));
        }
    }

    fn dispatch_lost(&self, cpu: i32, count: u64) {
        let mut cb = self.lost_cb.lock();
        match cb.as_mut() {
            Some(cb) => {
                if let Err(cause) = catch_unwind(AssertUnwindSafe(|| (*cb)(cpu, count))) {
                    error!(
                        "lost-sample callback panicked: {}",
                        describe_panic(cause.as_ref())
                    );
                }
            }
            None => warn!("lost {} samples on cpu {}", count, cpu),
        }
    }
}

fn describe_panic(payload: &(dyn Any + Send)) -> &str {
    if let Some(text) = payload.downcast_ref::<&str>() {
        text
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.as_str()
    } else {
        "opaque panic payload"
    }
}

/// Kernel-invoked per-sample entry point. Panics from user code are caught
/// before they can unwind across this boundary.
unsafe extern "C" fn sample_trampoline(ctx: *mut c_void, cpu: c_int, data: *mut c_void, size: u32) {
    let ctx = &*(ctx as *const DispatchCtx);
    let data = std::slice::from_raw_parts(data as *const u8, size as usize);
    ctx.dispatch_sample(cpu, data);
}

/// Kernel-invoked drop-count entry point.
unsafe extern "C" fn lost_trampoline(ctx: *mut c_void, cpu: c_int, count: u64) {
    let ctx = &*(ctx as *const DispatchCtx);
    ctx.dispatch_lost(cpu, count);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::orphan_map_for_tests;
    use crate::structs::{FieldDef, FieldType, StructDef};

    fn collected() -> (Arc<Mutex<Vec<(i32, Value)>>>, SampleCallback) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let cb: SampleCallback = Box::new(move |cpu, value| sink.lock().push((cpu, value)));
        (seen, cb)
    }

    fn raw_ctx(sample_cb: SampleCallback) -> DispatchCtx {
        DispatchCtx {
            sample_cb: Mutex::new(sample_cb),
            lost_cb: Mutex::new(None),
            decoder: None,
            dispatched: AtomicUsize::new(0),
        }
    }

    #[test]
    fn test_builder_rejects_wrong_map_type() {
        let map = Arc::new(orphan_map_for_tests(MapType::Hash));
        let result = PerfEventStreamBuilder::new(map, |_, _| {}).pages(8).build();
        assert!(matches!(result, Err(Error::WrongMapType { .. })));
    }

    #[test]
    fn test_builder_checks_map_type_before_pages() {
        let map = Arc::new(orphan_map_for_tests(MapType::Hash));
        let result = PerfEventStreamBuilder::new(map, |_, _| {}).pages(3).build();
        assert!(matches!(result, Err(Error::WrongMapType { .. })));
    }

    #[test]
    fn test_builder_rejects_bad_page_counts() {
        for pages in [0usize, 3, 5, 6, 9, 12, 1000] {
            let map = Arc::new(orphan_map_for_tests(MapType::PerfEventArray));
            let result = PerfEventStreamBuilder::new(map, |_, _| {})
                .pages(pages)
                .build();
            assert!(
                matches!(result, Err(Error::InvalidPageCount { pages: p }) if p == pages),
                "page count {} should be rejected",
                pages
            );
        }
    }

    #[test]
    fn test_builder_decode_requires_live_parent() {
        // Decode configuration is resolved before any kernel resource, so
        // an orphaned map fails with ParentGone rather than reaching the
        // kernel with a dead object.
        let map = Arc::new(orphan_map_for_tests(MapType::PerfEventArray));
        let result = PerfEventStreamBuilder::new(map, |_, _| {})
            .decode_as("execve_event")
            .build();
        assert!(matches!(result, Err(Error::ParentGone)));
    }

    #[test]
    fn test_dispatch_raw_bytes() {
        let (seen, cb) = collected();
        let ctx = raw_ctx(cb);

        ctx.dispatch_sample(2, &[1, 2, 3]);

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0], (2, Value::Bytes(vec![1, 2, 3])));
        assert_eq!(ctx.dispatched.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_dispatch_decodes_struct() {
        let defs = vec![StructDef {
            name: "evt".into(),
            fields: vec![FieldDef {
                name: "id".into(),
                ty: FieldType::U32,
                count: None,
            }],
        }];
        let registry = Arc::new(StructRegistry::build(&defs));

        let (seen, cb) = collected();
        let ctx = DispatchCtx {
            sample_cb: Mutex::new(cb),
            lost_cb: Mutex::new(None),
            decoder: Some((registry, "evt".into())),
            dispatched: AtomicUsize::new(0),
        };

        ctx.dispatch_sample(0, &[7, 0, 0, 0]);

        let seen = seen.lock();
        let (_, value) = &seen[0];
        assert_eq!(value.as_struct().unwrap().field("id"), Some(&Value::Int(7)));
    }

    #[test]
    fn test_dispatch_skips_undecodable_sample() {
        let defs = vec![StructDef {
            name: "evt".into(),
            fields: vec![FieldDef {
                name: "id".into(),
                ty: FieldType::U64,
                count: None,
            }],
        }];
        let registry = Arc::new(StructRegistry::build(&defs));

        let (seen, cb) = collected();
        let ctx = DispatchCtx {
            sample_cb: Mutex::new(cb),
            lost_cb: Mutex::new(None),
            decoder: Some((registry, "evt".into())),
            dispatched: AtomicUsize::new(0),
        };

        // Too short for the layout: logged and skipped, never delivered.
        ctx.dispatch_sample(0, &[1, 2]);

        assert!(seen.lock().is_empty());
        assert_eq!(ctx.dispatched.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_callback_panic_is_contained() {
        let ctx = raw_ctx(Box::new(|_, _| panic!("callback exploded")));

        // Must return normally; the panic is reported, not propagated.
        ctx.dispatch_sample(1, &[0, 1]);
        ctx.dispatch_sample(1, &[2, 3]);

        assert_eq!(ctx.dispatched.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_lost_dispatch_prefers_callback() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let ctx = DispatchCtx {
            sample_cb: Mutex::new(Box::new(|_, _| {})),
            lost_cb: Mutex::new(Some(Box::new(move |cpu, count| {
                sink.lock().push((cpu, count));
            }))),
            decoder: None,
            dispatched: AtomicUsize::new(0),
        };

        ctx.dispatch_lost(3, 17);
        assert_eq!(*seen.lock(), vec![(3, 17)]);
    }

    #[test]
    fn test_lost_dispatch_without_callback_does_not_panic() {
        let ctx = raw_ctx(Box::new(|_, _| {}));
        // Falls back to the log path.
        ctx.dispatch_lost(0, 5);
    }

    #[test]
    fn test_trampolines_route_through_raw_ctx() {
        // The kernel is handed the Box::into_raw pointer itself; drive both
        // trampolines through it the way the kernel would, then reclaim it
        // the way Drop does.
        let (seen, cb) = collected();
        let lost = Arc::new(Mutex::new(Vec::new()));
        let lost_sink = Arc::clone(&lost);

        let ctx = Box::into_raw(Box::new(DispatchCtx {
            sample_cb: Mutex::new(cb),
            lost_cb: Mutex::new(Some(Box::new(move |cpu, count| {
                lost_sink.lock().push((cpu, count));
            }))),
            decoder: None,
            dispatched: AtomicUsize::new(0),
        }));

        let mut data = [9u8, 8, 7];
        unsafe {
            sample_trampoline(ctx.cast(), 1, data.as_mut_ptr().cast(), data.len() as u32);
            lost_trampoline(ctx.cast(), 4, 11);
        }

        assert_eq!(*seen.lock(), vec![(1, Value::Bytes(vec![9, 8, 7]))]);
        assert_eq!(*lost.lock(), vec![(4, 11)]);
        drop(unsafe { Box::from_raw(ctx) });
    }
}
