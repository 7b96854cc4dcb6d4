//! Loaded BPF object
//!
//! Owns the kernel object handle and the name-keyed caches of program and
//! map handles. The caches are identity maps: repeated lookups of the same
//! name return the same shared handle, and the kernel object is closed only
//! after both caches have released their entries.

use std::collections::HashMap;
use std::ffi::CString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::Arc;

use log::{debug, info};
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::map::BpfMap;
use crate::program::BpfProgram;
use crate::structs::{StructDef, StructRegistry};
use crate::util;

/// State behind the object mutex: the kernel handle plus both caches.
struct ObjectState {
    /// Kernel object pointer; null until `load()` succeeds.
    obj: *mut libbpf_sys::bpf_object,
    programs: HashMap<String, Arc<BpfProgram>>,
    maps: HashMap<String, Arc<BpfMap>>,
}

impl ObjectState {
    fn obj_ptr(&self) -> Result<*mut libbpf_sys::bpf_object> {
        if self.obj.is_null() {
            Err(Error::NotLoaded)
        } else {
            Ok(self.obj)
        }
    }
}

/// Shared core of a loaded object. Program and map handles hold a `Weak`
/// back-reference to this and upgrade it before every kernel call, so the
/// object cannot be torn down mid-operation.
pub(crate) struct ObjectShared {
    path: PathBuf,
    defs: Vec<StructDef>,
    registry: Mutex<Option<Arc<StructRegistry>>>,
    state: Mutex<ObjectState>,
}

// SAFETY: the kernel object pointer is dereferenced only under the state
// mutex (object-level calls) or while a child handle holds an upgraded Arc
// guard (map/program calls, which are plain syscall wrappers on their own
// pointers). Cross-thread use of one object is additionally documented as
// requiring external serialization.
unsafe impl Send for ObjectShared {}
unsafe impl Sync for ObjectShared {}

impl ObjectShared {
    /// Registry built from the construction-time definitions, created on
    /// first use and shared from then on. `None` when no definitions were
    /// supplied.
    pub(crate) fn struct_registry(&self) -> Option<Arc<StructRegistry>> {
        if self.defs.is_empty() {
            return None;
        }
        let mut slot = self.registry.lock();
        let registry =
            slot.get_or_insert_with(|| Arc::new(StructRegistry::build(&self.defs)));
        Some(Arc::clone(registry))
    }
}

impl Drop for ObjectShared {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        // Cached handles release kernel-side state before the object
        // closes: programs detach their links, then map handles go.
        state.programs.clear();
        state.maps.clear();
        if !state.obj.is_null() {
            debug!("closing BPF object {:?}", self.path);
            unsafe { libbpf_sys::bpf_object__close(state.obj) };
            state.obj = ptr::null_mut();
        }
    }
}

/// A BPF object file and, once loaded, its kernel-resident programs and maps.
///
/// Constructed unopened; `load()` transitions it to loaded exactly once.
/// Handles returned by [`program`](Self::program) and [`map`](Self::map) are
/// cached and shared, and stay valid for as long as either the cache or an
/// external holder keeps them alive.
#[derive(Clone)]
pub struct BpfObject {
    shared: Arc<ObjectShared>,
}

impl BpfObject {
    /// Create an unopened object backed by `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_structs(path, Vec::new())
    }

    /// Create an unopened object with struct definitions for typed event
    /// decoding. The registry is built lazily on first use.
    pub fn with_structs(path: impl Into<PathBuf>, defs: Vec<StructDef>) -> Self {
        Self {
            shared: Arc::new(ObjectShared {
                path: path.into(),
                defs,
                registry: Mutex::new(None),
                state: Mutex::new(ObjectState {
                    obj: ptr::null_mut(),
                    programs: HashMap::new(),
                    maps: HashMap::new(),
                }),
            }),
        }
    }

    /// Path of the backing object file.
    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    /// True once `load()` has succeeded.
    pub fn is_loaded(&self) -> bool {
        !self.shared.state.lock().obj.is_null()
    }

    /// Open the object file and load its programs and maps into the kernel.
    ///
    /// Fails with [`Error::AlreadyLoaded`] on a second call. On a kernel
    /// load failure the partially-opened handle is closed again, leaving
    /// the object unopened rather than half-loaded.
    ///
    /// # Returns
    ///
    /// Ok once every program and map in the object is resident in the kernel
    pub fn load(&self) -> Result<()> {
        let mut state = self.shared.state.lock();
        if !state.obj.is_null() {
            return Err(Error::AlreadyLoaded);
        }

        let path = self.shared.path.display().to_string();
        let c_path = util::path_to_cstring(&self.shared.path)?;

        info!("loading BPF object from {:?}", self.shared.path);
        let obj = unsafe { libbpf_sys::bpf_object__open_file(c_path.as_ptr(), ptr::null()) };
        if obj.is_null() {
            return Err(Error::OpenFailed {
                path,
                err: util::last_errno_string(),
            });
        }

        let ret = unsafe { libbpf_sys::bpf_object__load(obj) };
        if ret != 0 {
            unsafe { libbpf_sys::bpf_object__close(obj) };
            return Err(Error::LoadFailed {
                path,
                err: util::errno_string(-ret),
            });
        }

        state.obj = obj;
        debug!("BPF object {:?} loaded", self.shared.path);
        Ok(())
    }

    /// Program handle by name, created and cached on first use.
    ///
    /// # Arguments
    ///
    /// * `name` - Program name as declared in the object file
    ///
    /// # Returns
    ///
    /// Shared program handle, or [`Error::ProgramNotFound`] for unknown names
    pub fn program(&self, name: &str) -> Result<Arc<BpfProgram>> {
        let mut state = self.shared.state.lock();
        let obj = state.obj_ptr()?;

        if let Some(prog) = state.programs.get(name) {
            return Ok(Arc::clone(prog));
        }

        let c_name = CString::new(name).map_err(|_| Error::ProgramNotFound {
            name: name.to_string(),
        })?;
        let ptr = unsafe { libbpf_sys::bpf_object__find_program_by_name(obj, c_name.as_ptr()) };
        if ptr.is_null() {
            return Err(Error::ProgramNotFound {
                name: name.to_string(),
            });
        }

        let prog = self.new_program_handle(ptr, name.to_string());
        state.programs.insert(name.to_string(), Arc::clone(&prog));
        Ok(prog)
    }

    /// Map handle by name, created and cached on first use.
    ///
    /// # Arguments
    ///
    /// * `name` - Map name as declared in the object file
    ///
    /// # Returns
    ///
    /// Shared map handle, or [`Error::MapNotFound`] for unknown names
    pub fn map(&self, name: &str) -> Result<Arc<BpfMap>> {
        let mut state = self.shared.state.lock();
        let obj = state.obj_ptr()?;

        if let Some(map) = state.maps.get(name) {
            return Ok(Arc::clone(map));
        }

        let c_name = CString::new(name).map_err(|_| Error::MapNotFound {
            name: name.to_string(),
        })?;
        let ptr = unsafe { libbpf_sys::bpf_object__find_map_by_name(obj, c_name.as_ptr()) };
        if ptr.is_null() {
            return Err(Error::MapNotFound {
                name: name.to_string(),
            });
        }

        let map = self.new_map_handle(ptr, name.to_string());
        state.maps.insert(name.to_string(), Arc::clone(&map));
        Ok(map)
    }

    /// Names of every program in the object, in declaration order,
    /// populating the handle cache as a side effect.
    pub fn program_names(&self) -> Result<Vec<String>> {
        let mut state = self.shared.state.lock();
        let obj = state.obj_ptr()?;

        let mut names = Vec::new();
        let mut prog = ptr::null_mut();
        loop {
            prog = unsafe { libbpf_sys::bpf_object__next_program(obj, prog) };
            if prog.is_null() {
                break;
            }
            let name = unsafe { util::cstr_to_string(libbpf_sys::bpf_program__name(prog)) };
            if !state.programs.contains_key(&name) {
                let handle = self.new_program_handle(prog, name.clone());
                state.programs.insert(name.clone(), handle);
            }
            names.push(name);
        }
        Ok(names)
    }

    /// Names of every map in the object, in declaration order, populating
    /// the handle cache as a side effect.
    pub fn map_names(&self) -> Result<Vec<String>> {
        let mut state = self.shared.state.lock();
        let obj = state.obj_ptr()?;

        let mut names = Vec::new();
        let mut map = ptr::null_mut();
        loop {
            map = unsafe { libbpf_sys::bpf_object__next_map(obj, map) };
            if map.is_null() {
                break;
            }
            let name = unsafe { util::cstr_to_string(libbpf_sys::bpf_map__name(map)) };
            if !state.maps.contains_key(&name) {
                let handle = self.new_map_handle(map, name.clone());
                state.maps.insert(name.clone(), handle);
            }
            names.push(name);
        }
        Ok(names)
    }

    /// Attach every program not already attached and return the full
    /// name-to-handle association. Already-attached programs are left
    /// untouched, so repeated calls are idempotent.
    ///
    /// # Returns
    ///
    /// Every program handle in the object keyed by name, all attached
    pub fn attach_all(&self) -> Result<HashMap<String, Arc<BpfProgram>>> {
        let names = self.program_names()?;
        let mut attached = HashMap::with_capacity(names.len());

        for name in names {
            let prog = self.program(&name)?;
            if !prog.is_attached() {
                prog.attach()?;
            }
            attached.insert(name, prog);
        }

        info!("attached {} programs", attached.len());
        Ok(attached)
    }

    /// Program handles created so far, sorted by name.
    pub fn cached_programs(&self) -> Vec<(String, Arc<BpfProgram>)> {
        let state = self.shared.state.lock();
        let mut entries: Vec<_> = state
            .programs
            .iter()
            .map(|(name, prog)| (name.clone(), Arc::clone(prog)))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// Map handles created so far, sorted by name.
    pub fn cached_maps(&self) -> Vec<(String, Arc<BpfMap>)> {
        let state = self.shared.state.lock();
        let mut entries: Vec<_> = state
            .maps
            .iter()
            .map(|(name, map)| (name.clone(), Arc::clone(map)))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// Shared struct registry, if definitions were supplied at construction.
    pub fn struct_registry(&self) -> Option<Arc<StructRegistry>> {
        self.shared.struct_registry()
    }

    fn new_program_handle(&self, ptr: *mut libbpf_sys::bpf_program, name: String) -> Arc<BpfProgram> {
        let section =
            unsafe { util::cstr_to_string(libbpf_sys::bpf_program__section_name(ptr)) };
        debug!("caching handle for program '{}' (section '{}')", name, section);
        Arc::new(BpfProgram::new(
            Arc::downgrade(&self.shared),
            ptr,
            name,
            section,
        ))
    }

    fn new_map_handle(&self, ptr: *mut libbpf_sys::bpf_map, name: String) -> Arc<BpfMap> {
        let map = BpfMap::new(Arc::downgrade(&self.shared), ptr, name);
        debug!(
            "caching handle for map '{}' (type {}, key {}B, value {}B)",
            map.name(),
            map.map_type(),
            map.key_size(),
            map.value_size()
        );
        Arc::new(map)
    }
}

impl fmt::Debug for BpfObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BpfObject")
            .field("path", &self.shared.path)
            .field("loaded", &self.is_loaded())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structs::{FieldDef, FieldType};
    use std::io::Write;

    #[test]
    fn test_accessors_require_load() {
        let object = BpfObject::new("/tmp/does-not-exist.bpf.o");

        assert!(!object.is_loaded());
        assert!(matches!(object.program("p"), Err(Error::NotLoaded)));
        assert!(matches!(object.map("m"), Err(Error::NotLoaded)));
        assert!(matches!(object.program_names(), Err(Error::NotLoaded)));
        assert!(matches!(object.map_names(), Err(Error::NotLoaded)));
        assert!(matches!(object.attach_all(), Err(Error::NotLoaded)));
    }

    #[test]
    fn test_load_missing_file() {
        let object = BpfObject::new("/this/path/should/not/exist.bpf.o");
        assert!(matches!(object.load(), Err(Error::OpenFailed { .. })));
        assert!(!object.is_loaded());

        // A failed load leaves the object unopened; retrying reports the
        // open failure again, not AlreadyLoaded.
        assert!(matches!(object.load(), Err(Error::OpenFailed { .. })));
    }

    #[test]
    fn test_load_rejects_malformed_object() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"definitely not an ELF object").unwrap();

        let object = BpfObject::new(file.path());
        assert!(matches!(object.load(), Err(Error::OpenFailed { .. })));
        assert!(!object.is_loaded());
    }

    #[test]
    fn test_caches_start_empty() {
        let object = BpfObject::new("/tmp/x.bpf.o");
        assert!(object.cached_programs().is_empty());
        assert!(object.cached_maps().is_empty());
    }

    #[test]
    fn test_struct_registry_presence() {
        let plain = BpfObject::new("/tmp/x.bpf.o");
        assert!(plain.struct_registry().is_none());

        let defs = vec![StructDef {
            name: "evt".into(),
            fields: vec![FieldDef {
                name: "id".into(),
                ty: FieldType::U32,
                count: None,
            }],
        }];
        let typed = BpfObject::with_structs("/tmp/x.bpf.o", defs);

        let registry = typed.struct_registry().unwrap();
        assert!(registry.has("evt"));

        // Lazily built once, then shared.
        let again = typed.struct_registry().unwrap();
        assert!(Arc::ptr_eq(&registry, &again));
    }

    #[test]
    fn test_path_accessor() {
        let object = BpfObject::new("/tmp/probe.bpf.o");
        assert_eq!(object.path(), Path::new("/tmp/probe.bpf.o"));
        let text = format!("{:?}", object);
        assert!(text.contains("probe.bpf.o"));
    }
}
