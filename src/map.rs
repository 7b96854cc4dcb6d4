//! BPF map handle
//!
//! Key/value CRUD, cursor-based iteration, and metadata for one kernel map.
//! Keys and values cross the boundary as fixed-size byte buffers produced
//! by the marshaller; the handle itself performs no locking, matching the
//! kernel's per-key atomicity guarantees.

use std::fmt;
use std::sync::{Arc, Weak};

use crate::error::{Error, Result};
use crate::marshal::{bytes_to_value, value_to_bytes};
use crate::object::ObjectShared;
use crate::util;
use crate::value::Value;

/// Kernel map type, mirroring `enum bpf_map_type` numbering.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapType {
    Unspec,
    Hash,
    Array,
    ProgArray,
    PerfEventArray,
    PerCpuHash,
    PerCpuArray,
    StackTrace,
    CgroupArray,
    LruHash,
    LruPerCpuHash,
    LpmTrie,
    ArrayOfMaps,
    HashOfMaps,
    DevMap,
    SockMap,
    CpuMap,
    XskMap,
    SockHash,
    CgroupStorage,
    ReuseportSockArray,
    PerCpuCgroupStorage,
    Queue,
    Stack,
    SkStorage,
    DevMapHash,
    StructOps,
    RingBuf,
    InodeStorage,
    TaskStorage,
    BloomFilter,
    UserRingBuf,
    CgrpStorage,
    /// A type this crate does not know about yet.
    Unknown(u32),
}

impl MapType {
    /// Map a raw kernel type number onto the enum.
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            0 => MapType::Unspec,
            1 => MapType::Hash,
            2 => MapType::Array,
            3 => MapType::ProgArray,
            4 => MapType::PerfEventArray,
            5 => MapType::PerCpuHash,
            6 => MapType::PerCpuArray,
            7 => MapType::StackTrace,
            8 => MapType::CgroupArray,
            9 => MapType::LruHash,
            10 => MapType::LruPerCpuHash,
            11 => MapType::LpmTrie,
            12 => MapType::ArrayOfMaps,
            13 => MapType::HashOfMaps,
            14 => MapType::DevMap,
            15 => MapType::SockMap,
            16 => MapType::CpuMap,
            17 => MapType::XskMap,
            18 => MapType::SockHash,
            19 => MapType::CgroupStorage,
            20 => MapType::ReuseportSockArray,
            21 => MapType::PerCpuCgroupStorage,
            22 => MapType::Queue,
            23 => MapType::Stack,
            24 => MapType::SkStorage,
            25 => MapType::DevMapHash,
            26 => MapType::StructOps,
            27 => MapType::RingBuf,
            28 => MapType::InodeStorage,
            29 => MapType::TaskStorage,
            30 => MapType::BloomFilter,
            31 => MapType::UserRingBuf,
            32 => MapType::CgrpStorage,
            other => MapType::Unknown(other),
        }
    }
}

impl fmt::Display for MapType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MapType::Unspec => "unspec",
            MapType::Hash => "hash",
            MapType::Array => "array",
            MapType::ProgArray => "prog_array",
            MapType::PerfEventArray => "perf_event_array",
            MapType::PerCpuHash => "percpu_hash",
            MapType::PerCpuArray => "percpu_array",
            MapType::StackTrace => "stack_trace",
            MapType::CgroupArray => "cgroup_array",
            MapType::LruHash => "lru_hash",
            MapType::LruPerCpuHash => "lru_percpu_hash",
            MapType::LpmTrie => "lpm_trie",
            MapType::ArrayOfMaps => "array_of_maps",
            MapType::HashOfMaps => "hash_of_maps",
            MapType::DevMap => "devmap",
            MapType::SockMap => "sockmap",
            MapType::CpuMap => "cpumap",
            MapType::XskMap => "xskmap",
            MapType::SockHash => "sockhash",
            MapType::CgroupStorage => "cgroup_storage",
            MapType::ReuseportSockArray => "reuseport_sockarray",
            MapType::PerCpuCgroupStorage => "percpu_cgroup_storage",
            MapType::Queue => "queue",
            MapType::Stack => "stack",
            MapType::SkStorage => "sk_storage",
            MapType::DevMapHash => "devmap_hash",
            MapType::StructOps => "struct_ops",
            MapType::RingBuf => "ringbuf",
            MapType::InodeStorage => "inode_storage",
            MapType::TaskStorage => "task_storage",
            MapType::BloomFilter => "bloom_filter",
            MapType::UserRingBuf => "user_ringbuf",
            MapType::CgrpStorage => "cgrp_storage",
            MapType::Unknown(raw) => return write!(f, "unknown({})", raw),
        };
        f.write_str(name)
    }
}

/// A kernel map reference with its metadata frozen at creation.
///
/// Handles are created by [`BpfObject`](crate::BpfObject) and shared between
/// its cache and external holders. Every kernel-touching operation upgrades
/// the parent back-reference first and holds the guard for the duration of
/// the call, failing with [`Error::ParentGone`] once the object is gone.
pub struct BpfMap {
    name: String,
    parent: Weak<ObjectShared>,
    map: *mut libbpf_sys::bpf_map,
    fd: i32,
    ty: MapType,
    key_size: u32,
    value_size: u32,
    max_entries: u32,
}

// SAFETY: `map` is dereferenced only while an upgraded parent guard keeps
// the owning object alive; the remaining fields are immutable copies taken
// at construction. The map element calls are syscall wrappers safe to issue
// from any thread.
unsafe impl Send for BpfMap {}
unsafe impl Sync for BpfMap {}

impl BpfMap {
    /// Build a handle for `map`, capturing its metadata while the caller
    /// guarantees the object is alive.
    pub(crate) fn new(parent: Weak<ObjectShared>, map: *mut libbpf_sys::bpf_map, name: String) -> Self {
        let (fd, ty, key_size, value_size, max_entries) = unsafe {
            (
                libbpf_sys::bpf_map__fd(map),
                MapType::from_raw(libbpf_sys::bpf_map__type(map)),
                libbpf_sys::bpf_map__key_size(map),
                libbpf_sys::bpf_map__value_size(map),
                libbpf_sys::bpf_map__max_entries(map),
            )
        };
        Self {
            name,
            parent,
            map,
            fd,
            ty,
            key_size,
            value_size,
            max_entries,
        }
    }

    /// Map name within its object.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// File descriptor of the loaded map.
    pub fn fd(&self) -> i32 {
        self.fd
    }

    /// Kernel map type.
    pub fn map_type(&self) -> MapType {
        self.ty
    }

    /// Key size in bytes.
    pub fn key_size(&self) -> u32 {
        self.key_size
    }

    /// Value size in bytes.
    pub fn value_size(&self) -> u32 {
        self.value_size
    }

    /// Maximum number of entries.
    pub fn max_entries(&self) -> u32 {
        self.max_entries
    }

    pub(crate) fn upgrade_parent(&self) -> Result<Arc<ObjectShared>> {
        self.parent.upgrade().ok_or(Error::ParentGone)
    }

    /// Look up `key` and decode the stored value.
    ///
    /// Direct lookups treat an absent key as a fault ([`Error::KeyNotFound`]),
    /// unlike iteration, where running out of keys is the termination signal.
    ///
    /// # Arguments
    ///
    /// * `key` - Host value to encode against the map's key size
    ///
    /// # Returns
    ///
    /// The stored value decoded per the map's value size
    pub fn lookup(&self, key: &Value) -> Result<Value> {
        let _guard = self.upgrade_parent()?;
        let k = value_to_bytes(key, self.key_size as usize)?;
        let mut v = vec![0u8; self.value_size as usize];

        if self.lookup_raw(&k, &mut v)? {
            Ok(bytes_to_value(&v))
        } else {
            Err(Error::KeyNotFound)
        }
    }

    /// Insert or overwrite `key` with `value` (unconditional upsert).
    ///
    /// # Arguments
    ///
    /// * `key` - Host value to encode against the map's key size
    /// * `value` - Host value to encode against the map's value size
    ///
    /// # Returns
    ///
    /// Ok once the kernel holds the entry
    pub fn update(&self, key: &Value, value: &Value) -> Result<()> {
        let _guard = self.upgrade_parent()?;
        let k = value_to_bytes(key, self.key_size as usize)?;
        let v = value_to_bytes(value, self.value_size as usize)?;

        let ret = unsafe {
            libbpf_sys::bpf_map__update_elem(
                self.map,
                k.as_ptr().cast(),
                k.len() as libbpf_sys::size_t,
                v.as_ptr().cast(),
                v.len() as libbpf_sys::size_t,
                u64::from(libbpf_sys::BPF_ANY),
            )
        };
        if ret != 0 {
            return Err(Error::UpdateFailed {
                err: util::errno_string(-ret),
            });
        }
        Ok(())
    }

    /// Remove `key` from the map.
    pub fn delete(&self, key: &Value) -> Result<()> {
        let _guard = self.upgrade_parent()?;
        let k = value_to_bytes(key, self.key_size as usize)?;

        let ret = unsafe {
            libbpf_sys::bpf_map__delete_elem(
                self.map,
                k.as_ptr().cast(),
                k.len() as libbpf_sys::size_t,
                0,
            )
        };
        if ret != 0 {
            let errno = -ret;
            if errno == libc::ENOENT {
                return Err(Error::KeyNotFound);
            }
            return Err(Error::DeleteFailed {
                err: util::errno_string(errno),
            });
        }
        Ok(())
    }

    /// Step the kernel's key cursor.
    ///
    /// Enumeration order is the kernel's internal order (hash-bucket order
    /// for hash maps), not insertion order.
    ///
    /// # Arguments
    ///
    /// * `prev` - Key returned by the previous step, or None to start
    ///
    /// # Returns
    ///
    /// The next key, or None once the key space is exhausted
    pub fn next_key(&self, prev: Option<&Value>) -> Result<Option<Value>> {
        let _guard = self.upgrade_parent()?;
        let prev_raw = match prev {
            Some(key) => Some(value_to_bytes(key, self.key_size as usize)?),
            None => None,
        };

        let mut next = vec![0u8; self.key_size as usize];
        if self.next_key_raw(prev_raw.as_deref(), &mut next)? {
            Ok(Some(bytes_to_value(&next)))
        } else {
            Ok(None)
        }
    }

    /// Every key currently visible to a full cursor walk.
    pub fn keys(&self) -> Result<Vec<Value>> {
        let _guard = self.upgrade_parent()?;
        let mut keys = Vec::new();
        self.walk_keys(|key| keys.push(bytes_to_value(key)))?;
        Ok(keys)
    }

    /// Every value reachable by a full scan. Entries deleted between the
    /// cursor step and the lookup are skipped.
    pub fn values(&self) -> Result<Vec<Value>> {
        let _guard = self.upgrade_parent()?;
        let mut values = Vec::new();
        self.walk_entries(|_, value| values.push(bytes_to_value(value)))?;
        Ok(values)
    }

    /// Every key/value pair reachable by a full scan, with the same
    /// disappearing-entry tolerance as [`values`](Self::values).
    pub fn items(&self) -> Result<Vec<(Value, Value)>> {
        let _guard = self.upgrade_parent()?;
        let mut items = Vec::new();
        self.walk_entries(|key, value| {
            items.push((bytes_to_value(key), bytes_to_value(value)));
        })?;
        Ok(items)
    }

    /// Cursor walk over raw keys. Caller holds the parent guard.
    fn walk_keys<F: FnMut(&[u8])>(&self, mut visit: F) -> Result<()> {
        let mut key = vec![0u8; self.key_size as usize];
        let mut have = self.next_key_raw(None, &mut key)?;
        while have {
            visit(&key);
            let mut next = vec![0u8; self.key_size as usize];
            have = self.next_key_raw(Some(&key), &mut next)?;
            key = next;
        }
        Ok(())
    }

    /// Two-phase scan: cursor step, then lookup. A key that vanishes
    /// between the phases is skipped and the walk continues from the key
    /// already obtained, so concurrent deletion degrades gracefully.
    fn walk_entries<F: FnMut(&[u8], &[u8])>(&self, mut visit: F) -> Result<()> {
        let mut value = vec![0u8; self.value_size as usize];
        let mut key = vec![0u8; self.key_size as usize];
        let mut have = self.next_key_raw(None, &mut key)?;
        while have {
            if self.lookup_raw(&key, &mut value)? {
                visit(&key, &value);
            }
            let mut next = vec![0u8; self.key_size as usize];
            have = self.next_key_raw(Some(&key), &mut next)?;
            key = next;
        }
        Ok(())
    }

    /// Raw lookup into `out`; `Ok(false)` means the key is gone (ENOENT).
    fn lookup_raw(&self, key: &[u8], out: &mut [u8]) -> Result<bool> {
        let ret = unsafe {
            libbpf_sys::bpf_map__lookup_elem(
                self.map,
                key.as_ptr().cast(),
                key.len() as libbpf_sys::size_t,
                out.as_mut_ptr().cast(),
                out.len() as libbpf_sys::size_t,
                0,
            )
        };
        if ret == 0 {
            return Ok(true);
        }
        let errno = -ret;
        if errno == libc::ENOENT {
            return Ok(false);
        }
        Err(Error::LookupFailed {
            err: util::errno_string(errno),
        })
    }

    /// Raw cursor step; `Ok(false)` means the key space is exhausted.
    fn next_key_raw(&self, prev: Option<&[u8]>, next: &mut [u8]) -> Result<bool> {
        let prev_ptr = prev.map_or(std::ptr::null(), |p| p.as_ptr().cast());
        let ret = unsafe {
            libbpf_sys::bpf_map__get_next_key(
                self.map,
                prev_ptr,
                next.as_mut_ptr().cast(),
                next.len() as libbpf_sys::size_t,
            )
        };
        if ret == 0 {
            return Ok(true);
        }
        let errno = -ret;
        if errno == libc::ENOENT {
            return Ok(false);
        }
        Err(Error::LookupFailed {
            err: util::errno_string(errno),
        })
    }
}

impl fmt::Debug for BpfMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BpfMap")
            .field("name", &self.name)
            .field("type", &self.ty)
            .field("key_size", &self.key_size)
            .field("value_size", &self.value_size)
            .field("max_entries", &self.max_entries)
            .finish()
    }
}

#[cfg(test)]
pub(crate) fn orphan_map_for_tests(ty: MapType) -> BpfMap {
    BpfMap {
        name: "test_map".into(),
        parent: Weak::new(),
        map: std::ptr::null_mut(),
        fd: -1,
        ty,
        key_size: 4,
        value_size: 8,
        max_entries: 16,
    }
}
