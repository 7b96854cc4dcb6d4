//! BPF program handle
//!
//! One loadable program inside an object, plus its attach lifecycle. The
//! attachment point comes from the program's section in the object file;
//! attaching yields a kernel link that is destroyed on detach or drop.

use std::fmt;
use std::ptr;
use std::sync::Weak;

use log::{debug, warn};
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::object::ObjectShared;
use crate::util;

/// A kernel program reference and its optional live attachment.
///
/// Handles are created by [`BpfObject`](crate::BpfObject) and shared between
/// its cache and external holders. Operations that reach the kernel upgrade
/// the parent back-reference first and fail with [`Error::ParentGone`] once
/// the owning object has been destroyed.
pub struct BpfProgram {
    name: String,
    section: String,
    parent: Weak<ObjectShared>,
    prog: *mut libbpf_sys::bpf_program,
    /// Kernel link; null while detached.
    link: Mutex<*mut libbpf_sys::bpf_link>,
}

// SAFETY: `prog` is dereferenced only while an upgraded parent guard keeps
// the owning object alive, and the link pointer is owned exclusively behind
// its mutex. The libbpf attach and link-destroy calls are syscall wrappers
// with no thread affinity.
unsafe impl Send for BpfProgram {}
unsafe impl Sync for BpfProgram {}

impl BpfProgram {
    pub(crate) fn new(
        parent: Weak<ObjectShared>,
        prog: *mut libbpf_sys::bpf_program,
        name: String,
        section: String,
    ) -> Self {
        Self {
            name,
            section,
            parent,
            prog,
            link: Mutex::new(ptr::null_mut()),
        }
    }

    /// Program name within its object.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Section the program was declared under, which determines its
    /// default attachment point.
    pub fn section(&self) -> &str {
        &self.section
    }

    /// True while a kernel link is held.
    pub fn is_attached(&self) -> bool {
        !self.link.lock().is_null()
    }

    /// Attach at the object-file-declared attachment point.
    ///
    /// Fails with [`Error::AlreadyAttached`] rather than replacing a live
    /// link, and leaves the program detached if the kernel rejects the
    /// request.
    ///
    /// # Returns
    ///
    /// Ok once a kernel link is held; the program stays detached on error
    pub fn attach(&self) -> Result<()> {
        let mut link = self.link.lock();
        if !link.is_null() {
            return Err(Error::AlreadyAttached {
                name: self.name.clone(),
            });
        }

        let _parent = self.parent.upgrade().ok_or(Error::ParentGone)?;
        let ptr = unsafe { libbpf_sys::bpf_program__attach(self.prog) };
        if ptr.is_null() {
            return Err(Error::AttachFailed {
                name: self.name.clone(),
                err: util::last_errno_string(),
            });
        }

        *link = ptr;
        debug!("attached program '{}' (section '{}')", self.name, self.section);
        Ok(())
    }

    /// Destroy the link if one is held; a no-op when already detached, so
    /// it is safe to call repeatedly and from teardown paths.
    ///
    /// # Returns
    ///
    /// Result of the link destruction, Ok when no link was held
    pub fn detach(&self) -> Result<()> {
        let mut link = self.link.lock();
        if link.is_null() {
            return Ok(());
        }

        let ret = unsafe { libbpf_sys::bpf_link__destroy(*link) };
        // bpf_link__destroy frees the link even when detaching fails, so
        // the pointer must not be kept in either case.
        *link = ptr::null_mut();
        if ret != 0 {
            return Err(Error::DetachFailed {
                name: self.name.clone(),
                err: util::errno_string(-ret),
            });
        }

        debug!("detached program '{}'", self.name);
        Ok(())
    }
}

impl Drop for BpfProgram {
    fn drop(&mut self) {
        if let Err(err) = self.detach() {
            warn!("{}", err);
        }
    }
}

impl fmt::Debug for BpfProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BpfProgram")
            .field("name", &self.name)
            .field("section", &self.section)
            .field("attached", &self.is_attached())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn orphan_program() -> BpfProgram {
        BpfProgram::new(
            Weak::new(),
            ptr::null_mut(),
            "count_execve".into(),
            "tracepoint/syscalls/sys_enter_execve".into(),
        )
    }

    #[test]
    fn test_orphan_attach_fails_parent_gone() {
        let prog = orphan_program();
        // Parent liveness is checked before the program pointer is touched.
        assert!(matches!(prog.attach(), Err(Error::ParentGone)));
        assert!(!prog.is_attached());
    }

    #[test]
    fn test_detach_without_link_is_noop() {
        let prog = orphan_program();
        assert!(prog.detach().is_ok());
        assert!(prog.detach().is_ok());
        assert!(!prog.is_attached());
    }

    #[test]
    fn test_accessors() {
        let prog = orphan_program();
        assert_eq!(prog.name(), "count_execve");
        assert_eq!(prog.section(), "tracepoint/syscalls/sys_enter_execve");
    }
}
