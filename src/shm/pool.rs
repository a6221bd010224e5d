use std::{
    cell::Cell,
    io,
    ops::Deref,
    os::unix::io::{AsFd, AsRawFd, OwnedFd},
    ptr::{self, NonNull},
    slice,
    sync::{Arc, Once},
};

use rustix::mm;
use tracing::{debug, trace};

// Maintainers note: The initializer must NEVER panic or allocate memory.
thread_local!(static SIGBUS_GUARD: Cell<(*const MemMap, bool)> = const { Cell::new((ptr::null_mut(), false)) });

static SIGBUS_INIT: Once = Once::new();
static mut OLD_SIGBUS_HANDLER: *mut libc::sigaction = ptr::null_mut();

/// A shared read-write mapping of a client-supplied file descriptor
#[derive(Debug)]
pub(crate) struct Pool {
    map: MemMap,
    fd: Arc<OwnedFd>,
}

// SAFETY: The mapping pointer is only dereferenced through the pool, which is owned by the
// server state and only ever touched from the dispatch thread.
unsafe impl Send for Pool {}

impl Pool {
    pub fn new(fd: OwnedFd, size: usize) -> io::Result<Pool> {
        let map = match MemMap::new(fd.as_fd(), size) {
            Ok(map) => map,
            Err(err) => {
                trace!(fd = fd.as_raw_fd(), size, ?err, "Failed to map shm pool");
                // fd is closed on drop
                return Err(err);
            }
        };

        trace!(fd = fd.as_raw_fd(), size, "Creating new shm pool");
        Ok(Pool {
            map,
            fd: Arc::new(fd),
        })
    }

    /// Grow the mapping. The old mapping is left untouched if the new one cannot be established.
    pub fn resize(&mut self, new_size: usize) -> io::Result<()> {
        let old_size = self.map.size;
        trace!(fd = self.fd.as_raw_fd(), old_size, new_size, "Resizing shm pool");

        if let Err(err) = self.map.remap(self.fd.as_fd(), new_size) {
            debug!(
                fd = self.fd.as_raw_fd(),
                old_size,
                new_size,
                ?err,
                "SHM pool resize failed"
            );
            return Err(err);
        }
        Ok(())
    }

    pub fn size(&self) -> usize {
        self.map.size
    }

    pub fn fd(&self) -> &Arc<OwnedFd> {
        &self.fd
    }

    /// Run `f` on the mapped bytes, catching a SIGBUS raised by a truncated backing file
    ///
    /// On a caught fault the mapping is replaced by anonymous memory and `Err` is returned.
    pub fn with_data_slice<T, F: FnOnce(&[u8]) -> T>(&self, f: F) -> Result<T, ()> {
        SIGBUS_INIT.call_once(|| unsafe {
            place_sigbus_handler();
        });

        trace!(fd = self.fd.as_raw_fd(), "Buffer access on shm pool");

        let reentrant = SIGBUS_GUARD.with(|guard| {
            let (p, _) = guard.get();
            if !p.is_null() {
                return true;
            }
            guard.set((&self.map as *const MemMap, false));
            false
        });
        if reentrant {
            // a nested access cannot be told apart from the outer one by the handler
            debug!(fd = self.fd.as_raw_fd(), "Refusing nested access to shm pool");
            return Err(());
        }

        let t = f(&self.map[..]);

        SIGBUS_GUARD.with(|guard| {
            let (_, triggered) = guard.get();
            guard.set((ptr::null_mut(), false));
            if triggered {
                debug!(fd = self.fd.as_raw_fd(), "SIGBUS caught on access on shm pool");
                Err(())
            } else {
                Ok(t)
            }
        })
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        trace!(fd = self.fd.as_raw_fd(), "Deleting SHM pool");
    }
}

#[derive(Debug)]
struct MemMap {
    ptr: NonNull<u8>,
    size: usize,
}

impl MemMap {
    fn new(fd: impl AsFd, size: usize) -> io::Result<MemMap> {
        let ptr = unsafe { map(fd, size) }?;
        Ok(MemMap { ptr, size })
    }

    fn remap(&mut self, fd: impl AsFd, new_size: usize) -> io::Result<()> {
        let new_ptr = unsafe { map(fd, new_size) }?;
        // unmapping a mapping we established cannot fail
        let _ = unsafe { unmap(self.ptr, self.size) };
        self.ptr = new_ptr;
        self.size = new_size;
        Ok(())
    }

    fn contains(&self, ptr: *mut u8) -> bool {
        ptr >= self.ptr.as_ptr() && ptr < unsafe { self.ptr.as_ptr().add(self.size) }
    }

    /// Nullifies the current memory mapping.
    ///
    /// Nullification replaces the existing memory mapping with an anonymous mapping.
    ///
    /// # Safety
    ///
    /// The caller must ensure exclusive access to the memory mapping.
    unsafe fn nullify(&self) -> rustix::io::Result<()> {
        mm::mmap_anonymous(
            self.ptr.as_ptr().cast(),
            self.size,
            mm::ProtFlags::READ,
            // Require the os to place the mapping at the specified address.
            mm::MapFlags::PRIVATE | mm::MapFlags::FIXED,
        )?;
        Ok(())
    }
}

impl Deref for MemMap {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        // SAFETY: The mapping is valid for `size` bytes for as long as `self` lives, and the
        // returned slice borrows `self`.
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.size) }
    }
}

impl Drop for MemMap {
    fn drop(&mut self) {
        let _ = unsafe { unmap(self.ptr, self.size) };
    }
}

unsafe fn map(fd: impl AsFd, size: usize) -> io::Result<NonNull<u8>> {
    let ptr = mm::mmap(
        ptr::null_mut(),
        size,
        mm::ProtFlags::READ | mm::ProtFlags::WRITE,
        mm::MapFlags::SHARED,
        fd,
        0,
    )?;
    NonNull::new(ptr.cast()).ok_or_else(|| io::Error::new(io::ErrorKind::Other, "mmap returned null"))
}

unsafe fn unmap(ptr: NonNull<u8>, size: usize) -> rustix::io::Result<()> {
    mm::munmap(ptr.as_ptr().cast(), size)
}

unsafe fn place_sigbus_handler() {
    let mut action: libc::sigaction = std::mem::zeroed();
    action.sa_sigaction = sigbus_handler as *const () as libc::sighandler_t;
    action.sa_flags = libc::SA_SIGINFO | libc::SA_NODEFER;
    libc::sigemptyset(&mut action.sa_mask);

    let old = Box::into_raw(Box::new(std::mem::zeroed::<libc::sigaction>()));
    if libc::sigaction(libc::SIGBUS, &action, old) == 0 {
        OLD_SIGBUS_HANDLER = old;
    } else {
        drop(Box::from_raw(old));
        debug!(
            err = %io::Error::last_os_error(),
            "sigaction failed for SIGBUS handler, faulty shm access will not be recovered"
        );
    }
}

/// Safety:
///
/// Must only be called from the SIGBUS handler.
unsafe fn reraise_sigbus() {
    let old = OLD_SIGBUS_HANDLER;
    if !old.is_null() {
        libc::sigaction(libc::SIGBUS, old, ptr::null_mut());
    }
    libc::raise(libc::SIGBUS);
}

/// The sigbus handler for shm memory.
///
/// Only async-signal-safe operations are allowed in here: no allocation, no panic. The thread
/// local guard tells whether the faulting address belongs to the pool currently being read.
extern "C" fn sigbus_handler(_signum: libc::c_int, info: *mut libc::siginfo_t, _context: *mut libc::c_void) {
    // SAFETY: The info is valid for the lifetime of this signal handler.
    let info = unsafe { &*info };
    let faulty_ptr = unsafe { info.si_addr() } as *mut u8;

    let result = SIGBUS_GUARD.try_with(|guard| {
        let (memmap, _) = guard.get();

        if let Some(memmap) = unsafe { memmap.as_ref() } {
            if memmap.contains(faulty_ptr) {
                guard.set((memmap, true));

                // SAFETY: the guard is set, the current thread has exclusive access to the mapping.
                if unsafe { memmap.nullify() }.is_err() {
                    unsafe { reraise_sigbus() }
                }
                return;
            }
        }

        // not ours
        unsafe { reraise_sigbus() }
    });

    // TLS was accessed during or after destruction.
    if result.is_err() {
        unsafe { reraise_sigbus() }
    }
}
