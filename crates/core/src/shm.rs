//! Kernel-backed shared memory regions (unix).
//!
//! The region behind a shared pool must be mappable by a cooperating
//! child process, so it is backed by a sealed memfd where available and
//! by an unlinked POSIX shared memory object elsewhere. Sandboxed
//! platforms require object names prefixed with the application group
//! identifier.

use std::io;
use std::os::fd::{BorrowedFd, OwnedFd};
use std::ptr::NonNull;

use rustix::mm::{MapFlags, ProtFlags};

use crate::error::PoolError;

/// Size of one memory page.
pub(crate) fn page_size() -> usize {
    rustix::param::page_size()
}

/// A mapped, kernel-backed shared memory region.
pub(crate) struct ShmRegion {
    fd: OwnedFd,
    base: NonNull<u8>,
    len: usize,
}

// The region is mapped once for the lifetime of the value and only ever
// handed out in non-overlapping slabs.
unsafe impl Send for ShmRegion {}
unsafe impl Sync for ShmRegion {}

impl ShmRegion {
    /// Creates an object of `len` bytes and maps it read/write shared.
    pub(crate) fn create(
        len: usize,
        application_group_id: Option<&str>,
    ) -> Result<Self, PoolError> {
        let fd = create_object(len, application_group_id)?;

        let base = unsafe {
            rustix::mm::mmap(
                std::ptr::null_mut(),
                len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &fd,
                0,
            )
        }
        .map_err(|errno| {
            tracing::warn!(len, %errno, "mapping the shared buffer region failed");
            PoolError::ShmMap {
                source: io::Error::from(errno),
            }
        })?;

        let base = NonNull::new(base.cast::<u8>()).ok_or_else(|| PoolError::ShmMap {
            source: io::Error::other("mmap returned a null mapping"),
        })?;

        Ok(Self { fd, base, len })
    }

    pub(crate) fn fd(&self) -> BorrowedFd<'_> {
        use std::os::fd::AsFd;
        self.fd.as_fd()
    }

    pub(crate) fn base(&self) -> NonNull<u8> {
        self.base
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }
}

impl Drop for ShmRegion {
    fn drop(&mut self) {
        unsafe {
            let _ = rustix::mm::munmap(self.base.as_ptr().cast(), self.len);
        }
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn create_object(len: usize, _application_group_id: Option<&str>) -> Result<OwnedFd, PoolError> {
    use rustix::fs::{MemfdFlags, SealFlags};

    let shm_err = |errno: rustix::io::Errno| {
        tracing::warn!(len, %errno, "creating the shared buffer object failed");
        PoolError::ShmCreate {
            source: io::Error::from(errno),
        }
    };

    let fd = rustix::fs::memfd_create(
        "spool-buffer-pool",
        MemfdFlags::CLOEXEC | MemfdFlags::ALLOW_SEALING,
    )
    .map_err(shm_err)?;
    rustix::fs::ftruncate(&fd, len as u64).map_err(shm_err)?;

    // Consumers of the fd must not be able to truncate the region out
    // from under the pool.
    rustix::fs::fcntl_add_seals(&fd, SealFlags::SHRINK).map_err(shm_err)?;

    Ok(fd)
}

#[cfg(all(unix, not(any(target_os = "linux", target_os = "android"))))]
fn create_object(len: usize, application_group_id: Option<&str>) -> Result<OwnedFd, PoolError> {
    use rustix::fs::Mode;
    use rustix::shm::OFlags;

    let shm_err = |errno: rustix::io::Errno| {
        tracing::warn!(len, %errno, "creating the shared buffer object failed");
        PoolError::ShmCreate {
            source: io::Error::from(errno),
        }
    };

    let name = object_name(application_group_id);
    let fd = rustix::shm::open(
        name.as_str(),
        OFlags::CREATE | OFlags::EXCL | OFlags::RDWR,
        Mode::RUSR | Mode::WUSR,
    )
    .map_err(shm_err)?;
    // The object stays alive through the fd alone.
    let _ = rustix::shm::unlink(name.as_str());

    // ftruncate can only be issued once per shared memory object on
    // macOS, so skip it when the object is already large enough.
    #[cfg(target_os = "macos")]
    let needs_truncate = {
        let stat = rustix::fs::fstat(&fd).map_err(shm_err)?;
        stat.st_size < 0 || (stat.st_size as u64) < len as u64
    };
    #[cfg(not(target_os = "macos"))]
    let needs_truncate = true;

    if needs_truncate {
        rustix::fs::ftruncate(&fd, len as u64).map_err(shm_err)?;
    }

    Ok(fd)
}

// Sandboxed processes may only create objects inside their application
// group's namespace.
#[cfg(target_os = "macos")]
fn object_name(application_group_id: Option<&str>) -> String {
    use data_encoding::BASE32_NOPAD;
    use rand::RngCore;

    match application_group_id {
        Some(group) if !group.is_empty() => {
            let mut raw = [0u8; 10];
            rand::thread_rng().fill_bytes(&mut raw);
            format!("{group}/{}", BASE32_NOPAD.encode(&raw))
        }
        _ => unnamed_object_name(),
    }
}

#[cfg(all(
    unix,
    not(any(target_os = "linux", target_os = "android", target_os = "macos"))
))]
fn object_name(_application_group_id: Option<&str>) -> String {
    unnamed_object_name()
}

#[cfg(all(unix, not(any(target_os = "linux", target_os = "android"))))]
fn unnamed_object_name() -> String {
    use data_encoding::BASE32_NOPAD;
    use rand::RngCore;

    let mut raw = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut raw);
    format!("/{}", BASE32_NOPAD.encode(&raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_is_mapped_and_writable() {
        let len = page_size() * 4;
        let region = ShmRegion::create(len, None).unwrap();
        assert_eq!(region.len(), len);

        unsafe {
            let p = region.base().as_ptr();
            p.write(0xa5);
            p.add(len - 1).write(0x5a);
            assert_eq!(p.read(), 0xa5);
            assert_eq!(p.add(len - 1).read(), 0x5a);
        }
    }

    #[test]
    fn object_size_matches_request() {
        let len = page_size() * 2;
        let region = ShmRegion::create(len, None).unwrap();
        let stat = rustix::fs::fstat(region.fd()).unwrap();
        assert!(stat.st_size as u64 >= len as u64);
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    #[test]
    fn region_cannot_be_shrunk() {
        let len = page_size() * 2;
        let region = ShmRegion::create(len, None).unwrap();
        assert!(rustix::fs::ftruncate(region.fd(), 0).is_err());
    }
}
