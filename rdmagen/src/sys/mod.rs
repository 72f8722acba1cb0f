#![allow(unsafe_code)]
//! Thin wrappers around the operating system interfaces used.
//!
//! Applies to files in this folder. These are:
//! * `mod.rs`, read-only file mappings.
//! * `verbs.rs`, the libibverbs transport (feature `verbs`).
use core::{ptr, slice};
use std::fs::File;
use std::io;
use std::os::unix::io::AsRawFd;

#[cfg(feature = "verbs")]
pub mod verbs;

/// An errno value.
///
/// This is used as the error representation of raw libc calls. It converts into a
/// `std::io::Error` which carries much more extensive error information.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct Errno(pub libc::c_int);

/// A private, read-only mapping of a whole file.
///
/// The mapping never moves and is unmapped on drop. Addresses inside it are stable for its
/// entire lifetime, which is what lets the hardware be pointed at them.
#[derive(Debug)]
pub struct Mapping {
    addr: *mut libc::c_void,
    len: usize,
}

#[derive(Clone, Copy)]
struct MmapResult(*mut libc::c_void);

#[derive(Clone, Copy)]
struct UnitResult(libc::c_int);

/// Trait for interpreting raw return values.
///
/// Failure signals may vary between:
/// * `-1`
/// * `MAP_FAILED`
trait LibcResult: Copy {
    fn is_fail(self) -> bool;

    fn errno(self) -> Result<(), Errno> {
        if self.is_fail() {
            Err(Errno::new())
        } else {
            Ok(())
        }
    }
}

impl Errno {
    /// The errno of the last failed call on this thread.
    pub fn new() -> Errno {
        Errno(unsafe { *libc::__errno_location() })
    }
}

impl LibcResult for MmapResult {
    fn is_fail(self) -> bool {
        self.0 == libc::MAP_FAILED
    }
}

impl LibcResult for UnitResult {
    fn is_fail(self) -> bool {
        self.0 == -1
    }
}

impl From<Errno> for io::Error {
    fn from(err: Errno) -> io::Error {
        io::Error::from_raw_os_error(err.0)
    }
}

impl Mapping {
    /// Map the first `len` bytes of `file`.
    ///
    /// `len` must be positive, the kernel rejects empty mappings.
    pub fn map(file: &File, len: usize) -> Result<Self, Errno> {
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ,
                libc::MAP_PRIVATE,
                file.as_raw_fd(),
                0)
        };

        MmapResult(addr).errno()?;
        Ok(Mapping { addr, len })
    }

    /// The mapped bytes.
    pub fn as_slice(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.addr as *const u8, self.len) }
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        let res = unsafe { libc::munmap(self.addr, self.len) };
        // Nothing to do about a failure, the address range was ours.
        let _ = UnitResult(res).errno();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn map_file() {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"abcdefgh").unwrap();
        let mapping = Mapping::map(&file, 8).unwrap();
        assert_eq!(mapping.as_slice(), b"abcdefgh");
    }

    #[test]
    fn map_empty_fails() {
        let file = tempfile::tempfile().unwrap();
        let err = Mapping::map(&file, 0).unwrap_err();
        assert_eq!(err, Errno(libc::EINVAL));
        assert_eq!(io::Error::from(err).raw_os_error(), Some(libc::EINVAL));
    }
}
