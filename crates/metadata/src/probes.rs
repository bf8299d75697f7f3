//! Tri-state probes for ACLs, capabilities, and extended attributes.
//!
//! Each probe answers `Ok(true)` (present), `Ok(false)` (absent), or
//! `Err(_)` (the probe itself failed), so callers can tell "no ACL" apart
//! from "could not look".

use std::io;
use std::path::Path;

#[cfg(target_os = "linux")]
mod imp {
    use super::*;
    use rustix::io::Errno;

    /// An access ACL serialised with only the three base entries: a 4-byte
    /// header plus 3 entries of 8 bytes. Anything larger carries extended
    /// entries.
    const ACL_BASE_SIZE: usize = 4 + 3 * 8;

    fn xattr_size(path: &Path, name: &str, follow: bool) -> io::Result<Option<usize>> {
        let result = if follow {
            rustix::fs::getxattr(path, name, &mut [])
        } else {
            rustix::fs::lgetxattr(path, name, &mut [])
        };
        match result {
            Ok(len) => Ok(Some(len)),
            Err(err) if err == Errno::NODATA || err == Errno::NOTSUP => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Whether the file carries a non-trivial POSIX ACL.
    pub fn check_acl(path: &Path, follow: bool) -> io::Result<bool> {
        if let Some(size) = xattr_size(path, "system.posix_acl_access", follow)? {
            if size > ACL_BASE_SIZE {
                return Ok(true);
            }
        }
        match xattr_size(path, "system.posix_acl_default", follow)? {
            Some(size) => Ok(size > 4),
            None => Ok(false),
        }
    }

    /// Whether the file carries capabilities.
    pub fn check_capabilities(path: &Path, follow: bool) -> io::Result<bool> {
        Ok(xattr_size(path, "security.capability", follow)?.is_some())
    }

    /// Whether the file carries any extended attributes.
    pub fn check_xattrs(path: &Path, follow: bool) -> io::Result<bool> {
        let result = if follow {
            rustix::fs::listxattr(path, &mut [])
        } else {
            rustix::fs::llistxattr(path, &mut [])
        };
        match result {
            Ok(len) => Ok(len > 0),
            Err(err) if err == Errno::NOTSUP => Ok(false),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod imp {
    use super::*;

    pub fn check_acl(_path: &Path, _follow: bool) -> io::Result<bool> {
        Ok(false)
    }

    pub fn check_capabilities(_path: &Path, _follow: bool) -> io::Result<bool> {
        Ok(false)
    }

    pub fn check_xattrs(_path: &Path, _follow: bool) -> io::Result<bool> {
        Ok(false)
    }
}

pub use imp::{check_acl, check_capabilities, check_xattrs};

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn plain_file_has_no_acl_or_capabilities() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("plain");
        fs::write(&path, b"data").expect("write");

        assert_eq!(check_acl(&path, false).unwrap_or(false), false);
        assert_eq!(check_capabilities(&path, false).unwrap_or(false), false);
    }

    #[test]
    fn missing_file_reports_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("missing");

        assert!(check_xattrs(&path, false).is_err());
        assert!(check_acl(&path, false).is_err());
        assert!(check_capabilities(&path, false).is_err());
    }

    #[test]
    fn xattr_probe_answers_for_a_plain_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("plain");
        fs::write(&path, b"data").expect("write");

        // tmpfs supports xattrs; a fresh file has none (some systems add
        // security labels, in which case `true` is also a correct answer).
        assert!(check_xattrs(&path, false).is_ok());
    }
}
