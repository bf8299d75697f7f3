//! Caching user and group tables.
//!
//! `-nouser`, `-nogroup`, `-ls`, and `-printf %u/%g` resolve the same
//! handful of ids over and over during a traversal, so both tables memoise
//! the answers, including negative ones. Lookups go through the re-entrant
//! `getpwuid_r`/`getgrgid_r` family with the usual ERANGE buffer-resize
//! loop.

#![allow(unsafe_code)]

use std::cell::RefCell;
use std::collections::HashMap;
use std::ffi::{CStr, CString};
use std::io;
use std::mem::MaybeUninit;
use std::ptr;

/// Cached view of the user database.
#[derive(Debug, Default)]
pub struct UserCache {
    names: RefCell<HashMap<u32, Option<String>>>,
}

impl UserCache {
    /// Creates an empty cache; entries are filled on first use.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the name of the user with the given id, or `None` when the
    /// user database has no such entry.
    pub fn name(&self, uid: u32) -> Option<String> {
        self.names
            .borrow_mut()
            .entry(uid)
            .or_insert_with(|| lookup_user_name(uid).ok().flatten())
            .clone()
    }

    /// Returns the id of the named user, consulting the database directly.
    pub fn uid_for(&self, name: &str) -> Option<u32> {
        lookup_user_by_name(name).ok().flatten()
    }
}

/// Cached view of the group database.
#[derive(Debug, Default)]
pub struct GroupCache {
    names: RefCell<HashMap<u32, Option<String>>>,
}

impl GroupCache {
    /// Creates an empty cache; entries are filled on first use.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the name of the group with the given id, or `None` when the
    /// group database has no such entry.
    pub fn name(&self, gid: u32) -> Option<String> {
        self.names
            .borrow_mut()
            .entry(gid)
            .or_insert_with(|| lookup_group_name(gid).ok().flatten())
            .clone()
    }

    /// Returns the id of the named group, consulting the database directly.
    pub fn gid_for(&self, name: &str) -> Option<u32> {
        lookup_group_by_name(name).ok().flatten()
    }
}

fn lookup_user_name(uid: u32) -> Result<Option<String>, io::Error> {
    let mut buffer = vec![0_u8; 1024];
    loop {
        let mut pwd = MaybeUninit::<libc::passwd>::zeroed();
        let mut result: *mut libc::passwd = ptr::null_mut();
        // SAFETY: all arguments are valid pointers with sufficient
        // lifetimes: `pwd` will be written by getpwuid_r, `buffer` is
        // scratch space owned by this function, `result` receives the
        // output pointer.
        let errno = unsafe {
            libc::getpwuid_r(
                uid as libc::uid_t,
                pwd.as_mut_ptr(),
                buffer.as_mut_ptr() as *mut libc::c_char,
                buffer.len(),
                &mut result,
            )
        };

        if errno == 0 {
            if result.is_null() {
                return Ok(None);
            }
            // SAFETY: `result` is non-null, so getpwuid_r initialized `pwd`.
            let pwd = unsafe { pwd.assume_init() };
            // SAFETY: `pw_name` is a valid C string backed by `buffer`.
            let name = unsafe { CStr::from_ptr(pwd.pw_name) };
            return Ok(Some(name.to_string_lossy().into_owned()));
        }
        if errno == libc::ERANGE {
            buffer.resize(buffer.len().saturating_mul(2), 0);
            continue;
        }
        return Err(io::Error::from_raw_os_error(errno));
    }
}

fn lookup_user_by_name(name: &str) -> Result<Option<u32>, io::Error> {
    let Ok(c_name) = CString::new(name) else {
        return Ok(None);
    };

    let mut buffer = vec![0_u8; 1024];
    loop {
        let mut pwd = MaybeUninit::<libc::passwd>::zeroed();
        let mut result: *mut libc::passwd = ptr::null_mut();
        // SAFETY: `c_name` is a valid C string and the remaining arguments
        // are valid pointers owned by this function.
        let errno = unsafe {
            libc::getpwnam_r(
                c_name.as_ptr(),
                pwd.as_mut_ptr(),
                buffer.as_mut_ptr() as *mut libc::c_char,
                buffer.len(),
                &mut result,
            )
        };

        if errno == 0 {
            if result.is_null() {
                return Ok(None);
            }
            // SAFETY: `result` is non-null, so getpwnam_r initialized `pwd`.
            let pwd = unsafe { pwd.assume_init() };
            return Ok(Some(pwd.pw_uid as u32));
        }
        if errno == libc::ERANGE {
            buffer.resize(buffer.len().saturating_mul(2), 0);
            continue;
        }
        return Err(io::Error::from_raw_os_error(errno));
    }
}

fn lookup_group_name(gid: u32) -> Result<Option<String>, io::Error> {
    let mut buffer = vec![0_u8; 1024];
    loop {
        let mut grp = MaybeUninit::<libc::group>::zeroed();
        let mut result: *mut libc::group = ptr::null_mut();
        // SAFETY: all arguments are valid pointers with sufficient
        // lifetimes, as above.
        let errno = unsafe {
            libc::getgrgid_r(
                gid as libc::gid_t,
                grp.as_mut_ptr(),
                buffer.as_mut_ptr() as *mut libc::c_char,
                buffer.len(),
                &mut result,
            )
        };

        if errno == 0 {
            if result.is_null() {
                return Ok(None);
            }
            // SAFETY: `result` is non-null, so getgrgid_r initialized `grp`.
            let grp = unsafe { grp.assume_init() };
            // SAFETY: `gr_name` is a valid C string backed by `buffer`.
            let name = unsafe { CStr::from_ptr(grp.gr_name) };
            return Ok(Some(name.to_string_lossy().into_owned()));
        }
        if errno == libc::ERANGE {
            buffer.resize(buffer.len().saturating_mul(2), 0);
            continue;
        }
        return Err(io::Error::from_raw_os_error(errno));
    }
}

fn lookup_group_by_name(name: &str) -> Result<Option<u32>, io::Error> {
    let Ok(c_name) = CString::new(name) else {
        return Ok(None);
    };

    let mut buffer = vec![0_u8; 1024];
    loop {
        let mut grp = MaybeUninit::<libc::group>::zeroed();
        let mut result: *mut libc::group = ptr::null_mut();
        // SAFETY: `c_name` is a valid C string and the remaining arguments
        // are valid pointers owned by this function.
        let errno = unsafe {
            libc::getgrnam_r(
                c_name.as_ptr(),
                grp.as_mut_ptr(),
                buffer.as_mut_ptr() as *mut libc::c_char,
                buffer.len(),
                &mut result,
            )
        };

        if errno == 0 {
            if result.is_null() {
                return Ok(None);
            }
            // SAFETY: `result` is non-null, so getgrnam_r initialized `grp`.
            let grp = unsafe { grp.assume_init() };
            return Ok(Some(grp.gr_gid as u32));
        }
        if errno == libc::ERANGE {
            buffer.resize(buffer.len().saturating_mul(2), 0);
            continue;
        }
        return Err(io::Error::from_raw_os_error(errno));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_user_resolves_in_both_directions() {
        let cache = UserCache::new();
        if let Some(name) = cache.name(0) {
            assert_eq!(cache.uid_for(&name), Some(0));
        }
    }

    #[test]
    fn nonexistent_uid_is_cached_as_absent() {
        let cache = UserCache::new();
        assert_eq!(cache.name(999_999_999), None);
        // Second call answers from the cache.
        assert_eq!(cache.name(999_999_999), None);
    }

    #[test]
    fn nonexistent_user_name_has_no_uid() {
        let cache = UserCache::new();
        assert_eq!(cache.uid_for("no_such_user_zzz_12345"), None);
    }

    #[test]
    fn root_group_resolves_in_both_directions() {
        let cache = GroupCache::new();
        if let Some(name) = cache.name(0) {
            assert_eq!(cache.gid_for(&name), Some(0));
        }
    }

    #[test]
    fn nonexistent_gid_is_cached_as_absent() {
        let cache = GroupCache::new();
        assert_eq!(cache.name(999_999_999), None);
        assert_eq!(cache.name(999_999_999), None);
    }

    #[test]
    fn name_with_interior_nul_is_rejected() {
        let users = UserCache::new();
        assert_eq!(users.uid_for("bad\0name"), None);
        let groups = GroupCache::new();
        assert_eq!(groups.gid_for("bad\0name"), None);
    }
}
