//! The predicate library: stateless per-file tests.
//!
//! Every predicate reads the per-visit state and returns a truth value.
//! When a predicate needs metadata it goes through the event's cached stat
//! accessor; a stat failure reports the error, raises the exit status
//! (unless the race-ignoring policy applies), and makes the predicate
//! false.

use std::fs::{self, Metadata};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bfind_metadata::probes;
use bfind_walk::{FileKind, StatFlags};
use globset::GlobMatcher;
use regex::bytes::Regex;
use rustix::fs::{Access, AtFlags, CWD};

use crate::eval::EvalState;
use crate::expr::{AccessMode, ModeCmp, NumCmp, TimeField, TimeUnit, TypeMask};

/// Splits a [`SystemTime`] into signed epoch seconds plus nanoseconds.
pub(crate) fn epoch_parts(time: SystemTime) -> (i64, u32) {
    match time.duration_since(UNIX_EPOCH) {
        Ok(after) => (after.as_secs() as i64, after.subsec_nanos()),
        Err(before) => {
            let before = before.duration();
            let secs = -(before.as_secs() as i64);
            let nanos = before.subsec_nanos();
            if nanos > 0 {
                (secs - 1, 1_000_000_000 - nanos)
            } else {
                (secs, 0)
            }
        }
    }
}

/// Whole seconds of `lhs - rhs`, truncating the fractional second the way
/// a `timespec` subtraction does.
pub(crate) fn timespec_diff(lhs: SystemTime, rhs: SystemTime) -> i64 {
    let (lhs_secs, lhs_nanos) = epoch_parts(lhs);
    let (rhs_secs, rhs_nanos) = epoch_parts(rhs);
    let mut secs = lhs_secs - rhs_secs;
    if lhs_nanos < rhs_nanos {
        secs -= 1;
    }
    secs
}

fn system_time(secs: i64, nanos: i64) -> SystemTime {
    let nanos = Duration::from_nanos(nanos.max(0) as u64);
    if secs >= 0 {
        UNIX_EPOCH + Duration::from_secs(secs as u64) + nanos
    } else {
        UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs()) + nanos
    }
}

/// Reads the selected timestamp out of a stat buffer.
pub(crate) fn stat_time(metadata: &Metadata, field: TimeField) -> io::Result<SystemTime> {
    match field {
        TimeField::Accessed => Ok(system_time(metadata.atime(), metadata.atime_nsec())),
        TimeField::Changed => Ok(system_time(metadata.ctime(), metadata.ctime_nsec())),
        TimeField::Modified => Ok(system_time(metadata.mtime(), metadata.mtime_nsec())),
        TimeField::Birth => metadata.created(),
    }
}

fn stat_time_or_report(
    state: &mut EvalState<'_, '_>,
    metadata: &Metadata,
    field: TimeField,
) -> Option<SystemTime> {
    match stat_time(metadata, field) {
        Ok(time) => Some(time),
        Err(_) => {
            state.raise(format_args!("cannot get file {} time", field.name()));
            None
        }
    }
}

pub(crate) fn eval_access(state: &mut EvalState<'_, '_>, mode: AccessMode) -> bool {
    let access = match mode {
        AccessMode::Readable => Access::READ_OK,
        AccessMode::Writable => Access::WRITE_OK,
        AccessMode::Executable => Access::EXEC_OK,
    };
    rustix::fs::accessat(CWD, state.event.path(), access, AtFlags::empty()).is_ok()
}

fn eval_probe(
    state: &mut EvalState<'_, '_>,
    probe: fn(&Path, bool) -> io::Result<bool>,
) -> bool {
    let follow = state.event.stat_flags().follows();
    match probe(state.event.path(), follow) {
        Ok(answer) => answer,
        Err(error) => {
            state.report(&error);
            false
        }
    }
}

pub(crate) fn eval_acl(state: &mut EvalState<'_, '_>) -> bool {
    eval_probe(state, probes::check_acl)
}

pub(crate) fn eval_capable(state: &mut EvalState<'_, '_>) -> bool {
    eval_probe(state, probes::check_capabilities)
}

pub(crate) fn eval_xattr(state: &mut EvalState<'_, '_>) -> bool {
    eval_probe(state, probes::check_xattrs)
}

pub(crate) fn eval_newer(
    state: &mut EvalState<'_, '_>,
    field: TimeField,
    reference: SystemTime,
) -> bool {
    let Some(metadata) = state.stat() else {
        return false;
    };
    let Some(time) = stat_time_or_report(state, metadata, field) else {
        return false;
    };
    // Strictly newer, at nanosecond precision.
    time > reference
}

pub(crate) fn eval_time(
    state: &mut EvalState<'_, '_>,
    field: TimeField,
    unit: TimeUnit,
    reference: SystemTime,
    cmp: NumCmp,
) -> bool {
    let Some(metadata) = state.stat() else {
        return false;
    };
    let Some(time) = stat_time_or_report(state, metadata, field) else {
        return false;
    };
    let diff = timespec_diff(reference, time) / unit.seconds();
    cmp.matches(diff)
}

pub(crate) fn eval_used(state: &mut EvalState<'_, '_>, cmp: NumCmp) -> bool {
    let Some(metadata) = state.stat() else {
        return false;
    };
    let Some(atime) = stat_time_or_report(state, metadata, TimeField::Accessed) else {
        return false;
    };
    let Some(ctime) = stat_time_or_report(state, metadata, TimeField::Changed) else {
        return false;
    };
    let days = timespec_diff(atime, ctime) / TimeUnit::Days.seconds();
    cmp.matches(days)
}

pub(crate) fn eval_uid(state: &mut EvalState<'_, '_>, cmp: NumCmp) -> bool {
    match state.stat() {
        Some(metadata) => cmp.matches(i64::from(metadata.uid())),
        None => false,
    }
}

pub(crate) fn eval_gid(state: &mut EvalState<'_, '_>, cmp: NumCmp) -> bool {
    match state.stat() {
        Some(metadata) => cmp.matches(i64::from(metadata.gid())),
        None => false,
    }
}

pub(crate) fn eval_nouser(state: &mut EvalState<'_, '_>) -> bool {
    let Some(metadata) = state.stat() else {
        return false;
    };
    let uid = metadata.uid();
    state
        .ctx
        .users
        .as_ref()
        .and_then(|users| users.name(uid))
        .is_none()
}

pub(crate) fn eval_nogroup(state: &mut EvalState<'_, '_>) -> bool {
    let Some(metadata) = state.stat() else {
        return false;
    };
    let gid = metadata.gid();
    state
        .ctx
        .groups
        .as_ref()
        .and_then(|groups| groups.name(gid))
        .is_none()
}

pub(crate) fn eval_depth(state: &mut EvalState<'_, '_>, cmp: NumCmp) -> bool {
    cmp.matches(state.event.depth() as i64)
}

pub(crate) fn eval_inum(state: &mut EvalState<'_, '_>, cmp: NumCmp) -> bool {
    match state.stat() {
        Some(metadata) => cmp.matches(metadata.ino() as i64),
        None => false,
    }
}

pub(crate) fn eval_links(state: &mut EvalState<'_, '_>, cmp: NumCmp) -> bool {
    match state.stat() {
        Some(metadata) => cmp.matches(metadata.nlink() as i64),
        None => false,
    }
}

pub(crate) fn eval_empty(state: &mut EvalState<'_, '_>) -> bool {
    match state.event.kind() {
        FileKind::Dir => match fs::read_dir(state.event.path()) {
            Ok(mut entries) => match entries.next() {
                None => true,
                Some(Ok(_)) => false,
                Some(Err(error)) => {
                    state.report(&error);
                    false
                }
            },
            Err(error) => {
                state.report(&error);
                false
            }
        },
        FileKind::Reg => match state.stat() {
            Some(metadata) => metadata.len() == 0,
            None => false,
        },
        _ => false,
    }
}

pub(crate) fn eval_fstype(state: &mut EvalState<'_, '_>, name: &str) -> bool {
    let Some(metadata) = state.stat() else {
        return false;
    };
    let dev = metadata.dev();
    let fstype = state
        .ctx
        .mtab
        .as_ref()
        .and_then(|mtab| mtab.fstype(dev))
        .unwrap_or("unknown");
    fstype == name
}

pub(crate) fn eval_hidden(state: &mut EvalState<'_, '_>) -> bool {
    let event = state.event;
    let offset = event.name_offset();
    offset > 0 && event.path().as_os_str().as_bytes().get(offset) == Some(&b'.')
}

pub(crate) fn eval_name(state: &mut EvalState<'_, '_>, matcher: &GlobMatcher) -> bool {
    let event = state.event;
    let mut name = event.name().as_bytes();
    if event.depth() == 0 {
        // Trailing slashes on a starting path are not part of its name.
        if let Some(slash) = name.iter().position(|&b| b == b'/') {
            if slash > 0 {
                name = &name[..slash];
            }
        }
    }
    matcher.is_match(Path::new(std::ffi::OsStr::from_bytes(name)))
}

pub(crate) fn eval_path(state: &mut EvalState<'_, '_>, matcher: &GlobMatcher) -> bool {
    matcher.is_match(state.event.path())
}

pub(crate) fn eval_lname(state: &mut EvalState<'_, '_>, matcher: &GlobMatcher) -> bool {
    if state.event.kind() != FileKind::Link {
        return false;
    }
    match fs::read_link(state.event.path()) {
        Ok(target) => matcher.is_match(&target),
        Err(error) => {
            state.report(&error);
            false
        }
    }
}

pub(crate) fn eval_perm(
    state: &mut EvalState<'_, '_>,
    how: ModeCmp,
    file_mode: u32,
    dir_mode: u32,
) -> bool {
    let Some(metadata) = state.stat() else {
        return false;
    };
    let mode = metadata.mode();
    let target = if state.event.kind() == FileKind::Dir {
        dir_mode
    } else {
        file_mode
    };
    match how {
        ModeCmp::Exact => (mode & 0o7777) == target,
        ModeCmp::All => (mode & target) == target,
        ModeCmp::Any => (mode & target != 0) == (target != 0),
    }
}

pub(crate) fn eval_regex(state: &mut EvalState<'_, '_>, regex: &Regex) -> bool {
    // The pattern is compiled with ^...$ anchors; a match is a full match.
    regex.is_match(state.event.path().as_os_str().as_bytes())
}

pub(crate) fn eval_samefile(state: &mut EvalState<'_, '_>, dev: u64, ino: u64) -> bool {
    match state.stat() {
        Some(metadata) => metadata.dev() == dev && metadata.ino() == ino,
        None => false,
    }
}

pub(crate) fn eval_size(
    state: &mut EvalState<'_, '_>,
    unit: crate::expr::SizeUnit,
    cmp: NumCmp,
) -> bool {
    let Some(metadata) = state.stat() else {
        return false;
    };
    let scale = unit.bytes();
    let size = (metadata.len() as i64 + scale - 1) / scale;
    cmp.matches(size)
}

/// 512-byte units, the granularity `st_blocks` is reported in.
const STAT_BLKSIZE: u64 = 512;

pub(crate) fn eval_sparse(state: &mut EvalState<'_, '_>) -> bool {
    let Some(metadata) = state.stat() else {
        return false;
    };
    let expected = (metadata.len() + STAT_BLKSIZE - 1) / STAT_BLKSIZE;
    metadata.blocks() < expected
}

pub(crate) fn eval_type(state: &mut EvalState<'_, '_>, mask: TypeMask) -> bool {
    mask.intersects(TypeMask::from_kind(state.event.kind()))
}

pub(crate) fn eval_xtype(state: &mut EvalState<'_, '_>, mask: TypeMask) -> bool {
    // Ask for the type under the opposite follow policy.
    let flags = state.event.stat_flags() ^ (StatFlags::NOFOLLOW | StatFlags::TRYFOLLOW);
    match state.event.kind_with(flags) {
        Ok(kind) => mask.intersects(TypeMask::from_kind(kind)),
        Err(error) => {
            state.report(&error);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_parts_of_the_epoch_is_zero() {
        assert_eq!(epoch_parts(UNIX_EPOCH), (0, 0));
    }

    #[test]
    fn epoch_parts_handles_pre_epoch_times() {
        let before = UNIX_EPOCH - Duration::new(1, 500_000_000);
        assert_eq!(epoch_parts(before), (-2, 500_000_000));
    }

    #[test]
    fn timespec_diff_truncates_partial_seconds() {
        let base = UNIX_EPOCH + Duration::from_secs(100);
        let later = base + Duration::new(1, 900_000_000);
        // 1.9 seconds apart reads as 1 whole second.
        assert_eq!(timespec_diff(later, base), 1);
        // Reversed, the fractional borrow makes it -2.
        assert_eq!(timespec_diff(base, later), -2);
    }

    #[test]
    fn timespec_diff_of_equal_times_is_zero() {
        let base = UNIX_EPOCH + Duration::new(42, 7);
        assert_eq!(timespec_diff(base, base), 0);
    }

    #[test]
    fn system_time_round_trips_through_epoch_parts() {
        let time = system_time(1_700_000_000, 123_456_789);
        assert_eq!(epoch_parts(time), (1_700_000_000, 123_456_789));
    }
}
