//! File-descriptor budget inference.

use std::fs;

use rustix::process::{getrlimit, Resource};

use crate::ctx::Context;

/// Works out how many file descriptors the traversal may keep open: the
/// soft `RLIMIT_NOFILE` (4096 when unlimited or unavailable), minus the
/// descriptors already in use by this process, minus what the expression
/// declared it needs, floored at 2.
pub fn infer_fd_limit(ctx: &Context) -> usize {
    let mut budget: i64 = 4096;
    let limit = getrlimit(Resource::Nofile);
    if let Some(current) = limit.current {
        budget = current.min(i64::MAX as u64) as i64;
    }

    // Assume the three std streams plus whatever the command line opened,
    // then prefer an exact count from the fd table when one is readable.
    let mut nopen: i64 = 3 + i64::from(ctx.nopen_files);
    if let Ok(reader) = fs::read_dir("/proc/self/fd").or_else(|_| fs::read_dir("/dev/fd")) {
        // The directory handle itself appears in the listing.
        nopen = -1;
        for entry in reader {
            if entry.is_ok() {
                nopen += 1;
            }
        }
    }

    budget -= nopen;
    budget -= i64::from(ctx.expr.persistent_fds());
    budget -= i64::from(ctx.expr.ephemeral_fds());
    budget.max(2) as usize
}
