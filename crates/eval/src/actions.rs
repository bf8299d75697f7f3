//! The action library: side-effecting leaves.
//!
//! Print-family actions report I/O failures but still return true; the
//! predicate-like actions (`-delete`, `-exec`) return false on failure.

use std::cell::RefCell;
use std::fs::{self, Metadata};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::MetadataExt;
use std::time::SystemTime;

use bfind_metadata::{format_mode, probes};
use bfind_walk::{FileKind, StatFlags, WalkAction};
use chrono::{Local, TimeZone};
use rustix::fs::{AtFlags, CWD};

use crate::eval::EvalState;
use crate::exec::ExecBuf;
use crate::fmt::FormatProgram;
use crate::output::OutFile;
use crate::preds::{epoch_parts, eval_hidden};

pub(crate) fn eval_prune(state: &mut EvalState<'_, '_>) -> bool {
    state.action = WalkAction::Prune;
    true
}

pub(crate) fn eval_quit(state: &mut EvalState<'_, '_>) -> bool {
    state.action = WalkAction::Stop;
    state.quit = true;
    true
}

pub(crate) fn eval_exit(state: &mut EvalState<'_, '_>, status: i32) -> bool {
    state.action = WalkAction::Stop;
    *state.ret = status;
    state.quit = true;
    true
}

pub(crate) fn eval_nohidden(state: &mut EvalState<'_, '_>) -> bool {
    if eval_hidden(state) {
        eval_prune(state);
        false
    } else {
        true
    }
}

pub(crate) fn eval_delete(state: &mut EvalState<'_, '_>) -> bool {
    let event = state.event;

    // Never try to delete the current directory.
    if event.path().as_os_str() == "." {
        return true;
    }

    // The call needs the actual type of the path, not what it points to.
    let flags = match event.kind_with(StatFlags::NOFOLLOW) {
        Ok(FileKind::Dir) => AtFlags::REMOVEDIR,
        Ok(_) => AtFlags::empty(),
        Err(error) => {
            state.report(&error);
            return false;
        }
    };

    match rustix::fs::unlinkat(CWD, event.path(), flags) {
        Ok(()) => true,
        Err(errno) => {
            state.report(&io::Error::from(errno));
            false
        }
    }
}

pub(crate) fn eval_fprint(state: &mut EvalState<'_, '_>, file: &OutFile) -> bool {
    let result = file
        .write_path(state.event.path())
        .and_then(|()| file.write_all(b"\n"));
    if let Err(error) = result {
        state.report(&error);
    }
    true
}

pub(crate) fn eval_fprint0(state: &mut EvalState<'_, '_>, file: &OutFile) -> bool {
    let result = file
        .write_path(state.event.path())
        .and_then(|()| file.write_all(b"\0"));
    if let Err(error) = result {
        state.report(&error);
    }
    true
}

/// Bytes that must be escaped for the output to survive `xargs`.
const XARGS_UNSAFE: &[u8] = b" \t\n\\$'\"`";

pub(crate) fn eval_fprintx(state: &mut EvalState<'_, '_>, file: &OutFile) -> bool {
    let result = write_escaped(file, state.event.path().as_os_str().as_bytes());
    if let Err(error) = result {
        state.report(&error);
    }
    true
}

fn write_escaped(file: &OutFile, mut path: &[u8]) -> io::Result<()> {
    while let Some(pos) = path.iter().position(|b| XARGS_UNSAFE.contains(b)) {
        file.write_all(&path[..pos])?;
        file.write_all(&[b'\\', path[pos]])?;
        path = &path[pos + 1..];
    }
    file.write_all(path)?;
    file.write_all(b"\n")
}

pub(crate) fn eval_fprintf(
    state: &mut EvalState<'_, '_>,
    file: &OutFile,
    program: &FormatProgram,
) -> bool {
    if let Err(error) = program.print(file, state.event, state.ctx) {
        state.report(&error);
    }
    true
}

/// Which strftime shape `-ls` uses for a given mtime: recent files get the
/// clock form, everything outside the window gets the year form. The
/// window is six 30-day months back and one day forward, both exclusive.
pub(crate) fn ls_time_format(mtime_secs: i64, now_secs: i64) -> &'static str {
    let six_months_ago = now_secs - 6 * 30 * 24 * 60 * 60;
    let tomorrow = now_secs + 24 * 60 * 60;
    if mtime_secs <= six_months_ago || mtime_secs >= tomorrow {
        "%b %e  %Y"
    } else {
        "%b %e %H:%M"
    }
}

fn major(rdev: u64) -> u64 {
    ((rdev >> 8) & 0xfff) | ((rdev >> 32) & !0xfff)
}

fn minor(rdev: u64) -> u64 {
    (rdev & 0xff) | ((rdev >> 12) & !0xff)
}

pub(crate) fn eval_fls(
    state: &mut EvalState<'_, '_>,
    file: &OutFile,
    reference: SystemTime,
) -> bool {
    let Some(metadata) = state.stat() else {
        return true;
    };
    if let Err(error) = write_ls_line(state, file, metadata, reference) {
        state.report(&error);
    }
    true
}

fn write_ls_line(
    state: &EvalState<'_, '_>,
    file: &OutFile,
    metadata: &Metadata,
    reference: SystemTime,
) -> io::Result<()> {
    let event = state.event;
    let ctx = state.ctx;

    let ino = metadata.ino();
    let blocks = (metadata.blocks() * 512 + 1023) / 1024;
    let mode = format_mode(metadata.mode());
    let acl = match probes::check_acl(event.path(), event.stat_flags().follows()) {
        Ok(true) => '+',
        _ => ' ',
    };
    let nlink = metadata.nlink();
    write!(file, "{ino:9} {blocks:6} {mode}{acl} {nlink:2} ")?;

    let uid = metadata.uid();
    match ctx.users.as_ref().and_then(|users| users.name(uid)) {
        Some(name) => write!(file, " {name:<8}")?,
        None => write!(file, " {uid:<8}")?,
    }
    let gid = metadata.gid();
    match ctx.groups.as_ref().and_then(|groups| groups.name(gid)) {
        Some(name) => write!(file, " {name:<8}")?,
        None => write!(file, " {gid:<8}")?,
    }

    if matches!(event.kind(), FileKind::Block | FileKind::Char) {
        let rdev = metadata.rdev();
        write!(file, " {:3}, {:3}", major(rdev), minor(rdev))?;
    } else {
        write!(file, " {:8}", metadata.len())?;
    }

    let mtime = metadata.mtime();
    let (now, _) = epoch_parts(reference);
    let format = ls_time_format(mtime, now);
    let stamp = Local
        .timestamp_opt(mtime, 0)
        .single()
        .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "timestamp out of range"))?;
    write!(file, " {}", stamp.format(format))?;

    file.write_all(b" ")?;
    file.write_path(event.path())?;

    if event.kind() == FileKind::Link {
        if let Ok(target) = fs::read_link(event.path()) {
            file.write_all(b" -> ")?;
            file.write_path(&target)?;
        }
    }
    file.write_all(b"\n")
}

pub(crate) fn eval_exec(
    state: &mut EvalState<'_, '_>,
    exec: &RefCell<ExecBuf>,
    argv: &[String],
) -> bool {
    match exec.borrow_mut().exec(state.event) {
        Ok(succeeded) => succeeded,
        Err(error) => {
            let first = argv.first().map(String::as_str).unwrap_or("-exec");
            let second = argv.get(1).map(String::as_str).unwrap_or("");
            let _ = state
                .ctx
                .cerr
                .write_fmt(format_args!("bfind: {first} {second}: {error}\n"));
            *state.ret = 1;
            false
        }
    }
}
