//! Running commands for `-exec`, `-execdir`, `-ok`, and `-okdir`.
//!
//! Plain `-exec … ;` spawns one command per file. The `… {} +` form batches
//! paths until the argument-size budget fills up, then spawns one command
//! for the whole batch; whatever is left over is flushed by [`ExecBuf::finish`]
//! after the traversal, which is why finishing every buffer is mandatory.

use std::ffi::OsString;
use std::io::{self, BufRead, Write};
use std::mem;
use std::path::{Path, PathBuf};
use std::process::Command;

use bfind_walk::WalkEvent;
use bitflags::bitflags;

bitflags! {
    /// Behaviour of an exec action.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct ExecFlags: u8 {
        /// Ask on stderr before running (`-ok`, `-okdir`).
        const CONFIRM = 1 << 0;
        /// Run in the file's parent directory (`-execdir`, `-okdir`).
        const CHDIR = 1 << 1;
        /// Batch many files into one invocation (`-exec … {} +`).
        const MULTI = 1 << 2;
    }
}

/// Per-node command state.
///
/// For `;` invocations `template` is the full argument vector with `{}`
/// placeholders. For `+` invocations it is the fixed prefix; batched paths
/// are appended to it.
pub struct ExecBuf {
    flags: ExecFlags,
    template: Vec<OsString>,
    batch: Vec<OsString>,
    batch_size: usize,
    arg_budget: usize,
    wd: Option<PathBuf>,
    child_failed: bool,
    spawn_error: Option<io::Error>,
}

impl ExecBuf {
    /// Builds the command state for one exec node.
    #[must_use]
    pub fn new(template: Vec<OsString>, flags: ExecFlags) -> Self {
        let fixed: usize = template.iter().map(|arg| arg_size(arg)).sum();
        Self {
            flags,
            template,
            batch: Vec::new(),
            batch_size: 0,
            arg_budget: arg_max().saturating_sub(fixed + 2048),
            wd: None,
            child_failed: false,
            spawn_error: None,
        }
    }

    /// Handles one file: spawns immediately in `;` mode, batches in `+`
    /// mode. Returns whether the command succeeded; batched errors are
    /// deferred to [`finish`](Self::finish).
    pub fn exec(&mut self, event: &WalkEvent<'_>) -> io::Result<bool> {
        if self.flags.contains(ExecFlags::MULTI) {
            self.push(event);
            Ok(true)
        } else {
            self.exec_single(event)
        }
    }

    /// Flushes any remaining batch. `Ok(true)` means every command ran and
    /// succeeded; `Ok(false)` means some command exited with a failure;
    /// `Err` carries the first spawn failure.
    pub fn finish(&mut self) -> io::Result<bool> {
        self.flush();
        if let Some(error) = self.spawn_error.take() {
            return Err(error);
        }
        Ok(!self.child_failed)
    }

    fn exec_single(&mut self, event: &WalkEvent<'_>) -> io::Result<bool> {
        let (arg, wd) = self.target_arg(event);
        let argv: Vec<OsString> = self
            .template
            .iter()
            .map(|tmpl| if tmpl == "{}" { arg.clone() } else { tmpl.clone() })
            .collect();
        if self.flags.contains(ExecFlags::CONFIRM) && !confirm(&argv)? {
            return Ok(false);
        }
        spawn(&argv, wd.as_deref())
    }

    fn push(&mut self, event: &WalkEvent<'_>) {
        let (arg, wd) = self.target_arg(event);
        if self.flags.contains(ExecFlags::CHDIR) && self.wd != wd {
            self.flush();
            self.wd = wd;
        }
        self.batch_size += arg_size(&arg);
        self.batch.push(arg);
        if self.batch_size >= self.arg_budget {
            self.flush();
        }
    }

    fn flush(&mut self) {
        if self.batch.is_empty() {
            return;
        }
        let mut argv = self.template.clone();
        argv.append(&mut self.batch);
        self.batch_size = 0;

        match spawn(&argv, self.wd.as_deref()) {
            Ok(true) => {}
            Ok(false) => self.child_failed = true,
            Err(error) => {
                self.child_failed = true;
                if self.spawn_error.is_none() {
                    self.spawn_error = Some(error);
                }
            }
        }
    }

    fn target_arg(&self, event: &WalkEvent<'_>) -> (OsString, Option<PathBuf>) {
        if self.flags.contains(ExecFlags::CHDIR) {
            let parent = event
                .path()
                .parent()
                .filter(|parent| !parent.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let mut arg = OsString::from("./");
            arg.push(event.name());
            (arg, Some(parent.to_path_buf()))
        } else {
            (event.path().as_os_str().to_os_string(), None)
        }
    }
}

fn spawn(argv: &[OsString], wd: Option<&Path>) -> io::Result<bool> {
    let Some((program, args)) = argv.split_first() else {
        return Ok(false);
    };
    let mut command = Command::new(program);
    command.args(args);
    if let Some(wd) = wd {
        command.current_dir(wd);
    }
    let status = command.status()?;
    Ok(status.success())
}

fn confirm(argv: &[OsString]) -> io::Result<bool> {
    let rendered: Vec<String> = argv
        .iter()
        .map(|arg| arg.to_string_lossy().into_owned())
        .collect();
    let mut stderr = io::stderr().lock();
    write!(stderr, "{} ? ", rendered.join(" "))?;
    stderr.flush()?;

    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    Ok(answer.starts_with('y') || answer.starts_with('Y'))
}

/// Rough per-argument cost on the exec arg block: the bytes, a NUL, and a
/// pointer.
fn arg_size(arg: &OsString) -> usize {
    arg.len() + 1 + mem::size_of::<usize>()
}

fn arg_max() -> usize {
    // SAFETY: sysconf takes a plain integer selector and only returns a value.
    let limit = unsafe { libc::sysconf(libc::_SC_ARG_MAX) };
    if limit > 0 {
        limit as usize
    } else {
        128 * 1024
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bfind_walk::{walk, WalkAction, WalkOptions};
    use std::path::PathBuf;

    fn with_single_event<F: FnMut(&WalkEvent<'_>)>(path: &Path, mut visit: F) {
        let paths = vec![PathBuf::from(path)];
        walk(&paths, &WalkOptions::default(), |event| {
            visit(event);
            WalkAction::Prune
        })
        .expect("walk");
    }

    #[test]
    fn single_exec_reports_command_success() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut buf = ExecBuf::new(
            vec!["true".into(), "{}".into()],
            ExecFlags::empty(),
        );
        with_single_event(temp.path(), |event| {
            assert_eq!(buf.exec(event).expect("spawn"), true);
        });
        assert!(buf.finish().expect("finish"));
    }

    #[test]
    fn single_exec_reports_command_failure() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut buf = ExecBuf::new(vec!["false".into()], ExecFlags::empty());
        with_single_event(temp.path(), |event| {
            assert_eq!(buf.exec(event).expect("spawn"), false);
        });
    }

    #[test]
    fn missing_program_is_a_spawn_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut buf = ExecBuf::new(
            vec!["bfind-no-such-program-xyz".into(), "{}".into()],
            ExecFlags::empty(),
        );
        with_single_event(temp.path(), |event| {
            assert!(buf.exec(event).is_err());
        });
    }

    #[test]
    fn batched_exec_defers_work_to_finish() {
        let temp = tempfile::tempdir().expect("tempdir");
        let marker = temp.path().join("marker");
        let script = format!("touch {}", marker.display());
        let mut buf = ExecBuf::new(
            vec!["sh".into(), "-c".into(), script.into(), "sh".into()],
            ExecFlags::MULTI,
        );
        with_single_event(temp.path(), |event| {
            assert_eq!(buf.exec(event).expect("batched"), true);
        });
        assert!(!marker.exists());
        assert!(buf.finish().expect("finish"));
        assert!(marker.exists());
    }

    #[test]
    fn batched_spawn_failure_surfaces_at_finish() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut buf = ExecBuf::new(
            vec!["bfind-no-such-program-xyz".into()],
            ExecFlags::MULTI,
        );
        with_single_event(temp.path(), |event| {
            assert_eq!(buf.exec(event).expect("deferred"), true);
        });
        assert!(buf.finish().is_err());
    }

    #[test]
    fn chdir_mode_hands_the_command_a_local_name() {
        let temp = tempfile::tempdir().expect("tempdir");
        let target = temp.path().join("probe");
        std::fs::write(&target, b"").expect("write");

        let mut buf = ExecBuf::new(
            vec!["test".into(), "-f".into(), "{}".into()],
            ExecFlags::CHDIR,
        );
        let paths = vec![target];
        walk(&paths, &WalkOptions::default(), |event| {
            assert_eq!(buf.exec(event).expect("spawn"), true);
            WalkAction::Stop
        })
        .expect("walk");
    }

    #[test]
    fn finish_without_work_is_clean() {
        let mut buf = ExecBuf::new(vec!["true".into()], ExecFlags::MULTI);
        assert!(buf.finish().expect("finish"));
    }
}
