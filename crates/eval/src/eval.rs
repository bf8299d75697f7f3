//! The expression walker and the per-visit callback.

use std::fmt;
use std::fs::Metadata;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::MetadataExt;
use std::time::Instant;

use bfind_walk::{walk, FileKind, Strategy, Visit, WalkAction, WalkEvent, WalkFlags, WalkOptions};
use rustc_hash::FxHashSet;

use crate::actions;
use crate::ctx::{Context, DebugFlags};
use crate::debug;
use crate::expr::{Expr, ExprKind};
use crate::preds;
use crate::rlimit::infer_fd_limit;

/// Ephemeral state for evaluating the expression against one file.
pub(crate) struct EvalState<'a, 'w> {
    /// The current visit.
    pub(crate) event: &'a WalkEvent<'w>,
    /// The parsed command line.
    pub(crate) ctx: &'a Context,
    /// What the callback will return to the traversal.
    pub(crate) action: WalkAction,
    /// The eventual process exit status.
    pub(crate) ret: &'a mut i32,
    /// Whether to stop evaluating immediately.
    pub(crate) quit: bool,
}

impl<'a, 'w> EvalState<'a, 'w> {
    /// Fetches metadata under the traversal's follow policy, reporting a
    /// failure through the standard error path.
    pub(crate) fn stat(&mut self) -> Option<&'a Metadata> {
        let event: &'a WalkEvent<'w> = self.event;
        match event.stat(event.stat_flags()) {
            Ok(metadata) => Some(metadata),
            Err(error) => {
                self.report(&error);
                None
            }
        }
    }

    /// Reports an evaluation error and raises the exit status, unless the
    /// race-ignoring policy says to drop it.
    pub(crate) fn report(&mut self, error: &io::Error) {
        if !self.should_ignore(error) {
            self.raise(format_args!("{error}"));
        }
    }

    /// Unconditionally reports a diagnostic and raises the exit status.
    pub(crate) fn raise(&mut self, message: fmt::Arguments<'_>) {
        let _ = self.ctx.cerr.write_fmt(format_args!(
            "bfind: {}: {}\n",
            self.event.path().display(),
            message
        ));
        *self.ret = 1;
    }

    /// Whether an error qualifies for the race-ignoring policy: the file
    /// vanished, we were asked to tolerate races, and the error is not
    /// about a starting path itself.
    pub(crate) fn should_ignore(&self, error: &io::Error) -> bool {
        self.ctx.ignore_races
            && self.event.depth() > 0
            && matches!(
                error.raw_os_error(),
                Some(libc::ENOENT) | Some(libc::ENOTDIR)
            )
    }
}

/// Evaluates one node, with per-node accounting.
pub(crate) fn eval_expr(expr: &Expr, state: &mut EvalState<'_, '_>) -> bool {
    let start = state
        .ctx
        .debug
        .contains(DebugFlags::RATES)
        .then(Instant::now);

    debug_assert!(!state.quit);

    let result = dispatch(expr, state);

    if let Some(start) = start {
        expr.add_elapsed(start.elapsed());
    }
    expr.record(result);

    if expr.never_returns() {
        debug_assert!(state.quit);
    } else if !state.quit {
        debug_assert!(!expr.always_true() || result);
        debug_assert!(!expr.always_false() || !result);
    }

    result
}

fn dispatch(expr: &Expr, state: &mut EvalState<'_, '_>) -> bool {
    match expr.kind() {
        ExprKind::True => true,
        ExprKind::False => false,
        ExprKind::Access { mode } => preds::eval_access(state, *mode),
        ExprKind::Acl => preds::eval_acl(state),
        ExprKind::Capable => preds::eval_capable(state),
        ExprKind::Xattr => preds::eval_xattr(state),
        ExprKind::Newer { field, reference } => preds::eval_newer(state, *field, *reference),
        ExprKind::Time {
            field,
            unit,
            reference,
            cmp,
        } => preds::eval_time(state, *field, *unit, *reference, *cmp),
        ExprKind::Used { cmp } => preds::eval_used(state, *cmp),
        ExprKind::Uid { cmp } => preds::eval_uid(state, *cmp),
        ExprKind::Gid { cmp } => preds::eval_gid(state, *cmp),
        ExprKind::NoUser => preds::eval_nouser(state),
        ExprKind::NoGroup => preds::eval_nogroup(state),
        ExprKind::Depth { cmp } => preds::eval_depth(state, *cmp),
        ExprKind::Inum { cmp } => preds::eval_inum(state, *cmp),
        ExprKind::Links { cmp } => preds::eval_links(state, *cmp),
        ExprKind::Empty => preds::eval_empty(state),
        ExprKind::Fstype { name } => preds::eval_fstype(state, name),
        ExprKind::Hidden => preds::eval_hidden(state),
        ExprKind::NoHidden => actions::eval_nohidden(state),
        ExprKind::Name { matcher, .. } => preds::eval_name(state, matcher),
        ExprKind::PathMatch { matcher, .. } => preds::eval_path(state, matcher),
        ExprKind::Lname { matcher, .. } => preds::eval_lname(state, matcher),
        ExprKind::Perm {
            how,
            file_mode,
            dir_mode,
        } => preds::eval_perm(state, *how, *file_mode, *dir_mode),
        ExprKind::Regex { regex, .. } => preds::eval_regex(state, regex),
        ExprKind::Samefile { dev, ino } => preds::eval_samefile(state, *dev, *ino),
        ExprKind::Size { unit, cmp } => preds::eval_size(state, *unit, *cmp),
        ExprKind::Sparse => preds::eval_sparse(state),
        ExprKind::Type { mask } => preds::eval_type(state, *mask),
        ExprKind::Xtype { mask } => preds::eval_xtype(state, *mask),
        ExprKind::Delete => actions::eval_delete(state),
        ExprKind::Exec { exec } => actions::eval_exec(state, exec, expr.argv()),
        ExprKind::Exit { status } => actions::eval_exit(state, *status),
        ExprKind::Prune => actions::eval_prune(state),
        ExprKind::Quit => actions::eval_quit(state),
        ExprKind::Print { file } => actions::eval_fprint(state, file),
        ExprKind::Print0 { file } => actions::eval_fprint0(state, file),
        ExprKind::Printx { file } => actions::eval_fprintx(state, file),
        ExprKind::Printf { file, program } => actions::eval_fprintf(state, file, program),
        ExprKind::Ls { file, reference } => actions::eval_fls(state, file, *reference),

        ExprKind::Not { rhs } => !eval_expr(rhs, state),
        ExprKind::And { lhs, rhs } => {
            if !eval_expr(lhs, state) {
                false
            } else if state.quit {
                false
            } else {
                eval_expr(rhs, state)
            }
        }
        ExprKind::Or { lhs, rhs } => {
            if eval_expr(lhs, state) {
                true
            } else if state.quit {
                false
            } else {
                eval_expr(rhs, state)
            }
        }
        ExprKind::Comma { lhs, rhs } => {
            eval_expr(lhs, state);
            if state.quit {
                false
            } else {
                eval_expr(rhs, state)
            }
        }
    }
}

/// Consults the seen-set for `-unique`. Duplicates prune; stat failures
/// report and skip evaluation without pruning.
fn file_unique(state: &mut EvalState<'_, '_>, seen: &mut FxHashSet<(u64, u64)>) -> bool {
    let Some(metadata) = state.stat() else {
        return false;
    };
    let id = (metadata.dev(), metadata.ino());
    if seen.insert(id) {
        true
    } else {
        state.action = WalkAction::Prune;
        false
    }
}

/// Bytes that make a path unusable with `xargs`.
const XARGS_UNSAFE_PATH: &[u8] = b" \t\n'\"\\";

/// The per-visit state machine.
fn run_visit(state: &mut EvalState<'_, '_>, seen: &mut Option<FxHashSet<(u64, u64)>>) {
    let event = state.event;
    let ctx = state.ctx;

    if let Some(error) = event.error() {
        if !state.should_ignore(error) {
            state.raise(format_args!("{error}"));
        }
        state.action = WalkAction::Prune;
        return;
    }

    if let Some(seen) = seen.as_mut() {
        if event.visit() == Visit::Pre && !file_unique(state, seen) {
            return;
        }
    }

    if ctx.xargs_safe
        && event
            .path()
            .as_os_str()
            .as_bytes()
            .iter()
            .any(|byte| XARGS_UNSAFE_PATH.contains(byte))
    {
        state.raise(format_args!("path is not safe for xargs"));
        state.action = WalkAction::Prune;
        return;
    }

    let depth = event.depth() as i64;
    let maxdepth = i64::from(ctx.maxdepth);
    if ctx.maxdepth < 0 || depth >= maxdepth {
        state.action = WalkAction::Prune;
    }

    // In -depth mode, directories are handled on the post-order visit.
    let mut expected = Visit::Pre;
    if ctx.flags.contains(WalkFlags::DEPTH)
        && (ctx.strategy == Strategy::Ids || event.kind() == FileKind::Dir)
        && depth < maxdepth
    {
        expected = Visit::Post;
    }

    if event.visit() == expected && depth >= i64::from(ctx.mindepth) && depth <= maxdepth {
        eval_expr(&ctx.expr, state);
    }
}

fn callback<'w>(
    event: &WalkEvent<'w>,
    ctx: &Context,
    seen: &mut Option<FxHashSet<(u64, u64)>>,
    ret: &mut i32,
) -> WalkAction {
    let mut state = EvalState {
        event,
        ctx,
        action: WalkAction::Continue,
        ret,
        quit: false,
    };
    run_visit(&mut state, seen);
    let action = state.action;

    if ctx.debug.contains(DebugFlags::STAT) {
        debug::dump_stats(event);
    }
    if ctx.debug.contains(DebugFlags::SEARCH) {
        debug::dump_visit(event, action);
    }
    action
}

/// Walks every finished `-exec` buffer in the tree; part of shutdown, not
/// optional.
fn flush_execs(expr: &Expr, ctx: &Context) -> bool {
    let mut ok = true;
    if let ExprKind::Exec { exec } = expr.kind() {
        match exec.borrow_mut().finish() {
            Ok(true) => {}
            Ok(false) => ok = false,
            Err(error) => {
                let argv = expr.argv();
                let first = argv.first().map(String::as_str).unwrap_or("-exec");
                let second = argv.get(1).map(String::as_str).unwrap_or("");
                let _ = ctx
                    .cerr
                    .write_fmt(format_args!("bfind: {first} {second}: {error}\n"));
                ok = false;
            }
        }
    }
    for child in expr.children().into_iter().flatten() {
        if !flush_execs(child, ctx) {
            ok = false;
        }
    }
    ok
}

/// Runs the traversal and evaluates the expression against every in-scope
/// file. Returns the process exit status.
pub fn evaluate(ctx: &Context) -> i32 {
    let mut ret = 0;
    let mut seen = ctx.unique.then(FxHashSet::default);

    let options = WalkOptions {
        flags: ctx.flags,
        strategy: ctx.strategy,
        nopenfd: infer_fd_limit(ctx),
    };
    if ctx.debug.contains(DebugFlags::SEARCH) {
        debug::dump_walk_config(ctx, &options);
    }

    let result = walk(&ctx.paths, &options, |event| {
        callback(event, ctx, &mut seen, &mut ret)
    });
    if let Err(error) = result {
        let _ = ctx.cerr.write_fmt(format_args!("bfind: {error}\n"));
        ret = 1;
    }

    if !flush_execs(&ctx.expr, ctx) {
        ret = 1;
    }

    if ctx.debug.contains(DebugFlags::RATES) {
        debug::dump_rates(ctx);
    }

    let _ = ctx.cout.flush();
    ret
}
