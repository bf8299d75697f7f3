//! The parsed command line.

use std::path::PathBuf;

use bfind_metadata::{GroupCache, MountTable, UserCache};
use bfind_walk::{Strategy, WalkFlags};
use bitflags::bitflags;

use crate::expr::Expr;
use crate::output::OutFile;

bitflags! {
    /// Debug trace categories, enabled with `-D`.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct DebugFlags: u8 {
        /// Dump per-node evaluation rates after the traversal.
        const RATES = 1 << 0;
        /// Trace every traversal callback.
        const SEARCH = 1 << 1;
        /// Trace every stat call.
        const STAT = 1 << 2;
        /// Dump the parsed expression tree before the traversal.
        const TREE = 1 << 3;
    }
}

/// Everything the evaluator needs to know about one invocation: paths,
/// traversal configuration, shared caches, output streams, and the
/// expression tree.
pub struct Context {
    /// Starting paths.
    pub paths: Vec<PathBuf>,
    /// Minimum depth at which the expression runs.
    pub mindepth: i32,
    /// Maximum depth to descend to.
    pub maxdepth: i32,
    /// Traversal flags handed to the walker.
    pub flags: WalkFlags,
    /// Traversal strategy.
    pub strategy: Strategy,
    /// Suppress duplicate visits of hard-linked files.
    pub unique: bool,
    /// Reject paths that are unsafe to hand to `xargs`.
    pub xargs_safe: bool,
    /// Silently drop file-vanished errors below the starting paths.
    pub ignore_races: bool,
    /// Debug trace categories.
    pub debug: DebugFlags,
    /// The mount table, when `-fstype` needs it.
    pub mtab: Option<MountTable>,
    /// The user table; absent tables make every uid look unknown.
    pub users: Option<UserCache>,
    /// The group table; absent tables make every gid look unknown.
    pub groups: Option<GroupCache>,
    /// Standard output stream.
    pub cout: OutFile,
    /// Error stream.
    pub cerr: OutFile,
    /// The expression tree root.
    pub expr: Expr,
    /// Files the command line itself holds open (`-fprint` targets).
    pub nopen_files: u32,
}

impl Context {
    /// Builds a context with the defaults an option-less command line gets.
    #[must_use]
    pub fn new(paths: Vec<PathBuf>, expr: Expr, cout: OutFile, cerr: OutFile) -> Self {
        Self {
            paths,
            mindepth: 0,
            maxdepth: i32::MAX,
            flags: WalkFlags::RECOVER | WalkFlags::SORT,
            strategy: Strategy::Bfs,
            unique: false,
            xargs_safe: false,
            ignore_races: false,
            debug: DebugFlags::empty(),
            mtab: None,
            users: Some(UserCache::new()),
            groups: Some(GroupCache::new()),
            cout,
            cerr,
            expr,
            nopen_files: 0,
        }
    }
}
