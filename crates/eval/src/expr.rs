//! The expression tree.
//!
//! A parsed command line becomes one [`Expr`] tree. Leaves carry the
//! compiled payload each test or action needs (a glob matcher, a regex, a
//! reference timestamp, an exec buffer); interior nodes are the boolean
//! operators. Nodes also carry evaluation counters, updated through
//! [`Cell`]s so the evaluator can account for every dispatch while the tree
//! stays shared.

use std::cell::{Cell, RefCell};
use std::fmt::Write as _;
use std::time::{Duration, SystemTime};

use bfind_walk::FileKind;
use bitflags::bitflags;
use globset::GlobMatcher;
use regex::bytes::Regex;

use crate::exec::ExecBuf;
use crate::fmt::FormatProgram;
use crate::output::OutFile;

/// Direction of a numeric comparison.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CmpFlag {
    /// Exactly `n`.
    Exact,
    /// Less than `n`.
    Less,
    /// Greater than `n`.
    Greater,
}

/// A three-way numeric comparison against a fixed operand.
#[derive(Clone, Copy, Debug)]
pub struct NumCmp {
    /// Comparison direction.
    pub flag: CmpFlag,
    /// The operand from the command line.
    pub value: i64,
}

impl NumCmp {
    /// Builds a comparison.
    #[must_use]
    pub fn new(flag: CmpFlag, value: i64) -> Self {
        Self { flag, value }
    }

    /// Applies the comparison to `n`.
    #[must_use]
    pub fn matches(self, n: i64) -> bool {
        match self.flag {
            CmpFlag::Exact => n == self.value,
            CmpFlag::Less => n < self.value,
            CmpFlag::Greater => n > self.value,
        }
    }
}

/// How `-perm` compares modes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ModeCmp {
    /// The permission bits match exactly (`MODE`).
    Exact,
    /// All the given bits are set (`-MODE`).
    All,
    /// Any of the given bits is set (`/MODE`).
    Any,
}

/// Which stat timestamp a time test reads.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TimeField {
    /// Access time.
    Accessed,
    /// Birth time.
    Birth,
    /// Status change time.
    Changed,
    /// Modification time.
    Modified,
}

impl TimeField {
    /// Human name for diagnostics.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Accessed => "access",
            Self::Birth => "birth",
            Self::Changed => "status change",
            Self::Modified => "modification",
        }
    }
}

/// Units for `-amin`/`-atime`-style tests.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TimeUnit {
    /// Whole minutes.
    Minutes,
    /// Whole days.
    Days,
}

impl TimeUnit {
    /// The unit length in seconds.
    #[must_use]
    pub fn seconds(self) -> i64 {
        match self {
            Self::Minutes => 60,
            Self::Days => 60 * 60 * 24,
        }
    }
}

/// Units for the `-size` test.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SizeUnit {
    /// 512-byte blocks.
    Blocks,
    /// Single bytes.
    Bytes,
    /// Two-byte words.
    Words,
    /// Kibibytes.
    Kb,
    /// Mebibytes.
    Mb,
    /// Gibibytes.
    Gb,
    /// Tebibytes.
    Tb,
    /// Pebibytes.
    Pb,
}

impl SizeUnit {
    /// The unit size in bytes.
    #[must_use]
    pub fn bytes(self) -> i64 {
        match self {
            Self::Blocks => 512,
            Self::Bytes => 1,
            Self::Words => 2,
            Self::Kb => 1 << 10,
            Self::Mb => 1 << 20,
            Self::Gb => 1 << 30,
            Self::Tb => 1 << 40,
            Self::Pb => 1 << 50,
        }
    }
}

/// The access check `-readable`/`-writable`/`-executable` performs.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AccessMode {
    /// `R_OK`.
    Readable,
    /// `W_OK`.
    Writable,
    /// `X_OK`.
    Executable,
}

bitflags! {
    /// File-type bit set for `-type`/`-xtype`.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct TypeMask: u16 {
        /// Block device.
        const BLK = 1 << 0;
        /// Character device.
        const CHR = 1 << 1;
        /// Directory.
        const DIR = 1 << 2;
        /// Named pipe.
        const FIFO = 1 << 3;
        /// Symbolic link.
        const LNK = 1 << 4;
        /// Regular file.
        const REG = 1 << 5;
        /// Socket.
        const SOCK = 1 << 6;
        /// BSD whiteout.
        const WHT = 1 << 7;
    }
}

impl TypeMask {
    /// The mask bit for a walker-reported file kind; unknown kinds map to
    /// the empty mask and so never match.
    #[must_use]
    pub fn from_kind(kind: FileKind) -> Self {
        match kind {
            FileKind::Block => Self::BLK,
            FileKind::Char => Self::CHR,
            FileKind::Dir => Self::DIR,
            FileKind::Fifo => Self::FIFO,
            FileKind::Link => Self::LNK,
            FileKind::Reg => Self::REG,
            FileKind::Sock => Self::SOCK,
            FileKind::Whiteout => Self::WHT,
            FileKind::Unknown => Self::empty(),
        }
    }
}

/// The evaluator identity and payload of an expression node.
pub enum ExprKind {
    /// `-true`.
    True,
    /// `-false`.
    False,
    /// `-readable`/`-writable`/`-executable`.
    Access {
        /// Which access right to check.
        mode: AccessMode,
    },
    /// `-acl`.
    Acl,
    /// `-capable`.
    Capable,
    /// `-xattr`.
    Xattr,
    /// `-newer` and friends.
    Newer {
        /// Stat timestamp to compare.
        field: TimeField,
        /// Reference timestamp.
        reference: SystemTime,
    },
    /// `-atime`/`-mtime`/`-ctime`/`-amin`/`-mmin`/`-cmin`.
    Time {
        /// Stat timestamp to compare.
        field: TimeField,
        /// Minutes or days.
        unit: TimeUnit,
        /// Reference timestamp (parse time).
        reference: SystemTime,
        /// The comparison.
        cmp: NumCmp,
    },
    /// `-used`.
    Used {
        /// The comparison, in whole days.
        cmp: NumCmp,
    },
    /// `-uid`.
    Uid {
        /// The comparison.
        cmp: NumCmp,
    },
    /// `-gid`.
    Gid {
        /// The comparison.
        cmp: NumCmp,
    },
    /// `-nouser`.
    NoUser,
    /// `-nogroup`.
    NoGroup,
    /// `-depth N`.
    Depth {
        /// The comparison.
        cmp: NumCmp,
    },
    /// `-inum`.
    Inum {
        /// The comparison.
        cmp: NumCmp,
    },
    /// `-links`.
    Links {
        /// The comparison.
        cmp: NumCmp,
    },
    /// `-empty`.
    Empty,
    /// `-fstype`.
    Fstype {
        /// File-system type name to match.
        name: String,
    },
    /// `-hidden`.
    Hidden,
    /// `-nohidden`.
    NoHidden,
    /// `-name`/`-iname`.
    Name {
        /// The original pattern.
        pattern: String,
        /// Compiled matcher.
        matcher: GlobMatcher,
    },
    /// `-path`/`-ipath`.
    PathMatch {
        /// The original pattern.
        pattern: String,
        /// Compiled matcher.
        matcher: GlobMatcher,
    },
    /// `-lname`/`-ilname`.
    Lname {
        /// The original pattern.
        pattern: String,
        /// Compiled matcher.
        matcher: GlobMatcher,
    },
    /// `-perm`.
    Perm {
        /// How to compare.
        how: ModeCmp,
        /// Target bits for non-directories.
        file_mode: u32,
        /// Target bits for directories.
        dir_mode: u32,
    },
    /// `-regex`/`-iregex`.
    Regex {
        /// The original pattern.
        pattern: String,
        /// Compiled, fully anchored regex.
        regex: Regex,
    },
    /// `-samefile`.
    Samefile {
        /// Device of the reference file.
        dev: u64,
        /// Inode of the reference file.
        ino: u64,
    },
    /// `-size`.
    Size {
        /// Unit the size is rounded up to.
        unit: SizeUnit,
        /// The comparison.
        cmp: NumCmp,
    },
    /// `-sparse`.
    Sparse,
    /// `-type`.
    Type {
        /// Accepted types.
        mask: TypeMask,
    },
    /// `-xtype`.
    Xtype {
        /// Accepted types, checked under the opposite follow policy.
        mask: TypeMask,
    },
    /// `-delete`.
    Delete,
    /// `-exec`/`-execdir`/`-ok`/`-okdir`.
    Exec {
        /// The per-node batch state.
        exec: RefCell<ExecBuf>,
    },
    /// `-exit`.
    Exit {
        /// The status to exit with.
        status: i32,
    },
    /// `-prune`.
    Prune,
    /// `-quit`.
    Quit,
    /// `-print`/`-fprint`.
    Print {
        /// Target stream.
        file: OutFile,
    },
    /// `-print0`/`-fprint0`.
    Print0 {
        /// Target stream.
        file: OutFile,
    },
    /// `-printx`/`-fprintx`.
    Printx {
        /// Target stream.
        file: OutFile,
    },
    /// `-printf`/`-fprintf`.
    Printf {
        /// Target stream.
        file: OutFile,
        /// Compiled format program.
        program: FormatProgram,
    },
    /// `-ls`/`-fls`.
    Ls {
        /// Target stream.
        file: OutFile,
        /// "Now", for the recent-timestamp window.
        reference: SystemTime,
    },
    /// `!`.
    Not {
        /// The negated expression.
        rhs: Box<Expr>,
    },
    /// Conjunction.
    And {
        /// Left operand, evaluated first.
        lhs: Box<Expr>,
        /// Right operand, evaluated only when the left succeeded.
        rhs: Box<Expr>,
    },
    /// Disjunction.
    Or {
        /// Left operand, evaluated first.
        lhs: Box<Expr>,
        /// Right operand, evaluated only when the left failed.
        rhs: Box<Expr>,
    },
    /// The comma operator: evaluate both, return the right result.
    Comma {
        /// Left operand, evaluated for side effects.
        lhs: Box<Expr>,
        /// Right operand, providing the result.
        rhs: Box<Expr>,
    },
}

/// One node of the expression tree.
pub struct Expr {
    kind: ExprKind,
    argv: Vec<String>,

    always_true: bool,
    always_false: bool,
    persistent_fds: u32,
    ephemeral_fds: u32,

    evaluations: Cell<u64>,
    successes: Cell<u64>,
    elapsed: Cell<Duration>,
}

impl Expr {
    /// Builds a node, deriving truth hints and file-descriptor needs from
    /// the kind.
    #[must_use]
    pub fn new(kind: ExprKind, argv: Vec<String>) -> Self {
        let (always_true, always_false) = match &kind {
            ExprKind::True
            | ExprKind::Prune
            | ExprKind::Quit
            | ExprKind::Exit { .. }
            | ExprKind::Print { .. }
            | ExprKind::Print0 { .. }
            | ExprKind::Printx { .. }
            | ExprKind::Printf { .. }
            | ExprKind::Ls { .. } => (true, false),
            ExprKind::False => (false, true),
            ExprKind::Not { rhs } => (rhs.always_false, rhs.always_true),
            ExprKind::And { lhs, rhs } => {
                (lhs.always_true && rhs.always_true, lhs.always_false || rhs.always_false)
            }
            ExprKind::Or { lhs, rhs } => {
                (lhs.always_true || rhs.always_true, lhs.always_false && rhs.always_false)
            }
            ExprKind::Comma { rhs, .. } => (rhs.always_true, rhs.always_false),
            _ => (false, false),
        };

        let (persistent_fds, ephemeral_fds) = match &kind {
            ExprKind::Empty => (0, 1),
            ExprKind::Exec { .. } => (0, 2),
            ExprKind::Not { rhs } => (rhs.persistent_fds, rhs.ephemeral_fds),
            ExprKind::And { lhs, rhs }
            | ExprKind::Or { lhs, rhs }
            | ExprKind::Comma { lhs, rhs } => (
                lhs.persistent_fds + rhs.persistent_fds,
                lhs.ephemeral_fds.max(rhs.ephemeral_fds),
            ),
            _ => (0, 0),
        };

        Self {
            kind,
            argv,
            always_true,
            always_false,
            persistent_fds,
            ephemeral_fds,
            evaluations: Cell::new(0),
            successes: Cell::new(0),
            elapsed: Cell::new(Duration::ZERO),
        }
    }

    /// Adds file-descriptor needs the kind alone cannot know, e.g. a
    /// `-fprint` node holding its output file open for the whole traversal.
    #[must_use]
    pub fn with_fds(mut self, persistent: u32, ephemeral: u32) -> Self {
        self.persistent_fds += persistent;
        self.ephemeral_fds = self.ephemeral_fds.max(ephemeral);
        self
    }

    /// Negation node.
    #[must_use]
    pub fn not(rhs: Expr) -> Self {
        Self::new(ExprKind::Not { rhs: Box::new(rhs) }, vec!["!".to_string()])
    }

    /// Conjunction node.
    #[must_use]
    pub fn and(lhs: Expr, rhs: Expr) -> Self {
        Self::new(
            ExprKind::And {
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            },
            vec!["-a".to_string()],
        )
    }

    /// Disjunction node.
    #[must_use]
    pub fn or(lhs: Expr, rhs: Expr) -> Self {
        Self::new(
            ExprKind::Or {
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            },
            vec!["-o".to_string()],
        )
    }

    /// Comma node.
    #[must_use]
    pub fn comma(lhs: Expr, rhs: Expr) -> Self {
        Self::new(
            ExprKind::Comma {
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            },
            vec![",".to_string()],
        )
    }

    /// The node's evaluator identity and payload.
    #[must_use]
    pub fn kind(&self) -> &ExprKind {
        &self.kind
    }

    /// The command-line tokens this node was built from.
    #[must_use]
    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    /// Whether a returning evaluation of this node is known to be true.
    #[must_use]
    pub fn always_true(&self) -> bool {
        self.always_true
    }

    /// Whether a returning evaluation of this node is known to be false.
    #[must_use]
    pub fn always_false(&self) -> bool {
        self.always_false
    }

    /// Whether this node is known to end the traversal instead of
    /// returning normally.
    #[must_use]
    pub fn never_returns(&self) -> bool {
        matches!(self.kind, ExprKind::Quit | ExprKind::Exit { .. })
    }

    /// File descriptors this subtree keeps open between evaluations.
    #[must_use]
    pub fn persistent_fds(&self) -> u32 {
        self.persistent_fds
    }

    /// File descriptors this subtree opens transiently during evaluation.
    #[must_use]
    pub fn ephemeral_fds(&self) -> u32 {
        self.ephemeral_fds
    }

    /// How many times this node was evaluated.
    #[must_use]
    pub fn evaluations(&self) -> u64 {
        self.evaluations.get()
    }

    /// How many evaluations returned true.
    #[must_use]
    pub fn successes(&self) -> u64 {
        self.successes.get()
    }

    /// Total time spent evaluating this node, when timing was enabled.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.elapsed.get()
    }

    pub(crate) fn record(&self, result: bool) {
        self.evaluations.set(self.evaluations.get() + 1);
        if result {
            self.successes.set(self.successes.get() + 1);
        }
    }

    pub(crate) fn add_elapsed(&self, elapsed: Duration) {
        self.elapsed.set(self.elapsed.get() + elapsed);
    }

    /// The node's children, left to right.
    #[must_use]
    pub fn children(&self) -> [Option<&Expr>; 2] {
        match &self.kind {
            ExprKind::Not { rhs } => [Some(rhs), None],
            ExprKind::And { lhs, rhs }
            | ExprKind::Or { lhs, rhs }
            | ExprKind::Comma { lhs, rhs } => [Some(lhs), Some(rhs)],
            _ => [None, None],
        }
    }

    /// Renders the tree, one node per line, optionally with the evaluation
    /// counters gathered during the run.
    #[must_use]
    pub fn dump(&self, rates: bool) -> String {
        let mut out = String::new();
        self.dump_into(&mut out, 0, rates);
        out
    }

    fn dump_into(&self, out: &mut String, indent: usize, rates: bool) {
        for _ in 0..indent {
            out.push_str("    ");
        }
        let label = if self.argv.is_empty() {
            "-true".to_string()
        } else {
            self.argv.join(" ")
        };
        let [first, second] = self.children();
        if first.is_some() {
            let _ = write!(out, "({label}");
        } else {
            out.push_str(&label);
        }
        if rates {
            let secs = self.elapsed.get().as_secs_f64();
            let _ = write!(
                out,
                "    ; {}/{} hits, {secs:.9}s",
                self.successes.get(),
                self.evaluations.get()
            );
        }
        out.push('\n');
        for child in [first, second].into_iter().flatten() {
            child.dump_into(out, indent + 1, rates);
        }
        if first.is_some() {
            for _ in 0..indent {
                out.push_str("    ");
            }
            out.push_str(")\n");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(kind: ExprKind, token: &str) -> Expr {
        Expr::new(kind, vec![token.to_string()])
    }

    #[test]
    fn numeric_comparison_covers_all_directions() {
        assert!(NumCmp::new(CmpFlag::Exact, 5).matches(5));
        assert!(!NumCmp::new(CmpFlag::Exact, 5).matches(6));
        assert!(NumCmp::new(CmpFlag::Less, 5).matches(4));
        assert!(!NumCmp::new(CmpFlag::Less, 5).matches(5));
        assert!(NumCmp::new(CmpFlag::Greater, 5).matches(6));
        assert!(!NumCmp::new(CmpFlag::Greater, 5).matches(5));
    }

    #[test]
    fn size_units_match_the_table() {
        assert_eq!(SizeUnit::Blocks.bytes(), 512);
        assert_eq!(SizeUnit::Bytes.bytes(), 1);
        assert_eq!(SizeUnit::Words.bytes(), 2);
        assert_eq!(SizeUnit::Kb.bytes(), 1024);
        assert_eq!(SizeUnit::Mb.bytes(), 1_048_576);
        assert_eq!(SizeUnit::Gb.bytes(), 1 << 30);
        assert_eq!(SizeUnit::Tb.bytes(), 1 << 40);
        assert_eq!(SizeUnit::Pb.bytes(), 1 << 50);
    }

    #[test]
    fn truth_hints_propagate_through_operators() {
        let t = || leaf(ExprKind::True, "-true");
        let f = || leaf(ExprKind::False, "-false");

        assert!(Expr::not(f()).always_true());
        assert!(Expr::not(t()).always_false());
        assert!(Expr::and(t(), t()).always_true());
        assert!(Expr::and(t(), f()).always_false());
        assert!(Expr::or(f(), t()).always_true());
        assert!(Expr::or(f(), f()).always_false());
        assert!(Expr::comma(f(), t()).always_true());
    }

    #[test]
    fn hidden_test_has_no_truth_hint() {
        let expr = leaf(ExprKind::Hidden, "-hidden");
        assert!(!expr.always_true());
        assert!(!expr.always_false());
    }

    #[test]
    fn quit_and_exit_never_return() {
        assert!(leaf(ExprKind::Quit, "-quit").never_returns());
        assert!(leaf(ExprKind::Exit { status: 3 }, "-exit").never_returns());
        assert!(!leaf(ExprKind::True, "-true").never_returns());
    }

    #[test]
    fn fd_needs_sum_and_max_through_operators() {
        let (file, _) = OutFile::memory();
        let print = leaf(ExprKind::Print { file: file.clone() }, "-fprint").with_fds(1, 0);
        let empty = leaf(ExprKind::Empty, "-empty");
        let both = Expr::and(print, empty);
        assert_eq!(both.persistent_fds(), 1);
        assert_eq!(both.ephemeral_fds(), 1);

        let print2 = leaf(ExprKind::Print { file }, "-fprint").with_fds(1, 0);
        let or = Expr::or(both, print2);
        assert_eq!(or.persistent_fds(), 2);
        assert_eq!(or.ephemeral_fds(), 1);
    }

    #[test]
    fn counters_track_successes_separately() {
        let expr = leaf(ExprKind::True, "-true");
        expr.record(true);
        expr.record(false);
        expr.record(true);
        assert_eq!(expr.evaluations(), 3);
        assert_eq!(expr.successes(), 2);
        assert!(expr.successes() <= expr.evaluations());
    }

    #[test]
    fn dump_shows_the_tree_shape() {
        let tree = Expr::or(leaf(ExprKind::Hidden, "-hidden"), leaf(ExprKind::Prune, "-prune"));
        let dump = tree.dump(false);
        assert!(dump.contains("(-o"));
        assert!(dump.contains("-hidden"));
        assert!(dump.contains("-prune"));
    }
}
