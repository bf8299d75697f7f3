#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! `bfind_eval` is the heart of the `bfind` search tool: it evaluates a
//! parsed expression tree against every file delivered by the traversal
//! driver, performs the side effects the expression's actions ask for
//! (printing, deleting, running commands), and steers the traversal by
//! pruning subtrees or stopping it outright.
//!
//! # Design
//!
//! - [`Expr`] is the expression tree. Leaves are tests and actions; interior
//!   nodes are `!`, and, or, and the comma operator. Each node keeps
//!   evaluation counters in [`Cell`](std::cell::Cell)s so the evaluator can
//!   account for every dispatch while borrowing the tree immutably.
//! - [`Context`] is the parsed command line: starting paths, depth bounds,
//!   traversal flags, shared caches, output streams, and the expression
//!   root.
//! - [`evaluate`] wires the callback into [`bfind_walk::walk`], owning the
//!   uniqueness set and the exit-status slot for the duration of one
//!   traversal, and finishes by flushing every batched `-exec` buffer.
//! - Short-circuiting follows `find` semantics exactly; once `-quit` or
//!   `-exit` fires, no further evaluator runs and the traversal stops.
//!
//! # Invariants
//!
//! - Evaluators mutate only their own node's counters and the per-visit
//!   state; the rest of the tree is read-only during a visit.
//! - Every node's `successes` counter never exceeds its `evaluations`
//!   counter.
//! - Errors never unwind out of a visit: they are reported on the error
//!   stream and reflected in the exit status.
//!
//! # Errors
//!
//! Failures are reported as single `bfind: path: message` lines on the
//! configured error stream. The process exit status is `0` on success, `1`
//! after any reported failure, and `n` when `-exit n` ended the traversal.

mod actions;
mod ctx;
mod debug;
mod eval;
mod exec;
mod expr;
mod fmt;
mod output;
mod preds;
mod rlimit;

pub use ctx::{Context, DebugFlags};
pub use eval::evaluate;
pub use exec::{ExecBuf, ExecFlags};
pub use expr::{
    AccessMode, CmpFlag, Expr, ExprKind, ModeCmp, NumCmp, SizeUnit, TimeField, TimeUnit, TypeMask,
};
pub use fmt::{FormatError, FormatProgram};
pub use output::{MemoryBuffer, OutFile};
pub use rlimit::infer_fd_limit;
