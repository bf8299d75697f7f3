#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! `bfind_walk` is the traversal driver behind the `bfind` search tool. It
//! walks one or more starting paths and hands every file it encounters to a
//! caller-supplied callback, which steers the walk by returning a
//! [`WalkAction`]: keep going, skip the current directory's contents, or stop
//! the whole traversal.
//!
//! # Design
//!
//! - [`walk`] drives the traversal. The order of delivery is controlled by
//!   [`Strategy`]: breadth-first (shallow entries before deep ones),
//!   depth-first, or iterative deepening.
//! - [`WalkEvent`] describes one visit of one file. Each event carries lazily
//!   populated stat caches for both follow and no-follow lookups, so
//!   callbacks that never ask for metadata never pay for a `stat` call and
//!   callbacks that ask twice pay only once.
//! - With [`WalkFlags::DEPTH`], directories that were descended into receive
//!   a second, post-order visit after their subtree completes. Under
//!   iterative deepening the post-order pass also re-delivers regular files,
//!   matching the visit the `-depth` evaluation mode expects.
//! - Filesystem failures are delivered to the callback as events with
//!   [`WalkEvent::error`] set rather than aborting the walk, as long as
//!   [`WalkFlags::RECOVER`] is present.
//!
//! # Invariants
//!
//! - After the callback returns [`WalkAction::Prune`] for a directory's
//!   pre-order visit, none of that directory's descendants are delivered, and
//!   the directory receives no post-order visit.
//! - After the callback returns [`WalkAction::Stop`], no further events are
//!   delivered.
//! - An entry's pre-order visit is always delivered before the post-order
//!   visit of every ancestor directory.
//! - Under [`Strategy::Bfs`], an entry at depth `d` is delivered before any
//!   entry at depth `d + 2` or greater.
//!
//! # Errors
//!
//! [`WalkError`] is returned only for failures the walk cannot recover from:
//! a starting path that cannot be inspected or a directory that cannot be
//! read while [`WalkFlags::RECOVER`] is absent. Everything else is reported
//! through error events.
//!
//! # Examples
//!
//! ```
//! use bfind_walk::{walk, WalkAction, WalkOptions};
//! use std::path::PathBuf;
//!
//! # fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let temp = tempfile::tempdir()?;
//! std::fs::create_dir(temp.path().join("sub"))?;
//! std::fs::write(temp.path().join("sub/file"), b"")?;
//!
//! let mut seen = Vec::new();
//! walk(
//!     &[PathBuf::from(temp.path())],
//!     &WalkOptions::default(),
//!     |event| {
//!         seen.push(event.path().to_path_buf());
//!         WalkAction::Continue
//!     },
//! )?;
//! assert_eq!(seen.len(), 3);
//! # Ok(())
//! # }
//! # demo().unwrap();
//! ```

mod error;
mod event;
mod walker;

pub use error::{WalkError, WalkErrorKind};
pub use event::{FileKind, StatFlags, Visit, WalkEvent};
pub use walker::{walk, Strategy, WalkAction, WalkFlags, WalkOptions};
