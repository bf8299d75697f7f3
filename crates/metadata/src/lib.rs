#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! `bfind_metadata` bundles the host-environment lookups the `bfind`
//! evaluator needs beyond plain `stat` results: resolving numeric user and
//! group ids to names (and back), mapping devices to file-system type names
//! through the mount table, probing for ACLs, capabilities, and extended
//! attributes, and rendering `ls`-style permission strings.
//!
//! # Design
//!
//! - [`UserCache`] and [`GroupCache`] memoise `getpwuid_r`/`getgrgid_r`
//!   lookups; a search that prints thousands of files owned by a handful of
//!   users hits the passwd database once per user.
//! - [`MountTable`] parses `/proc/self/mounts` (falling back to `/etc/mtab`)
//!   once and resolves each mount point's device eagerly, so later
//!   device-to-fstype queries are just a map lookup.
//! - The probes in [`probes`] return `io::Result<bool>`: present, absent, or
//!   a real error. Callers distinguish "feature absent" from "probe failed".

mod mode;
mod mtab;
pub mod probes;
mod users;

pub use mode::format_mode;
pub use mtab::MountTable;
pub use users::{GroupCache, UserCache};
