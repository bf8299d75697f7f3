use std::cell::OnceCell;
use std::ffi::OsStr;
use std::fs::{self, Metadata};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};

use bitflags::bitflags;

/// The type of a visited file, as far as the walker could determine it
/// without an extra `stat` call.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FileKind {
    /// The type could not be determined cheaply.
    Unknown,
    /// Block device.
    Block,
    /// Character device.
    Char,
    /// Directory.
    Dir,
    /// Named pipe.
    Fifo,
    /// Symbolic link.
    Link,
    /// Regular file.
    Reg,
    /// Socket.
    Sock,
    /// BSD whiteout.
    Whiteout,
}

impl FileKind {
    /// Maps an [`fs::FileType`] onto a [`FileKind`].
    #[must_use]
    pub fn from_file_type(file_type: fs::FileType) -> Self {
        if file_type.is_dir() {
            Self::Dir
        } else if file_type.is_symlink() {
            Self::Link
        } else if file_type.is_file() {
            Self::Reg
        } else if file_type.is_block_device() {
            Self::Block
        } else if file_type.is_char_device() {
            Self::Char
        } else if file_type.is_fifo() {
            Self::Fifo
        } else if file_type.is_socket() {
            Self::Sock
        } else {
            Self::Unknown
        }
    }

    /// Maps the file type recorded in `metadata` onto a [`FileKind`].
    #[must_use]
    pub fn from_metadata(metadata: &Metadata) -> Self {
        Self::from_file_type(metadata.file_type())
    }

    /// The single-letter type indicator used by `-printf %y` and `ls -l`.
    #[must_use]
    pub fn letter(self) -> char {
        match self {
            Self::Block => 'b',
            Self::Char => 'c',
            Self::Dir => 'd',
            Self::Fifo => 'p',
            Self::Link => 'l',
            Self::Reg => 'f',
            Self::Sock => 's',
            Self::Whiteout => 'w',
            Self::Unknown => '?',
        }
    }

    /// An upper-case name for debug dumps.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Block => "BLK",
            Self::Char => "CHR",
            Self::Dir => "DIR",
            Self::Fifo => "FIFO",
            Self::Link => "LNK",
            Self::Reg => "REG",
            Self::Sock => "SOCK",
            Self::Whiteout => "WHT",
            Self::Unknown => "UNKNOWN",
        }
    }
}

bitflags! {
    /// Symlink-following policy for metadata lookups on an event.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct StatFlags: u8 {
        /// Follow symbolic links.
        const FOLLOW = 1 << 0;
        /// Never follow symbolic links.
        const NOFOLLOW = 1 << 1;
        /// Follow symbolic links, falling back to the link itself when the
        /// target cannot be reached.
        const TRYFOLLOW = 1 << 2;
    }
}

impl StatFlags {
    /// Whether this policy dereferences symbolic links at all.
    #[must_use]
    pub fn follows(self) -> bool {
        self.intersects(Self::FOLLOW | Self::TRYFOLLOW)
    }
}

/// Which visit of an entry this event represents.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Visit {
    /// Pre-order: delivered when the entry is first reached.
    Pre,
    /// Post-order: delivered after the entry's subtree completed.
    Post,
}

impl Visit {
    /// An upper-case name for debug dumps.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Pre => "PRE",
            Self::Post => "POST",
        }
    }
}

/// A lazily populated stat result, remembering failures as raw OS error
/// codes so repeated lookups do not repeat the syscall.
#[derive(Default)]
pub(crate) struct StatCache {
    cell: OnceCell<Result<Metadata, i32>>,
}

impl StatCache {
    fn get_or_init(
        &self,
        fill: impl FnOnce() -> io::Result<Metadata>,
    ) -> Result<&Metadata, i32> {
        self.cell
            .get_or_init(|| fill().map_err(|error| error.raw_os_error().unwrap_or(0)))
            .as_ref()
            .map_err(|&code| code)
    }

    fn peek(&self) -> Option<Result<&Metadata, i32>> {
        self.cell.get().map(|result| result.as_ref().map_err(|&code| code))
    }

    /// Seeds the cache with a result the walker already has in hand.
    pub(crate) fn prime(&self, value: Result<Metadata, i32>) {
        let _ = self.cell.set(value);
    }
}

fn code_to_error(code: i32) -> io::Error {
    if code == 0 {
        io::Error::new(io::ErrorKind::Other, "stat failed")
    } else {
        io::Error::from_raw_os_error(code)
    }
}

/// One visit of one file, as delivered to the [`walk`](crate::walk)
/// callback.
pub struct WalkEvent<'w> {
    pub(crate) path: PathBuf,
    pub(crate) name_off: usize,
    pub(crate) root: &'w Path,
    pub(crate) depth: usize,
    pub(crate) visit: Visit,
    pub(crate) kind: FileKind,
    pub(crate) error: Option<io::Error>,
    pub(crate) stat_flags: StatFlags,
    pub(crate) stat_cache: StatCache,
    pub(crate) lstat_cache: StatCache,
}

impl<'w> WalkEvent<'w> {
    pub(crate) fn new(
        path: PathBuf,
        root: &'w Path,
        depth: usize,
        visit: Visit,
        kind: FileKind,
        stat_flags: StatFlags,
    ) -> Self {
        let name_off = basename_offset(path.as_os_str().as_bytes());
        Self {
            path,
            name_off,
            root,
            depth,
            visit,
            kind,
            error: None,
            stat_flags,
            stat_cache: StatCache::default(),
            lstat_cache: StatCache::default(),
        }
    }

    pub(crate) fn with_error(mut self, error: io::Error) -> Self {
        self.error = Some(error);
        self
    }

    /// The full path of the entry, as built from the starting path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The byte offset of the entry's basename within [`path`](Self::path).
    ///
    /// Zero for starting paths without a directory component.
    #[must_use]
    pub fn name_offset(&self) -> usize {
        self.name_off
    }

    /// The entry's basename. For a starting path given with trailing
    /// slashes this still includes them; callers that match names trim
    /// them.
    #[must_use]
    pub fn name(&self) -> &OsStr {
        OsStr::from_bytes(&self.path.as_os_str().as_bytes()[self.name_off..])
    }

    /// The starting path this entry was reached from.
    #[must_use]
    pub fn root(&self) -> &Path {
        self.root
    }

    /// Depth below the starting path; the starting path itself is depth 0.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Which visit this event represents.
    #[must_use]
    pub fn visit(&self) -> Visit {
        self.visit
    }

    /// The entry's type under the traversal's follow policy.
    #[must_use]
    pub fn kind(&self) -> FileKind {
        self.kind
    }

    /// The traversal error carried by this event, if any. Events with an
    /// error describe a path that could not be visited properly.
    #[must_use]
    pub fn error(&self) -> Option<&io::Error> {
        self.error.as_ref()
    }

    /// The follow policy the traversal is using for this entry.
    #[must_use]
    pub fn stat_flags(&self) -> StatFlags {
        self.stat_flags
    }

    /// Fetches (and caches) metadata for the entry under the given follow
    /// policy.
    pub fn stat(&self, flags: StatFlags) -> io::Result<&Metadata> {
        if flags.contains(StatFlags::TRYFOLLOW) {
            match self.stat_follow() {
                Ok(metadata) => Ok(metadata),
                Err(_) => self.stat_nofollow().map_err(code_to_error),
            }
        } else if flags.contains(StatFlags::NOFOLLOW) {
            self.stat_nofollow().map_err(code_to_error)
        } else {
            self.stat_follow().map_err(code_to_error)
        }
    }

    /// Resolves the entry's type under an explicit follow policy, statting
    /// only when the cheap answer from the directory scan is not enough.
    pub fn kind_with(&self, flags: StatFlags) -> io::Result<FileKind> {
        match self.kind {
            FileKind::Link if flags.follows() => {
                self.stat(flags).map(FileKind::from_metadata)
            }
            FileKind::Unknown => self.stat(flags).map(FileKind::from_metadata),
            kind => Ok(kind),
        }
    }

    /// Inspects one of the stat caches without triggering a syscall.
    ///
    /// Used by debug tracing to report which lookups actually happened.
    #[must_use]
    pub fn cached_stat(&self, follow: bool) -> Option<Result<&Metadata, i32>> {
        if follow {
            self.stat_cache.peek()
        } else {
            self.lstat_cache.peek()
        }
    }

    fn stat_follow(&self) -> Result<&Metadata, i32> {
        self.stat_cache.get_or_init(|| fs::metadata(&self.path))
    }

    fn stat_nofollow(&self) -> Result<&Metadata, i32> {
        self.lstat_cache.get_or_init(|| fs::symlink_metadata(&self.path))
    }
}

/// Byte offset of the last path component, ignoring trailing slashes.
fn basename_offset(path: &[u8]) -> usize {
    let mut end = path.len();
    while end > 1 && path[end - 1] == b'/' {
        end -= 1;
    }
    match path[..end].iter().rposition(|&b| b == b'/') {
        Some(slash) if slash + 1 < end => slash + 1,
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basename_offset_plain_name() {
        assert_eq!(basename_offset(b"needle"), 0);
    }

    #[test]
    fn basename_offset_nested_path() {
        assert_eq!(basename_offset(b"a/b/needle"), 4);
    }

    #[test]
    fn basename_offset_ignores_trailing_slashes() {
        assert_eq!(basename_offset(b"a/needle//"), 2);
        assert_eq!(basename_offset(b"needle/"), 0);
    }

    #[test]
    fn basename_offset_of_root_dir() {
        assert_eq!(basename_offset(b"/"), 0);
    }

    #[test]
    fn kind_letters_are_distinct() {
        let kinds = [
            FileKind::Block,
            FileKind::Char,
            FileKind::Dir,
            FileKind::Fifo,
            FileKind::Link,
            FileKind::Reg,
            FileKind::Sock,
            FileKind::Whiteout,
        ];
        let mut letters: Vec<char> = kinds.iter().map(|kind| kind.letter()).collect();
        letters.sort_unstable();
        letters.dedup();
        assert_eq!(letters.len(), kinds.len());
    }

    #[test]
    fn stat_cache_remembers_failures() {
        let temp = tempfile::tempdir().expect("tempdir");
        let missing = temp.path().join("missing");
        let root = temp.path().to_path_buf();
        let event = WalkEvent::new(
            missing,
            &root,
            1,
            Visit::Pre,
            FileKind::Unknown,
            StatFlags::NOFOLLOW,
        );

        assert!(event.stat(StatFlags::NOFOLLOW).is_err());
        let cached = event.cached_stat(false).expect("cache populated");
        assert!(cached.is_err());
    }

    #[test]
    fn tryfollow_falls_back_to_the_link_itself() {
        let temp = tempfile::tempdir().expect("tempdir");
        let link = temp.path().join("dangling");
        std::os::unix::fs::symlink("nowhere", &link).expect("symlink");
        let root = temp.path().to_path_buf();
        let event = WalkEvent::new(
            link,
            &root,
            1,
            Visit::Pre,
            FileKind::Link,
            StatFlags::TRYFOLLOW,
        );

        let metadata = event.stat(StatFlags::TRYFOLLOW).expect("fallback lstat");
        assert!(metadata.file_type().is_symlink());
        assert_eq!(
            event.kind_with(StatFlags::TRYFOLLOW).expect("kind"),
            FileKind::Link
        );
    }
}
