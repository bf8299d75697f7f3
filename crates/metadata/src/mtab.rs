//! Mount-table lookup for the `-fstype` test.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;

/// The parsed mount table, keyed by device number.
///
/// Mount points are resolved to device numbers when the table is loaded, so
/// a traversal pays one `stat` per mount instead of one per visited file.
#[derive(Debug, Default)]
pub struct MountTable {
    types: HashMap<u64, String>,
}

impl MountTable {
    /// Loads the mount table from `/proc/self/mounts`, falling back to
    /// `/etc/mtab`.
    ///
    /// Mount points that cannot be statted (stale NFS mounts, permission
    /// walls) are skipped; the rest of the table still works.
    pub fn load() -> io::Result<Self> {
        let contents = fs::read_to_string("/proc/self/mounts")
            .or_else(|_| fs::read_to_string("/etc/mtab"))?;
        Ok(Self::parse(&contents))
    }

    fn parse(contents: &str) -> Self {
        let mut types = HashMap::new();
        for line in contents.lines() {
            let mut fields = line.split_whitespace();
            let Some(_source) = fields.next() else { continue };
            let Some(target) = fields.next() else { continue };
            let Some(fstype) = fields.next() else { continue };

            let target = PathBuf::from(unescape_octal(target));
            if let Ok(metadata) = fs::symlink_metadata(&target) {
                types.entry(metadata.dev()).or_insert_with(|| fstype.to_string());
            }
        }
        Self { types }
    }

    /// Returns the file-system type name for a device, or `None` when the
    /// device is not in the table.
    #[must_use]
    pub fn fstype(&self, dev: u64) -> Option<&str> {
        self.types.get(&dev).map(String::as_str)
    }

    /// The number of distinct devices in the table.
    #[must_use]
    pub fn len(&self) -> usize {
        self.types.len()
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

/// Mount paths with spaces are octal-escaped in the mounts file
/// (`/mnt/my\040disk`).
fn unescape_octal(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    let mut chars = field.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        let digits: String = chars.clone().take(3).collect();
        if digits.len() == 3 {
            if let Ok(code) = u8::from_str_radix(&digits, 8) {
                out.push(code as char);
                chars.nth(2);
                continue;
            }
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unescape_octal_decodes_spaces() {
        assert_eq!(unescape_octal("/mnt/my\\040disk"), "/mnt/my disk");
    }

    #[test]
    fn unescape_octal_passes_plain_paths_through() {
        assert_eq!(unescape_octal("/usr/local"), "/usr/local");
    }

    #[test]
    fn unescape_octal_keeps_incomplete_escapes() {
        assert_eq!(unescape_octal("tail\\04"), "tail\\04");
    }

    #[test]
    fn parse_maps_the_root_device() {
        let table = MountTable::parse("rootfs / ext4 rw 0 0\n");
        let dev = fs::symlink_metadata("/").expect("stat /").dev();
        assert_eq!(table.fstype(dev), Some("ext4"));
    }

    #[test]
    fn parse_skips_missing_mount_points() {
        let table = MountTable::parse("none /definitely/not/mounted tmpfs rw 0 0\n");
        assert!(table.is_empty());
    }

    #[test]
    fn load_finds_the_current_directory_fstype() {
        let Ok(table) = MountTable::load() else { return };
        let dev = fs::symlink_metadata(".").expect("stat .").dev();
        // The cwd lives on some mounted filesystem; the table should know it
        // on any normally assembled system.
        if !table.is_empty() {
            assert!(table.fstype(dev).is_some());
        }
    }
}
