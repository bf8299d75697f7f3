//! Compiled `-printf` format programs.
//!
//! A format string is compiled once at parse time into a directive list;
//! printing a file replays the directives. Unknown directives and escapes
//! are rejected at compile time so a bad format fails before the traversal
//! starts.

use std::fs::{self, Metadata};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use bfind_walk::{FileKind, StatFlags, WalkEvent};
use chrono::{Local, TimeZone};
use thiserror::Error;

use crate::ctx::Context;
use crate::expr::TimeField;
use crate::output::OutFile;

/// A format string that failed to compile.
#[derive(Debug, Error)]
pub enum FormatError {
    /// `%` followed by a character with no meaning.
    #[error("unknown format directive '%{0}'")]
    UnknownDirective(char),
    /// `\` followed by a character with no meaning.
    #[error("unknown escape sequence '\\{0}'")]
    UnknownEscape(char),
    /// The string ended in the middle of a directive.
    #[error("format string ends with an incomplete directive")]
    Truncated,
    /// `%T`/`%A`/`%C` followed by an unsupported strftime letter.
    #[error("unsupported time format '%{0}'")]
    UnsupportedTimeFormat(char),
}

#[derive(Clone, Copy, Debug)]
enum TimeStyle {
    Ctime,
    Epoch,
    Strftime(char),
}

#[derive(Debug)]
enum Directive {
    Literal(Vec<u8>),
    Path,
    RelPath,
    Name,
    Dir,
    Root,
    Depth,
    Dev,
    Ino,
    LinkTarget,
    ModeOctal,
    ModeString,
    Nlink,
    Size,
    Blocks,
    BlocksK,
    User,
    Group,
    Uid,
    Gid,
    TypeChar,
    ResolvedTypeChar,
    Time(TimeField, TimeStyle),
}

impl Directive {
    fn needs_stat(&self) -> bool {
        matches!(
            self,
            Self::Dev
                | Self::Ino
                | Self::ModeOctal
                | Self::ModeString
                | Self::Nlink
                | Self::Size
                | Self::Blocks
                | Self::BlocksK
                | Self::User
                | Self::Group
                | Self::Uid
                | Self::Gid
                | Self::Time(..)
        )
    }
}

const STRFTIME_LETTERS: &str = "aAbBcCdDeFgGhHIjklmMpPrRsSTuUVwWxXyYzZ+%";

/// A compiled format string.
#[derive(Debug)]
pub struct FormatProgram {
    directives: Vec<Directive>,
}

impl FormatProgram {
    /// Compiles a `find`-style format string.
    pub fn parse(format: &str) -> Result<Self, FormatError> {
        let mut directives = Vec::new();
        let mut literal = Vec::new();
        let mut chars = format.chars();

        while let Some(c) = chars.next() {
            match c {
                '\\' => {
                    let escape = chars.next().ok_or(FormatError::Truncated)?;
                    literal.push(match escape {
                        'a' => 0x07,
                        'b' => 0x08,
                        'f' => 0x0c,
                        'n' => b'\n',
                        'r' => b'\r',
                        't' => b'\t',
                        'v' => 0x0b,
                        '0' => 0x00,
                        '\\' => b'\\',
                        other => return Err(FormatError::UnknownEscape(other)),
                    });
                }
                '%' => {
                    let spec = chars.next().ok_or(FormatError::Truncated)?;
                    if spec == '%' {
                        literal.push(b'%');
                        continue;
                    }
                    if !literal.is_empty() {
                        directives.push(Directive::Literal(std::mem::take(&mut literal)));
                    }
                    directives.push(match spec {
                        'p' => Directive::Path,
                        'P' => Directive::RelPath,
                        'f' => Directive::Name,
                        'h' => Directive::Dir,
                        'H' => Directive::Root,
                        'd' => Directive::Depth,
                        'D' => Directive::Dev,
                        'i' => Directive::Ino,
                        'l' => Directive::LinkTarget,
                        'm' => Directive::ModeOctal,
                        'M' => Directive::ModeString,
                        'n' => Directive::Nlink,
                        's' => Directive::Size,
                        'b' => Directive::Blocks,
                        'k' => Directive::BlocksK,
                        'u' => Directive::User,
                        'g' => Directive::Group,
                        'U' => Directive::Uid,
                        'G' => Directive::Gid,
                        'y' => Directive::TypeChar,
                        'Y' => Directive::ResolvedTypeChar,
                        't' => Directive::Time(TimeField::Modified, TimeStyle::Ctime),
                        'a' => Directive::Time(TimeField::Accessed, TimeStyle::Ctime),
                        'c' => Directive::Time(TimeField::Changed, TimeStyle::Ctime),
                        'T' => Directive::Time(TimeField::Modified, time_style(&mut chars)?),
                        'A' => Directive::Time(TimeField::Accessed, time_style(&mut chars)?),
                        'C' => Directive::Time(TimeField::Changed, time_style(&mut chars)?),
                        'B' => Directive::Time(TimeField::Birth, time_style(&mut chars)?),
                        other => return Err(FormatError::UnknownDirective(other)),
                    });
                }
                other => {
                    let mut buf = [0_u8; 4];
                    literal.extend_from_slice(other.encode_utf8(&mut buf).as_bytes());
                }
            }
        }
        if !literal.is_empty() {
            directives.push(Directive::Literal(literal));
        }
        Ok(Self { directives })
    }

    /// Prints one file according to the program. A stat failure aborts the
    /// line with the error; the caller reports it.
    pub fn print(
        &self,
        file: &OutFile,
        event: &WalkEvent<'_>,
        ctx: &Context,
    ) -> io::Result<()> {
        for directive in &self.directives {
            let metadata = if directive.needs_stat() {
                Some(event.stat(event.stat_flags())?)
            } else {
                None
            };
            self.print_one(directive, metadata, file, event, ctx)?;
        }
        Ok(())
    }

    fn print_one(
        &self,
        directive: &Directive,
        metadata: Option<&Metadata>,
        file: &OutFile,
        event: &WalkEvent<'_>,
        ctx: &Context,
    ) -> io::Result<()> {
        let md = || metadata.expect("stat fetched for stat-needing directive");
        match directive {
            Directive::Literal(bytes) => file.write_all(bytes)?,
            Directive::Path => file.write_path(event.path())?,
            Directive::RelPath => {
                let path = event.path().as_os_str().as_bytes();
                let root = event.root().as_os_str().as_bytes();
                let mut rel = path.strip_prefix(root).unwrap_or(b"");
                while rel.first() == Some(&b'/') {
                    rel = &rel[1..];
                }
                file.write_all(rel)?;
            }
            Directive::Name => file.write_all(event.name().as_bytes())?,
            Directive::Dir => file.write_all(dirname(event))?,
            Directive::Root => file.write_path(event.root())?,
            Directive::Depth => write!(file, "{}", event.depth())?,
            Directive::Dev => write!(file, "{}", md().dev())?,
            Directive::Ino => write!(file, "{}", md().ino())?,
            Directive::LinkTarget => {
                if event.kind() == FileKind::Link {
                    if let Ok(target) = fs::read_link(event.path()) {
                        file.write_path(&target)?;
                    }
                }
            }
            Directive::ModeOctal => write!(file, "{:o}", md().mode() & 0o7777)?,
            Directive::ModeString => {
                write!(file, "{}", bfind_metadata::format_mode(md().mode()))?;
            }
            Directive::Nlink => write!(file, "{}", md().nlink())?,
            Directive::Size => write!(file, "{}", md().len())?,
            Directive::Blocks => write!(file, "{}", md().blocks())?,
            Directive::BlocksK => write!(file, "{}", (md().blocks() * 512 + 1023) / 1024)?,
            Directive::User => {
                let uid = md().uid();
                match ctx.users.as_ref().and_then(|users| users.name(uid)) {
                    Some(name) => write!(file, "{name}")?,
                    None => write!(file, "{uid}")?,
                }
            }
            Directive::Group => {
                let gid = md().gid();
                match ctx.groups.as_ref().and_then(|groups| groups.name(gid)) {
                    Some(name) => write!(file, "{name}")?,
                    None => write!(file, "{gid}")?,
                }
            }
            Directive::Uid => write!(file, "{}", md().uid())?,
            Directive::Gid => write!(file, "{}", md().gid())?,
            Directive::TypeChar => write!(file, "{}", event.kind().letter())?,
            Directive::ResolvedTypeChar => {
                let c = match event.kind_with(StatFlags::TRYFOLLOW) {
                    Ok(FileKind::Link) => 'N',
                    Ok(kind) => kind.letter(),
                    Err(_) => '?',
                };
                write!(file, "{c}")?;
            }
            Directive::Time(field, style) => {
                let (secs, nanos) = stat_time_parts(md(), *field)?;
                write!(file, "{}", render_time(*style, secs, nanos)?)?;
            }
        }
        Ok(())
    }
}

fn time_style(chars: &mut std::str::Chars<'_>) -> Result<TimeStyle, FormatError> {
    let letter = chars.next().ok_or(FormatError::Truncated)?;
    if letter == '@' {
        return Ok(TimeStyle::Epoch);
    }
    if STRFTIME_LETTERS.contains(letter) {
        Ok(TimeStyle::Strftime(letter))
    } else {
        Err(FormatError::UnsupportedTimeFormat(letter))
    }
}

fn stat_time_parts(metadata: &Metadata, field: TimeField) -> io::Result<(i64, u32)> {
    match field {
        TimeField::Accessed => Ok((metadata.atime(), metadata.atime_nsec() as u32)),
        TimeField::Changed => Ok((metadata.ctime(), metadata.ctime_nsec() as u32)),
        TimeField::Modified => Ok((metadata.mtime(), metadata.mtime_nsec() as u32)),
        TimeField::Birth => {
            let created = metadata.created()?;
            Ok(crate::preds::epoch_parts(created))
        }
    }
}

fn render_time(style: TimeStyle, secs: i64, nanos: u32) -> io::Result<String> {
    match style {
        TimeStyle::Epoch => Ok(format!("{secs}.{nanos:09}")),
        TimeStyle::Ctime | TimeStyle::Strftime(_) => {
            let time = Local
                .timestamp_opt(secs, nanos)
                .single()
                .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "timestamp out of range"))?;
            let format = match style {
                TimeStyle::Ctime => "%a %b %e %H:%M:%S %Y".to_string(),
                TimeStyle::Strftime(letter) => format!("%{letter}"),
                TimeStyle::Epoch => unreachable!(),
            };
            Ok(time.format(&format).to_string())
        }
    }
}

fn dirname<'e>(event: &'e WalkEvent<'_>) -> &'e [u8] {
    let offset = event.name_offset();
    if offset == 0 {
        return b".";
    }
    let bytes = event.path().as_os_str().as_bytes();
    if offset == 1 {
        // Direct child of the filesystem root.
        &bytes[..1]
    } else {
        &bytes[..offset - 1]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ctx::Context;
    use crate::expr::{Expr, ExprKind};
    use crate::output::OutFile;
    use bfind_walk::{walk, WalkAction, WalkOptions};
    use std::path::PathBuf;

    fn print_with(format: &str, path: &Path) -> String {
        let program = FormatProgram::parse(format).expect("format compiles");
        let (cout, buffer) = OutFile::memory();
        let (cerr, _) = OutFile::memory();
        let expr = Expr::new(ExprKind::True, vec!["-true".to_string()]);
        let ctx = Context::new(vec![PathBuf::from(path)], expr, cout.clone(), cerr);

        let paths = vec![PathBuf::from(path)];
        walk(&paths, &WalkOptions::default(), |event| {
            program.print(&cout, event, &ctx).expect("print");
            WalkAction::Prune
        })
        .expect("walk");
        buffer.text()
    }

    #[test]
    fn literal_escapes_render() {
        let program = FormatProgram::parse("a\\tb\\n").expect("compiles");
        let (file, buffer) = OutFile::memory();
        // A literal-only program needs no event data to exercise escapes.
        for directive in &program.directives {
            if let Directive::Literal(bytes) = directive {
                file.write_all(bytes).expect("write");
            }
        }
        assert_eq!(buffer.contents(), b"a\tb\n");
    }

    #[test]
    fn unknown_directive_is_rejected() {
        assert!(matches!(
            FormatProgram::parse("%q"),
            Err(FormatError::UnknownDirective('q'))
        ));
    }

    #[test]
    fn unknown_escape_is_rejected() {
        assert!(matches!(
            FormatProgram::parse("\\q"),
            Err(FormatError::UnknownEscape('q'))
        ));
    }

    #[test]
    fn trailing_percent_is_rejected() {
        assert!(matches!(FormatProgram::parse("abc%"), Err(FormatError::Truncated)));
    }

    #[test]
    fn unsupported_time_letter_is_rejected() {
        assert!(matches!(
            FormatProgram::parse("%Tq"),
            Err(FormatError::UnsupportedTimeFormat('q'))
        ));
    }

    #[test]
    fn percent_escape_prints_a_percent() {
        let temp = tempfile::tempdir().expect("tempdir");
        let out = print_with("100%%\\n", temp.path());
        assert_eq!(out, "100%\n");
    }

    #[test]
    fn path_name_and_size_directives() {
        let temp = tempfile::tempdir().expect("tempdir");
        let target = temp.path().join("payload");
        std::fs::write(&target, b"12345").expect("write");

        let out = print_with("%f %s\\n", &target);
        assert_eq!(out, "payload 5\n");
    }

    #[test]
    fn relative_path_directive_strips_the_root() {
        let temp = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir(temp.path().join("sub")).expect("mkdir");
        std::fs::write(temp.path().join("sub/file"), b"").expect("write");

        let program = FormatProgram::parse("%P\\n").expect("compiles");
        let (cout, buffer) = OutFile::memory();
        let (cerr, _) = OutFile::memory();
        let expr = Expr::new(ExprKind::True, vec!["-true".to_string()]);
        let paths = vec![PathBuf::from(temp.path())];
        let ctx = Context::new(paths.clone(), expr, cout.clone(), cerr);

        walk(&paths, &WalkOptions::default(), |event| {
            program.print(&cout, event, &ctx).expect("print");
            WalkAction::Continue
        })
        .expect("walk");

        let text = buffer.text();
        let mut lines: Vec<&str> = text.lines().collect();
        lines.sort_unstable();
        assert_eq!(lines, vec!["", "sub", "sub/file"]);
    }

    #[test]
    fn epoch_time_has_nanosecond_width() {
        let temp = tempfile::tempdir().expect("tempdir");
        let target = temp.path().join("stamp");
        std::fs::write(&target, b"").expect("write");

        let out = print_with("%T@", &target);
        let (secs, nanos) = out.split_once('.').expect("fraction");
        assert!(secs.parse::<i64>().is_ok());
        assert_eq!(nanos.len(), 9);
    }

    #[test]
    fn type_char_matches_the_entry() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert_eq!(print_with("%y", temp.path()), "d");
    }
}
