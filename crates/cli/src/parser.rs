//! Hand-written parser for the `find` expression grammar.
//!
//! The grammar is: global flags, then starting paths, then an expression
//! in argument position. Operator precedence is `!` over implicit/explicit
//! and over `-o` over `,`, with parentheses as their own tokens. Tests and
//! actions consume their operands inline, which is why this is a
//! recursive-descent parser over `argv` rather than an options table.

use std::cell::RefCell;
use std::ffi::OsString;
use std::fs::{self, Metadata};
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bfind_eval::{
    AccessMode, CmpFlag, Context, DebugFlags, ExecBuf, ExecFlags, Expr, ExprKind, FormatError,
    FormatProgram, ModeCmp, NumCmp, OutFile, SizeUnit, TimeField, TimeUnit, TypeMask,
};
use bfind_metadata::{GroupCache, MountTable, UserCache};
use bfind_walk::{Strategy, WalkFlags};
use globset::{GlobBuilder, GlobMatcher};
use regex::bytes::RegexBuilder;
use thiserror::Error;

/// A command line that could not be parsed.
#[derive(Debug, Error)]
pub enum ParseError {
    /// A token that is neither an option, a test, nor an action.
    #[error("unknown argument '{0}'")]
    UnknownArgument(String),
    /// An option that needs an operand hit the end of the command line.
    #[error("{option} needs a value")]
    MissingOperand {
        /// The option missing its operand.
        option: String,
    },
    /// An operand that does not parse.
    #[error("invalid value '{value}' for {option}")]
    InvalidOperand {
        /// The option the operand belongs to.
        option: String,
        /// The offending operand.
        value: String,
    },
    /// `(` without `)`.
    #[error("unmatched ( in the expression")]
    UnmatchedParen,
    /// An operator with nothing to apply to.
    #[error("expected an expression")]
    ExpectedExpression,
    /// `-exec` without a `;` or `+` terminator.
    #[error("{option} is missing its ';' or '+' terminator")]
    UnterminatedExec {
        /// The exec variant.
        option: String,
    },
    /// A glob pattern that does not compile.
    #[error("invalid pattern '{pattern}': {source}")]
    Pattern {
        /// The pattern text.
        pattern: String,
        /// The compile failure.
        source: globset::Error,
    },
    /// A regex that does not compile.
    #[error("invalid regex '{pattern}': {source}")]
    Regex {
        /// The pattern text.
        pattern: String,
        /// The compile failure.
        source: regex::Error,
    },
    /// A `-printf` format that does not compile.
    #[error(transparent)]
    Format(#[from] FormatError),
    /// A file the command line itself needs could not be used.
    #[error("{what}: {source}")]
    Io {
        /// What was being opened or inspected.
        what: String,
        /// The underlying failure.
        source: io::Error,
    },
    /// `-user` with a name the user database does not know.
    #[error("unknown user '{0}'")]
    UnknownUser(String),
    /// `-group` with a name the group database does not know.
    #[error("unknown group '{0}'")]
    UnknownGroup(String),
    /// `-S` with an unknown strategy.
    #[error("unknown search strategy '{0}'")]
    UnknownStrategy(String),
    /// `-D` with an unknown debug flag.
    #[error("unknown debug flag '{0}'")]
    UnknownDebugFlag(String),
}

struct Parser<'a> {
    args: &'a [String],
    pos: usize,
    now: SystemTime,
    cout: OutFile,
    cerr: OutFile,

    mindepth: i32,
    maxdepth: i32,
    flags: WalkFlags,
    strategy: Strategy,
    unique: bool,
    xargs_safe: bool,
    ignore_races: bool,
    debug: DebugFlags,
    mtab: Option<MountTable>,
    users: UserCache,
    groups: GroupCache,
    nopen_files: u32,
    saw_action: bool,
}

/// Parses a full command line (without `argv[0]`) into a [`Context`].
pub fn parse_args(
    args: &[String],
    cout: OutFile,
    cerr: OutFile,
) -> Result<Context, ParseError> {
    let mut parser = Parser {
        args,
        pos: 0,
        now: SystemTime::now(),
        cout,
        cerr,
        mindepth: 0,
        maxdepth: i32::MAX,
        flags: WalkFlags::RECOVER | WalkFlags::SORT,
        strategy: Strategy::Bfs,
        unique: false,
        xargs_safe: false,
        ignore_races: false,
        debug: DebugFlags::empty(),
        mtab: None,
        users: UserCache::new(),
        groups: GroupCache::new(),
        nopen_files: 0,
        saw_action: false,
    };

    let mut paths = parser.parse_flags()?;
    while let Some(arg) = parser.peek() {
        if arg == "(" || arg == "!" || (arg.starts_with('-') && arg.len() > 1) {
            break;
        }
        paths.push(PathBuf::from(arg));
        parser.pos += 1;
    }
    if paths.is_empty() {
        paths.push(PathBuf::from("."));
    }

    let expr = if parser.peek().is_some() {
        let expr = parser.parse_comma()?;
        if let Some(trailing) = parser.peek() {
            return Err(ParseError::UnknownArgument(trailing.to_string()));
        }
        Some(expr)
    } else {
        None
    };

    let print = Expr::new(
        ExprKind::Print {
            file: parser.cout.clone(),
        },
        vec!["-print".to_string()],
    );
    let expr = match expr {
        Some(expr) if parser.saw_action => expr,
        Some(expr) => Expr::and(expr, print),
        None => print,
    };

    let mut ctx = Context::new(paths, expr, parser.cout.clone(), parser.cerr.clone());
    ctx.mindepth = parser.mindepth;
    ctx.maxdepth = parser.maxdepth;
    ctx.flags = parser.flags;
    ctx.strategy = parser.strategy;
    ctx.unique = parser.unique;
    ctx.xargs_safe = parser.xargs_safe;
    ctx.ignore_races = parser.ignore_races;
    ctx.debug = parser.debug;
    ctx.mtab = parser.mtab;
    ctx.users = Some(parser.users);
    ctx.groups = Some(parser.groups);
    ctx.nopen_files = parser.nopen_files;
    Ok(ctx)
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&'a str> {
        self.args.get(self.pos).map(String::as_str)
    }

    fn next_arg(&mut self) -> Option<&'a str> {
        let arg = self.peek()?;
        self.pos += 1;
        Some(arg)
    }

    fn eat(&mut self, token: &str) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn operand(&mut self, option: &str) -> Result<&'a str, ParseError> {
        self.next_arg().ok_or_else(|| ParseError::MissingOperand {
            option: option.to_string(),
        })
    }

    /// Consumes the leading global flags, collecting any `-f` paths.
    fn parse_flags(&mut self) -> Result<Vec<PathBuf>, ParseError> {
        let mut paths = Vec::new();
        while let Some(arg) = self.peek() {
            match arg {
                "-H" => {
                    self.pos += 1;
                    self.flags -= WalkFlags::LOGICAL | WalkFlags::DETECT_CYCLES;
                    self.flags |= WalkFlags::COMFOLLOW;
                }
                "-L" | "-follow" => {
                    self.pos += 1;
                    self.flags -= WalkFlags::COMFOLLOW;
                    self.flags |= WalkFlags::LOGICAL | WalkFlags::DETECT_CYCLES;
                }
                "-P" => {
                    self.pos += 1;
                    self.flags -=
                        WalkFlags::COMFOLLOW | WalkFlags::LOGICAL | WalkFlags::DETECT_CYCLES;
                }
                "-d" => {
                    self.pos += 1;
                    self.flags |= WalkFlags::DEPTH;
                }
                "-S" => {
                    self.pos += 1;
                    let value = self.operand("-S")?;
                    self.strategy = match value {
                        "bfs" => Strategy::Bfs,
                        "dfs" => Strategy::Dfs,
                        "ids" => Strategy::Ids,
                        other => return Err(ParseError::UnknownStrategy(other.to_string())),
                    };
                }
                "-D" => {
                    self.pos += 1;
                    let value = self.operand("-D")?;
                    for name in value.split(',') {
                        self.debug |= match name {
                            "rates" => DebugFlags::RATES,
                            "search" => DebugFlags::SEARCH,
                            "stat" => DebugFlags::STAT,
                            "tree" => DebugFlags::TREE,
                            "all" => DebugFlags::all(),
                            other => {
                                return Err(ParseError::UnknownDebugFlag(other.to_string()))
                            }
                        };
                    }
                }
                "-X" | "--xargs-safe" => {
                    self.pos += 1;
                    self.xargs_safe = true;
                }
                "--ignore-races" | "-ignore_readdir_race" => {
                    self.pos += 1;
                    self.ignore_races = true;
                }
                "--unique" => {
                    self.pos += 1;
                    self.unique = true;
                }
                "-f" => {
                    self.pos += 1;
                    paths.push(PathBuf::from(self.operand("-f")?));
                }
                _ => break,
            }
        }
        Ok(paths)
    }

    fn parse_comma(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_or()?;
        while self.eat(",") {
            let rhs = self.parse_or()?;
            lhs = Expr::comma(lhs, rhs);
        }
        Ok(lhs)
    }

    fn parse_or(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_and()?;
        while self.eat("-o") || self.eat("-or") {
            let rhs = self.parse_and()?;
            lhs = Expr::or(lhs, rhs);
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_not()?;
        loop {
            if self.eat("-a") || self.eat("-and") {
                let rhs = self.parse_not()?;
                lhs = Expr::and(lhs, rhs);
            } else if self.starts_term() {
                let rhs = self.parse_not()?;
                lhs = Expr::and(lhs, rhs);
            } else {
                break;
            }
        }
        Ok(lhs)
    }

    fn starts_term(&self) -> bool {
        match self.peek() {
            Some(")") | Some(",") | Some("-o") | Some("-or") | Some("-a") | Some("-and")
            | None => false,
            Some("(") | Some("!") => true,
            Some(token) => token.starts_with('-') && token.len() > 1,
        }
    }

    fn parse_not(&mut self) -> Result<Expr, ParseError> {
        if self.eat("!") || self.eat("-not") {
            Ok(Expr::not(self.parse_not()?))
        } else {
            self.parse_primary()
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, ParseError> {
        if self.eat("(") {
            let expr = self.parse_comma()?;
            if !self.eat(")") {
                return Err(ParseError::UnmatchedParen);
            }
            Ok(expr)
        } else {
            self.parse_literal()
        }
    }

    fn parse_literal(&mut self) -> Result<Expr, ParseError> {
        let token = self.next_arg().ok_or(ParseError::ExpectedExpression)?;
        let leaf = |kind, argv: Vec<&str>| {
            Expr::new(kind, argv.into_iter().map(str::to_string).collect())
        };

        match token {
            "-true" => Ok(leaf(ExprKind::True, vec![token])),
            "-false" => Ok(leaf(ExprKind::False, vec![token])),

            "-readable" => Ok(leaf(
                ExprKind::Access {
                    mode: AccessMode::Readable,
                },
                vec![token],
            )),
            "-writable" => Ok(leaf(
                ExprKind::Access {
                    mode: AccessMode::Writable,
                },
                vec![token],
            )),
            "-executable" => Ok(leaf(
                ExprKind::Access {
                    mode: AccessMode::Executable,
                },
                vec![token],
            )),

            "-acl" => Ok(leaf(ExprKind::Acl, vec![token])),
            "-capable" => Ok(leaf(ExprKind::Capable, vec![token])),
            "-xattr" => Ok(leaf(ExprKind::Xattr, vec![token])),

            "-name" | "-iname" => {
                let pattern = self.operand(token)?;
                let matcher = compile_glob(pattern, token == "-iname")?;
                Ok(leaf(
                    ExprKind::Name {
                        pattern: pattern.to_string(),
                        matcher,
                    },
                    vec![token, pattern],
                ))
            }
            "-path" | "-ipath" | "-wholename" => {
                let pattern = self.operand(token)?;
                let matcher = compile_glob(pattern, token == "-ipath")?;
                Ok(leaf(
                    ExprKind::PathMatch {
                        pattern: pattern.to_string(),
                        matcher,
                    },
                    vec![token, pattern],
                ))
            }
            "-lname" | "-ilname" => {
                let pattern = self.operand(token)?;
                let matcher = compile_glob(pattern, token == "-ilname")?;
                Ok(leaf(
                    ExprKind::Lname {
                        pattern: pattern.to_string(),
                        matcher,
                    },
                    vec![token, pattern],
                ))
            }
            "-regex" | "-iregex" => {
                let pattern = self.operand(token)?;
                let regex = RegexBuilder::new(&format!("^(?:{pattern})$"))
                    .case_insensitive(token == "-iregex")
                    .build()
                    .map_err(|source| ParseError::Regex {
                        pattern: pattern.to_string(),
                        source,
                    })?;
                Ok(leaf(
                    ExprKind::Regex {
                        pattern: pattern.to_string(),
                        regex,
                    },
                    vec![token, pattern],
                ))
            }

            "-type" | "-xtype" => {
                let value = self.operand(token)?;
                let mask = type_mask(token, value)?;
                let kind = if token == "-type" {
                    ExprKind::Type { mask }
                } else {
                    ExprKind::Xtype { mask }
                };
                Ok(leaf(kind, vec![token, value]))
            }

            "-perm" => {
                let value = self.operand(token)?;
                let kind = parse_perm(value)?;
                Ok(leaf(kind, vec![token, value]))
            }

            "-size" => {
                let value = self.operand(token)?;
                let kind = parse_size(value)?;
                Ok(leaf(kind, vec![token, value]))
            }

            "-empty" => Ok(leaf(ExprKind::Empty, vec![token])),
            "-hidden" => Ok(leaf(ExprKind::Hidden, vec![token])),
            "-nohidden" => Ok(leaf(ExprKind::NoHidden, vec![token])),
            "-sparse" => Ok(leaf(ExprKind::Sparse, vec![token])),

            "-depth" => {
                if self.peek().is_some_and(looks_numeric) {
                    let value = self.next_arg().expect("peeked");
                    let cmp = icmp(token, value)?;
                    Ok(leaf(ExprKind::Depth { cmp }, vec![token, value]))
                } else {
                    self.flags |= WalkFlags::DEPTH;
                    Ok(leaf(ExprKind::True, vec![token]))
                }
            }
            "-mindepth" => {
                let value = self.operand(token)?;
                self.mindepth = parse_int(token, value)?;
                Ok(leaf(ExprKind::True, vec![token, value]))
            }
            "-maxdepth" => {
                let value = self.operand(token)?;
                self.maxdepth = parse_int(token, value)?;
                Ok(leaf(ExprKind::True, vec![token, value]))
            }
            "-mount" => {
                self.flags |= WalkFlags::MOUNT;
                Ok(leaf(ExprKind::True, vec![token]))
            }
            "-xdev" => {
                self.flags |= WalkFlags::XDEV;
                Ok(leaf(ExprKind::True, vec![token]))
            }

            "-uid" => {
                let value = self.operand(token)?;
                Ok(leaf(
                    ExprKind::Uid {
                        cmp: icmp(token, value)?,
                    },
                    vec![token, value],
                ))
            }
            "-gid" => {
                let value = self.operand(token)?;
                Ok(leaf(
                    ExprKind::Gid {
                        cmp: icmp(token, value)?,
                    },
                    vec![token, value],
                ))
            }
            "-user" => {
                let name = self.operand(token)?;
                let uid = match self.users.uid_for(name) {
                    Some(uid) => uid,
                    None => name
                        .parse::<u32>()
                        .map_err(|_| ParseError::UnknownUser(name.to_string()))?,
                };
                Ok(leaf(
                    ExprKind::Uid {
                        cmp: NumCmp::new(CmpFlag::Exact, i64::from(uid)),
                    },
                    vec![token, name],
                ))
            }
            "-group" => {
                let name = self.operand(token)?;
                let gid = match self.groups.gid_for(name) {
                    Some(gid) => gid,
                    None => name
                        .parse::<u32>()
                        .map_err(|_| ParseError::UnknownGroup(name.to_string()))?,
                };
                Ok(leaf(
                    ExprKind::Gid {
                        cmp: NumCmp::new(CmpFlag::Exact, i64::from(gid)),
                    },
                    vec![token, name],
                ))
            }
            "-nouser" => Ok(leaf(ExprKind::NoUser, vec![token])),
            "-nogroup" => Ok(leaf(ExprKind::NoGroup, vec![token])),

            "-inum" => {
                let value = self.operand(token)?;
                Ok(leaf(
                    ExprKind::Inum {
                        cmp: icmp(token, value)?,
                    },
                    vec![token, value],
                ))
            }
            "-links" => {
                let value = self.operand(token)?;
                Ok(leaf(
                    ExprKind::Links {
                        cmp: icmp(token, value)?,
                    },
                    vec![token, value],
                ))
            }

            "-newer" | "-anewer" | "-cnewer" | "-Bnewer" => {
                let file = self.operand(token)?;
                let field = match token {
                    "-anewer" => TimeField::Accessed,
                    "-cnewer" => TimeField::Changed,
                    "-Bnewer" => TimeField::Birth,
                    _ => TimeField::Modified,
                };
                let reference = reference_time(file, field)?;
                Ok(leaf(
                    ExprKind::Newer { field, reference },
                    vec![token, file],
                ))
            }

            "-atime" | "-ctime" | "-mtime" | "-Btime" | "-amin" | "-cmin" | "-mmin"
            | "-Bmin" => {
                let value = self.operand(token)?;
                let field = match token.as_bytes()[1] {
                    b'a' => TimeField::Accessed,
                    b'c' => TimeField::Changed,
                    b'B' => TimeField::Birth,
                    _ => TimeField::Modified,
                };
                let unit = if token.ends_with("min") {
                    TimeUnit::Minutes
                } else {
                    TimeUnit::Days
                };
                Ok(leaf(
                    ExprKind::Time {
                        field,
                        unit,
                        reference: self.now,
                        cmp: icmp(token, value)?,
                    },
                    vec![token, value],
                ))
            }
            "-used" => {
                let value = self.operand(token)?;
                Ok(leaf(
                    ExprKind::Used {
                        cmp: icmp(token, value)?,
                    },
                    vec![token, value],
                ))
            }

            "-samefile" => {
                let file = self.operand(token)?;
                let metadata = fs::metadata(file).map_err(|source| ParseError::Io {
                    what: file.to_string(),
                    source,
                })?;
                Ok(leaf(
                    ExprKind::Samefile {
                        dev: metadata.dev(),
                        ino: metadata.ino(),
                    },
                    vec![token, file],
                ))
            }

            "-fstype" => {
                let name = self.operand(token)?;
                if self.mtab.is_none() {
                    let mtab = MountTable::load().map_err(|source| ParseError::Io {
                        what: "mount table".to_string(),
                        source,
                    })?;
                    self.mtab = Some(mtab);
                }
                Ok(leaf(
                    ExprKind::Fstype {
                        name: name.to_string(),
                    },
                    vec![token, name],
                ))
            }

            "-print" => {
                self.saw_action = true;
                Ok(leaf(
                    ExprKind::Print {
                        file: self.cout.clone(),
                    },
                    vec![token],
                ))
            }
            "-print0" => {
                self.saw_action = true;
                Ok(leaf(
                    ExprKind::Print0 {
                        file: self.cout.clone(),
                    },
                    vec![token],
                ))
            }
            "-printx" => {
                self.saw_action = true;
                Ok(leaf(
                    ExprKind::Printx {
                        file: self.cout.clone(),
                    },
                    vec![token],
                ))
            }
            "-printf" => {
                self.saw_action = true;
                let format = self.operand(token)?;
                let program = FormatProgram::parse(format)?;
                Ok(leaf(
                    ExprKind::Printf {
                        file: self.cout.clone(),
                        program,
                    },
                    vec![token, format],
                ))
            }
            "-ls" => {
                self.saw_action = true;
                Ok(leaf(
                    ExprKind::Ls {
                        file: self.cout.clone(),
                        reference: self.now,
                    },
                    vec![token],
                ))
            }

            "-fprint" => {
                self.saw_action = true;
                let file = self.operand(token)?;
                let out = self.open_output(file)?;
                Ok(leaf(ExprKind::Print { file: out }, vec![token, file]).with_fds(1, 0))
            }
            "-fprint0" => {
                self.saw_action = true;
                let file = self.operand(token)?;
                let out = self.open_output(file)?;
                Ok(leaf(ExprKind::Print0 { file: out }, vec![token, file]).with_fds(1, 0))
            }
            "-fprintx" => {
                self.saw_action = true;
                let file = self.operand(token)?;
                let out = self.open_output(file)?;
                Ok(leaf(ExprKind::Printx { file: out }, vec![token, file]).with_fds(1, 0))
            }
            "-fprintf" => {
                self.saw_action = true;
                let file = self.operand(token)?;
                let format = self.operand(token)?;
                let out = self.open_output(file)?;
                let program = FormatProgram::parse(format)?;
                Ok(leaf(
                    ExprKind::Printf { file: out, program },
                    vec![token, file, format],
                )
                .with_fds(1, 0))
            }
            "-fls" => {
                self.saw_action = true;
                let file = self.operand(token)?;
                let out = self.open_output(file)?;
                Ok(leaf(
                    ExprKind::Ls {
                        file: out,
                        reference: self.now,
                    },
                    vec![token, file],
                )
                .with_fds(1, 0))
            }

            "-delete" => {
                self.saw_action = true;
                // Contents must go before their directories.
                self.flags |= WalkFlags::DEPTH;
                Ok(leaf(ExprKind::Delete, vec![token]))
            }
            "-prune" => Ok(leaf(ExprKind::Prune, vec![token])),
            "-quit" => {
                self.saw_action = true;
                Ok(leaf(ExprKind::Quit, vec![token]))
            }
            "-exit" => {
                self.saw_action = true;
                let status = if self.peek().is_some_and(looks_numeric) {
                    let value = self.next_arg().expect("peeked");
                    parse_int(token, value)?
                } else {
                    0
                };
                Ok(Expr::new(
                    ExprKind::Exit { status },
                    vec![token.to_string(), status.to_string()],
                ))
            }

            "-exec" => self.parse_exec(token, ExecFlags::empty()),
            "-execdir" => self.parse_exec(token, ExecFlags::CHDIR),
            "-ok" => self.parse_exec(token, ExecFlags::CONFIRM),
            "-okdir" => self.parse_exec(token, ExecFlags::CONFIRM | ExecFlags::CHDIR),

            other => Err(ParseError::UnknownArgument(other.to_string())),
        }
    }

    fn open_output(&mut self, file: &str) -> Result<OutFile, ParseError> {
        let out = OutFile::create(file.as_ref()).map_err(|source| ParseError::Io {
            what: file.to_string(),
            source,
        })?;
        self.nopen_files += 1;
        Ok(out)
    }

    fn parse_exec(&mut self, token: &str, flags: ExecFlags) -> Result<Expr, ParseError> {
        self.saw_action = true;
        let mut argv = vec![token.to_string()];
        let mut template: Vec<OsString> = Vec::new();
        let mut multi = false;

        loop {
            let Some(arg) = self.next_arg() else {
                return Err(ParseError::UnterminatedExec {
                    option: token.to_string(),
                });
            };
            argv.push(arg.to_string());
            if arg == ";" {
                break;
            }
            if arg == "+" && template.last().is_some_and(|last| last == "{}") {
                // Batched form: the trailing {} is where the paths go.
                template.pop();
                multi = true;
                break;
            }
            template.push(OsString::from(arg));
        }
        if template.is_empty() {
            return Err(ParseError::MissingOperand {
                option: token.to_string(),
            });
        }

        let mut exec_flags = flags;
        if multi {
            if flags.contains(ExecFlags::CONFIRM) {
                return Err(ParseError::InvalidOperand {
                    option: token.to_string(),
                    value: "+".to_string(),
                });
            }
            exec_flags |= ExecFlags::MULTI;
        }

        let exec = ExecBuf::new(template, exec_flags);
        Ok(Expr::new(
            ExprKind::Exec {
                exec: RefCell::new(exec),
            },
            argv,
        ))
    }
}

fn looks_numeric(value: &str) -> bool {
    let digits = value
        .strip_prefix('+')
        .or_else(|| value.strip_prefix('-'))
        .unwrap_or(value);
    !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
}

fn icmp(option: &str, value: &str) -> Result<NumCmp, ParseError> {
    let (flag, digits) = if let Some(rest) = value.strip_prefix('+') {
        (CmpFlag::Greater, rest)
    } else if let Some(rest) = value.strip_prefix('-') {
        (CmpFlag::Less, rest)
    } else {
        (CmpFlag::Exact, value)
    };
    let parsed = digits.parse::<i64>().map_err(|_| ParseError::InvalidOperand {
        option: option.to_string(),
        value: value.to_string(),
    })?;
    Ok(NumCmp::new(flag, parsed))
}

fn parse_int(option: &str, value: &str) -> Result<i32, ParseError> {
    value.parse::<i32>().map_err(|_| ParseError::InvalidOperand {
        option: option.to_string(),
        value: value.to_string(),
    })
}

fn compile_glob(pattern: &str, casefold: bool) -> Result<GlobMatcher, ParseError> {
    GlobBuilder::new(pattern)
        .literal_separator(false)
        .backslash_escape(true)
        .case_insensitive(casefold)
        .build()
        .map(|glob| glob.compile_matcher())
        .map_err(|source| ParseError::Pattern {
            pattern: pattern.to_string(),
            source,
        })
}

fn type_mask(option: &str, value: &str) -> Result<TypeMask, ParseError> {
    let mut mask = TypeMask::empty();
    for part in value.split(',') {
        mask |= match part {
            "b" => TypeMask::BLK,
            "c" => TypeMask::CHR,
            "d" => TypeMask::DIR,
            "p" => TypeMask::FIFO,
            "f" => TypeMask::REG,
            "l" => TypeMask::LNK,
            "s" => TypeMask::SOCK,
            "w" => TypeMask::WHT,
            _ => {
                return Err(ParseError::InvalidOperand {
                    option: option.to_string(),
                    value: value.to_string(),
                })
            }
        };
    }
    Ok(mask)
}

fn parse_perm(value: &str) -> Result<ExprKind, ParseError> {
    let (how, digits) = if let Some(rest) = value.strip_prefix('-') {
        (ModeCmp::All, rest)
    } else if let Some(rest) = value.strip_prefix('/') {
        (ModeCmp::Any, rest)
    } else {
        (ModeCmp::Exact, value)
    };
    let bits = u32::from_str_radix(digits, 8).ok().filter(|bits| *bits <= 0o7777);
    let Some(bits) = bits else {
        return Err(ParseError::InvalidOperand {
            option: "-perm".to_string(),
            value: value.to_string(),
        });
    };
    Ok(ExprKind::Perm {
        how,
        file_mode: bits,
        dir_mode: bits,
    })
}

fn parse_size(value: &str) -> Result<ExprKind, ParseError> {
    let invalid = || ParseError::InvalidOperand {
        option: "-size".to_string(),
        value: value.to_string(),
    };

    let (flag, rest) = if let Some(rest) = value.strip_prefix('+') {
        (CmpFlag::Greater, rest)
    } else if let Some(rest) = value.strip_prefix('-') {
        (CmpFlag::Less, rest)
    } else {
        (CmpFlag::Exact, value)
    };

    let digits_end = rest
        .bytes()
        .position(|b| !b.is_ascii_digit())
        .unwrap_or(rest.len());
    let (digits, suffix) = rest.split_at(digits_end);
    let number = digits.parse::<i64>().map_err(|_| invalid())?;

    let unit = match suffix {
        "" | "b" => SizeUnit::Blocks,
        "c" => SizeUnit::Bytes,
        "w" => SizeUnit::Words,
        "k" => SizeUnit::Kb,
        "M" => SizeUnit::Mb,
        "G" => SizeUnit::Gb,
        "T" => SizeUnit::Tb,
        "P" => SizeUnit::Pb,
        _ => return Err(invalid()),
    };
    Ok(ExprKind::Size {
        unit,
        cmp: NumCmp::new(flag, number),
    })
}

fn changed_time(metadata: &Metadata) -> SystemTime {
    let secs = metadata.ctime();
    let nanos = Duration::from_nanos(metadata.ctime_nsec().max(0) as u64);
    if secs >= 0 {
        UNIX_EPOCH + Duration::from_secs(secs as u64) + nanos
    } else {
        UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs()) + nanos
    }
}

fn reference_time(file: &str, field: TimeField) -> Result<SystemTime, ParseError> {
    let io_error = |source| ParseError::Io {
        what: file.to_string(),
        source,
    };
    let metadata = fs::metadata(file).map_err(io_error)?;
    match field {
        TimeField::Accessed => metadata.accessed().map_err(io_error),
        TimeField::Birth => metadata.created().map_err(io_error),
        TimeField::Changed => Ok(changed_time(&metadata)),
        TimeField::Modified => metadata.modified().map_err(io_error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Context, ParseError> {
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        let (cout, _) = OutFile::memory();
        let (cerr, _) = OutFile::memory();
        parse_args(&args, cout, cerr)
    }

    #[test]
    fn empty_command_line_prints_everything_under_dot() {
        let ctx = parse(&[]).expect("parse");
        assert_eq!(ctx.paths, vec![PathBuf::from(".")]);
        assert!(matches!(ctx.expr.kind(), ExprKind::Print { .. }));
    }

    #[test]
    fn bare_test_gets_an_implicit_print() {
        let ctx = parse(&["-name", "x"]).expect("parse");
        let ExprKind::And { lhs, rhs } = ctx.expr.kind() else {
            panic!("expected an implicit -a -print wrapper");
        };
        assert!(matches!(lhs.kind(), ExprKind::Name { .. }));
        assert!(matches!(rhs.kind(), ExprKind::Print { .. }));
    }

    #[test]
    fn explicit_actions_suppress_the_implicit_print() {
        let ctx = parse(&["-name", "x", "-o", "-print"]).expect("parse");
        let ExprKind::Or { lhs, rhs } = ctx.expr.kind() else {
            panic!("expected the user's -o at the root");
        };
        assert!(matches!(lhs.kind(), ExprKind::Name { .. }));
        assert!(matches!(rhs.kind(), ExprKind::Print { .. }));
    }

    #[test]
    fn adjacent_terms_are_an_implicit_and() {
        let ctx = parse(&["-name", "x", "-print"]).expect("parse");
        let ExprKind::And { lhs, rhs } = ctx.expr.kind() else {
            panic!("expected an implicit and");
        };
        assert!(matches!(lhs.kind(), ExprKind::Name { .. }));
        assert!(matches!(rhs.kind(), ExprKind::Print { .. }));
    }

    #[test]
    fn or_binds_looser_than_and() {
        let ctx = parse(&["-name", "a", "-name", "b", "-o", "-name", "c", "-print"])
            .expect("parse");
        let ExprKind::Or { lhs, rhs } = ctx.expr.kind() else {
            panic!("expected -o at the root");
        };
        assert!(matches!(lhs.kind(), ExprKind::And { .. }));
        assert!(matches!(rhs.kind(), ExprKind::And { .. }));
    }

    #[test]
    fn comma_binds_loosest() {
        let ctx = parse(&["-name", "a", "-print", ",", "-name", "b", "-print"]).expect("parse");
        assert!(matches!(ctx.expr.kind(), ExprKind::Comma { .. }));
    }

    #[test]
    fn bang_negates_the_next_term() {
        let ctx = parse(&["!", "-name", "x", "-print"]).expect("parse");
        let ExprKind::And { lhs, .. } = ctx.expr.kind() else {
            panic!("expected an and");
        };
        assert!(matches!(lhs.kind(), ExprKind::Not { .. }));
    }

    #[test]
    fn parens_group_subexpressions() {
        let ctx = parse(&["(", "-name", "a", "-o", "-name", "b", ")", "-print"]).expect("parse");
        let ExprKind::And { lhs, .. } = ctx.expr.kind() else {
            panic!("expected an and");
        };
        assert!(matches!(lhs.kind(), ExprKind::Or { .. }));
    }

    #[test]
    fn unmatched_paren_is_an_error() {
        assert!(matches!(
            parse(&["(", "-name", "a"]),
            Err(ParseError::UnmatchedParen)
        ));
    }

    #[test]
    fn paths_precede_the_expression() {
        let ctx = parse(&["one", "two", "-print"]).expect("parse");
        assert_eq!(
            ctx.paths,
            vec![PathBuf::from("one"), PathBuf::from("two")]
        );
    }

    #[test]
    fn global_flags_configure_the_walk() {
        let ctx = parse(&["-L", "-S", "dfs", "-D", "stat,rates", "--unique", "."]).expect("parse");
        assert!(ctx.flags.contains(WalkFlags::LOGICAL));
        assert!(ctx.flags.contains(WalkFlags::DETECT_CYCLES));
        assert_eq!(ctx.strategy, Strategy::Dfs);
        assert!(ctx.debug.contains(DebugFlags::STAT));
        assert!(ctx.debug.contains(DebugFlags::RATES));
        assert!(!ctx.debug.contains(DebugFlags::SEARCH));
        assert!(ctx.unique);
    }

    #[test]
    fn depth_flags_are_options_not_tests() {
        let ctx = parse(&["-maxdepth", "2", "-mindepth", "1"]).expect("parse");
        assert_eq!(ctx.maxdepth, 2);
        assert_eq!(ctx.mindepth, 1);
    }

    #[test]
    fn bare_depth_enables_post_order() {
        let ctx = parse(&["-depth"]).expect("parse");
        assert!(ctx.flags.contains(WalkFlags::DEPTH));
    }

    #[test]
    fn numeric_depth_is_a_test() {
        let ctx = parse(&["-depth", "2"]).expect("parse");
        assert!(!ctx.flags.contains(WalkFlags::DEPTH));
        let ExprKind::And { lhs, .. } = ctx.expr.kind() else {
            panic!("expected implicit print");
        };
        assert!(matches!(lhs.kind(), ExprKind::Depth { .. }));
    }

    #[test]
    fn size_operands_carry_unit_and_direction() {
        let ctx = parse(&["-size", "+2k"]).expect("parse");
        let ExprKind::And { lhs, .. } = ctx.expr.kind() else {
            panic!("expected implicit print");
        };
        let ExprKind::Size { unit, cmp } = lhs.kind() else {
            panic!("expected a size test");
        };
        assert_eq!(*unit, SizeUnit::Kb);
        assert_eq!(cmp.flag, CmpFlag::Greater);
        assert_eq!(cmp.value, 2);
    }

    #[test]
    fn default_size_unit_is_blocks() {
        let ctx = parse(&["-size", "3"]).expect("parse");
        let ExprKind::And { lhs, .. } = ctx.expr.kind() else {
            panic!("expected implicit print");
        };
        assert!(matches!(
            lhs.kind(),
            ExprKind::Size {
                unit: SizeUnit::Blocks,
                ..
            }
        ));
    }

    #[test]
    fn perm_prefixes_select_the_comparison() {
        for (value, expected) in [
            ("644", ModeCmp::Exact),
            ("-644", ModeCmp::All),
            ("/644", ModeCmp::Any),
        ] {
            let ctx = parse(&["-perm", value]).expect("parse");
            let ExprKind::And { lhs, .. } = ctx.expr.kind() else {
                panic!("expected implicit print");
            };
            let ExprKind::Perm { how, file_mode, .. } = lhs.kind() else {
                panic!("expected a perm test");
            };
            assert_eq!(*how, expected);
            assert_eq!(*file_mode, 0o644);
        }
    }

    #[test]
    fn symbolic_perm_is_rejected() {
        assert!(matches!(
            parse(&["-perm", "u+w"]),
            Err(ParseError::InvalidOperand { .. })
        ));
    }

    #[test]
    fn type_letters_accumulate() {
        let ctx = parse(&["-type", "f,d"]).expect("parse");
        let ExprKind::And { lhs, .. } = ctx.expr.kind() else {
            panic!("expected implicit print");
        };
        let ExprKind::Type { mask } = lhs.kind() else {
            panic!("expected a type test");
        };
        assert!(mask.contains(TypeMask::REG));
        assert!(mask.contains(TypeMask::DIR));
        assert!(!mask.contains(TypeMask::LNK));
    }

    #[test]
    fn invalid_type_letter_is_an_error() {
        assert!(matches!(
            parse(&["-type", "z"]),
            Err(ParseError::InvalidOperand { .. })
        ));
    }

    #[test]
    fn exec_collects_until_the_semicolon() {
        let ctx = parse(&["-exec", "echo", "{}", ";"]).expect("parse");
        assert!(matches!(ctx.expr.kind(), ExprKind::Exec { .. }));
        assert_eq!(ctx.expr.argv(), &["-exec", "echo", "{}", ";"]);
        assert_eq!(ctx.expr.ephemeral_fds(), 2);
    }

    #[test]
    fn exec_plus_requires_the_placeholder() {
        let ctx = parse(&["-exec", "echo", "{}", "+"]).expect("parse");
        assert!(matches!(ctx.expr.kind(), ExprKind::Exec { .. }));
    }

    #[test]
    fn unterminated_exec_is_an_error() {
        assert!(matches!(
            parse(&["-exec", "echo", "{}"]),
            Err(ParseError::UnterminatedExec { .. })
        ));
    }

    #[test]
    fn ok_refuses_batching() {
        assert!(matches!(
            parse(&["-ok", "echo", "{}", "+"]),
            Err(ParseError::InvalidOperand { .. })
        ));
    }

    #[test]
    fn exit_takes_an_optional_status() {
        let ctx = parse(&["-exit"]).expect("parse");
        assert!(matches!(ctx.expr.kind(), ExprKind::Exit { status: 0 }));

        let ctx = parse(&["-exit", "7"]).expect("parse");
        assert!(matches!(ctx.expr.kind(), ExprKind::Exit { status: 7 }));
    }

    #[test]
    fn delete_turns_on_post_order() {
        let ctx = parse(&["-delete"]).expect("parse");
        assert!(ctx.flags.contains(WalkFlags::DEPTH));
        assert!(matches!(ctx.expr.kind(), ExprKind::Delete));
    }

    #[test]
    fn unknown_arguments_are_reported() {
        assert!(matches!(
            parse(&["-frobnicate"]),
            Err(ParseError::UnknownArgument(_))
        ));
    }

    #[test]
    fn misplaced_path_is_reported() {
        assert!(matches!(
            parse(&["-print", "stray"]),
            Err(ParseError::UnknownArgument(_))
        ));
    }

    #[test]
    fn newer_reads_the_reference_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let marker = temp.path().join("marker");
        std::fs::write(&marker, b"").expect("write");

        let args = vec![
            "-newer".to_string(),
            marker.to_str().unwrap().to_string(),
        ];
        let (cout, _) = OutFile::memory();
        let (cerr, _) = OutFile::memory();
        let ctx = parse_args(&args, cout, cerr).expect("parse");
        let ExprKind::And { lhs, .. } = ctx.expr.kind() else {
            panic!("expected implicit print");
        };
        assert!(matches!(lhs.kind(), ExprKind::Newer { .. }));
    }

    #[test]
    fn newer_against_a_missing_file_is_an_error() {
        assert!(matches!(
            parse(&["-newer", "/definitely/not/a/file"]),
            Err(ParseError::Io { .. })
        ));
    }

    #[test]
    fn user_falls_back_to_numeric_ids() {
        let ctx = parse(&["-user", "12345"]).expect("parse");
        let ExprKind::And { lhs, .. } = ctx.expr.kind() else {
            panic!("expected implicit print");
        };
        let ExprKind::Uid { cmp } = lhs.kind() else {
            panic!("expected a uid test");
        };
        assert_eq!(cmp.value, 12345);
    }

    #[test]
    fn unknown_user_is_an_error() {
        assert!(matches!(
            parse(&["-user", "no_such_user_zzz"]),
            Err(ParseError::UnknownUser(_))
        ));
    }

    #[test]
    fn regex_anchors_both_ends() {
        let ctx = parse(&["-regex", ".*needle"]).expect("parse");
        let ExprKind::And { lhs, .. } = ctx.expr.kind() else {
            panic!("expected implicit print");
        };
        let ExprKind::Regex { regex, .. } = lhs.kind() else {
            panic!("expected a regex test");
        };
        assert!(regex.is_match(b"path/to/needle"));
        assert!(!regex.is_match(b"path/to/needle.txt"));
    }

    #[test]
    fn bad_regex_is_reported_at_parse_time() {
        assert!(matches!(
            parse(&["-regex", "("]),
            Err(ParseError::Regex { .. })
        ));
    }

    #[test]
    fn bad_printf_format_is_reported_at_parse_time() {
        assert!(matches!(
            parse(&["-printf", "%q"]),
            Err(ParseError::Format(_))
        ));
    }
}
