use std::collections::VecDeque;
use std::ffi::OsString;
use std::fs;
use std::io;
use std::marker::PhantomData;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use bitflags::bitflags;
use rustc_hash::FxHashSet;
use tracing::debug;

use crate::error::WalkError;
use crate::event::{FileKind, StatFlags, Visit, WalkEvent};

/// What the callback wants the traversal to do next.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WalkAction {
    /// Keep walking.
    Continue,
    /// Skip the current entry's children.
    Prune,
    /// Stop the traversal immediately.
    Stop,
}

bitflags! {
    /// Flags that control traversal behaviour.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct WalkFlags: u16 {
        /// Fetch metadata for every entry up front.
        const STAT = 1 << 0;
        /// Keep walking after recoverable errors.
        const RECOVER = 1 << 1;
        /// Deliver post-order visits for directories.
        const DEPTH = 1 << 2;
        /// Follow symbolic links given as starting paths.
        const COMFOLLOW = 1 << 3;
        /// Follow all symbolic links.
        const LOGICAL = 1 << 4;
        /// Detect directory cycles introduced by symbolic links.
        const DETECT_CYCLES = 1 << 5;
        /// Skip mount points and everything below them.
        const MOUNT = 1 << 6;
        /// Visit mount points but do not descend into them.
        const XDEV = 1 << 7;
        /// Sort directory entries before visiting them.
        const SORT = 1 << 8;
    }
}

/// Tree search strategies.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Strategy {
    /// Breadth-first search.
    Bfs,
    /// Depth-first search.
    Dfs,
    /// Iterative deepening search.
    Ids,
}

impl Strategy {
    /// An upper-case name for debug dumps.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Bfs => "BFS",
            Self::Dfs => "DFS",
            Self::Ids => "IDS",
        }
    }
}

/// Configuration for [`walk`].
#[derive(Clone, Debug)]
pub struct WalkOptions {
    /// Behaviour flags.
    pub flags: WalkFlags,
    /// Search strategy.
    pub strategy: Strategy,
    /// The maximum number of file descriptors the traversal may keep open.
    pub nopenfd: usize,
}

impl Default for WalkOptions {
    fn default() -> Self {
        Self {
            flags: WalkFlags::RECOVER | WalkFlags::SORT,
            strategy: Strategy::Bfs,
            nopenfd: 4096,
        }
    }
}

/// Walks `paths`, invoking `callback` for every visit.
///
/// The callback steers the traversal through its [`WalkAction`] return
/// value. Recoverable filesystem failures are delivered as events with
/// [`WalkEvent::error`] set; [`WalkError`] is returned only when recovery is
/// impossible or disabled.
pub fn walk<'w, F>(
    paths: &'w [PathBuf],
    options: &WalkOptions,
    callback: F,
) -> Result<(), WalkError>
where
    F: FnMut(&WalkEvent<'w>) -> WalkAction,
{
    match options.strategy {
        Strategy::Bfs | Strategy::Dfs => walk_frames(paths, options, callback),
        Strategy::Ids => walk_ids(paths, options, callback),
    }
}

struct Frame<'w> {
    path: PathBuf,
    root: &'w Path,
    depth: usize,
    parent: Option<usize>,
    open: usize,
    read: bool,
    id: Option<(u64, u64)>,
}

struct Traversal<'w, F> {
    flags: WalkFlags,
    fifo: bool,
    callback: F,
    frames: Vec<Frame<'w>>,
    ready: VecDeque<usize>,
    stopped: bool,
}

fn walk_frames<'w, F>(
    paths: &'w [PathBuf],
    options: &WalkOptions,
    callback: F,
) -> Result<(), WalkError>
where
    F: FnMut(&WalkEvent<'w>) -> WalkAction,
{
    let mut traversal = Traversal {
        flags: options.flags,
        fifo: options.strategy == Strategy::Bfs,
        callback,
        frames: Vec::new(),
        ready: VecDeque::new(),
        stopped: false,
    };

    for root in paths {
        traversal.visit_root(root.as_path())?;
        if traversal.stopped {
            return Ok(());
        }
        if !traversal.fifo {
            traversal.drain()?;
            if traversal.stopped {
                return Ok(());
            }
        }
    }
    traversal.drain()
}

impl<'w, F> Traversal<'w, F>
where
    F: FnMut(&WalkEvent<'w>) -> WalkAction,
{
    fn stat_flags_for(&self, depth: usize) -> StatFlags {
        if self.flags.contains(WalkFlags::LOGICAL) {
            StatFlags::TRYFOLLOW
        } else if self.flags.contains(WalkFlags::COMFOLLOW) && depth == 0 {
            StatFlags::TRYFOLLOW
        } else {
            StatFlags::NOFOLLOW
        }
    }

    fn need_ids(&self) -> bool {
        self.flags
            .intersects(WalkFlags::MOUNT | WalkFlags::XDEV | WalkFlags::DETECT_CYCLES)
    }

    fn visit_root(&mut self, root: &'w Path) -> Result<(), WalkError> {
        let flags = self.stat_flags_for(0);
        let mut event = WalkEvent::new(
            root.to_path_buf(),
            root,
            0,
            Visit::Pre,
            FileKind::Unknown,
            flags,
        );

        match fs::symlink_metadata(root) {
            Ok(metadata) => {
                event.kind = FileKind::from_metadata(&metadata);
                event.lstat_cache.prime(Ok(metadata));
                if flags.follows() && event.kind == FileKind::Link {
                    if let Ok(kind) = event.kind_with(flags) {
                        event.kind = kind;
                    }
                }
            }
            Err(error) => {
                let code = error.raw_os_error();
                let event = event.with_error(error);
                if (self.callback)(&event) == WalkAction::Stop {
                    self.stopped = true;
                    return Ok(());
                }
                if !self.flags.contains(WalkFlags::RECOVER) {
                    let source = match code {
                        Some(code) => io::Error::from_raw_os_error(code),
                        None => io::Error::new(io::ErrorKind::Other, "inspection failed"),
                    };
                    return Err(WalkError::root(root.to_path_buf(), source));
                }
                return Ok(());
            }
        }

        let id = self
            .need_ids()
            .then(|| event.stat(flags).ok().map(|md| (md.dev(), md.ino())))
            .flatten();

        match (self.callback)(&event) {
            WalkAction::Stop => self.stopped = true,
            WalkAction::Prune => {}
            WalkAction::Continue => {
                if event.kind == FileKind::Dir {
                    let index = self.push_frame(event.path.clone(), root, 0, None, id);
                    self.ready.push_back(index);
                }
            }
        }
        Ok(())
    }

    fn push_frame(
        &mut self,
        path: PathBuf,
        root: &'w Path,
        depth: usize,
        parent: Option<usize>,
        id: Option<(u64, u64)>,
    ) -> usize {
        debug!(path = %path.display(), depth, "descending");
        if let Some(parent) = parent {
            self.frames[parent].open += 1;
        }
        self.frames.push(Frame {
            path,
            root,
            depth,
            parent,
            open: 0,
            read: false,
            id,
        });
        self.frames.len() - 1
    }

    fn drain(&mut self) -> Result<(), WalkError> {
        while !self.stopped {
            let index = if self.fifo {
                self.ready.pop_front()
            } else {
                self.ready.pop_back()
            };
            let Some(index) = index else { break };
            self.read_frame(index)?;
        }
        Ok(())
    }

    fn read_frame(&mut self, index: usize) -> Result<(), WalkError> {
        let (path, root, dir_depth) = {
            let frame = &self.frames[index];
            (frame.path.clone(), frame.root, frame.depth)
        };
        let depth = dir_depth + 1;

        let reader = match fs::read_dir(&path) {
            Ok(reader) => reader,
            Err(error) => {
                return self.fail_frame(index, path, root, dir_depth, error);
            }
        };

        let mut children: Vec<(OsString, Option<fs::FileType>)> = Vec::new();
        let mut read_error = None;
        for entry in reader {
            match entry {
                Ok(entry) => children.push((entry.file_name(), entry.file_type().ok())),
                Err(error) => {
                    read_error = Some(error);
                    break;
                }
            }
        }
        if let Some(error) = read_error {
            return self.fail_frame(index, path, root, dir_depth, error);
        }
        if self.flags.contains(WalkFlags::SORT) {
            children.sort_by(|a, b| a.0.cmp(&b.0));
        }

        let mut spawned = Vec::new();
        for (name, file_type) in children {
            let child_path = path.join(&name);
            let flags = self.stat_flags_for(depth);
            let kind = match file_type {
                Some(file_type) => FileKind::from_file_type(file_type),
                None => match fs::symlink_metadata(&child_path) {
                    Ok(metadata) => FileKind::from_metadata(&metadata),
                    Err(error) => {
                        let event =
                            WalkEvent::new(child_path, root, depth, Visit::Pre, FileKind::Unknown, flags)
                                .with_error(error);
                        if (self.callback)(&event) == WalkAction::Stop {
                            self.stopped = true;
                            return Ok(());
                        }
                        continue;
                    }
                },
            };

            let mut event = WalkEvent::new(child_path, root, depth, Visit::Pre, kind, flags);
            if flags.follows() && event.kind == FileKind::Link {
                if let Ok(kind) = event.kind_with(flags) {
                    event.kind = kind;
                }
            }

            let mut id = None;
            if event.kind == FileKind::Dir && self.need_ids() {
                id = event.stat(flags).ok().map(|md| (md.dev(), md.ino()));

                if self.flags.contains(WalkFlags::MOUNT) && self.crosses_device(index, id) {
                    debug!(path = %event.path.display(), "skipping mount point");
                    continue;
                }
                if self.flags.contains(WalkFlags::DETECT_CYCLES) && self.is_cycle(index, id) {
                    let event = event.with_error(io::Error::new(
                        io::ErrorKind::Other,
                        "filesystem cycle detected",
                    ));
                    if (self.callback)(&event) == WalkAction::Stop {
                        self.stopped = true;
                        return Ok(());
                    }
                    continue;
                }
            }

            match (self.callback)(&event) {
                WalkAction::Stop => {
                    self.stopped = true;
                    return Ok(());
                }
                WalkAction::Prune => {}
                WalkAction::Continue => {
                    if event.kind == FileKind::Dir && !self.blocks_descent(index, id) {
                        let child =
                            self.push_frame(event.path.clone(), root, depth, Some(index), id);
                        spawned.push(child);
                    }
                }
            }
        }

        if self.fifo {
            self.ready.extend(spawned);
        } else {
            self.ready.extend(spawned.into_iter().rev());
        }

        self.frames[index].read = true;
        if self.frames[index].open == 0 {
            self.close_chain(index, true);
        }
        Ok(())
    }

    /// Delivers an error event for a directory that could not be read, then
    /// settles its place in the post-order bookkeeping.
    fn fail_frame(
        &mut self,
        index: usize,
        path: PathBuf,
        root: &'w Path,
        depth: usize,
        error: io::Error,
    ) -> Result<(), WalkError> {
        let code = error.raw_os_error();
        let flags = self.stat_flags_for(depth);
        let event = WalkEvent::new(path.clone(), root, depth, Visit::Pre, FileKind::Dir, flags)
            .with_error(error);
        if (self.callback)(&event) == WalkAction::Stop {
            self.stopped = true;
            return Ok(());
        }
        if !self.flags.contains(WalkFlags::RECOVER) {
            let source = match code {
                Some(code) => io::Error::from_raw_os_error(code),
                None => io::Error::new(io::ErrorKind::Other, "read failed"),
            };
            return Err(WalkError::read_dir(path, source));
        }
        self.frames[index].read = true;
        if self.frames[index].open == 0 {
            self.close_chain(index, false);
        }
        Ok(())
    }

    fn crosses_device(&self, parent: usize, id: Option<(u64, u64)>) -> bool {
        match (self.frames[parent].id, id) {
            (Some((parent_dev, _)), Some((dev, _))) => parent_dev != dev,
            _ => false,
        }
    }

    fn is_cycle(&self, parent: usize, id: Option<(u64, u64)>) -> bool {
        let Some(id) = id else { return false };
        let mut current = Some(parent);
        while let Some(index) = current {
            if self.frames[index].id == Some(id) {
                return true;
            }
            current = self.frames[index].parent;
        }
        false
    }

    fn blocks_descent(&self, parent: usize, id: Option<(u64, u64)>) -> bool {
        self.flags.contains(WalkFlags::XDEV) && self.crosses_device(parent, id)
    }

    /// Emits post-order visits for every finished directory from `index` up
    /// towards the root of the frame chain.
    fn close_chain(&mut self, mut index: usize, mut emit_self: bool) {
        loop {
            if emit_self && self.flags.contains(WalkFlags::DEPTH) {
                let (path, root, depth) = {
                    let frame = &self.frames[index];
                    (frame.path.clone(), frame.root, frame.depth)
                };
                let flags = self.stat_flags_for(depth);
                let event = WalkEvent::new(path, root, depth, Visit::Post, FileKind::Dir, flags);
                if (self.callback)(&event) == WalkAction::Stop {
                    self.stopped = true;
                    return;
                }
            }
            emit_self = true;

            match self.frames[index].parent {
                Some(parent) => {
                    self.frames[parent].open -= 1;
                    if self.frames[parent].read && self.frames[parent].open == 0 {
                        index = parent;
                    } else {
                        break;
                    }
                }
                None => break,
            }
        }
    }
}

struct IdsState<'w, F> {
    flags: WalkFlags,
    callback: F,
    pruned: FxHashSet<PathBuf>,
    stopped: bool,
    _paths: PhantomData<&'w ()>,
}

/// Iterative deepening: repeated bounded scans, emitting only the frontier
/// depth of each round. With [`WalkFlags::DEPTH`], a second sequence of
/// rounds runs the frontier back from the deepest level to the roots,
/// delivering the post-order visits.
fn walk_ids<'w, F>(
    paths: &'w [PathBuf],
    options: &WalkOptions,
    callback: F,
) -> Result<(), WalkError>
where
    F: FnMut(&WalkEvent<'w>) -> WalkAction,
{
    let mut state = IdsState {
        flags: options.flags,
        callback,
        pruned: FxHashSet::default(),
        stopped: false,
        _paths: PhantomData,
    };

    let mut limit = 0;
    let mut max_depth = 0;
    loop {
        let mut frontier = false;
        for root in paths {
            let mut ancestors = Vec::new();
            state.round(
                root.to_path_buf(),
                root.as_path(),
                0,
                limit,
                Visit::Pre,
                &mut frontier,
                &mut ancestors,
                None,
            )?;
            if state.stopped {
                return Ok(());
            }
        }
        if !frontier {
            break;
        }
        max_depth = limit;
        limit += 1;
    }

    if options.flags.contains(WalkFlags::DEPTH) {
        for limit in (0..=max_depth).rev() {
            let mut frontier = false;
            for root in paths {
                let mut ancestors = Vec::new();
                state.round(
                    root.to_path_buf(),
                    root.as_path(),
                    0,
                    limit,
                    Visit::Post,
                    &mut frontier,
                    &mut ancestors,
                    None,
                )?;
                if state.stopped {
                    return Ok(());
                }
            }
        }
    }
    Ok(())
}

impl<'w, F> IdsState<'w, F>
where
    F: FnMut(&WalkEvent<'w>) -> WalkAction,
{
    fn stat_flags_for(&self, depth: usize) -> StatFlags {
        if self.flags.contains(WalkFlags::LOGICAL) {
            StatFlags::TRYFOLLOW
        } else if self.flags.contains(WalkFlags::COMFOLLOW) && depth == 0 {
            StatFlags::TRYFOLLOW
        } else {
            StatFlags::NOFOLLOW
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn round(
        &mut self,
        path: PathBuf,
        root: &'w Path,
        depth: usize,
        limit: usize,
        phase: Visit,
        frontier: &mut bool,
        ancestors: &mut Vec<(u64, u64)>,
        parent_dev: Option<u64>,
    ) -> Result<(), WalkError> {
        let flags = self.stat_flags_for(depth);
        let metadata = match fs::symlink_metadata(&path) {
            Ok(metadata) => metadata,
            Err(error) => {
                if depth == limit && phase == Visit::Pre {
                    *frontier = true;
                    let event =
                        WalkEvent::new(path, root, depth, Visit::Pre, FileKind::Unknown, flags)
                            .with_error(error);
                    if (self.callback)(&event) == WalkAction::Stop {
                        self.stopped = true;
                    }
                }
                return Ok(());
            }
        };

        let mut event = WalkEvent::new(path, root, depth, phase, FileKind::from_metadata(&metadata), flags);
        let id = (metadata.dev(), metadata.ino());
        event.lstat_cache.prime(Ok(metadata));
        if flags.follows() && event.kind == FileKind::Link {
            if let Ok(kind) = event.kind_with(flags) {
                event.kind = kind;
            }
        }

        if depth == limit {
            *frontier = true;
            if phase == Visit::Post && self.pruned.contains(&event.path) {
                return Ok(());
            }
            match (self.callback)(&event) {
                WalkAction::Stop => self.stopped = true,
                WalkAction::Prune => {
                    if phase == Visit::Pre {
                        self.pruned.insert(event.path.clone());
                    }
                }
                WalkAction::Continue => {}
            }
            return Ok(());
        }

        if event.kind != FileKind::Dir || self.pruned.contains(&event.path) {
            return Ok(());
        }
        if self.flags.contains(WalkFlags::MOUNT) || self.flags.contains(WalkFlags::XDEV) {
            if let Some(parent_dev) = parent_dev {
                if parent_dev != id.0 {
                    return Ok(());
                }
            }
        }
        if self.flags.contains(WalkFlags::DETECT_CYCLES) && ancestors.contains(&id) {
            return Ok(());
        }

        let reader = match fs::read_dir(&event.path) {
            Ok(reader) => reader,
            Err(error) => {
                // A directory that stops being readable mid-search surfaces
                // once, in the round that would have visited its contents.
                if depth + 1 == limit && phase == Visit::Pre {
                    let event = event.with_error(error);
                    if (self.callback)(&event) == WalkAction::Stop {
                        self.stopped = true;
                    }
                }
                return Ok(());
            }
        };

        let mut names: Vec<OsString> = Vec::new();
        for entry in reader.flatten() {
            names.push(entry.file_name());
        }
        if self.flags.contains(WalkFlags::SORT) {
            names.sort();
        }

        ancestors.push(id);
        let dir_path = event.path.clone();
        for name in names {
            self.round(
                dir_path.join(&name),
                root,
                depth + 1,
                limit,
                phase,
                frontier,
                ancestors,
                Some(id.0),
            )?;
            if self.stopped {
                break;
            }
        }
        ancestors.pop();
        Ok(())
    }
}
