//! Compare the live node graph against a snapshot tree.
//!
//! The walk merges each directory's current entries with the snapshot's
//! listing in name order. Subtrees that are still backed by the same object
//! as the snapshot are skipped without fetching anything. Subdirectories may
//! be compared on worker threads; results flow into a [`DiffSink`] that must
//! tolerate concurrent callers.
//!
//! A diff only reads. Damaged overlay records are reported through
//! [`DiffSink::diff_error`] and left on disk for `fsck`; the walk never
//! falls back to the origin object the way filesystem operations do.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use tracing::{debug, instrument};

use crate::graph::{Entry, NodeGraph};
use crate::ignore::IgnorePolicy;
use crate::model::{join_path, NodeId, ObjectHash, TreeEntry, ROOT_NODE_ID};
use crate::{Error, Result};

pub mod status;

pub use status::{FileStatus, ScmStatus, StatusCollector};

/// Receives the outcome of a diff. Called from several threads at once when
/// the walk runs in parallel.
pub trait DiffSink: Send + Sync {
    fn record(&self, path: &str, status: FileStatus);

    /// `path` could not be compared; nothing below it was reported.
    fn diff_error(&self, path: &str, err: &anyhow::Error);
}

/// Cooperative cancellation for a running diff, checked between subtrees.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct DiffOptions {
    /// Report untracked paths matched by the ignore policy as `Ignored`
    /// instead of leaving them out.
    pub include_ignored: bool,
    /// Upper bound on threads comparing subtrees, including the caller's.
    pub workers: usize,
    pub cancel: CancellationToken,
}

impl Default for DiffOptions {
    fn default() -> Self {
        Self {
            include_ignored: false,
            workers: 1,
            cancel: CancellationToken::new(),
        }
    }
}

/// Diff the graph rooted at the root node against the tree `snapshot`.
///
/// Failures below the root are passed to [`DiffSink::diff_error`] and the
/// walk continues. Fails only if the root itself cannot be compared or the
/// walk was cancelled.
#[instrument(skip_all, fields(snapshot = %snapshot, include_ignored = options.include_ignored))]
pub fn diff(
    graph: &NodeGraph,
    snapshot: ObjectHash,
    options: &DiffOptions,
    ignore: &dyn IgnorePolicy,
    sink: &dyn DiffSink,
) -> Result<()> {
    let walk = Walk {
        graph,
        ignore,
        sink,
        include_ignored: options.include_ignored,
        cancel: &options.cancel,
        spare_workers: AtomicUsize::new(options.workers.saturating_sub(1)),
    };

    let root = graph.dir_node(ROOT_NODE_ID)?;
    let unchanged = {
        let contents = root.contents.read();
        !contents.materialized && contents.origin == Some(snapshot)
    };
    if unchanged {
        debug!("root unchanged since snapshot");
        return Ok(());
    }

    let children = walk.visit(Job::Node {
        path: String::new(),
        dir: ROOT_NODE_ID,
        snapshot: Some(snapshot),
        ignored: false,
    })?;
    thread::scope(|scope| {
        for job in children {
            walk.dispatch(scope, job);
        }
    });

    if options.cancel.is_cancelled() {
        return Err(Error::Cancelled.into());
    }
    Ok(())
}

/// Diff for a status report: collect everything into an [`ScmStatus`].
pub fn diff_for_status(
    graph: &NodeGraph,
    snapshot: ObjectHash,
    options: &DiffOptions,
    ignore: &dyn IgnorePolicy,
) -> Result<ScmStatus> {
    let collector = StatusCollector::new();
    diff(graph, snapshot, options, ignore, &collector)?;
    Ok(collector.into_status())
}

/// A directory still to be compared.
enum Job {
    /// Live directory from the graph.
    Node {
        path: String,
        dir: NodeId,
        snapshot: Option<ObjectHash>,
        ignored: bool,
    },
    /// Directory unchanged since it was read from the store as `working`.
    Tree {
        path: String,
        working: ObjectHash,
        snapshot: Option<ObjectHash>,
        ignored: bool,
    },
    /// Directory present only in the snapshot.
    Removed { path: String, tree: ObjectHash },
}

impl Job {
    fn path(&self) -> &str {
        match self {
            Job::Node { path, .. } | Job::Tree { path, .. } | Job::Removed { path, .. } => path,
        }
    }
}

/// Where the live side of an entry keeps its content.
#[derive(Debug, Clone, Copy)]
enum Source {
    Object(ObjectHash),
    Node(NodeId),
}

struct Working {
    name: String,
    mode: u32,
    source: Source,
}

impl Working {
    fn is_dir(&self) -> bool {
        crate::model::is_dir_mode(self.mode)
    }

    fn from_entry(name: String, entry: &Entry) -> Option<Self> {
        let source = match (entry.object_hash(), entry.id) {
            (Some(hash), _) => Source::Object(hash),
            (None, Some(id)) => Source::Node(id),
            (None, None) => return None,
        };
        Some(Self {
            name,
            mode: entry.mode,
            source,
        })
    }

    fn from_tree(entry: &TreeEntry) -> Self {
        Self {
            name: entry.name.clone(),
            mode: entry.mode,
            source: Source::Object(entry.hash),
        }
    }
}

struct Walk<'a> {
    graph: &'a NodeGraph,
    ignore: &'a dyn IgnorePolicy,
    sink: &'a dyn DiffSink,
    include_ignored: bool,
    cancel: &'a CancellationToken,
    spare_workers: AtomicUsize,
}

impl<'a> Walk<'a> {
    fn dispatch<'scope, 'env>(&'env self, scope: &'scope thread::Scope<'scope, 'env>, job: Job)
    where
        'a: 'env,
    {
        let claimed = self
            .spare_workers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if claimed {
            scope.spawn(move || {
                self.run(scope, job);
                self.spare_workers.fetch_add(1, Ordering::SeqCst);
            });
        } else {
            self.run(scope, job);
        }
    }

    fn run<'scope, 'env>(&'env self, scope: &'scope thread::Scope<'scope, 'env>, job: Job)
    where
        'a: 'env,
    {
        if self.cancel.is_cancelled() {
            return;
        }
        let path = job.path().to_string();
        match self.visit(job) {
            Ok(children) => {
                for child in children {
                    self.dispatch(scope, child);
                }
            }
            Err(e) => self.sink.diff_error(&path, &e),
        }
    }

    /// Compare one directory, reporting leaves and returning the
    /// subdirectories that still need a look.
    fn visit(&self, job: Job) -> Result<Vec<Job>> {
        let store = self.graph.store();
        let mut jobs = Vec::new();
        match job {
            Job::Node {
                path,
                dir,
                snapshot,
                ignored,
            } => {
                let mut working = Vec::new();
                for (name, entry) in self.graph.entries_strict(dir)? {
                    match Working::from_entry(name, &entry) {
                        Some(w) => working.push(w),
                        None => {
                            // Only reachable if a record lost an entry's id.
                            let err = anyhow::Error::from(Error::Corruption {
                                node: dir,
                                reason: "materialized entry without a node id".into(),
                            });
                            self.sink.diff_error(&path, &err);
                        }
                    }
                }
                let snapshot = match snapshot {
                    Some(hash) => store.get_tree(&hash)?.entries().to_vec(),
                    None => Vec::new(),
                };
                self.compare(&path, working, &snapshot, ignored, &mut jobs);
            }
            Job::Tree {
                path,
                working,
                snapshot,
                ignored,
            } => {
                let working: Vec<Working> = store
                    .get_tree(&working)?
                    .entries()
                    .iter()
                    .map(Working::from_tree)
                    .collect();
                let snapshot = match snapshot {
                    Some(hash) => store.get_tree(&hash)?.entries().to_vec(),
                    None => Vec::new(),
                };
                self.compare(&path, working, &snapshot, ignored, &mut jobs);
            }
            Job::Removed { path, tree } => {
                for entry in store.get_tree(&tree)?.entries() {
                    self.removed(join_path(&path, &entry.name), entry, &mut jobs);
                }
            }
        }
        Ok(jobs)
    }

    fn compare(
        &self,
        dir_path: &str,
        working: Vec<Working>,
        snapshot: &[TreeEntry],
        ignored: bool,
        jobs: &mut Vec<Job>,
    ) {
        let mut working = working.into_iter().peekable();
        let mut snapshot = snapshot.iter().peekable();

        loop {
            let order = match (working.peek(), snapshot.peek()) {
                (None, None) => break,
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (Some(w), Some(s)) => w.name.as_str().cmp(s.name.as_str()),
            };
            match order {
                std::cmp::Ordering::Less => {
                    if let Some(w) = working.next() {
                        let path = join_path(dir_path, &w.name);
                        self.untracked(path, &w, ignored, jobs);
                    }
                }
                std::cmp::Ordering::Greater => {
                    if let Some(s) = snapshot.next() {
                        self.removed(join_path(dir_path, &s.name), s, jobs);
                    }
                }
                std::cmp::Ordering::Equal => {
                    if let (Some(w), Some(s)) = (working.next(), snapshot.next()) {
                        self.both(join_path(dir_path, &w.name), &w, s, jobs);
                    }
                }
            }
        }
    }

    fn both(&self, path: String, working: &Working, snapshot: &TreeEntry, jobs: &mut Vec<Job>) {
        match (working.is_dir(), snapshot.is_dir()) {
            (true, true) => match working.source {
                Source::Object(hash) if hash == snapshot.hash => {}
                Source::Object(hash) => jobs.push(Job::Tree {
                    path,
                    working: hash,
                    snapshot: Some(snapshot.hash),
                    ignored: false,
                }),
                Source::Node(dir) => jobs.push(Job::Node {
                    path,
                    dir,
                    snapshot: Some(snapshot.hash),
                    ignored: false,
                }),
            },
            (false, false) => match self.file_changed(working, snapshot) {
                Ok(true) => self.sink.record(&path, FileStatus::Modified),
                Ok(false) => {}
                Err(e) => self.sink.diff_error(&path, &e),
            },
            (true, false) => {
                self.sink.record(&path, FileStatus::Removed);
                self.untracked(path, working, false, jobs);
            }
            (false, true) => {
                self.untracked(path.clone(), working, false, jobs);
                jobs.push(Job::Removed {
                    path,
                    tree: snapshot.hash,
                });
            }
        }
    }

    fn file_changed(&self, working: &Working, snapshot: &TreeEntry) -> Result<bool> {
        if working.mode != snapshot.mode {
            return Ok(true);
        }
        match working.source {
            Source::Object(hash) => Ok(hash != snapshot.hash),
            Source::Node(id) => {
                let current = self.graph.read_file_strict(id)?;
                let original = self.graph.store().get_blob(&snapshot.hash)?;
                Ok(current != original.contents)
            }
        }
    }

    /// A live entry with no snapshot counterpart.
    fn untracked(
        &self,
        path: String,
        working: &Working,
        parent_ignored: bool,
        jobs: &mut Vec<Job>,
    ) {
        let is_dir = working.is_dir();
        let ignored = parent_ignored || self.ignore.is_ignored(&path, is_dir);
        if ignored && !self.include_ignored {
            return;
        }
        if !is_dir {
            let status = if ignored {
                FileStatus::Ignored
            } else {
                FileStatus::Added
            };
            self.sink.record(&path, status);
            return;
        }
        jobs.push(match working.source {
            Source::Object(hash) => Job::Tree {
                path,
                working: hash,
                snapshot: None,
                ignored,
            },
            Source::Node(dir) => Job::Node {
                path,
                dir,
                snapshot: None,
                ignored,
            },
        });
    }

    /// A snapshot entry with no live counterpart.
    fn removed(&self, path: String, entry: &TreeEntry, jobs: &mut Vec<Job>) {
        if entry.is_dir() {
            jobs.push(Job::Removed {
                path,
                tree: entry.hash,
            });
        } else {
            self.sink.record(&path, FileStatus::Removed);
        }
    }
}
