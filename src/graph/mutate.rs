//! Structural changes to the node graph: creating, removing and moving
//! entries. Every mutation materializes the directories it touches first.

use std::sync::Arc;

use tracing::debug;

use super::{DirContents, DirNode, Entry, NodeGraph, NodeRef, ParentEdge};
use crate::model::{validate_name, NodeId, S_IFDIR, S_IFLNK, S_IFMT, S_IFREG};
use crate::overlay::{NodeMetadata, OverlayDir};
use crate::{Error, Result};

const MAX_ATTEMPTS: usize = 16;

enum Initial<'a> {
    Contents(&'a [u8]),
    EmptyDir,
}

enum Outcome {
    Applied(Option<Entry>),
    Raced,
}

impl NodeGraph {
    /// Create an empty regular file. Modes without type bits become regular
    /// files.
    pub fn create(&self, dir: NodeId, name: &str, mode: u32) -> Result<NodeRef> {
        let mode = if mode & S_IFMT == 0 { S_IFREG | mode } else { mode };
        if mode & S_IFMT == S_IFDIR {
            return self.mkdir(dir, name, mode);
        }
        self.insert_node(dir, name, mode, Initial::Contents(&[]))
    }

    pub fn mkdir(&self, dir: NodeId, name: &str, mode: u32) -> Result<NodeRef> {
        self.insert_node(dir, name, S_IFDIR | (mode & 0o7777), Initial::EmptyDir)
    }

    /// Create a symlink whose record holds `target`.
    pub fn symlink(&self, dir: NodeId, name: &str, target: &str) -> Result<NodeRef> {
        self.insert_node(
            dir,
            name,
            S_IFLNK | 0o777,
            Initial::Contents(target.as_bytes()),
        )
    }

    fn insert_node(
        &self,
        dir: NodeId,
        name: &str,
        mode: u32,
        init: Initial<'_>,
    ) -> Result<NodeRef> {
        // A name that is already taken fails before anything is materialized.
        if self.get_child(dir, name)?.is_some() {
            return Err(Error::AlreadyExists(self.describe(dir, name)).into());
        }
        self.materialize_directory(dir)?;
        let node = self.dir_node(dir)?;

        let mut contents = node.contents.write();
        if contents.unlinked {
            return Err(Error::NotFound(format!("node {dir}")).into());
        }
        if contents.entries.contains_key(name) {
            return Err(Error::AlreadyExists(self.describe(dir, name)).into());
        }

        let id = self.ids.next();
        match init {
            Initial::Contents(data) => self.overlay.create_file(id, data)?,
            Initial::EmptyDir => self.overlay.save_dir(id, &OverlayDir::default())?,
        }
        self.overlay.set_metadata(id, &NodeMetadata::now(mode))?;

        contents
            .entries
            .insert(name.to_string(), Entry::materialized(mode, id));
        if let Err(e) = self.overlay.save_dir(dir, &contents.to_overlay()) {
            contents.entries.remove(name);
            let _ = self.overlay.remove_record(id);
            return Err(e);
        }

        if mode & S_IFMT == S_IFDIR {
            self.dirs
                .insert(id, Arc::new(DirNode::new(id, DirContents::empty_materialized())));
        }
        self.parents.insert(
            id,
            ParentEdge {
                parent: dir,
                name: name.to_string(),
            },
        );
        debug!(parent = %dir, node = %id, name, mode, "created node");
        Ok(NodeRef { id, mode })
    }

    /// Remove a non-directory entry.
    pub fn unlink(&self, dir: NodeId, name: &str) -> Result<()> {
        validate_name(name)?;
        self.materialize_directory(dir)?;
        let node = self.dir_node(dir)?;

        let mut contents = node.contents.write();
        let entry = match contents.entries.get(name) {
            None => return Err(Error::NotFound(self.describe(dir, name)).into()),
            Some(e) if e.is_dir() => {
                return Err(Error::IsADirectory(self.describe(dir, name)).into())
            }
            Some(e) => e.clone(),
        };
        contents.entries.remove(name);
        if let Err(e) = self.overlay.save_dir(dir, &contents.to_overlay()) {
            contents.entries.insert(name.to_string(), entry);
            return Err(e);
        }
        if let Some(id) = entry.id {
            self.parents
                .remove_if(&id, |_, edge| edge.parent == dir && edge.name == name);
        }
        drop(contents);

        if let (Some(id), true) = (entry.id, entry.is_materialized()) {
            self.overlay.remove_record(id)?;
        }
        debug!(parent = %dir, name, "unlinked");
        Ok(())
    }

    /// Remove an empty directory.
    pub fn rmdir(&self, dir: NodeId, name: &str) -> Result<()> {
        validate_name(name)?;
        self.materialize_directory(dir)?;
        let parent = self.dir_node(dir)?;

        for _ in 0..MAX_ATTEMPTS {
            let child_ref = self
                .get_child(dir, name)?
                .ok_or_else(|| Error::NotFound(self.describe(dir, name)))?;
            if !child_ref.is_dir() {
                return Err(Error::NotADirectory(self.describe(dir, name)).into());
            }
            let child = self.dir_node(child_ref.id)?;

            {
                let mut cc = child.contents.write();
                if cc.unlinked {
                    continue;
                }
                if !cc.entries.is_empty() {
                    return Err(Error::NotEmpty(self.describe(dir, name)).into());
                }
                cc.unlinked = true;
            }

            let mut pc = parent.contents.write();
            let entry = match pc.entries.get(name) {
                Some(e) if e.id == Some(child_ref.id) => e.clone(),
                _ => {
                    drop(pc);
                    child.contents.write().unlinked = false;
                    continue;
                }
            };
            pc.entries.remove(name);
            if let Err(e) = self.overlay.save_dir(dir, &pc.to_overlay()) {
                pc.entries.insert(name.to_string(), entry);
                drop(pc);
                child.contents.write().unlinked = false;
                return Err(e);
            }
            self.parents.remove(&child_ref.id);
            self.dirs.remove(&child_ref.id);
            drop(pc);

            if entry.is_materialized() {
                self.overlay.remove_record(child_ref.id)?;
            }
            debug!(parent = %dir, node = %child_ref.id, name, "removed directory");
            return Ok(());
        }
        Err(Error::Storage(format!(
            "{} kept changing during rmdir",
            self.describe(dir, name)
        ))
        .into())
    }

    /// Move `src_dir/src_name` to `dst_dir/dst_name`, replacing a compatible
    /// destination (a file over a file, or a directory over an empty
    /// directory).
    pub fn rename(
        &self,
        src_dir: NodeId,
        src_name: &str,
        dst_dir: NodeId,
        dst_name: &str,
    ) -> Result<()> {
        validate_name(src_name)?;
        validate_name(dst_name)?;
        self.materialize_directory(src_dir)?;
        self.materialize_directory(dst_dir)?;

        for _ in 0..MAX_ATTEMPTS {
            let src = self
                .get_child(src_dir, src_name)?
                .ok_or_else(|| Error::NotFound(self.describe(src_dir, src_name)))?;

            let _moving = (src.is_dir() && src_dir != dst_dir).then(|| self.dir_move.lock());
            if src.is_dir() && self.is_ancestor(src.id, dst_dir) {
                return Err(Error::InvalidRename(format!(
                    "cannot move {} inside itself",
                    self.describe(src_dir, src_name)
                ))
                .into());
            }

            let replaced = self.get_child(dst_dir, dst_name)?;
            if let Some(r) = replaced {
                if r.id == src.id {
                    return Ok(());
                }
                match (src.is_dir(), r.is_dir()) {
                    (false, true) => {
                        return Err(Error::IsADirectory(self.describe(dst_dir, dst_name)).into())
                    }
                    (true, false) => {
                        return Err(Error::NotADirectory(self.describe(dst_dir, dst_name)).into())
                    }
                    _ => {}
                }
            }

            // A replaced directory must be empty; it is retired before the
            // parents are locked.
            let replaced_dir = match replaced.filter(|r| r.is_dir()) {
                Some(r) => Some(self.dir_node(r.id)?),
                None => None,
            };
            if let Some(node) = &replaced_dir {
                let mut c = node.contents.write();
                if c.unlinked {
                    continue;
                }
                if !c.entries.is_empty() {
                    return Err(Error::NotEmpty(self.describe(dst_dir, dst_name)).into());
                }
                c.unlinked = true;
            }
            let restore_replaced = || {
                if let Some(node) = &replaced_dir {
                    node.contents.write().unlinked = false;
                }
            };

            let expected = Expected {
                src: src.id,
                replaced: replaced.map(|r| r.id),
            };
            let outcome = if src_dir == dst_dir {
                self.rename_within(src_dir, src_name, dst_name, &expected)
            } else {
                self.rename_across(src_dir, src_name, dst_dir, dst_name, &expected)
            };

            match outcome {
                Ok(Outcome::Applied(old)) => {
                    if let Some(old) = old {
                        self.retire_replaced(old)?;
                    }
                    debug!(
                        node = %src.id,
                        from = %self.describe(src_dir, src_name),
                        to = %self.describe(dst_dir, dst_name),
                        "renamed"
                    );
                    return Ok(());
                }
                Ok(Outcome::Raced) => {
                    restore_replaced();
                    continue;
                }
                Err(e) => {
                    restore_replaced();
                    return Err(e);
                }
            }
        }
        Err(Error::Storage(format!(
            "{} kept changing during rename",
            self.describe(src_dir, src_name)
        ))
        .into())
    }

    fn rename_within(
        &self,
        dir: NodeId,
        src_name: &str,
        dst_name: &str,
        expected: &Expected,
    ) -> Result<Outcome> {
        let node = self.dir_node(dir)?;
        let mut contents = node.contents.write();
        if contents.unlinked {
            return Err(Error::NotFound(format!("node {dir}")).into());
        }
        if !expected.matches(&contents, src_name, &contents, dst_name) {
            return Ok(Outcome::Raced);
        }

        let Some(entry) = contents.entries.remove(src_name) else {
            return Ok(Outcome::Raced);
        };
        let old = contents.entries.insert(dst_name.to_string(), entry.clone());
        if let Err(e) = self.overlay.save_dir(dir, &contents.to_overlay()) {
            contents.entries.remove(dst_name);
            if let Some(old) = old {
                contents.entries.insert(dst_name.to_string(), old);
            }
            contents.entries.insert(src_name.to_string(), entry);
            return Err(e);
        }
        self.relink(expected, dir, dst_name);
        Ok(Outcome::Applied(old))
    }

    fn rename_across(
        &self,
        src_dir: NodeId,
        src_name: &str,
        dst_dir: NodeId,
        dst_name: &str,
        expected: &Expected,
    ) -> Result<Outcome> {
        let src_node = self.dir_node(src_dir)?;
        let dst_node = self.dir_node(dst_dir)?;

        // Fixed global order: lower id first.
        let (mut src, mut dst) = if src_dir < dst_dir {
            let src = src_node.contents.write();
            (src, dst_node.contents.write())
        } else {
            let dst = dst_node.contents.write();
            (src_node.contents.write(), dst)
        };

        if src.unlinked {
            return Err(Error::NotFound(format!("node {src_dir}")).into());
        }
        if dst.unlinked {
            return Err(Error::NotFound(format!("node {dst_dir}")).into());
        }
        if !expected.matches(&src, src_name, &dst, dst_name) {
            return Ok(Outcome::Raced);
        }

        let Some(entry) = src.entries.remove(src_name) else {
            return Ok(Outcome::Raced);
        };
        let old = dst.entries.insert(dst_name.to_string(), entry.clone());

        let saved = self
            .overlay
            .save_dir(dst_dir, &dst.to_overlay())
            .and_then(|()| self.overlay.save_dir(src_dir, &src.to_overlay()));
        if let Err(e) = saved {
            dst.entries.remove(dst_name);
            if let Some(old) = old {
                dst.entries.insert(dst_name.to_string(), old);
            }
            src.entries.insert(src_name.to_string(), entry);
            let _ = self.overlay.save_dir(dst_dir, &dst.to_overlay());
            return Err(e);
        }
        self.relink(expected, dst_dir, dst_name);
        Ok(Outcome::Applied(old))
    }

    /// Point the moved node's edge at its new home and drop the replaced
    /// node's edge. Called with the directory locks still held.
    fn relink(&self, expected: &Expected, dir: NodeId, name: &str) {
        if let Some(old) = expected.replaced {
            self.parents.remove(&old);
        }
        self.parents.insert(
            expected.src,
            ParentEdge {
                parent: dir,
                name: name.to_string(),
            },
        );
    }

    fn retire_replaced(&self, old: Entry) -> Result<()> {
        let Some(id) = old.id else {
            return Ok(());
        };
        if old.is_dir() {
            self.dirs.remove(&id);
        }
        if old.is_materialized() {
            self.overlay.remove_record(id)?;
        }
        Ok(())
    }
}

/// What a rename saw before taking the directory locks.
struct Expected {
    src: NodeId,
    replaced: Option<NodeId>,
}

impl Expected {
    fn matches(
        &self,
        src: &DirContents,
        src_name: &str,
        dst: &DirContents,
        dst_name: &str,
    ) -> bool {
        let src_ok = src
            .entries
            .get(src_name)
            .is_some_and(|e| e.id == Some(self.src));
        let dst_ok = match (dst.entries.get(dst_name), self.replaced) {
            (None, None) => true,
            (Some(e), Some(id)) => e.id == Some(id),
            _ => false,
        };
        src_ok && dst_ok
    }
}
