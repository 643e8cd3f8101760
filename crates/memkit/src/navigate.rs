//! Path navigation.
//!
//! Resolves a path string, component by component, to an inode: `.` is
//! consumed, `..` pops the canonical stack and follows the directory's
//! parent pointer, regular names are looked up in the current directory's
//! entry map, and symlinks splice their target into the remaining
//! components (absolute targets restart from the root). A per-call set of
//! already-expanded symlinks turns cycles into `ELOOP`. Every traversed
//! directory must grant search permission to the caller; uid 0 bypasses all
//! checks.

use std::collections::HashSet;

use crate::error::{err, Errno, Result};
use crate::flags::Access;
use crate::inodes::InodeTable;
use crate::node::{Ino, NodeKind};

/// Everything the walk needs from the owning volume.
pub(crate) struct NavCtx<'a> {
    pub table: &'a InodeTable,
    pub root: Ino,
    pub cwd: Ino,
    pub cwd_stack: &'a [String],
    pub uid: u32,
    pub gid: u32,
}

/// Result of a walk.
#[derive(Debug)]
pub(crate) struct Resolved {
    /// Directory containing the target (the deepest directory reached).
    pub dir: Ino,
    /// The target inode, when the full path resolved.
    pub target: Option<Ino>,
    /// Final component name ("" when the target is the root).
    pub name: String,
    /// Components left unconsumed after a missing intermediate; empty means
    /// only the final component was missing (callers may create it).
    pub remaining: Vec<String>,
    /// Canonical components from the filesystem root to the target.
    pub stack: Vec<String>,
}

/// Split a path into components, dropping empty segments.
pub(crate) fn split_path(path: &str) -> Vec<String> {
    path.split('/')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

pub(crate) fn navigate(
    ctx: &NavCtx<'_>,
    path: &str,
    resolve_last: bool,
    syscall: &'static str,
) -> Result<Resolved> {
    if path.is_empty() {
        return Err(err(Errno::ENOENT, syscall).with_path(path));
    }

    let mut visited: HashSet<Ino> = HashSet::new();
    let (mut cur, mut stack) = if path.starts_with('/') {
        (ctx.root, Vec::new())
    } else {
        (ctx.cwd, ctx.cwd_stack.to_vec())
    };
    let mut parts = split_path(path);
    let mut i = 0;

    while i < parts.len() {
        let comp = parts[i].clone();
        if comp == "." {
            i += 1;
            continue;
        }
        if comp == ".." {
            check_search(ctx, cur, path, syscall)?;
            let node = ctx.table.get(cur).ok_or(stale(path, syscall))?;
            // `..` at the root is a no-op (the root is self-parented).
            cur = node.dir_parent().unwrap_or(cur);
            stack.pop();
            i += 1;
            continue;
        }

        check_search(ctx, cur, path, syscall)?;
        let node = ctx.table.get(cur).ok_or(stale(path, syscall))?;
        let entries = match &node.kind {
            NodeKind::Directory { entries, .. } => entries,
            _ => return Err(err(Errno::ENOTDIR, syscall).with_path(path)),
        };

        let last = i == parts.len() - 1;
        match entries.get(&comp) {
            None => {
                let remaining = parts[i + 1..].to_vec();
                stack.push(comp.clone());
                return Ok(Resolved {
                    dir: cur,
                    target: None,
                    name: comp,
                    remaining,
                    stack,
                });
            }
            Some(&ino) => {
                let found = ctx.table.get(ino).ok_or(stale(path, syscall))?;
                match &found.kind {
                    NodeKind::Symlink { target } => {
                        if last && !resolve_last {
                            stack.push(comp.clone());
                            return Ok(Resolved {
                                dir: cur,
                                target: Some(ino),
                                name: comp,
                                remaining: Vec::new(),
                                stack,
                            });
                        }
                        if !visited.insert(ino) {
                            return Err(err(Errno::ELOOP, syscall).with_path(path));
                        }
                        // Splice the link text in place of this component.
                        let mut spliced = split_path(target);
                        spliced.extend_from_slice(&parts[i + 1..]);
                        if target.starts_with('/') {
                            cur = ctx.root;
                            stack.clear();
                        }
                        parts = spliced;
                        i = 0;
                        continue;
                    }
                    NodeKind::Directory { .. } => {
                        cur = ino;
                        stack.push(comp);
                        i += 1;
                        continue;
                    }
                    NodeKind::File { .. } | NodeKind::CharDevice { .. } => {
                        if !last {
                            return Err(err(Errno::ENOTDIR, syscall).with_path(path));
                        }
                        stack.push(comp.clone());
                        return Ok(Resolved {
                            dir: cur,
                            target: Some(ino),
                            name: comp,
                            remaining: Vec::new(),
                            stack,
                        });
                    }
                }
            }
        }
    }

    // Every component consumed: the target is the directory we stand in.
    let node = ctx.table.get(cur).ok_or(stale(path, syscall))?;
    let dir = node.dir_parent().unwrap_or(cur);
    Ok(Resolved {
        dir,
        target: Some(cur),
        name: stack.last().cloned().unwrap_or_default(),
        remaining: Vec::new(),
        stack,
    })
}

fn check_search(ctx: &NavCtx<'_>, dir: Ino, path: &str, syscall: &'static str) -> Result<()> {
    if ctx.uid == 0 {
        return Ok(());
    }
    let node = ctx.table.get(dir).ok_or(stale(path, syscall))?;
    if node.is_dir() && !node.allows(ctx.uid, ctx.gid, Access::EXEC) {
        return Err(err(Errno::EACCES, syscall).with_path(path));
    }
    Ok(())
}

fn stale(path: &str, syscall: &'static str) -> crate::error::FsError {
    err(Errno::ENOENT, syscall).with_path(path)
}
