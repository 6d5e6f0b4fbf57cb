//! Project-directory scanner
//!
//! Peripheral collaborator that feeds the static memory layer a bounded
//! view of the project tree. The trait is the contract; [`WalkdirScanner`]
//! is the default implementation, capped to the same depth and fan-out the
//! tree outline renders.

use std::path::Path;

use walkdir::WalkDir;

use crate::error::Result;
use crate::memory::TreeNode;

/// Capability that produces a project tree for L1 memory
pub trait ProjectScanner: Send + Sync {
    fn scan(&self, root: &Path) -> Result<TreeNode>;
}

/// Directories never worth recording
const PRUNED_DIRS: [&str; 4] = ["target", "node_modules", "dist", "build"];

/// Default scanner over the filesystem
#[derive(Debug, Clone)]
pub struct WalkdirScanner {
    pub max_depth: usize,
    /// Children recorded per directory; the rest are counted as truncated
    pub max_children: usize,
}

impl Default for WalkdirScanner {
    fn default() -> Self {
        Self {
            max_depth: 3,
            max_children: 10,
        }
    }
}

impl ProjectScanner for WalkdirScanner {
    fn scan(&self, root: &Path) -> Result<TreeNode> {
        let root_name = root
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| root.to_string_lossy().into_owned());
        let mut tree = TreeNode::dir(root_name);

        let walker = WalkDir::new(root)
            .min_depth(1)
            .max_depth(self.max_depth)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| {
                let name = entry.file_name().to_string_lossy();
                !name.starts_with('.') && !PRUNED_DIRS.contains(&name.as_ref())
            });

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::debug!(error = %e, "skipping unreadable entry");
                    continue;
                }
            };
            let Ok(relative) = entry.path().strip_prefix(root) else {
                continue;
            };
            insert_path(&mut tree, relative, entry.file_type().is_dir(), self.max_children);
        }

        Ok(tree)
    }
}

/// Insert a relative path into the tree, descending by component. Once a
/// directory has recorded `max_children` entries, further direct children
/// only bump its truncated count.
fn insert_path(tree: &mut TreeNode, relative: &Path, is_dir: bool, max_children: usize) {
    let components: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();

    let mut node = tree;
    for (index, component) in components.iter().enumerate() {
        let last = index == components.len() - 1;

        let position = node.children.iter().position(|c| &c.name == component);
        match position {
            Some(position) => {
                node = &mut node.children[position];
            }
            None if last => {
                if node.children.len() >= max_children {
                    node.truncated += 1;
                    return;
                }
                let child = if is_dir {
                    TreeNode::dir(component.clone())
                } else {
                    TreeNode::file(component.clone())
                };
                node.children.push(child);
                return;
            }
            None => {
                // parent was truncated away; nothing to attach under
                return;
            }
        }
    }
}
