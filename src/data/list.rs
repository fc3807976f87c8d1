use std::collections::HashMap;

use super::item::{test_path_to_name, TestItem, TestPath, ROOT_NAME};
use crate::{Error, Result};

/// Key a framework's streamed result is resolved by within one framework.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ReportKey {
    executable: String,
    report_id: String,
}

/// `framework_id -> (executable, report_id) -> path` lookup for leaves.
#[derive(Debug, Clone, Default)]
pub struct RunIdIndex {
    frameworks: HashMap<String, HashMap<ReportKey, TestPath>>,
}

impl RunIdIndex {
    /// Build the index by a full traversal of `root`.
    pub fn build(root: &TestItem) -> Self {
        let mut index = RunIdIndex::default();
        let mut path = Vec::new();
        index.add_subtree(root, &mut path);
        index
    }

    fn add_subtree(&mut self, item: &TestItem, path: &mut TestPath) {
        match &item.children {
            None => self.insert(item, path.clone()),
            Some(children) => {
                for child in children.values() {
                    path.push(child.name.clone());
                    self.add_subtree(child, path);
                    path.pop();
                }
            }
        }
    }

    pub fn insert(&mut self, item: &TestItem, path: TestPath) {
        let key = Self::key_for(item);
        let previous = self
            .frameworks
            .entry(item.framework_id.clone())
            .or_default()
            .insert(key, path);
        if let Some(previous) = previous {
            tracing::warn!(
                "report id '{}' of {} already mapped to {}; keeping the newer test",
                item.effective_report_id(),
                item.full_name,
                test_path_to_name(&previous),
            );
        }
    }

    /// Drop the entry for `item` if it still points at `path`.
    pub fn remove(&mut self, item: &TestItem, path: &[String]) {
        let key = Self::key_for(item);
        if let Some(entries) = self.frameworks.get_mut(&item.framework_id) {
            if entries.get(&key).is_some_and(|p| p.as_slice() == path) {
                entries.remove(&key);
            }
        }
    }

    pub fn find(&self, framework_id: &str, executable: &str, report_id: &str) -> Option<&TestPath> {
        let key = ReportKey {
            executable: executable.to_string(),
            report_id: report_id.to_string(),
        };
        self.frameworks.get(framework_id)?.get(&key)
    }

    pub fn len(&self) -> usize {
        self.frameworks.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every indexed path, in no particular order.
    pub fn paths(&self) -> impl Iterator<Item = &TestPath> {
        self.frameworks.values().flat_map(HashMap::values)
    }

    fn key_for(item: &TestItem) -> ReportKey {
        ReportKey {
            executable: item.location.as_ref().map(|l| l.executable.clone()).unwrap_or_default(),
            report_id: item.effective_report_id().to_string(),
        }
    }
}

/// The test tree together with its run-id index.
#[derive(Debug, Clone)]
pub struct TestList {
    root: TestItem,
    index: RunIdIndex,
}

impl Default for TestList {
    fn default() -> Self {
        Self::new()
    }
}

impl TestList {
    pub fn new() -> Self {
        Self {
            root: TestItem::group(ROOT_NAME, ROOT_NAME),
            index: RunIdIndex::default(),
        }
    }

    /// Adopt an existing tree (e.g. loaded from disk) and index it.
    pub fn from_root(mut root: TestItem) -> Self {
        if root.children.is_none() {
            root.children = Some(Default::default());
        }
        let index = RunIdIndex::build(&root);
        Self { root, index }
    }

    pub fn root(&self) -> &TestItem {
        &self.root
    }

    pub fn index(&self) -> &RunIdIndex {
        &self.index
    }

    pub fn is_empty(&self) -> bool {
        self.root.children.as_ref().map_or(true, |c| c.is_empty())
    }

    /// Walk child maps along `path`. The empty path is the root.
    pub fn find(&self, path: &[String]) -> Option<&TestItem> {
        let mut item = &self.root;
        for segment in path {
            item = item.children.as_ref()?.get(segment)?;
        }
        Some(item)
    }

    pub fn find_mut(&mut self, path: &[String]) -> Option<&mut TestItem> {
        let mut item = &mut self.root;
        for segment in path {
            item = item.children.as_mut()?.get_mut(segment)?;
        }
        Some(item)
    }

    pub fn find_by_report_id(&self, framework_id: &str, executable: &str, report_id: &str) -> Option<&TestPath> {
        self.index.find(framework_id, executable, report_id)
    }

    /// Insert `item` as the leaf at `path`, creating intermediate groups as needed.
    /// An existing leaf at `path` is replaced.
    pub fn insert_or_update(&mut self, path: &[String], item: TestItem) -> Result<()> {
        let Some((leaf_name, parents)) = path.split_last() else {
            return Err(Error::PathConflict(String::new()));
        };

        let mut parent = &mut self.root;
        for (i, segment) in parents.iter().enumerate() {
            let children = parent
                .children
                .as_mut()
                .ok_or_else(|| Error::PathConflict(test_path_to_name(path)))?;
            parent = children
                .entry(segment.clone())
                .or_insert_with(|| TestItem::group(segment.clone(), test_path_to_name(&path[..=i])));
        }

        let children = parent
            .children
            .as_mut()
            .ok_or_else(|| Error::PathConflict(test_path_to_name(path)))?;
        if children.get(leaf_name).is_some_and(|existing| !existing.is_leaf()) {
            return Err(Error::PathConflict(test_path_to_name(path)));
        }

        if let Some(previous) = children.get(leaf_name) {
            self.index.remove(previous, path);
        }
        self.index.insert(&item, path.to_vec());
        children.insert(leaf_name.clone(), item);
        Ok(())
    }

    /// Recompute every group on the way from the root to `path`, bottom-up,
    /// from direct children only.
    pub fn recompute_ancestors(&mut self, path: &[String]) {
        fn walk(item: &mut TestItem, path: &[String]) {
            if let Some((head, rest)) = path.split_first() {
                match item.children.as_mut().and_then(|c| c.get_mut(head)) {
                    Some(child) => walk(child, rest),
                    None => return,
                }
            }
            item.recompute_status();
        }

        walk(&mut self.root, path);
    }

    /// Recompute every group in the tree, bottom-up.
    pub fn recompute_all(&mut self) {
        self.root.recompute_subtree();
    }

    /// Full names of every leaf, in tree order.
    pub fn list_all_leaves(&self) -> Vec<String> {
        let mut names = Vec::new();
        self.for_each_leaf(|_, item| names.push(item.full_name.clone()));
        names
    }

    /// Visit every leaf together with its path.
    pub fn for_each_leaf<F: FnMut(&[String], &TestItem)>(&self, mut f: F) {
        fn walk<F: FnMut(&[String], &TestItem)>(item: &TestItem, path: &mut TestPath, f: &mut F) {
            match &item.children {
                None => f(path, item),
                Some(children) => {
                    for child in children.values() {
                        path.push(child.name.clone());
                        walk(child, path, f);
                        path.pop();
                    }
                }
            }
        }

        let mut path = Vec::new();
        walk(&self.root, &mut path, &mut f);
    }

    /// Apply `f` to every leaf of the tree.
    pub fn for_each_leaf_mut<F: FnMut(&mut TestItem)>(&mut self, mut f: F) {
        self.root.visit_leaves_mut(&mut f);
    }
}
