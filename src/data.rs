//
// Copyright (c) The sysrepo2-rs Core Contributors
//
// SPDX-License-Identifier: MIT
//

//! Owned YANG data trees.
//!
//! [`DataTree`] is the language-native representation of engine data: a
//! configuration snapshot handed to module-change callbacks, the payload
//! returned by operational-data callbacks, RPC input/output parameters and
//! notification contents. Unlike the engine's own trees it owns all of its
//! memory, so it may be kept across callback invocations and moved into
//! asynchronous tasks freely.
//!
//! Nodes are ordered. For user-ordered lists and leaf-lists the insertion
//! anchor names the sibling instance that *precedes* the node once the
//! operation completes; an empty anchor (`Some("")`) means "first" and
//! `None` means plain append.

use crate::error::{Error, Result};
use crate::value::DataValue;
use crate::xpath::{self, Segment};

/// A single data node: leaf, leaf-list instance, container or list instance.
#[derive(Clone, Debug, PartialEq)]
pub struct DataNode {
    prefix: Option<String>,
    name: String,
    /// List-instance key predicates, empty for plain nodes.
    predicates: Vec<(String, String)>,
    value: Option<DataValue>,
    children: Vec<DataNode>,
}

impl DataNode {
    fn new(segment: &Segment) -> DataNode {
        let mut node = DataNode {
            prefix: segment.prefix.clone(),
            name: segment.name.clone(),
            predicates: Vec::new(),
            value: None,
            children: Vec::new(),
        };
        for (key, val) in &segment.predicates {
            if key == "." {
                // Leaf-list instance, the predicate is the value itself.
                node.value = Some(DataValue::String(val.clone()));
            } else {
                node.predicates.push((key.clone(), val.clone()));
                node.children.push(DataNode {
                    prefix: None,
                    name: key.clone(),
                    predicates: Vec::new(),
                    value: Some(DataValue::String(val.clone())),
                    children: Vec::new(),
                });
            }
        }
        node
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }

    pub fn value(&self) -> Option<&DataValue> {
        self.value.as_ref()
    }

    pub fn children(&self) -> &[DataNode] {
        &self.children
    }

    /// The bracketed instance selector of this node (list keys, or the
    /// leaf-list value for keyless instances with siblings of same name).
    pub fn predicate_string(&self) -> String {
        let mut out = String::new();
        for (key, value) in &self.predicates {
            out.push_str(&format!("[{}='{}']", key, value));
        }
        out
    }

    fn step_string(&self) -> String {
        let mut out = String::new();
        if let Some(prefix) = &self.prefix {
            out.push_str(prefix);
            out.push(':');
        }
        out.push_str(&self.name);
        out.push_str(&self.predicate_string());
        out
    }

    fn matches(&self, segment: &Segment) -> bool {
        if self.name != segment.name {
            return false;
        }
        if let (Some(a), Some(b)) = (&self.prefix, &segment.prefix) {
            if a != b {
                return false;
            }
        }
        for (key, value) in &segment.predicates {
            if key == "." {
                let canonical = match &self.value {
                    Some(v) => v.to_canonical(),
                    None => return false,
                };
                if &canonical != value {
                    return false;
                }
            } else {
                match self.predicates.iter().find(|(k, _)| k == key) {
                    Some((_, v)) if v == value => (),
                    _ => return false,
                }
            }
        }
        true
    }

    /// Whether `anchor` designates this node as a preceding sibling: either
    /// its key predicate string (lists) or its canonical value (leaf-lists).
    fn matches_anchor(&self, anchor: &str) -> bool {
        if !self.predicates.is_empty() {
            return self.predicate_string() == anchor;
        }
        match &self.value {
            Some(v) => v.to_canonical() == anchor,
            None => false,
        }
    }
}

/// An ordered tree of data nodes.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DataTree {
    roots: Vec<DataNode>,
}

impl DataTree {
    pub fn new() -> DataTree {
        DataTree { roots: Vec::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    pub fn roots(&self) -> &[DataNode] {
        &self.roots
    }

    /// Find the first node matching the given path.
    pub fn get(&self, xpath: &str) -> Option<&DataNode> {
        let segments = xpath::split(xpath).ok()?;
        let mut nodes = &self.roots;
        let mut found = None;
        for segment in &segments {
            found = nodes.iter().find(|n| n.matches(segment));
            match found {
                Some(node) => nodes = &node.children,
                None => return None,
            }
        }
        found
    }

    /// Value of the leaf at the given path, if any.
    pub fn get_value(&self, xpath: &str) -> Option<&DataValue> {
        self.get(xpath).and_then(|n| n.value.as_ref())
    }

    /// Create or update the node at the given path, creating intermediate
    /// nodes as needed. List-instance keys named in the path predicates are
    /// materialized as key leaves.
    pub fn set(&mut self, xpath: &str, value: Option<DataValue>) -> Result<()> {
        self.set_ordered(xpath, value, None)
    }

    /// Same as [`DataTree::set`] but positions the final node among its
    /// same-named siblings: `Some("")` first, `Some(anchor)` right after the
    /// instance designated by the anchor, `None` at the end.
    pub fn set_ordered(
        &mut self,
        xpath: &str,
        value: Option<DataValue>,
        after: Option<&str>,
    ) -> Result<()> {
        let segments = xpath::split(xpath)?;
        let mut nodes = &mut self.roots;
        let last = segments.len() - 1;
        for (depth, segment) in segments.iter().enumerate() {
            let pos = nodes.iter().position(|n| n.matches(segment));
            let pos = match pos {
                Some(pos) => pos,
                None => {
                    let node = DataNode::new(segment);
                    if depth == last {
                        let at = insert_position(nodes, &node.name, after);
                        nodes.insert(at, node);
                        at
                    } else {
                        nodes.push(node);
                        nodes.len() - 1
                    }
                }
            };
            if depth == last {
                let node = &mut nodes[pos];
                if value.is_some() {
                    node.value = value;
                }
                if after.is_some() {
                    reposition(nodes, pos, after);
                }
                return Ok(());
            }
            nodes = &mut nodes[pos].children;
        }
        unreachable!()
    }

    /// Delete every node matching the given path. Missing nodes are not an
    /// error; deletion of config that is already gone is a no-op.
    pub fn delete(&mut self, xpath: &str) -> Result<()> {
        let segments = xpath::split(xpath)?;
        Self::delete_in(&mut self.roots, &segments);
        Ok(())
    }

    fn delete_in(nodes: &mut Vec<DataNode>, segments: &[Segment]) {
        let (segment, rest) = match segments.split_first() {
            Some(split) => split,
            None => return,
        };
        if rest.is_empty() {
            nodes.retain(|n| !n.matches(segment));
        } else {
            for node in nodes.iter_mut().filter(|n| n.matches(segment)) {
                Self::delete_in(&mut node.children, rest);
            }
        }
    }

    /// Move a (leaf-)list instance relative to its same-named siblings.
    pub fn move_item(&mut self, xpath: &str, after: Option<&str>) -> Result<()> {
        let segments = xpath::split(xpath)?;
        let (last, parents) = segments.split_last().unwrap();
        let mut nodes = &mut self.roots;
        for segment in parents {
            let pos = nodes
                .iter()
                .position(|n| n.matches(segment))
                .ok_or_else(|| {
                    Error::not_found(format!("no such node: {}", xpath))
                })?;
            nodes = &mut nodes[pos].children;
        }
        let pos = nodes.iter().position(|n| n.matches(last)).ok_or_else(
            || Error::not_found(format!("no such node: {}", xpath)),
        )?;
        reposition(nodes, pos, after);
        Ok(())
    }

    /// Merge another tree into this one. Nodes are matched by name and
    /// instance selector; on leaf conflicts the other tree wins.
    pub fn merge(&mut self, other: DataTree) {
        for node in other.roots {
            Self::merge_node(&mut self.roots, node);
        }
    }

    fn merge_node(nodes: &mut Vec<DataNode>, incoming: DataNode) {
        let same_name = nodes
            .iter()
            .filter(|n| n.name == incoming.name && n.prefix == incoming.prefix)
            .count();
        let existing = nodes.iter_mut().find(|n| {
            n.name == incoming.name
                && n.prefix == incoming.prefix
                && n.predicates == incoming.predicates
                && match (&n.value, &incoming.value) {
                    (None, _) | (_, None) => true,
                    // Differing values merge as a leaf overwrite only when
                    // the target is the sole instance of its name; multiple
                    // instances mean a leaf-list, where a new value is a new
                    // instance.
                    (Some(a), Some(b)) => {
                        a == b || (n.predicates.is_empty() && same_name == 1)
                    }
                }
        });
        match existing {
            Some(node) => {
                if incoming.value.is_some() {
                    node.value = incoming.value;
                }
                for child in incoming.children {
                    Self::merge_node(&mut node.children, child);
                }
            }
            None => nodes.push(incoming),
        }
    }

    /// Flatten the tree into `(path, value)` pairs in document order.
    pub fn paths(&self) -> Vec<(String, Option<DataValue>)> {
        let mut out = Vec::new();
        for node in &self.roots {
            Self::collect(node, "", &mut out);
        }
        out
    }

    fn collect(
        node: &DataNode,
        base: &str,
        out: &mut Vec<(String, Option<DataValue>)>,
    ) {
        let path = format!("{}/{}", base, node.step_string());
        out.push((path.clone(), node.value.clone()));
        for child in &node.children {
            Self::collect(child, &path, out);
        }
    }
}

impl std::fmt::Display for DataTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (path, value) in self.paths() {
            match value {
                Some(value) => writeln!(f, "{} = {}", path, value)?,
                None => writeln!(f, "{}", path)?,
            }
        }
        Ok(())
    }
}

/// Position at which a new sibling named `name` should be inserted.
fn insert_position(
    nodes: &[DataNode],
    name: &str,
    after: Option<&str>,
) -> usize {
    match after {
        None | Some("") => {
            let first = nodes.iter().position(|n| n.name == name);
            match (after, first) {
                // First instance of its name, or unordered append.
                (Some(""), Some(first)) => first,
                _ => nodes.len(),
            }
        }
        Some(anchor) => {
            match nodes
                .iter()
                .position(|n| n.name == name && n.matches_anchor(anchor))
            {
                Some(pos) => pos + 1,
                None => nodes.len(),
            }
        }
    }
}

fn reposition(nodes: &mut Vec<DataNode>, pos: usize, after: Option<&str>) {
    let node = nodes.remove(pos);
    let at = insert_position(nodes, &node.name, after);
    nodes.insert(at, node);
}
