//! The static region hierarchy.
//!
//! The tree is built once from a region list (the downloadable-content
//! catalogue: ids, parents, sizes, bounding boxes, remote data
//! versions). It carries no download state; that lives with the model
//! and is recomputed against this structure on demand.

use std::collections::HashMap;

use thiserror::Error;

use crate::coord::{distance_sq, LatLon, Rect};

/// One row of the region list used to build a [`RegionTree`].
#[derive(Debug, Clone)]
pub struct RegionSpec {
    /// Stable unique id, e.g. `"France_Provence"`.
    pub id: String,
    /// Parent region id; `None` for a root.
    pub parent: Option<String>,
    /// Display name. Not authoritative; never used as a key.
    pub name: String,
    /// Remote file size in bytes. Zero for pure group nodes.
    pub size_bytes: u64,
    /// Bounding box for location lookup, when known.
    pub rect: Option<Rect>,
    /// Remote data version advertised by the region list.
    pub remote_version: u64,
}

impl RegionSpec {
    /// A leaf region with a bounding box.
    pub fn leaf(
        id: impl Into<String>,
        parent: Option<&str>,
        size_bytes: u64,
        rect: Rect,
        remote_version: u64,
    ) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            parent: parent.map(str::to_string),
            size_bytes,
            rect: Some(rect),
            remote_version,
        }
    }

    /// A group node with no file of its own.
    pub fn group(id: impl Into<String>, parent: Option<&str>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            parent: parent.map(str::to_string),
            size_bytes: 0,
            rect: None,
            remote_version: 0,
        }
    }
}

/// Region-list consistency errors found while building the tree.
#[derive(Debug, Error)]
pub enum TreeError {
    #[error("duplicate region id: {0}")]
    DuplicateId(String),

    #[error("region {child} references unknown parent {parent}")]
    UnknownParent { child: String, parent: String },
}

/// A node of the built tree.
#[derive(Debug)]
pub struct RegionNode {
    pub id: String,
    pub parent: Option<String>,
    pub name: String,
    pub size_bytes: u64,
    pub rect: Option<Rect>,
    pub remote_version: u64,
    children: Vec<usize>,
}

/// The immutable region hierarchy.
#[derive(Debug)]
pub struct RegionTree {
    nodes: Vec<RegionNode>,
    index: HashMap<String, usize>,
    roots: Vec<usize>,
}

impl RegionTree {
    /// Builds the tree, validating ids and parent links.
    pub fn build(specs: Vec<RegionSpec>) -> Result<Self, TreeError> {
        let mut nodes = Vec::with_capacity(specs.len());
        let mut index = HashMap::with_capacity(specs.len());

        for spec in specs {
            if index.contains_key(&spec.id) {
                return Err(TreeError::DuplicateId(spec.id));
            }
            index.insert(spec.id.clone(), nodes.len());
            nodes.push(RegionNode {
                id: spec.id,
                parent: spec.parent,
                name: spec.name,
                size_bytes: spec.size_bytes,
                rect: spec.rect,
                remote_version: spec.remote_version,
                children: Vec::new(),
            });
        }

        let mut roots = Vec::new();
        for i in 0..nodes.len() {
            match nodes[i].parent.clone() {
                Some(parent_id) => {
                    let parent_ix =
                        *index
                            .get(&parent_id)
                            .ok_or_else(|| TreeError::UnknownParent {
                                child: nodes[i].id.clone(),
                                parent: parent_id.clone(),
                            })?;
                    nodes[parent_ix].children.push(i);
                }
                None => roots.push(i),
            }
        }

        Ok(Self {
            nodes,
            index,
            roots,
        })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&RegionNode> {
        self.index.get(id).map(|&ix| &self.nodes[ix])
    }

    /// Whether the region has no children (and so carries its own file).
    pub fn is_leaf(&self, id: &str) -> bool {
        self.get(id).is_some_and(|n| n.children.is_empty())
    }

    /// Direct children of `parent`, or the roots when `parent` is
    /// `None`. One level only; callers page through the tree.
    pub fn children(&self, parent: Option<&str>) -> Vec<&RegionNode> {
        let indices = match parent {
            None => &self.roots,
            Some(id) => match self.index.get(id) {
                Some(&ix) => &self.nodes[ix].children,
                None => return Vec::new(),
            },
        };
        indices.iter().map(|&ix| &self.nodes[ix]).collect()
    }

    /// Number of direct children.
    pub fn child_count(&self, id: &str) -> usize {
        self.get(id).map_or(0, |n| n.children.len())
    }

    /// Number of leaf descendants (1 for a leaf itself).
    pub fn total_child_count(&self, id: &str) -> usize {
        self.leaf_descendants(id).len()
    }

    /// All leaf descendants of a node, the node itself when it is a
    /// leaf. Depth-first, stable order.
    pub fn leaf_descendants(&self, id: &str) -> Vec<&RegionNode> {
        let Some(&start) = self.index.get(id) else {
            return Vec::new();
        };
        let mut result = Vec::new();
        let mut stack = vec![start];
        while let Some(ix) = stack.pop() {
            let node = &self.nodes[ix];
            if node.children.is_empty() {
                result.push(node);
            } else {
                // Reverse keeps depth-first order stable.
                stack.extend(node.children.iter().rev());
            }
        }
        result
    }

    /// The leaf whose bounding box contains the point, nearest box
    /// center winning when boxes overlap.
    pub fn find_by_location(&self, p: LatLon) -> Option<&RegionNode> {
        self.nodes
            .iter()
            .filter(|n| n.children.is_empty())
            .filter(|n| n.rect.is_some_and(|r| r.contains(p)))
            .min_by(|a, b| {
                let da = distance_sq(p, a.rect.unwrap().center());
                let db = distance_sq(p, b.rect.unwrap().center());
                da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
            })
    }

    /// The leaf with the nearest box center, containment not required.
    /// Used for migration prefetch where "somewhere sensible" beats
    /// "nothing".
    pub fn nearest_leaf(&self, p: LatLon) -> Option<&RegionNode> {
        self.find_by_location(p).or_else(|| {
            self.nodes
                .iter()
                .filter(|n| n.children.is_empty() && n.rect.is_some())
                .min_by(|a, b| {
                    let da = distance_sq(p, a.rect.unwrap().center());
                    let db = distance_sq(p, b.rect.unwrap().center());
                    da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
                })
        })
    }
}
