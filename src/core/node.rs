//! The package/file ownership tree and the visibility rules.
//!
//! Every package and file is a node in a single tree rooted at the build
//! directory's `src` root. Each node carries a privacy level; whether one
//! file may depend on another is decided by walking the target's ancestry
//! and progressively tightening an effective privacy level.

use std::collections::HashMap;

use crate::core::error::{BuildError, Origin};

/// Id of a node in the ownership tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

/// Privacy level of a node, in increasing strictness.
///
/// - `Public`: visible everywhere (subject to enclosing package privacy).
/// - `SemiProtected`: visible up to two ownership levels above the node.
/// - `Protected`: visible within the owning scope only.
/// - `Private`: nothing may depend on the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Privacy {
    Public,
    SemiProtected,
    Protected,
    Private,
}

impl Privacy {
    /// Parse a privacy keyword as it appears in a `contain` statement.
    pub fn parse(s: &str) -> Option<Privacy> {
        match s {
            "public" => Some(Privacy::Public),
            "semi-protected" => Some(Privacy::SemiProtected),
            "protected" => Some(Privacy::Protected),
            "private" => Some(Privacy::Private),
            _ => None,
        }
    }

    /// One step stricter. `Private` saturates.
    fn tightened(self) -> Privacy {
        match self {
            Privacy::Public => Privacy::SemiProtected,
            Privacy::SemiProtected => Privacy::Protected,
            Privacy::Protected => Privacy::Private,
            Privacy::Private => Privacy::Private,
        }
    }
}

/// What a node represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// A package, owning a build file and child nodes.
    Pkg,
    /// A file; the payload lives in the file table under this index.
    File(u32),
}

/// A node in the ownership tree.
#[derive(Debug)]
pub struct Node {
    pub name: String,
    /// Slash-joined trail from the tree root; unique. The root's is empty.
    pub trail: String,
    pub parent: Option<NodeId>,
    pub privacy: Privacy,
    pub children: Vec<NodeId>,
    pub kind: NodeKind,
    pub origin: Origin,
}

/// The ownership tree with its global trail index.
#[derive(Debug)]
pub struct NodeTree {
    nodes: Vec<Node>,
    by_trail: HashMap<String, NodeId>,
}

pub const ROOT: NodeId = NodeId(0);

impl NodeTree {
    pub fn new() -> Self {
        let root = Node {
            name: String::new(),
            trail: String::new(),
            parent: None,
            privacy: Privacy::Public,
            children: Vec::new(),
            kind: NodeKind::Pkg,
            origin: Origin::none(),
        };
        let mut by_trail = HashMap::new();
        by_trail.insert(String::new(), ROOT);
        NodeTree {
            nodes: vec![root],
            by_trail,
        }
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0 as usize]
    }

    pub fn lookup(&self, trail: &str) -> Option<NodeId> {
        self.by_trail.get(trail).copied()
    }

    /// Add a child node under `parent`. Trails must stay unique.
    pub fn add_child(
        &mut self,
        parent: NodeId,
        name: &str,
        privacy: Privacy,
        kind: NodeKind,
        origin: Origin,
    ) -> Result<NodeId, BuildError> {
        let parent_trail = &self.node(parent).trail;
        let trail = if parent_trail.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", parent_trail, name)
        };
        if self.by_trail.contains_key(&trail) {
            return Err(BuildError::config(
                &origin,
                format!("duplicate definition of {trail}"),
            ));
        }

        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Node {
            name: name.to_string(),
            trail: trail.clone(),
            parent: Some(parent),
            privacy,
            children: Vec::new(),
            kind,
            origin,
        });
        self.nodes[parent.0 as usize].children.push(id);
        self.by_trail.insert(trail, id);
        Ok(id)
    }

    /// True iff `other` is `node` or an ancestor of `node`.
    pub fn is_descendant_of(&self, node: NodeId, other: NodeId) -> bool {
        let mut cur = Some(node);
        while let Some(id) = cur {
            if id == other {
                return true;
            }
            cur = self.node(id).parent;
        }
        false
    }

    /// True iff `other` is a strict ancestor of `node`.
    pub fn is_strict_descendant_of(&self, node: NodeId, other: NodeId) -> bool {
        node != other && self.is_descendant_of(node, other)
    }

    /// The deepest node that is an ancestor-or-self of both arguments.
    pub fn common_ancestor_with(&self, a: NodeId, b: NodeId) -> NodeId {
        let mut ancestors = Vec::new();
        let mut cur = Some(a);
        while let Some(id) = cur {
            ancestors.push(id);
            cur = self.node(id).parent;
        }
        let mut cur = Some(b);
        while let Some(id) = cur {
            if ancestors.contains(&id) {
                return id;
            }
            cur = self.node(id).parent;
        }
        ROOT
    }

    /// The visibility walk.
    ///
    /// Starting from `node` with an effective privacy of `Public`, step
    /// toward the root. At each node: fail if the effective level has
    /// reached `Private`; succeed on reaching `other`; otherwise tighten the
    /// effective level by one step if it is already stricter than `Public`,
    /// then adopt the node's own privacy whenever it exceeds the effective
    /// level. Reaching past the root fails.
    pub fn is_visible_descendant_of(&self, node: NodeId, other: NodeId) -> bool {
        let mut effective = Privacy::Public;
        let mut cur = Some(node);
        while let Some(id) = cur {
            if effective == Privacy::Private {
                return false;
            }
            if id == other {
                return true;
            }
            if effective > Privacy::Public {
                effective = effective.tightened();
            }
            let own = self.node(id).privacy;
            if own > effective {
                effective = own;
            }
            cur = self.node(id).parent;
        }
        false
    }

    /// The nearest package that owns `node` (self when `node` is a package).
    pub fn owning_pkg(&self, node: NodeId) -> NodeId {
        let mut cur = node;
        loop {
            if matches!(self.node(cur).kind, NodeKind::Pkg) {
                return cur;
            }
            match self.node(cur).parent {
                Some(p) => cur = p,
                None => return ROOT,
            }
        }
    }

    /// Display name of a node for diagnostics: its trail, or `.` for the root.
    pub fn display_trail(&self, node: NodeId) -> &str {
        let trail = &self.node(node).trail;
        if trail.is_empty() {
            "."
        } else {
            trail
        }
    }
}

impl Default for NodeTree {
    fn default() -> Self {
        NodeTree::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pkg(tree: &mut NodeTree, parent: NodeId, name: &str, privacy: Privacy) -> NodeId {
        tree.add_child(parent, name, privacy, NodeKind::Pkg, Origin::none())
            .unwrap()
    }

    fn file(tree: &mut NodeTree, parent: NodeId, name: &str, privacy: Privacy) -> NodeId {
        tree.add_child(parent, name, privacy, NodeKind::File(0), Origin::none())
            .unwrap()
    }

    #[test]
    fn test_trails_unique() {
        let mut tree = NodeTree::new();
        let a = pkg(&mut tree, ROOT, "a", Privacy::Public);
        pkg(&mut tree, a, "b", Privacy::Public);
        assert!(tree
            .add_child(a, "b", Privacy::Public, NodeKind::Pkg, Origin::none())
            .is_err());
        assert_eq!(tree.lookup("a/b"), Some(NodeId(2)));
    }

    #[test]
    fn test_common_ancestor() {
        let mut tree = NodeTree::new();
        let a = pkg(&mut tree, ROOT, "a", Privacy::Public);
        let ab = pkg(&mut tree, a, "b", Privacy::Public);
        let ac = pkg(&mut tree, a, "c", Privacy::Public);
        let d = pkg(&mut tree, ROOT, "d", Privacy::Public);

        assert_eq!(tree.common_ancestor_with(ab, ac), a);
        assert_eq!(tree.common_ancestor_with(ab, d), ROOT);
        assert_eq!(tree.common_ancestor_with(ab, a), a);
    }

    #[test]
    fn test_public_visible_everywhere() {
        let mut tree = NodeTree::new();
        let a = pkg(&mut tree, ROOT, "a", Privacy::Public);
        let deep = pkg(&mut tree, a, "b", Privacy::Public);
        let f = file(&mut tree, deep, "y.h", Privacy::Public);
        assert!(tree.is_visible_descendant_of(f, ROOT));
    }

    #[test]
    fn test_protected_file_scoped_to_package() {
        let mut tree = NodeTree::new();
        let a = pkg(&mut tree, ROOT, "a", Privacy::Public);
        let f = file(&mut tree, a, "x.c", Privacy::Protected);

        // Visible at the owning package, not above it.
        assert!(tree.is_visible_descendant_of(f, a));
        assert!(!tree.is_visible_descendant_of(f, ROOT));
    }

    #[test]
    fn test_semi_protected_reaches_one_level_higher() {
        let mut tree = NodeTree::new();
        let m = pkg(&mut tree, ROOT, "m", Privacy::Public);
        let a = pkg(&mut tree, m, "a", Privacy::Public);
        let f = file(&mut tree, a, "x.h", Privacy::SemiProtected);

        assert!(tree.is_visible_descendant_of(f, a));
        assert!(tree.is_visible_descendant_of(f, m));
        assert!(!tree.is_visible_descendant_of(f, ROOT));
    }

    #[test]
    fn test_private_file_invisible() {
        let mut tree = NodeTree::new();
        let a = pkg(&mut tree, ROOT, "a", Privacy::Public);
        let f = file(&mut tree, a, "x.c", Privacy::Private);

        assert!(!tree.is_visible_descendant_of(f, a));
        assert!(!tree.is_visible_descendant_of(f, ROOT));
        // Trivially visible from itself.
        assert!(tree.is_visible_descendant_of(f, f));
    }

    #[test]
    fn test_protected_package_scopes_public_files() {
        let mut tree = NodeTree::new();
        let m = pkg(&mut tree, ROOT, "m", Privacy::Public);
        let b = pkg(&mut tree, m, "b", Privacy::Protected);
        let f = file(&mut tree, b, "y.h", Privacy::Public);

        // Siblings under m may see it; nothing above m may.
        assert!(tree.is_visible_descendant_of(f, m));
        assert!(!tree.is_visible_descendant_of(f, ROOT));
    }

    #[test]
    fn test_owning_pkg() {
        let mut tree = NodeTree::new();
        let a = pkg(&mut tree, ROOT, "a", Privacy::Public);
        let f = file(&mut tree, a, "x.c", Privacy::Protected);
        assert_eq!(tree.owning_pkg(f), a);
        assert_eq!(tree.owning_pkg(a), a);
    }
}
