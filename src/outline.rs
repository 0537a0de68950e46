//! Document outline stored as an index arena
//!
//! Nodes reference their first child and next sibling by index, so building
//! and walking the tree needs neither recursion nor shared ownership.

use crate::engine::OutlineEntry;

/// Index of a node inside its [`Outline`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NodeId(pub usize);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutlineNode {
    pub title: String,
    /// 1-based destination page
    pub page: Option<u32>,
    pub first_child: Option<NodeId>,
    pub next_sibling: Option<NodeId>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Outline {
    nodes: Vec<OutlineNode>,
    first_root: Option<NodeId>,
}

impl Outline {
    /// Build from depth-first entries. A level jump of more than one is
    /// attached to the deepest open ancestor.
    #[must_use]
    pub fn from_entries(entries: &[OutlineEntry]) -> Self {
        let mut outline = Self::default();
        // last_at_depth[d] = most recent node at depth d
        let mut last_at_depth: Vec<NodeId> = Vec::new();

        for entry in entries {
            let depth = entry.level.min(last_at_depth.len());
            let id = NodeId(outline.nodes.len());
            outline.nodes.push(OutlineNode {
                title: entry.title.clone(),
                page: entry.page,
                first_child: None,
                next_sibling: None,
            });

            if depth < last_at_depth.len() {
                let prev = last_at_depth[depth];
                outline.nodes[prev.0].next_sibling = Some(id);
                last_at_depth.truncate(depth);
            } else if depth == 0 {
                outline.first_root = Some(id);
            } else {
                let parent = last_at_depth[depth - 1];
                outline.nodes[parent.0].first_child = Some(id);
            }
            last_at_depth.push(id);
        }
        outline
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    #[must_use]
    pub fn node(&self, id: NodeId) -> Option<&OutlineNode> {
        self.nodes.get(id.0)
    }

    /// Top-level entries in order
    pub fn roots(&self) -> Siblings<'_> {
        Siblings {
            outline: self,
            next: self.first_root,
        }
    }

    /// Direct children of `id` in order
    pub fn children(&self, id: NodeId) -> Siblings<'_> {
        Siblings {
            outline: self,
            next: self.node(id).and_then(|n| n.first_child),
        }
    }

    /// Depth-first walk yielding `(depth, node)`
    pub fn iter(&self) -> DepthFirst<'_> {
        DepthFirst {
            outline: self,
            stack: self.first_root.map(|id| (0, id)).into_iter().collect(),
        }
    }
}

pub struct Siblings<'a> {
    outline: &'a Outline,
    next: Option<NodeId>,
}

impl<'a> Iterator for Siblings<'a> {
    type Item = (NodeId, &'a OutlineNode);

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.next?;
        let node = self.outline.node(id)?;
        self.next = node.next_sibling;
        Some((id, node))
    }
}

pub struct DepthFirst<'a> {
    outline: &'a Outline,
    stack: Vec<(usize, NodeId)>,
}

impl<'a> Iterator for DepthFirst<'a> {
    type Item = (usize, &'a OutlineNode);

    fn next(&mut self) -> Option<Self::Item> {
        let (depth, id) = self.stack.pop()?;
        let node = self.outline.node(id)?;
        if let Some(sibling) = node.next_sibling {
            self.stack.push((depth, sibling));
        }
        if let Some(child) = node.first_child {
            self.stack.push((depth + 1, child));
        }
        Some((depth, node))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(level: usize, title: &str, page: u32) -> OutlineEntry {
        OutlineEntry {
            level,
            title: title.to_string(),
            page: Some(page),
        }
    }

    fn sample() -> Outline {
        Outline::from_entries(&[
            entry(0, "Intro", 1),
            entry(0, "Part I", 2),
            entry(1, "Chapter 1", 3),
            entry(2, "Section 1.1", 4),
            entry(1, "Chapter 2", 7),
            entry(0, "Index", 20),
        ])
    }

    #[test]
    fn depth_first_walk_preserves_entry_order() {
        let outline = sample();
        let walked: Vec<(usize, &str)> = outline
            .iter()
            .map(|(depth, node)| (depth, node.title.as_str()))
            .collect();
        assert_eq!(
            walked,
            vec![
                (0, "Intro"),
                (0, "Part I"),
                (1, "Chapter 1"),
                (2, "Section 1.1"),
                (1, "Chapter 2"),
                (0, "Index"),
            ]
        );
    }

    #[test]
    fn roots_and_children_follow_links() {
        let outline = sample();
        let roots: Vec<&str> = outline.roots().map(|(_, n)| n.title.as_str()).collect();
        assert_eq!(roots, vec!["Intro", "Part I", "Index"]);

        let (part, _) = outline.roots().nth(1).unwrap();
        let chapters: Vec<u32> = outline
            .children(part)
            .filter_map(|(_, n)| n.page)
            .collect();
        assert_eq!(chapters, vec![3, 7]);
    }

    #[test]
    fn level_jumps_attach_to_deepest_ancestor() {
        let outline = Outline::from_entries(&[entry(0, "A", 1), entry(3, "deep", 2)]);
        let walked: Vec<usize> = outline.iter().map(|(d, _)| d).collect();
        assert_eq!(walked, vec![0, 1]);
    }

    #[test]
    fn empty_entries_give_empty_outline() {
        let outline = Outline::from_entries(&[]);
        assert!(outline.is_empty());
        assert_eq!(outline.iter().count(), 0);
    }
}
