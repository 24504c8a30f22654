//! Binary cluster trees and the admissibility of cluster pairs.
//!
//! Nodes live in a flat arena addressed by their id, node `0` is the root
//! and covers the index range `[0, N)`. Every non-leaf node has exactly two
//! sons whose ranges are contiguous and partition the range of the parent.
//!
//! The admissibility map marks pairs of clusters that are stored without
//! further subdivision, either as a dense block or as a low-rank pair.
//! Pairs that are not in the map are subdivided into the Cartesian product
//! of their sons.

use crate::io::{read_index_table, write_index_table};
use crate::types::{Result, RustyHMatrixError};
use std::collections::{BTreeMap, HashSet};
use std::io::{Read, Write};

/// Storage format assigned to a pair of clusters.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Admissibility {
    /// The pair must be subdivided further.
    Unset,
    /// The pair is approximated by a low-rank factorization.
    LowRank,
    /// The pair is stored as a dense block.
    Dense,
}

impl Admissibility {
    pub fn is_admissible(&self) -> bool {
        *self != Admissibility::Unset
    }
}

#[derive(Clone, Debug, PartialEq)]
struct ClusterNode {
    id: usize,
    begin: usize,
    end: usize,
    sons: Option<[usize; 2]>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ClusterTree {
    nodes: Vec<ClusterNode>,
    admissibility: BTreeMap<(usize, usize), Admissibility>,
}

impl ClusterTree {
    /// Create a tree from a table of sons and half-open index ranges.
    ///
    /// A sons entry of `(0, 0)` marks a leaf. The admissibility map starts
    /// empty.
    pub fn new(sons: &[(usize, usize)], ranges: &[(usize, usize)]) -> Result<Self> {
        if sons.len() != ranges.len() {
            return Err(RustyHMatrixError::InvalidTree(format!(
                "{} sons entries for {} index ranges",
                sons.len(),
                ranges.len()
            )));
        }

        let nodes = sons
            .iter()
            .zip(ranges.iter())
            .enumerate()
            .map(|(id, (&(s0, s1), &(begin, end)))| ClusterNode {
                id,
                begin,
                end,
                sons: if s0 == 0 && s1 == 0 {
                    None
                } else {
                    Some([s0, s1])
                },
            })
            .collect();

        let tree = ClusterTree {
            nodes,
            admissibility: BTreeMap::new(),
        };
        tree.validate_structure()?;
        Ok(tree)
    }

    /// Create a tree from index ranges with inclusive end points.
    pub fn from_inclusive(sons: &[(usize, usize)], ranges: &[(usize, usize)]) -> Result<Self> {
        let exclusive: Vec<(usize, usize)> = ranges
            .iter()
            .map(|&(begin, last)| (begin, last + 1))
            .collect();
        ClusterTree::new(sons, &exclusive)
    }

    /// Build a tree by recursive halving of `[0, n)`.
    ///
    /// Clusters with at most `leaf_size` indices become leaves. A pair of
    /// clusters is low-rank admissible if `criterion(row_range, col_range)`
    /// holds, pairs of leaves that fail the criterion are dense.
    pub fn bisection<F>(n: usize, leaf_size: usize, criterion: F) -> Result<Self>
    where
        F: Fn((usize, usize), (usize, usize)) -> bool,
    {
        if n == 0 || leaf_size == 0 {
            return Err(RustyHMatrixError::InvalidTree(format!(
                "cannot bisect {} indices into leaves of size {}",
                n, leaf_size
            )));
        }

        let mut tree = ClusterTree {
            nodes: vec![ClusterNode {
                id: 0,
                begin: 0,
                end: n,
                sons: None,
            }],
            admissibility: BTreeMap::new(),
        };
        tree.split(0, leaf_size);
        tree.assign_admissibility(0, 0, &criterion);

        log::debug!(
            "Bisection tree with {} clusters and {} admissible pairs.",
            tree.len(),
            tree.admissibility.len()
        );

        Ok(tree)
    }

    fn split(&mut self, id: usize, leaf_size: usize) {
        let (begin, end) = self.range(id);
        if end - begin <= leaf_size {
            return;
        }

        let mid = begin + (end - begin) / 2;
        let first = self.nodes.len();
        let second = first + 1;
        self.nodes.push(ClusterNode {
            id: first,
            begin,
            end: mid,
            sons: None,
        });
        self.nodes.push(ClusterNode {
            id: second,
            begin: mid,
            end,
            sons: None,
        });
        self.nodes[id].sons = Some([first, second]);

        self.split(first, leaf_size);
        self.split(second, leaf_size);
    }

    fn assign_admissibility<F>(&mut self, row: usize, col: usize, criterion: &F)
    where
        F: Fn((usize, usize), (usize, usize)) -> bool,
    {
        if criterion(self.range(row), self.range(col)) {
            self.set_admissibility(row, col, Admissibility::LowRank);
        } else if self.is_leaf(row) && self.is_leaf(col) {
            self.set_admissibility(row, col, Admissibility::Dense);
        } else {
            let rows = self.sons(row).to_vec();
            let cols = self.sons(col).to_vec();
            for &r in &rows {
                for &c in &cols {
                    self.assign_admissibility(r, c, criterion);
                }
            }
        }
    }

    /// Number of clusters.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Number of indices covered by the root.
    pub fn num_indices(&self) -> usize {
        self.nodes.first().map_or(0, |node| node.end)
    }

    /// Error unless every id names a cluster of the tree.
    ///
    /// The accessors below index the clusters directly and panic on an
    /// unknown id. Entry points taking ids from callers check them here.
    pub fn check_nodes(&self, nodes: &[usize]) -> Result<()> {
        match nodes.iter().find(|&&node| node >= self.len()) {
            Some(node) => Err(RustyHMatrixError::InvalidTree(format!(
                "cluster {} is not part of a tree with {} clusters",
                node,
                self.len()
            ))),
            None => Ok(()),
        }
    }

    /// The two sons of a cluster, `None` for a leaf.
    pub fn children(&self, node: usize) -> Option<(usize, usize)> {
        self.nodes[node].sons.map(|[s0, s1]| (s0, s1))
    }

    pub fn is_leaf(&self, node: usize) -> bool {
        self.nodes[node].sons.is_none()
    }

    /// Sons of a cluster, or the cluster itself if it is a leaf.
    pub fn sons(&self, node: usize) -> &[usize] {
        let node = &self.nodes[node];
        match &node.sons {
            Some(sons) => &sons[..],
            None => std::slice::from_ref(&node.id),
        }
    }

    /// Half-open index range `(begin, end)` of a cluster.
    pub fn range(&self, node: usize) -> (usize, usize) {
        let node = &self.nodes[node];
        (node.begin, node.end)
    }

    /// Number of indices in a cluster.
    pub fn size(&self, node: usize) -> usize {
        let (begin, end) = self.range(node);
        end - begin
    }

    /// Range of `node` as offsets into the range of `ancestor`.
    pub fn range_relative(&self, node: usize, ancestor: usize) -> Result<(usize, usize)> {
        self.check_nodes(&[node, ancestor])?;
        let (begin, end) = self.range(node);
        let (outer_begin, outer_end) = self.range(ancestor);
        if begin < outer_begin || end > outer_end {
            return Err(RustyHMatrixError::InvalidTree(format!(
                "cluster {} is not contained in cluster {}",
                node, ancestor
            )));
        }
        Ok((begin - outer_begin, end - outer_begin))
    }

    pub fn admissibility(&self, row: usize, col: usize) -> Admissibility {
        self.admissibility
            .get(&(row, col))
            .copied()
            .unwrap_or(Admissibility::Unset)
    }

    /// Mark a pair of clusters. Setting `Unset` removes the mark.
    pub fn set_admissibility(&mut self, row: usize, col: usize, value: Admissibility) {
        match value {
            Admissibility::Unset => {
                self.admissibility.remove(&(row, col));
            }
            _ => {
                self.admissibility.insert((row, col), value);
            }
        }
    }

    /// All pairs marked with the given format, in key order.
    pub fn pairs_with(&self, value: Admissibility) -> Vec<(usize, usize)> {
        self.admissibility
            .iter()
            .filter(|(_, &ad)| ad == value)
            .map(|(&key, _)| key)
            .collect()
    }

    /// Depth-first enumeration of the admissible pairs below `(row, col)`.
    ///
    /// Non-admissible pairs are subdivided row son first, column son
    /// second. A pair of leaves without admissibility is an error.
    pub fn admissible_pairs(&self, row: usize, col: usize) -> Result<Vec<(usize, usize)>> {
        self.check_nodes(&[row, col])?;
        let mut pairs = Vec::new();
        self.collect_pairs(row, col, &mut pairs)?;
        Ok(pairs)
    }

    fn collect_pairs(&self, row: usize, col: usize, pairs: &mut Vec<(usize, usize)>) -> Result<()> {
        if self.admissibility(row, col).is_admissible() {
            pairs.push((row, col));
        } else if self.is_leaf(row) && self.is_leaf(col) {
            return Err(RustyHMatrixError::InvalidTree(format!(
                "leaf pair ({}, {}) has no admissibility",
                row, col
            )));
        } else {
            for &r in self.sons(row) {
                for &c in self.sons(col) {
                    self.collect_pairs(r, c, pairs)?;
                }
            }
        }
        Ok(())
    }

    /// Remove all clusters and admissibility marks.
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.admissibility.clear();
    }

    fn validate_structure(&self) -> Result<()> {
        let root = self
            .nodes
            .first()
            .ok_or_else(|| RustyHMatrixError::InvalidTree("tree has no clusters".to_string()))?;
        if root.begin != 0 {
            return Err(RustyHMatrixError::InvalidTree(format!(
                "root range starts at {}",
                root.begin
            )));
        }

        for node in self.nodes.iter() {
            if node.begin >= node.end {
                return Err(RustyHMatrixError::InvalidTree(format!(
                    "cluster {} has empty range [{}, {})",
                    node.id, node.begin, node.end
                )));
            }
            if let Some([s0, s1]) = node.sons {
                if s0 >= self.len() || s1 >= self.len() || s0 == 0 || s1 == 0 {
                    return Err(RustyHMatrixError::InvalidTree(format!(
                        "cluster {} has invalid sons ({}, {})",
                        node.id, s0, s1
                    )));
                }
                let (first, second) = (&self.nodes[s0], &self.nodes[s1]);
                if first.begin != node.begin || first.end != second.begin || second.end != node.end
                {
                    return Err(RustyHMatrixError::InvalidTree(format!(
                        "sons of cluster {} do not partition [{}, {})",
                        node.id, node.begin, node.end
                    )));
                }
            }
        }

        // Every cluster must be reached exactly once from the root.
        let mut visited = HashSet::new();
        let mut stack = vec![0];
        while let Some(id) = stack.pop() {
            if !visited.insert(id) {
                return Err(RustyHMatrixError::InvalidTree(format!(
                    "cluster {} is reachable twice",
                    id
                )));
            }
            if let Some([s0, s1]) = self.nodes[id].sons {
                stack.push(s0);
                stack.push(s1);
            }
        }

        Ok(())
    }

    /// Check the tree structure, that every leaf pair is covered and that
    /// every admissibility mark belongs to the partition.
    ///
    /// The pairs reached from `(0, 0)` tile the index space by
    /// construction. A mark below an admissible pair is never reached and
    /// is rejected.
    pub fn validate(&self) -> Result<()> {
        self.validate_structure()?;

        if let Some(&(row, col)) = self
            .admissibility
            .keys()
            .find(|&&(row, col)| row >= self.len() || col >= self.len())
        {
            return Err(RustyHMatrixError::InvalidTree(format!(
                "admissible pair ({}, {}) refers to unknown clusters",
                row, col
            )));
        }

        let pairs = self.admissible_pairs(0, 0)?;
        if pairs.len() != self.admissibility.len() {
            let reached: HashSet<_> = pairs.into_iter().collect();
            if let Some(&(row, col)) = self.admissibility.keys().find(|&key| !reached.contains(key)) {
                return Err(RustyHMatrixError::InvalidTree(format!(
                    "admissible pair ({}, {}) is not part of the partition",
                    row, col
                )));
            }
        }
        Ok(())
    }

    /// Write the tree: sons table, inclusive index table, dense pairs and
    /// low-rank pairs.
    pub fn write<W: Write>(&self, writer: &mut W) -> Result<()> {
        let sons: Vec<(usize, usize)> = self
            .nodes
            .iter()
            .map(|node| node.sons.map_or((0, 0), |[s0, s1]| (s0, s1)))
            .collect();
        let ind: Vec<(usize, usize)> = self
            .nodes
            .iter()
            .map(|node| (node.begin, node.end - 1))
            .collect();

        write_index_table(writer, &sons)?;
        write_index_table(writer, &ind)?;
        write_index_table(writer, &self.pairs_with(Admissibility::Dense))?;
        write_index_table(writer, &self.pairs_with(Admissibility::LowRank))?;
        Ok(())
    }

    /// Read a tree written by [`ClusterTree::write`].
    pub fn read<R: Read>(reader: &mut R) -> Result<Self> {
        let sons = read_index_table(reader)?;
        let ind = read_index_table(reader)?;
        let mut tree = ClusterTree::from_inclusive(&sons, &ind)?;

        for (row, col) in read_index_table(reader)? {
            tree.set_admissibility(row, col, Admissibility::Dense);
        }
        for (row, col) in read_index_table(reader)? {
            tree.set_admissibility(row, col, Admissibility::LowRank);
        }

        tree.validate()?;
        Ok(tree)
    }
}

/// Trees shared by the unit tests of the H-matrix modules.
#[cfg(test)]
pub(crate) mod test_trees {

    use super::*;

    /// Eight indices, two leaves of four, low-rank off-diagonal blocks.
    pub(crate) fn cauchy_tree() -> ClusterTree {
        let mut tree = ClusterTree::new(&[(1, 2), (0, 0), (0, 0)], &[(0, 8), (0, 4), (4, 8)])
            .unwrap();
        tree.set_admissibility(1, 1, Admissibility::Dense);
        tree.set_admissibility(2, 2, Admissibility::Dense);
        tree.set_admissibility(1, 2, Admissibility::LowRank);
        tree.set_admissibility(2, 1, Admissibility::LowRank);
        tree
    }

    /// Separation criterion for clusters on a line.
    pub(crate) fn separated(row: (usize, usize), col: (usize, usize)) -> bool {
        let gap = if row.1 <= col.0 {
            col.0 - row.1
        } else if col.1 <= row.0 {
            row.0 - col.1
        } else {
            return false;
        };
        gap >= std::cmp::min(row.1 - row.0, col.1 - col.0)
    }

    /// Bisection tree with a mix of dense and low-rank leaves.
    pub(crate) fn line_tree(n: usize, leaf_size: usize) -> ClusterTree {
        ClusterTree::bisection(n, leaf_size, separated).unwrap()
    }
}
