use crate::BranchId;
use crate::engine::kernel::Operation;

/// one directed half of an edge. `back` is the opposite half; `next` walks
/// the ring of three halves around an inner node and is None at tips. the
/// CLV behind a half covers the subtree on its own node's side of the edge.
#[derive(Debug, Clone)]
pub struct HalfEdge {
    pub back: usize,
    pub next: Option<usize>,
    pub clv_index: usize,
    pub scaler_index: Option<usize>,
    pub pmatrix_index: usize,
    pub length: f64,
    pub label: Option<String>,
}

/// unrooted binary tree as an index-addressed arena of half-edges. tips
/// occupy `[0, tip_count)`, inner rings follow as consecutive triplets.
#[derive(Debug, Clone)]
pub struct Utree {
    pub halves: Vec<HalfEdge>,
    pub tip_count: usize,
    pub inner_count: usize,
    pub vroot: usize,
}

/// tree-derived counts used for sizing buffers all over the crate
#[derive(Debug, Clone, Copy, Default)]
pub struct TreeNumbers {
    pub tip_nodes: usize,
    pub inner_nodes: usize,
    pub branches: usize,
    pub clvs: usize,
    pub scalers: usize,
}

impl TreeNumbers {
    pub fn new(tip_count: usize) -> Self {
        let inner = tip_count.saturating_sub(2);
        Self {
            tip_nodes: tip_count,
            inner_nodes: inner,
            branches: 2 * tip_count - 3,
            clvs: tip_count + 3 * inner,
            scalers: 3 * inner,
        }
    }

    pub fn large_tree(&self) -> bool {
        self.tip_nodes > 10_000
    }
}

impl Utree {
    pub fn nums(&self) -> TreeNumbers {
        TreeNumbers::new(self.tip_count)
    }

    pub fn edge_count(&self) -> usize {
        2 * self.tip_count - 3
    }

    pub fn is_tip(&self, h: usize) -> bool {
        self.halves[h].next.is_none()
    }

    pub fn next(&self, h: usize) -> usize {
        self.halves[h].next.expect("ring step on a tip half-edge")
    }

    pub fn back(&self, h: usize) -> usize {
        self.halves[h].back
    }

    /// the two subtree tops hanging off an inner half-edge
    pub fn children(&self, h: usize) -> Option<(usize, usize)> {
        self.halves[h].next.map(|n| {
            let nn = self.next(n);
            (self.back(n), self.back(nn))
        })
    }

    /// sum of all branch lengths
    pub fn tree_length(&self) -> f64 {
        self.query_branches()
            .iter()
            .map(|&h| self.halves[h].length)
            .sum()
    }

    /// replace missing (non-positive, non-finite) lengths by the default
    pub fn set_missing_branch_lengths(&mut self, default: f64) {
        for h in 0..self.halves.len() {
            let l = self.halves[h].length;
            if !l.is_finite() || l <= 0.0 {
                self.halves[h].length = default;
            }
        }
    }

    /// postorder traversal of the subtree behind `h`, pushing `h` last.
    /// iterative, so pectinate trees with 1e5 tips don't blow the stack.
    fn postorder_into(&self, h: usize, out: &mut Vec<usize>) {
        let mut stack = vec![(h, false)];
        while let Some((cur, expanded)) = stack.pop() {
            if expanded || self.is_tip(cur) {
                out.push(cur);
                continue;
            }
            stack.push((cur, true));
            let (c1, c2) = self.children(cur).unwrap();
            stack.push((c2, false));
            stack.push((c1, false));
        }
    }

    /// postorder emit order of the subtree behind `h`
    pub(crate) fn postorder_subtree(&self, h: usize) -> Vec<usize> {
        let mut out = Vec::new();
        self.postorder_into(h, &mut out);
        out
    }

    /// one half-edge per edge, in the deterministic postorder that defines
    /// branch ids and the numbered newick annotation
    pub fn query_branches(&self) -> Vec<usize> {
        let root = if self.is_tip(self.vroot) {
            self.back(self.vroot)
        } else {
            self.vroot
        };
        let mut out = Vec::with_capacity(self.edge_count());
        self.postorder_into(self.back(root), &mut out);
        self.postorder_into(self.back(self.next(root)), &mut out);
        self.postorder_into(self.back(self.next(self.next(root))), &mut out);
        out
    }

    /// branch id of every half-edge, both halves of an edge agreeing
    pub fn branch_ids(&self) -> Vec<BranchId> {
        let mut ids = vec![0; self.halves.len()];
        for (branch_id, &h) in self.query_branches().iter().enumerate() {
            ids[h] = branch_id;
            ids[self.back(h)] = branch_id;
        }
        ids
    }

    /// assign pmatrix indices so both halves of branch `i` use matrix `i`
    pub fn assign_pmatrix_indices(&mut self) {
        for (branch_id, h) in self.query_branches().into_iter().enumerate() {
            let b = self.back(h);
            self.halves[h].pmatrix_index = branch_id;
            self.halves[b].pmatrix_index = branch_id;
        }
    }

    /// number of tips behind each half-edge
    pub fn subtree_sizes(&self) -> Vec<usize> {
        let mut sizes = vec![0usize; self.halves.len()];
        for start in 0..self.halves.len() {
            if sizes[start] != 0 {
                continue;
            }
            let mut stack = vec![start];
            while let Some(&h) = stack.last() {
                if sizes[h] != 0 {
                    stack.pop();
                    continue;
                }
                match self.children(h) {
                    None => {
                        sizes[h] = 1;
                        stack.pop();
                    }
                    Some((c1, c2)) if sizes[c1] != 0 && sizes[c2] != 0 => {
                        sizes[h] = sizes[c1] + sizes[c2];
                        stack.pop();
                    }
                    Some((c1, c2)) => {
                        if sizes[c1] == 0 {
                            stack.push(c1);
                        }
                        if sizes[c2] == 0 {
                            stack.push(c2);
                        }
                    }
                }
            }
        }
        sizes
    }

    /// full postorder around a virtual root half-edge: both sides of its
    /// edge, children before parents. valid partials at `vroot` and
    /// `vroot.back` once the corresponding operations have run.
    pub fn full_traversal(&self, vroot: usize) -> Vec<usize> {
        let mut out = Vec::with_capacity(self.halves.len());
        self.postorder_into(self.back(vroot), &mut out);
        self.postorder_into(vroot, &mut out);
        out
    }

    /// postorder with a prune predicate: subtrees where `descend` returns
    /// false are neither visited nor emitted. largest subtree first when
    /// `lsf` is set.
    pub fn pruned_traversal(
        &self,
        vroot: usize,
        lsf: Option<&[usize]>,
        mut descend: impl FnMut(usize) -> bool,
    ) -> Vec<usize> {
        let mut out = Vec::new();
        let mut stack = Vec::new();
        for side in [self.back(vroot), vroot] {
            stack.push((side, false));
            while let Some((cur, expanded)) = stack.pop() {
                if expanded {
                    out.push(cur);
                    continue;
                }
                if !descend(cur) {
                    continue;
                }
                if self.is_tip(cur) {
                    out.push(cur);
                    continue;
                }
                stack.push((cur, true));
                let (mut c1, mut c2) = self.children(cur).unwrap();
                if let Some(sizes) = lsf {
                    // larger subtree explored first
                    if sizes[c2] > sizes[c1] {
                        std::mem::swap(&mut c1, &mut c2);
                    }
                }
                stack.push((c2, false));
                stack.push((c1, false));
            }
        }
        out
    }

    /// postorder operations and pmatrix refresh list for a traversal
    pub fn create_operations(&self, traversal: &[usize]) -> (Vec<Operation>, Vec<(usize, f64)>) {
        let mut ops = Vec::new();
        let mut matrices = Vec::new();
        for &h in traversal {
            matrices.push((self.halves[h].pmatrix_index, self.halves[h].length));
            if let Some((c1, c2)) = self.children(h) {
                ops.push(Operation {
                    parent_clv: self.halves[h].clv_index,
                    parent_scaler: self.halves[h].scaler_index,
                    child1_clv: self.halves[c1].clv_index,
                    child1_scaler: self.halves[c1].scaler_index,
                    child1_matrix: self.halves[c1].pmatrix_index,
                    child2_clv: self.halves[c2].clv_index,
                    child2_scaler: self.halves[c2].scaler_index,
                    child2_matrix: self.halves[c2].pmatrix_index,
                });
            }
        }
        (ops, matrices)
    }

    /// newick rendering with `{branch_id}` annotations in postorder, the
    /// tree string carried by every jplace document
    pub fn numbered_newick(&self) -> String {
        let root = if self.is_tip(self.vroot) {
            self.back(self.vroot)
        } else {
            self.vroot
        };
        let mut out = String::from("(");
        let mut index = 0;
        self.numbered_newick_rec(self.back(root), &mut out, &mut index);
        out.push(',');
        self.numbered_newick_rec(self.back(self.next(root)), &mut out, &mut index);
        out.push(',');
        self.numbered_newick_rec(self.back(self.next(self.next(root))), &mut out, &mut index);
        out.push_str(");");
        out
    }

    fn numbered_newick_rec(&self, top: usize, out: &mut String, index: &mut usize) {
        use std::fmt::Write;
        enum Frame {
            Enter(usize),
            Comma,
            Exit(usize),
        }
        let mut stack = vec![Frame::Enter(top)];
        while let Some(frame) = stack.pop() {
            match frame {
                Frame::Comma => out.push(','),
                Frame::Enter(h) => match self.children(h) {
                    None => {
                        let label = self.halves[h].label.as_deref().unwrap_or("");
                        write!(out, "{}:{}{{{}}}", label, self.halves[h].length, index).unwrap();
                        *index += 1;
                    }
                    Some((c1, c2)) => {
                        out.push('(');
                        stack.push(Frame::Exit(h));
                        stack.push(Frame::Enter(c2));
                        stack.push(Frame::Comma);
                        stack.push(Frame::Enter(c1));
                    }
                },
                Frame::Exit(h) => {
                    write!(out, "):{}{{{}}}", self.halves[h].length, index).unwrap();
                    *index += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::newick;

    const FOUR_TAXA: &str = "((A:0.1,B:0.2):0.3,(C:0.4,D:0.5):0.6);";

    #[test]
    fn four_taxon_tree_has_five_branches() {
        let (tree, _) = newick::parse(FOUR_TAXA).unwrap();
        assert_eq!(tree.tip_count, 4);
        assert_eq!(tree.inner_count, 2);
        assert_eq!(tree.edge_count(), 5);
        assert_eq!(tree.query_branches().len(), 5);
    }

    #[test]
    fn branch_ids_cover_both_halves() {
        let (tree, _) = newick::parse(FOUR_TAXA).unwrap();
        let ids = tree.branch_ids();
        for h in tree.query_branches() {
            assert_eq!(ids[h], ids[tree.back(h)]);
        }
        let mut seen: Vec<_> = tree.query_branches().iter().map(|&h| ids[h]).collect();
        seen.sort();
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn subtree_sizes_sum_to_tip_count() {
        let (tree, _) = newick::parse(FOUR_TAXA).unwrap();
        let sizes = tree.subtree_sizes();
        for h in 0..tree.halves.len() {
            let both = sizes[h] + sizes[tree.back(h)];
            assert_eq!(both, tree.tip_count, "half {h}");
        }
    }

    #[test]
    fn full_traversal_ends_at_the_root_half() {
        let (tree, _) = newick::parse(FOUR_TAXA).unwrap();
        let trav = tree.full_traversal(tree.vroot);
        assert_eq!(*trav.last().unwrap(), tree.vroot);
    }

    #[test]
    fn numbered_newick_annotates_every_branch() {
        let (tree, _) = newick::parse(FOUR_TAXA).unwrap();
        let newick = tree.numbered_newick();
        for id in 0..tree.edge_count() {
            assert!(newick.contains(&format!("{{{id}}}")), "{newick}");
        }
    }

    #[test]
    fn lsf_traversal_visits_larger_subtrees_first() {
        let (tree, _) = newick::parse("(((A:0.1,B:0.1):0.1,C:0.1):0.1,D:0.1,E:0.1);").unwrap();
        let sizes = tree.subtree_sizes();
        let trav = tree.pruned_traversal(tree.vroot, Some(&sizes), |_| true);
        assert_eq!(trav.len(), tree.halves.len());
    }
}
