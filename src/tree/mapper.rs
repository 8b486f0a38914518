use crate::BranchId;

/// translates placements on the unrooted working tree back into the edge
/// numbering and distal lengths of the original rooted input tree. inactive
/// (empty map) when the input was unrooted to begin with.
#[derive(Debug, Clone, Default)]
pub struct RtreeMapper {
    utree_root_edge: BranchId,
    rtree_proximal_edge: BranchId,
    rtree_distal_edge: BranchId,
    proximal_edge_length: f64,
    distal_edge_length: f64,
    left: bool,
    map: Vec<BranchId>,
}

impl RtreeMapper {
    pub fn new(
        utree_root_edge: BranchId,
        rtree_proximal_edge: BranchId,
        rtree_distal_edge: BranchId,
        proximal_edge_length: f64,
        distal_edge_length: f64,
        left: bool,
        map: Vec<BranchId>,
    ) -> Self {
        Self {
            utree_root_edge,
            rtree_proximal_edge,
            rtree_distal_edge,
            proximal_edge_length,
            distal_edge_length,
            left,
            map,
        }
    }

    pub fn is_active(&self) -> bool {
        !self.map.is_empty()
    }

    pub fn uroot_is_left(&self) -> bool {
        self.left
    }

    pub fn is_utree_root_edge(&self, branch_id: BranchId) -> bool {
        self.is_active() && branch_id == self.utree_root_edge
    }

    /// rooted-tree equivalent of an unrooted placement. on the former root
    /// edge the placement may belong to either of the two original edges,
    /// decided by where the distal length falls.
    pub fn in_rtree(&self, branch_id: BranchId, distal_length: f64) -> (BranchId, f64) {
        assert!(self.is_active());
        assert!(branch_id < self.map.len());

        if branch_id == self.utree_root_edge {
            if distal_length > self.distal_edge_length {
                // placement lies beyond the original root: flip to the
                // proximal edge, whose distal direction is reversed
                let carryover = distal_length - self.distal_edge_length;
                (
                    self.rtree_proximal_edge,
                    self.proximal_edge_length - carryover,
                )
            } else {
                (self.rtree_distal_edge, distal_length)
            }
        } else {
            (self.map[branch_id], distal_length)
        }
    }

    pub fn distal_of_utree_root(&self) -> (BranchId, f64) {
        (self.rtree_distal_edge, self.distal_edge_length)
    }

    pub fn proximal_of_utree_root(&self) -> (BranchId, f64) {
        (self.rtree_proximal_edge, self.proximal_edge_length)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapper() -> RtreeMapper {
        // merged root edge 4 = rooted edges 2 (distal, length 0.3) and
        // 5 (proximal, length 0.7)
        RtreeMapper::new(4, 5, 2, 0.7, 0.3, true, vec![0, 1, 3, 4, 2])
    }

    #[test]
    fn ordinary_edges_translate_by_table() {
        let m = mapper();
        assert_eq!(m.in_rtree(0, 0.11), (0, 0.11));
        assert_eq!(m.in_rtree(2, 0.02), (3, 0.02));
    }

    #[test]
    fn root_edge_splits_at_the_original_root() {
        let m = mapper();
        // within the distal part
        assert_eq!(m.in_rtree(4, 0.25), (2, 0.25));
        // beyond the root: flipped onto the proximal edge
        let (edge, distal) = m.in_rtree(4, 0.5);
        assert_eq!(edge, 5);
        assert!((distal - (0.7 - 0.2)).abs() < 1e-12);
    }

    #[test]
    fn default_mapper_is_inactive() {
        assert!(!RtreeMapper::default().is_active());
    }
}
