use crate::BranchId;
use crate::engine::Range;
use crate::engine::get_valid_range;
use crate::engine::kernel;
use crate::engine::optimize;
use crate::engine::optimize::PMAT_DISTAL;
use crate::engine::optimize::PMAT_PENDANT;
use crate::engine::optimize::PMAT_PROXIMAL;
use crate::engine::optimize::Triplet;
use crate::engine::partition::Partition;
use crate::error::Error;
use crate::error::Result;
use crate::io::msa::Sequence;
use crate::options::Options;
use crate::sample::placement::Placement;
use crate::tree::reference::ReferenceTree;

/* smallest possible unrooted tree (3 tips, 1 inner node) for edge
  insertion:

             new_tip C:[1]
                |
              inner S:[1] C:[3]
             /     \
         proximal   distal
   S:[0] C:[4]      S:[2] C:[2 or 5]

  proximal/distal are copies of the reference partials adjacent to the
  insertion edge, new_tip carries the query. */

const NEW_TIP_CLV: usize = 1;
const DISTAL_CLV_IF_TIP: usize = 2;
const INNER_CLV: usize = 3;
const PROXIMAL_CLV: usize = 4;
const DISTAL_CLV_IF_INNER: usize = 5;

const PROXIMAL_SCALER: usize = 0;
const INNER_SCALER: usize = 1;
const DISTAL_SCALER: usize = 2;

/// ephemeral three-tip tree wrapping one reference edge. reusable across
/// queries on the same branch; one instance per worker thread.
pub struct TinyTree {
    partition: Partition,
    triplet: Triplet,
    branch_id: BranchId,
    original_branch_length: f64,
    tip_tip_case: bool,
    /// sites where the reference tip has data; full when distal is inner
    ref_tip_range: Range,
}

impl TinyTree {
    /// wrap the reference edge given by one of its half-edges. in the
    /// tip-tip case the reference tip takes the distal role and its
    /// characters are reused directly. `deep_copy` materializes private
    /// CLV copies, which keeps the tiny tree valid even after the memory
    /// saver evicts the originals.
    pub fn new(
        ref_tree: &ReferenceTree,
        edge_half: usize,
        branch_id: BranchId,
        deep_copy: bool,
    ) -> Result<Self> {
        let tree = &ref_tree.tree;
        let mut old_distal = edge_half;
        let mut old_proximal = tree.back(edge_half);

        // the reference tip, if any, must end up distal
        let tip_tip_case = if tree.is_tip(old_distal) {
            true
        } else if tree.is_tip(old_proximal) {
            std::mem::swap(&mut old_distal, &mut old_proximal);
            true
        } else {
            false
        };

        let original_branch_length = tree.halves[edge_half].length;

        // ensure the endpoint partials exist before copying them out
        ref_tree.get_clv(old_distal)?;
        ref_tree.get_clv(old_proximal)?;

        let reference = ref_tree.partition();
        let mut partition = Partition::new(
            reference.model.clone(),
            reference.sites,
            3,
            3,
            3,
            3,
            reference.pattern_tip,
            None,
        );
        partition.pattern_weights = reference.pattern_weights.clone();

        let mut triplet = Triplet {
            inner_clv: INNER_CLV,
            inner_scaler: Some(INNER_SCALER),
            proximal_clv: PROXIMAL_CLV,
            proximal_scaler: None,
            distal_clv: DISTAL_CLV_IF_INNER,
            distal_scaler: None,
            pendant_clv: NEW_TIP_CLV,
            pendant_scaler: None,
            lengths: [
                original_branch_length / 2.0,
                original_branch_length / 2.0,
                crate::DEFAULT_BRANCH_LENGTH,
            ],
        };

        // proximal is always a real partial
        let prox = &tree.halves[old_proximal];
        let clv = reference
            .clv_arc(prox.clv_index)
            .ok_or(Error::ClvUnavailable(prox.clv_index))?;
        if deep_copy {
            partition.insert_clv(PROXIMAL_CLV, (*clv).clone())?;
        } else {
            partition.insert_clv_arc(PROXIMAL_CLV, clv)?;
        }
        if let Some(scaler) = prox.scaler_index.and_then(|s| reference.scaler_arc(s)) {
            let copy = if deep_copy {
                std::sync::Arc::new((*scaler).clone())
            } else {
                scaler
            };
            partition.insert_scaler(PROXIMAL_SCALER, copy);
            triplet.proximal_scaler = Some(PROXIMAL_SCALER);
        }

        let mut ref_tip_range = Range::full(reference.sites);
        let dist = &tree.halves[old_distal];
        if tip_tip_case {
            triplet.distal_clv = DISTAL_CLV_IF_TIP;
            if reference.pattern_tip {
                let chars = reference
                    .tipchar_arc(dist.clv_index)
                    .ok_or(Error::ClvUnavailable(dist.clv_index))?;
                ref_tip_range = tipchar_valid_range(&chars, reference.states());
                partition.insert_tipchars(DISTAL_CLV_IF_TIP, chars);
            } else {
                let clv = reference
                    .clv_arc(dist.clv_index)
                    .ok_or(Error::ClvUnavailable(dist.clv_index))?;
                if deep_copy {
                    partition.insert_clv(DISTAL_CLV_IF_TIP, (*clv).clone())?;
                } else {
                    partition.insert_clv_arc(DISTAL_CLV_IF_TIP, clv)?;
                }
            }
        } else {
            let clv = reference
                .clv_arc(dist.clv_index)
                .ok_or(Error::ClvUnavailable(dist.clv_index))?;
            if deep_copy {
                partition.insert_clv(DISTAL_CLV_IF_INNER, (*clv).clone())?;
            } else {
                partition.insert_clv_arc(DISTAL_CLV_IF_INNER, clv)?;
            }
            if let Some(scaler) = dist.scaler_index.and_then(|s| reference.scaler_arc(s)) {
                let copy = if deep_copy {
                    std::sync::Arc::new((*scaler).clone())
                } else {
                    scaler
                };
                partition.insert_scaler(DISTAL_SCALER, copy);
                triplet.distal_scaler = Some(DISTAL_SCALER);
            }
        }
        drop(reference);

        partition.update_pmatrix(PMAT_PROXIMAL, triplet.lengths[0]);
        partition.update_pmatrix(PMAT_DISTAL, triplet.lengths[1]);
        partition.update_pmatrix(PMAT_PENDANT, triplet.lengths[2]);

        // partial toward the pendant; independent of any query, so usable
        // for per-site precomputation right away
        let range = Range::full(partition.sites);
        kernel::update_partials(&mut partition, &[triplet.pendant_update()], range)?;

        Ok(Self {
            partition,
            triplet,
            branch_id,
            original_branch_length,
            tip_tip_case,
            ref_tip_range,
        })
    }

    pub fn branch_id(&self) -> BranchId {
        self.branch_id
    }

    pub fn is_tip_tip(&self) -> bool {
        self.tip_tip_case
    }

    /// pendant length a preplacement on this branch reports
    pub fn pendant_length(&self) -> f64 {
        crate::DEFAULT_BRANCH_LENGTH
    }

    /// distal length a preplacement on this branch reports
    pub fn distal_length(&self) -> f64 {
        self.original_branch_length / 2.0
    }

    /// insert one query into this branch: likelihood only, or with full
    /// three-branch optimization and distal rescaling
    pub fn place(
        &mut self,
        seq: &Sequence,
        opt_branches: bool,
        options: &Options,
    ) -> Result<Placement> {
        if seq.len() != self.partition.sites {
            return Err(Error::parse(
                seq.header(),
                "query sequence length not same as reference alignment",
            ));
        }

        let full = Range::full(self.partition.sites);
        let mut query_range = full;
        if options.premasking {
            query_range = get_valid_range(seq.sequence());
            if query_range.is_empty() {
                return Err(Error::EmptySequence(seq.header().into()));
            }
        }
        // optimization on a tip-tip edge must cover the reference tip too
        let opt_range = if options.premasking && self.tip_tip_case {
            query_range.hull(&self.ref_tip_range)
        } else {
            query_range
        };

        self.partition.set_tip_states(NEW_TIP_CLV, seq.sequence())?;

        let mut distal_length = self.triplet.lengths[1];
        let mut pendant_length = self.triplet.lengths[2];
        let mut logl = f64::NEG_INFINITY;

        if opt_branches {
            let mut working = self.triplet.clone();
            logl = optimize::optimize_triplet(&mut self.partition, &mut working, opt_range)?;

            // rescale the split halves so they sum to the original edge
            // length again
            let new_total = working.lengths[0] + working.lengths[1];
            distal_length = (self.original_branch_length / new_total) * working.lengths[1];
            pendant_length = working.lengths[2];

            if options.sliding_blo {
                // keep the optimized state: queries on the same branch tend
                // to converge from there in fewer steps
                self.triplet = working;
            } else {
                self.partition
                    .update_pmatrix(PMAT_PROXIMAL, self.triplet.lengths[0]);
                self.partition
                    .update_pmatrix(PMAT_DISTAL, self.triplet.lengths[1]);
                self.partition
                    .update_pmatrix(PMAT_PENDANT, self.triplet.lengths[2]);
            }
        }

        // refresh the inner partial for the evaluation and for the next
        // query on this branch
        kernel::update_partials(&mut self.partition, &[self.triplet.pendant_update()], full)?;

        if !opt_branches {
            // same site window the lookup store sums over, so lookup-based
            // preplacement and direct evaluation agree exactly
            logl = kernel::edge_logl(
                &self.partition,
                NEW_TIP_CLV,
                None,
                INNER_CLV,
                Some(INNER_SCALER),
                PMAT_PENDANT,
                query_range,
                None,
            )?;
        }

        if logl == f64::NEG_INFINITY {
            return Err(Error::NumericalUnderflow {
                branch: self.branch_id,
                header: seq.header().into(),
            });
        }

        debug_assert!(distal_length >= 0.0);
        debug_assert!(distal_length <= self.original_branch_length + 1e-12);
        let distal_length = distal_length.clamp(0.0, self.original_branch_length);

        Ok(Placement::new(
            self.branch_id,
            logl,
            pendant_length,
            distal_length,
        ))
    }

    /// per-site log-likelihoods of a sequence consisting entirely of the
    /// given character. used exclusively to build the lookup store.
    pub fn get_persite_logl(&mut self, character: u8, out: &mut [f64]) -> Result<()> {
        let sites = self.partition.sites;
        assert_eq!(out.len(), sites);
        let seq = vec![character; sites];
        self.partition.set_tip_states(NEW_TIP_CLV, &seq)?;
        kernel::edge_logl(
            &self.partition,
            NEW_TIP_CLV,
            None,
            INNER_CLV,
            Some(INNER_SCALER),
            PMAT_PENDANT,
            Range::full(sites),
            Some(out),
        )?;
        Ok(())
    }
}

/// window of sites where a reference tip has non-gap data
fn tipchar_valid_range(chars: &[u32], states: usize) -> Range {
    let gap = (1u32 << states) - 1;
    let first = chars.iter().position(|&c| c != gap);
    match first {
        None => Range::new(0, 0),
        Some(begin) => {
            let last = chars.iter().rposition(|&c| c != gap).unwrap();
            Range::new(begin, last + 1 - begin)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::model::SubstModel;
    use crate::io::msa::Msa;

    fn reference() -> ReferenceTree {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ref.nwk");
        std::fs::write(&path, "((A:0.1,B:0.1):0.1,(C:0.1,D:0.1):0.1);").unwrap();
        let mut msa = Msa::new(4);
        msa.append(Sequence::new("A", b"ACGT".to_vec()));
        msa.append(Sequence::new("B", b"ACGA".to_vec()));
        msa.append(Sequence::new("C", b"ACGG".to_vec()));
        msa.append(Sequence::new("D", b"ACGC".to_vec()));
        let model = SubstModel::new("GTR", 4).unwrap();
        let (tree, _) =
            ReferenceTree::from_files(&path, &mut msa, model, &Options::default(), None).unwrap();
        tree
    }

    #[test]
    fn places_on_every_branch() {
        let ref_tree = reference();
        let query = Sequence::new("Q", b"ACGT".to_vec());
        let options = Options::default();
        for (branch_id, h) in ref_tree.branches().into_iter().enumerate() {
            let mut tiny = TinyTree::new(&ref_tree, h, branch_id, false).unwrap();
            let placement = tiny.place(&query, true, &options).unwrap();
            assert!(placement.likelihood().is_finite());
            assert!(placement.likelihood() < 0.0);
            assert!(placement.pendant_length() >= 0.0);
            assert!(placement.distal_length() >= 0.0);
        }
    }

    #[test]
    fn identical_query_prefers_matching_leaf_branch() {
        let ref_tree = reference();
        let query = Sequence::new("Q", b"ACGT".to_vec());
        let options = Options::default();
        let mut best = (0usize, f64::NEG_INFINITY);
        for (branch_id, h) in ref_tree.branches().into_iter().enumerate() {
            let mut tiny = TinyTree::new(&ref_tree, h, branch_id, false).unwrap();
            let p = tiny.place(&query, true, &options).unwrap();
            if p.likelihood() > best.1 {
                best = (branch_id, p.likelihood());
            }
        }
        // branch 0 leads to tip A, which matches the query exactly
        let branches = ref_tree.branches();
        let best_half = branches[best.0];
        assert_eq!(ref_tree.tree.halves[best_half].label.as_deref(), Some("A"));
    }

    #[test]
    fn deep_and_shallow_copies_agree() {
        let ref_tree = reference();
        let query = Sequence::new("Q", b"ACGA".to_vec());
        let options = Options::default();
        let h = ref_tree.branches()[2];
        let mut deep = TinyTree::new(&ref_tree, h, 2, true).unwrap();
        let mut shallow = TinyTree::new(&ref_tree, h, 2, false).unwrap();
        let a = deep.place(&query, false, &options).unwrap();
        let b = shallow.place(&query, false, &options).unwrap();
        assert_eq!(a.likelihood(), b.likelihood());
    }

    #[test]
    fn premasked_empty_sequence_fails() {
        let ref_tree = reference();
        let query = Sequence::new("Q", b"----".to_vec());
        let options = Options::default();
        let h = ref_tree.branches()[0];
        let mut tiny = TinyTree::new(&ref_tree, h, 0, false).unwrap();
        let err = tiny.place(&query, true, &options);
        assert!(matches!(err, Err(Error::EmptySequence(_))));
    }

    #[test]
    fn distal_stays_within_the_original_edge() {
        let ref_tree = reference();
        let options = Options::default();
        for seq in [b"ACGT", b"TTTT", b"AAAA"] {
            let query = Sequence::new("Q", seq.to_vec());
            for (branch_id, h) in ref_tree.branches().into_iter().enumerate() {
                let original = ref_tree.tree.halves[h].length;
                let mut tiny = TinyTree::new(&ref_tree, h, branch_id, false).unwrap();
                let p = tiny.place(&query, true, &options).unwrap();
                assert!(p.distal_length() <= original);
                assert!(p.distal_length() >= 0.0);
            }
        }
    }

    #[test]
    fn persite_logl_matches_uniform_sequence_placement() {
        let ref_tree = reference();
        let h = ref_tree.branches()[0];
        let mut tiny = TinyTree::new(&ref_tree, h, 0, false).unwrap();
        let mut persite = vec![0.0; 4];
        tiny.get_persite_logl(b'A', &mut persite).unwrap();
        let sum: f64 = persite.iter().sum();

        let query = Sequence::new("Q", b"AAAA".to_vec());
        let placement = tiny
            .place(&query, false, &Options::default())
            .unwrap();
        assert!((sum - placement.likelihood()).abs() < 1e-9);
    }
}
