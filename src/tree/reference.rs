use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::RwLock;
use std::sync::RwLockReadGuard;
use std::sync::RwLockWriteGuard;

use crate::BranchId;
use crate::engine::Range;
use crate::engine::alphabet;
use crate::engine::kernel;
use crate::engine::model::SubstModel;
use crate::engine::optimize;
use crate::engine::partition::Partition;
use crate::error::Error;
use crate::error::Result;
use crate::io::binary::BinaryStore;
use crate::io::msa::Msa;
use crate::memory::MemoryConfig;
use crate::memory::partial_compute_clvs;
use crate::options::Options;
use crate::tree::mapper::RtreeMapper;
use crate::tree::newick;
use crate::tree::utree::TreeNumbers;
use crate::tree::utree::Utree;

/// memory-saver companion data: per-direction subtree sizes, the
/// largest-subtree-first branch order driving placement, and the slot
/// configuration
pub struct Memsave {
    pub subtree_sizes: Vec<usize>,
    pub branch_traversal: Vec<usize>,
    pub config: MemoryConfig,
}

/// the reference tree and its partition, created once per process. CLVs
/// are fully precomputed up front, or materialized on demand when backed
/// by a binary store or running under the memory saver.
pub struct ReferenceTree {
    pub tree: Utree,
    pub nums: TreeNumbers,
    pub branch_ids: Vec<BranchId>,
    pub mapper: RtreeMapper,
    pub memsave: Option<Memsave>,
    partition: RwLock<Partition>,
    binary: Option<BinaryStore>,
    locks: Vec<Mutex<()>>,
}

impl ReferenceTree {
    /// build from newick + reference MSA. sequences in the MSA that match
    /// no tree tip are split off and returned as queries (combined-MSA
    /// input); tree tips without a reference sequence are fatal.
    pub fn from_files(
        tree_file: &Path,
        ref_msa: &mut Msa,
        mut model: SubstModel,
        options: &Options,
        memsave_config: Option<MemoryConfig>,
    ) -> Result<(Self, Msa)> {
        let (tree, mapper) = newick::parse_file(tree_file)?;
        let nums = tree.nums();

        let mut label_to_tip: HashMap<String, usize> = HashMap::new();
        for tip in 0..tree.tip_count {
            let label = tree.halves[tip]
                .label
                .clone()
                .ok_or_else(|| Error::parse(tree_file.to_string_lossy(), "unlabeled tip"))?;
            label_to_tip.insert(label, tip);
        }

        // failure tolerance: entries with unknown labels are queries
        let queries = ref_msa.extract(|s| !label_to_tip.contains_key(s.header()));

        if ref_msa.size() != nums.tip_nodes {
            log::warn!(
                "the reference MSA and tree have differing number of taxa: {} vs {}",
                ref_msa.size(),
                nums.tip_nodes
            );
        }

        if options.empirical_freqs {
            model.set_freqs(empirical_frequencies(ref_msa, model.states)?)?;
        }

        let clv_slots = memsave_config.map(|c| c.clv_slots);
        let mut partition = Partition::new(
            Arc::new(model),
            ref_msa.num_sites(),
            nums.tip_nodes,
            3 * nums.inner_nodes,
            nums.scalers,
            nums.branches,
            true,
            clv_slots,
        );

        for seq in ref_msa.iter() {
            let tip = label_to_tip
                .remove(seq.header())
                .expect("non-reference entries were split off above");
            partition.set_tip_states(tip, seq.sequence())?;
        }
        if !label_to_tip.is_empty() {
            let mut missing: Vec<String> = label_to_tip.into_keys().collect();
            missing.sort();
            return Err(Error::UnmatchedTaxon(missing));
        }

        let branch_ids = tree.branch_ids();
        log::debug!("tree length: {}", tree.tree_length());

        let memsave = match memsave_config {
            None => {
                precompute_clvs(&tree, &mut partition)?;
                None
            }
            Some(config) => {
                let subtree_sizes = tree.subtree_sizes();
                let branch_traversal = lsf_branch_traversal(&tree, &subtree_sizes, &branch_ids);
                let first = branch_traversal[0];
                partial_compute_clvs(&tree, &subtree_sizes, first, &mut partition)?;
                Some(Memsave {
                    subtree_sizes,
                    branch_traversal,
                    config,
                })
            }
        };

        let locks = (0..partition.total_clvs()).map(|_| Mutex::new(())).collect();
        let this = Self {
            tree,
            nums,
            branch_ids,
            mapper,
            memsave,
            partition: RwLock::new(partition),
            binary: None,
            locks,
        };

        let vroot = match &this.memsave {
            Some(ms) => ms.branch_traversal[0],
            None => this.tree.vroot,
        };
        let logl = this.ref_tree_logl(Some(vroot))?;
        log::debug!("reference tree log-likelihood: {logl}");

        Ok((this, queries))
    }

    /// restore tree and partition metadata from a binary store; CLV-like
    /// buffers stay on disk until requested
    pub fn from_binary(bin_file: &Path, options: &Options) -> Result<Self> {
        if options.memsave != crate::options::MemoryMode::Off {
            return Err(Error::invariant(
                "loading from binary into a memory saver partition is not supported",
            ));
        }
        let binary = BinaryStore::open(bin_file)?;
        let partition = binary.load_partition()?;
        let tree = binary.load_utree()?;
        let nums = tree.nums();
        let branch_ids = tree.branch_ids();
        let locks = (0..partition.total_clvs()).map(|_| Mutex::new(())).collect();
        Ok(Self {
            tree,
            nums,
            branch_ids,
            mapper: RtreeMapper::default(),
            memsave: None,
            partition: RwLock::new(partition),
            binary: Some(binary),
            locks,
        })
    }

    pub fn partition(&self) -> RwLockReadGuard<'_, Partition> {
        self.partition.read().expect("partition lock")
    }

    pub fn partition_mut(&self) -> RwLockWriteGuard<'_, Partition> {
        self.partition.write().expect("partition lock")
    }

    /// one half-edge per branch id, indexable by branch id
    pub fn branches(&self) -> Vec<usize> {
        self.tree.query_branches()
    }

    /// idempotent, per-CLV-serialized materialization of the partial
    /// behind a half-edge
    pub fn get_clv(&self, h: usize) -> Result<()> {
        let clv_index = self.tree.halves[h].clv_index;
        if self.clv_ready(clv_index) {
            return Ok(());
        }

        let _guard = self.locks[clv_index].lock().expect("clv lock");
        if self.clv_ready(clv_index) {
            return Ok(());
        }

        let mut part = self.partition_mut();
        if let Some(binary) = &self.binary {
            if part.is_char_tip(clv_index) {
                binary.load_tipchars(&mut part, clv_index)?;
            } else {
                binary.load_clv(&mut part, clv_index)?;
                if let Some(scaler) = self.tree.halves[h].scaler_index {
                    if part.scaler(scaler).is_none() {
                        binary.load_scaler(&mut part, scaler)?;
                    }
                }
            }
            Ok(())
        } else if let Some(ms) = &self.memsave {
            partial_compute_clvs(&self.tree, &ms.subtree_sizes, h, &mut part)
        } else {
            Err(Error::ClvUnavailable(clv_index))
        }
    }

    fn clv_ready(&self, clv_index: usize) -> bool {
        let part = self.partition();
        if part.is_char_tip(clv_index) {
            part.tipchar(clv_index).is_some()
        } else {
            part.clv(clv_index).is_some()
        }
    }

    /// log-likelihood of the reference tree evaluated at `vroot` (default:
    /// the tree root)
    pub fn ref_tree_logl(&self, vroot: Option<usize>) -> Result<f64> {
        let vroot = vroot.unwrap_or(self.tree.vroot);
        self.get_clv(vroot)?;
        self.get_clv(self.tree.back(vroot))?;
        let part = self.partition();
        let h = &self.tree.halves[vroot];
        let b = &self.tree.halves[self.tree.back(vroot)];
        let logl = kernel::edge_logl(
            &part,
            h.clv_index,
            h.scaler_index,
            b.clv_index,
            b.scaler_index,
            h.pmatrix_index,
            Range::full(part.sites),
            None,
        )?;
        if logl == f64::NEG_INFINITY {
            return Err(Error::NumericalUnderflow {
                branch: self.branch_ids[vroot],
                header: "reference tree".into(),
            });
        }
        Ok(logl)
    }

    /// fixed-topology tuning of the gamma shape and all branch lengths,
    /// iterated until the log-likelihood gain drops below `OPT_EPSILON`
    pub fn optimize_model_and_branches(&mut self) -> Result<f64> {
        if self.memsave.is_some() || self.binary.is_some() {
            return Err(Error::invariant(
                "model optimization requires a fully resident partition",
            ));
        }

        let mut logl = self.ref_tree_logl(None)?;
        for _round in 0..8 {
            self.optimize_alpha()?;
            self.optimize_branch_lengths()?;
            let next = self.ref_tree_logl(None)?;
            log::debug!("optimization round log-likelihood: {next}");
            if (next - logl).abs() < crate::OPT_EPSILON {
                logl = next;
                break;
            }
            logl = next;
        }
        Ok(logl)
    }

    fn optimize_alpha(&mut self) -> Result<()> {
        let mut failed = None;
        let best = {
            let eval = |alpha: f64| -> f64 {
                let mut part = self.partition_mut();
                let mut model = (*part.model).clone();
                model.set_alpha(alpha);
                part.model = Arc::new(model);
                if let Err(e) = precompute_clvs(&self.tree, &mut part) {
                    failed = Some(e);
                    return f64::NEG_INFINITY;
                }
                drop(part);
                self.ref_tree_logl(None).unwrap_or(f64::NEG_INFINITY)
            };
            optimize::golden_section(eval, 0.05, 10.0, 1e-2)
        };
        if let Some(e) = failed {
            return Err(e);
        }
        let mut part = self.partition_mut();
        let mut model = (*part.model).clone();
        model.set_alpha(best);
        part.model = Arc::new(model);
        precompute_clvs(&self.tree, &mut part)?;
        log::debug!("optimized alpha: {best}");
        Ok(())
    }

    fn optimize_branch_lengths(&mut self) -> Result<()> {
        let branches = self.branches();
        {
            let mut part = self.partition.write().expect("partition lock");
            precompute_clvs(&self.tree, &mut part)?;
        }
        for h in branches {
            let back = self.tree.back(h);
            let t = {
                let part = self.partition.read().expect("partition lock");
                let (t, _) = optimize::newton_branch(
                    &part,
                    self.tree.halves[h].clv_index,
                    self.tree.halves[h].scaler_index,
                    self.tree.halves[back].clv_index,
                    self.tree.halves[back].scaler_index,
                    self.tree.halves[h].length,
                    Range::full(part.sites),
                )?;
                t
            };
            self.tree.halves[h].length = t;
            self.tree.halves[back].length = t;
            self.partition
                .write()
                .expect("partition lock")
                .update_pmatrix(self.tree.halves[h].pmatrix_index, t);
        }
        // partials are refreshed under the new lengths for the next round
        let mut part = self.partition.write().expect("partition lock");
        precompute_clvs(&self.tree, &mut part)?;
        Ok(())
    }
}

/// compute every per-direction CLV by walking toward each tip in turn,
/// skipping directions that previous walks already covered
pub fn precompute_clvs(tree: &Utree, part: &mut Partition) -> Result<()> {
    let mut valid = vec![false; tree.halves.len()];
    let mut fresh = vec![false; part.pmatrix_count()];
    for tip in 0..tree.tip_count {
        let start = tree.back(tip);
        let traversal = tree.pruned_traversal(start, None, |h| {
            if valid[h] {
                false
            } else {
                valid[h] = true;
                true
            }
        });
        let (ops, matrices) = tree.create_operations(&traversal);
        for (pmatrix, length) in matrices {
            if !fresh[pmatrix] {
                fresh[pmatrix] = true;
                part.update_pmatrix(pmatrix, length);
            }
        }
        kernel::update_partials(part, &ops, Range::full(part.sites))?;
    }
    Ok(())
}

/// the largest-subtree-first branch order the memory saver walks during
/// placement; one half-edge per branch, first occurrence wins
fn lsf_branch_traversal(tree: &Utree, sizes: &[usize], branch_ids: &[BranchId]) -> Vec<usize> {
    let traversal = tree.pruned_traversal(tree.vroot, Some(sizes), |_| true);
    let mut seen = vec![false; tree.edge_count()];
    let mut branches = Vec::with_capacity(tree.edge_count());
    for h in traversal {
        let id = branch_ids[h];
        if !seen[id] {
            seen[id] = true;
            branches.push(h);
        }
    }
    branches
}

/// stationary frequencies observed in the reference alignment, ambiguity
/// codes excluded
fn empirical_frequencies(msa: &Msa, states: usize) -> Result<Vec<f64>> {
    let mut counts = vec![1.0f64; states]; // laplace smoothing
    for seq in msa {
        for &c in seq.sequence() {
            let mask = alphabet::encode_state(states, c)?;
            if mask.count_ones() == 1 {
                counts[mask.trailing_zeros() as usize] += 1.0;
            }
        }
    }
    let total: f64 = counts.iter().sum();
    Ok(counts.into_iter().map(|c| c / total).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::msa::Sequence;

    fn write_tree_file(dir: &tempfile::TempDir, newick: &str) -> std::path::PathBuf {
        let path = dir.path().join("ref.nwk");
        std::fs::write(&path, newick).unwrap();
        path
    }

    fn four_taxon_msa() -> Msa {
        let mut msa = Msa::new(4);
        msa.append(Sequence::new("A", b"ACGT".to_vec()));
        msa.append(Sequence::new("B", b"ACGA".to_vec()));
        msa.append(Sequence::new("C", b"ACGG".to_vec()));
        msa.append(Sequence::new("D", b"ACGC".to_vec()));
        msa
    }

    fn model() -> SubstModel {
        SubstModel::new("GTR", 4).unwrap()
    }

    #[test]
    fn builds_and_scores_a_reference() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_tree_file(&dir, "((A:0.1,B:0.1):0.1,(C:0.1,D:0.1):0.1);");
        let mut msa = four_taxon_msa();
        let (tree, queries) =
            ReferenceTree::from_files(&path, &mut msa, model(), &Options::default(), None).unwrap();
        assert!(queries.is_empty());
        let logl = tree.ref_tree_logl(None).unwrap();
        assert!(logl < 0.0);
        assert!(logl.is_finite());
    }

    #[test]
    fn unknown_sequences_become_queries() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_tree_file(&dir, "((A:0.1,B:0.1):0.1,(C:0.1,D:0.1):0.1);");
        let mut msa = four_taxon_msa();
        msa.append(Sequence::new("Q1", b"ACGT".to_vec()));
        let (_, queries) =
            ReferenceTree::from_files(&path, &mut msa, model(), &Options::default(), None).unwrap();
        assert_eq!(queries.size(), 1);
        assert_eq!(queries.get(0).header(), "Q1");
    }

    #[test]
    fn missing_reference_taxon_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_tree_file(&dir, "((A:0.1,B:0.1):0.1,(C:0.1,D:0.1):0.1);");
        let mut msa = four_taxon_msa();
        let mut short = Msa::new(4);
        for seq in msa.iter().filter(|s| s.header() != "D") {
            short.append(seq.clone());
        }
        msa = short;
        let err = ReferenceTree::from_files(&path, &mut msa, model(), &Options::default(), None);
        assert!(matches!(err, Err(Error::UnmatchedTaxon(ref v)) if v == &vec!["D".to_string()]));
    }

    #[test]
    fn logl_is_stable_across_evaluation_edges() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_tree_file(&dir, "((A:0.1,B:0.1):0.1,(C:0.1,D:0.1):0.1);");
        let mut msa = four_taxon_msa();
        let (tree, _) =
            ReferenceTree::from_files(&path, &mut msa, model(), &Options::default(), None).unwrap();
        let at_root = tree.ref_tree_logl(None).unwrap();
        for h in tree.branches() {
            let here = tree.ref_tree_logl(Some(h)).unwrap();
            assert!(
                (here - at_root).abs() < 1e-6,
                "edge {h}: {here} vs {at_root}"
            );
        }
    }

    #[test]
    fn empirical_frequencies_reflect_composition() {
        let mut msa = Msa::new(4);
        msa.append(Sequence::new("A", b"AAAA".to_vec()));
        msa.append(Sequence::new("B", b"AAAC".to_vec()));
        let freqs = empirical_frequencies(&msa, 4).unwrap();
        assert!(freqs[0] > freqs[1]);
        assert!((freqs.iter().sum::<f64>() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn memsave_reference_matches_full_reference() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_tree_file(&dir, "((A:0.1,B:0.1):0.1,(C:0.1,D:0.1):0.1);");

        let (full, _) = ReferenceTree::from_files(
            &path,
            &mut four_taxon_msa(),
            model(),
            &Options::default(),
            None,
        )
        .unwrap();
        let config = MemoryConfig {
            concurrent_branches: 2,
            preplace_lookup_enabled: true,
            clv_slots: 6,
        };
        let (saver, _) = ReferenceTree::from_files(
            &path,
            &mut four_taxon_msa(),
            model(),
            &Options::default(),
            Some(config),
        )
        .unwrap();

        let vroot = saver.memsave.as_ref().unwrap().branch_traversal[0];
        let a = full.ref_tree_logl(Some(vroot)).unwrap();
        let b = saver.ref_tree_logl(Some(vroot)).unwrap();
        assert!((a - b).abs() < 1e-9);
    }
}
