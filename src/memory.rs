use crate::engine::Range;
use crate::engine::model::SubstModel;
use crate::engine::partition::Partition;
use crate::error::Error;
use crate::error::Result;
use crate::io::msa::MsaInfo;
use crate::options::MemoryMode;
use crate::options::Options;
use crate::tree::utree::Utree;

/// convert number of bytes into a formatted string of the highest sensible
/// magnitude
pub fn format_byte_num(size: usize) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = size as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{}{}", size, UNITS[unit])
    } else {
        format!("{:.2}{}", value, UNITS[unit])
    }
}

/// parse strings like `12G`, `512M`, `1024` (plain bytes)
pub fn memstring_to_byte(s: &str) -> Result<usize> {
    let s = s.trim();
    let (digits, suffix): (String, String) = s.chars().partition(|c| c.is_ascii_digit() || *c == '.');
    let value: f64 = digits
        .parse()
        .map_err(|_| Error::parse(s, "malformed memory amount"))?;
    let factor: f64 = match suffix.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 1.0,
        "K" | "KB" | "KIB" => 1024.0,
        "M" | "MB" | "MIB" => 1024.0 * 1024.0,
        "G" | "GB" | "GIB" => 1024.0 * 1024.0 * 1024.0,
        "T" | "TB" | "TIB" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        _ => return Err(Error::parse(s, "unknown memory unit")),
    };
    Ok((value * factor) as usize)
}

/// total system memory, from /proc/meminfo where available
pub fn get_max_memory() -> usize {
    if let Ok(text) = std::fs::read_to_string("/proc/meminfo") {
        for line in text.lines() {
            if let Some(rest) = line.strip_prefix("MemTotal:") {
                let kb: usize = rest
                    .trim()
                    .trim_end_matches("kB")
                    .trim()
                    .parse()
                    .unwrap_or(0);
                if kb > 0 {
                    return kb * 1024;
                }
            }
        }
    }
    16 * 1024 * 1024 * 1024
}

/// estimated memory footprint of a run, given the input shapes. drives the
/// decision whether the memory saver has to kick in, and how many CLV
/// slots it can afford.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryFootprint {
    partition: usize,
    lookup: usize,
    presample: usize,
    refmsa: usize,
    qsistream: usize,
    allwork: usize,
    perclv: usize,
    clvbuffer: usize,
    maxnumclv: usize,
    logn: usize,
}

impl MemoryFootprint {
    pub fn new(
        ref_info: &MsaInfo,
        qry_info: &MsaInfo,
        model: &SubstModel,
        options: &Options,
    ) -> Self {
        let tips = ref_info.sequences;
        let inner = tips.saturating_sub(2);
        let branches = if tips >= 3 { 2 * tips - 3 } else { 0 };
        let sites = ref_info.sites;
        let states = model.states;
        let rate_cats = model.num_rate_cats();

        let perclv = sites * rate_cats * states * std::mem::size_of::<f64>();
        let maxnumclv = 3 * inner;
        let clvbuffer = maxnumclv * perclv;
        let tipchars = tips * sites * std::mem::size_of::<u32>();
        let scalers = 3 * inner * sites * std::mem::size_of::<u32>();
        let pmatrices = branches * rate_cats * states * states * std::mem::size_of::<f64>();

        let charmap = if states == 4 { 16 } else { 23 };
        let lookup = if options.prescoring {
            branches * sites * charmap * std::mem::size_of::<f64>()
        } else {
            0
        };

        let chunk = options.chunk_size.min(qry_info.sequences.max(1));
        let presample = chunk * branches * 3 * std::mem::size_of::<f64>();
        let refmsa = tips * sites;
        let qsistream = 2 * chunk * qry_info.sites.max(sites);
        let allwork = chunk * branches * 2 * std::mem::size_of::<usize>();

        let logn = (tips.max(2) as f64).log2().ceil() as usize + 2;

        Self {
            partition: clvbuffer + tipchars + scalers + pmatrices,
            lookup,
            presample,
            refmsa,
            qsistream,
            allwork,
            perclv,
            clvbuffer,
            maxnumclv,
            logn,
        }
    }

    pub fn total(&self) -> usize {
        self.partition + self.lookup + self.presample + self.refmsa + self.qsistream + self.allwork
    }

    /// footprint when only the minimum number of CLVs is resident
    pub fn minimum(&self) -> usize {
        let partition_logn = self.partition - self.clvbuffer + self.logn * self.perclv;
        partition_logn + self.presample + self.refmsa + self.qsistream + self.allwork
    }

    pub fn clv(&self) -> usize {
        self.perclv
    }

    pub fn maximum_required_clvs(&self) -> usize {
        self.maxnumclv
    }

    pub fn logn_clvs(&self) -> usize {
        self.logn
    }

    pub fn lookup(&self) -> usize {
        self.lookup
    }
}

/// resolved memory-saver configuration: how many CLV slots the partition
/// may keep resident, and whether the preplacement lookup still fits
#[derive(Debug, Clone, Copy)]
pub struct MemoryConfig {
    pub concurrent_branches: usize,
    pub preplace_lookup_enabled: bool,
    pub clv_slots: usize,
}

impl MemoryConfig {
    pub fn new(
        footprint: &MemoryFootprint,
        constraint: usize,
        concurrent_branches: usize,
    ) -> Result<Self> {
        let maxmem = get_max_memory();
        if constraint > maxmem {
            log::warn!(
                "specified memory limit of {} exceeds the system maximum of {}, continuing with the specified limit",
                format_byte_num(constraint),
                format_byte_num(maxmem)
            );
        }

        let minmem = footprint.minimum();
        if constraint < minmem {
            return Err(Error::MemoryInfeasible {
                limit: format_byte_num(constraint),
                minimum: format_byte_num(minmem),
            });
        }

        // how much above the minimum can we play with?
        let mut budget = constraint - minmem;

        let mut preplace_lookup_enabled = false;
        if footprint.lookup() > 0 && footprint.lookup() < budget {
            budget -= footprint.lookup();
            preplace_lookup_enabled = true;
        }

        let extra_clv_slots = budget / footprint.clv().max(1);
        let clv_slots = (footprint.logn_clvs() + extra_clv_slots)
            .min(footprint.maximum_required_clvs())
            .max(footprint.logn_clvs());

        Ok(Self {
            concurrent_branches,
            preplace_lookup_enabled,
            clv_slots,
        })
    }
}

/// high level administration of the memory saver mode
#[derive(Debug, Clone, Copy, Default)]
pub struct MemorySaver {
    pub mode: MemoryMode,
    pub footprint: MemoryFootprint,
    pub config: Option<MemoryConfig>,
}

impl MemorySaver {
    pub fn new(
        ref_info: &MsaInfo,
        qry_info: &MsaInfo,
        model: &SubstModel,
        options: &Options,
    ) -> Result<Self> {
        let footprint = MemoryFootprint::new(ref_info, qry_info, model, options);
        let system_constraint = get_max_memory();
        let user_constraint = match &options.max_memory {
            Some(s) if s != "auto" => memstring_to_byte(s)?,
            _ => system_constraint,
        };
        let constraint = system_constraint.min(user_constraint);

        let config = match options.memsave {
            MemoryMode::Off => None,
            MemoryMode::Full => Some(MemoryConfig::new(
                &footprint,
                footprint.minimum(),
                options.concurrent_branches,
            )?),
            MemoryMode::Auto => {
                if footprint.total() as f64 > constraint as f64 * 0.95 {
                    Some(MemoryConfig::new(
                        &footprint,
                        constraint,
                        options.concurrent_branches,
                    )?)
                } else {
                    None
                }
            }
        };

        Ok(Self {
            mode: options.memsave,
            footprint,
            config,
        })
    }

    pub fn is_active(&self) -> bool {
        self.config.is_some()
    }
}

/// compute all CLVs needed so that both `node` and `node.back` hold valid
/// partials, recomputing as little as possible under the slot budget.
///
/// already-resident CLVs found along the largest-subtree-first traversal
/// are pinned in place (most expensive first, up to the slot budget minus a
/// reserve that always suffices to finish), so their subtrees are skipped.
/// no CLV is left pinned on return.
pub fn partial_compute_clvs(
    tree: &Utree,
    subtree_sizes: &[usize],
    node: usize,
    part: &mut Partition,
) -> Result<()> {
    let vroot = if tree.is_tip(node) {
        tree.back(node)
    } else {
        node
    };

    // identify resident CLVs as pin candidates, costed by subtree size
    let mut candidates: Vec<(usize, usize)> = Vec::new();
    tree.pruned_traversal(vroot, Some(subtree_sizes), |h| {
        let clv = tree.halves[h].clv_index;
        if part.is_char_tip(clv) {
            return true;
        }
        if part.is_slotted(clv) {
            candidates.push((clv, subtree_sizes[h]));
            false
        } else {
            true
        }
    });

    // keep the most valuable candidates, leaving enough free slots to
    // finish any remaining computation
    let reserve = (tree.tip_count.max(2) as f64).log2().ceil() as usize + 2;
    let budget = part.slottable_size().saturating_sub(reserve);
    candidates.sort_by(|a, b| b.1.cmp(&a.1));
    candidates.truncate(budget);
    let keep: std::collections::HashSet<usize> = candidates.iter().map(|&(clv, _)| clv).collect();

    // traverse again, pinning the chosen CLVs in place and collecting the
    // operations for everything below them
    let mut pins = Vec::new();
    let traversal = tree.pruned_traversal(vroot, Some(subtree_sizes), |h| {
        let clv = tree.halves[h].clv_index;
        if part.is_char_tip(clv) {
            return true;
        }
        if part.is_slotted(clv) && keep.contains(&clv) {
            pins.push(clv);
            false
        } else {
            true
        }
    });
    for &clv in &pins {
        part.pin(clv);
    }

    let (ops, matrices) = tree.create_operations(&traversal);
    for (pmatrix, length) in matrices {
        part.update_pmatrix(pmatrix, length);
    }

    // run the operations one by one, keeping every freshly computed parent
    // pinned until its own parent consumes it. the pending set stays within
    // the reserve, so slot acquisition cannot fail here.
    let range = Range::full(part.sites);
    let mut result = Ok(());
    for op in &ops {
        result = crate::engine::kernel::update_partials(part, std::slice::from_ref(op), range);
        if result.is_err() {
            break;
        }
        part.pin(op.parent_clv);
        for child in [op.child1_clv, op.child2_clv] {
            if !part.is_char_tip(child) {
                part.unpin(child);
            }
        }
    }

    // pins must never outlive this call, success or not
    part.unpin_all();
    result?;

    debug_assert_eq!(part.num_pinned(), 0);
    debug_assert!(part.is_slotted(tree.halves[vroot].clv_index) || part.is_char_tip(tree.halves[vroot].clv_index));
    debug_assert!(
        part.is_slotted(tree.halves[tree.back(vroot)].clv_index)
            || part.is_char_tip(tree.halves[tree.back(vroot)].clv_index)
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_strings_parse_both_ways() {
        assert_eq!(memstring_to_byte("512M").unwrap(), 512 * 1024 * 1024);
        assert_eq!(memstring_to_byte("12G").unwrap(), 12 * 1024 * 1024 * 1024);
        assert_eq!(memstring_to_byte("1024").unwrap(), 1024);
        assert!(memstring_to_byte("12Q").is_err());
        assert_eq!(format_byte_num(512 * 1024 * 1024), "512.00MiB");
    }

    #[test]
    fn footprint_minimum_is_below_total() {
        let ref_info = MsaInfo::new(100, 500, vec![false; 500]);
        let qry_info = MsaInfo::new(1000, 500, vec![false; 500]);
        let model = SubstModel::new("GTR", 4).unwrap();
        let options = Options::default();
        let fp = MemoryFootprint::new(&ref_info, &qry_info, &model, &options);
        assert!(fp.minimum() < fp.total());
        assert!(fp.logn_clvs() >= 2);
    }

    #[test]
    fn infeasible_budget_is_rejected() {
        let ref_info = MsaInfo::new(100, 500, vec![false; 500]);
        let qry_info = MsaInfo::new(1000, 500, vec![false; 500]);
        let model = SubstModel::new("GTR", 4).unwrap();
        let options = Options::default();
        let fp = MemoryFootprint::new(&ref_info, &qry_info, &model, &options);
        let err = MemoryConfig::new(&fp, 1024, 4);
        assert!(matches!(err, Err(Error::MemoryInfeasible { .. })));
    }

    #[test]
    fn auto_mode_stays_off_when_memory_suffices() {
        let ref_info = MsaInfo::new(10, 50, vec![false; 50]);
        let qry_info = MsaInfo::new(10, 50, vec![false; 50]);
        let model = SubstModel::new("GTR", 4).unwrap();
        let options = Options {
            memsave: MemoryMode::Auto,
            ..Options::default()
        };
        let saver = MemorySaver::new(&ref_info, &qry_info, &model, &options).unwrap();
        assert!(!saver.is_active());
    }
}
