use crate::engine::Range;
use crate::engine::kernel;
use crate::engine::kernel::Operation;
use crate::engine::partition::Partition;
use crate::error::Result;

// probability matrix slots of a tiny partition, one per unique branch
pub const PMAT_PROXIMAL: usize = 0;
pub const PMAT_DISTAL: usize = 1;
pub const PMAT_PENDANT: usize = 2;

/// geometry of the three-branch star around a tiny tree's inner node
#[derive(Debug, Clone)]
pub struct Triplet {
    pub inner_clv: usize,
    pub inner_scaler: Option<usize>,
    pub proximal_clv: usize,
    pub proximal_scaler: Option<usize>,
    pub distal_clv: usize,
    pub distal_scaler: Option<usize>,
    pub pendant_clv: usize,
    pub pendant_scaler: Option<usize>,
    /// [proximal, distal, pendant]
    pub lengths: [f64; 3],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Leg {
    Proximal,
    Distal,
    Pendant,
}

impl Triplet {
    fn endpoint(&self, leg: Leg) -> (usize, Option<usize>, usize) {
        match leg {
            Leg::Proximal => (self.proximal_clv, self.proximal_scaler, PMAT_PROXIMAL),
            Leg::Distal => (self.distal_clv, self.distal_scaler, PMAT_DISTAL),
            Leg::Pendant => (self.pendant_clv, self.pendant_scaler, PMAT_PENDANT),
        }
    }

    fn length(&self, leg: Leg) -> f64 {
        match leg {
            Leg::Proximal => self.lengths[0],
            Leg::Distal => self.lengths[1],
            Leg::Pendant => self.lengths[2],
        }
    }

    fn set_length(&mut self, leg: Leg, t: f64) {
        match leg {
            Leg::Proximal => self.lengths[0] = t,
            Leg::Distal => self.lengths[1] = t,
            Leg::Pendant => self.lengths[2] = t,
        }
    }

    /// partial update of the inner CLV toward the pendant tip, needed
    /// before evaluating or precomputing query likelihoods
    pub fn pendant_update(&self) -> Operation {
        self.toward(Leg::Pendant)
    }

    /// partial update of the inner CLV toward the given leg, combining the
    /// other two legs as children
    fn toward(&self, leg: Leg) -> Operation {
        let legs = [Leg::Proximal, Leg::Distal, Leg::Pendant];
        let mut children = legs.iter().copied().filter(|&l| l != leg);
        let (c1, s1, m1) = self.endpoint(children.next().unwrap());
        let (c2, s2, m2) = self.endpoint(children.next().unwrap());
        Operation {
            parent_clv: self.inner_clv,
            parent_scaler: self.inner_scaler,
            child1_clv: c1,
            child1_scaler: s1,
            child1_matrix: m1,
            child2_clv: c2,
            child2_scaler: s2,
            child2_matrix: m2,
        }
    }
}

/// newton-raphson on one branch length, maximizing the edge log-likelihood
/// between two fixed partials. returns the optimized length and the
/// log-likelihood at it.
#[allow(clippy::too_many_arguments)]
pub fn newton_branch(
    part: &Partition,
    parent_clv: usize,
    parent_scaler: Option<usize>,
    child_clv: usize,
    child_scaler: Option<usize>,
    start: f64,
    range: Range,
) -> Result<(f64, f64)> {
    let mut t = start.clamp(crate::MIN_BRANCH_LENGTH, crate::MAX_BRANCH_LENGTH);
    for _ in 0..crate::MAX_NEWTON_ITERS {
        let (_, d1, d2) = kernel::edge_derivatives(
            part,
            parent_clv,
            parent_scaler,
            child_clv,
            child_scaler,
            t,
            range,
        )?;
        if d1.abs() < crate::OPT_BRANCH_EPSILON {
            break;
        }
        let proposal = if d2 < 0.0 {
            t - d1 / d2
        } else if d1 > 0.0 {
            // wrong curvature, move toward longer branches geometrically
            t * 2.0
        } else {
            t / 2.0
        };
        let next = if proposal.is_finite() {
            proposal.clamp(crate::MIN_BRANCH_LENGTH, crate::MAX_BRANCH_LENGTH)
        } else {
            break;
        };
        if (next - t).abs() < 1e-12 {
            t = next;
            break;
        }
        t = next;
    }
    let (logl, _, _) = kernel::edge_derivatives(
        part,
        parent_clv,
        parent_scaler,
        child_clv,
        child_scaler,
        t,
        range,
    )?;
    Ok((t, logl))
}

/// round-robin newton sweeps over the three branches of a tiny tree until
/// the log-likelihood improvement drops below `OPT_EPSILON`. leaves the
/// optimized lengths in the triplet and their matrices in the partition;
/// the inner partial is left pointing toward the pendant leg.
pub fn optimize_triplet(part: &mut Partition, trip: &mut Triplet, range: Range) -> Result<f64> {
    part.update_pmatrix(PMAT_PROXIMAL, trip.lengths[0]);
    part.update_pmatrix(PMAT_DISTAL, trip.lengths[1]);
    part.update_pmatrix(PMAT_PENDANT, trip.lengths[2]);

    let mut prev_logl = f64::NEG_INFINITY;
    let mut logl = f64::NEG_INFINITY;
    for _sweep in 0..32 {
        for leg in [Leg::Proximal, Leg::Distal, Leg::Pendant] {
            kernel::update_partials(part, &[trip.toward(leg)], range)?;
            let (clv, scaler, pmat) = trip.endpoint(leg);
            let (t, l) = newton_branch(
                part,
                trip.inner_clv,
                trip.inner_scaler,
                clv,
                scaler,
                trip.length(leg),
                range,
            )?;
            trip.set_length(leg, t);
            part.update_pmatrix(pmat, t);
            logl = l;
        }
        if (logl - prev_logl).abs() < crate::OPT_EPSILON {
            break;
        }
        prev_logl = logl;
    }
    Ok(logl)
}

/// derivative-free maximization on a bracket, for the gamma shape
pub fn golden_section(mut f: impl FnMut(f64) -> f64, mut a: f64, mut b: f64, eps: f64) -> f64 {
    let inv_phi = (5f64.sqrt() - 1.0) / 2.0;
    let mut c = b - inv_phi * (b - a);
    let mut d = a + inv_phi * (b - a);
    let mut fc = f(c);
    let mut fd = f(d);
    while (b - a).abs() > eps {
        if fc > fd {
            b = d;
            d = c;
            fd = fc;
            c = b - inv_phi * (b - a);
            fc = f(c);
        } else {
            a = c;
            c = d;
            fc = fd;
            d = a + inv_phi * (b - a);
            fd = f(d);
        }
    }
    (a + b) / 2.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::model::SubstModel;
    use std::sync::Arc;

    /// tiny-tree shaped partition: three tips, inner clv 3, proximal clv 4
    fn tiny() -> (Partition, Triplet) {
        let model = Arc::new(SubstModel::new("JC69", 4).unwrap());
        let mut part = Partition::new(model, 8, 3, 3, 3, 3, true, None);
        part.set_tip_states(0, b"ACGTACGT").unwrap();
        part.set_tip_states(1, b"ACGAACGA").unwrap();
        part.set_tip_states(2, b"ACGTACGA").unwrap();
        let trip = Triplet {
            inner_clv: 3,
            inner_scaler: Some(1),
            proximal_clv: 0,
            proximal_scaler: None,
            distal_clv: 1,
            distal_scaler: None,
            pendant_clv: 2,
            pendant_scaler: None,
            lengths: [0.05, 0.05, crate::DEFAULT_BRANCH_LENGTH],
        };
        (part, trip)
    }

    #[test]
    fn triplet_optimization_improves_logl() {
        let (mut part, mut trip) = tiny();
        let range = Range::full(8);

        part.update_pmatrix(PMAT_PROXIMAL, trip.lengths[0]);
        part.update_pmatrix(PMAT_DISTAL, trip.lengths[1]);
        part.update_pmatrix(PMAT_PENDANT, trip.lengths[2]);
        kernel::update_partials(&mut part, &[trip.toward(Leg::Pendant)], range).unwrap();
        let before = kernel::edge_logl(&part, 3, Some(1), 2, None, PMAT_PENDANT, range, None).unwrap();

        let after = optimize_triplet(&mut part, &mut trip, range).unwrap();
        assert!(after >= before - 1e-9);
        assert!(trip.lengths.iter().all(|&l| l >= crate::MIN_BRANCH_LENGTH));
    }

    #[test]
    fn newton_finds_interior_optimum() {
        let (mut part, trip) = tiny();
        let range = Range::full(8);
        part.update_pmatrix(PMAT_PROXIMAL, 0.05);
        part.update_pmatrix(PMAT_DISTAL, 0.05);
        part.update_pmatrix(PMAT_PENDANT, 0.05);
        kernel::update_partials(&mut part, &[trip.toward(Leg::Pendant)], range).unwrap();

        let (t, logl) = newton_branch(&part, 3, Some(1), 2, None, 0.05, range).unwrap();
        // optimum should beat both a shorter and a longer guess
        let shorter = (t * 0.5).max(crate::MIN_BRANCH_LENGTH);
        let longer = (t * 2.0).min(crate::MAX_BRANCH_LENGTH);
        let (logl_shorter, _, _) =
            kernel::edge_derivatives(&part, 3, Some(1), 2, None, shorter, range).unwrap();
        let (logl_longer, _, _) =
            kernel::edge_derivatives(&part, 3, Some(1), 2, None, longer, range).unwrap();
        assert!(logl >= logl_shorter - 1e-9);
        assert!(logl >= logl_longer - 1e-9);
    }

    #[test]
    fn golden_section_finds_parabola_peak() {
        let peak = golden_section(|x| -(x - 0.7) * (x - 0.7), 0.0, 2.0, 1e-8);
        assert!((peak - 0.7).abs() < 1e-6);
    }
}
