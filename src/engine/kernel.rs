use std::sync::Arc;

use crate::engine::Range;
use crate::engine::partition::Partition;
use crate::error::Error;
use crate::error::Result;

/// one postorder partial update: combine two child CLVs (or tip character
/// buffers) across their edges into the parent CLV
#[derive(Debug, Clone, Copy)]
pub struct Operation {
    pub parent_clv: usize,
    pub parent_scaler: Option<usize>,
    pub child1_clv: usize,
    pub child1_scaler: Option<usize>,
    pub child1_matrix: usize,
    pub child2_clv: usize,
    pub child2_scaler: Option<usize>,
    pub child2_matrix: usize,
}

enum Child {
    Clv(Arc<Vec<f64>>),
    Tip(Arc<Vec<u32>>),
}

fn resolve(part: &Partition, clv_index: usize) -> Result<Child> {
    if part.is_char_tip(clv_index) {
        part.tipchar_arc(clv_index)
            .map(Child::Tip)
            .ok_or(Error::ClvUnavailable(clv_index))
    } else {
        part.clv_arc(clv_index)
            .map(Child::Clv)
            .ok_or(Error::ClvUnavailable(clv_index))
    }
}

/// inner sum `sum_k P[i,k] * clv[k]` over a tip character bitmask
#[inline]
fn tip_term(pmat_row: &[f64], mask: u32) -> f64 {
    let mut term = 0.0;
    let mut m = mask;
    let mut k = 0;
    while m != 0 {
        if m & 1 == 1 {
            term += pmat_row[k];
        }
        m >>= 1;
        k += 1;
    }
    term
}

/// execute partial updates in order, restricted to the given site window.
/// parent scalers accumulate child scaler counts and per-site rescaling.
pub fn update_partials(part: &mut Partition, ops: &[Operation], range: Range) -> Result<()> {
    for op in ops {
        update_partial(part, op, range)?;
    }
    Ok(())
}

fn update_partial(part: &mut Partition, op: &Operation, range: Range) -> Result<()> {
    let states = part.states();
    let rate_cats = part.rate_cats();
    let span = states * rate_cats;

    let child1 = resolve(part, op.child1_clv)?;
    let child2 = resolve(part, op.child2_clv)?;
    let scaler1 = op.child1_scaler.and_then(|i| part.scaler_arc(i));
    let scaler2 = op.child2_scaler.and_then(|i| part.scaler_arc(i));
    let m1 = part.pmatrix(op.child1_matrix).to_vec();
    let m2 = part.pmatrix(op.child2_matrix).to_vec();

    // under the memory saver, acquiring the parent slot must not evict the
    // children mid-operation. pins held by the caller stay in place.
    let keep1 = part.is_pinned(op.child1_clv);
    let keep2 = part.is_pinned(op.child2_clv);
    if let Child::Clv(_) = child1 {
        part.pin(op.child1_clv);
    }
    if let Child::Clv(_) = child2 {
        part.pin(op.child2_clv);
    }

    let mut scale_events: Vec<(usize, u32)> = Vec::new();
    {
        let parent = part.clv_mut(op.parent_clv)?;
        for site in range.begin..range.end() {
            let offset = site * span;
            for cat in 0..rate_cats {
                let mat_off = cat * states * states;
                let cat_off = offset + cat * states;
                for i in 0..states {
                    let row1 = &m1[mat_off + i * states..mat_off + (i + 1) * states];
                    let row2 = &m2[mat_off + i * states..mat_off + (i + 1) * states];
                    let t1 = match &child1 {
                        Child::Tip(chars) => tip_term(row1, chars[site]),
                        Child::Clv(clv) => {
                            let c = &clv[cat_off..cat_off + states];
                            row1.iter().zip(c).map(|(p, v)| p * v).sum()
                        }
                    };
                    let t2 = match &child2 {
                        Child::Tip(chars) => tip_term(row2, chars[site]),
                        Child::Clv(clv) => {
                            let c = &clv[cat_off..cat_off + states];
                            row2.iter().zip(c).map(|(p, v)| p * v).sum()
                        }
                    };
                    parent[cat_off + i] = t1 * t2;
                }
            }

            if op.parent_scaler.is_some() {
                let inherited = scaler1.as_ref().map_or(0, |s| s[site])
                    + scaler2.as_ref().map_or(0, |s| s[site]);
                let site_clv = &mut parent[offset..offset + span];
                let mut count = inherited;
                if site_clv.iter().all(|&v| v < crate::SCALE_THRESHOLD) {
                    for v in site_clv.iter_mut() {
                        *v *= crate::SCALE_FACTOR;
                    }
                    count += 1;
                }
                if count > 0 || inherited > 0 {
                    scale_events.push((site, count));
                }
            }
        }
    }

    if !keep1 {
        if let Child::Clv(_) = child1 {
            part.unpin(op.child1_clv);
        }
    }
    if !keep2 {
        if let Child::Clv(_) = child2 {
            part.unpin(op.child2_clv);
        }
    }

    if let Some(scaler_index) = op.parent_scaler {
        let scaler = part.scaler_mut(scaler_index);
        for site in range.begin..range.end() {
            scaler[site] = 0;
        }
        for (site, count) in scale_events {
            scaler[site] = count;
        }
    }
    Ok(())
}

/// log-likelihood of the tree evaluated at an edge, given valid partials at
/// both of its ends. when `persite` is given, it receives per-site values.
#[allow(clippy::too_many_arguments)]
pub fn edge_logl(
    part: &Partition,
    parent_clv: usize,
    parent_scaler: Option<usize>,
    child_clv: usize,
    child_scaler: Option<usize>,
    pmatrix_index: usize,
    range: Range,
    mut persite: Option<&mut [f64]>,
) -> Result<f64> {
    let pmatrix = part.pmatrix(pmatrix_index);
    edge_logl_with(
        part,
        parent_clv,
        parent_scaler,
        child_clv,
        child_scaler,
        pmatrix,
        range,
        persite.as_deref_mut(),
    )
    .map(|(logl, _, _)| logl)
}

/// log-likelihood plus first and second derivative with respect to the
/// branch length of the evaluation edge
#[allow(clippy::too_many_arguments)]
pub fn edge_derivatives(
    part: &Partition,
    parent_clv: usize,
    parent_scaler: Option<usize>,
    child_clv: usize,
    child_scaler: Option<usize>,
    branch_length: f64,
    range: Range,
) -> Result<(f64, f64, f64)> {
    let states = part.states();
    let rate_cats = part.rate_cats();
    let len = rate_cats * states * states;
    let mut p = vec![0.0; len];
    let mut d1 = vec![0.0; len];
    let mut d2 = vec![0.0; len];
    part.model.fill_pmatrix(&mut p, branch_length);
    part.model.fill_derivatives(&mut d1, &mut d2, branch_length);

    let (logl, dl1, dl2) = accumulate(
        part,
        parent_clv,
        parent_scaler,
        child_clv,
        child_scaler,
        &p,
        Some((&d1, &d2)),
        range,
        None,
    )?;
    Ok((logl, dl1, dl2))
}

#[allow(clippy::too_many_arguments)]
fn edge_logl_with(
    part: &Partition,
    parent_clv: usize,
    parent_scaler: Option<usize>,
    child_clv: usize,
    child_scaler: Option<usize>,
    pmatrix: &[f64],
    range: Range,
    persite: Option<&mut [f64]>,
) -> Result<(f64, f64, f64)> {
    accumulate(
        part,
        parent_clv,
        parent_scaler,
        child_clv,
        child_scaler,
        pmatrix,
        None,
        range,
        persite,
    )
}

/// shared site loop of the edge likelihood and its derivatives. for
/// reversible models the edge may be evaluated from either side, so a tip
/// end is always moved to the child position.
#[allow(clippy::too_many_arguments)]
fn accumulate(
    part: &Partition,
    parent_clv: usize,
    parent_scaler: Option<usize>,
    child_clv: usize,
    child_scaler: Option<usize>,
    pmatrix: &[f64],
    derivs: Option<(&[f64], &[f64])>,
    range: Range,
    mut persite: Option<&mut [f64]>,
) -> Result<(f64, f64, f64)> {
    let states = part.states();
    let rate_cats = part.rate_cats();
    let weight = 1.0 / rate_cats as f64;
    let freqs = &part.model.freqs;

    let (parent_clv, parent_scaler, child_clv, child_scaler) =
        if part.is_char_tip(parent_clv) && !part.is_char_tip(child_clv) {
            (child_clv, child_scaler, parent_clv, parent_scaler)
        } else {
            (parent_clv, parent_scaler, child_clv, child_scaler)
        };

    let parent = match resolve(part, parent_clv)? {
        Child::Clv(clv) => clv,
        Child::Tip(_) => {
            return Err(Error::invariant(
                "edge likelihood requires a real CLV on at least one end",
            ));
        }
    };
    let child = resolve(part, child_clv)?;
    let pscaler = parent_scaler.and_then(|i| part.scaler_arc(i));
    let cscaler = child_scaler.and_then(|i| part.scaler_arc(i));

    let log_scale = crate::SCALE_THRESHOLD.ln();
    let mut logl = 0.0;
    let mut dl1 = 0.0;
    let mut dl2 = 0.0;

    for site in range.begin..range.end() {
        let offset = site * rate_cats * states;
        let mut site_lk = 0.0;
        let mut site_d1 = 0.0;
        let mut site_d2 = 0.0;
        for cat in 0..rate_cats {
            let mat_off = cat * states * states;
            let cat_off = offset + cat * states;
            for j in 0..states {
                let row = &pmatrix[mat_off + j * states..mat_off + (j + 1) * states];
                let inner = match &child {
                    Child::Tip(chars) => tip_term(row, chars[site]),
                    Child::Clv(clv) => {
                        let c = &clv[cat_off..cat_off + states];
                        row.iter().zip(c).map(|(p, v)| p * v).sum()
                    }
                };
                let outer = parent[cat_off + j] * freqs[j] * weight;
                site_lk += outer * inner;
                if let Some((d1, d2)) = derivs {
                    let row1 = &d1[mat_off + j * states..mat_off + (j + 1) * states];
                    let row2 = &d2[mat_off + j * states..mat_off + (j + 1) * states];
                    let (inner1, inner2) = match &child {
                        Child::Tip(chars) => {
                            (tip_term(row1, chars[site]), tip_term(row2, chars[site]))
                        }
                        Child::Clv(clv) => {
                            let c = &clv[cat_off..cat_off + states];
                            (
                                row1.iter().zip(c).map(|(p, v)| p * v).sum(),
                                row2.iter().zip(c).map(|(p, v)| p * v).sum(),
                            )
                        }
                    };
                    site_d1 += outer * inner1;
                    site_d2 += outer * inner2;
                }
            }
        }

        let scale_factors =
            pscaler.as_ref().map_or(0, |s| s[site]) + cscaler.as_ref().map_or(0, |s| s[site]);
        let pw = part.pattern_weights[site] as f64;
        let mut site_logl = site_lk.ln() * pw;
        if scale_factors > 0 {
            site_logl += scale_factors as f64 * log_scale;
        }
        logl += site_logl;
        if derivs.is_some() && site_lk > 0.0 {
            dl1 += pw * site_d1 / site_lk;
            dl2 += pw * (site_d2 * site_lk - site_d1 * site_d1) / (site_lk * site_lk);
        }
        if let Some(out) = persite.as_deref_mut() {
            out[site] = site_logl;
        }
    }
    Ok((logl, dl1, dl2))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::model::SubstModel;

    /// 3-tip partition: tips 0..3, inner clv 3, pmatrices 0..3
    fn star_partition() -> Partition {
        let model = Arc::new(SubstModel::new("JC69", 1).unwrap());
        let mut part = Partition::new(model, 4, 3, 1, 1, 3, true, None);
        part.set_tip_states(0, b"ACGT").unwrap();
        part.set_tip_states(1, b"ACGT").unwrap();
        part.set_tip_states(2, b"ACGT").unwrap();
        for m in 0..3 {
            part.update_pmatrix(m, 0.1);
        }
        part
    }

    fn star_op() -> Operation {
        Operation {
            parent_clv: 3,
            parent_scaler: Some(0),
            child1_clv: 0,
            child1_scaler: None,
            child1_matrix: 0,
            child2_clv: 1,
            child2_scaler: None,
            child2_matrix: 1,
        }
    }

    #[test]
    fn identical_tips_give_higher_likelihood_than_divergent() {
        let mut part = star_partition();
        let range = Range::full(4);
        update_partials(&mut part, &[star_op()], range).unwrap();
        let same = edge_logl(&part, 3, Some(0), 2, None, 2, range, None).unwrap();

        part.set_tip_states(2, b"TGCA").unwrap();
        let diff = edge_logl(&part, 3, Some(0), 2, None, 2, range, None).unwrap();
        assert!(same > diff);
    }

    #[test]
    fn persite_logl_sums_to_total() {
        let mut part = star_partition();
        let range = Range::full(4);
        update_partials(&mut part, &[star_op()], range).unwrap();
        let mut persite = vec![0.0; 4];
        let total = edge_logl(&part, 3, Some(0), 2, None, 2, range, Some(&mut persite)).unwrap();
        let sum: f64 = persite.iter().sum();
        assert!((total - sum).abs() < 1e-12);
    }

    #[test]
    fn edge_sides_are_interchangeable() {
        let mut part = star_partition();
        let range = Range::full(4);
        update_partials(&mut part, &[star_op()], range).unwrap();
        let a = edge_logl(&part, 3, Some(0), 2, None, 2, range, None).unwrap();
        let b = edge_logl(&part, 2, None, 3, Some(0), 2, range, None).unwrap();
        assert!((a - b).abs() < 1e-10);
    }

    #[test]
    fn derivative_sign_brackets_the_optimum() {
        let mut part = star_partition();
        // divergent third tip, so some positive branch length is optimal
        part.set_tip_states(2, b"AAGT").unwrap();
        let range = Range::full(4);
        update_partials(&mut part, &[star_op()], range).unwrap();
        let (_, d_small, _) = edge_derivatives(&part, 3, Some(0), 2, None, 1e-6, range).unwrap();
        let (_, d_large, _) = edge_derivatives(&part, 3, Some(0), 2, None, 10.0, range).unwrap();
        assert!(d_small > 0.0);
        assert!(d_large < 0.0);
    }
}
