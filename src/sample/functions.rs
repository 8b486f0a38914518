use rayon::prelude::*;

use crate::options::Options;
use crate::sample::pquery::PQuery;
use crate::sample::sample::Sample;

/// normalized likelihood weight ratios per pquery. subtracting the maximum
/// before exponentiation keeps the softmax finite for any input.
pub fn compute_and_set_lwr(sample: &mut Sample) {
    sample.pquerys_mut().par_iter_mut().for_each(|pq| {
        if pq.is_empty() {
            return;
        }
        let max = pq
            .iter()
            .map(|p| p.likelihood())
            .fold(f64::NEG_INFINITY, f64::max);
        let exps: Vec<f64> = pq.iter().map(|p| (p.likelihood() - max).exp()).collect();
        let total: f64 = exps.iter().sum();
        for (p, e) in pq.placements_mut().iter_mut().zip(exps) {
            p.set_lwr(e / total);
        }
    });
}

pub fn sort_by_lwr(pq: &mut PQuery) {
    pq.placements_mut()
        .sort_by(|a, b| b.lwr().partial_cmp(&a.lwr()).expect("comparable lwr"));
}

pub fn sort_by_logl(pq: &mut PQuery) {
    pq.placements_mut().sort_by(|a, b| {
        b.likelihood()
            .partial_cmp(&a.likelihood())
            .expect("comparable likelihood")
    });
}

/// number of placements covering the top `x` fraction by lwr; sorts
pub fn until_top_percent(pq: &mut PQuery, x: f64) -> usize {
    sort_by_lwr(pq);
    (x * pq.size() as f64).ceil() as usize
}

/// number of lwr-sorted placements until the accumulated weight passes
/// `thresh`, bounded by `[min, max]`; sorts
pub fn until_accumulated_reached(pq: &mut PQuery, thresh: f64, min: usize, max: usize) -> usize {
    sort_by_lwr(pq);
    let mut sum = 0.0;
    let mut num_summed = 0;
    for p in pq.iter() {
        if num_summed >= max || sum >= thresh {
            break;
        }
        sum += p.lwr();
        num_summed += 1;
    }
    num_summed.max(min).min(pq.size())
}

pub fn discard_bottom_x_percent(sample: &mut Sample, x: f64) {
    assert!((0.0..=1.0).contains(&x), "x is not a percentage");
    sample.pquerys_mut().par_iter_mut().for_each(|pq| {
        let keep = until_top_percent(pq, 1.0 - x);
        pq.truncate(keep);
    });
}

pub fn discard_by_support_threshold(sample: &mut Sample, thresh: f64, min: usize, max: usize) {
    assert!((0.0..=1.0).contains(&thresh), "invalid support threshold");
    assert!(min >= 1, "filter min cannot be smaller than 1");
    sample.pquerys_mut().par_iter_mut().for_each(|pq| {
        sort_by_lwr(pq);
        let mut keep = pq.iter().take_while(|p| p.lwr() > thresh).count();
        keep = keep.max(min);
        if max > 0 {
            keep = keep.min(max);
        }
        pq.truncate(keep);
    });
}

pub fn discard_by_accumulated_threshold(sample: &mut Sample, thresh: f64, min: usize, max: usize) {
    assert!((0.0..=1.0).contains(&thresh), "invalid accumulated threshold");
    assert!(min >= 1, "filter min cannot be smaller than 1");
    assert!(min <= max, "filter min cannot exceed max");
    sample.pquerys_mut().par_iter_mut().for_each(|pq| {
        let keep = until_accumulated_reached(pq, thresh, min, max);
        pq.truncate(keep);
    });
}

/// the output filter: accumulated or plain support threshold, per options
pub fn filter(sample: &mut Sample, options: &Options) {
    if options.acc_threshold {
        log::debug!(
            "filtering output by accumulated threshold: {}",
            options.support_threshold
        );
        discard_by_accumulated_threshold(
            sample,
            options.support_threshold,
            options.filter_min,
            options.filter_max,
        );
    } else {
        log::debug!(
            "filtering output placements below threshold: {}",
            options.support_threshold
        );
        discard_by_support_threshold(
            sample,
            options.support_threshold,
            options.filter_min,
            options.filter_max,
        );
    }
}

/// merge `src` into `dest`: placements of known sequence ids are appended,
/// unknown pquerys move over wholesale
pub fn merge(dest: &mut Sample, src: Sample) {
    for mut pquery in src.into_pquerys() {
        match dest.find(pquery.sequence_id()) {
            Some(existing) => existing.append(&mut pquery),
            None => dest.push(pquery),
        }
    }
}

/// fuse duplicate sequence-id records (from thread-local splitting) into
/// one; placement order is the concatenation order
pub fn collapse(sample: &mut Sample) {
    let mut fused: Vec<PQuery> = Vec::with_capacity(sample.size());
    let mut index: std::collections::HashMap<usize, usize> = std::collections::HashMap::new();
    for mut pq in sample.drain() {
        match index.get(&pq.sequence_id()) {
            Some(&i) => fused[i].append(&mut pq),
            None => {
                index.insert(pq.sequence_id(), fused.len());
                fused.push(pq);
            }
        }
    }
    *sample.pquerys_mut() = fused;
}

/// distribute pquerys into `num_parts` buckets by sequence id, so every
/// rank gets its part even when that part is empty
pub fn split(src: Sample, num_parts: usize) -> Vec<Sample> {
    let mut parts: Vec<Sample> = (0..num_parts).map(|_| Sample::new(src.newick())).collect();
    for pq in src.into_pquerys() {
        let bucket = pq.sequence_id() % num_parts;
        parts[bucket].push(pq);
    }
    parts
}

impl Sample {
    fn into_pquerys(self) -> Vec<PQuery> {
        let mut s = self;
        s.drain().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::placement::Placement;

    fn pquery(seq_id: usize, logls: &[f64]) -> PQuery {
        let mut pq = PQuery::new(seq_id, format!("q{seq_id}"));
        for (i, &logl) in logls.iter().enumerate() {
            pq.push(Placement::new(i, logl, 0.1, 0.05));
        }
        pq
    }

    fn sample_of(pqs: Vec<PQuery>) -> Sample {
        let mut s = Sample::new("(A:1{0},B:1{1},C:1{2});");
        for pq in pqs {
            s.push(pq);
        }
        s
    }

    #[test]
    fn lwrs_sum_to_one() {
        let mut sample = sample_of(vec![pquery(0, &[-10.0, -11.0, -12.0])]);
        compute_and_set_lwr(&mut sample);
        let sum: f64 = sample.get(0).iter().map(|p| p.lwr()).sum();
        assert!((sum - 1.0).abs() < 1e-9);
        for p in sample.get(0) {
            assert!(p.lwr() >= 0.0 && p.lwr() <= 1.0);
        }
    }

    #[test]
    fn lwrs_sum_to_one_for_random_placements() {
        use crate::Arbitrary;
        let mut pq = PQuery::new(0, "q0");
        for _ in 0..32 {
            pq.push(Placement::random());
        }
        let mut sample = sample_of(vec![pq]);
        compute_and_set_lwr(&mut sample);
        let sum: f64 = sample.get(0).iter().map(|p| p.lwr()).sum();
        assert!((sum - 1.0).abs() < 1e-9);
    }

    #[test]
    fn lwr_is_stable_for_extreme_logl() {
        let mut sample = sample_of(vec![pquery(0, &[-1e5, -1e5 - 1.0])]);
        compute_and_set_lwr(&mut sample);
        let sum: f64 = sample.get(0).iter().map(|p| p.lwr()).sum();
        assert!((sum - 1.0).abs() < 1e-9);
    }

    #[test]
    fn accumulated_threshold_keeps_smallest_prefix() {
        let mut sample = sample_of(vec![pquery(0, &[-1.0, -2.0, -9.0, -12.0])]);
        compute_and_set_lwr(&mut sample);
        discard_by_accumulated_threshold(&mut sample, 0.95, 1, 10);
        // the top two placements dominate the mass
        assert!(sample.get(0).size() <= 3);
        assert!(sample.get(0).size() >= 1);
    }

    #[test]
    fn accumulated_threshold_respects_min_and_max() {
        let mut sample = sample_of(vec![pquery(0, &[-1.0, -1.1, -1.2, -1.3, -1.4])]);
        compute_and_set_lwr(&mut sample);
        discard_by_accumulated_threshold(&mut sample, 0.0001, 2, 3);
        assert_eq!(sample.get(0).size(), 2);

        let mut sample = sample_of(vec![pquery(0, &[-1.0, -1.1, -1.2, -1.3, -1.4])]);
        compute_and_set_lwr(&mut sample);
        discard_by_accumulated_threshold(&mut sample, 1.0, 1, 3);
        assert_eq!(sample.get(0).size(), 3);
    }

    #[test]
    fn support_threshold_pads_to_min() {
        let mut sample = sample_of(vec![pquery(0, &[-1.0, -50.0, -60.0])]);
        compute_and_set_lwr(&mut sample);
        discard_by_support_threshold(&mut sample, 0.5, 2, 10);
        assert_eq!(sample.get(0).size(), 2);
    }

    #[test]
    fn filter_is_idempotent() {
        let mut sample = sample_of(vec![pquery(0, &[-1.0, -2.0, -3.0, -20.0])]);
        compute_and_set_lwr(&mut sample);
        let options = Options::default();
        filter(&mut sample, &options);
        let after_once: Vec<usize> = sample.get(0).iter().map(|p| p.branch_id()).collect();
        filter(&mut sample, &options);
        let after_twice: Vec<usize> = sample.get(0).iter().map(|p| p.branch_id()).collect();
        assert_eq!(after_once, after_twice);
    }

    #[test]
    fn merge_with_empty_is_identity() {
        let mut dest = sample_of(vec![pquery(0, &[-1.0]), pquery(1, &[-2.0])]);
        merge(&mut dest, Sample::default());
        assert_eq!(dest.size(), 2);
    }

    #[test]
    fn merge_appends_placements_of_known_ids() {
        let mut dest = sample_of(vec![pquery(0, &[-1.0])]);
        let src = sample_of(vec![pquery(0, &[-2.0]), pquery(7, &[-3.0])]);
        merge(&mut dest, src);
        assert_eq!(dest.size(), 2);
        assert_eq!(dest.get(0).size(), 2);
    }

    #[test]
    fn collapse_is_idempotent() {
        let mut sample = sample_of(vec![
            pquery(0, &[-1.0]),
            pquery(1, &[-2.0]),
            pquery(0, &[-3.0]),
        ]);
        collapse(&mut sample);
        assert_eq!(sample.size(), 2);
        assert_eq!(sample.get(0).size(), 2);
        collapse(&mut sample);
        assert_eq!(sample.size(), 2);
        assert_eq!(sample.get(0).size(), 2);
    }

    #[test]
    fn split_buckets_by_sequence_id() {
        let sample = sample_of(vec![
            pquery(0, &[-1.0]),
            pquery(1, &[-1.0]),
            pquery(2, &[-1.0]),
            pquery(5, &[-1.0]),
        ]);
        let parts = split(sample, 3);
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].size(), 1);
        assert_eq!(parts[1].size(), 1);
        assert_eq!(parts[2].size(), 2);
        for part in &parts {
            for pq in part {
                assert!(!pq.header().is_empty());
            }
        }
    }
}
