use rayon::prelude::*;

use crate::options::Options;
use crate::sample::functions::compute_and_set_lwr;
use crate::sample::functions::discard_bottom_x_percent;
use crate::sample::functions::discard_by_accumulated_threshold;
use crate::sample::functions::sort_by_logl;
use crate::sample::sample::Sample;

/// accumulated-threshold candidate selection (the default)
fn dynamic_heuristic(sample: &mut Sample, options: &Options) {
    compute_and_set_lwr(sample);
    discard_by_accumulated_threshold(
        sample,
        options.prescoring_threshold,
        options.filter_min,
        options.filter_max,
    );
}

/// keep a fixed fraction of the branches per query. ignores the filter
/// bounds on purpose.
fn fixed_heuristic(sample: &mut Sample, options: &Options) {
    compute_and_set_lwr(sample);
    discard_bottom_x_percent(sample, 1.0 - options.prescoring_threshold);
}

/// candidate selection on raw log-likelihoods: keep everything within the
/// strike box of the best, plus a bounded number of strikes beyond it
fn baseball_heuristic(sample: &mut Sample, _options: &Options) {
    sample.pquerys_mut().par_iter_mut().for_each(|pq| {
        assert!(!pq.is_empty());
        sort_by_logl(pq);
        let best = pq.placements()[0].likelihood();
        let thresh = best - crate::STRIKE_BOX;
        let hits = pq
            .iter()
            .take_while(|p| p.likelihood() >= thresh)
            .count();
        let to_add = (crate::MAX_PITCHES.saturating_sub(hits)).min(crate::MAX_STRIKES);
        pq.truncate((hits + to_add).min(crate::MAX_PITCHES));
    });
}

/// pick the candidate edges that survive into thorough placement
pub fn apply_heuristic(sample: &mut Sample, options: &Options) {
    if options.baseball {
        baseball_heuristic(sample, options);
    } else if options.prescoring_by_percentage {
        fixed_heuristic(sample, options);
    } else {
        dynamic_heuristic(sample, options);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::placement::Placement;
    use crate::sample::pquery::PQuery;

    fn sample_with_logls(logls: &[f64]) -> Sample {
        let mut pq = PQuery::new(0, "q0");
        for (i, &logl) in logls.iter().enumerate() {
            pq.push(Placement::new(i, logl, 0.1, 0.05));
        }
        let mut sample = Sample::new("");
        sample.push(pq);
        sample
    }

    #[test]
    fn baseball_keeps_strike_box_plus_strikes() {
        // two in the box, the rest strikes
        let logls: Vec<f64> = (0..20).map(|i| -10.0 - i as f64 * 2.0).collect();
        let mut sample = sample_with_logls(&logls);
        baseball_heuristic(&mut sample, &Options::default());
        assert_eq!(sample.get(0).size(), 2 + crate::MAX_STRIKES);
    }

    #[test]
    fn baseball_caps_at_max_pitches() {
        let logls: Vec<f64> = (0..100).map(|i| -10.0 - i as f64 * 0.001).collect();
        let mut sample = sample_with_logls(&logls);
        baseball_heuristic(&mut sample, &Options::default());
        assert_eq!(sample.get(0).size(), crate::MAX_PITCHES);
    }

    #[test]
    fn percentage_mode_keeps_a_fraction() {
        let logls: Vec<f64> = (0..10).map(|i| -10.0 - i as f64).collect();
        let mut sample = sample_with_logls(&logls);
        let options = Options {
            prescoring_by_percentage: true,
            prescoring_threshold: 0.2,
            ..Options::default()
        };
        apply_heuristic(&mut sample, &options);
        assert_eq!(sample.get(0).size(), 2);
    }

    #[test]
    fn accumulated_mode_keeps_everything_at_threshold_one() {
        let logls: Vec<f64> = (0..5).map(|i| -10.0 - i as f64).collect();
        let mut sample = sample_with_logls(&logls);
        let options = Options {
            prescoring_threshold: 1.0,
            filter_max: 100,
            ..Options::default()
        };
        apply_heuristic(&mut sample, &options);
        assert_eq!(sample.get(0).size(), 5);
    }
}
