use crate::error::Error;
use crate::error::Result;

/// a substitution model over `states` character states: exchangeabilities,
/// stationary frequencies, and discrete-gamma rate heterogeneity. the
/// eigendecomposition is computed once and reused for every probability
/// matrix and for the branch length derivatives.
#[derive(Debug, Clone)]
pub struct SubstModel {
    pub name: String,
    pub states: usize,
    pub freqs: Vec<f64>,
    pub subst_rates: Vec<f64>,
    pub alpha: f64,
    pub rate_cats: Vec<f64>,
    eigen: Eigen,
}

#[derive(Debug, Clone)]
struct Eigen {
    evals: Vec<f64>,
    /// row-major `states x states`, already includes the pi^{-1/2} similarity
    evecs: Vec<f64>,
    /// row-major `states x states`, includes pi^{1/2}
    inv_evecs: Vec<f64>,
}

impl SubstModel {
    /// model by name. DNA: GTR (uniform parameters until assigned), JC69,
    /// K80; amino acids: POISSON with uniform frequencies.
    pub fn new(name: &str, num_rate_cats: usize) -> Result<Self> {
        let name_uc = name.to_ascii_uppercase();
        let (states, subst_rates, freqs) = match name_uc.as_str() {
            "GTR" | "JC69" => (4, vec![1.0; 6], vec![0.25; 4]),
            "K80" => {
                // transitions AG and CT elevated; order AC AG AT CG CT GT
                (4, vec![1.0, 4.0, 1.0, 1.0, 4.0, 1.0], vec![0.25; 4])
            }
            "POISSON" | "PROTGTR" => {
                (20, vec![1.0; 190], vec![0.05; 20])
            }
            _ => {
                return Err(Error::parse(
                    name,
                    "unknown substitution model (GTR, JC69, K80, POISSON)",
                ));
            }
        };
        let alpha = 1.0;
        let rate_cats = gamma_rates(alpha, num_rate_cats);
        let eigen = decompose(states, &subst_rates, &freqs)?;
        Ok(Self {
            name: name_uc,
            states,
            freqs,
            subst_rates,
            alpha,
            rate_cats,
            eigen,
        })
    }

    pub fn num_rate_cats(&self) -> usize {
        self.rate_cats.len()
    }

    /// replace the stationary frequencies, rescaling and re-decomposing
    pub fn set_freqs(&mut self, freqs: Vec<f64>) -> Result<()> {
        assert_eq!(freqs.len(), self.states);
        self.eigen = decompose(self.states, &self.subst_rates, &freqs)?;
        self.freqs = freqs;
        Ok(())
    }

    /// replace the exchangeabilities, re-decomposing
    pub fn set_subst_rates(&mut self, rates: Vec<f64>) -> Result<()> {
        assert_eq!(rates.len(), self.states * (self.states - 1) / 2);
        self.eigen = decompose(self.states, &rates, &self.freqs)?;
        self.subst_rates = rates;
        Ok(())
    }

    /// replace the gamma shape, recomputing the category rates
    pub fn set_alpha(&mut self, alpha: f64) {
        let n = self.rate_cats.len();
        self.alpha = alpha;
        self.rate_cats = gamma_rates(alpha, n);
    }

    /// fill a probability matrix for branch length `t`, one
    /// `states x states` block per rate category
    pub fn fill_pmatrix(&self, out: &mut [f64], t: f64) {
        let s = self.states;
        assert_eq!(out.len(), self.rate_cats.len() * s * s);
        for (cat, &rate) in self.rate_cats.iter().enumerate() {
            let block = &mut out[cat * s * s..(cat + 1) * s * s];
            self.expm(block, t * rate, 0);
        }
    }

    /// first and second derivatives of the probability matrix with respect
    /// to the branch length, per rate category
    pub fn fill_derivatives(&self, d1: &mut [f64], d2: &mut [f64], t: f64) {
        let s = self.states;
        for (cat, &rate) in self.rate_cats.iter().enumerate() {
            let b1 = &mut d1[cat * s * s..(cat + 1) * s * s];
            self.expm_scaled(b1, t, rate, 1);
            let b2 = &mut d2[cat * s * s..(cat + 1) * s * s];
            self.expm_scaled(b2, t, rate, 2);
        }
    }

    fn expm(&self, out: &mut [f64], t: f64, order: usize) {
        self.expm_scaled(out, t, 1.0, order)
    }

    /// U diag(lambda^order * r^order * exp(lambda t r)) U^-1
    fn expm_scaled(&self, out: &mut [f64], t: f64, rate: f64, order: usize) {
        let s = self.states;
        let evals = &self.eigen.evals;
        let evecs = &self.eigen.evecs;
        let inv = &self.eigen.inv_evecs;
        let mut diag = vec![0.0; s];
        for k in 0..s {
            let lr = evals[k] * rate;
            diag[k] = lr.powi(order as i32) * (lr * t).exp();
        }
        for i in 0..s {
            for j in 0..s {
                let mut acc = 0.0;
                for k in 0..s {
                    acc += evecs[i * s + k] * diag[k] * inv[k * s + j];
                }
                // numerical noise can push true zeros slightly negative
                out[i * s + j] = if order == 0 { acc.max(0.0) } else { acc };
            }
        }
    }
}

/// build the normalized rate matrix, symmetrize by the pi^{1/2} similarity,
/// and diagonalize with cyclic jacobi rotations
fn decompose(states: usize, rates: &[f64], freqs: &[f64]) -> Result<Eigen> {
    let s = states;
    let mut q = vec![0.0; s * s];
    let mut r = 0;
    for i in 0..s {
        for j in (i + 1)..s {
            q[i * s + j] = rates[r] * freqs[j];
            q[j * s + i] = rates[r] * freqs[i];
            r += 1;
        }
    }
    for i in 0..s {
        let row: f64 = (0..s).filter(|&j| j != i).map(|j| q[i * s + j]).sum();
        q[i * s + i] = -row;
    }
    // normalize to one expected substitution per unit branch length
    let scale: f64 = -(0..s).map(|i| freqs[i] * q[i * s + i]).sum::<f64>();
    if !(scale > 0.0) {
        return Err(Error::invariant("degenerate rate matrix"));
    }
    for v in q.iter_mut() {
        *v /= scale;
    }

    // A = D^{1/2} Q D^{-1/2} is symmetric for reversible models
    let sqrt_pi: Vec<f64> = freqs.iter().map(|&f| f.sqrt()).collect();
    let mut a = vec![0.0; s * s];
    for i in 0..s {
        for j in 0..s {
            a[i * s + j] = q[i * s + j] * sqrt_pi[i] / sqrt_pi[j];
        }
    }

    let (evals, v) = jacobi(&mut a, s);

    let mut evecs = vec![0.0; s * s];
    let mut inv_evecs = vec![0.0; s * s];
    for i in 0..s {
        for k in 0..s {
            evecs[i * s + k] = v[i * s + k] / sqrt_pi[i];
            inv_evecs[k * s + i] = v[i * s + k] * sqrt_pi[i];
        }
    }

    Ok(Eigen {
        evals,
        evecs,
        inv_evecs,
    })
}

/// eigenvalues and eigenvectors (columns of the returned matrix) of a
/// symmetric matrix, by cyclic jacobi sweeps
fn jacobi(a: &mut [f64], n: usize) -> (Vec<f64>, Vec<f64>) {
    let mut v = vec![0.0; n * n];
    for i in 0..n {
        v[i * n + i] = 1.0;
    }
    for _sweep in 0..64 {
        let off: f64 = (0..n)
            .flat_map(|i| ((i + 1)..n).map(move |j| (i, j)))
            .map(|(i, j)| a[i * n + j] * a[i * n + j])
            .sum();
        if off < 1e-24 {
            break;
        }
        for p in 0..n {
            for q in (p + 1)..n {
                let apq = a[p * n + q];
                if apq.abs() < 1e-20 {
                    continue;
                }
                let theta = (a[q * n + q] - a[p * n + p]) / (2.0 * apq);
                let t = theta.signum() / (theta.abs() + (theta * theta + 1.0).sqrt());
                let c = 1.0 / (t * t + 1.0).sqrt();
                let s = t * c;
                for k in 0..n {
                    let akp = a[k * n + p];
                    let akq = a[k * n + q];
                    a[k * n + p] = c * akp - s * akq;
                    a[k * n + q] = s * akp + c * akq;
                }
                for k in 0..n {
                    let apk = a[p * n + k];
                    let aqk = a[q * n + k];
                    a[p * n + k] = c * apk - s * aqk;
                    a[q * n + k] = s * apk + c * aqk;
                }
                for k in 0..n {
                    let vkp = v[k * n + p];
                    let vkq = v[k * n + q];
                    v[k * n + p] = c * vkp - s * vkq;
                    v[k * n + q] = s * vkp + c * vkq;
                }
            }
        }
    }
    let evals: Vec<f64> = (0..n).map(|i| a[i * n + i]).collect();
    (evals, v)
}

/// discrete gamma category rates with equal-probability categories and
/// per-category means, shape `alpha`, overall mean one
pub fn gamma_rates(alpha: f64, ncat: usize) -> Vec<f64> {
    assert!(ncat >= 1);
    assert!(alpha > 0.0);
    if ncat == 1 {
        return vec![1.0];
    }
    let n = ncat as f64;
    // quantile boundaries of Gamma(shape = alpha, rate = alpha)
    let mut bounds = vec![0.0; ncat + 1];
    for i in 1..ncat {
        bounds[i] = gamma_p_inv(alpha, i as f64 / n) / alpha;
    }
    bounds[ncat] = f64::INFINITY;

    let mut rates = vec![0.0; ncat];
    let mut prev = 0.0;
    for i in 0..ncat {
        let next = if bounds[i + 1].is_infinite() {
            1.0
        } else {
            gamma_p(alpha + 1.0, alpha * bounds[i + 1])
        };
        rates[i] = n * (next - prev);
        prev = next;
    }
    rates
}

/// natural log of the gamma function, lanczos approximation
fn ln_gamma(x: f64) -> f64 {
    const COF: [f64; 6] = [
        76.18009172947146,
        -86.50532032941677,
        24.01409824083091,
        -1.231739572450155,
        0.1208650973866179e-2,
        -0.5395239384953e-5,
    ];
    let mut y = x;
    let tmp = x + 5.5;
    let tmp = tmp - (x + 0.5) * tmp.ln();
    let mut ser = 1.000000000190015;
    for c in COF {
        y += 1.0;
        ser += c / y;
    }
    -tmp + (2.5066282746310005 * ser / x).ln()
}

/// regularized lower incomplete gamma function P(a, x)
pub fn gamma_p(a: f64, x: f64) -> f64 {
    assert!(a > 0.0);
    if x <= 0.0 {
        return 0.0;
    }
    if x < a + 1.0 {
        // series representation
        let mut ap = a;
        let mut sum = 1.0 / a;
        let mut del = sum;
        for _ in 0..200 {
            ap += 1.0;
            del *= x / ap;
            sum += del;
            if del.abs() < sum.abs() * 1e-15 {
                break;
            }
        }
        sum * (-x + a * x.ln() - ln_gamma(a)).exp()
    } else {
        // continued fraction for Q(a, x)
        let tiny = 1e-300;
        let mut b = x + 1.0 - a;
        let mut c = 1.0 / tiny;
        let mut d = 1.0 / b;
        let mut h = d;
        for i in 1..200 {
            let an = -(i as f64) * (i as f64 - a);
            b += 2.0;
            d = an * d + b;
            if d.abs() < tiny {
                d = tiny;
            }
            c = b + an / c;
            if c.abs() < tiny {
                c = tiny;
            }
            d = 1.0 / d;
            let del = d * c;
            h *= del;
            if (del - 1.0).abs() < 1e-15 {
                break;
            }
        }
        let q = (-x + a * x.ln() - ln_gamma(a)).exp() * h;
        1.0 - q
    }
}

/// inverse of P(a, .) by a wilson-hilferty starting guess refined with
/// newton steps
pub fn gamma_p_inv(a: f64, p: f64) -> f64 {
    assert!(p > 0.0 && p < 1.0);
    // initial guess
    let g = ln_gamma(a);
    let mut x = if a > 1.0 {
        let pp = if p < 0.5 { p } else { 1.0 - p };
        let t = (-2.0 * pp.ln()).sqrt();
        let mut z = t - (2.30753 + t * 0.27061) / (1.0 + t * (0.99229 + t * 0.04481));
        if p < 0.5 {
            z = -z;
        }
        let h = 2.0 / (9.0 * a);
        a * (1.0 - h + z * h.sqrt()).powi(3)
    } else {
        let t = 1.0 - a * (0.253 + a * 0.12);
        if p < t {
            (p / t).powf(1.0 / a)
        } else {
            1.0 - (1.0 - (p - t) / (1.0 - t)).ln()
        }
    };
    x = x.max(1e-12);
    for _ in 0..32 {
        let err = gamma_p(a, x) - p;
        let lnpdf = (a - 1.0) * x.ln() - x - g;
        let dpdx = lnpdf.exp();
        if dpdx <= 0.0 {
            break;
        }
        let step = err / dpdx;
        let mut next = x - step;
        if next <= 0.0 {
            next = x / 2.0;
        }
        if (next - x).abs() < 1e-12 * x {
            x = next;
            break;
        }
        x = next;
    }
    x
}
