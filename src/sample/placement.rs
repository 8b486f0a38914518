use crate::BranchId;
use crate::Logl;
use crate::Lwr;

/// one candidate insertion of a query into a reference edge, with the
/// maximum-likelihood branch length parameters and the normalized weight
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Placement {
    branch_id: BranchId,
    likelihood: Logl,
    lwr: Lwr,
    pendant_length: f64,
    distal_length: f64,
}

impl Placement {
    pub fn new(
        branch_id: BranchId,
        likelihood: Logl,
        pendant_length: f64,
        distal_length: f64,
    ) -> Self {
        Self {
            branch_id,
            likelihood,
            lwr: 0.0,
            pendant_length,
            distal_length,
        }
    }

    pub fn branch_id(&self) -> BranchId {
        self.branch_id
    }

    pub fn likelihood(&self) -> Logl {
        self.likelihood
    }

    pub fn lwr(&self) -> Lwr {
        self.lwr
    }

    pub fn set_lwr(&mut self, lwr: Lwr) {
        self.lwr = lwr;
    }

    pub fn pendant_length(&self) -> f64 {
        self.pendant_length
    }

    pub fn distal_length(&self) -> f64 {
        self.distal_length
    }
}

#[cfg(test)]
impl crate::Arbitrary for Placement {
    fn random() -> Self {
        use rand::Rng;
        let mut rng = rand::rng();
        Self {
            branch_id: rng.random_range(0..64),
            likelihood: -rng.random_range(1.0..1e4),
            lwr: 0.0,
            pendant_length: rng.random_range(0.0..1.0),
            distal_length: rng.random_range(0.0..1.0),
        }
    }
}
