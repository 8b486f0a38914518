use crate::SeqId;
use crate::sample::placement::Placement;

/// all candidate placements of one query sequence. the sequence id is
/// globally unique across ranks; no two placements may share a branch.
#[derive(Debug, Clone)]
pub struct PQuery {
    sequence_id: SeqId,
    header: String,
    placements: Vec<Placement>,
}

impl PQuery {
    pub fn new(sequence_id: SeqId, header: impl Into<String>) -> Self {
        Self {
            sequence_id,
            header: header.into(),
            placements: Vec::new(),
        }
    }

    pub fn sequence_id(&self) -> SeqId {
        self.sequence_id
    }

    pub fn header(&self) -> &str {
        &self.header
    }

    pub fn size(&self) -> usize {
        self.placements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.placements.is_empty()
    }

    pub fn push(&mut self, placement: Placement) {
        self.placements.push(placement);
    }

    pub fn placements(&self) -> &[Placement] {
        &self.placements
    }

    pub fn placements_mut(&mut self) -> &mut Vec<Placement> {
        &mut self.placements
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Placement> {
        self.placements.iter()
    }

    /// absorb the placements of another record for the same sequence
    pub fn append(&mut self, other: &mut PQuery) {
        debug_assert_eq!(self.sequence_id, other.sequence_id);
        self.placements.append(&mut other.placements);
    }

    pub fn truncate(&mut self, keep: usize) {
        self.placements.truncate(keep);
    }
}

impl<'a> IntoIterator for &'a PQuery {
    type Item = &'a Placement;
    type IntoIter = std::slice::Iter<'a, Placement>;
    fn into_iter(self) -> Self::IntoIter {
        self.placements.iter()
    }
}
