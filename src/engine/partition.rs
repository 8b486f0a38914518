use std::sync::Arc;

use crate::engine::alphabet;
use crate::engine::model::SubstModel;
use crate::error::Error;
use crate::error::Result;

pub const UNSLOTTED: usize = usize::MAX;

/// carrier of the likelihood data: per-node conditional likelihood vectors,
/// per-tip character codes (pattern-tip mode), per-node scaler counts,
/// per-edge probability matrices, and the model parameters.
///
/// CLV indices run over `[0, tips + clv_buffers)`. under pattern-tip mode
/// the first `tips` indices resolve to character buffers instead of CLVs.
pub struct Partition {
    pub sites: usize,
    pub tips: usize,
    pub clv_buffers: usize,
    pub scale_buffers: usize,
    pub pattern_tip: bool,
    pub model: Arc<SubstModel>,
    pub pattern_weights: Vec<u32>,
    clvs: ClvStore,
    tipchars: Vec<Option<Arc<Vec<u32>>>>,
    scalers: Vec<Option<Arc<Vec<u32>>>>,
    pmatrices: Vec<Option<Vec<f64>>>,
}

/// either one resident buffer per CLV index, or a bounded pool of slots
/// with pinning (memory saver)
enum ClvStore {
    Full(Vec<Option<Arc<Vec<f64>>>>),
    Slotted(SlotManager),
}

struct SlotManager {
    slots: Vec<Option<Arc<Vec<f64>>>>,
    slot_of: Vec<usize>,
    clv_of: Vec<usize>,
    pinned: Vec<bool>,
    clock: usize,
}

impl Partition {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        model: Arc<SubstModel>,
        sites: usize,
        tips: usize,
        clv_buffers: usize,
        scale_buffers: usize,
        pmatrix_count: usize,
        pattern_tip: bool,
        clv_slots: Option<usize>,
    ) -> Self {
        let total_clvs = tips + clv_buffers;
        let clvs = match clv_slots {
            None => ClvStore::Full(vec![None; total_clvs]),
            Some(n) => ClvStore::Slotted(SlotManager {
                slots: vec![None; n],
                slot_of: vec![UNSLOTTED; total_clvs],
                clv_of: vec![UNSLOTTED; n],
                pinned: vec![false; total_clvs],
                clock: 0,
            }),
        };
        Self {
            sites,
            tips,
            clv_buffers,
            scale_buffers,
            pattern_tip,
            model,
            pattern_weights: vec![1; sites],
            clvs,
            tipchars: vec![None; tips],
            scalers: vec![None; scale_buffers],
            pmatrices: vec![None; pmatrix_count],
        }
    }

    pub fn states(&self) -> usize {
        self.model.states
    }

    pub fn rate_cats(&self) -> usize {
        self.model.num_rate_cats()
    }

    /// length of one CLV buffer in doubles
    pub fn clv_len(&self) -> usize {
        self.sites * self.rate_cats() * self.states()
    }

    pub fn total_clvs(&self) -> usize {
        self.tips + self.clv_buffers
    }

    pub fn pmatrix_count(&self) -> usize {
        self.pmatrices.len()
    }

    /// true if this CLV index resolves to a tip character buffer
    pub fn is_char_tip(&self, clv_index: usize) -> bool {
        self.pattern_tip && clv_index < self.tips
    }

    /// initialize a tip from a sequence: characters under pattern-tip mode,
    /// a full 0/1 likelihood vector otherwise
    pub fn set_tip_states(&mut self, clv_index: usize, seq: &[u8]) -> Result<()> {
        assert_eq!(seq.len(), self.sites);
        let states = self.states();
        if self.is_char_tip(clv_index) {
            let mut chars = Vec::with_capacity(self.sites);
            for &c in seq {
                chars.push(alphabet::encode_state(states, c)?);
            }
            self.tipchars[clv_index] = Some(Arc::new(chars));
            Ok(())
        } else {
            let rate_cats = self.rate_cats();
            let mut buf = vec![0.0; self.clv_len()];
            for (site, &c) in seq.iter().enumerate() {
                let mask = alphabet::encode_state(states, c)?;
                for cat in 0..rate_cats {
                    let offset = (site * rate_cats + cat) * states;
                    for k in 0..states {
                        buf[offset + k] = if mask >> k & 1 == 1 { 1.0 } else { 0.0 };
                    }
                }
            }
            self.insert_clv(clv_index, buf)
        }
    }

    pub fn tipchar(&self, clv_index: usize) -> Option<&[u32]> {
        self.tipchars
            .get(clv_index)?
            .as_ref()
            .map(|a| a.as_slice())
    }

    pub fn tipchar_arc(&self, clv_index: usize) -> Option<Arc<Vec<u32>>> {
        self.tipchars.get(clv_index)?.clone()
    }

    pub fn insert_tipchars(&mut self, clv_index: usize, chars: Arc<Vec<u32>>) {
        self.tipchars[clv_index] = Some(chars);
    }

    pub fn clv(&self, clv_index: usize) -> Option<&[f64]> {
        match &self.clvs {
            ClvStore::Full(store) => store[clv_index].as_ref().map(|a| a.as_slice()),
            ClvStore::Slotted(man) => {
                let slot = man.slot_of[clv_index];
                if slot == UNSLOTTED {
                    None
                } else {
                    man.slots[slot].as_ref().map(|a| a.as_slice())
                }
            }
        }
    }

    /// shared handle on a resident CLV, used for shallow tiny-tree copies
    pub fn clv_arc(&self, clv_index: usize) -> Option<Arc<Vec<f64>>> {
        match &self.clvs {
            ClvStore::Full(store) => store[clv_index].clone(),
            ClvStore::Slotted(man) => {
                let slot = man.slot_of[clv_index];
                if slot == UNSLOTTED {
                    None
                } else {
                    man.slots[slot].clone()
                }
            }
        }
    }

    /// writable CLV buffer, allocating (full mode) or slotting (memory
    /// saver, possibly evicting an unpinned resident) on demand
    pub fn clv_mut(&mut self, clv_index: usize) -> Result<&mut Vec<f64>> {
        let len = self.clv_len();
        match &mut self.clvs {
            ClvStore::Full(store) => {
                let entry = store[clv_index].get_or_insert_with(|| Arc::new(vec![0.0; len]));
                Ok(Arc::make_mut(entry))
            }
            ClvStore::Slotted(man) => {
                let slot = if man.slot_of[clv_index] != UNSLOTTED {
                    man.slot_of[clv_index]
                } else {
                    let slot = man.acquire(clv_index)?;
                    man.slot_of[clv_index] = slot;
                    man.clv_of[slot] = clv_index;
                    slot
                };
                let entry = man.slots[slot].get_or_insert_with(|| Arc::new(vec![0.0; len]));
                Ok(Arc::make_mut(entry))
            }
        }
    }

    /// place a fully materialized buffer at the given CLV index
    pub fn insert_clv(&mut self, clv_index: usize, buf: Vec<f64>) -> Result<()> {
        let target = self.clv_mut(clv_index)?;
        *target = buf;
        Ok(())
    }

    /// share an existing buffer at the given CLV index without copying
    pub fn insert_clv_arc(&mut self, clv_index: usize, buf: Arc<Vec<f64>>) -> Result<()> {
        match &mut self.clvs {
            ClvStore::Full(store) => {
                store[clv_index] = Some(buf);
                Ok(())
            }
            ClvStore::Slotted(man) => {
                let slot = if man.slot_of[clv_index] != UNSLOTTED {
                    man.slot_of[clv_index]
                } else {
                    let slot = man.acquire(clv_index)?;
                    man.slot_of[clv_index] = slot;
                    man.clv_of[slot] = clv_index;
                    slot
                };
                man.slots[slot] = Some(buf);
                Ok(())
            }
        }
    }

    pub fn is_slotted(&self, clv_index: usize) -> bool {
        match &self.clvs {
            ClvStore::Full(store) => store[clv_index].is_some(),
            ClvStore::Slotted(man) => man.slot_of[clv_index] != UNSLOTTED,
        }
    }

    pub fn slottable_size(&self) -> usize {
        match &self.clvs {
            ClvStore::Full(store) => store.len(),
            ClvStore::Slotted(man) => man.slots.len(),
        }
    }

    pub fn pin(&mut self, clv_index: usize) {
        if let ClvStore::Slotted(man) = &mut self.clvs {
            man.pinned[clv_index] = true;
        }
    }

    pub fn is_pinned(&self, clv_index: usize) -> bool {
        match &self.clvs {
            ClvStore::Full(_) => false,
            ClvStore::Slotted(man) => man.pinned[clv_index],
        }
    }

    pub fn unpin(&mut self, clv_index: usize) {
        if let ClvStore::Slotted(man) = &mut self.clvs {
            man.pinned[clv_index] = false;
        }
    }

    pub fn unpin_all(&mut self) {
        if let ClvStore::Slotted(man) = &mut self.clvs {
            man.pinned.fill(false);
        }
    }

    pub fn num_pinned(&self) -> usize {
        match &self.clvs {
            ClvStore::Full(_) => 0,
            ClvStore::Slotted(man) => man.pinned.iter().filter(|&&p| p).count(),
        }
    }

    pub fn scaler(&self, scaler_index: usize) -> Option<&[u32]> {
        self.scalers
            .get(scaler_index)?
            .as_ref()
            .map(|a| a.as_slice())
    }

    pub fn scaler_arc(&self, scaler_index: usize) -> Option<Arc<Vec<u32>>> {
        self.scalers.get(scaler_index)?.clone()
    }

    pub fn scaler_mut(&mut self, scaler_index: usize) -> &mut Vec<u32> {
        let sites = self.sites;
        let entry = self.scalers[scaler_index].get_or_insert_with(|| Arc::new(vec![0; sites]));
        Arc::make_mut(entry)
    }

    pub fn insert_scaler(&mut self, scaler_index: usize, buf: Arc<Vec<u32>>) {
        self.scalers[scaler_index] = Some(buf);
    }

    pub fn pmatrix(&self, pmatrix_index: usize) -> &[f64] {
        self.pmatrices[pmatrix_index]
            .as_ref()
            .expect("probability matrix must be updated before use")
    }

    pub fn has_pmatrix(&self, pmatrix_index: usize) -> bool {
        self.pmatrices[pmatrix_index].is_some()
    }

    pub fn pmatrix_opt(&self, pmatrix_index: usize) -> Option<&[f64]> {
        self.pmatrices[pmatrix_index].as_deref()
    }

    pub fn insert_pmatrix(&mut self, pmatrix_index: usize, buf: Vec<f64>) {
        self.pmatrices[pmatrix_index] = Some(buf);
    }

    /// recompute the probability matrix of an edge for a new branch length
    pub fn update_pmatrix(&mut self, pmatrix_index: usize, branch_length: f64) {
        let len = self.rate_cats() * self.states() * self.states();
        let model = self.model.clone();
        let buf = self.pmatrices[pmatrix_index].get_or_insert_with(|| vec![0.0; len]);
        model.fill_pmatrix(buf, branch_length.max(crate::MIN_BRANCH_LENGTH));
    }
}

impl SlotManager {
    /// find a free slot, or evict an unpinned resident round-robin
    fn acquire(&mut self, _for_clv: usize) -> Result<usize> {
        if let Some(free) = self.clv_of.iter().position(|&c| c == UNSLOTTED) {
            return Ok(free);
        }
        let n = self.slots.len();
        for probe in 0..n {
            let slot = (self.clock + probe) % n;
            let resident = self.clv_of[slot];
            if resident != UNSLOTTED && !self.pinned[resident] {
                self.slot_of[resident] = UNSLOTTED;
                self.clv_of[slot] = UNSLOTTED;
                self.clock = (slot + 1) % n;
                return Ok(slot);
            }
        }
        Err(Error::ClvUnavailable(_for_clv))
    }
}
