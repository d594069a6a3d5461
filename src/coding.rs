//! Delayed arithmetic coding.
//!
//! Branch picks accumulate as (numerator, denominator) fractions; one 16-bit
//! coded word can carry residual information about several picks, so long as
//! the accumulated denominator stays under a precision threshold. Encoding a
//! block is a two-pass batch: a forward pass marks which words will be
//! virtual (absorbed into the accumulator instead of emitted), a backward
//! pass embeds each pick's residual into its branch's probability segments.
//! Decoding is incremental and strictly mirrors the word schedule.
//!
//! The per-distribution inversion table maps any coded word to its branch in
//! O(1): the 16-bit space is cut into `2^b` slots, each shared by at most one
//! "small" branch (filling the left part, up to a divider) and one "large"
//! branch (filling the rest, possibly spilling into further slots).

use std::sync::Arc;

use crate::bitio::{BitReader, BitWriter};
use crate::error::{Error, Result};

/// Total probability mass of every finalized distribution.
pub const PROB_ONE: u32 = 1 << 16;

/// Precision threshold (accumulated denominator bits) that triggers word
/// extraction. 24 gives the best ratio; 16 keeps blocks shortest for random
/// access.
pub const DEFAULT_DELAYED_BITS: u32 = 24;

/// Half-open interval of 16-bit probability space, `0 <= left < right <= 65536`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProbInterval {
    pub left: u32,
    pub right: u32,
}

impl ProbInterval {
    pub fn width(&self) -> u32 {
        self.right - self.left
    }
}

/// One branch pick handed to the encoder.
///
/// Table picks reference the disjoint segment list a coding table assigned to
/// the branch. Uniform picks are the transient two-outcome / last-layer /
/// literal-byte branches: their single segment `[index*weight, (index+1)*weight)`
/// is cheaper to compute than to memoize.
#[derive(Clone, Debug)]
pub enum Pick {
    Table {
        segments: Arc<[ProbInterval]>,
        weight: u32,
    },
    Uniform {
        weight: u32,
        index: u32,
    },
}

impl Pick {
    #[inline]
    pub fn weight(&self) -> u32 {
        match self {
            Pick::Table { weight, .. } => *weight,
            Pick::Uniform { weight, .. } => *weight,
        }
    }

    /// Map a residual numerator in `[0, weight)` to the absolute position of
    /// the coded word inside this branch's probability segments.
    fn embed(&self, mut num: u64) -> u16 {
        match self {
            Pick::Table { segments, .. } => {
                for seg in segments.iter() {
                    let width = seg.width() as u64;
                    if width > num {
                        return (seg.left as u64 + num) as u16;
                    }
                    num -= width;
                }
                debug_assert!(false, "numerator exceeds branch weight");
                0
            }
            Pick::Uniform { weight, index } => {
                ((*index as u64 * *weight as u64) + num) as u16
            }
        }
    }
}

/// Outcome of one table inversion step.
#[derive(Clone, Copy, Debug)]
pub struct DecodedBranch {
    pub branch: u32,
    pub weight: u32,
    pub numerator: u32,
}

/// Per-distribution delayed-coding parameters: branch segment lists for
/// encoding, slot table and numerator helpers for O(1) decoding.
#[derive(Clone, Debug, Default)]
pub struct CodingTable {
    segments: Vec<Arc<[ProbInterval]>>,
    weights: Vec<u32>,
    slots: Vec<(u32, u32, u32)>,
    numerator_helper: Vec<u32>,
    represent_bits: u32,
}

impl CodingTable {
    /// Build the table for a finalized weight vector summing to 65536.
    pub fn build(weights: &[u32]) -> Result<CodingTable> {
        let mut valid: Vec<(u32, u32)> = Vec::new();
        let mut total: u64 = 0;
        for (i, &w) in weights.iter().enumerate() {
            total += w as u64;
            if w != 0 {
                valid.push((w, i as u32));
            }
        }
        if valid.is_empty() || total != PROB_ONE as u64 {
            return Err(Error::Corrupt(format!(
                "weight vector sums to {total}, expected {PROB_ONE}"
            )));
        }

        let mut bits = 0u32;
        while (1usize << bits) < valid.len() {
            bits += 1;
        }
        let slot_count = 1usize << bits;
        let slot_width = 1u32 << (16 - bits);

        // Pair one small branch with one large branch per slot; the large
        // branch's surplus is reclassified and re-inserted.
        let mut small: Vec<(u32, u32)> = Vec::new();
        let mut large: Vec<(u32, u32)> = Vec::new();
        for &(w, idx) in &valid {
            if w < slot_width {
                small.push((w, idx));
            } else {
                large.push((w, idx));
            }
        }

        let mut left = vec![(0u32, 0u32); slot_count];
        let mut right = vec![(0u32, 0u32); slot_count];
        for i in (0..slot_count).rev() {
            let carry = if let Some(s) = small.pop() {
                let Some(l) = large.pop() else {
                    return Err(Error::Corrupt(
                        "unbalanced weight vector in table construction".into(),
                    ));
                };
                left[i] = s;
                right[i] = (slot_width - s.0, l.1);
                (l.0 - right[i].0, l.1)
            } else {
                let Some(l) = large.pop() else {
                    return Err(Error::Corrupt(
                        "unbalanced weight vector in table construction".into(),
                    ));
                };
                left[i] = (0, l.1);
                right[i] = (slot_width, l.1);
                (l.0 - slot_width, l.1)
            };
            if carry.0 < slot_width {
                small.push(carry);
            } else {
                large.push(carry);
            }
        }

        // The helper turns a coded word back into a residual numerator:
        // numerator = word - helper[2*slot + side], where the helper is the
        // absolute start of the segment minus the branch mass consumed by its
        // earlier segments.
        let mut consumed = vec![0u32; weights.len()];
        let mut helper = vec![0u32; slot_count * 2];
        let mut cursor = 0u32;
        for i in 0..slot_count {
            let (w, b) = left[i];
            helper[i * 2] = cursor - consumed[b as usize];
            consumed[b as usize] += w;
            cursor += w;

            let (w, b) = right[i];
            helper[i * 2 + 1] = cursor - consumed[b as usize];
            consumed[b as usize] += w;
            cursor += w;
        }

        // Collect each branch's disjoint segments, merging adjacent spans.
        let mut segs: Vec<Vec<ProbInterval>> = vec![Vec::new(); weights.len()];
        let mut pos = 0u32;
        for i in 0..slot_count {
            for &(w, b) in [&left[i], &right[i]] {
                if w == 0 {
                    continue;
                }
                let list = &mut segs[b as usize];
                match list.last_mut() {
                    Some(last) if last.right == pos => last.right = pos + w,
                    _ => list.push(ProbInterval {
                        left: pos,
                        right: pos + w,
                    }),
                }
                pos += w;
            }
        }

        Ok(CodingTable {
            segments: segs.into_iter().map(|s| Arc::from(s.into_boxed_slice())).collect(),
            weights: weights.to_vec(),
            slots: left
                .iter()
                .zip(&right)
                .map(|(l, r)| (l.0, l.1, r.1))
                .collect(),
            numerator_helper: helper,
            represent_bits: bits,
        })
    }

    pub fn weight(&self, branch: u32) -> u32 {
        self.weights[branch as usize]
    }

    pub fn branch_count(&self) -> usize {
        self.weights.len()
    }

    /// Encoder-side pick for a branch of this distribution.
    pub fn pick(&self, branch: u32) -> Pick {
        Pick::Table {
            segments: Arc::clone(&self.segments[branch as usize]),
            weight: self.weights[branch as usize],
        }
    }

    /// O(1) inversion: slot from the high bits, side from the divider, then
    /// the residual numerator through the helper offset.
    pub fn decode(&self, word: u16) -> DecodedBranch {
        let word = word as u32;
        let low_bits = 16 - self.represent_bits;
        let high = (word >> low_bits) as usize;
        let low = word & (((1u32 << low_bits) as u64 - 1) as u32);
        let (divider, left_branch, right_branch) = self.slots[high];
        let (branch, side) = if low < divider {
            (left_branch, 0)
        } else {
            (right_branch, 1)
        };
        DecodedBranch {
            branch,
            weight: self.weights[branch as usize],
            numerator: word.saturating_sub(self.numerator_helper[high * 2 + side]),
        }
    }
}

/// Batch encoder for one block of branch picks.
pub struct BlockEncoder {
    delayed_bits: u32,
    virtual_flags: Vec<bool>,
    words: Vec<u16>,
}

impl BlockEncoder {
    pub fn new(delayed_bits: u32) -> Self {
        BlockEncoder {
            delayed_bits,
            virtual_flags: Vec::new(),
            words: Vec::new(),
        }
    }

    /// Encode `picks` and write the emitted words to `writer` in stream
    /// order. Returns the number of 16-bit words emitted.
    pub fn encode<W: std::io::Write>(
        &mut self,
        picks: &[Pick],
        writer: &mut BitWriter<W>,
    ) -> Result<u32> {
        self.virtual_flags.clear();
        self.virtual_flags.resize(picks.len(), false);
        self.words.clear();

        // Forward pass: find the word schedule. The first pick of a block is
        // never virtual, which anchors the block boundary.
        let mut den: u64 = 1;
        let mut carry = false;
        for (i, pick) in picks.iter().enumerate() {
            self.virtual_flags[i] = carry;
            carry = false;
            den *= pick.weight() as u64;
            if den >> self.delayed_bits > 0 {
                carry = true;
                den >>= 16;
            }
        }

        // Backward pass: embed residuals, absorbing virtual words into the
        // accumulator so an earlier word carries them.
        let mut acc: u64 = 0;
        for (i, pick) in picks.iter().enumerate().rev() {
            let weight = pick.weight() as u64;
            let num = acc % weight;
            acc /= weight;
            let word = pick.embed(num);
            if self.virtual_flags[i] {
                acc = (acc << 16) | word as u64;
            } else {
                self.words.push(word);
            }
        }
        debug_assert_eq!(acc, 0, "accumulator must drain at the block head");

        for &word in self.words.iter().rev() {
            writer.write_u16(word)?;
        }
        Ok(self.words.len() as u32)
    }
}

/// Incremental decoder state: the fraction accumulator plus the pending
/// virtual word, mirroring the encoder's word schedule exactly.
pub struct Decoder {
    num: u64,
    den: u64,
    pending: Option<u16>,
    words_read: u32,
    delayed_bits: u32,
}

impl Decoder {
    pub fn new(delayed_bits: u32) -> Self {
        Decoder {
            num: 0,
            den: 1,
            pending: None,
            words_read: 0,
            delayed_bits,
        }
    }

    /// Reset at a block boundary.
    pub fn reset(&mut self) {
        self.num = 0;
        self.den = 1;
        self.pending = None;
        self.words_read = 0;
    }

    /// Words consumed since the last reset (virtual words included); drives
    /// the block-boundary check.
    pub fn words_read(&self) -> u32 {
        self.words_read
    }

    /// Next 16-bit coded word: the pending virtual word if one is buffered,
    /// otherwise fresh input.
    pub fn read_word(&mut self, reader: &mut BitReader) -> u16 {
        self.words_read += 1;
        match self.pending.take() {
            Some(word) => word,
            None => reader.read_u16(),
        }
    }

    /// Fold one decoded (numerator / weight) fraction into the accumulator.
    /// When the denominator outgrows the precision threshold, the low 16 bits
    /// of the numerator become the next virtual word.
    pub fn update(&mut self, weight: u32, numerator: u32) {
        self.num = self.num * weight as u64 + numerator as u64;
        self.den *= weight as u64;
        if self.den >> self.delayed_bits > 0 {
            self.pending = Some(self.num as u16);
            self.num >>= 16;
            self.den >>= 16;
        }
    }

    /// Decode one uniform pick of the given weight.
    pub fn read_uniform(&mut self, reader: &mut BitReader, weight: u32) -> u32 {
        let word = self.read_word(reader) as u32;
        let index = word / weight;
        self.update(weight, word - index * weight);
        index
    }
}
