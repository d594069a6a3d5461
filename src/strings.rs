//! String SquID and model.
//!
//! A string is coded in up to four layers: a delta prefix against the most
//! recent values (local dictionary), a sentence split into words, per-word
//! choice between a learned global dictionary and literal spelling, and a
//! markov character distribution for the literal path. Delimiters between
//! words are coded from their own categorical distribution.
//!
//! The splitter is two-pass: rank-1 delimiters (`/`, space, `#`) cut the
//! string with run collapsing, then the tail segment splits on the full
//! delimiter alphabet plus letter/digit and lower/upper transitions. Pairs
//! of adjacent rank-1 segments are phrase candidates for the dictionary.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io::Write;

use crate::bitio::{BitReader, BitWriter};
use crate::categorical::{CategoricalModel, CategoricalStats};
use crate::coding::{BlockEncoder, Decoder, Pick, DEFAULT_DELAYED_BITS};
use crate::error::{Error, Result};
use crate::numerical::NumericalModel;
use crate::{LOCAL_DICT_SIZE, MARKOV_HISTORY};

const DELIMS_RANK1: [u8; 3] = [b'/', b' ', b'#'];
const DELIMS_RANK2: [u8; 6] = [b'/', b' ', b'#', b'-', b'_', b'.'];
/// Delimiter id meaning "no separator character" (a transition split).
const EMPTY_DELIM: usize = DELIMS_RANK2.len();

/// Literal spelling through the markov character distribution.
const METHOD_LITERAL: usize = 0;
/// One index into the global dictionary.
const METHOD_DICT: usize = 2;

/// Picks per block when the dictionary entries are themselves coded into the
/// model region.
const DICT_BLOCK: usize = 8192;

/// Longest delta prefix the local dictionary may claim.
const MAX_DELTA: usize = 129;
/// Prefixes shorter than this are not worth a dictionary reference.
const MIN_DELTA: usize = 5;

fn is_rank1(b: u8) -> bool {
    DELIMS_RANK1.contains(&b)
}

fn rank2_id(b: u8) -> Option<usize> {
    DELIMS_RANK2.iter().position(|&d| d == b)
}

/// Word boundaries and delimiters of one parsed string; reused across calls.
#[derive(Clone, Debug, Default)]
pub struct Splitter {
    /// Exclusive end offset of each word.
    pub word_ends: Vec<usize>,
    /// Delimiter id following each word.
    pub delims: Vec<usize>,
    pub num_words: usize,
    /// Rank-1 segment count; the first `num_phrase` entries of `word_ends`
    /// bound the phrase candidates.
    pub num_phrase: usize,
}

impl Splitter {
    pub fn parse(&mut self, s: &[u8]) {
        self.num_words = 0;
        self.num_phrase = 0;
        if s.is_empty() {
            return;
        }
        self.word_ends.clear();
        self.delims.clear();

        // Pass 1: rank-1 delimiters, collapsing runs into the word on their
        // left so the split stays reversible.
        let mut start = 0;
        let mut k = 0;
        while k < s.len() {
            if is_rank1(s[k]) {
                while k + 1 < s.len() && is_rank1(s[k + 1]) {
                    k += 1;
                }
                self.word_ends.push(k);
                self.delims.push(rank2_id(s[k]).unwrap_or(EMPTY_DELIM));
                self.num_words += 1;
                start = k + 1;
            }
            k += 1;
        }
        self.num_phrase = self.num_words;

        // Pass 2: the tail segment splits on the fine-grained alphabet and
        // on letter->digit / lower->upper transitions.
        let mut i = start;
        while i < s.len() {
            if i > 0 {
                let prev = s[i - 1];
                let cur = s[i];
                if (prev.is_ascii_alphabetic() && cur.is_ascii_digit())
                    || (prev.is_ascii_lowercase() && cur.is_ascii_uppercase())
                {
                    self.word_ends.push(i);
                    self.delims.push(EMPTY_DELIM);
                    self.num_words += 1;
                    i += 1;
                    continue;
                }
            }
            if rank2_id(s[i]).is_some() {
                while i + 1 < s.len() && rank2_id(s[i + 1]).is_some() {
                    i += 1;
                }
                self.word_ends.push(i);
                self.delims.push(rank2_id(s[i]).unwrap_or(EMPTY_DELIM));
                self.num_words += 1;
            }
            i += 1;
        }
        self.word_ends.push(s.len());
        self.num_words += 1;
    }
}

/// Per-character categorical distributions conditioned on up to two
/// preceding lowercase characters.
#[derive(Clone)]
pub struct MarkovCharDist {
    history: usize,
    tables: Vec<CategoricalStats>,
    former: u8,
    latter: u8,
}

impl MarkovCharDist {
    pub fn new(history: usize) -> Self {
        let table_count = match history {
            0 => 1,
            1 => 26 + 1,
            _ => 26 * 26 + 1,
        };
        MarkovCharDist {
            history,
            tables: vec![CategoricalStats::default(); table_count],
            former: 0,
            latter: 0,
        }
    }

    fn reset(&mut self) {
        self.former = 0;
        self.latter = 0;
    }

    fn push_history(&mut self, c: u8) {
        self.former = self.latter;
        self.latter = c.to_ascii_lowercase();
    }

    /// Table 0 is the unconditioned fallback; lowercase contexts get their
    /// own table.
    fn table_index(&self) -> usize {
        match self.history {
            2 if self.former.is_ascii_lowercase() && self.latter.is_ascii_lowercase() => {
                (self.former - b'a') as usize * 26 + (self.latter - b'a') as usize + 1
            }
            1 if self.latter.is_ascii_lowercase() => (self.latter - b'a') as usize + 1,
            _ => 0,
        }
    }

    pub fn feed_word(&mut self, word: &[u8]) {
        self.reset();
        for &sym in word {
            let idx = self.table_index();
            self.tables[idx].feed(sym as usize, 1);
            self.push_history(sym);
        }
    }

    pub fn end_of_data(&mut self) -> Result<()> {
        for table in self.tables.iter_mut() {
            table.finalize_with_range(256)?;
        }
        self.reset();
        Ok(())
    }

    pub fn get_intervals(&mut self, word: &[u8], picks: &mut Vec<Pick>) {
        self.reset();
        for &sym in word {
            self.tables[self.table_index()].get_intervals(sym as usize, picks);
            self.push_history(sym);
        }
    }

    pub fn decode(
        &mut self,
        decoder: &mut Decoder,
        reader: &mut BitReader,
        len: usize,
        out: &mut Vec<u8>,
    ) -> Result<()> {
        self.reset();
        for _ in 0..len {
            let sym = self.tables[self.table_index()].decode(decoder, reader)? as u8;
            out.push(sym);
            self.push_history(sym);
        }
        Ok(())
    }

    pub fn write<W: Write>(&self, writer: &mut BitWriter<W>) -> Result<()> {
        writer.write_u16(self.tables.len() as u16)?;
        for table in &self.tables {
            table.write_weights(writer)?;
        }
        Ok(())
    }

    pub fn read(reader: &mut BitReader, history: usize) -> Result<MarkovCharDist> {
        let table_count = reader.read_u16() as usize;
        let tables = (0..table_count)
            .map(|_| CategoricalStats::read_weights(reader, 256))
            .collect::<Result<Vec<_>>>()?;
        Ok(MarkovCharDist {
            history,
            tables,
            former: 0,
            latter: 0,
        })
    }
}

/// Two-level categorical squid for id ranges past the 16-bit ceiling of a
/// single distribution: a selector picks the 8192-wide group, a per-group
/// distribution the residual.
#[derive(Clone)]
pub struct GroupedCategorical {
    selector: CategoricalModel,
    groups: Vec<CategoricalModel>,
}

const GROUP_BITS: u32 = 13;

impl Default for GroupedCategorical {
    fn default() -> Self {
        GroupedCategorical {
            selector: CategoricalModel::simple(),
            groups: vec![CategoricalModel::simple()],
        }
    }
}

impl GroupedCategorical {
    pub fn with_capacity(total: usize) -> Self {
        let num_groups = 1 + (total >> GROUP_BITS);
        GroupedCategorical {
            selector: CategoricalModel::simple(),
            groups: vec![CategoricalModel::simple(); num_groups],
        }
    }

    pub fn feed(&mut self, id: usize, count: u32) {
        let group = id >> GROUP_BITS;
        self.selector.feed_value(group, count);
        self.groups[group].feed_value(id & ((1 << GROUP_BITS) - 1), count);
    }

    pub fn end_of_data(&mut self) -> Result<()> {
        self.selector.end_of_data()?;
        for group in self.groups.iter_mut() {
            group.end_of_data()?;
        }
        Ok(())
    }

    pub fn encode(&self, id: usize, picks: &mut Vec<Pick>) {
        let group = id >> GROUP_BITS;
        self.selector.encode_value(group, picks);
        self.groups[group].encode_value(id & ((1 << GROUP_BITS) - 1), picks);
    }

    pub fn decode(&self, decoder: &mut Decoder, reader: &mut BitReader) -> Result<usize> {
        let group = self.selector.decode_value(decoder, reader)? as usize;
        let low = self
            .groups
            .get(group)
            .ok_or_else(|| Error::Corrupt("dictionary group out of range".into()))?
            .decode_value(decoder, reader)? as usize;
        Ok((group << GROUP_BITS) | low)
    }

    pub fn write<W: Write>(&self, writer: &mut BitWriter<W>) -> Result<()> {
        writer.write_u16(self.groups.len() as u16)?;
        self.selector.write(writer)?;
        for group in &self.groups {
            group.write(writer)?;
        }
        Ok(())
    }

    pub fn read(reader: &mut BitReader) -> Result<GroupedCategorical> {
        let num_groups = reader.read_u16() as usize;
        if num_groups == 0 {
            return Err(Error::Corrupt("dictionary with zero groups".into()));
        }
        let registry = crate::squid::ModelRegistry::new(0);
        let selector = CategoricalModel::read(reader, &registry, 0)?;
        let groups = (0..num_groups)
            .map(|_| CategoricalModel::read(reader, &registry, 0))
            .collect::<Result<Vec<_>>>()?;
        Ok(GroupedCategorical { selector, groups })
    }
}

/// Frequency-learned dictionary of words and two-word phrases.
#[derive(Clone, Default)]
pub struct GlobalDictionary {
    word_counts: BTreeMap<Vec<u8>, i64>,
    phrase_counts: BTreeMap<Vec<u8>, i64>,
    phrase_delim_pos: HashMap<Vec<u8>, usize>,
    terms: Vec<Vec<u8>>,
    term_ids: HashMap<Vec<u8>, u32>,
    /// Ids below this are phrases, ids at or above it single words.
    phrase_line: u32,
    squid: GroupedCategorical,
}

fn frequent_word(word: &[u8], count: i64) -> bool {
    (count > 3 && word.len() > 3) || count > 10
}

fn frequent_phrase(phrase: &[u8], count: i64) -> bool {
    count > 10 && phrase.len() >= 3
}

impl GlobalDictionary {
    pub fn push_word(&mut self, word: &[u8], count: u32) {
        *self.word_counts.entry(word.to_vec()).or_insert(0) += count as i64;
    }

    pub fn push_phrase(&mut self, phrase: &[u8], delim_pos: usize, count: u32) {
        *self.phrase_counts.entry(phrase.to_vec()).or_insert(0) += count as i64;
        self.phrase_delim_pos
            .entry(phrase.to_vec())
            .or_insert(delim_pos);
    }

    pub fn contains(&self, term: &[u8]) -> bool {
        self.term_ids.contains_key(term)
    }

    pub fn len(&self) -> usize {
        self.terms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    /// Admit frequent words and phrases, decrementing a phrase's constituent
    /// words so the dictionary mass is not double counted, and feed the
    /// literal-vs-dictionary split into the encoding-method distribution.
    pub fn end_of_data(&mut self, encoding: &mut CategoricalModel) -> Result<()> {
        let mut total_freq: i64 = 0;
        let mut dict_freq: i64 = 0;
        let mut dict_words = 0usize;
        for (word, &count) in &self.word_counts {
            total_freq += count;
            if frequent_word(word, count) {
                dict_freq += count;
                dict_words += 1;
            }
        }

        let mut dict_phrases = 0usize;
        let frequent: Vec<(Vec<u8>, i64)> = self
            .phrase_counts
            .iter()
            .filter(|&(p, &c)| frequent_phrase(p, c))
            .map(|(p, &c)| (p.clone(), c))
            .collect();
        for (phrase, count) in &frequent {
            let pos = self.phrase_delim_pos.get(phrase).copied().unwrap_or(0);
            let former = phrase[..pos.min(phrase.len())].to_vec();
            let latter = phrase[(pos + 1).min(phrase.len())..].to_vec();
            if let Some(c) = self.word_counts.get_mut(&former) {
                *c -= count;
            }
            if let Some(c) = self.word_counts.get_mut(&latter) {
                *c -= count;
            }
            total_freq -= count;
            dict_freq -= count;
            dict_phrases += 1;
        }

        self.squid = GroupedCategorical::with_capacity(dict_words + dict_phrases);

        for (phrase, count) in &frequent {
            let id = self.terms.len() as u32;
            self.terms.push(phrase.clone());
            self.term_ids.insert(phrase.clone(), id);
            self.squid.feed(id as usize, *count as u32);
        }
        self.phrase_line = self.terms.len() as u32;

        // Word admission re-checks the decremented counts, so a word fully
        // absorbed by phrases drops out again.
        for (word, &count) in &self.word_counts {
            if frequent_word(word, count) && !self.term_ids.contains_key(word) {
                let id = self.terms.len() as u32;
                self.terms.push(word.clone());
                self.term_ids.insert(word.clone(), id);
                self.squid.feed(id as usize, count as u32);
            }
        }

        encoding.feed_value(METHOD_DICT, dict_freq.max(0) as u32);
        encoding.feed_value(METHOD_LITERAL, (total_freq - dict_freq).max(0) as u32);

        self.squid.end_of_data()?;
        tracing::debug!(
            words = dict_words,
            phrases = dict_phrases,
            "global dictionary finalized"
        );
        self.word_counts.clear();
        self.phrase_counts.clear();
        self.phrase_delim_pos.clear();
        Ok(())
    }

    pub fn get_intervals(&self, term: &[u8], picks: &mut Vec<Pick>) {
        let id = self.term_ids.get(term).copied().unwrap_or(0);
        self.squid.encode(id as usize, picks);
    }

    /// Returns the term and whether it was a phrase (two words at once).
    pub fn decode(&self, decoder: &mut Decoder, reader: &mut BitReader) -> Result<(&[u8], bool)> {
        let id = self.squid.decode(decoder, reader)?;
        let term = self
            .terms
            .get(id)
            .ok_or_else(|| Error::Corrupt("dictionary id out of range".into()))?;
        Ok((term, (id as u32) < self.phrase_line))
    }
}

/// Ring of the most recent values, seeded with empty strings so the first
/// value of a stream or block never references anything.
#[derive(Clone, Debug)]
struct LocalRing {
    ring: VecDeque<Vec<u8>>,
}

impl LocalRing {
    fn new() -> Self {
        LocalRing {
            ring: VecDeque::from(vec![Vec::new(); LOCAL_DICT_SIZE]),
        }
    }

    /// Longest usable shared prefix and the ring slot providing it.
    fn best_delta(&self, s: &[u8]) -> (usize, usize) {
        let mut best = 0;
        let mut slot = 0;
        for i in (0..self.ring.len()).rev() {
            let buffer = &self.ring[i];
            let limit = buffer.len().min(s.len()).min(MAX_DELTA);
            let mut common = 0;
            while common < limit && buffer[common] == s[common] {
                common += 1;
            }
            if best < common {
                best = common;
                slot = i;
            }
        }
        if best < MIN_DELTA {
            best = 0;
        }
        (best, slot)
    }

    fn push(&mut self, s: Vec<u8>) {
        self.ring.pop_front();
        self.ring.push_back(s);
    }

    fn prefix(&self, slot: usize, len: usize) -> &[u8] {
        let buffer = &self.ring[slot.min(self.ring.len() - 1)];
        &buffer[..len.min(buffer.len())]
    }
}

/// The full string model: sub-models for sentence shape, per-word coding
/// paths, the global dictionary and the local delta ring.
#[derive(Clone)]
pub struct StringModel {
    target: usize,
    num_words: CategoricalModel,
    encoding: CategoricalModel,
    delimiter: CategoricalModel,
    word_length: NumericalModel,
    delta: CategoricalModel,
    dict_slot: CategoricalModel,
    markov: MarkovCharDist,
    dict: GlobalDictionary,
    learn_ring: LocalRing,
    code_ring: LocalRing,
    splitter: Splitter,
}

impl StringModel {
    pub fn new(target: usize) -> Self {
        StringModel {
            target,
            num_words: CategoricalModel::simple(),
            encoding: CategoricalModel::simple(),
            delimiter: CategoricalModel::simple(),
            word_length: NumericalModel::simple(1.0, true),
            delta: CategoricalModel::simple(),
            dict_slot: CategoricalModel::simple(),
            markov: MarkovCharDist::new(MARKOV_HISTORY),
            dict: GlobalDictionary::default(),
            learn_ring: LocalRing::new(),
            code_ring: LocalRing::new(),
            splitter: Splitter::default(),
        }
    }

    pub fn target(&self) -> usize {
        self.target
    }

    pub fn predictors(&self) -> &[usize] {
        &[]
    }

    /// A single string model shape exists per attribute, so the learner has
    /// nothing to compare.
    pub fn cost(&self) -> f64 {
        0.0
    }

    pub fn dictionary(&self) -> &GlobalDictionary {
        &self.dict
    }

    /// Drop the delta ring at block boundaries so blocks decode without
    /// their predecessors.
    pub fn reset_local_dict(&mut self) {
        self.code_ring = LocalRing::new();
    }

    pub fn feed_tuple(&mut self, tuple: &crate::Tuple, count: u32) {
        let value = tuple.values[self.target].str().as_bytes().to_vec();
        self.feed_bytes(&value, count);
    }

    fn feed_bytes(&mut self, value: &[u8], count: u32) {
        let (delta, slot) = self.learn_ring.best_delta(value);
        self.delta.feed_value(delta, count);
        if delta != 0 {
            self.dict_slot.feed_value(slot, count);
        }
        self.learn_ring.push(value.to_vec());
        let sentence = &value[delta..];

        self.splitter.parse(sentence);
        let n = self.splitter.num_words;
        self.num_words.feed_value(n, count);

        let mut start = 0;
        for w in 0..n {
            let end = self.splitter.word_ends[w];
            let word = &sentence[start..end];
            self.word_length.feed_value(word.len() as f64, 1);
            self.markov.feed_word(word);
            self.dict.push_word(word, count);

            if w == n - 1 {
                break;
            }
            let d = self.splitter.delims[w];
            self.delimiter.feed_value(d, count);
            start = end + (d != EMPTY_DELIM) as usize;
        }

        let mut i = 0;
        while i + 1 < self.splitter.num_phrase {
            let start = if i == 0 {
                0
            } else {
                self.splitter.word_ends[i - 1] + 1
            };
            let end = self.splitter.word_ends[i + 1];
            let delim_pos = self.splitter.word_ends[i] - start;
            self.dict.push_phrase(&sentence[start..end], delim_pos, count);
            i += 2;
        }
    }

    pub fn end_of_data(&mut self) -> Result<()> {
        self.markov.end_of_data()?;
        self.dict.end_of_data(&mut self.encoding)?;

        // One smoothing count on "no prefix": the code-side ring resets at
        // block boundaries, so delta zero must stay codable even when the
        // training stream never produced it.
        self.delta.feed_value(0, 1);
        self.delta.end_of_data()?;
        self.dict_slot.end_of_data()?;

        self.delimiter.end_of_data()?;
        self.encoding.end_of_data()?;
        self.num_words.end_of_data()?;
        self.word_length.end_of_data()?;
        Ok(())
    }

    /// Literal path shared by value coding and dictionary serialization.
    fn literal_intervals(&mut self, word: &[u8], picks: &mut Vec<Pick>) {
        self.word_length.encode_value(word.len() as f64, picks);
        self.markov.get_intervals(word, picks);
    }

    fn literal_decode(
        &mut self,
        decoder: &mut Decoder,
        reader: &mut BitReader,
        out: &mut Vec<u8>,
    ) -> Result<()> {
        let len = self.word_length.decode_value(decoder, reader)?.int();
        if len < 0 {
            return Err(Error::Corrupt("negative word length".into()));
        }
        self.markov.decode(decoder, reader, len as usize, out)
    }

    pub fn encode(&mut self, value: &str, picks: &mut Vec<Pick>) -> Result<()> {
        let value = value.as_bytes();
        let (delta, slot) = self.code_ring.best_delta(value);
        self.delta.encode_value(delta, picks);
        if delta != 0 {
            self.dict_slot.encode_value(slot, picks);
        }
        self.code_ring.push(value.to_vec());
        let sentence = value[delta..].to_vec();

        self.splitter.parse(&sentence);
        let n = self.splitter.num_words;

        // Phrase candidates: adjacent rank-1 segments present in the
        // dictionary collapse into one dictionary pick.
        let mut is_phrase = vec![false; n];
        let mut i = 0;
        while i + 1 < self.splitter.num_phrase {
            let start = if i == 0 {
                0
            } else {
                self.splitter.word_ends[i - 1] + 1
            };
            let end = self.splitter.word_ends[i + 1];
            if end - start >= 3 && self.dict.contains(&sentence[start..end]) {
                is_phrase[i] = true;
                is_phrase[i + 1] = true;
            }
            i += 2;
        }

        self.num_words.encode_value(n, picks);

        let mut start = 0;
        let mut w = 0;
        while w < n {
            if is_phrase[w] {
                w += 1;
            }
            let end = self.splitter.word_ends[w];
            let term = sentence[start..end].to_vec();
            let method = if self.dict.contains(&term) {
                METHOD_DICT
            } else {
                METHOD_LITERAL
            };
            self.encoding.encode_value(method, picks);
            match method {
                METHOD_LITERAL => self.literal_intervals(&term, picks),
                _ => self.dict.get_intervals(&term, picks),
            }

            if w == n - 1 {
                break;
            }
            let d = self.splitter.delims[w];
            self.delimiter.encode_value(d, picks);
            start = end + (d != EMPTY_DELIM) as usize;
            w += 1;
        }
        Ok(())
    }

    pub fn decode(&mut self, decoder: &mut Decoder, reader: &mut BitReader) -> Result<String> {
        let delta = self.delta.decode_value(decoder, reader)? as usize;
        let mut out: Vec<u8> = if delta != 0 {
            let slot = self.dict_slot.decode_value(decoder, reader)? as usize;
            self.code_ring.prefix(slot, delta).to_vec()
        } else {
            Vec::new()
        };

        let n = self.num_words.decode_value(decoder, reader)? as usize;
        let mut w = 0;
        while w < n {
            let method = self.encoding.decode_value(decoder, reader)? as usize;
            match method {
                METHOD_LITERAL => self.literal_decode(decoder, reader, &mut out)?,
                METHOD_DICT => {
                    let (term, phrase) = self.dict.decode(decoder, reader)?;
                    out.extend_from_slice(term);
                    if phrase {
                        w += 1;
                    }
                }
                other => {
                    return Err(Error::Corrupt(format!("unknown encoding method {other}")));
                }
            }
            if w == n.saturating_sub(1) {
                break;
            }
            let d = self.delimiter.decode_value(decoder, reader)? as usize;
            if d != EMPTY_DELIM {
                out.push(DELIMS_RANK2[d.min(DELIMS_RANK2.len() - 1)]);
            }
            w += 1;
        }

        self.code_ring.push(out.clone());
        String::from_utf8(out).map_err(|_| Error::Corrupt("decoded string is not utf-8".into()))
    }

    pub fn write<W: Write>(&self, writer: &mut BitWriter<W>) -> Result<()> {
        self.markov.write(writer)?;
        self.delimiter.write(writer)?;
        self.encoding.write(writer)?;
        self.num_words.write(writer)?;
        self.word_length.write(writer)?;
        self.delta.write(writer)?;
        self.dict_slot.write(writer)?;
        self.write_dictionary(writer)
    }

    /// The dictionary entries travel through the literal path themselves, in
    /// blocks of the fixed dictionary block size.
    fn write_dictionary<W: Write>(&self, writer: &mut BitWriter<W>) -> Result<()> {
        writer.write_u32(self.dict.phrase_line)?;
        writer.write_u32(self.dict.terms.len() as u32)?;
        self.dict.squid.write(writer)?;

        let mut scratch = self.clone_coding_parts();
        let mut picks: Vec<Pick> = Vec::new();
        let mut encoder = BlockEncoder::new(DEFAULT_DELAYED_BITS);
        for term in &self.dict.terms {
            scratch.literal_intervals(term, &mut picks);
            if picks.len() > DICT_BLOCK {
                encoder.encode(&picks, writer)?;
                picks.clear();
            }
        }
        if !picks.is_empty() {
            encoder.encode(&picks, writer)?;
        }
        Ok(())
    }

    // The markov distribution is stateful during literal coding; a scratch
    // copy keeps `write` shared-reference.
    fn clone_coding_parts(&self) -> StringModel {
        self.clone()
    }

    pub fn read(reader: &mut BitReader, target: usize) -> Result<StringModel> {
        let registry = crate::squid::ModelRegistry::new(0);
        let mut model = StringModel::new(target);
        model.markov = MarkovCharDist::read(reader, MARKOV_HISTORY)?;
        model.delimiter = CategoricalModel::read(reader, &registry, 0)?;
        model.encoding = CategoricalModel::read(reader, &registry, 0)?;
        model.num_words = CategoricalModel::read(reader, &registry, 0)?;
        model.word_length = NumericalModel::read(reader, &registry, 0, true)?;
        model.delta = CategoricalModel::read(reader, &registry, 0)?;
        model.dict_slot = CategoricalModel::read(reader, &registry, 0)?;

        model.dict.phrase_line = reader.read_u32();
        let term_count = reader.read_u32() as usize;
        model.dict.squid = GroupedCategorical::read(reader)?;

        let mut decoder = Decoder::new(DEFAULT_DELAYED_BITS);
        for _ in 0..term_count {
            if decoder.words_read() as usize > DICT_BLOCK {
                decoder.reset();
            }
            let mut term = Vec::new();
            model.literal_decode(&mut decoder, reader, &mut term)?;
            let id = model.dict.terms.len() as u32;
            model.dict.term_ids.insert(term.clone(), id);
            model.dict.terms.push(term);
        }
        Ok(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words_of<'a>(splitter: &Splitter, s: &'a [u8]) -> Vec<&'a [u8]> {
        let mut out = Vec::new();
        let mut start = 0;
        for w in 0..splitter.num_words {
            let end = splitter.word_ends[w];
            out.push(&s[start..end]);
            if w == splitter.num_words - 1 {
                break;
            }
            start = end + (splitter.delims[w] != EMPTY_DELIM) as usize;
        }
        out
    }

    #[test]
    fn test_splitter_basic() {
        let mut sp = Splitter::default();
        sp.parse(b"usr/local bin");
        assert_eq!(sp.num_words, 3);
        assert_eq!(sp.num_phrase, 2);
        assert_eq!(words_of(&sp, b"usr/local bin"), vec![&b"usr"[..], b"local", b"bin"]);
    }

    #[test]
    fn test_splitter_transitions() {
        let mut sp = Splitter::default();
        sp.parse(b"abc123deF");
        // letter->digit and lower->upper transitions split without a
        // separator character; digit->letter is not a boundary.
        assert_eq!(sp.num_words, 3);
        assert_eq!(sp.delims[0], EMPTY_DELIM);
        assert_eq!(words_of(&sp, b"abc123deF"), vec![&b"abc"[..], b"123de", b"F"]);
    }

    #[test]
    fn test_splitter_empty_and_runs() {
        let mut sp = Splitter::default();
        sp.parse(b"");
        assert_eq!(sp.num_words, 0);

        // A delimiter run collapses into the word on its left.
        sp.parse(b"a//b");
        assert_eq!(sp.num_words, 2);
        assert_eq!(words_of(&sp, b"a//b"), vec![&b"a/"[..], b"b"]);
    }

    fn roundtrip_strings(values: &[&str]) -> Vec<String> {
        let mut model = StringModel::new(0);
        for v in values {
            let mut t = crate::Tuple::new(1);
            t.values[0] = crate::AttrValue::Str(v.to_string());
            model.feed_tuple(&t, 1);
        }
        model.end_of_data().unwrap();

        let mut picks = Vec::new();
        for v in values {
            model.encode(v, &mut picks).unwrap();
        }
        let mut writer = BitWriter::new(Vec::new());
        let mut enc = BlockEncoder::new(24);
        enc.encode(&picks, &mut writer).unwrap();
        let (buf, _) = writer.finish().unwrap();

        // A freshly read model must decode what the learned model encoded.
        let mut mw = BitWriter::new(Vec::new());
        model.write(&mut mw).unwrap();
        let (mbuf, _) = mw.finish().unwrap();
        let mut decode_model = StringModel::read(&mut BitReader::new(mbuf), 0).unwrap();

        let mut reader = BitReader::new(buf);
        let mut decoder = Decoder::new(24);
        values
            .iter()
            .map(|_| decode_model.decode(&mut decoder, &mut reader).unwrap())
            .collect()
    }

    #[test]
    fn test_string_roundtrip_mixed() {
        let values = vec![
            "apple",
            "banana",
            "apple",
            "cherry-pie",
            "usr/local/bin",
            "",
            "x",
            "Server01",
            "apple",
            "banana split",
        ];
        let decoded = roundtrip_strings(&values);
        assert_eq!(decoded, values);
    }

    #[test]
    fn test_dictionary_admission() {
        let mut model = StringModel::new(0);
        let mut feed = |s: &str, n: u32| {
            let mut t = crate::Tuple::new(1);
            t.values[0] = crate::AttrValue::Str(s.to_string());
            for _ in 0..n {
                model.feed_tuple(&t, 1);
            }
        };
        feed("apple", 500);
        feed("banana", 300);
        feed("cherry", 200);
        model.end_of_data().unwrap();

        let dict = model.dictionary();
        assert_eq!(dict.len(), 3);
        assert!(dict.contains(b"apple"));
        assert!(dict.contains(b"banana"));
        assert!(dict.contains(b"cherry"));
    }

    #[test]
    fn test_rare_word_stays_literal() {
        let mut model = StringModel::new(0);
        let mut feed = |s: &str, n: u32| {
            let mut t = crate::Tuple::new(1);
            t.values[0] = crate::AttrValue::Str(s.to_string());
            for _ in 0..n {
                model.feed_tuple(&t, 1);
            }
        };
        feed("frequent", 100);
        feed("xyz", 2);
        model.end_of_data().unwrap();
        assert!(model.dictionary().contains(b"frequent"));
        assert!(!model.dictionary().contains(b"xyz"));
    }

    #[test]
    fn test_local_dict_prefix_roundtrip() {
        // Long shared prefixes exercise the delta path.
        let values = vec![
            "/var/log/syslog.2024.01.01",
            "/var/log/syslog.2024.01.02",
            "/var/log/syslog.2024.01.03",
            "/var/log/kern.log",
            "/var/log/syslog.2024.01.04",
        ];
        let decoded = roundtrip_strings(&values);
        assert_eq!(decoded, values);
    }

    #[test]
    fn test_block_reset_keeps_blocks_independent() {
        let values = vec!["prefix-shared-a", "prefix-shared-b", "prefix-shared-c"];
        let mut model = StringModel::new(0);
        for v in &values {
            let mut t = crate::Tuple::new(1);
            t.values[0] = crate::AttrValue::Str(v.to_string());
            model.feed_tuple(&t, 1);
        }
        model.end_of_data().unwrap();

        // Encode each value as its own block with a ring reset in between,
        // then decode only the last block.
        let mut writer = BitWriter::new(Vec::new());
        let mut enc = BlockEncoder::new(16);
        let mut offsets = Vec::new();
        let mut bits = 0u64;
        for v in &values {
            model.reset_local_dict();
            let mut picks = Vec::new();
            model.encode(v, &mut picks).unwrap();
            offsets.push(bits);
            bits += enc.encode(&picks, &mut writer).unwrap() as u64 * 16;
        }
        let (buf, _) = writer.finish().unwrap();

        let mut reader = BitReader::new(buf);
        reader.seek(offsets[2]);
        let mut decoder = Decoder::new(16);
        model.reset_local_dict();
        let got = model.decode(&mut decoder, &mut reader).unwrap();
        assert_eq!(got, "prefix-shared-c");
    }
}
