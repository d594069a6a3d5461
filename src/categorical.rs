//! Categorical SquID and models.
//!
//! A finalized categorical cell is a 16-bit weight vector with one extra
//! "escape" branch absorbing every outcome whose weight quantized to zero;
//! rare outcomes are coded as the escape followed by one uniform pick into
//! the rare map. A cell whose whole mass sits on a single outcome is stored
//! with the sentinel weight 65535 and costs nothing to code.

use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;

use crate::bitio::{BitReader, BitWriter};
use crate::coding::{CodingTable, Decoder, Pick, PROB_ONE};
use crate::error::{Error, Result};
use crate::squid::{AttrInterpreter, ModelRegistry};
use crate::util::DynamicList;
use crate::Tuple;

/// Sentinel for a 65536 weight, which does not fit in 16 bits. At most one
/// branch of a cell can carry it, so the sum disambiguates on read.
pub const ONLY_VALUE_SENTINEL: u32 = 65535;

/// Secondary uniform distribution over the outcomes whose weight quantized
/// to zero.
#[derive(Clone, Debug, Default)]
pub struct RareMap {
    idx_to_branch: Vec<u32>,
    branch_to_idx: HashMap<u32, u32>,
    weight: u32,
}

impl RareMap {
    fn build(weights: &[u32]) -> RareMap {
        let mut map = RareMap::default();
        for (i, &w) in weights.iter().enumerate() {
            if w == 0 {
                let idx = map.idx_to_branch.len() as u32;
                map.idx_to_branch.push(i as u32);
                map.branch_to_idx.insert(i as u32, idx);
            }
        }
        map.weight = PROB_ONE / map.idx_to_branch.len() as u32;
        map
    }
}

/// Statistics of one predictor-value combination.
#[derive(Clone, Debug, Default)]
pub struct CategoricalStats {
    counts: Vec<u32>,
    weights: Vec<u32>,
    only_value: Option<u32>,
    table: Option<CodingTable>,
    rare: Option<RareMap>,
}

impl CategoricalStats {
    pub fn feed(&mut self, value: usize, count: u32) {
        if self.counts.len() <= value {
            self.counts.resize(value + 1, 0);
        }
        self.counts[value] += count;
    }

    /// Quantize counts into weights, allocate the escape branch, build the
    /// coding table. Returns the cell's cross-entropy contribution in bits.
    pub fn finalize_with_range(&mut self, target_range: usize) -> Result<f64> {
        let mut counts = std::mem::take(&mut self.counts);
        counts.resize(target_range, 0);

        // One extra slot for the escape branch.
        self.weights = vec![0u32; target_range + 1];
        let sum: u64 = counts.iter().map(|&c| c as u64).sum();
        let mut left = PROB_ONE as i64;
        let mut zero_weight_exists = false;
        let mut max_idx = 0usize;

        if sum == 0 {
            zero_weight_exists = !counts.is_empty();
        } else {
            for (j, &c) in counts.iter().enumerate() {
                let w = ((c as u64 * PROB_ONE as u64) / sum) as u32;
                self.weights[j] = w;
                left -= w as i64;
                if w == 0 {
                    zero_weight_exists = true;
                }
                if self.weights[j] > self.weights[max_idx] {
                    max_idx = j;
                }
            }
        }

        if zero_weight_exists {
            // Every rare outcome decodes through the escape; borrow one unit
            // from the heaviest branch if quantization left nothing over.
            if left == 0 {
                left = 1;
                self.weights[max_idx] -= 1;
            }
            self.weights[target_range] = left as u32;
            self.rare = Some(RareMap::build(&self.weights));
        } else {
            self.weights[max_idx] += left as u32;
        }

        self.only_value = self
            .weights
            .iter()
            .position(|&w| w == PROB_ONE)
            .map(|i| i as u32);
        self.table = Some(CodingTable::build(&self.weights)?);

        let mut cost = 0.0;
        for (j, &c) in counts.iter().enumerate() {
            if self.weights[j] > 0 && c > 0 {
                cost += c as f64 * (16.0 - (self.weights[j] as f64).log2());
            }
        }
        Ok(cost)
    }

    pub fn write_weights<W: Write>(&self, writer: &mut BitWriter<W>) -> Result<()> {
        for &w in &self.weights {
            let wire = if w == PROB_ONE { ONLY_VALUE_SENTINEL } else { w };
            writer.write_u16(wire as u16)?;
        }
        Ok(())
    }

    pub fn read_weights(reader: &mut BitReader, target_range: usize) -> Result<CategoricalStats> {
        let mut stats = CategoricalStats::default();
        stats.weights = vec![0u32; target_range + 1];
        let mut sum = 0u64;
        let mut sentinel_at = None;
        for j in 0..stats.weights.len() {
            let w = reader.read_u16() as u32;
            stats.weights[j] = w;
            sum += w as u64;
            if w == ONLY_VALUE_SENTINEL {
                sentinel_at = Some(j);
            }
        }
        if sum != PROB_ONE as u64 {
            let Some(j) = sentinel_at else {
                return Err(Error::Corrupt(
                    "categorical weights neither total nor sentinel".into(),
                ));
            };
            stats.weights[j] = PROB_ONE;
            stats.only_value = Some(j as u32);
        }

        let escape = stats.weights[target_range];
        if escape != 0 && escape != PROB_ONE {
            stats.rare = Some(RareMap::build(&stats.weights));
        }
        stats.table = Some(CodingTable::build(&stats.weights)?);
        Ok(stats)
    }

    /// Encoder side: one pick for the branch, or escape plus one uniform
    /// rare pick. A single-valued cell emits nothing.
    pub fn get_intervals(&self, value: usize, picks: &mut Vec<Pick>) {
        if self.only_value.is_some() {
            return;
        }
        let Some(table) = &self.table else { return };
        if value < self.weights.len() - 1 && self.weights[value] != 0 {
            picks.push(table.pick(value as u32));
        } else {
            let escape = (self.weights.len() - 1) as u32;
            picks.push(table.pick(escape));
            if let Some(rare) = &self.rare {
                picks.push(Pick::Uniform {
                    weight: rare.weight,
                    index: rare.branch_to_idx.get(&(value as u32)).copied().unwrap_or(0),
                });
            }
        }
    }

    /// Decoder side, mirroring `get_intervals` word for word.
    pub fn decode(&self, decoder: &mut Decoder, reader: &mut BitReader) -> Result<u32> {
        if let Some(v) = self.only_value {
            return Ok(v);
        }
        let Some(table) = &self.table else {
            return Err(Error::Corrupt("categorical cell not finalized".into()));
        };
        let word = decoder.read_word(reader);
        let d = table.decode(word);
        decoder.update(d.weight, d.numerator);

        let escape = (self.weights.len() - 1) as u32;
        if d.branch == escape {
            let Some(rare) = &self.rare else {
                return Err(Error::Corrupt("escape branch without rare map".into()));
            };
            let idx = decoder.read_uniform(reader, rare.weight) as usize;
            return rare
                .idx_to_branch
                .get(idx)
                .copied()
                .ok_or_else(|| Error::Corrupt("rare index out of range".into()));
        }
        Ok(d.branch)
    }

    pub fn only_value(&self) -> Option<u32> {
        self.only_value
    }
}

/// Categorical model, optionally conditioned on a predictor tuple through a
/// dense cell table.
#[derive(Clone)]
pub struct CategoricalModel {
    predictors: Vec<usize>,
    caps: Vec<usize>,
    interpreters: Vec<Arc<dyn AttrInterpreter>>,
    target: usize,
    target_range: usize,
    cells: DynamicList<CategoricalStats>,
    cost: f64,
}

impl CategoricalModel {
    /// Unconditioned model; also the form used for sub-models inside string
    /// and JSON models.
    pub fn simple() -> Self {
        CategoricalModel {
            predictors: Vec::new(),
            caps: Vec::new(),
            interpreters: Vec::new(),
            target: 0,
            target_range: 0,
            cells: DynamicList::new(Vec::new()),
            cost: 0.0,
        }
    }

    /// Conditioned model; `None` when a predictor is not enum-interpretable
    /// or the cell table would exceed the capacity limit.
    pub fn conditioned(
        registry: &ModelRegistry,
        predictors: Vec<usize>,
        target: usize,
    ) -> Option<Self> {
        let caps = registry.predictor_caps(&predictors)?;
        let interpreters = predictors.iter().map(|&p| registry.interpreter(p)).collect();
        Some(CategoricalModel {
            cells: DynamicList::new(caps.clone()),
            caps,
            interpreters,
            predictors,
            target,
            target_range: 0,
            cost: 0.0,
        })
    }

    pub fn target(&self) -> usize {
        self.target
    }

    pub fn predictors(&self) -> &[usize] {
        &self.predictors
    }

    pub fn target_range(&self) -> usize {
        self.target_range
    }

    pub fn cost(&self) -> f64 {
        self.cost
    }

    fn cell_position(&self, tuple: &Tuple) -> usize {
        let mut pos = 0usize;
        for (i, &p) in self.predictors.iter().enumerate() {
            let val = self.interpreters[i]
                .interpret(&tuple.values[p])
                .min(self.caps[i].saturating_sub(1));
            pos = pos * self.caps[i] + val;
        }
        pos
    }

    pub fn feed_tuple(&mut self, tuple: &Tuple, count: u32) {
        let value = tuple.values[self.target].int().max(0) as usize;
        let pos = self.cell_position(tuple);
        if value >= self.target_range {
            self.target_range = value + 1;
        }
        self.cells.get_mut(pos).feed(value, count);
    }

    /// Feed a bare value into the unconditioned cell.
    pub fn feed_value(&mut self, value: usize, count: u32) {
        if value >= self.target_range {
            self.target_range = value + 1;
        }
        self.cells.get_mut(0).feed(value, count);
    }

    pub fn end_of_data(&mut self) -> Result<()> {
        let range = self.target_range;
        let mut cost = 0.0;
        for cell in self.cells.iter_mut() {
            cost += cell.finalize_with_range(range)?;
        }
        self.cost = cost + self.description_bits();
        Ok(())
    }

    fn description_bits(&self) -> f64 {
        let per_cell = (self.target_range as f64 - 1.0).max(0.0) * 16.0;
        self.cells.len() as f64 * per_cell + self.predictors.len() as f64 * 16.0 + 32.0
    }

    pub fn encode(&self, tuple: &Tuple, picks: &mut Vec<Pick>) {
        let value = tuple.values[self.target].int().max(0) as usize;
        let pos = self.cell_position(tuple);
        self.cells.get(pos).get_intervals(value, picks);
    }

    pub fn decode(
        &self,
        decoder: &mut Decoder,
        reader: &mut BitReader,
        tuple: &Tuple,
    ) -> Result<u32> {
        let pos = self.cell_position(tuple);
        self.cells.get(pos).decode(decoder, reader)
    }

    /// Simple-path encode into the unconditioned cell.
    pub fn encode_value(&self, value: usize, picks: &mut Vec<Pick>) {
        self.cells.get(0).get_intervals(value, picks);
    }

    pub fn decode_value(&self, decoder: &mut Decoder, reader: &mut BitReader) -> Result<u32> {
        self.cells.get(0).decode(decoder, reader)
    }

    /// Single outcome of the unconditioned cell, if the cell is degenerate.
    pub fn simple_only_value(&self) -> Option<u32> {
        self.cells.get(0).only_value()
    }

    pub fn write<W: Write>(&self, writer: &mut BitWriter<W>) -> Result<()> {
        writer.write_byte(self.predictors.len() as u8)?;
        for &p in &self.predictors {
            writer.write_u16(p as u16)?;
        }
        writer.write_u16(self.target_range as u16)?;
        for cell in self.cells.iter() {
            cell.write_weights(writer)?;
        }
        Ok(())
    }

    pub fn read(
        reader: &mut BitReader,
        registry: &ModelRegistry,
        target: usize,
    ) -> Result<CategoricalModel> {
        let predictor_count = reader.read_byte() as usize;
        let predictors: Vec<usize> = (0..predictor_count)
            .map(|_| reader.read_u16() as usize)
            .collect();
        let mut model = CategoricalModel::conditioned(registry, predictors, target)
            .ok_or_else(|| Error::Corrupt("serialized predictors exceed capacity".into()))?;
        model.target_range = reader.read_u16() as usize;
        for pos in 0..model.cells.len() {
            *model.cells.get_mut(pos) = CategoricalStats::read_weights(reader, model.target_range)?;
        }
        Ok(model)
    }
}

/// State-conditioned categorical chain: one categorical model per previous
/// value of the same attribute. The chain position is reset at the start of
/// each stream, so random access within a markov column is only exact from
/// the stream head.
#[derive(Clone)]
pub struct MarkovModel {
    states: Vec<CategoricalModel>,
    state: usize,
}

impl MarkovModel {
    pub fn create(
        registry: &ModelRegistry,
        predictors: Vec<usize>,
        target: usize,
    ) -> Option<Self> {
        let num_states = registry.interpreter(target).enum_cap();
        if num_states == 0 {
            return None;
        }
        let mut states = Vec::with_capacity(num_states);
        for _ in 0..num_states {
            states.push(CategoricalModel::conditioned(
                registry,
                predictors.clone(),
                target,
            )?);
        }
        Some(MarkovModel { states, state: 0 })
    }

    pub fn target(&self) -> usize {
        self.states[0].target()
    }

    pub fn predictors(&self) -> &[usize] {
        self.states[0].predictors()
    }

    pub fn cost(&self) -> f64 {
        self.states.iter().map(|s| s.cost()).sum()
    }

    pub fn reset_state(&mut self) {
        self.state = 0;
    }

    fn clamp_state(&self, value: i32) -> usize {
        (value.max(0) as usize).min(self.states.len() - 1)
    }

    pub fn feed_tuple(&mut self, tuple: &Tuple, count: u32) {
        self.states[self.state].feed_tuple(tuple, count);
        self.state = self.clamp_state(tuple.values[self.target()].int());
    }

    pub fn end_of_data(&mut self) -> Result<()> {
        for state in self.states.iter_mut() {
            state.end_of_data()?;
        }
        self.state = 0;
        Ok(())
    }

    pub fn encode(&mut self, tuple: &Tuple, picks: &mut Vec<Pick>) {
        self.states[self.state].encode(tuple, picks);
        self.state = self.clamp_state(tuple.values[self.target()].int());
    }

    pub fn decode(
        &mut self,
        decoder: &mut Decoder,
        reader: &mut BitReader,
        tuple: &Tuple,
    ) -> Result<u32> {
        let choice = self.states[self.state].decode(decoder, reader, tuple)?;
        self.state = self.clamp_state(choice as i32);
        Ok(choice)
    }

    pub fn write<W: Write>(&self, writer: &mut BitWriter<W>) -> Result<()> {
        writer.write_u16(self.states.len() as u16)?;
        for state in &self.states {
            state.write(writer)?;
        }
        Ok(())
    }

    pub fn read(
        reader: &mut BitReader,
        registry: &ModelRegistry,
        target: usize,
    ) -> Result<MarkovModel> {
        let num_states = reader.read_u16() as usize;
        if num_states == 0 {
            return Err(Error::Corrupt("markov model with zero states".into()));
        }
        let states = (0..num_states)
            .map(|_| CategoricalModel::read(reader, registry, target))
            .collect::<Result<Vec<_>>>()?;
        Ok(MarkovModel { states, state: 0 })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitio::BitWriter;
    use crate::coding::BlockEncoder;

    fn roundtrip_values(values: &[usize]) -> Vec<u32> {
        let mut model = CategoricalModel::simple();
        for &v in values {
            model.feed_value(v, 1);
        }
        model.end_of_data().unwrap();

        let mut picks = Vec::new();
        for &v in values {
            model.encode_value(v, &mut picks);
        }
        let mut writer = BitWriter::new(Vec::new());
        let mut enc = BlockEncoder::new(24);
        enc.encode(&picks, &mut writer).unwrap();
        let (buf, _) = writer.finish().unwrap();

        let mut reader = BitReader::new(buf);
        let mut decoder = Decoder::new(24);
        values
            .iter()
            .map(|_| model.decode_value(&mut decoder, &mut reader).unwrap())
            .collect()
    }

    #[test]
    fn test_simple_roundtrip() {
        let values: Vec<usize> = (0..300).map(|i| i % 3).collect();
        let decoded = roundtrip_values(&values);
        assert_eq!(decoded, values.iter().map(|&v| v as u32).collect::<Vec<_>>());
    }

    #[test]
    fn test_rare_branch_roundtrip() {
        // A single occurrence in 100k quantizes to zero weight and decodes
        // through the escape branch.
        let mut values: Vec<usize> = vec![0; 70000];
        values.extend_from_slice(&[1; 30000]);
        values[100] = 2;
        let decoded = roundtrip_values(&values);
        for (v, d) in values.iter().zip(&decoded) {
            assert_eq!(*v as u32, *d);
        }
    }

    #[test]
    fn test_single_value_emits_nothing() {
        let mut model = CategoricalModel::simple();
        for _ in 0..100 {
            model.feed_value(0, 1);
        }
        model.end_of_data().unwrap();
        assert_eq!(model.simple_only_value(), Some(0));

        let mut picks = Vec::new();
        model.encode_value(0, &mut picks);
        assert!(picks.is_empty());

        let mut reader = BitReader::new(Vec::new());
        let mut decoder = Decoder::new(24);
        assert_eq!(model.decode_value(&mut decoder, &mut reader).unwrap(), 0);
        assert_eq!(decoder.words_read(), 0);
    }

    #[test]
    fn test_write_read_identical_encodings() {
        let values: Vec<usize> = (0..5000).map(|i| (i * i) % 7).collect();
        let mut model = CategoricalModel::simple();
        for &v in &values {
            model.feed_value(v, 1);
        }
        model.end_of_data().unwrap();

        let mut writer = BitWriter::new(Vec::new());
        model.write(&mut writer).unwrap();
        let (buf, _) = writer.finish().unwrap();
        let registry = ModelRegistry::new(1);
        let back = CategoricalModel::read(&mut BitReader::new(buf), &registry, 0).unwrap();

        let encode_with = |m: &CategoricalModel| {
            let mut picks = Vec::new();
            for &v in &values {
                m.encode_value(v, &mut picks);
            }
            let mut w = BitWriter::new(Vec::new());
            let mut enc = BlockEncoder::new(24);
            enc.encode(&picks, &mut w).unwrap();
            w.finish().unwrap().0
        };
        assert_eq!(encode_with(&model), encode_with(&back));
    }

    #[test]
    fn test_conditioned_model_roundtrip() {
        use crate::squid::EnumInterpreter;
        use crate::AttrValue;

        let mut registry = ModelRegistry::new(2);
        registry.set_interpreter(0, Arc::new(EnumInterpreter::new(3)));

        let mut model = CategoricalModel::conditioned(&registry, vec![0], 1).unwrap();
        let mut tuples = Vec::new();
        for i in 0..600 {
            let a = i % 3;
            let b = (a + i / 3) % 4;
            let mut t = Tuple::new(2);
            t.values[0] = AttrValue::Int(a as i32);
            t.values[1] = AttrValue::Int(b as i32);
            tuples.push(t);
        }
        for t in &tuples {
            model.feed_tuple(t, 1);
        }
        model.end_of_data().unwrap();

        let mut picks = Vec::new();
        for t in &tuples {
            model.encode(t, &mut picks);
        }
        let mut writer = BitWriter::new(Vec::new());
        let mut enc = BlockEncoder::new(24);
        enc.encode(&picks, &mut writer).unwrap();
        let (buf, _) = writer.finish().unwrap();

        let mut reader = BitReader::new(buf);
        let mut decoder = Decoder::new(24);
        for t in &tuples {
            let got = model.decode(&mut decoder, &mut reader, t).unwrap();
            assert_eq!(got as i32, t.values[1].int());
        }
    }

    #[test]
    fn test_markov_chain_roundtrip() {
        use crate::squid::EnumInterpreter;
        use crate::AttrValue;

        let mut registry = ModelRegistry::new(1);
        registry.set_interpreter(0, Arc::new(EnumInterpreter::new(4)));

        let mut model = MarkovModel::create(&registry, Vec::new(), 0).unwrap();
        let values: Vec<i32> = (0..2000).map(|i| ((i * 7 + i / 5) % 4) as i32).collect();
        let mut tuples = Vec::new();
        for &v in &values {
            let mut t = Tuple::new(1);
            t.values[0] = AttrValue::Int(v);
            tuples.push(t);
        }
        for t in &tuples {
            model.feed_tuple(t, 1);
        }
        model.end_of_data().unwrap();

        model.reset_state();
        let mut picks = Vec::new();
        for t in &tuples {
            model.encode(t, &mut picks);
        }
        let mut writer = BitWriter::new(Vec::new());
        let mut enc = BlockEncoder::new(24);
        enc.encode(&picks, &mut writer).unwrap();
        let (buf, _) = writer.finish().unwrap();

        model.reset_state();
        let mut reader = BitReader::new(buf);
        let mut decoder = Decoder::new(24);
        let empty = Tuple::new(1);
        for &v in &values {
            let got = model.decode(&mut decoder, &mut reader, &empty).unwrap();
            assert_eq!(got as i32, v);
        }
    }
}
