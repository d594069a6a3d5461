//! Model dispatch and registry.
//!
//! Every attribute model is one arm of the [`SquidModel`] tagged variant;
//! dispatch is a plain match rather than a trait object, which keeps the
//! per-tuple encode loop free of virtual calls. The registry wires attribute
//! indices to interpreters (how a value conditions other attributes) and is
//! passed in explicitly so two configurations can coexist in one process.

use std::io::Write;
use std::sync::Arc;

use crate::bitio::{BitReader, BitWriter};
use crate::categorical::{CategoricalModel, MarkovModel};
use crate::coding::{Decoder, Pick};
use crate::error::Result;
use crate::numerical::NumericalModel;
use crate::strings::StringModel;
use crate::{AttrType, AttrValue, Schema, Tuple, MAX_PREDICTOR_CAP};

/// Translates attribute values into dense predictor indices. An attribute
/// may only condition other attributes if its interpreter declares a finite
/// capacity.
pub trait AttrInterpreter: Send + Sync {
    fn enum_interpretable(&self) -> bool {
        false
    }

    fn enum_cap(&self) -> usize {
        0
    }

    fn interpret(&self, value: &AttrValue) -> usize {
        let _ = value;
        0
    }
}

/// Non-interpretable default; the attribute cannot serve as a predictor.
pub struct DefaultInterpreter;

impl AttrInterpreter for DefaultInterpreter {}

/// Interpreter for categorical attributes holding dense ids below `cap`.
pub struct EnumInterpreter {
    cap: usize,
}

impl EnumInterpreter {
    pub fn new(cap: usize) -> Self {
        EnumInterpreter { cap }
    }
}

impl AttrInterpreter for EnumInterpreter {
    fn enum_interpretable(&self) -> bool {
        true
    }

    fn enum_cap(&self) -> usize {
        self.cap
    }

    fn interpret(&self, value: &AttrValue) -> usize {
        (value.int().max(0) as usize).min(self.cap.saturating_sub(1))
    }
}

/// Attribute-index -> interpreter wiring, shared by learner, compressor and
/// decompressor.
pub struct ModelRegistry {
    interpreters: Vec<Arc<dyn AttrInterpreter>>,
}

impl ModelRegistry {
    /// A registry with non-interpretable defaults for `count` attributes.
    pub fn new(count: usize) -> Self {
        ModelRegistry {
            interpreters: (0..count)
                .map(|_| Arc::new(DefaultInterpreter) as Arc<dyn AttrInterpreter>)
                .collect(),
        }
    }

    pub fn set_interpreter(&mut self, index: usize, interpreter: Arc<dyn AttrInterpreter>) {
        if index >= self.interpreters.len() {
            self.interpreters
                .resize_with(index + 1, || Arc::new(DefaultInterpreter) as _);
        }
        self.interpreters[index] = interpreter;
    }

    pub fn interpreter(&self, index: usize) -> Arc<dyn AttrInterpreter> {
        self.interpreters
            .get(index)
            .cloned()
            .unwrap_or_else(|| Arc::new(DefaultInterpreter))
    }

    /// Capacity per predictor, or `None` if any predictor cannot condition
    /// other attributes or the table would outgrow the capacity limit.
    pub fn predictor_caps(&self, predictors: &[usize]) -> Option<Vec<usize>> {
        let mut caps = Vec::with_capacity(predictors.len());
        let mut product = 1usize;
        for &p in predictors {
            let interp = self.interpreter(p);
            if !interp.enum_interpretable() {
                return None;
            }
            product = product.saturating_mul(interp.enum_cap());
            if product > MAX_PREDICTOR_CAP {
                return None;
            }
            caps.push(interp.enum_cap());
        }
        Some(caps)
    }
}

/// A per-attribute model; one variant per model family.
#[derive(Clone)]
pub enum SquidModel {
    Categorical(CategoricalModel),
    Numerical(NumericalModel),
    Str(StringModel),
    Markov(MarkovModel),
}

/// Build a candidate model, or `None` when the predictor set is infeasible
/// for this attribute type (capacity limit, non-interpretable predictor, or
/// a family that admits no predictors).
pub fn create_model(
    schema: &Schema,
    registry: &ModelRegistry,
    predictors: &[usize],
    target: usize,
    err: f64,
) -> Option<SquidModel> {
    match schema.types[target] {
        AttrType::Categorical => {
            CategoricalModel::conditioned(registry, predictors.to_vec(), target)
                .map(SquidModel::Categorical)
        }
        AttrType::Integer => {
            let bin = (2.0 * err).floor().max(1.0);
            NumericalModel::conditioned(registry, predictors.to_vec(), target, bin, true)
                .map(SquidModel::Numerical)
        }
        // Relational time-series columns degrade to one double per row; the
        // array form only exists under a JSON array node.
        AttrType::Double | AttrType::TimeSeries => {
            NumericalModel::conditioned(registry, predictors.to_vec(), target, err * 2.0, false)
                .map(SquidModel::Numerical)
        }
        AttrType::Str => {
            if !predictors.is_empty() {
                return None;
            }
            Some(SquidModel::Str(StringModel::new(target)))
        }
        AttrType::CategoricalMarkov => {
            MarkovModel::create(registry, predictors.to_vec(), target).map(SquidModel::Markov)
        }
    }
}

/// Reconstruct a serialized model; the schema supplies the family.
pub fn read_model(
    reader: &mut BitReader,
    schema: &Schema,
    registry: &ModelRegistry,
    target: usize,
) -> Result<SquidModel> {
    match schema.types[target] {
        AttrType::Categorical => {
            CategoricalModel::read(reader, registry, target).map(SquidModel::Categorical)
        }
        AttrType::Integer => {
            NumericalModel::read(reader, registry, target, true).map(SquidModel::Numerical)
        }
        AttrType::Double | AttrType::TimeSeries => {
            NumericalModel::read(reader, registry, target, false).map(SquidModel::Numerical)
        }
        AttrType::Str => StringModel::read(reader, target).map(SquidModel::Str),
        AttrType::CategoricalMarkov => {
            MarkovModel::read(reader, registry, target).map(SquidModel::Markov)
        }
    }
}

impl SquidModel {
    pub fn target(&self) -> usize {
        match self {
            SquidModel::Categorical(m) => m.target(),
            SquidModel::Numerical(m) => m.target(),
            SquidModel::Str(m) => m.target(),
            SquidModel::Markov(m) => m.target(),
        }
    }

    pub fn predictors(&self) -> &[usize] {
        match self {
            SquidModel::Categorical(m) => m.predictors(),
            SquidModel::Numerical(m) => m.predictors(),
            SquidModel::Str(m) => m.predictors(),
            SquidModel::Markov(m) => m.predictors(),
        }
    }

    pub fn feed(&mut self, tuple: &Tuple, count: u32) {
        match self {
            SquidModel::Categorical(m) => m.feed_tuple(tuple, count),
            SquidModel::Numerical(m) => m.feed_tuple(tuple, count),
            SquidModel::Str(m) => m.feed_tuple(tuple, count),
            SquidModel::Markov(m) => m.feed_tuple(tuple, count),
        }
    }

    pub fn end_of_data(&mut self) -> Result<()> {
        match self {
            SquidModel::Categorical(m) => m.end_of_data(),
            SquidModel::Numerical(m) => m.end_of_data(),
            SquidModel::Str(m) => m.end_of_data(),
            SquidModel::Markov(m) => m.end_of_data(),
        }
    }

    /// Model cost: empirical cross-entropy of the training feed plus the
    /// serialized description length, in bits.
    pub fn cost(&self) -> f64 {
        match self {
            SquidModel::Categorical(m) => m.cost(),
            SquidModel::Numerical(m) => m.cost(),
            SquidModel::Str(m) => m.cost(),
            SquidModel::Markov(m) => m.cost(),
        }
    }

    pub fn write<W: Write>(&self, writer: &mut BitWriter<W>) -> Result<()> {
        match self {
            SquidModel::Categorical(m) => m.write(writer),
            SquidModel::Numerical(m) => m.write(writer),
            SquidModel::Str(m) => m.write(writer),
            SquidModel::Markov(m) => m.write(writer),
        }
    }

    /// Emit the branch picks encoding this tuple's target attribute.
    pub fn encode(&mut self, tuple: &Tuple, picks: &mut Vec<Pick>) -> Result<()> {
        match self {
            SquidModel::Categorical(m) => {
                m.encode(tuple, picks);
                Ok(())
            }
            SquidModel::Numerical(m) => {
                m.encode(tuple, picks);
                Ok(())
            }
            SquidModel::Str(m) => {
                let target = m.target();
                m.encode(tuple.values[target].str(), picks)
            }
            SquidModel::Markov(m) => {
                m.encode(tuple, picks);
                Ok(())
            }
        }
    }

    /// Decode this attribute; `tuple` holds the attributes already decoded
    /// in the learned ordering, which conditioned models consult.
    pub fn decode(
        &mut self,
        decoder: &mut Decoder,
        reader: &mut BitReader,
        tuple: &Tuple,
    ) -> Result<AttrValue> {
        match self {
            SquidModel::Categorical(m) => {
                Ok(AttrValue::Int(m.decode(decoder, reader, tuple)? as i32))
            }
            SquidModel::Numerical(m) => Ok(m.decode(decoder, reader, tuple)?),
            SquidModel::Str(m) => Ok(AttrValue::Str(m.decode(decoder, reader)?)),
            SquidModel::Markov(m) => Ok(AttrValue::Int(m.decode(decoder, reader, tuple)? as i32)),
        }
    }

    /// Drop state that must not leak across block boundaries. String local
    /// dictionaries reset so any block decodes without its predecessors;
    /// markov chains deliberately do not (their cell choice must match the
    /// training stream), which is why markov columns stay sequential-only.
    pub fn reset_block_state(&mut self) {
        if let SquidModel::Str(m) = self {
            m.reset_local_dict();
        }
    }
}
