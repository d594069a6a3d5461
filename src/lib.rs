/*!
Learning-based semantic compression for structured records.

Instead of treating rows as byte streams, `rowpack` learns a probability
model per attribute — possibly conditioned on other attributes — and feeds
the resulting branch picks to a delayed arithmetic coder. One 16-bit coded
word can carry information about several picks, which keeps blocks
independently decodable and makes random access at row granularity cheap.

The pipeline:

1. A two-stage learner discovers an attribute ordering and, per attribute, a
   predictor set minimizing empirical cross-entropy plus description length.
2. Per-attribute SquID models (categorical, numerical, string, time-series,
   markov) turn values into probability intervals and back.
3. The delayed coder batches the picks of a block of tuples into 16-bit
   words; a block index appended to the file maps any row to its bit offset.

JSON documents go through the same machinery via a mirror tree of the
schema: every node carries categorical sub-models for existence, type and
array length, and leaves carry one of the value models above.
*/

pub mod bitio;
pub mod categorical;
pub mod coding;
pub mod error;
pub mod index;
pub mod json;
pub mod json_learner;
pub mod learner;
pub mod numerical;
pub mod relation;
pub mod squid;
pub mod strings;
pub mod timeseries;
pub mod util;

use std::collections::HashMap;
use std::io::{BufRead, Write};

pub use error::{Error, Result};
pub use json::{JsonCompressor, JsonDecompressor, JsonSchema};
pub use relation::{RelationCompressor, RelationDecompressor};
pub use squid::{AttrInterpreter, EnumInterpreter, ModelRegistry};

/// Reservoir size for numerical parameter estimation; also the number of
/// randomly drawn tuples the drivers feed per learning pass.
pub const NUM_EST_SAMPLE: usize = 5000;

/// First-layer histogram bins of a numerical distribution.
pub const KBRANCH: usize = 512;

/// Tuples after which a sampling (non-full) learning pass may stop.
pub const NON_FULL_PASS_STOP: usize = 20_000;

/// Ring size of the string models' local dictionary.
pub const LOCAL_DICT_SIZE: usize = 1;

/// History length of the string models' character distribution (0, 1 or 2).
pub const MARKOV_HISTORY: usize = 1;

/// Per-element precision of time-series arrays.
pub const TIME_SERIES_PRECISION: f64 = 0.00499;

/// Auto-regression order of the time-series model.
pub const AR_ORDER: usize = 5;

/// Upper bound on the product of predictor capacities of one model.
pub const MAX_PREDICTOR_CAP: usize = 1000;

/// One attribute value. The schema fixes the variant at every call site;
/// the accessors return a zero value on a mismatched variant.
#[derive(Clone, Debug, PartialEq)]
pub enum AttrValue {
    Int(i32),
    Double(f64),
    Str(String),
}

impl Default for AttrValue {
    fn default() -> Self {
        AttrValue::Int(0)
    }
}

impl AttrValue {
    pub fn int(&self) -> i32 {
        match self {
            AttrValue::Int(v) => *v,
            _ => 0,
        }
    }

    pub fn double(&self) -> f64 {
        match self {
            AttrValue::Double(v) => *v,
            _ => 0.0,
        }
    }

    pub fn str(&self) -> &str {
        match self {
            AttrValue::Str(v) => v,
            _ => "",
        }
    }
}

/// Fixed-width vector of attribute values.
#[derive(Clone, Debug, PartialEq)]
pub struct Tuple {
    pub values: Vec<AttrValue>,
}

impl Tuple {
    pub fn new(cols: usize) -> Self {
        Tuple {
            values: vec![AttrValue::default(); cols],
        }
    }
}

/// Attribute types of the relational schema; the type fixes both the value
/// variant and the model family.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttrType {
    Categorical,
    Integer,
    Double,
    Str,
    TimeSeries,
    CategoricalMarkov,
}

/// Ordered attribute types; its length is the tuple width.
#[derive(Clone, Debug, Default)]
pub struct Schema {
    pub types: Vec<AttrType>,
}

impl Schema {
    pub fn new(types: Vec<AttrType>) -> Self {
        Schema { types }
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

/// Learning configuration: per-attribute error tolerance, and the fast path
/// that keeps schema order with empty predictor lists.
#[derive(Clone, Debug, Default)]
pub struct CompressionConfig {
    pub allowed_err: Vec<f64>,
    pub skip_model_learning: bool,
}

/// Coder parameters shared verbatim by compressor and decompressor.
#[derive(Clone, Copy, Debug)]
pub struct CodingOptions {
    /// Accumulator precision threshold; 24 for ratio, 16 for random access.
    pub delayed_bits: u32,
    /// Picks per block before a flush; with 1, every tuple gets its own
    /// block and `locate_tuple` decodes exactly one.
    pub block_size: usize,
}

impl Default for CodingOptions {
    fn default() -> Self {
        CodingOptions {
            delayed_bits: coding::DEFAULT_DELAYED_BITS,
            block_size: 20_000,
        }
    }
}

/// Bi-directional string <-> id map of one enum attribute.
#[derive(Clone, Debug, Default)]
pub struct EnumDict {
    pub values: Vec<String>,
    index: HashMap<String, u32>,
}

impl EnumDict {
    /// Id of `value`, inserting it on first sight.
    pub fn intern(&mut self, value: &str) -> u32 {
        if let Some(&id) = self.index.get(value) {
            return id;
        }
        let id = self.values.len() as u32;
        self.values.push(value.to_string());
        self.index.insert(value.to_string(), id);
        id
    }

    pub fn name(&self, id: u32) -> &str {
        &self.values[id as usize]
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Write the enum sidecar: one line per dictionary, values comma-separated
/// with a trailing comma.
pub fn write_enum_sidecar<W: Write>(dicts: &[EnumDict], mut out: W) -> Result<()> {
    for dict in dicts {
        for value in &dict.values {
            out.write_all(value.as_bytes())?;
            out.write_all(b",")?;
        }
        out.write_all(b"\n")?;
    }
    Ok(())
}

/// Read `count` dictionaries back from a sidecar.
pub fn read_enum_sidecar<R: BufRead>(reader: R, count: usize) -> Result<Vec<EnumDict>> {
    let mut dicts = vec![EnumDict::default(); count];
    let mut lines = reader.lines();
    for dict in dicts.iter_mut() {
        let line = match lines.next() {
            Some(line) => line?,
            None => break,
        };
        let line = line.strip_suffix('\r').unwrap_or(&line);
        // Split keeps a trailing empty item from the terminating comma;
        // interior empties are real values.
        let mut items: Vec<&str> = line.split(',').collect();
        items.pop();
        for value in items {
            dict.intern(value);
        }
    }
    Ok(dicts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enum_sidecar_roundtrip() {
        let mut a = EnumDict::default();
        a.intern("red");
        a.intern("green");
        a.intern("blue");
        let mut b = EnumDict::default();
        b.intern("x");

        let mut buf = Vec::new();
        write_enum_sidecar(&[a.clone(), b.clone()], &mut buf).unwrap();
        assert_eq!(buf, b"red,green,blue,\nx,\n");

        let back = read_enum_sidecar(&buf[..], 2).unwrap();
        assert_eq!(back[0].values, a.values);
        assert_eq!(back[1].values, b.values);
        assert_eq!(back[0].name(1), "green");
    }

    #[test]
    fn test_enum_dict_intern_is_stable() {
        let mut dict = EnumDict::default();
        assert_eq!(dict.intern("a"), 0);
        assert_eq!(dict.intern("b"), 1);
        assert_eq!(dict.intern("a"), 0);
        assert_eq!(dict.len(), 2);
    }
}
