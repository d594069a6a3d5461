//! Relational compressor and decompressor drivers.
//!
//! The compressor runs the learning protocol (sampled passes until the
//! learner converges, then full refit passes), serializes the model tree,
//! and then walks tuples in the learned attribute ordering, batching branch
//! picks into blocks. Every flushed block contributes one index entry, so
//! the decompressor can seek any tuple through the tail index and decode at
//! most one block to reach it.
//!
//! File layout: `u32` tuple count, one `u16` per position of the attribute
//! ordering, the serialized models in schema order, the block payloads, and
//! the index table with its trailing `u32` entry count.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use tracing::debug;

use crate::bitio::{BitReader, BitWriter};
use crate::coding::{BlockEncoder, Decoder};
use crate::error::{Error, Result};
use crate::index::{IndexReader, IndexWriter};
use crate::learner::RelationLearner;
use crate::squid::{read_model, ModelRegistry, SquidModel};
use crate::{AttrType, CodingOptions, CompressionConfig, Schema, Tuple, NUM_EST_SAMPLE};

/// Slack on top of the per-block pick capacity; a single tuple may emit
/// many picks (long strings, deep tails).
const PICK_SLACK: usize = 10_000;

enum Stage {
    Learning,
    Compressing,
    Finished,
}

pub struct RelationCompressor<W: Write> {
    schema: Schema,
    opts: CodingOptions,
    learner: Option<RelationLearner>,
    models: Vec<SquidModel>,
    attr_order: Vec<usize>,
    sink: Option<W>,
    writer: Option<BitWriter<W>>,
    encoder: BlockEncoder,
    picks: Vec<crate::coding::Pick>,
    pick_limit: usize,
    index: IndexWriter,
    num_tuples: u32,
    model_bits: u64,
    stage: Stage,
}

impl<W: Write> RelationCompressor<W> {
    pub fn new(
        sink: W,
        schema: Schema,
        config: CompressionConfig,
        opts: CodingOptions,
        registry: Arc<ModelRegistry>,
    ) -> Self {
        let learner = RelationLearner::new(schema.clone(), config, registry);
        RelationCompressor {
            pick_limit: (opts.block_size << 8) + PICK_SLACK,
            encoder: BlockEncoder::new(opts.delayed_bits),
            schema,
            opts,
            learner: Some(learner),
            models: Vec::new(),
            attr_order: Vec::new(),
            sink: Some(sink),
            writer: None,
            picks: Vec::new(),
            index: IndexWriter::new(),
            num_tuples: 0,
            model_bits: 0,
            stage: Stage::Learning,
        }
    }

    /// Whether the next learning pass must cover the whole data set. While
    /// false, a pass may stop after `NON_FULL_PASS_STOP` tuples.
    pub fn needs_full_pass(&self) -> bool {
        match &self.learner {
            Some(learner) => learner.needs_full_pass(),
            None => true,
        }
    }

    pub fn needs_more_learning(&self) -> bool {
        self.learner.is_some()
    }

    /// Feed one tuple of the current learning pass. The driver protocol
    /// draws `NUM_EST_SAMPLE` random tuples first in every pass, then the
    /// data in order; the written tuple count discounts the random draws.
    pub fn learn_tuple(&mut self, tuple: &Tuple) {
        if let Some(learner) = &mut self.learner {
            learner.feed_tuple(tuple);
            self.num_tuples += 1;
        }
    }

    /// Close one learning pass; once the learner converges this serializes
    /// the header and model tree and switches to compression.
    pub fn end_of_learning(&mut self) -> Result<()> {
        let Some(learner) = &mut self.learner else {
            return Ok(());
        };
        learner.end_of_data()?;

        if !learner.needs_more_iterations() {
            let Some(mut learner) = self.learner.take() else {
                return Ok(());
            };
            self.attr_order = learner.ordering().to_vec();
            self.models = (0..self.schema.len())
                .map(|i| learner.take_model(i))
                .collect::<Result<Vec<_>>>()?;

            let Some(sink) = self.sink.take() else {
                return Err(Error::Schema("output sink already consumed".into()));
            };
            let mut writer = BitWriter::new(sink);
            writer.write_u32(self.num_tuples.saturating_sub(NUM_EST_SAMPLE as u32))?;
            for &attr in &self.attr_order {
                writer.write_u16(attr as u16)?;
            }

            writer.reset_bit_count();
            for model in &self.models {
                model.write(&mut writer)?;
            }
            self.model_bits = writer.bits_written();
            debug!(model_kib = self.model_bits >> 13, "model tree serialized");

            self.writer = Some(writer);
            self.stage = Stage::Compressing;
        }
        self.num_tuples = 0;
        Ok(())
    }

    /// Serialized model tree size; available once compression starts.
    pub fn model_size_bits(&self) -> u64 {
        self.model_bits
    }

    pub fn compress_tuple(&mut self, tuple: &Tuple) -> Result<()> {
        if !matches!(self.stage, Stage::Compressing) {
            return Err(Error::Schema("compressor is not in the data stage".into()));
        }
        if tuple.values.len() != self.schema.len() {
            return Err(Error::Schema(format!(
                "tuple has {} columns, schema {}",
                tuple.values.len(),
                self.schema.len()
            )));
        }
        for &attr in &self.attr_order {
            self.models[attr].encode(tuple, &mut self.picks)?;
        }
        if self.picks.len() > self.pick_limit {
            return Err(Error::BufferOverflow {
                observed: self.picks.len(),
                allowed: self.pick_limit,
            });
        }
        self.num_tuples += 1;

        if self.picks.len() > self.opts.block_size {
            self.flush_block()?;
        }
        Ok(())
    }

    fn flush_block(&mut self) -> Result<()> {
        let Some(writer) = self.writer.as_mut() else {
            return Err(Error::Schema("compressor is not in the data stage".into()));
        };
        let words = self.encoder.encode(&self.picks, writer)?;
        self.index.record_block(words, self.num_tuples)?;
        self.picks.clear();
        for model in self.models.iter_mut() {
            model.reset_block_state();
        }
        Ok(())
    }

    /// Flush the trailing block, append the index, and return the sink.
    pub fn finish(mut self) -> Result<W> {
        self.flush_block()?;
        let Some(mut writer) = self.writer.take() else {
            return Err(Error::Schema("compressor is not in the data stage".into()));
        };
        self.index.finish(&mut writer)?;
        debug!(blocks = self.index.block_count(), "compression finished");
        self.stage = Stage::Finished;
        let (sink, _) = writer.finish()?;
        Ok(sink)
    }
}

pub struct RelationDecompressor {
    schema: Schema,
    opts: CodingOptions,
    reader: BitReader,
    models: Vec<SquidModel>,
    attr_order: Vec<usize>,
    decoder: Decoder,
    index: IndexReader,
    data_pos: u64,
    total_tuples: u32,
    todo: u64,
    done: u64,
}

impl RelationDecompressor {
    /// Parse header, models and tail index from a whole compressed file held
    /// in memory.
    pub fn new(
        data: Vec<u8>,
        schema: Schema,
        opts: CodingOptions,
        registry: Arc<ModelRegistry>,
    ) -> Result<Self> {
        let mut reader = BitReader::new(data);
        let total_tuples = reader.read_u32();

        let mut attr_order = Vec::with_capacity(schema.len());
        for _ in 0..schema.len() {
            let attr = reader.read_u16() as usize;
            if attr >= schema.len() {
                return Err(Error::Corrupt(format!(
                    "attribute index {attr} outside schema"
                )));
            }
            attr_order.push(attr);
        }

        let models = (0..schema.len())
            .map(|i| read_model(&mut reader, &schema, &registry, i))
            .collect::<Result<Vec<_>>>()?;

        let data_pos = reader.tell();
        let index = IndexReader::parse(&mut reader)?;
        reader.seek(data_pos);

        Ok(RelationDecompressor {
            decoder: Decoder::new(opts.delayed_bits),
            todo: total_tuples as u64,
            done: 0,
            schema,
            opts,
            reader,
            models,
            attr_order,
            index,
            data_pos,
            total_tuples,
        })
    }

    pub fn open<P: AsRef<Path>>(
        path: P,
        schema: Schema,
        opts: CodingOptions,
        registry: Arc<ModelRegistry>,
    ) -> Result<Self> {
        let data = std::fs::read(path)?;
        RelationDecompressor::new(data, schema, opts, registry)
    }

    pub fn total_tuples(&self) -> u32 {
        self.total_tuples
    }

    pub fn has_next(&self) -> bool {
        self.done < self.todo
    }

    fn reset_block(&mut self) {
        self.decoder.reset();
        for model in self.models.iter_mut() {
            model.reset_block_state();
        }
    }

    pub fn read_next_tuple(&mut self, tuple: &mut Tuple) -> Result<()> {
        if self.decoder.words_read() as usize > self.opts.block_size {
            self.reset_block();
        }
        for k in 0..self.attr_order.len() {
            let attr = self.attr_order[k];
            let value = self.models[attr].decode(&mut self.decoder, &mut self.reader, tuple)?;
            tuple.values[attr] = value;
        }
        self.done += 1;
        Ok(())
    }

    /// Position at the block holding tuple `idx`; returns how many preceding
    /// tuples of that block must be decoded and discarded. Markov columns
    /// carry chain state across blocks, so they only decode sequentially.
    pub fn locate_tuple(&mut self, idx: u32) -> Result<u32> {
        if idx >= self.total_tuples {
            return Err(Error::Schema(format!(
                "tuple {idx} out of range ({} total)",
                self.total_tuples
            )));
        }
        if self
            .schema
            .types
            .iter()
            .any(|t| *t == AttrType::CategoricalMarkov)
        {
            return Err(Error::Schema(
                "random access is unavailable for markov columns".into(),
            ));
        }
        let (block, skip) = self.index.locate(idx as u64);
        self.reader
            .seek(self.data_pos + self.index.block_bit_offset(block));
        self.reset_block();
        self.done = 0;
        self.todo = skip + 1;
        Ok(skip as u32)
    }

    /// Random access: decode and return exactly tuple `idx`.
    pub fn read_tuple_at(&mut self, idx: u32) -> Result<Tuple> {
        let skip = self.locate_tuple(idx)?;
        let mut tuple = Tuple::new(self.schema.len());
        for _ in 0..=skip {
            self.read_next_tuple(&mut tuple)?;
        }
        Ok(tuple)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::squid::EnumInterpreter;
    use crate::AttrValue;

    /// Run the full learning protocol over `tuples` and compress them all.
    fn compress(
        tuples: &[Tuple],
        schema: &Schema,
        config: CompressionConfig,
        opts: CodingOptions,
        registry: Arc<ModelRegistry>,
    ) -> Vec<u8> {
        let mut compressor = RelationCompressor::new(
            Vec::new(),
            schema.clone(),
            config,
            opts,
            registry,
        );
        let mut seed = 1u64;
        while compressor.needs_more_learning() {
            for _ in 0..NUM_EST_SAMPLE {
                seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1);
                let pick = (seed >> 33) as usize % tuples.len();
                compressor.learn_tuple(&tuples[pick]);
            }
            for t in tuples {
                compressor.learn_tuple(t);
            }
            compressor.end_of_learning().unwrap();
        }
        for t in tuples {
            compressor.compress_tuple(t).unwrap();
        }
        compressor.finish().unwrap()
    }

    fn enum_int_tuples(n: usize) -> (Schema, Vec<Tuple>) {
        let schema = Schema::new(vec![AttrType::Categorical, AttrType::Integer]);
        let tuples = (0..n)
            .map(|i| {
                let mut t = Tuple::new(2);
                t.values[0] = AttrValue::Int((i % 5) as i32);
                t.values[1] = AttrValue::Int(((i * 31) % 1000) as i32);
                t
            })
            .collect();
        (schema, tuples)
    }

    fn registry_for(schema: &Schema) -> Arc<ModelRegistry> {
        let mut registry = ModelRegistry::new(schema.len());
        for (i, t) in schema.types.iter().enumerate() {
            if *t == AttrType::Categorical {
                registry.set_interpreter(i, Arc::new(EnumInterpreter::new(8)));
            }
        }
        Arc::new(registry)
    }

    #[test]
    fn test_sequential_roundtrip() {
        let (schema, tuples) = enum_int_tuples(4000);
        let registry = registry_for(&schema);
        let config = CompressionConfig {
            allowed_err: vec![0.0, 0.0],
            skip_model_learning: false,
        };
        let opts = CodingOptions {
            delayed_bits: 24,
            block_size: 500,
        };
        let data = compress(&tuples, &schema, config, opts, Arc::clone(&registry));

        let mut dec = RelationDecompressor::new(data, schema.clone(), opts, registry).unwrap();
        assert_eq!(dec.total_tuples(), 4000);
        let mut tuple = Tuple::new(schema.len());
        for expected in &tuples {
            assert!(dec.has_next());
            dec.read_next_tuple(&mut tuple).unwrap();
            assert_eq!(&tuple, expected);
        }
        assert!(!dec.has_next());
    }

    #[test]
    fn test_random_access_matches_scan() {
        let (schema, tuples) = enum_int_tuples(3000);
        let registry = registry_for(&schema);
        let config = CompressionConfig {
            allowed_err: vec![0.0, 0.0],
            skip_model_learning: true,
        };
        let opts = CodingOptions {
            delayed_bits: 16,
            block_size: 1,
        };
        let data = compress(&tuples, &schema, config, opts, Arc::clone(&registry));

        let mut dec = RelationDecompressor::new(data, schema, opts, registry).unwrap();
        for idx in [0u32, 1, 17, 1499, 2998, 2999] {
            let tuple = dec.read_tuple_at(idx).unwrap();
            assert_eq!(&tuple, &tuples[idx as usize], "tuple {idx}");
        }
    }

    #[test]
    fn test_bad_tuple_width_rejected() {
        let (schema, tuples) = enum_int_tuples(200);
        let registry = registry_for(&schema);
        let config = CompressionConfig {
            allowed_err: vec![0.0, 0.0],
            skip_model_learning: true,
        };
        let opts = CodingOptions::default();
        let mut compressor = RelationCompressor::new(
            Vec::new(),
            schema.clone(),
            config,
            opts,
            registry,
        );
        while compressor.needs_more_learning() {
            for t in &tuples {
                compressor.learn_tuple(t);
            }
            compressor.end_of_learning().unwrap();
        }
        let narrow = Tuple::new(1);
        assert!(matches!(
            compressor.compress_tuple(&narrow),
            Err(Error::Schema(_))
        ));
    }
}
