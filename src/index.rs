//! Block index for random access.
//!
//! Every flushed block contributes one `(words, tuples)` pair: how many
//! 16-bit coded words the block emitted and how many tuples it holds. The
//! table plus a 32-bit entry count sit at the very end of the file, so the
//! reader parses it backwards from the tail and keeps prefix sums; locating
//! a tuple is a binary search plus at most one block of decoding.

use std::io::Write;

use crate::bitio::{BitReader, BitWriter};
use crate::error::{Error, Result};

/// Accumulates per-block entries during compression; appended on finalize.
#[derive(Debug, Default)]
pub struct IndexWriter {
    entries: Vec<(u16, u16)>,
    last_total: u32,
}

impl IndexWriter {
    pub fn new() -> Self {
        IndexWriter::default()
    }

    /// Record one flushed block given its emitted word count and the running
    /// tuple total. Both per-block quantities must fit 16 bits; a larger
    /// block means the caller's block size policy is too coarse.
    pub fn record_block(&mut self, words: u32, total_tuples: u32) -> Result<()> {
        let tuples = total_tuples - self.last_total;
        if words > u16::MAX as u32 {
            return Err(Error::BufferOverflow {
                observed: words as usize,
                allowed: u16::MAX as usize,
            });
        }
        if tuples > u16::MAX as u32 {
            return Err(Error::BufferOverflow {
                observed: tuples as usize,
                allowed: u16::MAX as usize,
            });
        }
        self.entries.push((words as u16, tuples as u16));
        self.last_total = total_tuples;
        Ok(())
    }

    pub fn block_count(&self) -> usize {
        self.entries.len()
    }

    /// Append the table and trailing count. The writer is byte-aligned
    /// first so the trailer stays addressable from the file tail.
    pub fn finish<W: Write>(&self, writer: &mut BitWriter<W>) -> Result<()> {
        writer.align_byte()?;
        for &(words, tuples) in &self.entries {
            writer.write_u16(words)?;
            writer.write_u16(tuples)?;
        }
        writer.write_u32(self.entries.len() as u32)?;
        Ok(())
    }
}

/// Prefix-summed index parsed from the tail of a compressed file.
#[derive(Debug)]
pub struct IndexReader {
    words_prefix: Vec<u64>,
    tuples_prefix: Vec<u64>,
}

impl IndexReader {
    /// Parse the trailer: the last 4 bytes hold the entry count N, the 4N
    /// bytes before it the entries.
    pub fn parse(reader: &mut BitReader) -> Result<IndexReader> {
        let len_bits = reader.len_bits();
        if len_bits < 32 {
            return Err(Error::Corrupt("file shorter than the index trailer".into()));
        }
        reader.seek(len_bits - 32);
        let count = reader.read_u32() as u64;
        if len_bits < 32 + count * 32 {
            return Err(Error::Corrupt("index table extends past file start".into()));
        }

        reader.seek(len_bits - 32 - count * 32);
        let mut words_prefix = Vec::with_capacity(count as usize + 1);
        let mut tuples_prefix = Vec::with_capacity(count as usize + 1);
        words_prefix.push(0);
        tuples_prefix.push(0);
        for i in 0..count as usize {
            let words = reader.read_u16_aligned() as u64;
            let tuples = reader.read_u16_aligned() as u64;
            words_prefix.push(words_prefix[i] + words);
            tuples_prefix.push(tuples_prefix[i] + tuples);
        }
        Ok(IndexReader {
            words_prefix,
            tuples_prefix,
        })
    }

    pub fn block_count(&self) -> usize {
        self.words_prefix.len() - 1
    }

    pub fn total_tuples(&self) -> u64 {
        *self.tuples_prefix.last().unwrap_or(&0)
    }

    /// Block holding the logical tuple plus how many tuples of that block
    /// precede it.
    pub fn locate(&self, tuple_idx: u64) -> (usize, u64) {
        // First block whose prefix exceeds the target, minus one.
        let block = self
            .tuples_prefix
            .partition_point(|&prefix| prefix <= tuple_idx)
            .saturating_sub(1)
            .min(self.block_count().saturating_sub(1));
        (block, tuple_idx - self.tuples_prefix[block])
    }

    /// Bit offset of a block relative to the data-region start.
    pub fn block_bit_offset(&self, block: usize) -> u64 {
        self.words_prefix[block] * 16
    }
}
