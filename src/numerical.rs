//! Numerical SquID and model.
//!
//! The first layer is a histogram of `KBRANCH` bins whose outermost two bins
//! are open-ended exponential tails. Interior bins spanning more than one
//! value continue through nested uniform 16-bit layers plus a final residual
//! layer; tail values are isolated by geometric bisection with a step sized
//! from the mean absolute deviation. Parameters are estimated from a sorted
//! reservoir sample and narrowed through f32 so encode and decode agree.

use std::io::Write;
use std::sync::Arc;

use crate::bitio::{BitReader, BitWriter};
use crate::coding::{CodingTable, Decoder, Pick, PROB_ONE};
use crate::error::{Error, Result};
use crate::squid::{AttrInterpreter, ModelRegistry};
use crate::util::{bits_for, narrow_f32, quantize_counts, round_places, DynamicList};
use crate::{AttrValue, Tuple, KBRANCH, NUM_EST_SAMPLE};

const HALF_BRANCH: i64 = ((KBRANCH - 2) >> 1) as i64;

/// Statistics and derived coder parameters of one cell.
#[derive(Clone, Debug)]
pub struct NumericalStats {
    // Estimation state.
    reservoir: Vec<f64>,
    v_count: u64,
    v_freq: Vec<u32>,
    sum_abs_dev: f64,
    estimated: bool,

    // Distribution parameters (all on the wire).
    bin_size: f64,
    mid: f64,
    mean_abs_dev: f64,
    branch_bins: i64,
    weights: Vec<u32>,

    // Derived.
    table: Option<CodingTable>,
    step: u64,
    num_layers: u32,
    last_layer_bits: u32,
    last_layer_weight: u32,
    minimum: i64,
    maximum: i64,
}

impl Default for NumericalStats {
    fn default() -> Self {
        NumericalStats {
            reservoir: Vec::new(),
            v_count: 0,
            // Bins start at one so any branch stays codable later.
            v_freq: vec![1; KBRANCH],
            sum_abs_dev: 0.0,
            estimated: false,
            bin_size: 0.0,
            mid: 0.0,
            mean_abs_dev: 0.0,
            branch_bins: 1,
            weights: Vec::new(),
            table: None,
            step: 0,
            num_layers: 0,
            last_layer_bits: 0,
            last_layer_weight: 0,
            minimum: 0,
            maximum: 0,
        }
    }
}

/// Scratch bounds of one encode or decode walk.
struct Bounds {
    l: i64,
    r: i64,
    l_set: bool,
    r_set: bool,
}

impl Bounds {
    fn open() -> Bounds {
        Bounds {
            l: 0,
            r: 0,
            l_set: false,
            r_set: false,
        }
    }

    fn set_left(&mut self, l: i64) {
        self.l = l;
        self.l_set = true;
    }

    fn set_right(&mut self, r: i64) {
        self.r = r;
        self.r_set = true;
    }

    fn more(&self, dev: f64) -> bool {
        if dev < 1e-8 {
            return false;
        }
        !(self.l_set && self.r_set && self.l == self.r)
    }
}

impl NumericalStats {
    pub fn set_bin_size(&mut self, bin_size: f64) {
        self.bin_size = narrow_f32(bin_size);
    }

    fn bin_index(&self, value: f64) -> i64 {
        ((value - self.mid) / self.bin_size).floor() as i64
    }

    /// Fix the histogram geometry from the sorted reservoir: 5th and 95th
    /// percentiles bound the covered range, the median area becomes the
    /// center, and interior bins widen to a power of two of base bins.
    fn init_structure(&mut self) {
        let n = self.reservoir.len();
        self.reservoir
            .sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let min_v = self.reservoir[(n as f64 * 0.05) as usize];
        let max_v = self.reservoir[(n as f64 * 0.95) as usize];

        self.mid = (min_v + max_v) / 2.0;
        if self.bin_size == 1.0 {
            self.mid = self.mid.trunc();
        }
        self.mid = narrow_f32(self.mid);

        let total_range = (max_v - min_v) * 1.5;
        let base_bins = (total_range / self.bin_size) as u64 / (KBRANCH as u64 - 2);
        self.branch_bins = if base_bins == 0 {
            1
        } else {
            1i64 << bits_for(base_bins)
        };
        self.minimum = self.branch_bins * (-HALF_BRANCH - 1);
        self.maximum = self.branch_bins * HALF_BRANCH;
        self.estimated = true;
    }

    pub fn push(&mut self, value: f64) {
        if !self.estimated {
            self.reservoir.push(value);
            self.v_count += 1;
            if self.reservoir.len() >= NUM_EST_SAMPLE {
                self.init_structure();
            }
            return;
        }
        self.v_count += 1;
        let idx = self.bin_index(value);
        let interval = if idx <= self.minimum + self.branch_bins {
            0
        } else if idx >= self.maximum {
            KBRANCH - 1
        } else {
            (idx.div_euclid(self.branch_bins) + HALF_BRANCH + 1) as usize
        };
        self.v_freq[interval] += 1;
        self.sum_abs_dev += (value - self.mid).abs();
    }

    /// Finalize: estimate the remaining parameters, quantize the histogram
    /// and build the coding table.
    pub fn end(&mut self) -> Result<()> {
        if !self.estimated {
            if self.reservoir.is_empty() {
                // Never fed; keep a flat geometry so serialization stays
                // total. The cell cannot be reached by real data.
                self.mid = 0.0;
                self.branch_bins = 1;
                self.minimum = -HALF_BRANCH - 1;
                self.maximum = HALF_BRANCH;
                self.estimated = true;
            } else {
                self.init_structure();
            }
        }

        self.mean_abs_dev = if self.sum_abs_dev < self.bin_size {
            0.0
        } else {
            self.sum_abs_dev / self.v_count as f64
        };
        self.mean_abs_dev = narrow_f32(self.mean_abs_dev);

        self.weights = quantize_counts(&self.v_freq, 16);
        self.table = Some(CodingTable::build(&self.weights)?);
        self.prepare();
        Ok(())
    }

    /// Derive the layer split and tail step from the wire parameters; called
    /// after both `end` and `read`.
    fn prepare(&mut self) {
        self.step = (self.mean_abs_dev / self.bin_size).ceil() as u64;
        self.num_layers = 0;
        let mut bins = self.branch_bins;
        while bins > 65536 {
            self.num_layers += 1;
            bins >>= 16;
        }
        self.last_layer_bits = bits_for(bins as u64);
        self.last_layer_weight = PROB_ONE >> self.last_layer_bits;
        self.minimum = self.branch_bins * (-HALF_BRANCH - 1);
        self.maximum = self.branch_bins * HALF_BRANCH;
    }

    pub fn write<W: Write>(&self, writer: &mut BitWriter<W>) -> Result<()> {
        writer.write_f32(self.mid as f32)?;
        writer.write_f32(self.mean_abs_dev as f32)?;
        writer.write_u64(self.branch_bins as u64)?;
        for &w in &self.weights {
            // Bins start at count one, so no weight can reach 65536.
            writer.write_u16(w as u16)?;
        }
        Ok(())
    }

    pub fn read(&mut self, reader: &mut BitReader) -> Result<()> {
        self.mid = reader.read_f32() as f64;
        self.mean_abs_dev = reader.read_f32() as f64;
        self.branch_bins = reader.read_u64() as i64;
        if self.branch_bins <= 0 {
            return Err(Error::Corrupt("non-positive branch bin count".into()));
        }
        self.weights = (0..KBRANCH).map(|_| reader.read_u16() as u32).collect();
        self.table = Some(CodingTable::build(&self.weights)?);
        self.estimated = true;
        self.prepare();
        Ok(())
    }

    /// Reconstruction a decoded bin index maps back to; also used by the
    /// time-series encoder to track the decoder's view.
    pub fn reconstruct(&self, idx: i64, target_int: bool) -> AttrValue {
        if target_int {
            let centered = self.mid + idx as f64 * self.bin_size + (self.bin_size - 1.0) / 2.0;
            AttrValue::Int(round_places(centered, 0) as i32)
        } else {
            AttrValue::Double(self.mid + (idx as f64 + 0.5) * self.bin_size)
        }
    }

    /// The value the decoder will reconstruct for `value`, without coding.
    pub fn quantize(&self, value: f64, target_int: bool) -> f64 {
        match self.reconstruct(self.bin_index(value), target_int) {
            AttrValue::Int(v) => v as f64,
            AttrValue::Double(v) => v,
            AttrValue::Str(_) => 0.0,
        }
    }

    pub fn get_intervals(&self, value: f64, picks: &mut Vec<Pick>) {
        let Some(table) = &self.table else { return };
        let idx = self.bin_index(value);
        if idx > self.minimum + self.branch_bins && idx < self.maximum {
            self.histogram_intervals(table, idx, picks);
        } else {
            self.tail_intervals(table, idx, picks);
        }
    }

    fn histogram_intervals(&self, table: &CodingTable, idx: i64, picks: &mut Vec<Pick>) {
        let branch = idx.div_euclid(self.branch_bins);
        let mut low = idx - branch * self.branch_bins;

        picks.push(table.pick((branch + HALF_BRANCH + 1) as u32));

        for i in (1..=self.num_layers).rev() {
            let shift = self.last_layer_bits + (i - 1) * 16;
            picks.push(Pick::Uniform {
                weight: 1,
                index: ((low >> shift) & 0xffff) as u32,
            });
        }
        low &= (1i64 << self.last_layer_bits) - 1;
        picks.push(Pick::Uniform {
            weight: self.last_layer_weight,
            index: low as u32,
        });
    }

    fn tail_intervals(&self, table: &CodingTable, idx: i64, picks: &mut Vec<Pick>) {
        let mut bounds = Bounds::open();
        if idx <= self.minimum + self.branch_bins {
            picks.push(table.pick(0));
            bounds.set_right(self.minimum + self.branch_bins);
        } else {
            picks.push(table.pick(KBRANCH as u32 - 1));
            bounds.set_left(self.maximum);
        }

        // Geometric walk with the deviation-sized step until both bounds
        // close, then plain bisection.
        while bounds.more(self.mean_abs_dev) {
            let stride = if bounds.l_set && bounds.r_set {
                (bounds.r - bounds.l + 1) / 2
            } else {
                self.step as i64
            };
            let mid = if !bounds.l_set {
                bounds.r - stride
            } else {
                bounds.l + stride - 1
            };
            let branch = (idx > mid) as u32;
            picks.push(Pick::Uniform {
                weight: 32768,
                index: branch,
            });
            if branch == 1 {
                bounds.set_left(mid + 1);
            } else {
                bounds.set_right(mid);
            }
        }
    }

    /// Decode one bin index, mirroring the interval walk.
    pub fn decode_index(&self, decoder: &mut Decoder, reader: &mut BitReader) -> Result<i64> {
        let table = self
            .table
            .as_ref()
            .ok_or_else(|| Error::Corrupt("numerical cell not finalized".into()))?;
        let word = decoder.read_word(reader);
        let d = table.decode(word);
        decoder.update(d.weight, d.numerator);

        let branch = d.branch as i64;
        if branch != 0 && branch != KBRANCH as i64 - 1 {
            let rel = branch - HALF_BRANCH - 1;
            let mut l = rel * self.branch_bins;

            if self.num_layers != 0 {
                let mut layer: i64 = 0;
                for _ in 0..self.num_layers {
                    layer = (layer << 16) | decoder.read_word(reader) as i64;
                }
                l += layer << self.last_layer_bits;
            }
            let low = decoder.read_uniform(reader, self.last_layer_weight) as i64;
            Ok(l + low)
        } else {
            let mut bounds = Bounds::open();
            if branch == 0 {
                bounds.set_right(self.minimum + self.branch_bins);
            } else {
                bounds.set_left(self.maximum);
            }
            while bounds.more(self.mean_abs_dev) {
                let stride = if bounds.l_set && bounds.r_set {
                    (bounds.r - bounds.l + 1) / 2
                } else {
                    self.step as i64
                };
                let mid = if !bounds.l_set {
                    bounds.r - stride
                } else {
                    bounds.l + stride - 1
                };
                let side = decoder.read_uniform(reader, 32768);
                if side == 1 {
                    bounds.set_left(mid + 1);
                } else {
                    bounds.set_right(mid);
                }
            }
            Ok(if bounds.l_set { bounds.l } else { bounds.r })
        }
    }

    pub(crate) fn dev(&self) -> f64 {
        self.mean_abs_dev
    }

    pub(crate) fn count(&self) -> u64 {
        self.v_count
    }
}

/// Numerical model, optionally conditioned through a dense cell table.
#[derive(Clone)]
pub struct NumericalModel {
    predictors: Vec<usize>,
    caps: Vec<usize>,
    interpreters: Vec<Arc<dyn AttrInterpreter>>,
    target: usize,
    target_int: bool,
    bin_size: f64,
    cells: DynamicList<NumericalStats>,
    cost: f64,
}

impl NumericalModel {
    pub fn simple(bin_size: f64, target_int: bool) -> Self {
        NumericalModel::unconditioned(0, bin_size, target_int)
    }

    /// Unconditioned model for a specific target attribute; never fails
    /// because the empty predictor set has no capacity to exceed.
    pub fn unconditioned(target: usize, bin_size: f64, target_int: bool) -> Self {
        let bin_size = narrow_f32(bin_size);
        let mut cells: DynamicList<NumericalStats> = DynamicList::new(Vec::new());
        cells.get_mut(0).set_bin_size(bin_size);
        NumericalModel {
            predictors: Vec::new(),
            caps: Vec::new(),
            interpreters: Vec::new(),
            target,
            target_int,
            bin_size,
            cells,
            cost: 0.0,
        }
    }

    pub fn conditioned(
        registry: &ModelRegistry,
        predictors: Vec<usize>,
        target: usize,
        bin_size: f64,
        target_int: bool,
    ) -> Option<Self> {
        let caps = registry.predictor_caps(&predictors)?;
        let interpreters = predictors.iter().map(|&p| registry.interpreter(p)).collect();
        let bin_size = narrow_f32(bin_size);
        let mut cells: DynamicList<NumericalStats> = DynamicList::new(caps.clone());
        for cell in cells.iter_mut() {
            cell.set_bin_size(bin_size);
        }
        Some(NumericalModel {
            predictors,
            caps,
            interpreters,
            target,
            target_int,
            bin_size,
            cells,
            cost: 0.0,
        })
    }

    pub fn target(&self) -> usize {
        self.target
    }

    pub fn target_int(&self) -> bool {
        self.target_int
    }

    pub fn predictors(&self) -> &[usize] {
        &self.predictors
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

    fn target_value(&self, tuple: &Tuple) -> f64 {
        if self.target_int {
            tuple.values[self.target].int() as f64
        } else {
            tuple.values[self.target].double()
        }
    }

    pub fn feed_tuple(&mut self, tuple: &Tuple, count: u32) {
        let value = self.target_value(tuple);
        let pos = self.cell_position(tuple);
        for _ in 0..count {
            self.cells.get_mut(pos).push(value);
        }
    }

    /// Feed a bare value into the unconditioned cell.
    pub fn feed_value(&mut self, value: f64, count: u32) {
        for _ in 0..count {
            self.cells.get_mut(0).push(value);
        }
    }

    pub fn end_of_data(&mut self) -> Result<()> {
        let mut cost = 0.0;
        for cell in self.cells.iter_mut() {
            cell.end()?;
            if cell.dev() != 0.0 {
                cost += cell.count() as f64
                    * (cell.dev().log2() + 1.0 + std::f64::consts::E.log2()
                        - self.bin_size.log2());
            }
        }
        self.cost = cost + self.description_bits();
        Ok(())
    }

    fn description_bits(&self) -> f64 {
        self.cells.len() as f64 * (32.0 + 32.0 + 64.0 + KBRANCH as f64 * 16.0)
            + self.predictors.len() as f64 * 16.0
            + 40.0
    }

    pub fn encode(&self, tuple: &Tuple, picks: &mut Vec<Pick>) {
        let value = self.target_value(tuple);
        let pos = self.cell_position(tuple);
        self.cells.get(pos).get_intervals(value, picks);
    }

    pub fn decode(
        &self,
        decoder: &mut Decoder,
        reader: &mut BitReader,
        tuple: &Tuple,
    ) -> Result<AttrValue> {
        let pos = self.cell_position(tuple);
        let cell = self.cells.get(pos);
        let idx = cell.decode_index(decoder, reader)?;
        Ok(cell.reconstruct(idx, self.target_int))
    }

    /// Simple-path hooks used by the string and time-series models.
    pub fn encode_value(&self, value: f64, picks: &mut Vec<Pick>) {
        self.cells.get(0).get_intervals(value, picks);
    }

    pub fn decode_value(&self, decoder: &mut Decoder, reader: &mut BitReader) -> Result<AttrValue> {
        let cell = self.cells.get(0);
        let idx = cell.decode_index(decoder, reader)?;
        Ok(cell.reconstruct(idx, self.target_int))
    }

    /// Decoder-side reconstruction of `value`, without coding anything.
    pub fn quantize_value(&self, value: f64) -> f64 {
        self.cells.get(0).quantize(value, self.target_int)
    }

    pub fn write<W: Write>(&self, writer: &mut BitWriter<W>) -> Result<()> {
        writer.write_byte(self.predictors.len() as u8)?;
        for &p in &self.predictors {
            writer.write_u16(p as u16)?;
        }
        writer.write_f32(self.bin_size as f32)?;
        for cell in self.cells.iter() {
            cell.write(writer)?;
        }
        Ok(())
    }

    pub fn read(
        reader: &mut BitReader,
        registry: &ModelRegistry,
        target: usize,
        target_int: bool,
    ) -> Result<NumericalModel> {
        let predictor_count = reader.read_byte() as usize;
        let predictors: Vec<usize> = (0..predictor_count)
            .map(|_| reader.read_u16() as usize)
            .collect();
        let bin_size = reader.read_f32() as f64;
        if bin_size <= 0.0 {
            return Err(Error::Corrupt("non-positive bin size".into()));
        }
        let mut model =
            NumericalModel::conditioned(registry, predictors, target, bin_size, target_int)
                .ok_or_else(|| Error::Corrupt("serialized predictors exceed capacity".into()))?;
        for pos in 0..model.cells.len() {
            model.cells.get_mut(pos).read(reader)?;
        }
        Ok(model)
    }
}
