//! JSON mirror-tree model and drivers.
//!
//! The schema enumerates leaf paths; a mirror tree of the schema carries,
//! per node, categorical sub-models for existence, type and array size, and
//! per leaf one of the value models. Learning, encoding and decoding all
//! traverse the tree with an explicit worklist so document depth never
//! touches the call stack; decoding additionally replays the traversal from
//! a flat event list to assemble the output document iteratively.
//!
//! Array elements share a single child node ("" path segment); an array
//! whose elements are all doubles is handled as a time series: the length
//! goes through the array-size distribution, the values through the
//! auto-regressive model of the array child.

use std::collections::BTreeMap;
use std::io::{BufRead, Write};
use std::path::Path;
use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::bitio::{BitReader, BitWriter};
use crate::categorical::CategoricalModel;
use crate::coding::{BlockEncoder, Decoder, Pick};
use crate::error::{Error, Result};
use crate::index::{IndexReader, IndexWriter};
use crate::json_learner::JsonLearner;
use crate::numerical::NumericalModel;
use crate::squid::ModelRegistry;
use crate::strings::StringModel;
use crate::timeseries::TimeSeriesModel;
use crate::{CodingOptions, CompressionConfig, Tuple, TIME_SERIES_PRECISION};

/// Sentinel leaf id of non-leaf nodes.
pub const NON_LEAF: u16 = u16::MAX;

/// Bin size of double-typed JSON leaves.
const JSON_DOUBLE_BIN: f64 = 0.0025;

/// Node types as they appear in the type distribution and the schema
/// config; the numbering is part of the wire format.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum NodeType {
    Null = 0,
    False = 1,
    True = 2,
    Object = 3,
    Array = 4,
    Str = 5,
    Number = 6,
    Double = 7,
    TimeSeries = 8,
}

impl NodeType {
    pub fn from_code(code: usize) -> Result<NodeType> {
        Ok(match code {
            0 => NodeType::Null,
            1 => NodeType::False,
            2 => NodeType::True,
            3 => NodeType::Object,
            4 => NodeType::Array,
            5 => NodeType::Str,
            6 => NodeType::Number,
            7 => NodeType::Double,
            8 => NodeType::TimeSeries,
            other => return Err(Error::Corrupt(format!("unknown node type {other}"))),
        })
    }
}

/// Runtime type of a DOM node. An all-double non-empty array is a time
/// series regardless of what the schema says about its elements.
pub fn value_node_type(value: &Value) -> NodeType {
    match value {
        Value::Null => NodeType::Null,
        Value::Bool(false) => NodeType::False,
        Value::Bool(true) => NodeType::True,
        Value::Object(_) => NodeType::Object,
        Value::String(_) => NodeType::Str,
        Value::Number(n) => {
            if n.is_i64() || n.is_u64() {
                NodeType::Number
            } else {
                NodeType::Double
            }
        }
        Value::Array(items) => {
            if !items.is_empty() && items.iter().all(|v| v.as_f64().is_some() && !v.is_i64() && !v.is_u64()) {
                NodeType::TimeSeries
            } else {
                NodeType::Array
            }
        }
    }
}

/// Leaf paths and their types. Array levels contribute an empty path
/// segment; ids are dense and at most 16 bits wide.
#[derive(Clone, Debug, Default)]
pub struct JsonSchema {
    /// Path -> leaf id, iterated in sorted path order everywhere.
    pub order: BTreeMap<Vec<String>, usize>,
    /// Leaf id -> type code.
    pub types: Vec<NodeType>,
}

impl JsonSchema {
    pub fn leaf_count(&self) -> usize {
        self.types.len()
    }

    /// Infer a schema from sample documents: objects contribute their member
    /// names (sorted), arrays one "" segment, leaves their first-seen type.
    /// Ids are assigned in concatenated-path order.
    pub fn generate(samples: &[Value]) -> Result<JsonSchema> {
        let mut paths: BTreeMap<Vec<String>, NodeType> = BTreeMap::new();
        let mut stack: Vec<(Vec<String>, &Value)> = Vec::new();
        for sample in samples {
            stack.push((Vec::new(), sample));
            while let Some((path, value)) = stack.pop() {
                match value {
                    Value::Object(members) => {
                        for (name, child) in members {
                            let mut next = path.clone();
                            next.push(name.clone());
                            stack.push((next, child));
                        }
                    }
                    Value::Array(items) => {
                        let mut next = path.clone();
                        next.push(String::new());
                        for item in items {
                            stack.push((next.clone(), item));
                        }
                    }
                    other => {
                        let ty = match value_node_type(other) {
                            NodeType::Double | NodeType::TimeSeries => NodeType::Double,
                            t => t,
                        };
                        paths.entry(path).or_insert(ty);
                    }
                }
            }
        }

        let mut schema = JsonSchema::default();
        for (path, ty) in paths {
            if schema.types.len() >= NON_LEAF as usize {
                return Err(Error::Schema(
                    "more than 65535 leaf paths in the schema".into(),
                ));
            }
            schema.order.insert(path, schema.types.len());
            schema.types.push(ty);
        }
        Ok(schema)
    }

    /// Write the two-section text config: paths, a blank line, type codes.
    pub fn write_config<W: Write>(&self, mut out: W) -> Result<()> {
        let mut sorted: Vec<&Vec<String>> = vec![&EMPTY_PATH; self.order.len()];
        for (path, &id) in &self.order {
            sorted[id] = path;
        }
        out.write_all(b"Attribute path: \n")?;
        for path in sorted {
            out.write_all(path.join(", ").as_bytes())?;
            out.write_all(b"\n")?;
        }
        out.write_all(b"\nAttribute Type: \n")?;
        let codes: Vec<String> = self.types.iter().map(|t| (*t as u8).to_string()).collect();
        out.write_all(codes.join(", ").as_bytes())?;
        out.write_all(b"\n")?;
        Ok(())
    }

    pub fn read_config<R: BufRead>(reader: R) -> Result<JsonSchema> {
        let mut lines = reader.lines();
        let mut schema = JsonSchema::default();
        lines.next().transpose()?; // "Attribute path:" header

        let mut count = 0usize;
        for line in lines.by_ref() {
            let line = line?;
            let line = line.strip_suffix('\r').unwrap_or(&line);
            if line.is_empty() {
                break;
            }
            let path: Vec<String> = line.split(", ").map(|s| s.to_string()).collect();
            schema.order.insert(path, count);
            count += 1;
        }

        lines.next().transpose()?; // "Attribute Type:" header
        let type_line = lines
            .next()
            .transpose()?
            .ok_or_else(|| Error::Schema("schema config misses the type section".into()))?;
        let type_line = type_line.strip_suffix('\r').unwrap_or(&type_line);
        for code in type_line.split(", ") {
            let code: usize = code
                .trim()
                .parse()
                .map_err(|_| Error::Schema(format!("bad type code '{code}'")))?;
            schema.types.push(NodeType::from_code(code)?);
        }
        if schema.types.len() != schema.order.len() {
            return Err(Error::Schema(
                "path and type sections disagree on the leaf count".into(),
            ));
        }
        Ok(schema)
    }

    pub fn load_config<P: AsRef<Path>>(path: P) -> Result<JsonSchema> {
        let file = std::fs::File::open(path)?;
        JsonSchema::read_config(std::io::BufReader::new(file))
    }
}

static EMPTY_PATH: Vec<String> = Vec::new();

/// One node of the mirror tree; children are arena indices.
#[derive(Clone)]
pub struct JsonNode {
    pub name: String,
    pub leaf_id: u16,
    pub types: std::collections::BTreeSet<NodeType>,
    pub predictors: Vec<usize>,
    pub members: Vec<usize>,
    pub member_order: Vec<usize>,
    pub array_child: Option<usize>,
    pub exist: CategoricalModel,
    pub type_model: CategoricalModel,
    pub array_size: Option<CategoricalModel>,
    pub string_model: Option<StringModel>,
    pub number_model: Option<NumericalModel>,
    pub ts_model: Option<TimeSeriesModel>,
}

impl JsonNode {
    fn new(name: String) -> Self {
        JsonNode {
            name,
            leaf_id: NON_LEAF,
            types: Default::default(),
            predictors: Vec::new(),
            members: Vec::new(),
            member_order: Vec::new(),
            array_child: None,
            exist: CategoricalModel::simple(),
            type_model: CategoricalModel::simple(),
            array_size: None,
            string_model: None,
            number_model: None,
            ts_model: None,
        }
    }

    pub fn is_value_leaf(&self) -> bool {
        self.types.contains(&NodeType::Str)
            || self.types.contains(&NodeType::Number)
            || self.types.contains(&NodeType::Double)
    }
}

/// Mirror tree arena.
#[derive(Clone)]
pub struct JsonTree {
    pub nodes: Vec<JsonNode>,
    pub root: usize,
}

impl JsonTree {
    /// Build the mirror of a schema, creating the per-leaf value models.
    /// Conditioned replacements are installed later by the learner.
    pub fn build(schema: &JsonSchema) -> Result<JsonTree> {
        if schema.leaf_count() > NON_LEAF as usize {
            return Err(Error::Schema(
                "leaf id space overflows 16 bits".into(),
            ));
        }
        let mut tree = JsonTree {
            nodes: vec![JsonNode::new(String::new())],
            root: 0,
        };
        for (path, &id) in &schema.order {
            let mut node = tree.root;
            for (depth, name) in path.iter().enumerate() {
                node = if name.is_empty() {
                    match tree.nodes[node].array_child {
                        Some(child) => child,
                        None => {
                            let child = tree.push_node(JsonNode::new(String::new()));
                            tree.nodes[node].array_child = Some(child);
                            tree.nodes[node].array_size = Some(CategoricalModel::simple());
                            tree.nodes[node].types.insert(NodeType::Array);
                            child
                        }
                    }
                } else {
                    match tree.member_index(node, name) {
                        Some(child) => child,
                        None => {
                            let child = tree.push_node(JsonNode::new(name.clone()));
                            let order = tree.nodes[node].members.len();
                            tree.nodes[node].members.push(child);
                            tree.nodes[node].member_order.push(order);
                            tree.nodes[node].types.insert(NodeType::Object);
                            child
                        }
                    }
                };

                if depth == path.len() - 1 {
                    let leaf = &mut tree.nodes[node];
                    leaf.leaf_id = id as u16;
                    let ty = schema.types[id];
                    leaf.types.insert(ty);
                    match ty {
                        NodeType::Number => {
                            leaf.number_model =
                                Some(NumericalModel::unconditioned(id, 1.0, true));
                        }
                        NodeType::Double => {
                            if name.is_empty() {
                                leaf.ts_model = Some(TimeSeriesModel::unconditioned(
                                    id,
                                    TIME_SERIES_PRECISION,
                                ));
                            }
                            leaf.number_model = Some(NumericalModel::unconditioned(
                                id,
                                JSON_DOUBLE_BIN,
                                false,
                            ));
                        }
                        NodeType::Str => {
                            leaf.string_model = Some(StringModel::new(id));
                        }
                        _ => {}
                    }
                }
            }
        }
        Ok(tree)
    }

    fn push_node(&mut self, node: JsonNode) -> usize {
        self.nodes.push(node);
        self.nodes.len() - 1
    }

    fn member_index(&self, node: usize, name: &str) -> Option<usize> {
        self.nodes[node]
            .members
            .iter()
            .copied()
            .find(|&m| self.nodes[m].name == name)
    }

    /// Member slot (position in `members`) holding the given leaf id.
    pub fn member_slot_of_leaf(&self, node: usize, leaf_id: usize) -> Option<usize> {
        self.nodes[node]
            .members
            .iter()
            .position(|&m| self.nodes[m].leaf_id as usize == leaf_id)
    }

    /// Any leaf conditioned on another makes random access impossible.
    pub fn has_predictors(&self) -> bool {
        self.nodes.iter().any(|n| !n.predictors.is_empty())
    }

    pub fn reset_block_state(&mut self) {
        for node in self.nodes.iter_mut() {
            if let Some(model) = node.string_model.as_mut() {
                model.reset_local_dict();
            }
        }
    }

    /// Replace a leaf's value models with predictor-conditioned ones; fails
    /// when the capacity policy rejects the predictor set.
    pub fn set_predictors(
        &mut self,
        node: usize,
        predictors: Vec<usize>,
        registry: &ModelRegistry,
    ) -> bool {
        let leaf = &self.nodes[node];
        let id = leaf.leaf_id as usize;
        let mut number = None;
        let mut ts = None;
        if let Some(model) = &leaf.number_model {
            number = match NumericalModel::conditioned(
                registry,
                predictors.clone(),
                id,
                if model.target_int() { 1.0 } else { JSON_DOUBLE_BIN },
                model.target_int(),
            ) {
                Some(m) => Some(m),
                None => return false,
            };
        }
        if leaf.string_model.is_some() && !predictors.is_empty() {
            return false;
        }
        if leaf.ts_model.is_some() {
            ts = match TimeSeriesModel::conditioned(
                registry,
                predictors.clone(),
                id,
                TIME_SERIES_PRECISION,
            ) {
                Some(m) => Some(m),
                None => return false,
            };
        }

        let leaf = &mut self.nodes[node];
        if let Some(m) = number {
            leaf.number_model = Some(m);
        }
        if let Some(m) = ts {
            leaf.ts_model = Some(m);
        }
        leaf.predictors = predictors;
        true
    }

    /// Install a learned member ordering: the given leaf order first, then
    /// the remaining value leaves, then containers, then whatever is left
    /// (null/bool-only members still need their existence coded).
    pub fn set_member_order(&mut self, node: usize, ordered: Vec<usize>) {
        let member_count = self.nodes[node].members.len();
        if ordered.iter().any(|&m| m >= member_count) {
            return;
        }
        let mut order = ordered;
        for m in 0..member_count {
            let child = self.nodes[node].members[m];
            if self.nodes[child].is_value_leaf() && !order.contains(&m) {
                order.push(m);
            }
        }
        for m in 0..member_count {
            let child = self.nodes[node].members[m];
            let container = self.nodes[child].types.contains(&NodeType::Object)
                || self.nodes[child].types.contains(&NodeType::Array);
            if container && !order.contains(&m) {
                order.push(m);
            }
        }
        for m in 0..member_count {
            if !order.contains(&m) {
                order.push(m);
            }
        }
        self.nodes[node].member_order = order;
    }

    /// Feed one document into the tree's distributions.
    pub fn learn_node(&mut self, doc: &Value, attrs: &mut Tuple) {
        let mut work: Vec<(usize, &Value)> = vec![(self.root, doc)];
        while let Some((idx, value)) = work.pop() {
            let node_type = value_node_type(value);
            self.nodes[idx].type_model.feed_value(node_type as usize, 1);

            match node_type {
                NodeType::Null | NodeType::False | NodeType::True => {}
                NodeType::Object => {
                    let order = self.nodes[idx].member_order.clone();
                    let obj = value.as_object();
                    for slot in order {
                        let child = self.nodes[idx].members[slot];
                        let found =
                            obj.and_then(|o| o.get(self.nodes[child].name.as_str()));
                        self.nodes[child]
                            .exist
                            .feed_value(found.is_some() as usize, 1);
                        if let Some(v) = found {
                            work.push((child, v));
                        }
                    }
                }
                NodeType::Array => {
                    let items = value.as_array().map(|a| a.as_slice()).unwrap_or(&[]);
                    if let Some(size_model) = self.nodes[idx].array_size.as_mut() {
                        size_model.feed_value(items.len(), 1);
                    }
                    if let Some(child) = self.nodes[idx].array_child {
                        for item in items {
                            work.push((child, item));
                        }
                    }
                }
                NodeType::Str => {
                    let id = self.nodes[idx].leaf_id as usize;
                    attrs.values[id] = crate::AttrValue::Str(value.as_str().unwrap_or("").into());
                    if let Some(model) = self.nodes[idx].string_model.as_mut() {
                        model.feed_tuple(attrs, 1);
                    }
                }
                NodeType::Number => {
                    let id = self.nodes[idx].leaf_id as usize;
                    attrs.values[id] =
                        crate::AttrValue::Int(value.as_i64().unwrap_or(0) as i32);
                    if let Some(model) = self.nodes[idx].number_model.as_mut() {
                        model.feed_tuple(attrs, 1);
                    }
                }
                NodeType::Double => {
                    let id = self.nodes[idx].leaf_id as usize;
                    attrs.values[id] =
                        crate::AttrValue::Double(value.as_f64().unwrap_or(0.0));
                    if let Some(model) = self.nodes[idx].number_model.as_mut() {
                        model.feed_tuple(attrs, 1);
                    }
                }
                NodeType::TimeSeries => {
                    let items = value.as_array().map(|a| a.as_slice()).unwrap_or(&[]);
                    if let Some(size_model) = self.nodes[idx].array_size.as_mut() {
                        size_model.feed_value(items.len(), 1);
                    }
                    if let Some(child) = self.nodes[idx].array_child {
                        let len = items.len();
                        if let Some(ts) = self.nodes[child].ts_model.as_mut() {
                            ts.buffer.clear();
                            ts.buffer
                                .extend(items.iter().map(|v| v.as_f64().unwrap_or(0.0)));
                            ts.feed_series(attrs, len);
                        }
                    }
                }
            }
        }
    }

    /// Finalize every distribution in the tree.
    pub fn end_of_data(&mut self) -> Result<()> {
        for node in self.nodes.iter_mut() {
            node.exist.end_of_data()?;
            node.type_model.end_of_data()?;
            if let Some(m) = node.array_size.as_mut() {
                m.end_of_data()?;
            }
            if let Some(m) = node.string_model.as_mut() {
                m.end_of_data()?;
            }
            if let Some(m) = node.number_model.as_mut() {
                m.end_of_data()?;
            }
            if let Some(m) = node.ts_model.as_mut() {
                m.end_of_data()?;
            }
        }
        Ok(())
    }

    pub fn cost(&self) -> f64 {
        self.nodes
            .iter()
            .map(|n| {
                n.exist.cost()
                    + n.type_model.cost()
                    + n.array_size.as_ref().map_or(0.0, |m| m.cost())
                    + n.string_model.as_ref().map_or(0.0, |m| m.cost())
                    + n.number_model.as_ref().map_or(0.0, |m| m.cost())
                    + n.ts_model.as_ref().map_or(0.0, |m| m.cost())
            })
            .sum()
    }

    pub fn leaf_cost(&self, node: usize) -> f64 {
        let n = &self.nodes[node];
        n.string_model.as_ref().map_or(0.0, |m| m.cost())
            + n.number_model.as_ref().map_or(0.0, |m| m.cost())
            + n.ts_model.as_ref().map_or(0.0, |m| m.cost())
    }

    /// Emit the picks encoding one document.
    pub fn encode_node(
        &mut self,
        doc: &Value,
        attrs: &mut Tuple,
        picks: &mut Vec<Pick>,
    ) -> Result<()> {
        let mut work: Vec<(usize, &Value)> = vec![(self.root, doc)];
        while let Some((idx, value)) = work.pop() {
            let node_type = value_node_type(value);
            self.nodes[idx]
                .type_model
                .encode_value(node_type as usize, picks);

            match node_type {
                NodeType::Null | NodeType::False | NodeType::True => {}
                NodeType::Object => {
                    let order = self.nodes[idx].member_order.clone();
                    let obj = value.as_object();
                    for slot in order {
                        let child = self.nodes[idx].members[slot];
                        let found = obj.and_then(|o| o.get(self.nodes[child].name.as_str()));
                        self.nodes[child]
                            .exist
                            .encode_value(found.is_some() as usize, picks);
                        if let Some(v) = found {
                            work.push((child, v));
                        }
                    }
                }
                NodeType::Array => {
                    let items = value.as_array().map(|a| a.as_slice()).unwrap_or(&[]);
                    if let Some(size_model) = self.nodes[idx].array_size.as_ref() {
                        size_model.encode_value(items.len(), picks);
                    }
                    if let Some(child) = self.nodes[idx].array_child {
                        for item in items {
                            work.push((child, item));
                        }
                    }
                }
                NodeType::Str => {
                    let id = self.nodes[idx].leaf_id as usize;
                    attrs.values[id] = crate::AttrValue::Str(value.as_str().unwrap_or("").into());
                    let text = value.as_str().unwrap_or("").to_string();
                    if let Some(model) = self.nodes[idx].string_model.as_mut() {
                        model.encode(&text, picks)?;
                    }
                }
                NodeType::Number | NodeType::Double => {
                    let id = self.nodes[idx].leaf_id as usize;
                    attrs.values[id] = if node_type == NodeType::Number {
                        crate::AttrValue::Int(value.as_i64().unwrap_or(0) as i32)
                    } else {
                        crate::AttrValue::Double(value.as_f64().unwrap_or(0.0))
                    };
                    if let Some(model) = self.nodes[idx].number_model.as_ref() {
                        model.encode(attrs, picks);
                    }
                }
                NodeType::TimeSeries => {
                    let items = value.as_array().map(|a| a.as_slice()).unwrap_or(&[]);
                    if let Some(size_model) = self.nodes[idx].array_size.as_ref() {
                        size_model.encode_value(items.len(), picks);
                    }
                    if let Some(child) = self.nodes[idx].array_child {
                        let len = items.len();
                        if let Some(ts) = self.nodes[child].ts_model.as_mut() {
                            ts.buffer.clear();
                            ts.buffer
                                .extend(items.iter().map(|v| v.as_f64().unwrap_or(0.0)));
                            ts.encode_series(attrs, len, picks);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Decode one document: first replay the traversal into a flat event
    /// list, then assemble the `Value` from the reversed list (reversing a
    /// pre-order with reversed children yields a post-order).
    pub fn decode_node(
        &mut self,
        decoder: &mut Decoder,
        reader: &mut BitReader,
        attrs: &mut Tuple,
    ) -> Result<Value> {
        let mut events: Vec<DecodeEvent> = Vec::new();
        let mut work: Vec<usize> = vec![self.root];

        while let Some(idx) = work.pop() {
            let code = self.nodes[idx].type_model.decode_value(decoder, reader)? as usize;
            match NodeType::from_code(code)? {
                NodeType::Null => events.push(DecodeEvent::Null),
                NodeType::False => events.push(DecodeEvent::Bool(false)),
                NodeType::True => events.push(DecodeEvent::Bool(true)),
                NodeType::Object => {
                    let order = self.nodes[idx].member_order.clone();
                    let mut names = Vec::new();
                    for slot in order {
                        let child = self.nodes[idx].members[slot];
                        let present =
                            self.nodes[child].exist.decode_value(decoder, reader)? != 0;
                        if present {
                            names.push(self.nodes[child].name.clone());
                            work.push(child);
                        }
                    }
                    events.push(DecodeEvent::Object(names));
                }
                NodeType::Array => {
                    let len = match self.nodes[idx].array_size.as_ref() {
                        Some(model) => model.decode_value(decoder, reader)? as usize,
                        None => 0,
                    };
                    if let Some(child) = self.nodes[idx].array_child {
                        for _ in 0..len {
                            work.push(child);
                        }
                    }
                    events.push(DecodeEvent::Array(len));
                }
                NodeType::Str => {
                    let id = self.nodes[idx].leaf_id as usize;
                    let text = match self.nodes[idx].string_model.as_mut() {
                        Some(model) => model.decode(decoder, reader)?,
                        None => String::new(),
                    };
                    attrs.values[id] = crate::AttrValue::Str(text.clone());
                    events.push(DecodeEvent::Str(text));
                }
                NodeType::Number | NodeType::Double => {
                    let id = self.nodes[idx].leaf_id as usize;
                    let value = match self.nodes[idx].number_model.as_ref() {
                        Some(model) => model.decode(decoder, reader, attrs)?,
                        None => crate::AttrValue::Int(0),
                    };
                    attrs.values[id] = value.clone();
                    events.push(match value {
                        crate::AttrValue::Int(v) => DecodeEvent::Int(v),
                        crate::AttrValue::Double(v) => DecodeEvent::Double(v),
                        crate::AttrValue::Str(_) => DecodeEvent::Null,
                    });
                }
                NodeType::TimeSeries => {
                    let len = match self.nodes[idx].array_size.as_ref() {
                        Some(model) => model.decode_value(decoder, reader)? as usize,
                        None => 0,
                    };
                    let mut series = Vec::new();
                    if let Some(child) = self.nodes[idx].array_child {
                        if let Some(ts) = self.nodes[child].ts_model.as_mut() {
                            ts.decode_series(decoder, reader, attrs, len, &mut series)?;
                        }
                    }
                    events.push(DecodeEvent::Series(series));
                }
            }
        }

        assemble(events)
    }

    pub fn write<W: Write>(&self, writer: &mut BitWriter<W>) -> Result<()> {
        self.write_node(self.root, writer)
    }

    fn write_node<W: Write>(&self, idx: usize, writer: &mut BitWriter<W>) -> Result<()> {
        let node = &self.nodes[idx];
        writer.write_u16(node.leaf_id)?;
        writer.write_u16(node.member_order.len() as u16)?;
        for &slot in &node.member_order {
            writer.write_u16(slot as u16)?;
        }
        node.exist.write(writer)?;
        node.type_model.write(writer)?;

        match &node.array_size {
            Some(model) => {
                writer.write_bits(1, 1)?;
                model.write(writer)?;
            }
            None => writer.write_bits(0, 1)?,
        }
        match &node.string_model {
            Some(model) => {
                writer.write_bits(1, 1)?;
                model.write(writer)?;
            }
            None => writer.write_bits(0, 1)?,
        }
        match &node.number_model {
            Some(model) => {
                writer.write_bits(1, 1)?;
                writer.write_bits(model.target_int() as u16, 1)?;
                model.write(writer)?;
            }
            None => writer.write_bits(0, 1)?,
        }
        match &node.ts_model {
            Some(model) => {
                writer.write_bits(1, 1)?;
                model.write(writer)?;
            }
            None => writer.write_bits(0, 1)?,
        }

        if let Some(child) = node.array_child {
            self.write_node(child, writer)?;
        }
        for &member in &node.members {
            self.write_node(member, writer)?;
        }
        Ok(())
    }

    /// Read the tree back, walking the schema paths to restore names and
    /// shape in the same order the writer linearized them.
    pub fn read(
        reader: &mut BitReader,
        schema: &JsonSchema,
        registry: &ModelRegistry,
    ) -> Result<JsonTree> {
        let root = read_json_node(reader, registry)?;
        let mut tree = JsonTree {
            nodes: vec![root],
            root: 0,
        };
        for path in schema.order.keys() {
            let mut node = tree.root;
            for name in path {
                node = if name.is_empty() {
                    match tree.nodes[node].array_child {
                        Some(child) => child,
                        None => {
                            let fresh = read_json_node(reader, registry)?;
                            let child = tree.push_node(fresh);
                            tree.nodes[node].array_child = Some(child);
                            tree.nodes[node].types.insert(NodeType::Array);
                            child
                        }
                    }
                } else {
                    match tree.member_index(node, name) {
                        Some(child) => child,
                        None => {
                            let mut fresh = read_json_node(reader, registry)?;
                            fresh.name = name.clone();
                            let child = tree.push_node(fresh);
                            tree.nodes[node].members.push(child);
                            tree.nodes[node].types.insert(NodeType::Object);
                            child
                        }
                    }
                };
            }
        }
        Ok(tree)
    }
}

fn read_json_node(reader: &mut BitReader, registry: &ModelRegistry) -> Result<JsonNode> {
    let mut node = JsonNode::new(String::new());
    node.leaf_id = reader.read_u16();
    let member_count = reader.read_u16() as usize;
    node.member_order = (0..member_count).map(|_| reader.read_u16() as usize).collect();

    node.exist = CategoricalModel::read(reader, registry, node.leaf_id as usize)?;
    node.type_model = CategoricalModel::read(reader, registry, node.leaf_id as usize)?;

    if reader.read_bit() {
        node.array_size = Some(CategoricalModel::read(
            reader,
            registry,
            node.leaf_id as usize,
        )?);
    }
    if reader.read_bit() {
        node.types.insert(NodeType::Str);
        node.string_model = Some(StringModel::read(reader, node.leaf_id as usize)?);
    }
    if reader.read_bit() {
        let target_int = reader.read_bit();
        node.types.insert(if target_int {
            NodeType::Number
        } else {
            NodeType::Double
        });
        node.number_model = Some(NumericalModel::read(
            reader,
            registry,
            node.leaf_id as usize,
            target_int,
        )?);
    }
    if reader.read_bit() {
        node.types.insert(NodeType::Double);
        node.ts_model = Some(TimeSeriesModel::read(
            reader,
            registry,
            node.leaf_id as usize,
        )?);
    }
    node.predictors = node
        .number_model
        .as_ref()
        .map(|m| m.predictors().to_vec())
        .or_else(|| node.ts_model.as_ref().map(|m| m.predictors().to_vec()))
        .unwrap_or_default();
    Ok(node)
}

enum DecodeEvent {
    Null,
    Bool(bool),
    Int(i32),
    Double(f64),
    Str(String),
    Object(Vec<String>),
    Array(usize),
    Series(Vec<f64>),
}

/// Iterative assembly from the reversed event list. Children come off the
/// value stack in traversal order, so each container reverses its popped
/// children before attaching them.
fn assemble(events: Vec<DecodeEvent>) -> Result<Value> {
    let mut stack: Vec<Value> = Vec::new();
    for event in events.into_iter().rev() {
        match event {
            DecodeEvent::Null => stack.push(Value::Null),
            DecodeEvent::Bool(b) => stack.push(Value::Bool(b)),
            DecodeEvent::Int(v) => stack.push(Value::from(v)),
            DecodeEvent::Double(v) => stack.push(
                serde_json::Number::from_f64(v)
                    .map(Value::Number)
                    .unwrap_or(Value::Null),
            ),
            DecodeEvent::Str(s) => stack.push(Value::String(s)),
            DecodeEvent::Series(series) => {
                let items: Vec<Value> = series
                    .into_iter()
                    .map(|v| {
                        serde_json::Number::from_f64(v)
                            .map(Value::Number)
                            .unwrap_or(Value::Null)
                    })
                    .collect();
                stack.push(Value::Array(items));
            }
            DecodeEvent::Array(len) => {
                if stack.len() < len {
                    return Err(Error::Corrupt("array children missing".into()));
                }
                let mut items: Vec<Value> = stack.split_off(stack.len() - len);
                items.reverse();
                stack.push(Value::Array(items));
            }
            DecodeEvent::Object(names) => {
                if stack.len() < names.len() {
                    return Err(Error::Corrupt("object members missing".into()));
                }
                let mut children: Vec<Value> = stack.split_off(stack.len() - names.len());
                children.reverse();
                let mut map = serde_json::Map::new();
                for (name, child) in names.into_iter().zip(children) {
                    map.insert(name, child);
                }
                stack.push(Value::Object(map));
            }
        }
    }
    stack
        .pop()
        .ok_or_else(|| Error::Corrupt("empty decode event stream".into()))
}

/// JSON compressor driver; same learning protocol and block/index handling
/// as the relational driver, one document per logical record.
pub struct JsonCompressor<W: Write> {
    opts: CodingOptions,
    tree: Option<JsonTree>,
    learner: Option<JsonLearner>,
    sink: Option<W>,
    writer: Option<BitWriter<W>>,
    encoder: BlockEncoder,
    picks: Vec<Pick>,
    pick_limit: usize,
    index: IndexWriter,
    attrs: Tuple,
    num_nodes: u32,
    model_bits: u64,
}

impl<W: Write> JsonCompressor<W> {
    pub fn new(
        sink: W,
        schema: &JsonSchema,
        config: CompressionConfig,
        opts: CodingOptions,
        registry: Arc<ModelRegistry>,
    ) -> Result<Self> {
        let tree = JsonTree::build(schema)?;
        let learner = JsonLearner::new(schema.clone(), config, tree, registry);
        Ok(JsonCompressor {
            pick_limit: (opts.block_size << 8) + 10_000,
            encoder: BlockEncoder::new(opts.delayed_bits),
            opts,
            tree: None,
            learner: Some(learner),
            sink: Some(sink),
            writer: None,
            picks: Vec::new(),
            index: IndexWriter::new(),
            attrs: Tuple::new(schema.leaf_count()),
            num_nodes: 0,
            model_bits: 0,
        })
    }

    pub fn needs_full_pass(&self) -> bool {
        self.learner.as_ref().map_or(true, |l| l.needs_full_pass())
    }

    pub fn needs_more_learning(&self) -> bool {
        self.learner.is_some()
    }

    pub fn learn_node(&mut self, doc: &Value) {
        if let Some(learner) = &mut self.learner {
            learner.feed_node(doc, &mut self.attrs);
            self.num_nodes += 1;
        }
    }

    pub fn end_of_learning(&mut self) -> Result<()> {
        let Some(learner) = &mut self.learner else {
            return Ok(());
        };
        learner.end_of_data()?;

        if !learner.needs_more_iterations() {
            let Some(learner) = self.learner.take() else {
                return Ok(());
            };
            let tree = learner.into_tree();

            let Some(sink) = self.sink.take() else {
                return Err(Error::Schema("output sink already consumed".into()));
            };
            let mut writer = BitWriter::new(sink);
            writer.write_u32(self.num_nodes.saturating_sub(crate::NUM_EST_SAMPLE as u32))?;
            writer.reset_bit_count();
            tree.write(&mut writer)?;
            self.model_bits = writer.bits_written();
            debug!(model_kib = self.model_bits >> 13, "json model serialized");

            self.tree = Some(tree);
            self.writer = Some(writer);
        }
        self.num_nodes = 0;
        Ok(())
    }

    pub fn model_size_bits(&self) -> u64 {
        self.model_bits
    }

    pub fn compress_node(&mut self, doc: &Value) -> Result<()> {
        let Some(tree) = self.tree.as_mut() else {
            return Err(Error::Schema("compressor is not in the data stage".into()));
        };
        tree.encode_node(doc, &mut self.attrs, &mut self.picks)?;
        if self.picks.len() > self.pick_limit {
            return Err(Error::BufferOverflow {
                observed: self.picks.len(),
                allowed: self.pick_limit,
            });
        }
        self.num_nodes += 1;

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
        self.index.record_block(words, self.num_nodes)?;
        self.picks.clear();
        if let Some(tree) = self.tree.as_mut() {
            tree.reset_block_state();
        }
        Ok(())
    }

    pub fn finish(mut self) -> Result<W> {
        self.flush_block()?;
        let Some(mut writer) = self.writer.take() else {
            return Err(Error::Schema("compressor is not in the data stage".into()));
        };
        self.index.finish(&mut writer)?;
        let (sink, _) = writer.finish()?;
        Ok(sink)
    }
}

pub struct JsonDecompressor {
    opts: CodingOptions,
    reader: BitReader,
    tree: JsonTree,
    decoder: Decoder,
    index: IndexReader,
    data_pos: u64,
    attrs: Tuple,
    total_nodes: u32,
    todo: u64,
    done: u64,
}

impl JsonDecompressor {
    pub fn new(
        data: Vec<u8>,
        schema: &JsonSchema,
        opts: CodingOptions,
        registry: Arc<ModelRegistry>,
    ) -> Result<Self> {
        let mut reader = BitReader::new(data);
        let total_nodes = reader.read_u32();
        let tree = JsonTree::read(&mut reader, schema, &registry)?;
        let data_pos = reader.tell();
        let index = IndexReader::parse(&mut reader)?;
        reader.seek(data_pos);
        Ok(JsonDecompressor {
            decoder: Decoder::new(opts.delayed_bits),
            todo: total_nodes as u64,
            done: 0,
            attrs: Tuple::new(schema.leaf_count()),
            opts,
            reader,
            tree,
            index,
            data_pos,
            total_nodes,
        })
    }

    pub fn total_nodes(&self) -> u32 {
        self.total_nodes
    }

    pub fn has_next(&self) -> bool {
        self.done < self.todo
    }

    fn reset_block(&mut self) {
        self.decoder.reset();
        self.tree.reset_block_state();
    }

    pub fn read_next_node(&mut self) -> Result<Value> {
        if self.decoder.words_read() as usize > self.opts.block_size {
            self.reset_block();
        }
        let value = self
            .tree
            .decode_node(&mut self.decoder, &mut self.reader, &mut self.attrs)?;
        self.done += 1;
        Ok(value)
    }

    /// Seek to the block holding document `idx`; conditioned leaves pin the
    /// stream to sequential decoding, like markov columns do relationally.
    pub fn locate_node(&mut self, idx: u32) -> Result<u32> {
        if idx >= self.total_nodes {
            return Err(Error::Schema(format!(
                "document {idx} out of range ({} total)",
                self.total_nodes
            )));
        }
        if self.tree.has_predictors() {
            return Err(Error::Schema(
                "random access is unavailable for predictor-conditioned documents".into(),
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
}
