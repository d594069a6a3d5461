//! Structure learning for JSON documents.
//!
//! Learning units are triplets `(object node, ancestor leaf ids)`: a leaf
//! member of an object may be predicted by leaves of enclosing objects and
//! by siblings already ordered within the same object. The search works
//! like the relational learner — candidate predictor sets are trained on
//! sampled passes, costs memoized, and per object the cheapest leaf joins
//! that object's member ordering — except that whole candidate trees are
//! cloned from the sketch, trained side by side, and the winning predictor
//! sets and orderings are written back into the sketch before the final
//! full-pass refit.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use crate::error::Result;
use crate::json::{JsonSchema, JsonTree, NodeType};
use crate::squid::ModelRegistry;
use crate::{CompressionConfig, Tuple};

const STAGE_SEARCH: u8 = 0;
const STAGE_REFIT: u8 = 1;
const STAGE_DONE: u8 = 2;

struct Dependency {
    target: usize,
    predictors: Vec<usize>,
}

struct Triplet {
    /// Arena index of the object node.
    node: usize,
    /// Leaf ids of enclosing objects, usable as predictors.
    ancestors: BTreeSet<usize>,
    /// Leaf ids of this object in learned coding order.
    ordered_leaves: Vec<usize>,
    inactive: BTreeSet<usize>,
    dependencies: Vec<Dependency>,
}

pub struct JsonLearner {
    registry: Arc<ModelRegistry>,
    stage: u8,
    sketch: JsonTree,
    triplets: Vec<Triplet>,
    active: Vec<JsonTree>,
    predictor_lists: Vec<Vec<usize>>,
    stored_costs: HashMap<(BTreeSet<usize>, usize), f64>,
}

impl JsonLearner {
    pub fn new(
        schema: JsonSchema,
        config: CompressionConfig,
        sketch: JsonTree,
        registry: Arc<ModelRegistry>,
    ) -> Self {
        let mut learner = JsonLearner {
            registry,
            stage: STAGE_SEARCH,
            sketch,
            triplets: Vec::new(),
            active: Vec::new(),
            predictor_lists: vec![Vec::new(); schema.leaf_count()],
            stored_costs: HashMap::new(),
        };
        if config.skip_model_learning {
            learner.stage = STAGE_REFIT;
        }
        learner.init_triplets();
        learner.init_active_models();
        learner
    }

    pub fn needs_full_pass(&self) -> bool {
        self.stage != STAGE_SEARCH
    }

    pub fn needs_more_iterations(&self) -> bool {
        self.stage != STAGE_DONE
    }

    pub fn into_tree(self) -> JsonTree {
        self.sketch
    }

    pub fn feed_node(&mut self, doc: &Value, attrs: &mut Tuple) {
        if self.stage == STAGE_SEARCH {
            for tree in self.active.iter_mut() {
                tree.learn_node(doc, attrs);
            }
        } else {
            self.sketch.learn_node(doc, attrs);
        }
    }

    /// Walk the tree once: collect one triplet per object node, with the
    /// leaf ids seen on the way down as its ancestor set. Leaves under
    /// arrays take no part (elements share one node, so an element value
    /// cannot predict anything). During the search stage the traversal
    /// order holds only the container members; orderings grow from there.
    fn init_triplets(&mut self) {
        let mut work: Vec<(usize, BTreeSet<usize>)> =
            vec![(self.sketch.root, BTreeSet::new())];
        self.triplets.push(Triplet {
            node: self.sketch.root,
            ancestors: BTreeSet::new(),
            ordered_leaves: Vec::new(),
            inactive: BTreeSet::new(),
            dependencies: Vec::new(),
        });

        while let Some((node, mut ancestors)) = work.pop() {
            let mut containers = Vec::new();
            for (slot, &member) in self.sketch.nodes[node].members.iter().enumerate() {
                let m = &self.sketch.nodes[member];
                let container = m.types.contains(&NodeType::Object)
                    || m.types.contains(&NodeType::Array);
                if container {
                    containers.push(slot);
                } else if m.leaf_id != crate::json::NON_LEAF {
                    ancestors.insert(m.leaf_id as usize);
                }
            }
            for &slot in &containers {
                let member = self.sketch.nodes[node].members[slot];
                work.push((member, ancestors.clone()));
                if self.sketch.nodes[member].types.contains(&NodeType::Object) {
                    self.triplets.push(Triplet {
                        node: member,
                        ancestors: ancestors.clone(),
                        ordered_leaves: Vec::new(),
                        inactive: BTreeSet::new(),
                        dependencies: Vec::new(),
                    });
                }
            }
            self.sketch.nodes[node].member_order = containers;
        }
    }

    fn cost_of(&self, predictors: &[usize], target: usize) -> Option<f64> {
        let key = (predictors.iter().copied().collect::<BTreeSet<_>>(), target);
        self.stored_costs.get(&key).copied()
    }

    /// Record the leaf model costs of one trained candidate tree.
    fn store_costs(&mut self, tree: &JsonTree) {
        let mut work = vec![tree.root];
        while let Some(node) = work.pop() {
            for &slot in &tree.nodes[node].member_order {
                let member = tree.nodes[node].members[slot];
                let m = &tree.nodes[member];
                if m.is_value_leaf() {
                    let key = (
                        m.predictors.iter().copied().collect::<BTreeSet<_>>(),
                        m.leaf_id as usize,
                    );
                    let cost = tree.leaf_cost(member).max(0.0);
                    match self.stored_costs.get(&key) {
                        Some(&prev) if prev <= cost => {}
                        _ => {
                            self.stored_costs.insert(key, cost);
                        }
                    }
                }
                if m.types.contains(&NodeType::Object) || m.types.contains(&NodeType::Array) {
                    work.push(member);
                }
            }
        }
    }

    pub fn end_of_data(&mut self) -> Result<()> {
        match self.stage {
            STAGE_SEARCH => {
                let had_candidates = !self.active.is_empty();
                let finished: Vec<JsonTree> = std::mem::take(&mut self.active);
                for mut tree in finished {
                    tree.end_of_data()?;
                    self.store_costs(&tree);
                }

                if !had_candidates {
                    let mut all_done = true;
                    for k in 0..self.triplets.len() {
                        let node = self.triplets[k].node;
                        let mut next: Option<usize> = None;
                        let mut leaf_count = 0;
                        for &member in &self.sketch.nodes[node].members {
                            let m = &self.sketch.nodes[member];
                            if !m.is_value_leaf() {
                                continue;
                            }
                            leaf_count += 1;
                            let id = m.leaf_id as usize;
                            if self.triplets[k].inactive.contains(&id) {
                                continue;
                            }
                            let cost =
                                self.cost_of(&self.predictor_lists[id], id).unwrap_or(-1.0);
                            let best = next.map(|n| {
                                self.cost_of(&self.predictor_lists[n], n).unwrap_or(-1.0)
                            });
                            if best.map_or(true, |b| cost < b) {
                                next = Some(id);
                            }
                        }
                        if let Some(id) = next {
                            debug!(object = node, leaf = id, "leaf ordered");
                            self.triplets[k].ordered_leaves.push(id);
                            self.triplets[k].inactive.insert(id);
                        }
                        all_done &=
                            self.triplets[k].ordered_leaves.len() == leaf_count;
                    }
                    if all_done {
                        self.stage = STAGE_REFIT;
                        for triplet in self.triplets.iter_mut() {
                            triplet.inactive.clear();
                        }
                    }
                }
            }
            STAGE_REFIT => {
                self.sketch.end_of_data()?;
                self.stage = STAGE_DONE;
            }
            _ => {}
        }

        if self.stage != STAGE_DONE {
            self.init_active_models();
        }
        Ok(())
    }

    fn init_active_models(&mut self) {
        self.active.clear();
        if self.stage == STAGE_SEARCH {
            self.collect_dependencies();
            self.update_sketch();
            self.create_candidates();
        } else {
            self.check_learnable();
            self.update_sketch();
        }
    }

    /// Per triplet, grow each unordered leaf's predictor set greedily and
    /// queue every combination whose cost is still unknown.
    fn collect_dependencies(&mut self) {
        for k in 0..self.triplets.len() {
            let node = self.triplets[k].node;
            let members = self.sketch.nodes[node].members.clone();
            for member in members {
                let m = &self.sketch.nodes[member];
                if !m.is_value_leaf() {
                    continue;
                }
                let id = m.leaf_id as usize;
                if self.triplets[k].inactive.contains(&id) {
                    continue;
                }
                if self.cost_of(&[], id).is_none() {
                    self.triplets[k].dependencies.push(Dependency {
                        target: id,
                        predictors: Vec::new(),
                    });
                    continue;
                }

                self.predictor_lists[id].clear();
                loop {
                    let current = self.predictor_lists[id].clone();
                    let current_set: BTreeSet<usize> = current.iter().copied().collect();
                    let mut previous_cost = self.cost_of(&current, id);
                    let mut expanded = false;

                    let pool: BTreeSet<usize> = self.triplets[k]
                        .ancestors
                        .union(&self.triplets[k].inactive)
                        .copied()
                        .collect();
                    for &cand_attr in &pool {
                        if current_set.contains(&cand_attr) {
                            continue;
                        }
                        let mut candidate = current.clone();
                        candidate.push(cand_attr);
                        match self.cost_of(&candidate, id) {
                            None => self.triplets[k].dependencies.push(Dependency {
                                target: id,
                                predictors: candidate,
                            }),
                            Some(cost) => {
                                if previous_cost.map_or(false, |prev| cost < prev) {
                                    self.predictor_lists[id] = candidate;
                                    previous_cost = Some(cost);
                                    expanded = true;
                                }
                            }
                        }
                    }
                    if !expanded {
                        break;
                    }
                }
            }
        }
    }

    /// Push the adopted predictor sets and leaf orderings into the sketch.
    fn update_sketch(&mut self) {
        for k in 0..self.triplets.len() {
            let node = self.triplets[k].node;
            let ordered = self.triplets[k].ordered_leaves.clone();
            let mut slots = Vec::with_capacity(ordered.len());
            for id in ordered {
                let Some(slot) = self.sketch.member_slot_of_leaf(node, id) else {
                    continue;
                };
                let member = self.sketch.nodes[node].members[slot];
                let predictors = self.predictor_lists[id].clone();
                if !self.sketch.set_predictors(member, predictors, &self.registry) {
                    warn!(leaf = id, "predictor set rejected while updating sketch");
                }
                slots.push(slot);
            }
            self.sketch.set_member_order(node, slots);
        }
    }

    /// Materialize one candidate tree per dependency round: each triplet
    /// contributes at most one queued dependency, written into the sketch
    /// and cloned.
    fn create_candidates(&mut self) {
        let rounds = self
            .triplets
            .iter()
            .map(|t| t.dependencies.len())
            .max()
            .unwrap_or(0);

        for _ in 0..rounds {
            let mut any_success = false;
            for k in 0..self.triplets.len() {
                let node = self.triplets[k].node;
                let ordered = self.triplets[k].ordered_leaves.clone();
                let mut slots: Vec<usize> = ordered
                    .iter()
                    .filter_map(|&id| self.sketch.member_slot_of_leaf(node, id))
                    .collect();

                let Some(dep) = self.triplets[k].dependencies.pop() else {
                    self.sketch.set_member_order(node, slots);
                    continue;
                };
                let Some(target_slot) = self.sketch.member_slot_of_leaf(node, dep.target)
                else {
                    continue;
                };
                slots.push(target_slot);
                self.sketch.set_member_order(node, slots);
                let member = self.sketch.nodes[node].members[target_slot];
                if self
                    .sketch
                    .set_predictors(member, dep.predictors, &self.registry)
                {
                    any_success = true;
                }
            }
            if any_success {
                self.active.push(self.sketch.clone());
            }
        }
    }

    /// Refit sanity check: a leaf whose adopted predictors span triplets
    /// that never finished cannot be coded deterministically.
    fn check_learnable(&self) {
        for triplet in &self.triplets {
            for &member in &self.sketch.nodes[triplet.node].members {
                let m = &self.sketch.nodes[member];
                if !m.is_value_leaf() {
                    continue;
                }
                let id = m.leaf_id as usize;
                let pool: BTreeSet<usize> = triplet
                    .ancestors
                    .union(&triplet.inactive)
                    .copied()
                    .collect();
                let ordered: BTreeSet<usize> =
                    triplet.ordered_leaves.iter().copied().collect();
                let learnable = self.predictor_lists[id]
                    .iter()
                    .all(|p| pool.contains(p) || ordered.contains(p));
                if !learnable {
                    warn!(leaf = id, "leaf model is not learnable from its predictors");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::json::JsonSchema;
    use serde_json::json;

    fn learn_all(docs: &[Value], skip: bool) -> (JsonSchema, JsonTree) {
        let schema = JsonSchema::generate(docs).unwrap();
        let registry = Arc::new(ModelRegistry::new(schema.leaf_count()));
        let tree = JsonTree::build(&schema).unwrap();
        let config = CompressionConfig {
            allowed_err: vec![0.0; schema.leaf_count()],
            skip_model_learning: skip,
        };
        let mut learner = JsonLearner::new(schema.clone(), config, tree, registry);
        let mut attrs = Tuple::new(schema.leaf_count());
        let mut passes = 0;
        while learner.needs_more_iterations() {
            for doc in docs {
                learner.feed_node(doc, &mut attrs);
            }
            learner.end_of_data().unwrap();
            passes += 1;
            assert!(passes < 300, "json learner failed to converge");
        }
        (schema, learner.into_tree())
    }

    #[test]
    fn test_learning_orders_every_leaf() {
        let docs: Vec<Value> = (0..120)
            .map(|i| {
                json!({
                    "a": i % 3,
                    "b": (i % 3) * 2,
                    "inner": {"c": i % 2},
                })
            })
            .collect();
        let (_, tree) = learn_all(&docs, false);

        // Every object's member order must cover all of its members, or
        // encode and decode would disagree on what exists.
        for node in &tree.nodes {
            if node.types.contains(&NodeType::Object) {
                let mut seen: Vec<usize> = node.member_order.clone();
                seen.sort_unstable();
                seen.dedup();
                assert_eq!(seen.len(), node.members.len());
            }
        }
    }

    #[test]
    fn test_skip_learning_still_orders_members() {
        let docs: Vec<Value> = (0..50)
            .map(|i| json!({"x": i, "nested": {"y": i % 2, "z": "s"}}))
            .collect();
        let (_, tree) = learn_all(&docs, true);
        for node in &tree.nodes {
            if node.types.contains(&NodeType::Object) {
                assert_eq!(node.member_order.len(), node.members.len());
            }
        }
    }
}
