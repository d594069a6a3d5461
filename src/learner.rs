//! Two-stage model learner for relational data.
//!
//! Stage 0 works on a sampled stream: for every attribute it greedily grows
//! a predictor set, training candidate models and memoizing their costs; an
//! attribute joins the global ordering once no active candidates remain and
//! it has the cheapest model among the attributes still out. Stage 1 refits
//! only the selected models on full passes over the data, in dependency
//! order, and discards the sample-based estimates.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use tracing::debug;

use crate::error::{Error, Result};
use crate::squid::{create_model, ModelRegistry, SquidModel};
use crate::{CompressionConfig, Schema, Tuple};

const STAGE_SEARCH: u8 = 0;
const STAGE_REFIT: u8 = 1;
const STAGE_DONE: u8 = 2;

pub struct RelationLearner {
    schema: Schema,
    config: CompressionConfig,
    registry: Arc<ModelRegistry>,
    stage: u8,
    ordered_attrs: Vec<usize>,
    inactive: HashSet<usize>,
    active: Vec<SquidModel>,
    selected: Vec<Option<SquidModel>>,
    predictor_lists: Vec<Vec<usize>>,
    stored_costs: HashMap<(BTreeSet<usize>, usize), f64>,
}

impl RelationLearner {
    pub fn new(schema: Schema, config: CompressionConfig, registry: Arc<ModelRegistry>) -> Self {
        let cols = schema.len();
        let mut learner = RelationLearner {
            schema,
            config,
            registry,
            stage: STAGE_SEARCH,
            ordered_attrs: Vec::new(),
            inactive: HashSet::new(),
            active: Vec::new(),
            selected: (0..cols).map(|_| None).collect(),
            predictor_lists: vec![Vec::new(); cols],
            stored_costs: HashMap::new(),
        };
        if learner.config.skip_model_learning {
            learner.ordered_attrs = (0..cols).collect();
            learner.stage = STAGE_REFIT;
        }
        learner.init_active_models();
        learner
    }

    /// Whether the next pass must cover the full data set rather than a
    /// sample.
    pub fn needs_full_pass(&self) -> bool {
        self.stage != STAGE_SEARCH
    }

    pub fn needs_more_iterations(&self) -> bool {
        self.stage != STAGE_DONE
    }

    pub fn ordering(&self) -> &[usize] {
        &self.ordered_attrs
    }

    /// Hand over the refit model of one attribute; valid once after the
    /// learner finishes.
    pub fn take_model(&mut self, attr: usize) -> Result<SquidModel> {
        self.selected[attr].take().ok_or_else(|| {
            Error::Schema(format!("no model could be learned for attribute {attr}"))
        })
    }

    pub fn feed_tuple(&mut self, tuple: &Tuple) {
        for model in self.active.iter_mut() {
            model.feed(tuple, 1);
        }
    }

    fn err_of(&self, attr: usize) -> f64 {
        self.config.allowed_err.get(attr).copied().unwrap_or(0.0)
    }

    fn cost_of(&self, predictors: &[usize], target: usize) -> Option<f64> {
        let key = (predictors.iter().copied().collect::<BTreeSet<_>>(), target);
        self.stored_costs.get(&key).copied()
    }

    fn store_cost(&mut self, model: &SquidModel) {
        let key = (
            model.predictors().iter().copied().collect::<BTreeSet<_>>(),
            model.target(),
        );
        let cost = model.cost().max(0.0);
        match self.stored_costs.get(&key) {
            Some(&prev) if prev <= cost => {}
            _ => {
                self.stored_costs.insert(key, cost);
            }
        }
    }

    pub fn end_of_data(&mut self) -> Result<()> {
        match self.stage {
            STAGE_SEARCH => {
                for model in self.active.iter_mut() {
                    model.end_of_data()?;
                }
                let finished: Vec<SquidModel> = std::mem::take(&mut self.active);
                for model in &finished {
                    self.store_cost(model);
                }

                // Selection happens on passes that trained nothing new: the
                // cheapest remaining attribute joins the ordering.
                if finished.is_empty() {
                    let mut next_attr: Option<usize> = None;
                    for i in 0..self.schema.len() {
                        if self.inactive.contains(&i) {
                            continue;
                        }
                        let cost = self.cost_of(&self.predictor_lists[i], i).unwrap_or(-1.0);
                        let best = next_attr
                            .map(|a| self.cost_of(&self.predictor_lists[a], a).unwrap_or(-1.0));
                        if best.map_or(true, |b| cost < b) {
                            next_attr = Some(i);
                        }
                    }
                    if let Some(attr) = next_attr {
                        debug!(
                            attr,
                            predictors = ?self.predictor_lists[attr],
                            "attribute ordered"
                        );
                        self.ordered_attrs.push(attr);
                        self.inactive.insert(attr);
                    }
                    if self.ordered_attrs.len() == self.schema.len() {
                        self.stage = STAGE_REFIT;
                        self.inactive.clear();
                    }
                }
            }
            STAGE_REFIT => {
                let finished: Vec<SquidModel> = std::mem::take(&mut self.active);
                for mut model in finished {
                    model.end_of_data()?;
                    let target = model.target();
                    self.inactive.insert(target);
                    let better = self.selected[target]
                        .as_ref()
                        .map_or(true, |m| m.cost() > model.cost());
                    if better {
                        self.selected[target] = Some(model);
                    }
                }
                if self.inactive.len() == self.schema.len() {
                    self.stage = STAGE_DONE;
                }
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
            self.init_search_candidates();
        } else {
            self.init_refit_models();
        }
    }

    fn init_search_candidates(&mut self) {
        for i in 0..self.schema.len() {
            if self.inactive.contains(&i) {
                continue;
            }
            if self.cost_of(&[], i).is_none() {
                if let Some(model) =
                    create_model(&self.schema, &self.registry, &[], i, self.err_of(i))
                {
                    self.active.push(model);
                }
                continue;
            }

            // Greedy growth: try every ordered attribute as one more
            // predictor; unknown combinations become training candidates,
            // known cheaper ones are adopted immediately.
            self.predictor_lists[i].clear();
            loop {
                let current = self.predictor_lists[i].clone();
                let current_set: BTreeSet<usize> = current.iter().copied().collect();
                let mut previous_cost = self.cost_of(&current, i);
                let mut expanded = false;

                for k in 0..self.ordered_attrs.len() {
                    let attr = self.ordered_attrs[k];
                    if current_set.contains(&attr) {
                        continue;
                    }
                    let mut candidate = current.clone();
                    candidate.push(attr);
                    match self.cost_of(&candidate, i) {
                        None => {
                            if let Some(model) = create_model(
                                &self.schema,
                                &self.registry,
                                &candidate,
                                i,
                                self.err_of(i),
                            ) {
                                self.active.push(model);
                            }
                        }
                        Some(cost) => {
                            if previous_cost.map_or(false, |prev| cost < prev) {
                                self.predictor_lists[i] = candidate;
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

    fn init_refit_models(&mut self) {
        for i in 0..self.schema.len() {
            if self.inactive.contains(&i) {
                continue;
            }
            // An attribute only becomes learnable once all its predictors
            // are refit, so decoding can follow the same order.
            let learnable = self.predictor_lists[i]
                .iter()
                .all(|p| self.inactive.contains(p));
            if !learnable {
                continue;
            }
            if let Some(model) = create_model(
                &self.schema,
                &self.registry,
                &self.predictor_lists[i].clone(),
                i,
                self.err_of(i),
            ) {
                self.active.push(model);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::squid::EnumInterpreter;
    use crate::{AttrType, AttrValue};

    fn tuples_correlated(n: usize) -> Vec<Tuple> {
        // Column 1 is a pure function of column 0; a conditioned model
        // should win by a wide margin.
        (0..n)
            .map(|i| {
                let a = (i % 4) as i32;
                let b = (a * 7 + 3) % 4;
                let mut t = Tuple::new(2);
                t.values[0] = AttrValue::Int(a);
                t.values[1] = AttrValue::Int(b);
                t
            })
            .collect()
    }

    fn run_learner(
        schema: Schema,
        config: CompressionConfig,
        registry: Arc<ModelRegistry>,
        tuples: &[Tuple],
    ) -> RelationLearner {
        let mut learner = RelationLearner::new(schema, config, registry);
        let mut passes = 0;
        while learner.needs_more_iterations() {
            for t in tuples {
                learner.feed_tuple(t);
            }
            learner.end_of_data().unwrap();
            passes += 1;
            assert!(passes < 200, "learner failed to converge");
        }
        learner
    }

    #[test]
    fn test_learner_finds_dependency() {
        let schema = Schema::new(vec![AttrType::Categorical, AttrType::Categorical]);
        let mut registry = ModelRegistry::new(2);
        registry.set_interpreter(0, Arc::new(EnumInterpreter::new(4)));
        registry.set_interpreter(1, Arc::new(EnumInterpreter::new(4)));
        let config = CompressionConfig {
            allowed_err: vec![0.0, 0.0],
            skip_model_learning: false,
        };

        let tuples = tuples_correlated(2000);
        let mut learner = run_learner(schema, config, Arc::new(registry), &tuples);

        assert_eq!(learner.ordering().len(), 2);
        // The dependent column must condition on the driver column.
        let first = learner.ordering()[0];
        let second = learner.ordering()[1];
        let dependent = learner.take_model(second).unwrap();
        assert_eq!(dependent.predictors(), &[first]);
        let driver = learner.take_model(first).unwrap();
        assert!(driver.predictors().is_empty());
    }

    #[test]
    fn test_skip_learning_keeps_schema_order() {
        let schema = Schema::new(vec![
            AttrType::Categorical,
            AttrType::Integer,
            AttrType::Categorical,
        ]);
        let mut registry = ModelRegistry::new(3);
        registry.set_interpreter(0, Arc::new(EnumInterpreter::new(4)));
        registry.set_interpreter(2, Arc::new(EnumInterpreter::new(4)));
        let config = CompressionConfig {
            allowed_err: vec![0.0, 0.0, 0.0],
            skip_model_learning: true,
        };

        let tuples: Vec<Tuple> = (0..100)
            .map(|i| {
                let mut t = Tuple::new(3);
                t.values[0] = AttrValue::Int((i % 4) as i32);
                t.values[1] = AttrValue::Int(i as i32);
                t.values[2] = AttrValue::Int(((i / 2) % 4) as i32);
                t
            })
            .collect();
        let mut learner = run_learner(schema, config, Arc::new(registry), &tuples);

        assert_eq!(learner.ordering(), &[0, 1, 2]);
        for i in 0..3 {
            let model = learner.take_model(i).unwrap();
            assert!(model.predictors().is_empty());
        }
    }

    #[test]
    fn test_independent_columns_stay_unconditioned() {
        let schema = Schema::new(vec![AttrType::Categorical, AttrType::Categorical]);
        let mut registry = ModelRegistry::new(2);
        registry.set_interpreter(0, Arc::new(EnumInterpreter::new(3)));
        registry.set_interpreter(1, Arc::new(EnumInterpreter::new(3)));
        let config = CompressionConfig {
            allowed_err: vec![0.0, 0.0],
            skip_model_learning: false,
        };

        // Uniform independent pair: conditioning cannot beat the extra
        // description length.
        let mut tuples = Vec::new();
        for _ in 0..100 {
            for a in 0..3 {
                for b in 0..3 {
                    let mut t = Tuple::new(2);
                    t.values[0] = AttrValue::Int(a);
                    t.values[1] = AttrValue::Int(b);
                    tuples.push(t);
                }
            }
        }
        let mut learner = run_learner(schema, config, Arc::new(registry), &tuples);
        for i in 0..2 {
            let model = learner.take_model(i).unwrap();
            assert!(
                model.predictors().is_empty(),
                "attribute {i} picked {:?}",
                model.predictors()
            );
        }
    }
}
