//! Drivers for the two graph passes.
//!
//! [`PartialInferenceContext`] drives shape/dtype inference over symbolic
//! tensors; [`ExecutionContext`] drives execution over concrete tensors.
//! Both hold a name-to-tensor store and merge every output a layer returns
//! back into that store, so multi-output layers need no side channel. Layers
//! must be visited in topological order, one pass per context instance.

use std::time::Instant;

use rustc_hash::FxHashMap;

use crate::backend::Backend;
use crate::error::RunError;
use crate::layer::{Inputs, Layer, PartialInputs};
use crate::partial::PartialTensor;
use crate::value::Value;

/// Options that control logging when executing a sequence of layers.
#[derive(Clone, Debug, Default)]
pub struct RunOptions {
    /// Log each layer as it executes, with its inputs, outputs and elapsed
    /// time. This slows execution down.
    pub verbose: bool,
}

/// Name-to-partial-tensor store for one inference pass over a graph.
///
/// The store grows monotonically: seeded with graph inputs and constants,
/// then extended with every layer output as [`infer`](Self::infer) walks the
/// graph.
#[derive(Default)]
pub struct PartialInferenceContext {
    tensors: FxHashMap<String, PartialTensor>,
}

impl PartialInferenceContext {
    pub fn new() -> PartialInferenceContext {
        PartialInferenceContext {
            tensors: FxHashMap::default(),
        }
    }

    /// Bind a partial tensor to a name, such as a graph input placeholder.
    pub fn insert(&mut self, name: &str, tensor: PartialTensor) {
        self.tensors.insert(name.to_string(), tensor);
    }

    /// Bind a concrete constant to a name. Small constants keep their
    /// element values and participate in shape folding downstream.
    pub fn insert_value(&mut self, name: &str, value: &Value) {
        self.tensors
            .insert(name.to_string(), PartialTensor::from_value(value));
    }

    pub fn get(&self, name: &str) -> Option<&PartialTensor> {
        self.tensors.get(name)
    }

    /// Infer one layer from the tensors bound so far and merge all of its
    /// outputs into the store.
    ///
    /// An empty input name stands for an omitted optional input, as does a
    /// name nothing has been bound to.
    pub fn infer(&mut self, layer: &Layer) -> Result<(), RunError> {
        let inputs: Vec<Option<&PartialTensor>> = layer
            .input_names()
            .iter()
            .map(|name| {
                if name.is_empty() {
                    None
                } else {
                    self.tensors.get(name.as_str())
                }
            })
            .collect();
        let outputs = layer
            .infer_partial(&PartialInputs::from_slice(&inputs))
            .map_err(|error| RunError {
                layer: layer.name().to_string(),
                error,
            })?;
        for (name, tensor) in outputs {
            self.tensors.insert(name, tensor);
        }
        Ok(())
    }

    /// Infer a sequence of layers in order.
    pub fn infer_all(&mut self, layers: &[Layer]) -> Result<(), RunError> {
        for layer in layers {
            self.infer(layer)?;
        }
        Ok(())
    }
}

/// Backend handle plus name-to-value store for one execution pass.
pub struct ExecutionContext<'a> {
    backend: &'a mut dyn Backend,
    vars: FxHashMap<String, Value>,
}

impl<'a> ExecutionContext<'a> {
    pub fn new(backend: &'a mut dyn Backend) -> ExecutionContext<'a> {
        ExecutionContext {
            backend,
            vars: FxHashMap::default(),
        }
    }

    /// Bind a concrete tensor to a name, such as a graph input or constant.
    pub fn insert(&mut self, name: &str, value: Value) {
        self.vars.insert(name.to_string(), value);
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }

    /// Remove a tensor from the store, handing ownership to the caller.
    /// Useful for extracting final outputs without a copy.
    pub fn take(&mut self, name: &str) -> Option<Value> {
        self.vars.remove(name)
    }

    /// Execute one layer over the tensors bound so far and merge all of its
    /// outputs into the store.
    pub fn run(&mut self, layer: &Layer) -> Result<(), RunError> {
        let inputs: Vec<Option<&Value>> = layer
            .input_names()
            .iter()
            .map(|name| {
                if name.is_empty() {
                    None
                } else {
                    self.vars.get(name.as_str())
                }
            })
            .collect();
        let outputs = layer
            .execute(&Inputs::from_slice(&inputs), self.backend)
            .map_err(|error| RunError {
                layer: layer.name().to_string(),
                error,
            })?;
        for (name, value) in outputs {
            self.vars.insert(name, value);
        }
        Ok(())
    }

    /// Execute a sequence of layers in order.
    pub fn run_all(&mut self, layers: &[Layer], options: &RunOptions) -> Result<(), RunError> {
        for (step, layer) in layers.iter().enumerate() {
            if !options.verbose {
                self.run(layer)?;
                continue;
            }

            // Capture input descriptions up front so the trace of a failing
            // layer still shows what it consumed.
            let input_lines: Vec<String> = layer
                .input_names()
                .iter()
                .enumerate()
                .filter(|(_, name)| !name.is_empty())
                .filter_map(|(index, name)| {
                    self.vars
                        .get(name.as_str())
                        .map(|value| format!("  input {}: {} ({})", index, name, value))
                })
                .collect();

            let timer = Instant::now();
            let result = self.run(layer);

            println!("#{} {} ({})", step, layer.kind().name(), layer.name());
            for line in &input_lines {
                println!("{}", line);
            }
            if result.is_ok() {
                for (index, name) in layer.output_names().iter().enumerate() {
                    if let Some(value) = self.vars.get(name.as_str()) {
                        println!("  output {}: {} ({})", index, name, value);
                    }
                }
            }
            println!("  time: {:.3}ms", timer.elapsed().as_secs_f64() * 1000.);

            result?;
        }
        Ok(())
    }
}
