//! Plugin manifests, compilation, and the dry-run contract check.

use super::expr::{EvalContext, Expr};
use crate::derive::Transform;
use crate::types::{CaptureRecord, MetricRef};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::sync::OnceLock;

/// Inputs a plugin may declare.
pub const MAX_PLUGIN_INPUTS: usize = 16;
/// Upper bound on the history window.
pub const MAX_WINDOW: usize = 10_000;
/// Ticks fed to a plugin during validation.
pub const DRY_RUN_TICKS: u64 = 6;

fn key_pattern() -> &'static Regex {
    static KEY: OnceLock<Regex> = OnceLock::new();
    KEY.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,63}$").expect("valid key regex"))
}

/// One declared output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputSpec {
    pub key: String,
    pub expr: String,
}

fn default_min_inputs() -> usize {
    1
}

fn default_window() -> usize {
    1
}

/// A plugin definition as uploaded.
///
/// ```json
/// {
///   "id": "ratio",
///   "name": "Ratio",
///   "min_inputs": 2,
///   "max_inputs": 2,
///   "window": 5,
///   "outputs": [
///     { "key": "ratio", "expr": "in0 / in1" },
///     { "key": "ratio_mean", "expr": "mean(in0) / mean(in1)" }
///   ]
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginManifest {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_min_inputs")]
    pub min_inputs: usize,
    #[serde(default)]
    pub max_inputs: Option<usize>,
    #[serde(default = "default_window")]
    pub window: usize,
    #[serde(default)]
    pub outputs: Vec<OutputSpec>,
}

/// A manifest whose outputs compiled.
#[derive(Debug, Clone)]
pub struct CompiledPlugin {
    pub id: String,
    pub name: String,
    pub min_inputs: usize,
    pub max_inputs: usize,
    pub window: usize,
    keys: Vec<String>,
    exprs: Vec<Expr>,
}

impl CompiledPlugin {
    /// Check identity, arity, and outputs, and compile every expression.
    pub fn compile(manifest: &PluginManifest) -> Result<Self, String> {
        let id = manifest.id.trim();
        let name = manifest.name.trim();
        if id.is_empty() {
            return Err("plugin id is required".to_string());
        }
        if name.is_empty() {
            return Err("plugin name is required".to_string());
        }
        if manifest.outputs.is_empty() {
            return Err("plugin declares no outputs".to_string());
        }

        let min_inputs = manifest.min_inputs;
        let max_inputs = manifest.max_inputs.unwrap_or(min_inputs);
        if min_inputs == 0 || min_inputs > max_inputs || max_inputs > MAX_PLUGIN_INPUTS {
            return Err(format!(
                "input bounds must satisfy 1 <= min_inputs <= max_inputs <= {} (got {}..{})",
                MAX_PLUGIN_INPUTS, min_inputs, max_inputs
            ));
        }
        if manifest.window == 0 || manifest.window > MAX_WINDOW {
            return Err(format!("window must be between 1 and {}", MAX_WINDOW));
        }

        let mut seen = HashSet::new();
        let mut keys = Vec::with_capacity(manifest.outputs.len());
        let mut exprs = Vec::with_capacity(manifest.outputs.len());
        for output in &manifest.outputs {
            if !key_pattern().is_match(&output.key) {
                return Err(format!("invalid output key '{}'", output.key));
            }
            if !seen.insert(output.key.as_str()) {
                return Err(format!("duplicate output key '{}'", output.key));
            }
            let expr = Expr::parse(&output.expr)
                .map_err(|e| format!("output '{}': {}", output.key, e))?;
            if let Some(index) = expr.max_input() {
                if index >= min_inputs {
                    return Err(format!(
                        "output '{}' reads in{} but only {} input(s) are guaranteed",
                        output.key, index, min_inputs
                    ));
                }
            }
            keys.push(output.key.clone());
            exprs.push(expr);
        }

        Ok(Self {
            id: id.to_string(),
            name: name.to_string(),
            min_inputs,
            max_inputs,
            window: manifest.window,
            keys,
            exprs,
        })
    }

    pub fn output_keys(&self) -> &[String] {
        &self.keys
    }

    pub fn accepts_inputs(&self, count: usize) -> bool {
        (self.min_inputs..=self.max_inputs).contains(&count)
    }

    /// A fresh transform with its own history.
    pub fn instantiate(&self, inputs: usize) -> ExprTransform {
        ExprTransform {
            name: self.id.clone(),
            keys: self.keys.clone(),
            exprs: self.exprs.clone(),
            window: self.window,
            history: vec![VecDeque::new(); inputs],
        }
    }
}

/// Transform backed by compiled plugin expressions.
pub struct ExprTransform {
    name: String,
    keys: Vec<String>,
    exprs: Vec<Expr>,
    window: usize,
    history: Vec<VecDeque<f64>>,
}

impl ExprTransform {
    /// One step without filtering non-finite results.
    pub(crate) fn step(&mut self, tick: u64, inputs: &[Option<f64>]) -> Vec<Option<f64>> {
        let previous: Vec<Option<f64>> = self.history.iter().map(|h| h.back().copied()).collect();
        for (history, value) in self.history.iter_mut().zip(inputs) {
            if let Some(value) = value {
                history.push_back(*value);
                if history.len() > self.window {
                    history.pop_front();
                }
            }
        }
        let ctx = EvalContext {
            tick,
            inputs,
            history: &self.history,
            previous: &previous,
        };
        self.exprs.iter().map(|e| e.eval(&ctx)).collect()
    }
}

impl Transform for ExprTransform {
    fn name(&self) -> &str {
        &self.name
    }

    fn output_keys(&self) -> &[String] {
        &self.keys
    }

    /// Non-finite results are emitted as null.
    fn update(&mut self, tick: u64, inputs: &[Option<f64>]) -> Vec<Option<f64>> {
        self.step(tick, inputs)
            .into_iter()
            .map(|v| v.filter(|v| v.is_finite()))
            .collect()
    }
}

/// Feed a fresh instance synthetic ticks and check every output.
///
/// Inputs are read from a synthetic `dry_run` entity with one component per
/// input, the same way a job extracts metrics from real frames. Values are
/// positive and vary per tick; the middle tick reports every input as null.
pub fn dry_run(plugin: &CompiledPlugin) -> Result<(), String> {
    let inputs = plugin.min_inputs.max(1);
    let metrics: Vec<MetricRef> = (0..inputs)
        .map(|i| MetricRef::new("dry_run", &["dry_run", &format!("input{}", i), "value"]))
        .collect();
    let mut transform = plugin.instantiate(inputs);
    let null_tick = DRY_RUN_TICKS / 2;

    for tick in 1..=DRY_RUN_TICKS {
        let mut frame = CaptureRecord::new(tick);
        for (i, metric) in metrics.iter().enumerate() {
            let value = if tick == null_tick {
                serde_json::Value::Null
            } else {
                serde_json::json!(tick as f64 * (i + 1) as f64 + 0.5)
            };
            frame.set("dry_run", &metric.path[1], serde_json::json!({ "value": value }));
        }
        let values: Vec<Option<f64>> = metrics.iter().map(|m| m.extract(&frame)).collect();

        let outputs = transform.step(tick, &values);
        if outputs.len() != plugin.keys.len() {
            return Err(format!(
                "tick {}: produced {} outputs, declared {}",
                tick,
                outputs.len(),
                plugin.keys.len()
            ));
        }
        for (key, value) in plugin.keys.iter().zip(outputs) {
            if let Some(v) = value {
                if !v.is_finite() {
                    return Err(format!(
                        "output '{}' is not a finite number at tick {} ({})",
                        key, tick, v
                    ));
                }
            }
        }
    }
    Ok(())
}

/// Parse, compile, and dry-run a manifest.
pub fn validate(bytes: &[u8]) -> Result<CompiledPlugin, String> {
    let manifest: PluginManifest =
        serde_json::from_slice(bytes).map_err(|e| format!("manifest is not valid JSON: {}", e))?;
    let plugin = CompiledPlugin::compile(&manifest)?;
    dry_run(&plugin)?;
    Ok(plugin)
}
