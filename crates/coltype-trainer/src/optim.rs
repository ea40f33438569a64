//! # Optimization
//!
//! AdamW whose moment estimates are addressable by parameter name so they
//! can be written into and restored from a checkpoint, plus a step
//! learning-rate schedule.

use std::collections::HashMap;

use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};
use candle_nn::{Optimizer, VarMap};
use coltype_core::config::{LrSchedulerConfig, OptimizerConfig};
use coltype_core::{CtaError, Result};

const EXP_AVG: &str = "exp_avg";
const EXP_AVG_SQ: &str = "exp_avg_sq";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdamWParams {
    pub lr: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    pub weight_decay: f64,
}

impl Default for AdamWParams {
    fn default() -> Self {
        Self {
            lr: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.01,
        }
    }
}

impl From<&OptimizerConfig> for AdamWParams {
    fn from(config: &OptimizerConfig) -> Self {
        Self {
            lr: config.lr,
            weight_decay: config.weight_decay,
            ..Default::default()
        }
    }
}

struct NamedVar {
    name: String,
    var: Var,
    exp_avg: Var,
    exp_avg_sq: Var,
}

/// Snapshot of the optimizer, keyed by parameter name.
#[derive(Debug, Clone)]
pub struct OptimizerState {
    pub step: usize,
    pub lr: f64,
    /// `exp_avg.{param}` and `exp_avg_sq.{param}` moments.
    pub moments: HashMap<String, Tensor>,
}

/// Adam with decoupled weight decay.
pub struct NamedAdamW {
    vars: Vec<NamedVar>,
    step: usize,
    params: AdamWParams,
}

impl NamedAdamW {
    /// Optimizes every float parameter of `varmap`, in name order.
    pub fn from_varmap(varmap: &VarMap, params: AdamWParams) -> Result<Self> {
        let data = varmap
            .data()
            .lock()
            .map_err(|_| CtaError::Checkpoint("parameter store lock poisoned".into()))?;
        let mut named: Vec<(String, Var)> = data
            .iter()
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect();
        drop(data);
        named.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(Self::from_named(named, params)?)
    }

    fn from_named(named: Vec<(String, Var)>, params: AdamWParams) -> candle_core::Result<Self> {
        let vars = named
            .into_iter()
            .filter(|(_, var)| var.dtype().is_float())
            .map(|(name, var)| {
                let exp_avg = Var::zeros(var.shape(), var.dtype(), var.device())?;
                let exp_avg_sq = Var::zeros(var.shape(), var.dtype(), var.device())?;
                Ok(NamedVar {
                    name,
                    var,
                    exp_avg,
                    exp_avg_sq,
                })
            })
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok(Self {
            vars,
            step: 0,
            params,
        })
    }

    pub fn params(&self) -> &AdamWParams {
        &self.params
    }

    /// Number of optimizer steps taken so far.
    pub fn step_count(&self) -> usize {
        self.step
    }

    /// Exports the step counter, learning rate and moment estimates.
    pub fn state(&self) -> OptimizerState {
        let mut moments = HashMap::with_capacity(self.vars.len() * 2);
        for v in &self.vars {
            moments.insert(format!("{EXP_AVG}.{}", v.name), v.exp_avg.as_tensor().clone());
            moments.insert(format!("{EXP_AVG_SQ}.{}", v.name), v.exp_avg_sq.as_tensor().clone());
        }
        OptimizerState {
            step: self.step,
            lr: self.params.lr,
            moments,
        }
    }

    /// Restores a snapshot produced by [`NamedAdamW::state`].
    pub fn load_state(&mut self, state: &OptimizerState) -> Result<()> {
        for v in &self.vars {
            for (kind, target) in [(EXP_AVG, &v.exp_avg), (EXP_AVG_SQ, &v.exp_avg_sq)] {
                let key = format!("{kind}.{}", v.name);
                let tensor = state.moments.get(&key).ok_or_else(|| {
                    CtaError::Checkpoint(format!("optimizer state has no {key}"))
                })?;
                target.set(&tensor.to_device(v.var.device())?.to_dtype(v.var.dtype())?)?;
            }
        }
        self.step = state.step;
        self.params.lr = state.lr;
        Ok(())
    }
}

impl Optimizer for NamedAdamW {
    type Config = AdamWParams;

    fn new(vars: Vec<Var>, params: AdamWParams) -> candle_core::Result<Self> {
        let named = vars
            .into_iter()
            .enumerate()
            .map(|(i, var)| (format!("param.{i}"), var))
            .collect();
        Self::from_named(named, params)
    }

    fn step(&mut self, grads: &GradStore) -> candle_core::Result<()> {
        self.step += 1;
        let AdamWParams {
            lr,
            beta1,
            beta2,
            eps,
            weight_decay,
        } = self.params;
        let scale_m = 1.0 / (1.0 - beta1.powi(self.step as i32));
        let scale_v = 1.0 / (1.0 - beta2.powi(self.step as i32));

        for v in &self.vars {
            let theta = &v.var;
            let Some(grad) = grads.get(theta) else {
                continue;
            };
            let next_m = ((v.exp_avg.as_tensor() * beta1)? + (grad * (1.0 - beta1))?)?;
            let next_v = ((v.exp_avg_sq.as_tensor() * beta2)? + (grad.sqr()? * (1.0 - beta2))?)?;
            let m_hat = (&next_m * scale_m)?;
            let v_hat = (&next_v * scale_v)?;
            let decayed = (theta.as_tensor() * (1.0 - lr * weight_decay))?;
            let update = (m_hat / (v_hat.sqrt()? + eps)?)?;
            let next_theta = (decayed - (update * lr)?)?;
            v.exp_avg.set(&next_m)?;
            v.exp_avg_sq.set(&next_v)?;
            theta.set(&next_theta)?;
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.params.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.params.lr = lr;
    }
}

/// Decays the learning rate by `gamma` every `step_size` epochs.
#[derive(Debug, Clone)]
pub struct StepLr {
    step_size: usize,
    gamma: f64,
    base_lr: f64,
    last_epoch: usize,
}

impl StepLr {
    pub fn new(config: &LrSchedulerConfig, base_lr: f64) -> Self {
        Self {
            step_size: config.step_size.max(1),
            gamma: config.gamma,
            base_lr,
            last_epoch: 0,
        }
    }

    /// Positions the schedule after `epochs` completed epochs.
    pub fn with_last_epoch(mut self, epochs: usize) -> Self {
        self.last_epoch = epochs;
        self
    }

    /// Learning rate for the current position.
    pub fn current_lr(&self) -> f64 {
        self.base_lr * self.gamma.powi((self.last_epoch / self.step_size) as i32)
    }

    /// Advances one epoch and applies the new rate.
    pub fn step<O: Optimizer>(&mut self, optimizer: &mut O) {
        self.last_epoch += 1;
        optimizer.set_learning_rate(self.current_lr());
    }
}
