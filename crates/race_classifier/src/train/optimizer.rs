//! SGD with momentum and (coupled) weight decay
//!
//! Update per parameter, matching torch.optim.SGD:
//! `g += wd * p; buf = momentum * buf + g; p -= lr * buf`, with the buffer
//! initialised to `g` on the first step.

use candle_core::backprop::GradStore;
use candle_core::{Result, Tensor, Var};
use candle_nn::{Optimizer, VarMap};
use std::collections::HashMap;

/// Checkpoint key prefix of the momentum buffers
pub const MOMENTUM_PREFIX: &str = "optimizer.momentum.";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParamsSgd {
    pub lr: f64,
    pub momentum: f64,
    pub weight_decay: f64,
}

impl Default for ParamsSgd {
    fn default() -> Self {
        Self {
            lr: 1e-3,
            momentum: 0.9,
            weight_decay: 1e-5,
        }
    }
}

struct VarState {
    name: String,
    var: Var,
    buf: Option<Tensor>,
}

pub struct SgdMomentum {
    vars: Vec<VarState>,
    params: ParamsSgd,
}

impl SgdMomentum {
    /// Builds the optimizer over every float variable of `varmap`, keyed by
    /// parameter name so the momentum buffers can be checkpointed.
    pub fn from_varmap(varmap: &VarMap, params: ParamsSgd) -> Result<Self> {
        let data = varmap
            .data()
            .lock()
            .map_err(|e| candle_core::Error::Msg(format!("VarMap lock poisoned: {e}")))?;
        let mut named: Vec<(String, Var)> = data
            .iter()
            .filter(|(_, v)| v.dtype().is_float())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        named.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(Self {
            vars: named
                .into_iter()
                .map(|(name, var)| VarState {
                    name,
                    var,
                    buf: None,
                })
                .collect(),
            params,
        })
    }

    pub fn params(&self) -> ParamsSgd {
        self.params
    }

    /// Momentum buffers that exist so far, on the CPU, under `MOMENTUM_PREFIX`.
    pub fn momentum_tensors(&self) -> Result<HashMap<String, Tensor>> {
        let mut out = HashMap::new();
        for state in &self.vars {
            if let Some(buf) = &state.buf {
                out.insert(
                    format!("{MOMENTUM_PREFIX}{}", state.name),
                    buf.to_device(&candle_core::Device::Cpu)?,
                );
            }
        }
        Ok(out)
    }

    /// Restores buffers saved by `momentum_tensors`; returns how many matched.
    pub fn load_momentum(&mut self, tensors: &HashMap<String, Tensor>) -> Result<usize> {
        let mut loaded = 0;
        for state in self.vars.iter_mut() {
            let key = format!("{MOMENTUM_PREFIX}{}", state.name);
            let Some(t) = tensors.get(&key) else {
                continue;
            };
            if t.dims() != state.var.dims() {
                tracing::warn!(
                    "Momentum shape mismatch for {}: {:?} vs {:?}",
                    state.name,
                    t.dims(),
                    state.var.dims()
                );
                continue;
            }
            state.buf = Some(
                t.to_dtype(state.var.dtype())?
                    .to_device(state.var.device())?,
            );
            loaded += 1;
        }
        Ok(loaded)
    }
}

impl Optimizer for SgdMomentum {
    type Config = ParamsSgd;

    /// Variables passed directly are named by position.
    fn new(vars: Vec<Var>, params: ParamsSgd) -> Result<Self> {
        let vars = vars
            .into_iter()
            .filter(|v| v.dtype().is_float())
            .enumerate()
            .map(|(i, var)| VarState {
                name: i.to_string(),
                var,
                buf: None,
            })
            .collect();
        Ok(Self { vars, params })
    }

    fn learning_rate(&self) -> f64 {
        self.params.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.params.lr = lr
    }

    fn step(&mut self, grads: &GradStore) -> Result<()> {
        let ParamsSgd {
            lr,
            momentum,
            weight_decay,
        } = self.params;
        for state in self.vars.iter_mut() {
            let Some(grad) = grads.get(state.var.as_tensor()) else {
                continue;
            };
            let mut grad = grad.clone();
            if weight_decay != 0.0 {
                grad = (grad + (state.var.as_tensor() * weight_decay)?)?;
            }
            let update = if momentum != 0.0 {
                let buf = match &state.buf {
                    Some(buf) => ((buf * momentum)? + &grad)?,
                    None => grad,
                }
                .detach();
                state.buf = Some(buf.clone());
                buf
            } else {
                grad
            };
            state.var.set(&state.var.sub(&(update * lr)?)?)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn close(a: &[f32], b: &[f32]) -> bool {
        a.iter().zip(b).all(|(x, y)| (x - y).abs() < 1e-6)
    }

    #[test]
    fn test_momentum_update_matches_reference() -> Result<()> {
        let device = Device::Cpu;
        let w = Var::new(&[1.0f32, -2.0], &device)?;
        let params = ParamsSgd {
            lr: 0.1,
            momentum: 0.9,
            weight_decay: 0.0,
        };
        let mut opt = SgdMomentum::new(vec![w.clone()], params)?;

        // loss = sum(w^2) -> grad = 2w
        let loss = w.as_tensor().sqr()?.sum_all()?;
        opt.backward_step(&loss)?;
        // buf = [2, -4]; w = [0.8, -1.6]
        assert!(close(&w.as_tensor().to_vec1::<f32>()?, &[0.8, -1.6]));

        let loss = w.as_tensor().sqr()?.sum_all()?;
        opt.backward_step(&loss)?;
        // g = [1.6, -3.2]; buf = 0.9*[2,-4] + g = [3.4, -6.8]; w = [0.46, -0.92]
        assert!(close(&w.as_tensor().to_vec1::<f32>()?, &[0.46, -0.92]));
        Ok(())
    }

    #[test]
    fn test_weight_decay_is_added_to_gradient() -> Result<()> {
        let device = Device::Cpu;
        let w = Var::new(&[2.0f32], &device)?;
        let params = ParamsSgd {
            lr: 1.0,
            momentum: 0.0,
            weight_decay: 0.5,
        };
        let mut opt = SgdMomentum::new(vec![w.clone()], params)?;
        // loss = w -> grad = 1; g = 1 + 0.5*2 = 2; w = 0
        let loss = w.as_tensor().sum_all()?;
        opt.backward_step(&loss)?;
        assert!(close(&w.as_tensor().to_vec1::<f32>()?, &[0.0]));
        Ok(())
    }

    #[test]
    fn test_momentum_roundtrip_through_varmap_names() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = candle_nn::VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let lin = candle_nn::linear(2, 1, vb.pp("fc"))?;
        let mut opt = SgdMomentum::from_varmap(&varmap, ParamsSgd::default())?;
        assert!(opt.momentum_tensors()?.is_empty());

        let x = Tensor::new(&[[1.0f32, 1.0]], &device)?;
        let loss = candle_core::Module::forward(&lin, &x)?.sum_all()?;
        opt.backward_step(&loss)?;

        let saved = opt.momentum_tensors()?;
        assert!(saved.contains_key("optimizer.momentum.fc.weight"));
        assert!(saved.contains_key("optimizer.momentum.fc.bias"));

        let mut fresh = SgdMomentum::from_varmap(&varmap, ParamsSgd::default())?;
        assert_eq!(fresh.load_momentum(&saved)?, 2);
        Ok(())
    }
}
