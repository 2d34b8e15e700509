//! Head parameters exchanged between data-parallel replicas.
//!
//! Workers train their copy of the head on their own shard; at the end of
//! every epoch the trial runner averages the copies and every worker loads
//! the result, so all replicas evaluate and checkpoint the same weights.

use candle_core::Tensor;
use candle_nn::VarMap;

use crate::error::{Result, TrainError};

/// Trainable tensors by name, sorted by name.
pub type HeadParameters = Vec<(String, Tensor)>;

/// Detached copy of every trainable tensor.
pub fn head_parameters(varmap: &VarMap) -> Result<HeadParameters> {
    let vars = varmap
        .data()
        .lock()
        .map_err(|_| TrainError::Replica("parameter map lock poisoned".into()))?;
    let mut params = vars
        .iter()
        .map(|(name, var)| Ok((name.clone(), var.as_tensor().copy()?)))
        .collect::<Result<HeadParameters>>()?;
    params.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(params)
}

/// Overwrite trainable tensors in place. Every name must already exist.
pub fn load_head_parameters(varmap: &VarMap, params: &[(String, Tensor)]) -> Result<()> {
    let vars = varmap
        .data()
        .lock()
        .map_err(|_| TrainError::Replica("parameter map lock poisoned".into()))?;
    for (name, value) in params {
        let var = vars
            .get(name)
            .ok_or_else(|| TrainError::Replica(format!("unknown parameter {name}")))?;
        var.set(value)?;
    }
    Ok(())
}

/// Element-wise mean over replicas. All replicas must hold the same names
/// in the same order.
pub fn average_parameters(replicas: &[&HeadParameters]) -> Result<HeadParameters> {
    let Some((first, rest)) = replicas.split_first() else {
        return Ok(Vec::new());
    };
    let scale = 1.0 / replicas.len() as f64;

    first
        .iter()
        .enumerate()
        .map(|(i, (name, tensor))| {
            let mut sum = tensor.clone();
            for other in rest {
                match other.get(i) {
                    Some((other_name, value)) if other_name == name => sum = sum.add(value)?,
                    _ => {
                        return Err(TrainError::Replica(format!(
                            "replicas disagree on parameter {name}"
                        )))
                    }
                }
            }
            Ok((name.clone(), sum.affine(scale, 0.0)?))
        })
        .collect()
}
