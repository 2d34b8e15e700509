//! Masked token-level cross entropy.

use candle_core::{DType, Result, Tensor, D};

/// Mean negative log-likelihood over positions whose label is a real label.
///
/// `logits`: `[batch, seq, num_labels]`; `labels`: `[batch, seq]` i64 where
/// negative values (the ignore label) are excluded from both the sum and the
/// count. Returns a scalar; 0 when no position is labeled.
pub fn masked_cross_entropy(logits: &Tensor, labels: &Tensor) -> Result<Tensor> {
    let (batch, seq, num_labels) = logits.dims3()?;
    let logits = logits.reshape((batch * seq, num_labels))?;
    let labels = labels.reshape(batch * seq)?;

    let log_probs = candle_nn::ops::log_softmax(&logits, D::Minus1)?;
    let mask = labels.ge(0i64)?.to_dtype(DType::F32)?;
    // Ignored positions gather class 0 and are zeroed by the mask.
    let targets = labels.maximum(0i64)?.unsqueeze(1)?;
    let picked = log_probs.gather(&targets, 1)?.squeeze(1)?;

    let count = mask.sum_all()?.to_scalar::<f32>()?.max(1.0);
    (picked * &mask)?.sum_all()?.neg()?.affine(1.0 / f64::from(count), 0.0)
}

/// Argmax label id per position, row-major.
pub fn predictions(logits: &Tensor) -> Result<Vec<i64>> {
    let ids = logits.argmax(D::Minus1)?.flatten_all()?.to_vec1::<u32>()?;
    Ok(ids.into_iter().map(i64::from).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use tagtune_core::IGNORE_INDEX;

    fn scalar(t: &Tensor) -> f32 {
        t.to_scalar::<f32>().unwrap()
    }

    #[test]
    fn test_uniform_logits() {
        let logits = Tensor::zeros((1, 2, 3), DType::F32, &Device::Cpu).unwrap();
        let labels = Tensor::new(&[[0i64, 2]], &Device::Cpu).unwrap();
        let loss = masked_cross_entropy(&logits, &labels).unwrap();
        assert!((scalar(&loss) - 3f32.ln()).abs() < 1e-5);
    }

    #[test]
    fn test_ignored_positions_do_not_count() {
        let logits = Tensor::new(
            &[[[5f32, 0.0, 0.0], [0.0, 0.0, 9.0], [0.0, 0.0, 0.0]]],
            &Device::Cpu,
        )
        .unwrap();
        let labels = Tensor::new(&[[0i64, IGNORE_INDEX, IGNORE_INDEX]], &Device::Cpu).unwrap();
        let loss = masked_cross_entropy(&logits, &labels).unwrap();

        let first = logits.narrow(1, 0, 1).unwrap();
        let first_label = Tensor::new(&[[0i64]], &Device::Cpu).unwrap();
        let only_first = masked_cross_entropy(&first, &first_label).unwrap();
        assert!((scalar(&loss) - scalar(&only_first)).abs() < 1e-6);
    }

    #[test]
    fn test_all_ignored_is_zero() {
        let logits = Tensor::ones((2, 2, 3), DType::F32, &Device::Cpu).unwrap();
        let labels = Tensor::full(IGNORE_INDEX, (2, 2), &Device::Cpu).unwrap();
        let loss = masked_cross_entropy(&logits, &labels).unwrap();
        assert_eq!(scalar(&loss), 0.0);
    }

    #[test]
    fn test_predictions_argmax() {
        let logits = Tensor::new(&[[[0.1f32, 0.9, 0.0], [2.0, 0.0, 1.0]]], &Device::Cpu).unwrap();
        assert_eq!(predictions(&logits).unwrap(), vec![1, 0]);
    }
}
