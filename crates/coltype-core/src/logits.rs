//! # Token Logit Extraction
//!
//! Picks the per-token model output at every occurrence of a marker token
//! (the CLS token opening each serialized column).

use candle_core::{DType, Tensor};

use crate::error::{CtaError, Result};

/// Positions `(row, column)` of `token_id` in a `[batch, seq_len]` id matrix,
/// in row-major scan order.
pub fn token_positions(data: &Tensor, token_id: u32) -> Result<Vec<(usize, usize)>> {
    let rows = data.to_dtype(DType::U32)?.to_vec2::<u32>()?;
    let mut positions = Vec::new();
    for (i, row) in rows.iter().enumerate() {
        for (j, &id) in row.iter().enumerate() {
            if id == token_id {
                positions.push((i, j));
            }
        }
    }
    Ok(positions)
}

/// Gathers the logits at every position holding `token_id`.
///
/// # Arguments
/// * `data` - Input ids of shape `[batch, seq_len]`
/// * `logits` - Model output of shape `[batch, seq_len, num_labels]`
/// * `token_id` - Marker token to look for
///
/// # Returns
/// A `[matches, num_labels]` tensor, one row per occurrence in row-major
/// order. The gather stays on the autograd graph.
pub fn token_logits(data: &Tensor, logits: &Tensor, token_id: u32) -> Result<Tensor> {
    let (batch, seq_len) = data.dims2()?;
    let (logit_batch, logit_seq, num_labels) = logits.dims3()?;
    if (batch, seq_len) != (logit_batch, logit_seq) {
        return Err(CtaError::ShapeMismatch(format!(
            "ids [{batch}, {seq_len}] vs logits [{logit_batch}, {logit_seq}, {num_labels}]"
        )));
    }

    let positions = token_positions(data, token_id)?;
    if positions.is_empty() {
        return Ok(Tensor::zeros(
            (0, num_labels),
            logits.dtype(),
            logits.device(),
        )?);
    }

    let flat_index: Vec<u32> = positions
        .iter()
        .map(|&(i, j)| (i * seq_len + j) as u32)
        .collect();
    let count = flat_index.len();
    let index = Tensor::from_vec(flat_index, count, logits.device())?;
    let flat = logits.reshape((batch * seq_len, num_labels))?;
    Ok(flat.index_select(&index, 0)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    const CLS: u32 = 101;

    fn sample_logits(batch: usize, seq_len: usize, labels: usize) -> Tensor {
        let values: Vec<f32> = (0..batch * seq_len * labels).map(|v| v as f32).collect();
        Tensor::from_vec(values, (batch, seq_len, labels), &Device::Cpu).unwrap()
    }

    #[test]
    fn positions_are_row_major() {
        let data = Tensor::new(&[[CLS, 5, CLS, 0], [7, CLS, 0, 0]], &Device::Cpu).unwrap();
        let positions = token_positions(&data, CLS).unwrap();
        assert_eq!(positions, vec![(0, 0), (0, 2), (1, 1)]);
    }

    #[test]
    fn one_row_per_match() {
        let data = Tensor::new(&[[CLS, 5, CLS, 0], [7, CLS, 0, 0]], &Device::Cpu).unwrap();
        let logits = sample_logits(2, 4, 3);
        let picked = token_logits(&data, &logits, CLS).unwrap();
        assert_eq!(picked.dims(), &[3, 3]);

        let rows = picked.to_vec2::<f32>().unwrap();
        // (0,0) -> flat 0, (0,2) -> flat 2, (1,1) -> flat 5
        assert_eq!(rows[0], vec![0.0, 1.0, 2.0]);
        assert_eq!(rows[1], vec![6.0, 7.0, 8.0]);
        assert_eq!(rows[2], vec![15.0, 16.0, 17.0]);
    }

    #[test]
    fn no_match_yields_empty_matrix() {
        let data = Tensor::new(&[[1u32, 2, 3]], &Device::Cpu).unwrap();
        let logits = sample_logits(1, 3, 4);
        let picked = token_logits(&data, &logits, CLS).unwrap();
        assert_eq!(picked.dims(), &[0, 4]);
    }

    #[test]
    fn shape_mismatch_rejected() {
        let data = Tensor::new(&[[CLS, 2, 3]], &Device::Cpu).unwrap();
        let logits = sample_logits(1, 4, 2);
        let err = token_logits(&data, &logits, CLS).unwrap_err();
        assert!(matches!(err, CtaError::ShapeMismatch(_)));
    }
}
