//! # Sharded Dataset View
//!
//! Splits aligned examples into one contiguous, disjoint shard per worker.
//! Shards share the underlying storage read-only, so they are cheap to clone
//! and can be moved onto worker threads.

use std::ops::Range;
use std::sync::Arc;

use candle_core::{Device, Tensor};

use crate::align::AlignedExample;
use crate::error::{CoreError, Result};

/// A logical dataset partitioned across `num_workers` workers.
#[derive(Debug, Clone)]
pub struct ShardedDataset {
    examples: Arc<[AlignedExample]>,
    bounds: Vec<Range<usize>>,
}

impl ShardedDataset {
    /// Partition `examples` into near-equal shards: the first
    /// `len % num_workers` shards hold one extra example.
    pub fn new(examples: Vec<AlignedExample>, num_workers: usize) -> Result<Self> {
        if num_workers == 0 {
            return Err(CoreError::InvalidConfig("num_workers must be at least 1".into()));
        }

        let total = examples.len();
        let base = total / num_workers;
        let extra = total % num_workers;

        let mut bounds = Vec::with_capacity(num_workers);
        let mut start = 0;
        for worker in 0..num_workers {
            let size = base + usize::from(worker < extra);
            bounds.push(start..start + size);
            start += size;
        }

        Ok(Self {
            examples: examples.into(),
            bounds,
        })
    }

    pub fn num_workers(&self) -> usize {
        self.bounds.len()
    }

    /// Total number of examples across all shards.
    pub fn len(&self) -> usize {
        self.examples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }

    /// The shard of one worker. Fails if it holds no examples.
    pub fn shard(&self, worker: usize) -> Result<Shard> {
        let range = self.bounds.get(worker).cloned().ok_or_else(|| {
            CoreError::InvalidConfig(format!(
                "worker {worker} out of range for {} shards",
                self.bounds.len()
            ))
        })?;
        if range.is_empty() {
            return Err(CoreError::EmptyShard { worker });
        }
        Ok(Shard {
            worker,
            examples: Arc::clone(&self.examples),
            range,
        })
    }

    /// All shards in worker order.
    pub fn shards(&self) -> Result<Vec<Shard>> {
        (0..self.num_workers()).map(|w| self.shard(w)).collect()
    }
}

/// Read-only view over one worker's examples.
#[derive(Debug, Clone)]
pub struct Shard {
    worker: usize,
    examples: Arc<[AlignedExample]>,
    range: Range<usize>,
}

impl Shard {
    /// Rank of the worker owning this shard.
    pub fn worker(&self) -> usize {
        self.worker
    }

    pub fn len(&self) -> usize {
        self.range.len()
    }

    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }

    pub fn examples(&self) -> &[AlignedExample] {
        &self.examples[self.range.clone()]
    }

    /// Batch boundaries, relative to the shard. The last batch may be short.
    pub fn batch_plan(&self, batch_size: usize) -> Result<Vec<Range<usize>>> {
        if batch_size == 0 {
            return Err(CoreError::InvalidConfig("batch_size must be at least 1".into()));
        }
        let len = self.len();
        Ok((0..len)
            .step_by(batch_size)
            .map(|start| start..(start + batch_size).min(len))
            .collect())
    }

    /// The batch covering `range` of a [`Shard::batch_plan`].
    pub fn batch(&self, range: Range<usize>) -> Batch<'_> {
        Batch {
            examples: &self.examples()[range],
        }
    }

    /// Iterate the shard once in order. Calling again restarts from the top.
    pub fn batches(&self, batch_size: usize) -> Result<Batches<'_>> {
        let plan = self.batch_plan(batch_size)?;
        Ok(Batches {
            shard: self,
            plan: plan.into_iter(),
        })
    }
}

/// Finite iterator over the batches of a shard.
pub struct Batches<'a> {
    shard: &'a Shard,
    plan: std::vec::IntoIter<Range<usize>>,
}

impl<'a> Iterator for Batches<'a> {
    type Item = Batch<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let range = self.plan.next()?;
        Some(self.shard.batch(range))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.plan.size_hint()
    }
}

impl ExactSizeIterator for Batches<'_> {}

/// A contiguous slice of examples.
#[derive(Debug, Clone, Copy)]
pub struct Batch<'a> {
    examples: &'a [AlignedExample],
}

/// Tensors of a batch, each `[batch, seq_len]`.
#[derive(Debug)]
pub struct BatchTensors {
    /// `u32` token ids.
    pub input_ids: Tensor,
    /// `u32`, 1 for attended positions.
    pub attention_mask: Tensor,
    /// `i64` label ids, `IGNORE_INDEX` where unlabeled.
    pub labels: Tensor,
}

impl<'a> Batch<'a> {
    pub fn examples(&self) -> &'a [AlignedExample] {
        self.examples
    }

    pub fn len(&self) -> usize {
        self.examples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }

    /// Label ids of every position, row-major.
    pub fn label_ids(self) -> impl Iterator<Item = i64> + 'a {
        self.examples.iter().flat_map(|e| e.label_ids.iter().copied())
    }

    /// Stack the batch into tensors on `device`.
    pub fn to_tensors(&self, device: &Device) -> Result<BatchTensors> {
        let rows = self.examples.len();
        let seq_len = self.examples.first().map_or(0, AlignedExample::len);
        if let Some(bad) = self.examples.iter().find(|e| e.len() != seq_len) {
            return Err(CoreError::InvalidConfig(format!(
                "batch mixes sequence lengths {seq_len} and {}",
                bad.len()
            )));
        }

        let mut ids = Vec::with_capacity(rows * seq_len);
        let mut mask = Vec::with_capacity(rows * seq_len);
        let mut labels = Vec::with_capacity(rows * seq_len);
        for example in self.examples {
            ids.extend_from_slice(&example.token_ids);
            mask.extend_from_slice(&example.attention_mask);
            labels.extend_from_slice(&example.label_ids);
        }

        Ok(BatchTensors {
            input_ids: Tensor::from_vec(ids, (rows, seq_len), device)?,
            attention_mask: Tensor::from_vec(mask, (rows, seq_len), device)?,
            labels: Tensor::from_vec(labels, (rows, seq_len), device)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labels::IGNORE_INDEX;

    fn example(id: u32) -> AlignedExample {
        AlignedExample {
            token_ids: vec![id, id],
            attention_mask: vec![1, 1],
            label_ids: vec![IGNORE_INDEX, 2],
        }
    }

    fn examples(n: u32) -> Vec<AlignedExample> {
        (0..n).map(example).collect()
    }

    fn ids(shard: &Shard) -> Vec<u32> {
        shard.examples().iter().map(|e| e.token_ids[0]).collect()
    }

    #[test]
    fn test_shards_are_disjoint_and_cover() {
        let dataset = ShardedDataset::new(examples(10), 3).unwrap();
        let shards = dataset.shards().unwrap();
        assert_eq!(ids(&shards[0]), vec![0, 1, 2, 3]);
        assert_eq!(ids(&shards[1]), vec![4, 5, 6]);
        assert_eq!(ids(&shards[2]), vec![7, 8, 9]);

        let all: Vec<u32> = shards.iter().flat_map(ids).collect();
        assert_eq!(all, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_sizes_differ_by_at_most_one() {
        for n in 0..20 {
            for w in 1..6 {
                let dataset = ShardedDataset::new(examples(n), w).unwrap();
                let sizes: Vec<_> = dataset.bounds.iter().map(|r| r.len()).collect();
                let max = sizes.iter().max().unwrap();
                let min = sizes.iter().min().unwrap();
                assert!(max - min <= 1);
                assert_eq!(sizes.iter().sum::<usize>(), n as usize);
            }
        }
    }

    #[test]
    fn test_empty_shard_error() {
        let dataset = ShardedDataset::new(examples(2), 3).unwrap();
        assert!(dataset.shard(1).is_ok());
        assert!(matches!(
            dataset.shard(2),
            Err(CoreError::EmptyShard { worker: 2 })
        ));
        assert!(dataset.shards().is_err());
        assert!(matches!(dataset.shard(5), Err(CoreError::InvalidConfig(_))));
    }

    #[test]
    fn test_zero_workers_rejected() {
        assert!(ShardedDataset::new(examples(4), 0).is_err());
    }

    #[test]
    fn test_batches_restartable() {
        let dataset = ShardedDataset::new(examples(7), 1).unwrap();
        let shard = dataset.shard(0).unwrap();

        let sizes: Vec<_> = shard.batches(3).unwrap().map(|b| b.len()).collect();
        assert_eq!(sizes, vec![3, 3, 1]);

        let again: Vec<_> = shard.batches(3).unwrap().map(|b| b.len()).collect();
        assert_eq!(sizes, again);
        assert_eq!(shard.batches(3).unwrap().len(), 3);
        assert!(shard.batches(0).is_err());
    }

    #[test]
    fn test_to_tensors() {
        let dataset = ShardedDataset::new(examples(3), 1).unwrap();
        let shard = dataset.shard(0).unwrap();
        let batch = shard.batches(2).unwrap().next().unwrap();
        let tensors = batch.to_tensors(&Device::Cpu).unwrap();

        assert_eq!(tensors.input_ids.dims(), &[2, 2]);
        assert_eq!(
            tensors.labels.to_vec2::<i64>().unwrap(),
            vec![vec![IGNORE_INDEX, 2], vec![IGNORE_INDEX, 2]]
        );
        assert_eq!(batch.label_ids().collect::<Vec<_>>(), vec![IGNORE_INDEX, 2, IGNORE_INDEX, 2]);
    }
}
