use anyhow::Result;
use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

/// One fixed-length training sample. Labels mirror the inputs; the model
/// shifts them for next-token prediction.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub input_ids: Vec<u32>,
    pub attention_mask: Vec<u32>,
    pub labels: Vec<u32>,
}

/// Bounded synthetic dataset; samples are generated on demand and depend
/// only on `(seed, index)`.
#[derive(Debug, Clone)]
pub struct RandomDataset {
    num_samples: usize,
    max_length: usize,
    vocab_size: usize,
    seed: u64,
}

impl RandomDataset {
    pub fn new(num_samples: usize, max_length: usize, vocab_size: usize, seed: u64) -> Result<Self> {
        if vocab_size == 0 || max_length == 0 {
            return Err(anyhow::anyhow!(
                "Synthetic dataset needs positive vocab_size and max_length, got {} and {}",
                vocab_size,
                max_length
            ));
        }
        Ok(Self { num_samples, max_length, vocab_size, seed })
    }

    pub fn len(&self) -> usize {
        self.num_samples
    }

    pub fn is_empty(&self) -> bool {
        self.num_samples == 0
    }

    pub fn get(&self, index: usize) -> Result<Sample> {
        if index >= self.num_samples {
            return Err(anyhow::anyhow!(
                "Sample index {} out of range for dataset of {}",
                index,
                self.num_samples
            ));
        }
        let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(index as u64));
        let input_ids: Vec<u32> = (0..self.max_length)
            .map(|_| rng.random_range(0..self.vocab_size as u32))
            .collect();
        Ok(Sample {
            attention_mask: vec![1; self.max_length],
            labels: input_ids.clone(),
            input_ids,
        })
    }
}

/// A collated batch, every tensor shaped `(batch_size, seq_len)`.
#[derive(Debug, Clone)]
pub struct Batch {
    pub input_ids: Tensor,
    pub attention_mask: Tensor,
    pub labels: Tensor,
}

impl Batch {
    pub fn collate(samples: &[Sample], device: &Device) -> Result<Self> {
        let batch_size = samples.len();
        let seq_len = samples.first().map(|s| s.input_ids.len()).unwrap_or(0);

        let mut input_ids = Vec::with_capacity(batch_size * seq_len);
        let mut attention_mask = Vec::with_capacity(batch_size * seq_len);
        let mut labels = Vec::with_capacity(batch_size * seq_len);
        for sample in samples {
            input_ids.extend_from_slice(&sample.input_ids);
            attention_mask.extend_from_slice(&sample.attention_mask);
            labels.extend_from_slice(&sample.labels);
        }

        Ok(Self {
            input_ids: Tensor::from_vec(input_ids, (batch_size, seq_len), device)?,
            attention_mask: Tensor::from_vec(attention_mask, (batch_size, seq_len), device)?,
            labels: Tensor::from_vec(labels, (batch_size, seq_len), device)?,
        })
    }

    pub fn batch_size(&self) -> usize {
        self.input_ids.dims()[0]
    }

    pub fn seq_len(&self) -> usize {
        self.input_ids.dims()[1]
    }

    /// Rows `start..start + len`, used to cut pipeline micro-batches.
    pub fn narrow(&self, start: usize, len: usize) -> Result<Self> {
        Ok(Self {
            input_ids: self.input_ids.narrow(0, start, len)?,
            attention_mask: self.attention_mask.narrow(0, start, len)?,
            labels: self.labels.narrow(0, start, len)?,
        })
    }
}

/// Rank-sharded loader over a [`RandomDataset`].
///
/// Every rank shuffles with the same seed and keeps every `dp_size`-th index
/// starting at its data-parallel rank, so shards are disjoint. The index list
/// is padded by wrapping around until it divides evenly across ranks.
pub struct DataLoader {
    dataset: RandomDataset,
    indices: Vec<usize>,
    batch_size: usize,
    drop_last: bool,
    device: Device,
}

impl DataLoader {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        dataset: RandomDataset,
        batch_size: usize,
        shuffle: bool,
        drop_last: bool,
        seed: u64,
        dp_rank: usize,
        dp_size: usize,
        device: &Device,
    ) -> Result<Self> {
        if batch_size == 0 {
            return Err(anyhow::anyhow!("batch_size must be positive"));
        }
        if dp_size == 0 || dp_rank >= dp_size {
            return Err(anyhow::anyhow!("Invalid data parallel rank {} of {}", dp_rank, dp_size));
        }

        let mut all: Vec<usize> = (0..dataset.len()).collect();
        if shuffle {
            let mut rng = StdRng::seed_from_u64(seed);
            all.shuffle(&mut rng);
        }
        if !all.is_empty() {
            let padded_len = all.len().div_ceil(dp_size) * dp_size;
            let mut wrap = 0;
            while all.len() < padded_len {
                all.push(all[wrap]);
                wrap += 1;
            }
        }
        let indices: Vec<usize> = all.into_iter().skip(dp_rank).step_by(dp_size).collect();

        Ok(Self {
            dataset,
            indices,
            batch_size,
            drop_last,
            device: device.clone(),
        })
    }

    /// Number of batches one epoch yields on this rank.
    pub fn len(&self) -> usize {
        if self.drop_last {
            self.indices.len() / self.batch_size
        } else {
            self.indices.len().div_ceil(self.batch_size)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn num_samples(&self) -> usize {
        self.indices.len()
    }

    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    pub fn iter(&self) -> DataLoaderIter<'_> {
        DataLoaderIter { loader: self, batch: 0 }
    }
}

pub struct DataLoaderIter<'a> {
    loader: &'a DataLoader,
    batch: usize,
}

impl Iterator for DataLoaderIter<'_> {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.batch >= self.loader.len() {
            return None;
        }
        let start = self.batch * self.loader.batch_size;
        let end = (start + self.loader.batch_size).min(self.loader.indices.len());
        self.batch += 1;

        let samples: Result<Vec<Sample>> = self.loader.indices[start..end]
            .iter()
            .map(|&index| self.loader.dataset.get(index))
            .collect();
        Some(samples.and_then(|samples| Batch::collate(&samples, &self.loader.device)))
    }
}
