use crate::{PureResult, Tensor, TensorError};
use rand::rngs::StdRng;
use rand::{seq::SliceRandom, SeedableRng};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread;

/// One training example: a full-resolution image pair, the cropped patch pair
/// fed to the network and the four patch corners in image coordinates.
///
/// Images are `(1, channels * h * w)` rows in channel-major order; `points`
/// is a `(1, 8)` row of corner coordinates flattened as
/// `[x0, y0, x1, y1, x2, y2, x3, y3]`.
#[derive(Clone, Debug)]
pub struct HomographySample {
    pub img_a: Tensor,
    pub img_b: Tensor,
    pub patch_a: Tensor,
    pub patch_b: Tensor,
    pub points: Tensor,
}

impl HomographySample {
    pub fn new(
        img_a: Tensor,
        img_b: Tensor,
        patch_a: Tensor,
        patch_b: Tensor,
        points: Tensor,
    ) -> PureResult<Self> {
        if img_a.shape() != img_b.shape() {
            return Err(TensorError::ShapeMismatch {
                left: img_a.shape(),
                right: img_b.shape(),
            });
        }
        if patch_a.shape() != patch_b.shape() {
            return Err(TensorError::ShapeMismatch {
                left: patch_a.shape(),
                right: patch_b.shape(),
            });
        }
        if points.shape() != (1, 8) {
            return Err(TensorError::ShapeMismatch {
                left: points.shape(),
                right: (1, 8),
            });
        }
        Ok(Self {
            img_a,
            img_b,
            patch_a,
            patch_b,
            points,
        })
    }
}

/// A batch of samples with every field row-stacked along the batch axis.
#[derive(Clone, Debug)]
pub struct HomographyBatch {
    pub img_a: Tensor,
    pub img_b: Tensor,
    pub patch_a: Tensor,
    pub patch_b: Tensor,
    pub points: Tensor,
}

impl HomographyBatch {
    /// Number of samples stacked in the batch.
    pub fn batch_size(&self) -> usize {
        self.points.shape().0
    }
}

fn stack_batch(batch: &[HomographySample]) -> PureResult<HomographyBatch> {
    let img_a: Vec<_> = batch.iter().map(|s| s.img_a.clone()).collect();
    let img_b: Vec<_> = batch.iter().map(|s| s.img_b.clone()).collect();
    let patch_a: Vec<_> = batch.iter().map(|s| s.patch_a.clone()).collect();
    let patch_b: Vec<_> = batch.iter().map(|s| s.patch_b.clone()).collect();
    let points: Vec<_> = batch.iter().map(|s| s.points.clone()).collect();
    Ok(HomographyBatch {
        img_a: Tensor::cat_rows(&img_a)?,
        img_b: Tensor::cat_rows(&img_b)?,
        patch_a: Tensor::cat_rows(&patch_a)?,
        patch_b: Tensor::cat_rows(&patch_b)?,
        points: Tensor::cat_rows(&points)?,
    })
}

/// In-memory collection of [`HomographySample`]s.
#[derive(Clone, Debug, Default)]
pub struct HomographyDataset {
    samples: Vec<HomographySample>,
}

impl HomographyDataset {
    /// Creates an empty dataset.
    pub fn new() -> Self {
        Self {
            samples: Vec::new(),
        }
    }

    /// Builds a dataset from an owning vector.
    pub fn from_vec(samples: Vec<HomographySample>) -> Self {
        Self { samples }
    }

    /// Appends a new sample to the dataset.
    pub fn push(&mut self, sample: HomographySample) {
        self.samples.push(sample);
    }

    /// Returns the number of samples stored in the dataset.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Returns `true` when no samples are registered.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Returns an owning iterator that yields cloned samples.
    pub fn iter(&self) -> impl Iterator<Item = HomographySample> + '_ {
        self.samples.iter().cloned()
    }

    /// Splits the dataset into two disjoint parts after a deterministic
    /// shuffle. The first part holds `fraction` of the samples (rounded
    /// down), the second the rest.
    pub fn random_split(&self, fraction: f64, seed: u64) -> PureResult<(Self, Self)> {
        if !(0.0..=1.0).contains(&fraction) || !fraction.is_finite() {
            return Err(TensorError::InvalidValue {
                label: "split_fraction",
            });
        }
        let mut indices: Vec<usize> = (0..self.samples.len()).collect();
        let mut rng = StdRng::seed_from_u64(seed);
        indices.shuffle(&mut rng);
        let pivot = (self.samples.len() as f64 * fraction) as usize;
        let first = indices[..pivot]
            .iter()
            .map(|&idx| self.samples[idx].clone())
            .collect();
        let second = indices[pivot..]
            .iter()
            .map(|&idx| self.samples[idx].clone())
            .collect();
        Ok((Self::from_vec(first), Self::from_vec(second)))
    }

    /// Consumes the dataset and turns it into a streaming [`HomographyLoader`].
    pub fn into_loader(self) -> HomographyLoader {
        HomographyLoader::new(self.samples.into())
    }

    /// Creates a streaming [`HomographyLoader`] by cloning the underlying
    /// samples, keeping the dataset reusable across epochs.
    pub fn loader(&self) -> HomographyLoader {
        HomographyLoader::new(self.samples.clone().into())
    }
}

fn default_order(len: usize) -> Arc<Vec<usize>> {
    Arc::new((0..len).collect())
}

fn chunk_indices(order: &[usize], batch_size: usize) -> impl Iterator<Item = &[usize]> {
    order.chunks(batch_size.max(1))
}

#[derive(Clone)]
struct ImmediateBatches {
    samples: Arc<[HomographySample]>,
    order: Arc<Vec<usize>>,
    batch_size: usize,
    position: usize,
}

impl ImmediateBatches {
    fn new(samples: Arc<[HomographySample]>, order: Arc<Vec<usize>>, batch_size: usize) -> Self {
        Self {
            samples,
            order,
            batch_size: batch_size.max(1),
            position: 0,
        }
    }
}

impl Iterator for ImmediateBatches {
    type Item = PureResult<HomographyBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.position >= self.order.len() {
            return None;
        }
        let start = self.position;
        let end = (self.position + self.batch_size).min(self.order.len());
        self.position = end;
        let indices = &self.order[start..end];
        if indices.is_empty() {
            return None;
        }
        let mut batch = Vec::with_capacity(indices.len());
        for &idx in indices {
            batch.push(self.samples[idx].clone());
        }
        Some(stack_batch(&batch))
    }
}

struct PrefetchBatches {
    rx: Receiver<Option<PureResult<HomographyBatch>>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl PrefetchBatches {
    fn spawn(
        samples: Arc<[HomographySample]>,
        order: Arc<Vec<usize>>,
        batch_size: usize,
        depth: usize,
    ) -> Self {
        let (tx, rx) = mpsc::sync_channel(depth.max(1));
        let handle = thread::spawn(move || {
            for indices in chunk_indices(&order, batch_size) {
                let mut batch = Vec::with_capacity(indices.len());
                for &idx in indices {
                    batch.push(samples[idx].clone());
                }
                if tx.send(Some(stack_batch(&batch))).is_err() {
                    return;
                }
            }
            let _ = tx.send(None);
        });
        Self {
            rx,
            handle: Some(handle),
        }
    }
}

impl Iterator for PrefetchBatches {
    type Item = PureResult<HomographyBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        self.rx.recv().ok()?
    }
}

impl Drop for PrefetchBatches {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

enum LoaderBackend {
    Immediate(ImmediateBatches),
    Prefetch(PrefetchBatches),
}

pub struct HomographyBatches {
    backend: LoaderBackend,
}

impl Iterator for HomographyBatches {
    type Item = PureResult<HomographyBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        match &mut self.backend {
            LoaderBackend::Immediate(iter) => iter.next(),
            LoaderBackend::Prefetch(iter) => iter.next(),
        }
    }
}

/// Streaming batch producer with builder-style configuration:
/// `.shuffle(seed).batched(n).prefetch(depth)`.
#[derive(Clone)]
pub struct HomographyLoader {
    samples: Arc<[HomographySample]>,
    order: Arc<Vec<usize>>,
    batch_size: usize,
    prefetch: usize,
}

impl HomographyLoader {
    fn new(samples: Arc<[HomographySample]>) -> Self {
        let len = samples.len();
        Self {
            samples,
            order: default_order(len),
            batch_size: 1,
            prefetch: 0,
        }
    }

    /// Returns the number of individual samples referenced by the loader.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Returns `true` when the underlying dataset holds no samples.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Returns the configured batch size.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Returns the configured prefetch depth.
    pub fn prefetch_depth(&self) -> usize {
        self.prefetch
    }

    /// Creates a new loader with the same dataset but a deterministically
    /// shuffled visitation order using the provided seed.
    pub fn shuffle(mut self, seed: u64) -> Self {
        let mut indices: Vec<usize> = (0..self.samples.len()).collect();
        let mut rng = StdRng::seed_from_u64(seed);
        indices.shuffle(&mut rng);
        self.order = Arc::new(indices);
        self
    }

    /// Updates the loader to emit batches of `batch_size` samples.
    pub fn batched(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Enables background prefetching with the given channel depth.
    pub fn prefetch(mut self, depth: usize) -> Self {
        self.prefetch = depth;
        self
    }

    /// Creates a new iterator over the configured batches.
    pub fn iter(&self) -> HomographyBatches {
        self.clone().into_iter()
    }
}

impl IntoIterator for HomographyLoader {
    type Item = PureResult<HomographyBatch>;
    type IntoIter = HomographyBatches;

    fn into_iter(self) -> Self::IntoIter {
        let backend = if self.prefetch > 0 {
            LoaderBackend::Prefetch(PrefetchBatches::spawn(
                self.samples,
                self.order,
                self.batch_size,
                self.prefetch,
            ))
        } else {
            LoaderBackend::Immediate(ImmediateBatches::new(
                self.samples,
                self.order,
                self.batch_size,
            ))
        };
        HomographyBatches { backend }
    }
}

/// Crops a channel-major patch out of a flattened image row.
pub fn crop_patch(
    image: &Tensor,
    channels: usize,
    image_hw: (usize, usize),
    origin: (usize, usize),
    patch_hw: (usize, usize),
) -> PureResult<Tensor> {
    let (h, w) = image_hw;
    let (ph, pw) = patch_hw;
    let (oy, ox) = origin;
    if image.shape() != (1, channels * h * w) {
        return Err(TensorError::ShapeMismatch {
            left: image.shape(),
            right: (1, channels * h * w),
        });
    }
    if oy + ph > h || ox + pw > w {
        return Err(TensorError::InvalidDimensions {
            rows: oy + ph,
            cols: ox + pw,
        });
    }
    let data = image.data();
    let mut out = Vec::with_capacity(channels * ph * pw);
    for c in 0..channels {
        let channel_offset = c * h * w;
        for y in 0..ph {
            let row_start = channel_offset + (oy + y) * w + ox;
            out.extend_from_slice(&data[row_start..row_start + pw]);
        }
    }
    Tensor::from_vec(1, channels * ph * pw, out)
}

/// Flattens a patch crop box into the `(1, 8)` corner row expected by
/// [`HomographySample`]: top-left, top-right, bottom-right, bottom-left.
pub fn corner_points(origin: (usize, usize), patch_hw: (usize, usize)) -> PureResult<Tensor> {
    let (oy, ox) = origin;
    let (ph, pw) = patch_hw;
    let (x0, y0) = (ox as f32, oy as f32);
    let (x1, y1) = ((ox + pw - 1) as f32, (oy + ph - 1) as f32);
    Tensor::from_vec(1, 8, vec![x0, y0, x1, y0, x1, y1, x0, y1])
}

/// Builds `count` samples where both views are the same random image and
/// both patches are the same centred crop. A zero displacement already
/// aligns such pairs, which makes them useful smoke-test material.
pub fn synthetic_identity_pairs(
    count: usize,
    channels: usize,
    image_hw: (usize, usize),
    patch_hw: (usize, usize),
    seed: u64,
) -> PureResult<HomographyDataset> {
    let (h, w) = image_hw;
    let (ph, pw) = patch_hw;
    if ph > h || pw > w {
        return Err(TensorError::InvalidDimensions { rows: ph, cols: pw });
    }
    let origin = ((h - ph) / 2, (w - pw) / 2);
    let points = corner_points(origin, patch_hw)?;
    let mut dataset = HomographyDataset::new();
    for index in 0..count {
        let image = Tensor::random_uniform(
            1,
            channels * h * w,
            0.0,
            1.0,
            Some(seed.wrapping_add(index as u64)),
        )?;
        let patch = crop_patch(&image, channels, image_hw, origin, patch_hw)?;
        dataset.push(HomographySample::new(
            image.clone(),
            image,
            patch.clone(),
            patch,
            points.clone(),
        )?);
    }
    Ok(dataset)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toy_dataset(count: usize) -> HomographyDataset {
        synthetic_identity_pairs(count, 1, (8, 8), (4, 4), 7).unwrap()
    }

    #[test]
    fn split_is_disjoint_and_deterministic() {
        let dataset = toy_dataset(10);
        let (train, valid) = dataset.random_split(0.8, 42).unwrap();
        assert_eq!(train.len(), 8);
        assert_eq!(valid.len(), 2);
        let (train_again, _) = dataset.random_split(0.8, 42).unwrap();
        for (a, b) in train.iter().zip(train_again.iter()) {
            assert_eq!(a.img_a, b.img_a);
        }
    }

    #[test]
    fn loader_batches_cover_every_sample() {
        let dataset = toy_dataset(5);
        let batches: Vec<_> = dataset
            .loader()
            .batched(2)
            .iter()
            .collect::<PureResult<_>>()
            .unwrap();
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].batch_size(), 2);
        assert_eq!(batches[2].batch_size(), 1);
        assert_eq!(batches[0].points.shape(), (2, 8));
    }

    #[test]
    fn prefetch_loader_matches_immediate_order() {
        let dataset = toy_dataset(6);
        let immediate: Vec<_> = dataset
            .loader()
            .shuffle(3)
            .batched(2)
            .iter()
            .collect::<PureResult<_>>()
            .unwrap();
        let prefetched: Vec<_> = dataset
            .loader()
            .shuffle(3)
            .batched(2)
            .prefetch(2)
            .iter()
            .collect::<PureResult<_>>()
            .unwrap();
        assert_eq!(immediate.len(), prefetched.len());
        for (a, b) in immediate.iter().zip(prefetched.iter()) {
            assert_eq!(a.patch_a, b.patch_a);
        }
    }

    #[test]
    fn crop_patch_extracts_channel_major_window() {
        let image = Tensor::from_fn(1, 2 * 4 * 4, |_r, c| c as f32).unwrap();
        let patch = crop_patch(&image, 2, (4, 4), (1, 1), (2, 2)).unwrap();
        assert_eq!(
            patch.data(),
            &[5.0, 6.0, 9.0, 10.0, 21.0, 22.0, 25.0, 26.0]
        );
    }

    #[test]
    fn corner_points_trace_the_crop_box() {
        let points = corner_points((2, 3), (4, 4)).unwrap();
        assert_eq!(
            points.data(),
            &[3.0, 2.0, 6.0, 2.0, 6.0, 5.0, 3.0, 5.0]
        );
    }
}
