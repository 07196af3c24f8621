// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Transfer-learning image classifier built on `burn`
//!
//! A convolutional feature extractor (`Backbone`) whose classification head
//! is replaced by `Linear(relu) -> Linear(softmax)`. Only the last
//! `unfrozen_layers` backbone layers receive gradients; the frozen prefix is
//! marked `no_grad` so Adam never sees it.
//!
//! Backbone layers, in order: the 3x3 convolution stem (ReLU + adaptive
//! average pooling), then the dense ReLU blocks.
//!
//! Weights are persisted as burn records (`BinBytesRecorder`) wrapped in a
//! serde struct that also carries the architecture needed to rebuild the
//! modules before the record is loaded.

use crate::classifiers::{Classifier, EpochStats, TrainingSummary};
use crate::config::{BackboneConfig, ImageConfig};
use crate::error::{PipelineError, Result};
use burn::backend::{Autodiff, NdArray};
use burn::module::{AutodiffModule, Module, Param};
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::loss::CrossEntropyLossConfig;
use burn::nn::pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig};
use burn::nn::{Linear, LinearConfig, PaddingConfig2d};
use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn::record::{BinBytesRecorder, FullPrecisionSettings, Recorder};
use burn::tensor::activation::{relu, softmax};
use burn::tensor::backend::Backend;
use burn::tensor::{ElementConversion, Int, Tensor, TensorData};
use ndarray::{s, Array2, Array4, Axis};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// CPU backend used for inference
type Cpu = NdArray<f32>;
/// Backend the modules live on; `valid()` strips autodiff for inference
type TrainBackend = Autodiff<Cpu>;

/// Pixel values arrive as 0..=255
const INPUT_SCALE: f64 = 1.0 / 255.0;
const PREDICT_BATCH: usize = 64;
const CHANNELS: usize = 3;

fn device() -> <Cpu as Backend>::Device {
    Default::default()
}

/// Glorot-uniform values from the seeded stream
fn glorot<B: Backend, const D: usize>(
    shape: [usize; D],
    fan_in: usize,
    fan_out: usize,
    rng: &mut ChaCha8Rng,
    device: &B::Device,
) -> Param<Tensor<B, D>> {
    let limit = (6.0 / (fan_in + fan_out) as f64).sqrt();
    let len: usize = shape.iter().product();
    let values: Vec<f32> = (0..len).map(|_| rng.gen_range(-limit..limit) as f32).collect();
    Param::from_tensor(Tensor::from_data(TensorData::new(values, shape), device))
}

fn zero_bias<B: Backend>(len: usize, device: &B::Device) -> Option<Param<Tensor<B, 1>>> {
    Some(Param::from_tensor(Tensor::zeros([len], device)))
}

fn dense<B: Backend>(n_in: usize, n_out: usize, rng: &mut ChaCha8Rng, device: &B::Device) -> Linear<B> {
    let mut layer = LinearConfig::new(n_in, n_out).init(device);
    layer.weight = glorot([n_in, n_out], n_in, n_out, rng, device);
    layer.bias = zero_bias(n_out, device);
    layer
}

/// What is needed to rebuild the extractor modules
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackboneShape {
    pub conv_filters: usize,
    pub pool_grid: usize,
    pub block_widths: Vec<usize>,
    /// (height, width) the extractor was built for
    pub input_hw: (usize, usize),
}

impl BackboneShape {
    fn pooled_len(&self) -> usize {
        self.conv_filters * self.pool_grid * self.pool_grid
    }

    pub fn feature_len(&self) -> usize {
        self.block_widths.last().copied().unwrap_or_else(|| self.pooled_len())
    }
}

#[derive(Module, Debug)]
pub struct FeatureExtractor<B: Backend> {
    stem: Conv2d<B>,
    pool: AdaptiveAvgPool2d,
    blocks: Vec<Linear<B>>,
}

impl<B: Backend> FeatureExtractor<B> {
    fn init(shape: &BackboneShape, rng: &mut ChaCha8Rng, device: &B::Device) -> Self {
        let filters = shape.conv_filters;
        let mut stem = Conv2dConfig::new([CHANNELS, filters], [3, 3])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .init(device);
        stem.weight = glorot([filters, CHANNELS, 3, 3], 9 * CHANNELS, filters, rng, device);
        stem.bias = zero_bias(filters, device);

        let mut n_in = shape.pooled_len();
        let blocks = shape
            .block_widths
            .iter()
            .map(|&width| {
                let layer = dense(n_in, width, rng, device);
                n_in = width;
                layer
            })
            .collect();

        Self {
            stem,
            pool: AdaptiveAvgPool2dConfig::new([shape.pool_grid, shape.pool_grid]).init(),
            blocks,
        }
    }

    /// `images` is (batch, channels, height, width)
    fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let [batch, _, _, _] = images.dims();
        let x = self.pool.forward(relu(self.stem.forward(images)));
        let [_, filters, grid_h, grid_w] = x.dims();
        let mut x = x.reshape([batch, filters * grid_h * grid_w]);
        for block in &self.blocks {
            x = relu(block.forward(x));
        }
        x
    }

    /// Stop gradients for every layer before `first_trainable` (0 = stem)
    fn freeze_before(self, first_trainable: usize) -> Self {
        let stem = if first_trainable > 0 { self.stem.no_grad() } else { self.stem };
        let blocks = self
            .blocks
            .into_iter()
            .enumerate()
            .map(|(i, block)| if i + 1 < first_trainable { block.no_grad() } else { block })
            .collect();
        Self {
            stem,
            pool: self.pool,
            blocks,
        }
    }
}

#[derive(Module, Debug)]
pub struct Head<B: Backend> {
    hidden: Linear<B>,
    output: Linear<B>,
}

impl<B: Backend> Head<B> {
    /// Logits; softmax is applied by the loss and at prediction time
    fn forward(&self, features: Tensor<B, 2>) -> Tensor<B, 2> {
        self.output.forward(relu(self.hidden.forward(features)))
    }
}

#[derive(Module, Debug)]
pub struct TransferNet<B: Backend> {
    backbone: FeatureExtractor<B>,
    head: Head<B>,
}

impl<B: Backend> TransferNet<B> {
    fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        self.head.forward(self.backbone.forward(images))
    }
}

fn record_bytes<M: Module<TrainBackend>>(module: &M) -> std::result::Result<Vec<u8>, String> {
    let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
    Recorder::<TrainBackend>::record(&recorder, module.clone().into_record(), ()).map_err(|e| format!("{:?}", e))
}

fn load_bytes<M: Module<TrainBackend>>(template: M, bytes: Vec<u8>) -> std::result::Result<M, String> {
    let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
    let record: M::Record =
        Recorder::<TrainBackend>::load(&recorder, bytes, &device()).map_err(|e| format!("{:?}", e))?;
    Ok(template.load_record(record))
}

/// Images (n, height, width, channels) scaled to 0..1 as (n, channels, height, width)
fn to_tensor<B: Backend>(x: &Array4<f64>, device: &B::Device) -> Tensor<B, 4> {
    let (n, height, width, channels) = x.dim();
    let values: Vec<f32> = x.iter().map(|v| (v * INPUT_SCALE) as f32).collect();
    Tensor::<B, 4>::from_data(TensorData::new(values, [n, height, width, channels]), device).permute([0, 3, 1, 2])
}

/// Pretrained-style feature extractor; persisted on its own so it can be reused
#[derive(Debug, Clone)]
pub struct Backbone {
    net: FeatureExtractor<TrainBackend>,
    shape: BackboneShape,
}

#[derive(Serialize, Deserialize)]
struct StoredBackbone {
    shape: BackboneShape,
    record: Vec<u8>,
}

impl Backbone {
    /// Seeded initialisation of the configured architecture
    pub fn initialise(config: &BackboneConfig, target_size: (u32, u32), seed: u64) -> Self {
        let shape = BackboneShape {
            conv_filters: config.conv_filters,
            pool_grid: config.pool_grid,
            block_widths: config.block_widths.clone(),
            input_hw: (target_size.1 as usize, target_size.0 as usize),
        };
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        Self {
            net: FeatureExtractor::init(&shape, &mut rng, &device()),
            shape,
        }
    }

    /// Stem plus dense blocks
    pub fn n_layers(&self) -> usize {
        1 + self.shape.block_widths.len()
    }

    pub fn shape(&self) -> &BackboneShape {
        &self.shape
    }

    pub fn input_hw(&self) -> (usize, usize) {
        self.shape.input_hw
    }

    /// Reject weights built for a different image size
    pub fn check_input(&self, target_size: (u32, u32)) -> Result<()> {
        let wanted = (target_size.1 as usize, target_size.0 as usize);
        if wanted != self.shape.input_hw {
            return Err(PipelineError::ShapeMismatch {
                expected: format!("backbone input {}x{}", self.shape.input_hw.1, self.shape.input_hw.0),
                actual: format!("configured target size {}x{}", target_size.0, target_size.1),
            });
        }
        Ok(())
    }
}

impl Serialize for Backbone {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let record = record_bytes(&self.net).map_err(serde::ser::Error::custom)?;
        StoredBackbone {
            shape: self.shape.clone(),
            record,
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Backbone {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let stored = StoredBackbone::deserialize(deserializer)?;
        let template = FeatureExtractor::init(&stored.shape, &mut ChaCha8Rng::seed_from_u64(0), &device());
        let net = load_bytes(template, stored.record).map_err(serde::de::Error::custom)?;
        Ok(Self {
            net,
            shape: stored.shape,
        })
    }
}

/// Optimisation settings carried with the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferSettings {
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    pub unfrozen_layers: usize,
    pub head_units: usize,
    pub seed: u64,
}

impl From<&ImageConfig> for TransferSettings {
    fn from(config: &ImageConfig) -> Self {
        Self {
            epochs: config.epochs,
            batch_size: config.batch_size,
            learning_rate: config.learning_rate,
            unfrozen_layers: config.unfrozen_layers,
            head_units: config.backbone.head_units,
            seed: config.seed,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransferClassifier {
    net: TransferNet<TrainBackend>,
    shape: BackboneShape,
    n_classes: usize,
    settings: TransferSettings,
}

#[derive(Serialize, Deserialize)]
struct StoredClassifier {
    shape: BackboneShape,
    n_classes: usize,
    settings: TransferSettings,
    record: Vec<u8>,
}

impl TransferClassifier {
    /// Attach a fresh head for `n_classes` to `backbone`
    pub fn new(backbone: Backbone, n_classes: usize, settings: TransferSettings) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(settings.seed.wrapping_add(1));
        let feature_len = backbone.shape.feature_len();
        let head = Head {
            hidden: dense(feature_len, settings.head_units, &mut rng, &device()),
            output: dense(settings.head_units, n_classes, &mut rng, &device()),
        };
        Self {
            net: TransferNet {
                backbone: backbone.net,
                head,
            },
            shape: backbone.shape,
            n_classes,
            settings,
        }
    }

    /// The (possibly fine-tuned) feature extractor, ready to persist
    pub fn backbone(&self) -> Backbone {
        Backbone {
            net: self.net.backbone.clone(),
            shape: self.shape.clone(),
        }
    }

    pub fn settings(&self) -> &TransferSettings {
        &self.settings
    }

    /// Index of the first trainable backbone layer (0 = stem)
    pub fn first_trainable_layer(&self) -> usize {
        (1 + self.shape.block_widths.len()).saturating_sub(self.settings.unfrozen_layers)
    }

    fn check_input(&self, x: &Array4<f64>) -> Result<()> {
        let (_, height, width, channels) = x.dim();
        if (height, width) != self.shape.input_hw || channels != CHANNELS {
            return Err(PipelineError::ShapeMismatch {
                expected: format!(
                    "images of {}x{}x{}",
                    self.shape.input_hw.1, self.shape.input_hw.0, CHANNELS
                ),
                actual: format!("{}x{}x{}", width, height, channels),
            });
        }
        Ok(())
    }
}

impl Serialize for TransferClassifier {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let record = record_bytes(&self.net).map_err(serde::ser::Error::custom)?;
        StoredClassifier {
            shape: self.shape.clone(),
            n_classes: self.n_classes,
            settings: self.settings.clone(),
            record,
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for TransferClassifier {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let stored = StoredClassifier::deserialize(deserializer)?;
        let backbone = Backbone {
            net: FeatureExtractor::init(&stored.shape, &mut ChaCha8Rng::seed_from_u64(0), &device()),
            shape: stored.shape,
        };
        let template = Self::new(backbone, stored.n_classes, stored.settings);
        let net = load_bytes(template.net, stored.record).map_err(serde::de::Error::custom)?;
        Ok(Self {
            net,
            shape: template.shape,
            n_classes: template.n_classes,
            settings: template.settings,
        })
    }
}

impl Classifier for TransferClassifier {
    type Input = Array4<f64>;

    fn fit(&mut self, x: &Array4<f64>, y: &[usize]) -> Result<TrainingSummary> {
        self.check_input(x)?;
        let n = x.len_of(Axis(0));
        if n == 0 {
            return Err(PipelineError::TrainingFailed("no training images".to_string()));
        }
        if n != y.len() {
            return Err(PipelineError::ShapeMismatch {
                expected: format!("{} labels", n),
                actual: format!("{} labels", y.len()),
            });
        }
        if let Some(bad) = y.iter().find(|&&l| l >= self.n_classes) {
            return Err(PipelineError::TrainingFailed(format!(
                "label {} outside the {} classes of the head",
                bad, self.n_classes
            )));
        }

        let first_trainable = self.first_trainable_layer();
        let n_layers = 1 + self.shape.block_widths.len();
        tracing::info!(
            "Fine-tuning {} of {} backbone layers on {} images ({} classes)",
            n_layers - first_trainable,
            n_layers,
            n,
            self.n_classes
        );

        let mut net = self.net.clone();
        net.backbone = net.backbone.freeze_before(first_trainable);

        let device = device();
        let loss_fn = CrossEntropyLossConfig::new().init(&device);
        let mut optimizer = AdamConfig::new().with_epsilon(1e-7).init();

        let mut rng = ChaCha8Rng::seed_from_u64(self.settings.seed);
        let mut order: Vec<usize> = (0..n).collect();
        let mut history = Vec::with_capacity(self.settings.epochs);

        for epoch in 1..=self.settings.epochs {
            order.shuffle(&mut rng);
            let mut loss_sum = 0.0;
            let mut correct = 0usize;

            for batch in order.chunks(self.settings.batch_size) {
                let images = to_tensor::<TrainBackend>(&x.select(Axis(0), batch), &device);
                let labels: Vec<i64> = batch.iter().map(|&i| y[i] as i64).collect();
                let targets = Tensor::<TrainBackend, 1, Int>::from_data(TensorData::new(labels, [batch.len()]), &device);

                let logits = net.forward(images);
                let hits: i64 = logits
                    .clone()
                    .argmax(1)
                    .reshape([batch.len()])
                    .equal(targets.clone())
                    .int()
                    .sum()
                    .into_scalar()
                    .elem();
                correct += hits as usize;

                let loss = loss_fn.forward(logits, targets);
                let batch_loss: f64 = loss.clone().into_scalar().elem();
                loss_sum += batch_loss * batch.len() as f64;

                let grads = GradientsParams::from_grads(loss.backward(), &net);
                net = optimizer.step(self.settings.learning_rate, net, grads);
            }

            let loss = loss_sum / n as f64;
            let accuracy = correct as f64 / n as f64;
            if !loss.is_finite() {
                return Err(PipelineError::TrainingFailed(format!(
                    "loss became non-finite in epoch {}",
                    epoch
                )));
            }
            tracing::info!(
                "Epoch {}/{} - loss: {:.4} - accuracy: {:.4}",
                epoch,
                self.settings.epochs,
                loss,
                accuracy
            );
            history.push(EpochStats { epoch, accuracy, loss });
        }

        self.net = net;
        Ok(TrainingSummary::from_history(history, n))
    }

    fn predict_scores(&self, x: &Array4<f64>) -> Result<Array2<f64>> {
        self.check_input(x)?;
        let n = x.len_of(Axis(0));
        let net = self.net.valid();
        let mut out = Array2::zeros((n, self.n_classes));
        let mut begin = 0;
        while begin < n {
            let end = (begin + PREDICT_BATCH).min(n);
            let images = to_tensor::<Cpu>(&x.slice(s![begin..end, .., .., ..]).to_owned(), &device());
            let probs = softmax(net.forward(images), 1)
                .into_data()
                .to_vec::<f32>()
                .map_err(|e| PipelineError::ShapeMismatch {
                    expected: "f32 class probabilities".to_string(),
                    actual: format!("{:?}", e),
                })?;
            let probs = Array2::from_shape_vec((end - begin, self.n_classes), probs)?;
            out.slice_mut(s![begin..end, ..]).assign(&probs.mapv(f64::from));
            begin = end;
        }
        Ok(out)
    }

    fn n_classes(&self) -> usize {
        self.n_classes
    }

    fn name(&self) -> &str {
        "TransferCNN"
    }

    fn description(&self) -> &str {
        "Convolutional feature extractor with a replaced softmax head, partially fine-tuned with Adam"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_config() -> BackboneConfig {
        BackboneConfig {
            conv_filters: 4,
            pool_grid: 2,
            block_widths: vec![8],
            head_units: 8,
            weights: None,
        }
    }

    fn settings(unfrozen: usize, epochs: usize) -> TransferSettings {
        TransferSettings {
            epochs,
            batch_size: 4,
            learning_rate: 0.01,
            unfrozen_layers: unfrozen,
            head_units: 8,
            seed: 42,
        }
    }

    /// Class 0: dark images, class 1: bright images
    fn toy_images(n_per_class: usize) -> (Array4<f64>, Vec<usize>) {
        let mut x = Array4::zeros((2 * n_per_class, 6, 6, 3));
        let mut y = Vec::new();
        for i in 0..2 * n_per_class {
            let class = i % 2;
            let level = if class == 0 { 20.0 } else { 230.0 };
            x.index_axis_mut(Axis(0), i).fill(level + (i as f64 % 5.0));
            y.push(class);
        }
        (x, y)
    }

    fn values<const D: usize>(param: &Param<Tensor<TrainBackend, D>>) -> Vec<f32> {
        param.val().into_data().to_vec::<f32>().unwrap()
    }

    fn stem_weights(model: &TransferClassifier) -> Vec<f32> {
        values(&model.net.backbone.stem.weight)
    }

    fn block_weights(model: &TransferClassifier) -> Vec<f32> {
        values(&model.net.backbone.blocks[0].weight)
    }

    #[test]
    fn test_scores_are_probabilities() {
        let backbone = Backbone::initialise(&tiny_config(), (6, 6), 1);
        let model = TransferClassifier::new(backbone, 3, settings(1, 1));
        let (x, _) = toy_images(2);
        let scores = model.predict_scores(&x).unwrap();
        assert_eq!(scores.shape(), &[4, 3]);
        for row in scores.rows() {
            assert!((row.sum() - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_learns_brightness() {
        let (x, y) = toy_images(8);
        let backbone = Backbone::initialise(&tiny_config(), (6, 6), 1);
        let mut model = TransferClassifier::new(backbone, 2, settings(2, 30));
        let summary = model.fit(&x, &y).unwrap();

        assert_eq!(summary.history.len(), 30);
        assert!(summary.final_loss < summary.history[0].loss);
        assert_eq!(model.predict(&x).unwrap(), y);
    }

    #[test]
    fn test_frozen_layers_are_untouched() {
        let (x, y) = toy_images(4);
        let backbone = Backbone::initialise(&tiny_config(), (6, 6), 1);
        let mut model = TransferClassifier::new(backbone, 2, settings(1, 2));
        let (stem_before, block_before) = (stem_weights(&model), block_weights(&model));
        model.fit(&x, &y).unwrap();

        // One unfrozen layer: the dense block moves, the stem stays put
        assert_eq!(stem_weights(&model), stem_before);
        assert_ne!(block_weights(&model), block_before);
    }

    #[test]
    fn test_unfreezing_everything_updates_stem() {
        let (x, y) = toy_images(4);
        let backbone = Backbone::initialise(&tiny_config(), (6, 6), 1);
        let mut model = TransferClassifier::new(backbone, 2, settings(5, 2));
        assert_eq!(model.first_trainable_layer(), 0);
        let before = stem_weights(&model);
        model.fit(&x, &y).unwrap();
        assert_ne!(stem_weights(&model), before);
    }

    #[test]
    fn test_training_is_deterministic() {
        let (x, y) = toy_images(4);
        let run = || {
            let backbone = Backbone::initialise(&tiny_config(), (6, 6), 9);
            let mut model = TransferClassifier::new(backbone, 2, settings(2, 3));
            model.fit(&x, &y).unwrap();
            model.predict_scores(&x).unwrap()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn test_bincode_round_trip_keeps_weights() {
        let (x, y) = toy_images(3);
        let backbone = Backbone::initialise(&tiny_config(), (6, 6), 3);
        let mut model = TransferClassifier::new(backbone, 2, settings(2, 2));
        model.fit(&x, &y).unwrap();

        let restored = TransferClassifier::from_bytes(&model.to_bytes().unwrap()).unwrap();
        assert_eq!(restored.settings(), model.settings());
        assert_eq!(restored.predict_scores(&x).unwrap(), model.predict_scores(&x).unwrap());
    }

    #[test]
    fn test_fine_tuned_backbone_round_trip() {
        let backbone = Backbone::initialise(&tiny_config(), (6, 6), 4);
        let bytes = bincode::serialize(&backbone).unwrap();
        let restored: Backbone = bincode::deserialize(&bytes).unwrap();
        assert_eq!(restored.shape(), backbone.shape());
        assert_eq!(values(&restored.net.stem.weight), values(&backbone.net.stem.weight));
    }

    #[test]
    fn test_rejects_wrong_image_size() {
        let backbone = Backbone::initialise(&tiny_config(), (6, 6), 1);
        let model = TransferClassifier::new(backbone, 2, settings(1, 1));
        let x = Array4::zeros((1, 8, 8, 3));
        assert!(matches!(model.predict(&x), Err(PipelineError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_backbone_size_check() {
        let backbone = Backbone::initialise(&tiny_config(), (6, 4), 1);
        assert_eq!(backbone.input_hw(), (4, 6));
        assert!(backbone.check_input((6, 4)).is_ok());
        assert!(backbone.check_input((4, 6)).is_err());
    }
}
