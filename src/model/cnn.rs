//! CNN for ordinal severity grading of grayscale radiographs
//!
//! The architecture is interchangeable: training only relies on the
//! [`Classifier`] and [`NamedParams`] traits.

use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d, MaxPool2dConfig},
        BatchNorm, BatchNormConfig, Dropout, DropoutConfig, Linear, LinearConfig, PaddingConfig2d, Relu,
    },
    tensor::{backend::Backend, Tensor},
};

use super::snapshot::{
    export_batch_norm, export_conv2d, export_linear, import_batch_norm, import_conv2d, import_linear, LoadReport,
    ParamSnapshot,
};
use super::{Classifier, NamedParams};
use crate::utils::error;

/// Configuration for the grading CNN
#[derive(Config, Debug)]
pub struct GradingCnnConfig {
    /// Number of ordinal grades
    #[config(default = "5")]
    pub num_classes: usize,

    /// Number of input channels (1 for radiographs)
    #[config(default = "1")]
    pub in_channels: usize,

    /// Filters of the first block; doubled in every following block
    #[config(default = "32")]
    pub base_filters: usize,

    /// Width of the hidden fully connected layer
    #[config(default = "128")]
    pub hidden_size: usize,

    #[config(default = "0.35")]
    pub dropout_rate: f64,
}

impl GradingCnnConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> GradingCnn<B> {
        GradingCnn::new(self, device)
    }
}

/// Conv2d, BatchNorm, ReLU and 2x2 max pooling
#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    pub conv: Conv2d<B>,
    pub bn: BatchNorm<B>,
    pub relu: Relu,
    pub pool: MaxPool2d,
}

impl<B: Backend> ConvBlock<B> {
    pub fn new(in_channels: usize, out_channels: usize, device: &B::Device) -> Self {
        let conv = Conv2dConfig::new([in_channels, out_channels], [3, 3])
            .with_padding(PaddingConfig2d::Same)
            .init(device);

        Self {
            conv,
            bn: BatchNormConfig::new(out_channels).init(device),
            relu: Relu::new(),
            pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(x);
        let x = self.bn.forward(x);
        let x = self.relu.forward(x);
        self.pool.forward(x)
    }

    fn export(&self, prefix: &str, snapshot: &mut ParamSnapshot) -> error::Result<()> {
        export_conv2d(&format!("{prefix}.conv"), &self.conv, snapshot)?;
        export_batch_norm(&format!("{prefix}.bn"), &self.bn, snapshot)
    }

    fn import(mut self, prefix: &str, snapshot: &ParamSnapshot, report: &mut LoadReport) -> Self {
        self.conv = import_conv2d(&format!("{prefix}.conv"), self.conv, snapshot, report);
        self.bn = import_batch_norm(&format!("{prefix}.bn"), self.bn, snapshot, report);
        self
    }
}

/// Grading classifier
///
/// Architecture:
/// - 4 convolutional blocks with doubling filter counts, each halving resolution
/// - Global average pooling
/// - Fully connected head with dropout
#[derive(Module, Debug)]
pub struct GradingCnn<B: Backend> {
    pub conv1: ConvBlock<B>,
    pub conv2: ConvBlock<B>,
    pub conv3: ConvBlock<B>,
    pub conv4: ConvBlock<B>,
    pub global_pool: AdaptiveAvgPool2d,
    pub fc1: Linear<B>,
    pub dropout: Dropout,
    pub fc2: Linear<B>,
    num_classes: usize,
}

impl<B: Backend> GradingCnn<B> {
    pub fn new(config: &GradingCnnConfig, device: &B::Device) -> Self {
        let base = config.base_filters;

        Self {
            conv1: ConvBlock::new(config.in_channels, base, device),
            conv2: ConvBlock::new(base, base * 2, device),
            conv3: ConvBlock::new(base * 2, base * 4, device),
            conv4: ConvBlock::new(base * 4, base * 8, device),
            global_pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            fc1: LinearConfig::new(base * 8, config.hidden_size).init(device),
            dropout: DropoutConfig::new(config.dropout_rate).init(),
            fc2: LinearConfig::new(config.hidden_size, config.num_classes).init(device),
            num_classes: config.num_classes,
        }
    }

    /// Logits of shape `[batch, num_classes]` for inputs `[batch, C, H, W]`
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self.conv1.forward(x);
        let x = self.conv2.forward(x);
        let x = self.conv3.forward(x);
        let x = self.conv4.forward(x);

        let x = self.global_pool.forward(x);
        let [batch_size, channels, _, _] = x.dims();
        let x = x.reshape([batch_size, channels]);

        let x = self.fc1.forward(x);
        let x = Relu::new().forward(x);
        let x = self.dropout.forward(x);
        self.fc2.forward(x)
    }
}

impl<B: Backend> NamedParams for GradingCnn<B> {
    fn export_params(&self) -> error::Result<ParamSnapshot> {
        let mut snapshot = ParamSnapshot::default();
        self.conv1.export("conv1", &mut snapshot)?;
        self.conv2.export("conv2", &mut snapshot)?;
        self.conv3.export("conv3", &mut snapshot)?;
        self.conv4.export("conv4", &mut snapshot)?;
        export_linear("fc1", &self.fc1, &mut snapshot)?;
        export_linear("fc2", &self.fc2, &mut snapshot)?;
        Ok(snapshot)
    }
}

impl<B: Backend> Classifier<B> for GradingCnn<B> {
    fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        GradingCnn::forward(self, images)
    }

    fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn import_params(mut self, snapshot: &ParamSnapshot) -> (Self, LoadReport) {
        let mut report = LoadReport::default();
        self.conv1 = self.conv1.import("conv1", snapshot, &mut report);
        self.conv2 = self.conv2.import("conv2", snapshot, &mut report);
        self.conv3 = self.conv3.import("conv3", snapshot, &mut report);
        self.conv4 = self.conv4.import("conv4", snapshot, &mut report);
        self.fc1 = import_linear("fc1", self.fc1, snapshot, &mut report);
        self.fc2 = import_linear("fc2", self.fc2, snapshot, &mut report);
        (self, report)
    }
}
