//! ResNet - Bottleneck residual networks (ResNet-50 / ResNet-101)

use candle_core::{Module, Result, Tensor};
use candle_nn::{Linear, VarBuilder};

use crate::layers::conv_bn::ConvSpec;
use crate::layers::{ConvBn, TensorExt};

/// Epsilon for BatchNorm (torchvision default)
const BN_EPS: f64 = 1e-5;

const EXPANSION: usize = 4;

/// Blocks per stage
pub const RESNET50_LAYERS: [usize; 4] = [3, 4, 6, 3];
pub const RESNET101_LAYERS: [usize; 4] = [3, 4, 23, 3];

/// 1x1 -> 3x3 (strided) -> 1x1 block with residual connection
pub struct Bottleneck {
    pub conv1: ConvBn,
    pub conv2: ConvBn,
    pub conv3: ConvBn,
    pub downsample: Option<ConvBn>,
}

impl Bottleneck {
    pub fn load(in_planes: usize, planes: usize, stride: usize, vb: VarBuilder) -> Result<Self> {
        let out_planes = planes * EXPANSION;
        let conv1 = ConvBn::load(
            ConvSpec::square(in_planes, planes, 1),
            BN_EPS,
            true,
            vb.pp("conv1"),
            vb.pp("bn1"),
        )?;
        let conv2 = ConvBn::load(
            ConvSpec::square(planes, planes, 3).stride(stride).padding(1),
            BN_EPS,
            true,
            vb.pp("conv2"),
            vb.pp("bn2"),
        )?;
        let conv3 = ConvBn::load(
            ConvSpec::square(planes, out_planes, 1),
            BN_EPS,
            false,
            vb.pp("conv3"),
            vb.pp("bn3"),
        )?;
        let downsample = if stride != 1 || in_planes != out_planes {
            Some(ConvBn::load(
                ConvSpec::square(in_planes, out_planes, 1).stride(stride),
                BN_EPS,
                false,
                vb.pp("downsample.0"),
                vb.pp("downsample.1"),
            )?)
        } else {
            None
        };

        Ok(Self {
            conv1,
            conv2,
            conv3,
            downsample,
        })
    }

    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let out = self.conv1.forward_t(xs, train)?;
        let out = self.conv2.forward_t(&out, train)?;
        let out = self.conv3.forward_t(&out, train)?;
        let identity = match &self.downsample {
            Some(ds) => ds.forward_t(xs, train)?,
            None => xs.clone(),
        };
        (out + identity)?.relu()
    }
}

/// ResNet with the classification head resized to `num_classes`
pub struct ResNet {
    pub stem: ConvBn,
    pub stages: Vec<Vec<Bottleneck>>,
    pub fc: Linear,
}

impl ResNet {
    pub fn load(blocks: &[usize; 4], num_classes: usize, vb: VarBuilder) -> Result<Self> {
        let stem = ConvBn::load(
            ConvSpec::square(3, 64, 7).stride(2).padding(3),
            BN_EPS,
            true,
            vb.pp("conv1"),
            vb.pp("bn1"),
        )?;

        let mut in_planes = 64;
        let mut stages = Vec::with_capacity(blocks.len());
        for (i, &n_blocks) in blocks.iter().enumerate() {
            let planes = 64 << i;
            let stride = if i == 0 { 1 } else { 2 };
            let stage_vb = vb.pp(format!("layer{}", i + 1));
            let mut stage = Vec::with_capacity(n_blocks);
            for b in 0..n_blocks {
                let block_stride = if b == 0 { stride } else { 1 };
                stage.push(Bottleneck::load(
                    in_planes,
                    planes,
                    block_stride,
                    stage_vb.pp(b.to_string()),
                )?);
                in_planes = planes * EXPANSION;
            }
            stages.push(stage);
        }

        let fc = candle_nn::linear(in_planes, num_classes, vb.pp("fc"))?;

        Ok(Self { stem, stages, fc })
    }

    pub fn resnet50(num_classes: usize, vb: VarBuilder) -> Result<Self> {
        Self::load(&RESNET50_LAYERS, num_classes, vb)
    }

    pub fn resnet101(num_classes: usize, vb: VarBuilder) -> Result<Self> {
        Self::load(&RESNET101_LAYERS, num_classes, vb)
    }

    /// Pooled 2048-d embedding before the head.
    pub fn features_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let mut xs = self.stem.forward_t(xs, train)?.max_pool2d_padded(3, 2, 1)?;
        for stage in &self.stages {
            for block in stage {
                xs = block.forward_t(&xs, train)?;
            }
        }
        xs.global_avg_pool()
    }

    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let features = self.features_t(xs, train)?;
        self.fc.forward(&features)
    }
}
