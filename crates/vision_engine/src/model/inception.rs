//! InceptionV3 - torchvision-compatible Inception v3 with auxiliary head
//!
//! Layer names match torchvision (`Conv2d_1a_3x3`, `Mixed_5b`, `AuxLogits`, ...)
//! so exported ImageNet weights can be loaded by name.

use candle_core::{Module, Result, Tensor};
use candle_nn::{Dropout, Linear, VarBuilder};

use crate::layers::conv_bn::ConvSpec;
use crate::layers::{ConvBn, TensorExt};

fn basic(in_c: usize, out_c: usize, k: usize, vb: VarBuilder) -> Result<ConvBn> {
    ConvBn::basic(ConvSpec::square(in_c, out_c, k), vb)
}

fn basic_padded(in_c: usize, out_c: usize, k: usize, pad: usize, vb: VarBuilder) -> Result<ConvBn> {
    ConvBn::basic(ConvSpec::square(in_c, out_c, k).padding(pad), vb)
}

fn basic_strided(in_c: usize, out_c: usize, k: usize, vb: VarBuilder) -> Result<ConvBn> {
    ConvBn::basic(ConvSpec::square(in_c, out_c, k).stride(2), vb)
}

fn basic_rect(in_c: usize, out_c: usize, k: (usize, usize), vb: VarBuilder) -> Result<ConvBn> {
    ConvBn::basic(ConvSpec::rect(in_c, out_c, k), vb)
}

fn chain(layers: &[ConvBn], xs: &Tensor, train: bool) -> Result<Tensor> {
    let mut xs = xs.clone();
    for layer in layers {
        xs = layer.forward_t(&xs, train)?;
    }
    Ok(xs)
}

/// 35x35 block: 1x1, 5x5, double 3x3 and pooled branches
pub struct InceptionA {
    branch1x1: ConvBn,
    branch5x5: [ConvBn; 2],
    branch3x3dbl: [ConvBn; 3],
    branch_pool: ConvBn,
}

impl InceptionA {
    pub fn load(in_c: usize, pool_features: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            branch1x1: basic(in_c, 64, 1, vb.pp("branch1x1"))?,
            branch5x5: [
                basic(in_c, 48, 1, vb.pp("branch5x5_1"))?,
                basic_padded(48, 64, 5, 2, vb.pp("branch5x5_2"))?,
            ],
            branch3x3dbl: [
                basic(in_c, 64, 1, vb.pp("branch3x3dbl_1"))?,
                basic_padded(64, 96, 3, 1, vb.pp("branch3x3dbl_2"))?,
                basic_padded(96, 96, 3, 1, vb.pp("branch3x3dbl_3"))?,
            ],
            branch_pool: basic(in_c, pool_features, 1, vb.pp("branch_pool"))?,
        })
    }

    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let b1 = self.branch1x1.forward_t(xs, train)?;
        let b2 = chain(&self.branch5x5, xs, train)?;
        let b3 = chain(&self.branch3x3dbl, xs, train)?;
        let b4 = self
            .branch_pool
            .forward_t(&xs.avg_pool2d_padded(3, 1, 1)?, train)?;
        Tensor::cat(&[b1, b2, b3, b4], 1)
    }
}

/// Grid reduction 35x35 -> 17x17
pub struct InceptionB {
    branch3x3: ConvBn,
    branch3x3dbl: [ConvBn; 3],
}

impl InceptionB {
    pub fn load(in_c: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            branch3x3: basic_strided(in_c, 384, 3, vb.pp("branch3x3"))?,
            branch3x3dbl: [
                basic(in_c, 64, 1, vb.pp("branch3x3dbl_1"))?,
                basic_padded(64, 96, 3, 1, vb.pp("branch3x3dbl_2"))?,
                basic_strided(96, 96, 3, vb.pp("branch3x3dbl_3"))?,
            ],
        })
    }

    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let b1 = self.branch3x3.forward_t(xs, train)?;
        let b2 = chain(&self.branch3x3dbl, xs, train)?;
        let b3 = xs.max_pool2d_padded(3, 2, 0)?;
        Tensor::cat(&[b1, b2, b3], 1)
    }
}

/// 17x17 block with factorised 7x7 convolutions
pub struct InceptionC {
    branch1x1: ConvBn,
    branch7x7: [ConvBn; 3],
    branch7x7dbl: [ConvBn; 5],
    branch_pool: ConvBn,
}

impl InceptionC {
    pub fn load(in_c: usize, c7: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            branch1x1: basic(in_c, 192, 1, vb.pp("branch1x1"))?,
            branch7x7: [
                basic(in_c, c7, 1, vb.pp("branch7x7_1"))?,
                basic_rect(c7, c7, (1, 7), vb.pp("branch7x7_2"))?,
                basic_rect(c7, 192, (7, 1), vb.pp("branch7x7_3"))?,
            ],
            branch7x7dbl: [
                basic(in_c, c7, 1, vb.pp("branch7x7dbl_1"))?,
                basic_rect(c7, c7, (7, 1), vb.pp("branch7x7dbl_2"))?,
                basic_rect(c7, c7, (1, 7), vb.pp("branch7x7dbl_3"))?,
                basic_rect(c7, c7, (7, 1), vb.pp("branch7x7dbl_4"))?,
                basic_rect(c7, 192, (1, 7), vb.pp("branch7x7dbl_5"))?,
            ],
            branch_pool: basic(in_c, 192, 1, vb.pp("branch_pool"))?,
        })
    }

    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let b1 = self.branch1x1.forward_t(xs, train)?;
        let b2 = chain(&self.branch7x7, xs, train)?;
        let b3 = chain(&self.branch7x7dbl, xs, train)?;
        let b4 = self
            .branch_pool
            .forward_t(&xs.avg_pool2d_padded(3, 1, 1)?, train)?;
        Tensor::cat(&[b1, b2, b3, b4], 1)
    }
}

/// Grid reduction 17x17 -> 8x8
pub struct InceptionD {
    branch3x3: [ConvBn; 2],
    branch7x7x3: [ConvBn; 4],
}

impl InceptionD {
    pub fn load(in_c: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            branch3x3: [
                basic(in_c, 192, 1, vb.pp("branch3x3_1"))?,
                basic_strided(192, 320, 3, vb.pp("branch3x3_2"))?,
            ],
            branch7x7x3: [
                basic(in_c, 192, 1, vb.pp("branch7x7x3_1"))?,
                basic_rect(192, 192, (1, 7), vb.pp("branch7x7x3_2"))?,
                basic_rect(192, 192, (7, 1), vb.pp("branch7x7x3_3"))?,
                basic_strided(192, 192, 3, vb.pp("branch7x7x3_4"))?,
            ],
        })
    }

    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let b1 = chain(&self.branch3x3, xs, train)?;
        let b2 = chain(&self.branch7x7x3, xs, train)?;
        let b3 = xs.max_pool2d_padded(3, 2, 0)?;
        Tensor::cat(&[b1, b2, b3], 1)
    }
}

/// 8x8 block with expanded filter bank outputs
pub struct InceptionE {
    branch1x1: ConvBn,
    branch3x3_1: ConvBn,
    branch3x3_2a: ConvBn,
    branch3x3_2b: ConvBn,
    branch3x3dbl_1: ConvBn,
    branch3x3dbl_2: ConvBn,
    branch3x3dbl_3a: ConvBn,
    branch3x3dbl_3b: ConvBn,
    branch_pool: ConvBn,
}

impl InceptionE {
    pub fn load(in_c: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            branch1x1: basic(in_c, 320, 1, vb.pp("branch1x1"))?,
            branch3x3_1: basic(in_c, 384, 1, vb.pp("branch3x3_1"))?,
            branch3x3_2a: basic_rect(384, 384, (1, 3), vb.pp("branch3x3_2a"))?,
            branch3x3_2b: basic_rect(384, 384, (3, 1), vb.pp("branch3x3_2b"))?,
            branch3x3dbl_1: basic(in_c, 448, 1, vb.pp("branch3x3dbl_1"))?,
            branch3x3dbl_2: basic_padded(448, 384, 3, 1, vb.pp("branch3x3dbl_2"))?,
            branch3x3dbl_3a: basic_rect(384, 384, (1, 3), vb.pp("branch3x3dbl_3a"))?,
            branch3x3dbl_3b: basic_rect(384, 384, (3, 1), vb.pp("branch3x3dbl_3b"))?,
            branch_pool: basic(in_c, 192, 1, vb.pp("branch_pool"))?,
        })
    }

    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let b1 = self.branch1x1.forward_t(xs, train)?;

        let b2 = self.branch3x3_1.forward_t(xs, train)?;
        let b2 = Tensor::cat(
            &[
                self.branch3x3_2a.forward_t(&b2, train)?,
                self.branch3x3_2b.forward_t(&b2, train)?,
            ],
            1,
        )?;

        let b3 = self.branch3x3dbl_1.forward_t(xs, train)?;
        let b3 = self.branch3x3dbl_2.forward_t(&b3, train)?;
        let b3 = Tensor::cat(
            &[
                self.branch3x3dbl_3a.forward_t(&b3, train)?,
                self.branch3x3dbl_3b.forward_t(&b3, train)?,
            ],
            1,
        )?;

        let b4 = self
            .branch_pool
            .forward_t(&xs.avg_pool2d_padded(3, 1, 1)?, train)?;
        Tensor::cat(&[b1, b2, b3, b4], 1)
    }
}

/// Auxiliary classifier on the 17x17 grid (training only)
pub struct InceptionAux {
    conv0: ConvBn,
    conv1: ConvBn,
    fc: Linear,
}

impl InceptionAux {
    pub fn load(in_c: usize, num_classes: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            conv0: basic(in_c, 128, 1, vb.pp("conv0"))?,
            conv1: basic(128, 768, 5, vb.pp("conv1"))?,
            fc: candle_nn::linear(768, num_classes, vb.pp("fc"))?,
        })
    }

    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let xs = xs.avg_pool2d_padded(5, 3, 0)?;
        let xs = self.conv0.forward_t(&xs, train)?;
        let xs = self.conv1.forward_t(&xs, train)?;
        self.fc.forward(&xs.global_avg_pool()?)
    }
}

/// Inception v3 trunk: stem through `Mixed_6e` (768 channels, 17x17 at 299px)
pub struct InceptionTrunk {
    stem: [ConvBn; 5],
    mixed_5: [InceptionA; 3],
    mixed_6a: InceptionB,
    mixed_6: [InceptionC; 4],
}

/// Channels produced by [`InceptionTrunk`]
pub const TRUNK_CHANNELS: usize = 768;

impl InceptionTrunk {
    pub fn load(vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            stem: [
                basic_strided(3, 32, 3, vb.pp("Conv2d_1a_3x3"))?,
                basic(32, 32, 3, vb.pp("Conv2d_2a_3x3"))?,
                basic_padded(32, 64, 3, 1, vb.pp("Conv2d_2b_3x3"))?,
                basic(64, 80, 1, vb.pp("Conv2d_3b_1x1"))?,
                basic(80, 192, 3, vb.pp("Conv2d_4a_3x3"))?,
            ],
            mixed_5: [
                InceptionA::load(192, 32, vb.pp("Mixed_5b"))?,
                InceptionA::load(256, 64, vb.pp("Mixed_5c"))?,
                InceptionA::load(288, 64, vb.pp("Mixed_5d"))?,
            ],
            mixed_6a: InceptionB::load(288, vb.pp("Mixed_6a"))?,
            mixed_6: [
                InceptionC::load(768, 128, vb.pp("Mixed_6b"))?,
                InceptionC::load(768, 160, vb.pp("Mixed_6c"))?,
                InceptionC::load(768, 160, vb.pp("Mixed_6d"))?,
                InceptionC::load(768, 192, vb.pp("Mixed_6e"))?,
            ],
        })
    }

    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let [c1a, c2a, c2b, c3b, c4a] = &self.stem;
        let xs = c1a.forward_t(xs, train)?;
        let xs = c2a.forward_t(&xs, train)?;
        let xs = c2b.forward_t(&xs, train)?;
        let xs = xs.max_pool2d_padded(3, 2, 0)?;
        let xs = c3b.forward_t(&xs, train)?;
        let xs = c4a.forward_t(&xs, train)?;
        let mut xs = xs.max_pool2d_padded(3, 2, 0)?;
        for block in &self.mixed_5 {
            xs = block.forward_t(&xs, train)?;
        }
        xs = self.mixed_6a.forward_t(&xs, train)?;
        for block in &self.mixed_6 {
            xs = block.forward_t(&xs, train)?;
        }
        Ok(xs)
    }
}

/// Full Inception v3 classifier
pub struct InceptionV3 {
    pub trunk: InceptionTrunk,
    pub aux: Option<InceptionAux>,
    mixed_7a: InceptionD,
    mixed_7: [InceptionE; 2],
    dropout: Dropout,
    pub fc: Linear,
}

impl InceptionV3 {
    pub fn load(num_classes: usize, aux_logits: bool, vb: VarBuilder) -> Result<Self> {
        let trunk = InceptionTrunk::load(vb.clone())?;
        let aux = if aux_logits {
            Some(InceptionAux::load(TRUNK_CHANNELS, num_classes, vb.pp("AuxLogits"))?)
        } else {
            None
        };
        Ok(Self {
            trunk,
            aux,
            mixed_7a: InceptionD::load(TRUNK_CHANNELS, vb.pp("Mixed_7a"))?,
            mixed_7: [
                InceptionE::load(1280, vb.pp("Mixed_7b"))?,
                InceptionE::load(2048, vb.pp("Mixed_7c"))?,
            ],
            dropout: Dropout::new(0.5),
            fc: candle_nn::linear(2048, num_classes, vb.pp("fc"))?,
        })
    }

    /// Returns the main logits and, in training mode, the auxiliary logits.
    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Result<(Tensor, Option<Tensor>)> {
        let xs = self.trunk.forward_t(xs, train)?;
        let aux = match (&self.aux, train) {
            (Some(aux), true) => Some(aux.forward_t(&xs, train)?),
            _ => None,
        };
        let xs = self.mixed_7a.forward_t(&xs, train)?;
        let xs = self.mixed_7[0].forward_t(&xs, train)?;
        let xs = self.mixed_7[1].forward_t(&xs, train)?;
        let xs = self.dropout.forward(&xs.global_avg_pool()?, train)?;
        let logits = self.fc.forward(&xs)?;
        Ok((logits, aux))
    }
}
