//! ConvBn - Conv2d without bias followed by BatchNorm (and optionally ReLU)

use candle_core::{Result, Tensor};
use candle_nn::{BatchNorm, ModuleT, VarBuilder};

/// Convolution + batch norm pair.
///
/// Weights live under `<prefix>.weight` for the convolution and `bn_prefix`
/// for the norm, so both torchvision layouts fit:
/// ResNet stores `conv1` / `bn1` side by side, Inception nests `conv` / `bn`.
pub struct ConvBn {
    pub weight: Tensor,
    pub bn: BatchNorm,
    pub stride: usize,
    pub padding: (usize, usize),
    pub relu: bool,
}

/// Shape of the convolution held by a [`ConvBn`].
#[derive(Clone, Copy, Debug)]
pub struct ConvSpec {
    pub in_channels: usize,
    pub out_channels: usize,
    pub kernel: (usize, usize),
    pub stride: usize,
    pub padding: (usize, usize),
}

impl ConvSpec {
    pub fn square(in_channels: usize, out_channels: usize, kernel: usize) -> Self {
        Self {
            in_channels,
            out_channels,
            kernel: (kernel, kernel),
            stride: 1,
            padding: (0, 0),
        }
    }

    pub fn rect(in_channels: usize, out_channels: usize, kernel: (usize, usize)) -> Self {
        Self {
            in_channels,
            out_channels,
            kernel,
            stride: 1,
            padding: (kernel.0 / 2, kernel.1 / 2),
        }
    }

    pub fn stride(mut self, stride: usize) -> Self {
        self.stride = stride;
        self
    }

    pub fn padding(mut self, padding: usize) -> Self {
        self.padding = (padding, padding);
        self
    }
}

impl ConvBn {
    pub fn load(
        spec: ConvSpec,
        bn_eps: f64,
        relu: bool,
        conv_vb: VarBuilder,
        bn_vb: VarBuilder,
    ) -> Result<Self> {
        let (kh, kw) = spec.kernel;
        let weight = conv_vb.get_with_hints(
            (spec.out_channels, spec.in_channels, kh, kw),
            "weight",
            candle_nn::init::DEFAULT_KAIMING_NORMAL,
        )?;
        let bn = candle_nn::batch_norm(spec.out_channels, bn_eps, bn_vb)?;
        Ok(Self {
            weight,
            bn,
            stride: spec.stride,
            padding: spec.padding,
            relu,
        })
    }

    /// torchvision `BasicConv2d` layout: `<vb>.conv.weight`, `<vb>.bn.*`, eps 1e-3, ReLU.
    pub fn basic(spec: ConvSpec, vb: VarBuilder) -> Result<Self> {
        Self::load(spec, 1e-3, true, vb.pp("conv"), vb.pp("bn"))
    }

    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let (ph, pw) = self.padding;
        let ys = if ph == pw {
            xs.conv2d(&self.weight, ph, self.stride, 1, 1)?
        } else {
            // Tensor::conv2d only takes one padding value for both axes.
            let xs = xs.pad_with_zeros(2, ph, ph)?.pad_with_zeros(3, pw, pw)?;
            xs.conv2d(&self.weight, 0, self.stride, 1, 1)?
        };
        let ys = self.bn.forward_t(&ys, train)?;
        if self.relu {
            ys.relu()
        } else {
            Ok(ys)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_rect_kernel_keeps_spatial_size() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let layer = ConvBn::basic(ConvSpec::rect(4, 6, (1, 7)), vb.pp("b"))?;
        let xs = Tensor::randn(0f32, 1f32, (2, 4, 9, 9), &Device::Cpu)?;
        let ys = layer.forward_t(&xs, false)?;
        assert_eq!(ys.dims(), &[2, 6, 9, 9]);
        Ok(())
    }

    #[test]
    fn test_torchvision_names() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let _layer = ConvBn::basic(ConvSpec::square(3, 8, 3).stride(2), vb.pp("Conv2d_1a_3x3"))?;
        let data = varmap.data().lock().unwrap();
        assert!(data.contains_key("Conv2d_1a_3x3.conv.weight"));
        assert!(data.contains_key("Conv2d_1a_3x3.bn.running_mean"));
        assert!(data.contains_key("Conv2d_1a_3x3.bn.weight"));
        Ok(())
    }
}
