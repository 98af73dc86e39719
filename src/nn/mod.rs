//! Layer substrate and module registry
//!
//! The tracing runtime of a real tensor framework is an external
//! collaborator; this module provides the minimal stand-in the toolkit
//! needs to be exercised end to end:
//! - A [`Layer`] enum of leaf computations (convolution, batch norm,
//!   linear, activations, pooling) evaluated over [`ndarray`] tensors
//! - A [`ModuleRegistry`] arena holding the module tree of a model,
//!   addressable by dotted name
//!
//! Layers carry their parameters as plain tensors so that winnowing can
//! rebuild them in place and quantization wrappers can substitute
//! quantized values for the duration of a forward call.

use std::collections::HashMap;

use ndarray::IxDyn;

use crate::error::{Error, Result};

/// Dynamically-shaped float tensor, delegated to the host tensor crate.
pub type Tensor = ndarray::ArrayD<f32>;

/// Index of a module in a [`ModuleRegistry`].
pub type ModuleId = usize;

/// 2D convolution layer. Weight layout is `[out, in/groups, kh, kw]`.
#[derive(Clone, Debug)]
pub struct Conv2d {
    pub in_channels: usize,
    pub out_channels: usize,
    pub kernel_size: (usize, usize),
    pub stride: (usize, usize),
    pub padding: (usize, usize),
    pub groups: usize,
    pub weight: Tensor,
    pub bias: Option<Tensor>,
}

impl Conv2d {
    /// Create a convolution with zeroed parameters, stride 1 and no padding.
    pub fn new(in_channels: usize, out_channels: usize, kernel_size: (usize, usize)) -> Self {
        let weight = Tensor::zeros(IxDyn(&[
            out_channels,
            in_channels,
            kernel_size.0,
            kernel_size.1,
        ]));
        Self {
            in_channels,
            out_channels,
            kernel_size,
            stride: (1, 1),
            padding: (0, 0),
            groups: 1,
            weight,
            bias: Some(Tensor::zeros(IxDyn(&[out_channels]))),
        }
    }

    pub fn with_padding(mut self, padding: (usize, usize)) -> Self {
        self.padding = padding;
        self
    }

    pub fn with_stride(mut self, stride: (usize, usize)) -> Self {
        self.stride = stride;
        self
    }

    /// Grouped convolution. The weight tensor is rebuilt for the reduced
    /// per-group input width.
    pub fn with_groups(mut self, groups: usize) -> Self {
        self.groups = groups;
        self.weight = Tensor::zeros(IxDyn(&[
            self.out_channels,
            self.in_channels / groups,
            self.kernel_size.0,
            self.kernel_size.1,
        ]));
        self
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let s = x.shape();
        if s.len() != 4 || s[1] != self.in_channels {
            return Err(Error::ShapeMismatch {
                expected: vec![0, self.in_channels, 0, 0],
                got: s.to_vec(),
            });
        }
        let (n, h, w) = (s[0], s[2], s[3]);
        let (kh, kw) = self.kernel_size;
        let (sh, sw) = self.stride;
        let (ph, pw) = self.padding;
        let ho = (h + 2 * ph - kh) / sh + 1;
        let wo = (w + 2 * pw - kw) / sw + 1;
        let in_per_group = self.in_channels / self.groups;
        let out_per_group = self.out_channels / self.groups;

        let mut y = Tensor::zeros(IxDyn(&[n, self.out_channels, ho, wo]));
        for b in 0..n {
            for oc in 0..self.out_channels {
                let g = oc / out_per_group;
                let base = self.bias.as_ref().map_or(0.0, |bias| bias[[oc]]);
                for oy in 0..ho {
                    for ox in 0..wo {
                        let mut acc = base;
                        for ic in 0..in_per_group {
                            let c = g * in_per_group + ic;
                            for ky in 0..kh {
                                for kx in 0..kw {
                                    let iy = (oy * sh + ky) as isize - ph as isize;
                                    let ix = (ox * sw + kx) as isize - pw as isize;
                                    if iy < 0 || ix < 0 || iy >= h as isize || ix >= w as isize {
                                        continue;
                                    }
                                    acc += x[[b, c, iy as usize, ix as usize]]
                                        * self.weight[[oc, ic, ky, kx]];
                                }
                            }
                        }
                        y[[b, oc, oy, ox]] = acc;
                    }
                }
            }
        }
        Ok(y)
    }
}

/// 2D batch normalization in inference mode (running statistics).
#[derive(Clone, Debug)]
pub struct BatchNorm2d {
    pub num_features: usize,
    pub eps: f32,
    pub weight: Tensor,
    pub bias: Tensor,
    pub running_mean: Tensor,
    pub running_var: Tensor,
}

impl BatchNorm2d {
    pub fn new(num_features: usize) -> Self {
        Self {
            num_features,
            eps: 1e-5,
            weight: Tensor::ones(IxDyn(&[num_features])),
            bias: Tensor::zeros(IxDyn(&[num_features])),
            running_mean: Tensor::zeros(IxDyn(&[num_features])),
            running_var: Tensor::ones(IxDyn(&[num_features])),
        }
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let s = x.shape();
        if s.len() != 4 || s[1] != self.num_features {
            return Err(Error::ShapeMismatch {
                expected: vec![0, self.num_features, 0, 0],
                got: s.to_vec(),
            });
        }
        let mut y = x.clone();
        for ((_, c, _, _), v) in y
            .indexed_iter_mut()
            .map(|(idx, v)| ((idx[0], idx[1], idx[2], idx[3]), v))
        {
            let norm = (*v - self.running_mean[[c]]) / (self.running_var[[c]] + self.eps).sqrt();
            *v = norm * self.weight[[c]] + self.bias[[c]];
        }
        Ok(y)
    }
}

/// Fully-connected layer. Weight layout is `[out, in]`.
#[derive(Clone, Debug)]
pub struct Linear {
    pub in_features: usize,
    pub out_features: usize,
    pub weight: Tensor,
    pub bias: Option<Tensor>,
}

impl Linear {
    pub fn new(in_features: usize, out_features: usize) -> Self {
        Self {
            in_features,
            out_features,
            weight: Tensor::zeros(IxDyn(&[out_features, in_features])),
            bias: Some(Tensor::zeros(IxDyn(&[out_features]))),
        }
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let s = x.shape();
        if s.len() != 2 || s[1] != self.in_features {
            return Err(Error::ShapeMismatch {
                expected: vec![0, self.in_features],
                got: s.to_vec(),
            });
        }
        let n = s[0];
        let mut y = Tensor::zeros(IxDyn(&[n, self.out_features]));
        for b in 0..n {
            for o in 0..self.out_features {
                let mut acc = self.bias.as_ref().map_or(0.0, |bias| bias[[o]]);
                for i in 0..self.in_features {
                    acc += x[[b, i]] * self.weight[[o, i]];
                }
                y[[b, o]] = acc;
            }
        }
        Ok(y)
    }
}

/// 2D max pooling.
#[derive(Clone, Debug)]
pub struct MaxPool2d {
    pub kernel_size: (usize, usize),
    pub stride: (usize, usize),
}

impl MaxPool2d {
    pub fn new(kernel_size: (usize, usize)) -> Self {
        Self {
            kernel_size,
            stride: kernel_size,
        }
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let s = x.shape();
        if s.len() != 4 {
            return Err(Error::ShapeMismatch {
                expected: vec![0, 0, 0, 0],
                got: s.to_vec(),
            });
        }
        let (n, c, h, w) = (s[0], s[1], s[2], s[3]);
        let (kh, kw) = self.kernel_size;
        let (sh, sw) = self.stride;
        let ho = (h - kh) / sh + 1;
        let wo = (w - kw) / sw + 1;
        let mut y = Tensor::zeros(IxDyn(&[n, c, ho, wo]));
        for b in 0..n {
            for ch in 0..c {
                for oy in 0..ho {
                    for ox in 0..wo {
                        let mut best = f32::NEG_INFINITY;
                        for ky in 0..kh {
                            for kx in 0..kw {
                                best = best.max(x[[b, ch, oy * sh + ky, ox * sw + kx]]);
                            }
                        }
                        y[[b, ch, oy, ox]] = best;
                    }
                }
            }
        }
        Ok(y)
    }
}

/// A leaf computation in the module tree.
#[derive(Clone, Debug)]
pub enum Layer {
    Conv2d(Conv2d),
    BatchNorm2d(BatchNorm2d),
    Linear(Linear),
    ReLU,
    MaxPool2d(MaxPool2d),
    /// Adapter selecting a subset of channels on axis 1. Inserted by the
    /// winnower when `reshape` is enabled and a width mismatch is
    /// otherwise unavoidable.
    ChannelSelect { indices: Vec<usize> },
}

impl Layer {
    /// Normalized op-type tag used by the connected graph and the
    /// connectivity table.
    pub fn kind(&self) -> &'static str {
        match self {
            Layer::Conv2d(_) => "convolution",
            Layer::BatchNorm2d(_) => "batch_norm",
            Layer::Linear(_) => "addmm",
            Layer::ReLU => "relu",
            Layer::MaxPool2d(_) => "max_pool2d",
            Layer::ChannelSelect { .. } => "index_select",
        }
    }

    /// Group count, 1 for everything but grouped convolution.
    pub fn groups(&self) -> usize {
        match self {
            Layer::Conv2d(conv) => conv.groups,
            _ => 1,
        }
    }

    /// Named parameter tensors, in the framework's conventional order.
    pub fn parameters(&self) -> Vec<(&'static str, &Tensor)> {
        match self {
            Layer::Conv2d(conv) => {
                let mut params = vec![("weight", &conv.weight)];
                if let Some(bias) = &conv.bias {
                    params.push(("bias", bias));
                }
                params
            }
            Layer::BatchNorm2d(bn) => vec![
                ("weight", &bn.weight),
                ("bias", &bn.bias),
                ("running_mean", &bn.running_mean),
                ("running_var", &bn.running_var),
            ],
            Layer::Linear(linear) => {
                let mut params = vec![("weight", &linear.weight)];
                if let Some(bias) = &linear.bias {
                    params.push(("bias", bias));
                }
                params
            }
            Layer::ReLU | Layer::MaxPool2d(_) | Layer::ChannelSelect { .. } => vec![],
        }
    }

    /// Look up one named parameter.
    pub fn parameter(&self, name: &str) -> Option<&Tensor> {
        self.parameters()
            .into_iter()
            .find(|(n, _)| *n == name)
            .map(|(_, t)| t)
    }

    /// Replace a named parameter value, returning the previous tensor.
    /// Used for scoped substitution of quantized parameters.
    pub fn swap_parameter(&mut self, name: &str, value: Tensor) -> Option<Tensor> {
        let slot = match (self, name) {
            (Layer::Conv2d(conv), "weight") => &mut conv.weight,
            (Layer::Conv2d(conv), "bias") => conv.bias.as_mut()?,
            (Layer::Linear(linear), "weight") => &mut linear.weight,
            (Layer::Linear(linear), "bias") => linear.bias.as_mut()?,
            (Layer::BatchNorm2d(bn), "weight") => &mut bn.weight,
            (Layer::BatchNorm2d(bn), "bias") => &mut bn.bias,
            (Layer::BatchNorm2d(bn), "running_mean") => &mut bn.running_mean,
            (Layer::BatchNorm2d(bn), "running_var") => &mut bn.running_var,
            _ => return None,
        };
        Some(std::mem::replace(slot, value))
    }

    /// Evaluate the layer on its inputs. All current layers are
    /// single-input, single-output.
    pub fn forward(&self, inputs: &[Tensor]) -> Result<Vec<Tensor>> {
        let x = inputs.first().ok_or_else(|| {
            Error::Structural(format!("layer '{}' called with no inputs", self.kind()))
        })?;
        let y = match self {
            Layer::Conv2d(conv) => conv.forward(x)?,
            Layer::BatchNorm2d(bn) => bn.forward(x)?,
            Layer::Linear(linear) => linear.forward(x)?,
            Layer::ReLU => x.mapv(|v| v.max(0.0)),
            Layer::MaxPool2d(pool) => pool.forward(x)?,
            Layer::ChannelSelect { indices } => x.select(ndarray::Axis(1), indices),
        };
        Ok(vec![y])
    }
}

enum ModuleNode {
    Container,
    Leaf(Layer),
}

struct ModuleEntry {
    name: String,
    node: ModuleNode,
}

/// Arena of the modules making up a model, addressable by dotted name.
///
/// The root container is registered under the model name; children are
/// named `parent.attr`, matching the dotted paths a framework's module
/// walk would produce.
pub struct ModuleRegistry {
    entries: Vec<ModuleEntry>,
    by_name: HashMap<String, ModuleId>,
}

impl ModuleRegistry {
    pub fn new(model_name: &str) -> Self {
        let mut registry = Self {
            entries: Vec::new(),
            by_name: HashMap::new(),
        };
        registry.insert(model_name.to_string(), ModuleNode::Container);
        registry
    }

    fn insert(&mut self, name: String, node: ModuleNode) -> ModuleId {
        let id = self.entries.len();
        self.by_name.insert(name.clone(), id);
        self.entries.push(ModuleEntry { name, node });
        id
    }

    /// The root container's dotted name (the model name).
    pub fn model_name(&self) -> &str {
        &self.entries[0].name
    }

    pub fn root(&self) -> ModuleId {
        0
    }

    pub fn add_container(&mut self, parent: ModuleId, attr: &str) -> ModuleId {
        let name = format!("{}.{}", self.entries[parent].name, attr);
        self.insert(name, ModuleNode::Container)
    }

    pub fn add_leaf(&mut self, parent: ModuleId, attr: &str, layer: Layer) -> ModuleId {
        let name = format!("{}.{}", self.entries[parent].name, attr);
        self.insert(name, ModuleNode::Leaf(layer))
    }

    pub fn id_by_name(&self, dotted: &str) -> Option<ModuleId> {
        self.by_name.get(dotted).copied()
    }

    pub fn name(&self, id: ModuleId) -> &str {
        &self.entries[id].name
    }

    /// Resolve `parent.attr` to a child module.
    pub fn child(&self, parent: ModuleId, attr: &str) -> Option<ModuleId> {
        let name = format!("{}.{}", self.entries[parent].name, attr);
        self.id_by_name(&name)
    }

    pub fn is_leaf(&self, id: ModuleId) -> bool {
        matches!(self.entries[id].node, ModuleNode::Leaf(_))
    }

    pub fn leaf(&self, id: ModuleId) -> Option<&Layer> {
        match &self.entries[id].node {
            ModuleNode::Leaf(layer) => Some(layer),
            ModuleNode::Container => None,
        }
    }

    pub fn leaf_mut(&mut self, id: ModuleId) -> Option<&mut Layer> {
        match &mut self.entries[id].node {
            ModuleNode::Leaf(layer) => Some(layer),
            ModuleNode::Container => None,
        }
    }

    /// Ids of all leaf modules in registration order.
    pub fn leaf_ids(&self) -> Vec<ModuleId> {
        (0..self.entries.len()).filter(|&id| self.is_leaf(id)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn tensor4(shape: [usize; 4], data: Vec<f32>) -> Tensor {
        Tensor::from_shape_vec(IxDyn(&shape), data).unwrap()
    }

    #[test]
    fn test_conv2d_pointwise() {
        let mut conv = Conv2d::new(1, 1, (1, 1));
        conv.weight[[0, 0, 0, 0]] = 2.0;
        conv.bias.as_mut().unwrap()[[0]] = 0.5;

        let x = tensor4([1, 1, 2, 2], vec![1.0, 2.0, 3.0, 4.0]);
        let y = conv.forward(&x).unwrap();

        assert_eq!(y.shape(), &[1, 1, 2, 2]);
        assert_abs_diff_eq!(y[[0, 0, 0, 0]], 2.5, epsilon = 1e-6);
        assert_abs_diff_eq!(y[[0, 0, 1, 1]], 8.5, epsilon = 1e-6);
    }

    #[test]
    fn test_conv2d_padding_preserves_spatial_dims() {
        let conv = Conv2d::new(3, 4, (3, 3)).with_padding((1, 1));
        let x = Tensor::zeros(IxDyn(&[1, 3, 8, 8]));
        let y = conv.forward(&x).unwrap();
        assert_eq!(y.shape(), &[1, 4, 8, 8]);
    }

    #[test]
    fn test_conv2d_rejects_wrong_channel_count() {
        let conv = Conv2d::new(3, 4, (1, 1));
        let x = Tensor::zeros(IxDyn(&[1, 2, 4, 4]));
        assert!(conv.forward(&x).is_err());
    }

    #[test]
    fn test_linear_forward() {
        let mut linear = Linear::new(3, 2);
        linear.weight[[0, 0]] = 1.0;
        linear.weight[[1, 1]] = 1.0;
        linear.weight[[1, 2]] = 1.0;
        let bias = linear.bias.as_mut().unwrap();
        bias[[0]] = 0.5;
        bias[[1]] = -0.5;

        let x = Tensor::from_shape_vec(IxDyn(&[1, 3]), vec![1.0, 2.0, 3.0]).unwrap();
        let y = linear.forward(&x).unwrap();

        assert_abs_diff_eq!(y[[0, 0]], 1.5, epsilon = 1e-6);
        assert_abs_diff_eq!(y[[0, 1]], 4.5, epsilon = 1e-6);
    }

    #[test]
    fn test_batch_norm_normalizes_with_running_stats() {
        let mut bn = BatchNorm2d::new(2);
        bn.running_mean[[0]] = 1.0;
        bn.running_mean[[1]] = 2.0;
        bn.running_var[[1]] = 4.0;

        let x = tensor4([1, 2, 1, 1], vec![2.0, 4.0]);
        let y = bn.forward(&x).unwrap();

        assert_abs_diff_eq!(y[[0, 0, 0, 0]], 1.0, epsilon = 1e-3);
        assert_abs_diff_eq!(y[[0, 1, 0, 0]], 1.0, epsilon = 1e-3);
    }

    #[test]
    fn test_relu_and_max_pool() {
        let x = tensor4([1, 1, 2, 2], vec![-1.0, 2.0, 3.0, -4.0]);

        let relu = Layer::ReLU.forward(&[x.clone()]).unwrap();
        assert_abs_diff_eq!(relu[0][[0, 0, 0, 0]], 0.0, epsilon = 1e-6);
        assert_abs_diff_eq!(relu[0][[0, 0, 1, 0]], 3.0, epsilon = 1e-6);

        let pool = MaxPool2d::new((2, 2));
        let y = pool.forward(&x).unwrap();
        assert_eq!(y.shape(), &[1, 1, 1, 1]);
        assert_abs_diff_eq!(y[[0, 0, 0, 0]], 3.0, epsilon = 1e-6);
    }

    #[test]
    fn test_swap_parameter_round_trip() {
        let mut layer = Layer::Linear(Linear::new(2, 2));
        let replacement = Tensor::ones(IxDyn(&[2, 2]));

        let original = layer.swap_parameter("weight", replacement.clone()).unwrap();
        assert_eq!(original.sum(), 0.0);
        assert_eq!(layer.parameter("weight").unwrap(), &replacement);

        let _ = layer.swap_parameter("weight", original);
        assert_eq!(layer.parameter("weight").unwrap().sum(), 0.0);
    }

    #[test]
    fn test_registry_dotted_names() {
        let mut registry = ModuleRegistry::new("Net");
        let block = registry.add_container(registry.root(), "block");
        let conv = registry.add_leaf(block, "conv1", Layer::Conv2d(Conv2d::new(1, 1, (1, 1))));

        assert_eq!(registry.name(conv), "Net.block.conv1");
        assert_eq!(registry.id_by_name("Net.block.conv1"), Some(conv));
        assert_eq!(registry.child(block, "conv1"), Some(conv));
        assert!(registry.is_leaf(conv));
        assert!(!registry.is_leaf(block));
        assert_eq!(registry.leaf_ids(), vec![conv]);
    }
}
