//! The U-Net as an ordered list of typed stage descriptors.

use serde::{Deserialize, Serialize};

/// Activation applied right after a convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Activation {
    Relu,
    Linear,
}

/// One step of the forward pass. Stages run strictly in order over a single
/// current activation; skip tensors live on a stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stage {
    /// Convolution with the parameters at `layer` in the network's layer list.
    Conv { layer: usize, activation: Activation },
    /// Push the current activation onto the skip stack.
    Stash,
    MaxPool,
    UpSample,
    /// Pop the top of the skip stack and append it after the current channels.
    ConcatSkip,
    Softmax,
}

/// Shape and name of one convolution layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvSpec {
    pub name: String,
    pub kernel_size: usize,
    pub in_channels: usize,
    pub out_channels: usize,
}

impl ConvSpec {
    pub fn kernel_shape(&self) -> [usize; 4] {
        [
            self.kernel_size,
            self.kernel_size,
            self.in_channels,
            self.out_channels,
        ]
    }
}

/// Stage sequence plus the layer table it indexes into.
#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    pub stages: Vec<Stage>,
    pub layers: Vec<ConvSpec>,
}

impl Plan {
    /// Two-level U-Net: two encoder stages, a bottleneck, two decoder stages
    /// and a 1x1 softmax head. Widths double per level from `base_filters`.
    ///
    /// Layers are named `conv2d`, `conv2d_1`, ... in creation order; weight
    /// archives address them by these names.
    pub fn unet(base_filters: usize, num_classes: usize) -> Self {
        let f = base_filters;
        let mut builder = PlanBuilder::new(3);

        // encoder
        builder.conv3(f).conv3(f).stash().pool();
        builder.conv3(2 * f).conv3(2 * f).stash().pool();

        // bottleneck
        builder.conv3(4 * f).conv3(4 * f);

        // decoder
        builder.up().concat().conv3(2 * f).conv3(2 * f);
        builder.up().concat().conv3(f).conv3(f);

        builder.head(num_classes);
        builder.finish()
    }

    pub fn conv_layers(&self) -> usize {
        self.layers.len()
    }

    /// Display name of each stage's output, `None` for stages that only
    /// touch the skip stack. Convolutions take their layer name; other kinds
    /// are numbered per kind (`max_pooling2d`, `max_pooling2d_1`, ...).
    pub fn stage_names(&self) -> Vec<Option<String>> {
        let mut counts = [0usize; 4];
        let mut numbered = |slot: usize, base: &str| {
            let n = counts[slot];
            counts[slot] += 1;
            Some(if n == 0 {
                base.to_string()
            } else {
                format!("{base}_{n}")
            })
        };
        self.stages
            .iter()
            .map(|stage| match *stage {
                Stage::Conv { layer, .. } => self.layers.get(layer).map(|l| l.name.clone()),
                Stage::Stash => None,
                Stage::MaxPool => numbered(0, "max_pooling2d"),
                Stage::UpSample => numbered(1, "up_sampling2d"),
                Stage::ConcatSkip => numbered(2, "concatenate"),
                Stage::Softmax => numbered(3, "softmax"),
            })
            .collect()
    }
}

struct PlanBuilder {
    stages: Vec<Stage>,
    layers: Vec<ConvSpec>,
    channels: usize,
    skip_channels: Vec<usize>,
}

impl PlanBuilder {
    fn new(input_channels: usize) -> Self {
        Self {
            stages: Vec::new(),
            layers: Vec::new(),
            channels: input_channels,
            skip_channels: Vec::new(),
        }
    }

    fn conv(&mut self, kernel_size: usize, out_channels: usize, activation: Activation) -> &mut Self {
        let layer = self.layers.len();
        let name = if layer == 0 {
            "conv2d".to_string()
        } else {
            format!("conv2d_{layer}")
        };
        self.layers.push(ConvSpec {
            name,
            kernel_size,
            in_channels: self.channels,
            out_channels,
        });
        self.stages.push(Stage::Conv { layer, activation });
        self.channels = out_channels;
        self
    }

    fn conv3(&mut self, out_channels: usize) -> &mut Self {
        self.conv(3, out_channels, Activation::Relu)
    }

    fn stash(&mut self) -> &mut Self {
        self.skip_channels.push(self.channels);
        self.stages.push(Stage::Stash);
        self
    }

    fn pool(&mut self) -> &mut Self {
        self.stages.push(Stage::MaxPool);
        self
    }

    fn up(&mut self) -> &mut Self {
        self.stages.push(Stage::UpSample);
        self
    }

    fn concat(&mut self) -> &mut Self {
        let skip = self.skip_channels.pop().unwrap_or(0);
        self.channels += skip;
        self.stages.push(Stage::ConcatSkip);
        self
    }

    fn head(&mut self, num_classes: usize) -> &mut Self {
        self.conv(1, num_classes, Activation::Linear);
        self.stages.push(Stage::Softmax);
        self
    }

    fn finish(&mut self) -> Plan {
        Plan {
            stages: std::mem::take(&mut self.stages),
            layers: std::mem::take(&mut self.layers),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_layer_table() {
        let plan = Plan::unet(32, 7);
        let shapes: Vec<_> = plan
            .layers
            .iter()
            .map(|l| (l.name.as_str(), l.kernel_shape()))
            .collect();
        assert_eq!(
            shapes,
            vec![
                ("conv2d", [3, 3, 3, 32]),
                ("conv2d_1", [3, 3, 32, 32]),
                ("conv2d_2", [3, 3, 32, 64]),
                ("conv2d_3", [3, 3, 64, 64]),
                ("conv2d_4", [3, 3, 64, 128]),
                ("conv2d_5", [3, 3, 128, 128]),
                ("conv2d_6", [3, 3, 192, 64]),
                ("conv2d_7", [3, 3, 64, 64]),
                ("conv2d_8", [3, 3, 96, 32]),
                ("conv2d_9", [3, 3, 32, 32]),
                ("conv2d_10", [1, 1, 32, 7]),
            ]
        );
    }

    #[test]
    fn test_stage_order() {
        use Activation::*;
        use Stage::*;
        let plan = Plan::unet(8, 7);
        let conv = |layer, activation| Conv { layer, activation };
        assert_eq!(
            plan.stages,
            vec![
                conv(0, Relu),
                conv(1, Relu),
                Stash,
                MaxPool,
                conv(2, Relu),
                conv(3, Relu),
                Stash,
                MaxPool,
                conv(4, Relu),
                conv(5, Relu),
                UpSample,
                ConcatSkip,
                conv(6, Relu),
                conv(7, Relu),
                UpSample,
                ConcatSkip,
                conv(8, Relu),
                conv(9, Relu),
                conv(10, Linear),
                Softmax,
            ]
        );
    }

    #[test]
    fn test_stage_names() {
        let plan = Plan::unet(4, 7);
        let names: Vec<_> = plan.stage_names().into_iter().flatten().collect();
        assert_eq!(
            names,
            vec![
                "conv2d",
                "conv2d_1",
                "max_pooling2d",
                "conv2d_2",
                "conv2d_3",
                "max_pooling2d_1",
                "conv2d_4",
                "conv2d_5",
                "up_sampling2d",
                "concatenate",
                "conv2d_6",
                "conv2d_7",
                "up_sampling2d_1",
                "concatenate_1",
                "conv2d_8",
                "conv2d_9",
                "conv2d_10",
                "softmax",
            ]
        );
        assert_eq!(plan.stage_names().len(), plan.stages.len());
    }

    #[test]
    fn test_stash_and_concat_are_balanced() {
        let plan = Plan::unet(4, 3);
        let stashes = plan.stages.iter().filter(|s| **s == Stage::Stash).count();
        let concats = plan
            .stages
            .iter()
            .filter(|s| **s == Stage::ConcatSkip)
            .count();
        assert_eq!(stashes, concats);
        assert_eq!(plan.conv_layers(), 11);
    }
}
