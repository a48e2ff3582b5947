//! Operation bodies
//!
//! Every catalog operation is an `Op`: a descriptor plus a body drawn
//! from a finite union of kinds. Most bodies are `Stack` compositions of
//! layer kernels; identity, the no-connection zero and the factorized
//! reduction carry their own forward/backward rules.

use ndarray::{concatenate, s, Axis};
use rand_xoshiro::Xoshiro256PlusPlus;

use crate::desc::{OpDesc, TrainState};
use crate::error::{MosaicError, Result};
use crate::ops::layers::{Conv2d, Stack};
use crate::tensor::{Param, Tensor};

/// Intermediates recorded by a cached forward pass, consumed by backward.
#[derive(Debug, Clone)]
pub enum OpCache {
    /// Per-layer inputs of a `Stack`, or op-specific tensors.
    Layers(Vec<Tensor>),
    /// Input shape, for ops whose gradient is identically zero.
    Shape([usize; 4]),
    Empty,
}

/// Halves spatial extent while mapping channels, using two stride-2
/// 1x1 convolutions over even and odd pixel offsets.
#[derive(Debug, Clone)]
pub struct FactorizedReduce {
    conv_even: Conv2d,
    conv_odd: Conv2d,
}

impl FactorizedReduce {
    pub fn new(ch_in: usize, ch_out: usize, rng: &mut Xoshiro256PlusPlus) -> Result<Self> {
        if ch_out % 2 != 0 {
            return Err(MosaicError::ShapeMismatch {
                expected: "even ch_out".to_string(),
                actual: ch_out.to_string(),
            });
        }
        Ok(Self {
            conv_even: Conv2d::new(ch_in, ch_out / 2, (1, 1), 2, (0, 0), 1, 1, rng),
            conv_odd: Conv2d::new(ch_in, ch_out / 2, (1, 1), 2, (0, 0), 1, 1, rng),
        })
    }

    pub fn forward(&self, x: &Tensor) -> Tensor {
        let r = x.mapv(|v| v.max(0.0));
        let shifted = r.slice(s![.., .., 1.., 1..]).to_owned();
        let even = self.conv_even.forward(&r);
        let odd = self.conv_odd.forward(&shifted);
        concatenate(Axis(1), &[even.view(), odd.view()]).expect("concat reduce halves")
    }

    pub fn forward_cached(&self, x: &Tensor) -> (Tensor, OpCache) {
        let r = x.mapv(|v| v.max(0.0));
        let shifted = r.slice(s![.., .., 1.., 1..]).to_owned();
        let even = self.conv_even.forward(&r);
        let odd = self.conv_odd.forward(&shifted);
        let out = concatenate(Axis(1), &[even.view(), odd.view()]).expect("concat reduce halves");
        (out, OpCache::Layers(vec![x.clone(), r]))
    }

    pub fn backward(&mut self, cache: &OpCache, gy: &Tensor) -> Tensor {
        let tensors = match cache {
            OpCache::Layers(t) => t,
            _ => unreachable!("factorized reduce cache"),
        };
        let (x, r) = (&tensors[0], &tensors[1]);
        let half = gy.dim().1 / 2;
        let gy_even = gy.slice(s![.., ..half, .., ..]).to_owned();
        let gy_odd = gy.slice(s![.., half.., .., ..]).to_owned();

        let mut gr = self.conv_even.backward(r, &gy_even);
        let shifted = r.slice(s![.., .., 1.., 1..]).to_owned();
        let gr_shifted = self.conv_odd.backward(&shifted, &gy_odd);
        gr.slice_mut(s![.., .., 1.., 1..])
            .zip_mut_with(&gr_shifted, |a, &b| *a += b);

        gr.zip_mut_with(x, |g, &v| {
            if v <= 0.0 {
                *g = 0.0;
            }
        });
        gr
    }

    pub fn visit_params(&self, f: &mut dyn FnMut(&Param)) {
        self.conv_even.visit_params(f);
        self.conv_odd.visit_params(f);
    }

    pub fn visit_params_mut(&mut self, f: &mut dyn FnMut(&mut Param)) {
        self.conv_even.visit_params_mut(f);
        self.conv_odd.visit_params_mut(f);
    }
}

/// The finite union of operation kinds.
#[derive(Debug, Clone)]
pub enum OpBody {
    Stack(Stack),
    Identity,
    /// No connection: zero output with stride subsampling.
    Zero { stride: usize, ch_out: usize },
    FactorizedReduce(FactorizedReduce),
}

/// A live operation: its descriptor, body and drop-path eligibility.
#[derive(Debug, Clone)]
pub struct Op {
    desc: OpDesc,
    body: OpBody,
    droppable: bool,
    trainable: bool,
}

impl Op {
    pub fn new(desc: OpDesc, body: OpBody, droppable: bool, trainable: bool) -> Self {
        Self {
            desc,
            body,
            droppable,
            trainable,
        }
    }

    pub fn name(&self) -> &str {
        &self.desc.name
    }

    pub fn desc(&self) -> &OpDesc {
        &self.desc
    }

    pub fn forward(&self, x: &Tensor) -> Tensor {
        match &self.body {
            OpBody::Stack(stack) => stack.forward(x),
            OpBody::Identity => x.clone(),
            OpBody::Zero { stride, ch_out } => zero_out(x, *stride, *ch_out),
            OpBody::FactorizedReduce(fr) => fr.forward(x),
        }
    }

    pub fn forward_cached(&self, x: &Tensor) -> (Tensor, OpCache) {
        match &self.body {
            OpBody::Stack(stack) => {
                let (y, inputs) = stack.forward_cached(x);
                (y, OpCache::Layers(inputs))
            }
            OpBody::Identity => (x.clone(), OpCache::Empty),
            OpBody::Zero { stride, ch_out } => {
                let (n, c, h, w) = x.dim();
                (zero_out(x, *stride, *ch_out), OpCache::Shape([n, c, h, w]))
            }
            OpBody::FactorizedReduce(fr) => fr.forward_cached(x),
        }
    }

    /// Backward pass: accumulates weight gradients, returns the input
    /// gradient.
    pub fn backward(&mut self, cache: &OpCache, gy: &Tensor) -> Tensor {
        match &mut self.body {
            OpBody::Stack(stack) => match cache {
                OpCache::Layers(inputs) => stack.backward(inputs, gy),
                _ => unreachable!("stack cache"),
            },
            OpBody::Identity => gy.clone(),
            OpBody::Zero { .. } => match cache {
                OpCache::Shape(shape) => Tensor::zeros((shape[0], shape[1], shape[2], shape[3])),
                _ => unreachable!("zero cache"),
            },
            OpBody::FactorizedReduce(fr) => fr.backward(cache, gy),
        }
    }

    /// Ordinary trainable parameters. Frozen ops yield nothing.
    pub fn visit_weights(&self, f: &mut dyn FnMut(&Param)) {
        if !self.trainable {
            return;
        }
        match &self.body {
            OpBody::Stack(stack) => stack.visit_params(f),
            OpBody::FactorizedReduce(fr) => fr.visit_params(f),
            _ => {}
        }
    }

    pub fn visit_weights_mut(&mut self, f: &mut dyn FnMut(&mut Param)) {
        if !self.trainable {
            return;
        }
        match &mut self.body {
            OpBody::Stack(stack) => stack.visit_params_mut(f),
            OpBody::FactorizedReduce(fr) => fr.visit_params_mut(f),
            _ => {}
        }
    }

    /// Architecture weights owned by the operation itself. The mixture
    /// weights live on the edge, so built-in ops own none.
    pub fn visit_alphas(&self, _f: &mut dyn FnMut(&Param)) {}

    /// Whether DropPath may zero this operation's output.
    pub fn can_drop_path(&self) -> bool {
        self.droppable
    }

    /// Descriptor with the current parameter state snapshotted, plus an
    /// optional rank for drop decisions (built-ins report none).
    pub fn finalize(&self) -> (OpDesc, Option<f64>) {
        let mut desc = self.desc.clone();
        desc.trainables = Some(self.snapshot());
        (desc, None)
    }

    pub fn snapshot(&self) -> TrainState {
        let mut tensors = Vec::new();
        self.visit_params_any(&mut |p| tensors.push(p.value().clone()));
        TrainState { tensors }
    }

    pub fn restore(&mut self, state: &TrainState) -> Result<()> {
        let mut shapes = Vec::new();
        self.visit_params_any(&mut |p| shapes.push(p.value().shape().to_vec()));
        if shapes.len() != state.tensors.len()
            || shapes
                .iter()
                .zip(state.tensors.iter())
                .any(|(s, t)| s.as_slice() != t.shape())
        {
            return Err(MosaicError::InvalidDescription(format!(
                "trainable state does not match operation {}",
                self.desc.name
            )));
        }
        let mut it = state.tensors.iter();
        self.visit_params_any_mut(&mut |p| {
            if let Some(t) = it.next() {
                *p.value_mut() = t.clone();
            }
        });
        Ok(())
    }

    // Parameter walk that ignores the frozen flag: snapshots must see
    // everything the op owns.
    fn visit_params_any(&self, f: &mut dyn FnMut(&Param)) {
        match &self.body {
            OpBody::Stack(stack) => stack.visit_params(f),
            OpBody::FactorizedReduce(fr) => fr.visit_params(f),
            _ => {}
        }
    }

    fn visit_params_any_mut(&mut self, f: &mut dyn FnMut(&mut Param)) {
        match &mut self.body {
            OpBody::Stack(stack) => stack.visit_params_mut(f),
            OpBody::FactorizedReduce(fr) => fr.visit_params_mut(f),
            _ => {}
        }
    }
}

fn zero_out(x: &Tensor, stride: usize, ch_out: usize) -> Tensor {
    let (n, _c, h, w) = x.dim();
    let h_out = (h + stride - 1) / stride;
    let w_out = (w + stride - 1) / stride;
    Tensor::zeros((n, ch_out, h_out, w_out))
}
