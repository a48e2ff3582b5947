//! Layer kernels with explicit forward and backward passes
//!
//! These are the building blocks operation bodies are composed from:
//! convolution, pooling, linear, ReLU, and the `Stack` sequential
//! composite. Each layer computes its own input gradient and accumulates
//! parameter gradients into its `Param` containers.

use ndarray::parallel::prelude::*;
use ndarray::{Array2, Array4, ArrayD, Axis, Ix2};
use rand::Rng;
use rand_xoshiro::Xoshiro256PlusPlus;

use crate::tensor::{Param, Tensor};

/// Output spatial extent of a convolution/pooling window.
pub fn conv_out(input: usize, kernel: usize, stride: usize, padding: usize, dilation: usize) -> usize {
    (input + 2 * padding - dilation * (kernel - 1) - 1) / stride + 1
}

/// 2-d convolution without bias.
///
/// Supports stride, zero padding, dilation and grouped (depthwise)
/// convolution. Weight layout is (ch_out, ch_in / groups, kh, kw).
#[derive(Debug, Clone)]
pub struct Conv2d {
    ch_in: usize,
    ch_out: usize,
    kernel: (usize, usize),
    stride: usize,
    padding: (usize, usize),
    dilation: usize,
    groups: usize,
    weight: Param,
}

impl Conv2d {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ch_in: usize,
        ch_out: usize,
        kernel: (usize, usize),
        stride: usize,
        padding: (usize, usize),
        dilation: usize,
        groups: usize,
        rng: &mut Xoshiro256PlusPlus,
    ) -> Self {
        let (kh, kw) = kernel;
        let cin_g = ch_in / groups;
        // Xavier/Glorot initialization
        let fan_in = cin_g * kh * kw;
        let fan_out = (ch_out / groups) * kh * kw;
        let scale = (2.0 / (fan_in + fan_out) as f64).sqrt();
        let weight: Vec<f64> = (0..ch_out * cin_g * kh * kw)
            .map(|_| rng.gen::<f64>() * 2.0 * scale - scale)
            .collect();
        let weight = Array4::from_shape_vec((ch_out, cin_g, kh, kw), weight)
            .expect("conv weight shape")
            .into_dyn();
        Self {
            ch_in,
            ch_out,
            kernel,
            stride,
            padding,
            dilation,
            groups,
            weight: Param::new(weight),
        }
    }

    pub fn out_shape(&self, h: usize, w: usize) -> (usize, usize) {
        (
            conv_out(h, self.kernel.0, self.stride, self.padding.0, self.dilation),
            conv_out(w, self.kernel.1, self.stride, self.padding.1, self.dilation),
        )
    }

    pub fn forward(&self, x: &Tensor) -> Tensor {
        let (n, _cin, h, w) = x.dim();
        let (kh, kw) = self.kernel;
        let (ph, pw) = self.padding;
        let (s, d, g) = (self.stride, self.dilation, self.groups);
        let (h_out, w_out) = self.out_shape(h, w);
        let cin_g = self.ch_in / g;
        let cout_g = self.ch_out / g;
        let wgt = self.weight.view4();

        let mut out = Tensor::zeros((n, self.ch_out, h_out, w_out));
        out.axis_iter_mut(Axis(0))
            .into_par_iter()
            .enumerate()
            .for_each(|(bi, mut on)| {
                let xn = x.index_axis(Axis(0), bi);
                for grp in 0..g {
                    for oc in 0..cout_g {
                        let co = grp * cout_g + oc;
                        for oy in 0..h_out {
                            for ox in 0..w_out {
                                let mut acc = 0.0;
                                for ic in 0..cin_g {
                                    let ci = grp * cin_g + ic;
                                    for ky in 0..kh {
                                        let iy = (oy * s + ky * d) as isize - ph as isize;
                                        if iy < 0 || iy >= h as isize {
                                            continue;
                                        }
                                        for kx in 0..kw {
                                            let ix = (ox * s + kx * d) as isize - pw as isize;
                                            if ix < 0 || ix >= w as isize {
                                                continue;
                                            }
                                            acc += xn[[ci, iy as usize, ix as usize]]
                                                * wgt[[co, ic, ky, kx]];
                                        }
                                    }
                                }
                                on[[co, oy, ox]] = acc;
                            }
                        }
                    }
                }
            });
        out
    }

    /// Backward pass: accumulates the weight gradient and returns the
    /// input gradient.
    pub fn backward(&mut self, x: &Tensor, gy: &Tensor) -> Tensor {
        let (n, _cin, h, w) = x.dim();
        let (kh, kw) = self.kernel;
        let (ph, pw) = self.padding;
        let (s, d, g) = (self.stride, self.dilation, self.groups);
        let (_, _, h_out, w_out) = gy.dim();
        let cin_g = self.ch_in / g;
        let cout_g = self.ch_out / g;

        let mut gx = Tensor::zeros(x.raw_dim());
        let mut gw = Array4::<f64>::zeros((self.ch_out, cin_g, kh, kw));
        {
            let wgt = self.weight.view4();
            for bi in 0..n {
                for grp in 0..g {
                    for oc in 0..cout_g {
                        let co = grp * cout_g + oc;
                        for oy in 0..h_out {
                            for ox in 0..w_out {
                                let go = gy[[bi, co, oy, ox]];
                                if go == 0.0 {
                                    continue;
                                }
                                for ic in 0..cin_g {
                                    let ci = grp * cin_g + ic;
                                    for ky in 0..kh {
                                        let iy = (oy * s + ky * d) as isize - ph as isize;
                                        if iy < 0 || iy >= h as isize {
                                            continue;
                                        }
                                        for kx in 0..kw {
                                            let ix = (ox * s + kx * d) as isize - pw as isize;
                                            if ix < 0 || ix >= w as isize {
                                                continue;
                                            }
                                            let (iy, ix) = (iy as usize, ix as usize);
                                            gw[[co, ic, ky, kx]] += go * x[[bi, ci, iy, ix]];
                                            gx[[bi, ci, iy, ix]] += go * wgt[[co, ic, ky, kx]];
                                        }
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }
        self.weight.accumulate(&gw.into_dyn());
        gx
    }

    pub fn visit_params(&self, f: &mut dyn FnMut(&Param)) {
        f(&self.weight);
    }

    pub fn visit_params_mut(&mut self, f: &mut dyn FnMut(&mut Param)) {
        f(&mut self.weight);
    }
}

/// Pooling kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    Max,
    Avg,
}

/// 2-d max/average pooling. Average pooling excludes padded positions
/// from the divisor.
#[derive(Debug, Clone)]
pub struct Pool2d {
    kind: PoolKind,
    kernel: usize,
    stride: usize,
    padding: usize,
}

impl Pool2d {
    pub fn new(kind: PoolKind, kernel: usize, stride: usize, padding: usize) -> Self {
        Self {
            kind,
            kernel,
            stride,
            padding,
        }
    }

    pub fn forward(&self, x: &Tensor) -> Tensor {
        let (n, c, h, w) = x.dim();
        let (k, s, p) = (self.kernel, self.stride, self.padding);
        let h_out = conv_out(h, k, s, p, 1);
        let w_out = conv_out(w, k, s, p, 1);

        let mut out = Tensor::zeros((n, c, h_out, w_out));
        out.axis_iter_mut(Axis(0))
            .into_par_iter()
            .enumerate()
            .for_each(|(bi, mut on)| {
                let xn = x.index_axis(Axis(0), bi);
                for ci in 0..c {
                    for oy in 0..h_out {
                        for ox in 0..w_out {
                            let mut best = f64::NEG_INFINITY;
                            let mut sum = 0.0;
                            let mut cnt = 0usize;
                            for ky in 0..k {
                                let iy = (oy * s + ky) as isize - p as isize;
                                if iy < 0 || iy >= h as isize {
                                    continue;
                                }
                                for kx in 0..k {
                                    let ix = (ox * s + kx) as isize - p as isize;
                                    if ix < 0 || ix >= w as isize {
                                        continue;
                                    }
                                    let v = xn[[ci, iy as usize, ix as usize]];
                                    best = best.max(v);
                                    sum += v;
                                    cnt += 1;
                                }
                            }
                            on[[ci, oy, ox]] = match self.kind {
                                PoolKind::Max => best,
                                PoolKind::Avg => sum / cnt as f64,
                            };
                        }
                    }
                }
            });
        out
    }

    pub fn backward(&self, x: &Tensor, gy: &Tensor) -> Tensor {
        let (n, c, h, w) = x.dim();
        let (k, s, p) = (self.kernel, self.stride, self.padding);
        let (_, _, h_out, w_out) = gy.dim();

        let mut gx = Tensor::zeros(x.raw_dim());
        for bi in 0..n {
            for ci in 0..c {
                for oy in 0..h_out {
                    for ox in 0..w_out {
                        let go = gy[[bi, ci, oy, ox]];
                        if go == 0.0 {
                            continue;
                        }
                        let mut best = f64::NEG_INFINITY;
                        let mut best_at = (0usize, 0usize);
                        let mut valid = Vec::with_capacity(k * k);
                        for ky in 0..k {
                            let iy = (oy * s + ky) as isize - p as isize;
                            if iy < 0 || iy >= h as isize {
                                continue;
                            }
                            for kx in 0..k {
                                let ix = (ox * s + kx) as isize - p as isize;
                                if ix < 0 || ix >= w as isize {
                                    continue;
                                }
                                let (iy, ix) = (iy as usize, ix as usize);
                                let v = x[[bi, ci, iy, ix]];
                                if v > best {
                                    best = v;
                                    best_at = (iy, ix);
                                }
                                valid.push((iy, ix));
                            }
                        }
                        match self.kind {
                            PoolKind::Max => {
                                gx[[bi, ci, best_at.0, best_at.1]] += go;
                            }
                            PoolKind::Avg => {
                                let share = go / valid.len() as f64;
                                for (iy, ix) in valid {
                                    gx[[bi, ci, iy, ix]] += share;
                                }
                            }
                        }
                    }
                }
            }
        }
        gx
    }
}

/// Fully connected layer over channel vectors.
///
/// Operates on (n, ch_in, 1, 1) maps, as produced by global pooling,
/// and emits (n, ch_out, 1, 1).
#[derive(Debug, Clone)]
pub struct Linear {
    ch_in: usize,
    ch_out: usize,
    weight: Param,
    bias: Param,
}

impl Linear {
    pub fn new(ch_in: usize, ch_out: usize, rng: &mut Xoshiro256PlusPlus) -> Self {
        let scale = (2.0 / (ch_in + ch_out) as f64).sqrt();
        let weight: Vec<f64> = (0..ch_in * ch_out)
            .map(|_| rng.gen::<f64>() * 2.0 * scale - scale)
            .collect();
        let weight = Array2::from_shape_vec((ch_in, ch_out), weight)
            .expect("linear weight shape")
            .into_dyn();
        Self {
            ch_in,
            ch_out,
            weight: Param::new(weight),
            bias: Param::new(ArrayD::zeros(ndarray::IxDyn(&[ch_out]))),
        }
    }

    fn weight2(&self) -> ndarray::ArrayView2<'_, f64> {
        self.weight
            .value()
            .view()
            .into_dimensionality::<Ix2>()
            .expect("linear weight is 2-d")
    }

    pub fn forward(&self, x: &Tensor) -> Tensor {
        let (n, c, h, w) = x.dim();
        debug_assert_eq!((h, w), (1, 1));
        debug_assert_eq!(c, self.ch_in);
        let x2 = x
            .view()
            .into_shape_with_order((n, c))
            .expect("flatten pooled map");
        let mut y2 = x2.dot(&self.weight2());
        for (i, b) in self.bias.value().iter().enumerate() {
            y2.column_mut(i).mapv_inplace(|v| v + b);
        }
        y2.into_shape_with_order((n, self.ch_out, 1, 1))
            .expect("unflatten logits")
    }

    pub fn backward(&mut self, x: &Tensor, gy: &Tensor) -> Tensor {
        let (n, c, _, _) = x.dim();
        let x2 = x
            .view()
            .into_shape_with_order((n, c))
            .expect("flatten pooled map");
        let g2 = gy
            .view()
            .into_shape_with_order((n, self.ch_out))
            .expect("flatten logit grad");

        let gw = x2.t().dot(&g2);
        let gb = g2.sum_axis(Axis(0));
        let gx2 = g2.dot(&self.weight2().t());

        self.weight.accumulate(&gw.into_dyn());
        self.bias.accumulate(&gb.into_dyn());
        gx2.into_shape_with_order((n, c, 1, 1))
            .expect("unflatten input grad")
    }

    pub fn visit_params(&self, f: &mut dyn FnMut(&Param)) {
        f(&self.weight);
        f(&self.bias);
    }

    pub fn visit_params_mut(&mut self, f: &mut dyn FnMut(&mut Param)) {
        f(&mut self.weight);
        f(&mut self.bias);
    }
}

/// A single sub-transform inside a `Stack`.
#[derive(Debug, Clone)]
pub enum Layer {
    Relu,
    Conv(Conv2d),
    Pool(Pool2d),
    /// Adaptive average pooling down to 1x1.
    GlobalPool,
    Linear(Linear),
}

impl Layer {
    pub fn forward(&self, x: &Tensor) -> Tensor {
        match self {
            Layer::Relu => x.mapv(|v| v.max(0.0)),
            Layer::Conv(conv) => conv.forward(x),
            Layer::Pool(pool) => pool.forward(x),
            Layer::GlobalPool => {
                let (n, c, h, w) = x.dim();
                let mut out = Tensor::zeros((n, c, 1, 1));
                for bi in 0..n {
                    for ci in 0..c {
                        let mut sum = 0.0;
                        for iy in 0..h {
                            for ix in 0..w {
                                sum += x[[bi, ci, iy, ix]];
                            }
                        }
                        out[[bi, ci, 0, 0]] = sum / (h * w) as f64;
                    }
                }
                out
            }
            Layer::Linear(linear) => linear.forward(x),
        }
    }

    pub fn backward(&mut self, x: &Tensor, gy: &Tensor) -> Tensor {
        match self {
            Layer::Relu => {
                let mut gx = gy.clone();
                gx.zip_mut_with(x, |g, &v| {
                    if v <= 0.0 {
                        *g = 0.0;
                    }
                });
                gx
            }
            Layer::Conv(conv) => conv.backward(x, gy),
            Layer::Pool(pool) => pool.backward(x, gy),
            Layer::GlobalPool => {
                let (n, c, h, w) = x.dim();
                let scale = 1.0 / (h * w) as f64;
                let mut gx = Tensor::zeros(x.raw_dim());
                for bi in 0..n {
                    for ci in 0..c {
                        let g = gy[[bi, ci, 0, 0]] * scale;
                        for iy in 0..h {
                            for ix in 0..w {
                                gx[[bi, ci, iy, ix]] = g;
                            }
                        }
                    }
                }
                gx
            }
            Layer::Linear(linear) => linear.backward(x, gy),
        }
    }

    pub fn visit_params(&self, f: &mut dyn FnMut(&Param)) {
        match self {
            Layer::Conv(conv) => conv.visit_params(f),
            Layer::Linear(linear) => linear.visit_params(f),
            _ => {}
        }
    }

    pub fn visit_params_mut(&mut self, f: &mut dyn FnMut(&mut Param)) {
        match self {
            Layer::Conv(conv) => conv.visit_params_mut(f),
            Layer::Linear(linear) => linear.visit_params_mut(f),
            _ => {}
        }
    }
}

/// An ordered list of sub-transforms applied in sequence.
#[derive(Debug, Clone)]
pub struct Stack {
    layers: Vec<Layer>,
}

impl Stack {
    pub fn new(layers: Vec<Layer>) -> Self {
        Self { layers }
    }

    pub fn forward(&self, x: &Tensor) -> Tensor {
        self.layers.iter().fold(x.clone(), |h, l| l.forward(&h))
    }

    /// Forward pass that records the input of every layer for backward.
    pub fn forward_cached(&self, x: &Tensor) -> (Tensor, Vec<Tensor>) {
        let mut inputs = Vec::with_capacity(self.layers.len());
        let mut h = x.clone();
        for layer in &self.layers {
            let next = layer.forward(&h);
            inputs.push(h);
            h = next;
        }
        (h, inputs)
    }

    pub fn backward(&mut self, inputs: &[Tensor], gy: &Tensor) -> Tensor {
        debug_assert_eq!(inputs.len(), self.layers.len());
        let mut g = gy.clone();
        for (layer, input) in self.layers.iter_mut().zip(inputs.iter()).rev() {
            g = layer.backward(input, &g);
        }
        g
    }

    pub fn visit_params(&self, f: &mut dyn FnMut(&Param)) {
        for layer in &self.layers {
            layer.visit_params(f);
        }
    }

    pub fn visit_params_mut(&mut self, f: &mut dyn FnMut(&mut Param)) {
        for layer in &mut self.layers {
            layer.visit_params_mut(f);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::dot_all;
    use rand::SeedableRng;

    fn rng() -> Xoshiro256PlusPlus {
        Xoshiro256PlusPlus::seed_from_u64(7)
    }

    fn random_tensor(shape: (usize, usize, usize, usize), rng: &mut Xoshiro256PlusPlus) -> Tensor {
        Tensor::from_shape_fn(shape, |_| rng.gen::<f64>() - 0.5)
    }

    #[test]
    fn test_conv_identity_kernel() {
        let mut r = rng();
        let mut conv = Conv2d::new(1, 1, (1, 1), 1, (0, 0), 1, 1, &mut r);
        conv.weight.value_mut().fill(1.0);
        let x = random_tensor((2, 1, 3, 3), &mut r);
        let y = conv.forward(&x);
        assert_eq!(y, x);
    }

    #[test]
    fn test_conv_output_shape_with_stride() {
        let mut r = rng();
        let conv = Conv2d::new(4, 8, (3, 3), 2, (1, 1), 1, 1, &mut r);
        let x = random_tensor((2, 4, 8, 8), &mut r);
        let y = conv.forward(&x);
        assert_eq!(y.dim(), (2, 8, 4, 4));
    }

    #[test]
    fn test_conv_gradient_matches_finite_difference() {
        let mut r = rng();
        let mut conv = Conv2d::new(2, 3, (3, 3), 1, (1, 1), 1, 1, &mut r);
        let x = random_tensor((2, 2, 4, 4), &mut r);
        let probe = random_tensor((2, 3, 4, 4), &mut r);

        // loss = <probe, conv(x)>, so dL/dy = probe
        let gx = conv.backward(&x, &probe);

        let eps = 1e-6;
        for &idx in &[[0, 0, 0, 0], [1, 1, 2, 3], [0, 1, 3, 1]] {
            let mut xp = x.clone();
            xp[idx] += eps;
            let mut xm = x.clone();
            xm[idx] -= eps;
            let fd = (dot_all(&probe, &conv.forward(&xp)) - dot_all(&probe, &conv.forward(&xm)))
                / (2.0 * eps);
            assert!(
                (gx[idx] - fd).abs() < 1e-6,
                "input grad {} vs fd {}",
                gx[idx],
                fd
            );
        }

        let gw = conv.weight.grad().clone();
        for &idx in &[[0, 0, 0, 0], [2, 1, 1, 2]] {
            let mut plus = conv.clone();
            plus.weight.value_mut()[idx] += eps;
            let mut minus = conv.clone();
            minus.weight.value_mut()[idx] -= eps;
            let fd = (dot_all(&probe, &plus.forward(&x)) - dot_all(&probe, &minus.forward(&x)))
                / (2.0 * eps);
            assert!(
                (gw[idx] - fd).abs() < 1e-6,
                "weight grad {} vs fd {}",
                gw[idx],
                fd
            );
        }
    }

    #[test]
    fn test_depthwise_conv_groups() {
        let mut r = rng();
        let conv = Conv2d::new(4, 4, (3, 3), 1, (1, 1), 1, 4, &mut r);
        let x = random_tensor((1, 4, 5, 5), &mut r);
        let y = conv.forward(&x);
        assert_eq!(y.dim(), (1, 4, 5, 5));
    }

    #[test]
    fn test_max_pool_forward_backward() {
        let pool = Pool2d::new(PoolKind::Max, 2, 2, 0);
        let x = Tensor::from_shape_vec(
            (1, 1, 2, 2),
            vec![1.0, 4.0, 2.0, 3.0],
        )
        .unwrap();
        let y = pool.forward(&x);
        assert_eq!(y[[0, 0, 0, 0]], 4.0);

        let gy = Tensor::from_elem((1, 1, 1, 1), 2.0);
        let gx = pool.backward(&x, &gy);
        assert_eq!(gx[[0, 0, 0, 1]], 2.0);
        assert_eq!(gx[[0, 0, 0, 0]], 0.0);
    }

    #[test]
    fn test_avg_pool_excludes_padding_from_divisor() {
        let pool = Pool2d::new(PoolKind::Avg, 3, 1, 1);
        let x = Tensor::from_elem((1, 1, 3, 3), 1.0);
        let y = pool.forward(&x);
        // corner windows see only 4 valid inputs, all 1.0
        assert!((y[[0, 0, 0, 0]] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_linear_forward_bias() {
        let mut r = rng();
        let mut linear = Linear::new(3, 2, &mut r);
        linear.weight.value_mut().fill(0.0);
        linear.bias.value_mut()[[0]] = 1.0;
        linear.bias.value_mut()[[1]] = -1.0;
        let x = Tensor::zeros((2, 3, 1, 1));
        let y = linear.forward(&x);
        assert_eq!(y[[0, 0, 0, 0]], 1.0);
        assert_eq!(y[[1, 1, 0, 0]], -1.0);
    }

    #[test]
    fn test_stack_gradient_matches_finite_difference() {
        let mut r = rng();
        let mut stack = Stack::new(vec![
            Layer::Relu,
            Layer::Conv(Conv2d::new(2, 2, (3, 3), 1, (1, 1), 1, 1, &mut r)),
            Layer::GlobalPool,
            Layer::Linear(Linear::new(2, 3, &mut r)),
        ]);
        let x = random_tensor((2, 2, 4, 4), &mut r);
        let probe = random_tensor((2, 3, 1, 1), &mut r);

        let (_, inputs) = stack.forward_cached(&x);
        let gx = stack.backward(&inputs, &probe);

        let eps = 1e-6;
        for &idx in &[[0, 0, 1, 1], [1, 1, 3, 2]] {
            let mut xp = x.clone();
            xp[idx] += eps;
            let mut xm = x.clone();
            xm[idx] -= eps;
            let fd = (dot_all(&probe, &stack.forward(&xp)) - dot_all(&probe, &stack.forward(&xm)))
                / (2.0 * eps);
            assert!(
                (gx[idx] - fd).abs() < 1e-6,
                "stack grad {} vs fd {}",
                gx[idx],
                fd
            );
        }
    }
}
