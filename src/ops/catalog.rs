//! Operation catalog
//!
//! A process-scoped registry mapping operation names to factories. The
//! catalog is an explicitly constructed value passed to every builder
//! call, which keeps concurrent probes isolated. Lookups fail fast;
//! there is no fallback operation.

use std::collections::BTreeMap;

use rand_xoshiro::Xoshiro256PlusPlus;

use crate::desc::OpDesc;
use crate::error::{MosaicError, Result};
use crate::ops::layers::{Conv2d, Layer, Linear, Pool2d, PoolKind, Stack};
use crate::ops::primitives::{FactorizedReduce, Op, OpBody};

/// Builds an operation body from a descriptor. Returns the body and
/// whether DropPath may zero the operation's output.
pub type OpFactory =
    Box<dyn Fn(&OpDesc, &mut Xoshiro256PlusPlus) -> Result<(OpBody, bool)> + Send + Sync>;

/// Registry of named operation factories.
pub struct OpCatalog {
    factories: BTreeMap<String, OpFactory>,
}

impl OpCatalog {
    /// Empty catalog.
    pub fn new() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// Catalog pre-populated with the standard operation set.
    pub fn with_defaults() -> Self {
        let mut catalog = Self::new();
        let defaults: Vec<(&str, OpFactory)> = vec![
            ("none", Box::new(|d, _| Ok((zero_body(d), true)))),
            ("identity", Box::new(|d, _| Ok((identity_body(d)?, false)))),
            (
                "skip_connect",
                Box::new(|d, rng| {
                    let body = if d.stride == 1 {
                        identity_body(d)?
                    } else {
                        OpBody::FactorizedReduce(FactorizedReduce::new(
                            d.conv.ch_in,
                            d.conv.ch_out,
                            rng,
                        )?)
                    };
                    Ok((body, false))
                }),
            ),
            ("max_pool_3x3", Box::new(|d, _| Ok((pool_body(d, PoolKind::Max, 3)?, true)))),
            ("avg_pool_3x3", Box::new(|d, _| Ok((pool_body(d, PoolKind::Avg, 3)?, true)))),
            ("sep_conv_3x3", Box::new(|d, rng| Ok((sep_conv_body(d, 3, 1, rng), true)))),
            ("sep_conv_5x5", Box::new(|d, rng| Ok((sep_conv_body(d, 5, 2, rng), true)))),
            ("dil_conv_3x3", Box::new(|d, rng| Ok((dil_conv_body(d, 3, 2, 2, rng), true)))),
            ("dil_conv_5x5", Box::new(|d, rng| Ok((dil_conv_body(d, 5, 4, 2, rng), true)))),
            ("conv_7x1_1x7", Box::new(|d, rng| Ok((fac_conv_body(d, 7, 3, rng), true)))),
            (
                "prepr_reduce",
                Box::new(|d, rng| {
                    Ok((
                        OpBody::FactorizedReduce(FactorizedReduce::new(
                            d.conv.ch_in,
                            d.conv.ch_out,
                            rng,
                        )?),
                        false,
                    ))
                }),
            ),
            (
                "prepr_normal",
                Box::new(|d, rng| {
                    let conv =
                        Conv2d::new(d.conv.ch_in, d.conv.ch_out, (1, 1), d.stride, (0, 0), 1, 1, rng);
                    Ok((
                        OpBody::Stack(Stack::new(vec![Layer::Relu, Layer::Conv(conv)])),
                        false,
                    ))
                }),
            ),
            (
                "stem",
                Box::new(|d, rng| {
                    let conv =
                        Conv2d::new(d.conv.ch_in, d.conv.ch_out, (3, 3), 1, (1, 1), 1, 1, rng);
                    Ok((OpBody::Stack(Stack::new(vec![Layer::Conv(conv)])), false))
                }),
            ),
            (
                "channel_adjust",
                Box::new(|d, rng| {
                    let conv =
                        Conv2d::new(d.conv.ch_in, d.conv.ch_out, (1, 1), 1, (0, 0), 1, 1, rng);
                    Ok((OpBody::Stack(Stack::new(vec![Layer::Conv(conv)])), false))
                }),
            ),
            (
                "pool_linear",
                Box::new(|d, rng| {
                    let linear = Linear::new(d.conv.ch_in, d.conv.ch_out, rng);
                    Ok((
                        OpBody::Stack(Stack::new(vec![Layer::GlobalPool, Layer::Linear(linear)])),
                        false,
                    ))
                }),
            ),
        ];
        for (name, factory) in defaults {
            catalog
                .register(name, factory, false)
                .expect("default catalog has no duplicates");
        }
        catalog
    }

    /// Register a factory. Fails with `DuplicateName` if the name is
    /// taken and overwrite is disallowed.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        factory: OpFactory,
        allow_overwrite: bool,
    ) -> Result<()> {
        let name = name.into();
        if self.factories.contains_key(&name) && !allow_overwrite {
            return Err(MosaicError::DuplicateName(name));
        }
        self.factories.insert(name, factory);
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered names, in deterministic order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(|s| s.as_str())
    }

    /// Instantiate the named factory with the descriptor's shape
    /// parameters. Restores any pre-trained state carried by the
    /// descriptor. `trainable = false` freezes the operation's weights
    /// (they are skipped by weight iteration).
    pub fn create(
        &self,
        desc: &OpDesc,
        trainable: bool,
        rng: &mut Xoshiro256PlusPlus,
    ) -> Result<Op> {
        let factory = self
            .factories
            .get(&desc.name)
            .ok_or_else(|| MosaicError::UnknownOperation(desc.name.clone()))?;
        let (body, droppable) = factory(desc, rng)?;
        let mut op = Op::new(desc.clone(), body, droppable, trainable);
        if let Some(state) = &desc.trainables {
            op.restore(state)?;
        }
        Ok(op)
    }
}

impl Default for OpCatalog {
    fn default() -> Self {
        Self::with_defaults()
    }
}

fn zero_body(d: &OpDesc) -> OpBody {
    OpBody::Zero {
        stride: d.stride,
        ch_out: d.conv.ch_out,
    }
}

fn identity_body(d: &OpDesc) -> Result<OpBody> {
    if d.conv.ch_in != d.conv.ch_out || d.stride != 1 {
        return Err(MosaicError::ShapeMismatch {
            expected: "identity with ch_in == ch_out at stride 1".to_string(),
            actual: format!(
                "{}x{} stride {}",
                d.conv.ch_in, d.conv.ch_out, d.stride
            ),
        });
    }
    Ok(OpBody::Identity)
}

fn pool_body(d: &OpDesc, kind: PoolKind, kernel: usize) -> Result<OpBody> {
    if d.conv.ch_in != d.conv.ch_out {
        return Err(MosaicError::ShapeMismatch {
            expected: "pooling with ch_in == ch_out".to_string(),
            actual: format!("{}x{}", d.conv.ch_in, d.conv.ch_out),
        });
    }
    Ok(OpBody::Stack(Stack::new(vec![Layer::Pool(Pool2d::new(
        kind, kernel, d.stride, 1,
    ))])))
}

/// Depthwise separable convolution: two stacked depthwise + pointwise
/// pairs, the first carrying the stride.
fn sep_conv_body(d: &OpDesc, kernel: usize, padding: usize, rng: &mut Xoshiro256PlusPlus) -> OpBody {
    let (ci, co) = (d.conv.ch_in, d.conv.ch_out);
    OpBody::Stack(Stack::new(vec![
        Layer::Relu,
        Layer::Conv(Conv2d::new(
            ci,
            ci,
            (kernel, kernel),
            d.stride,
            (padding, padding),
            1,
            ci,
            rng,
        )),
        Layer::Conv(Conv2d::new(ci, co, (1, 1), 1, (0, 0), 1, 1, rng)),
        Layer::Relu,
        Layer::Conv(Conv2d::new(
            co,
            co,
            (kernel, kernel),
            1,
            (padding, padding),
            1,
            co,
            rng,
        )),
        Layer::Conv(Conv2d::new(co, co, (1, 1), 1, (0, 0), 1, 1, rng)),
    ]))
}

/// Dilated depthwise separable convolution.
fn dil_conv_body(
    d: &OpDesc,
    kernel: usize,
    padding: usize,
    dilation: usize,
    rng: &mut Xoshiro256PlusPlus,
) -> OpBody {
    let (ci, co) = (d.conv.ch_in, d.conv.ch_out);
    OpBody::Stack(Stack::new(vec![
        Layer::Relu,
        Layer::Conv(Conv2d::new(
            ci,
            ci,
            (kernel, kernel),
            d.stride,
            (padding, padding),
            dilation,
            ci,
            rng,
        )),
        Layer::Conv(Conv2d::new(ci, co, (1, 1), 1, (0, 0), 1, 1, rng)),
    ]))
}

/// Factorized convolution: ReLU, Kx1, then 1xK.
fn fac_conv_body(
    d: &OpDesc,
    kernel: usize,
    padding: usize,
    rng: &mut Xoshiro256PlusPlus,
) -> OpBody {
    let (ci, co) = (d.conv.ch_in, d.conv.ch_out);
    OpBody::Stack(Stack::new(vec![
        Layer::Relu,
        Layer::Conv(Conv2d::new(
            ci,
            ci,
            (kernel, 1),
            d.stride,
            (padding, 0),
            1,
            1,
            rng,
        )),
        Layer::Conv(Conv2d::new(ci, co, (1, kernel), 1, (0, padding), 1, 1, rng)),
    ]))
}
