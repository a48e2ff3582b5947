//! Live supernet
//!
//! Instantiates a trainable graph from a model description: every
//! searchable edge becomes a `MixedOp`, discrete edges become fixed
//! operations. Exposes two disjoint parameter partitions (ordinary
//! weights and architecture alphas) and the finalize procedure that
//! collapses the mixture into a discrete description.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use ndarray::{Array2, ArrayD};
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;

use crate::data::CrossEntropy;
use crate::desc::{CellDesc, EdgeDesc, ModelDesc, TrainState, NONE_OP};
use crate::error::{MosaicError, Result};
use crate::ops::{Op, OpCache, OpCatalog};
use crate::supernet::droppath::DropPath;
use crate::supernet::mixed::{MixedCache, MixedOp};
use crate::tensor::{Param, Tensor};

#[derive(Debug, Clone)]
enum EdgeKind {
    Mixed(MixedOp),
    Fixed(Op),
}

#[derive(Debug, Clone)]
struct LiveEdge {
    src: usize,
    kind: EdgeKind,
}

#[derive(Debug, Clone)]
enum EdgeCache {
    Mixed(MixedCache),
    Fixed(OpCache),
}

enum EdgeTrace {
    Dropped,
    Kept { cache: EdgeCache, scale: f64 },
}

struct CellTrace {
    input_shape: [usize; 4],
    edges: Vec<Vec<EdgeTrace>>,
}

impl LiveEdge {
    fn forward(&self, x: &Tensor) -> Tensor {
        match &self.kind {
            EdgeKind::Mixed(m) => m.forward(x),
            EdgeKind::Fixed(op) => op.forward(x),
        }
    }

    fn forward_cached(&self, x: &Tensor) -> (Tensor, EdgeCache) {
        match &self.kind {
            EdgeKind::Mixed(m) => {
                let (y, cache) = m.forward_cached(x);
                (y, EdgeCache::Mixed(cache))
            }
            EdgeKind::Fixed(op) => {
                let (y, cache) = op.forward_cached(x);
                (y, EdgeCache::Fixed(cache))
            }
        }
    }

    fn backward(&mut self, cache: &EdgeCache, gy: &Tensor) -> Tensor {
        match (&mut self.kind, cache) {
            (EdgeKind::Mixed(m), EdgeCache::Mixed(c)) => m.backward(c, gy),
            (EdgeKind::Fixed(op), EdgeCache::Fixed(c)) => op.backward(c, gy),
            _ => unreachable!("edge cache kind matches edge kind"),
        }
    }

    /// DropPath eligibility follows the edge's strongest candidate.
    fn can_drop_path(&self) -> bool {
        match &self.kind {
            EdgeKind::Mixed(m) => m.ops()[m.best_index()].can_drop_path(),
            EdgeKind::Fixed(op) => op.can_drop_path(),
        }
    }

    fn visit_weights(&self, f: &mut dyn FnMut(&Param)) {
        match &self.kind {
            EdgeKind::Mixed(m) => m.visit_weights(f),
            EdgeKind::Fixed(op) => op.visit_weights(f),
        }
    }

    fn visit_weights_mut(&mut self, f: &mut dyn FnMut(&mut Param)) {
        match &mut self.kind {
            EdgeKind::Mixed(m) => m.visit_weights_mut(f),
            EdgeKind::Fixed(op) => op.visit_weights_mut(f),
        }
    }
}

#[derive(Debug, Clone)]
struct LiveCell {
    reduction: bool,
    ch_out: usize,
    /// Incoming edges per node; node 0 is the cell input and has none.
    nodes: Vec<Vec<LiveEdge>>,
}

impl LiveCell {
    fn node_out_shape(&self, input: &Tensor) -> [usize; 4] {
        let (n, _, h, w) = input.dim();
        if self.reduction {
            [n, self.ch_out, (h + 1) / 2, (w + 1) / 2]
        } else {
            [n, self.ch_out, h, w]
        }
    }

    fn forward(&self, input: &Tensor) -> Tensor {
        let mut outs: Vec<Tensor> = vec![input.clone()];
        for edges in &self.nodes[1..] {
            let mut acc: Option<Tensor> = None;
            for e in edges {
                let y = e.forward(&outs[e.src]);
                acc = Some(match acc {
                    Some(a) => a + y,
                    None => y,
                });
            }
            outs.push(acc.unwrap_or_else(|| zeros(self.node_out_shape(input))));
        }
        sum_internal(&outs)
    }

    fn forward_train(
        &self,
        input: &Tensor,
        mut drop: Option<&mut DropPath>,
    ) -> (Tensor, CellTrace) {
        let (n, c, h, w) = input.dim();
        let mut outs: Vec<Tensor> = vec![input.clone()];
        let mut traces: Vec<Vec<EdgeTrace>> = vec![Vec::new()];
        for edges in &self.nodes[1..] {
            let mut acc: Option<Tensor> = None;
            let mut node_traces = Vec::with_capacity(edges.len());
            for e in edges {
                let decision = if e.can_drop_path() {
                    match drop.as_deref_mut() {
                        Some(d) => d.sample(),
                        None => Some(1.0),
                    }
                } else {
                    Some(1.0)
                };
                match decision {
                    None => node_traces.push(EdgeTrace::Dropped),
                    Some(scale) => {
                        let (y, cache) = e.forward_cached(&outs[e.src]);
                        let y = if scale == 1.0 { y } else { y * scale };
                        acc = Some(match acc {
                            Some(a) => a + y,
                            None => y,
                        });
                        node_traces.push(EdgeTrace::Kept { cache, scale });
                    }
                }
            }
            outs.push(acc.unwrap_or_else(|| zeros(self.node_out_shape(input))));
            traces.push(node_traces);
        }
        (
            sum_internal(&outs),
            CellTrace {
                input_shape: [n, c, h, w],
                edges: traces,
            },
        )
    }

    /// Backward pass through the cell DAG: nodes in reverse order,
    /// gradients accumulated per source node. Returns the gradient with
    /// respect to the cell input.
    fn backward(&mut self, trace: &CellTrace, g_out: &Tensor) -> Tensor {
        let n_nodes = self.nodes.len();
        // every internal node feeds the cell output sum
        let mut grads: Vec<Option<Tensor>> = (0..n_nodes)
            .map(|ni| if ni == 0 { None } else { Some(g_out.clone()) })
            .collect();

        for ni in (1..n_nodes).rev() {
            let g_node = match grads[ni].take() {
                Some(g) => g,
                None => continue,
            };
            for (e, t) in self.nodes[ni].iter_mut().zip(trace.edges[ni].iter()) {
                let (cache, scale) = match t {
                    EdgeTrace::Dropped => continue,
                    EdgeTrace::Kept { cache, scale } => (cache, *scale),
                };
                let gy = if scale == 1.0 {
                    g_node.clone()
                } else {
                    &g_node * scale
                };
                let gx = e.backward(cache, &gy);
                grads[e.src] = Some(match grads[e.src].take() {
                    Some(a) => a + gx,
                    None => gx,
                });
            }
        }
        grads[0].take().unwrap_or_else(|| zeros(trace.input_shape))
    }
}

fn zeros(shape: [usize; 4]) -> Tensor {
    Tensor::zeros((shape[0], shape[1], shape[2], shape[3]))
}

fn sum_internal(outs: &[Tensor]) -> Tensor {
    let mut total: Option<Tensor> = None;
    for o in &outs[1..] {
        total = Some(match total {
            Some(a) => a + o,
            None => o.clone(),
        });
    }
    total.expect("cell has internal nodes")
}

/// Loss and logits of one training step.
#[derive(Debug, Clone)]
pub struct StepStats {
    pub loss: f64,
    pub logits: Array2<f64>,
}

/// The live trainable graph containing all candidate operations.
#[derive(Debug, Clone)]
pub struct Supernet {
    desc: ModelDesc,
    stem: Op,
    cells: Vec<LiveCell>,
    head: Op,
}

impl Supernet {
    /// Build a supernet from a description. Validation and operation
    /// construction errors are fatal; a malformed description is a
    /// programming error, not a transient condition.
    pub fn new(desc: &ModelDesc, catalog: &OpCatalog, seed: u64) -> Result<Self> {
        desc.validate(catalog)?;
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
        let stem = catalog.create(&desc.stem, true, &mut rng)?;
        let mut cells = Vec::with_capacity(desc.cells.len());
        for cell_desc in &desc.cells {
            let mut nodes: Vec<Vec<LiveEdge>> = vec![Vec::new()];
            for node in &cell_desc.nodes[1..] {
                let mut edges = Vec::with_capacity(node.edges.len());
                for e in &node.edges {
                    let kind = if e.discrete {
                        EdgeKind::Fixed(catalog.create(&e.candidates[0], true, &mut rng)?)
                    } else {
                        let ops = e
                            .candidates
                            .iter()
                            .map(|c| catalog.create(c, true, &mut rng))
                            .collect::<Result<Vec<_>>>()?;
                        EdgeKind::Mixed(MixedOp::new(ops, e.alphas.as_deref(), &mut rng))
                    };
                    edges.push(LiveEdge { src: e.src, kind });
                }
                nodes.push(edges);
            }
            cells.push(LiveCell {
                reduction: cell_desc.reduction,
                ch_out: cell_desc.ch_out,
                nodes,
            });
        }
        let head = catalog.create(&desc.head, true, &mut rng)?;
        Ok(Self {
            desc: desc.clone(),
            stem,
            cells,
            head,
        })
    }

    pub fn desc(&self) -> &ModelDesc {
        &self.desc
    }

    /// Evaluation forward pass: class logits, no DropPath.
    pub fn forward(&self, x: &Tensor) -> Array2<f64> {
        let mut h = self.stem.forward(x);
        for cell in &self.cells {
            h = cell.forward(&h);
        }
        flatten_logits(self.head.forward(&h))
    }

    /// Loss of an evaluation forward pass.
    pub fn loss_on(&self, x: &Tensor, y: &[usize], loss: &CrossEntropy) -> f64 {
        loss.loss(&self.forward(x), y)
    }

    /// Full forward/backward pass. Accumulates gradients for both
    /// parameter partitions; the caller decides when to zero them and
    /// which optimizer consumes which partition.
    pub fn backward_pass(
        &mut self,
        x: &Tensor,
        y: &[usize],
        loss: &CrossEntropy,
        drop: Option<&mut DropPath>,
    ) -> StepStats {
        let (h0, stem_cache) = self.stem.forward_cached(x);
        let mut dp = drop;
        let mut traces = Vec::with_capacity(self.cells.len());
        let mut h = h0;
        for cell in &self.cells {
            let (out, trace) = cell.forward_train(&h, dp.as_deref_mut());
            traces.push(trace);
            h = out;
        }
        let (logits4, head_cache) = self.head.forward_cached(&h);
        let logits = flatten_logits(logits4);
        let (loss_val, glogits) = loss.loss_and_grad(&logits, y);

        let (n, k) = glogits.dim();
        let glogits4 = glogits
            .into_shape_with_order((n, k, 1, 1))
            .expect("unflatten logit grad");
        let mut g = self.head.backward(&head_cache, &glogits4);
        for (cell, trace) in self.cells.iter_mut().zip(traces.iter()).rev() {
            g = cell.backward(trace, &g);
        }
        self.stem.backward(&stem_cache, &g);

        StepStats {
            loss: loss_val,
            logits,
        }
    }

    // ---- parameter partitions ----------------------------------------

    /// Ordinary trainable parameters, in deterministic visit order.
    /// Never yields an architecture weight.
    pub fn visit_weights(&self, f: &mut dyn FnMut(&Param)) {
        self.stem.visit_weights(f);
        for cell in &self.cells {
            for edges in &cell.nodes {
                for e in edges {
                    e.visit_weights(f);
                }
            }
        }
        self.head.visit_weights(f);
    }

    pub fn visit_weights_mut(&mut self, f: &mut dyn FnMut(&mut Param)) {
        self.stem.visit_weights_mut(f);
        for cell in &mut self.cells {
            for edges in &mut cell.nodes {
                for e in edges {
                    e.visit_weights_mut(f);
                }
            }
        }
        self.head.visit_weights_mut(f);
    }

    /// Architecture weights, in deterministic visit order. Never yields
    /// an ordinary weight.
    pub fn visit_alphas(&self, f: &mut dyn FnMut(&Param)) {
        for cell in &self.cells {
            for edges in &cell.nodes {
                for e in edges {
                    if let EdgeKind::Mixed(m) = &e.kind {
                        f(m.alpha());
                    }
                }
            }
        }
    }

    pub fn visit_alphas_mut(&mut self, f: &mut dyn FnMut(&mut Param)) {
        for cell in &mut self.cells {
            for edges in &mut cell.nodes {
                for e in edges {
                    if let EdgeKind::Mixed(m) = &mut e.kind {
                        f(m.alpha_mut());
                    }
                }
            }
        }
    }

    pub fn n_weight_params(&self) -> usize {
        let mut n = 0;
        self.visit_weights(&mut |_| n += 1);
        n
    }

    pub fn n_alpha_params(&self) -> usize {
        let mut n = 0;
        self.visit_alphas(&mut |_| n += 1);
        n
    }

    pub fn zero_weight_grads(&mut self) {
        self.visit_weights_mut(&mut |p| p.zero_grad());
    }

    pub fn zero_alpha_grads(&mut self) {
        self.visit_alphas_mut(&mut |p| p.zero_grad());
    }

    pub fn zero_grads(&mut self) {
        self.zero_weight_grads();
        self.zero_alpha_grads();
    }

    pub fn weights_snapshot(&self) -> Vec<ArrayD<f64>> {
        let mut out = Vec::new();
        self.visit_weights(&mut |p| out.push(p.value().clone()));
        out
    }

    pub fn restore_weights(&mut self, snapshot: &[ArrayD<f64>]) {
        let mut it = snapshot.iter();
        self.visit_weights_mut(&mut |p| {
            let saved = it.next().expect("snapshot length matches weight count");
            *p.value_mut() = saved.clone();
        });
    }

    pub fn weight_grads(&self) -> Vec<ArrayD<f64>> {
        let mut out = Vec::new();
        self.visit_weights(&mut |p| out.push(p.grad().clone()));
        out
    }

    pub fn alpha_grads(&self) -> Vec<ArrayD<f64>> {
        let mut out = Vec::new();
        self.visit_alphas(&mut |p| out.push(p.grad().clone()));
        out
    }

    pub fn set_alpha_grads(&mut self, grads: &[ArrayD<f64>]) {
        let mut it = grads.iter();
        self.visit_alphas_mut(&mut |p| {
            let g = it.next().expect("gradient list matches alpha count");
            *p.grad_mut() = g.clone();
        });
    }

    // ---- finalization ------------------------------------------------

    /// Collapse the mixture into a discrete description: per node, rank
    /// incoming edges by their strongest surviving (non-`none`)
    /// candidate's alpha, keep at most `max_edges_per_node`, and retain
    /// the single best candidate on each kept edge. Ties resolve to the
    /// earlier candidate and the earlier edge. Emits a new description;
    /// the live graph is untouched.
    pub fn finalize(&self, max_edges_per_node: usize) -> ModelDesc {
        let mut cells = Vec::with_capacity(self.cells.len());
        for (cell, cell_desc) in self.cells.iter().zip(self.desc.cells.iter()) {
            let mut out = CellDesc::new(cell_desc.reduction, cell_desc.ch_in, cell_desc.ch_out);
            for edges in &cell.nodes[1..] {
                let mut ranked: Vec<(usize, f64, EdgeDesc)> = Vec::new();
                for (ei, e) in edges.iter().enumerate() {
                    match &e.kind {
                        EdgeKind::Fixed(op) => {
                            ranked.push((ei, f64::INFINITY, EdgeDesc::fixed(e.src, op.finalize().0)));
                        }
                        EdgeKind::Mixed(m) => {
                            if let Some((ci, strength)) = best_surviving(m) {
                                ranked.push((
                                    ei,
                                    strength,
                                    EdgeDesc::fixed(e.src, m.ops()[ci].finalize().0),
                                ));
                            }
                        }
                    }
                }
                ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
                ranked.truncate(max_edges_per_node);
                ranked.sort_by_key(|(ei, _, _)| *ei);
                out.add_node(ranked.into_iter().map(|(_, _, d)| d).collect());
            }
            cells.push(out);
        }
        ModelDesc::new(
            self.desc.ch_in,
            self.desc.n_classes,
            self.stem.finalize().0,
            cells,
            self.head.finalize().0,
        )
    }

    // ---- checkpoint state --------------------------------------------

    /// All parameters keyed by descriptor identity path.
    pub fn named_params(&self) -> Vec<(String, ArrayD<f64>)> {
        let mut out = Vec::new();
        push_op_state(&mut out, "stem", &self.stem);
        for (ci, cell) in self.cells.iter().enumerate() {
            for (ni, edges) in cell.nodes.iter().enumerate().skip(1) {
                for (ei, e) in edges.iter().enumerate() {
                    let prefix = format!("cell{ci}.node{ni}.edge{ei}");
                    match &e.kind {
                        EdgeKind::Fixed(op) => push_op_state(&mut out, &format!("{prefix}.op0"), op),
                        EdgeKind::Mixed(m) => {
                            for (ki, op) in m.ops().iter().enumerate() {
                                push_op_state(&mut out, &format!("{prefix}.op{ki}"), op);
                            }
                            out.push((format!("{prefix}.alpha"), m.alpha().value().clone()));
                        }
                    }
                }
            }
        }
        push_op_state(&mut out, "head", &self.head);
        out
    }

    /// Restore all parameters from a named map. Fails if any expected
    /// entry is missing or shaped differently.
    pub fn load_named_params(&mut self, params: &BTreeMap<String, ArrayD<f64>>) -> Result<()> {
        let expected = self.named_params();
        let mut restored = Vec::with_capacity(expected.len());
        for (name, current) in &expected {
            let value = params.get(name).ok_or_else(|| {
                MosaicError::InvalidDescription(format!("checkpoint is missing parameter {name}"))
            })?;
            if value.shape() != current.shape() {
                return Err(MosaicError::ShapeMismatch {
                    expected: format!("{name} {:?}", current.shape()),
                    actual: format!("{:?}", value.shape()),
                });
            }
            restored.push(value.clone());
        }

        let mut it = restored.into_iter();
        let mut assign = |p: &mut Param| {
            if let Some(v) = it.next() {
                *p.value_mut() = v;
            }
        };
        // same walk order as named_params
        self.visit_all_params_mut(&mut assign);
        Ok(())
    }

    fn visit_all_params_mut(&mut self, assign: &mut dyn FnMut(&mut Param)) {
        self.stem.visit_weights_mut(assign);
        for cell in &mut self.cells {
            for edges in &mut cell.nodes {
                for e in edges {
                    match &mut e.kind {
                        EdgeKind::Fixed(op) => op.visit_weights_mut(assign),
                        EdgeKind::Mixed(m) => {
                            m.visit_weights_mut(assign);
                            assign(m.alpha_mut());
                        }
                    }
                }
            }
        }
        self.head.visit_weights_mut(assign);
    }
}

fn push_op_state(out: &mut Vec<(String, ArrayD<f64>)>, prefix: &str, op: &Op) {
    let TrainState { tensors } = op.snapshot();
    for (i, t) in tensors.into_iter().enumerate() {
        out.push((format!("{prefix}.p{i}"), t));
    }
}

fn best_surviving(m: &MixedOp) -> Option<(usize, f64)> {
    let alpha = m.alpha().value();
    let mut best: Option<(usize, f64)> = None;
    for (i, op) in m.ops().iter().enumerate() {
        if op.name() == NONE_OP {
            continue;
        }
        let a = alpha[[i]];
        match best {
            Some((_, b)) if a <= b => {}
            _ => best = Some((i, a)),
        }
    }
    best
}

fn flatten_logits(t: Tensor) -> Array2<f64> {
    let (n, k, _, _) = t.dim();
    t.into_shape_with_order((n, k)).expect("flatten logits")
}
