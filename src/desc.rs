//! Serializable model descriptions
//!
//! A `ModelDesc` is the sole persisted unit of architecture state: an
//! ordered sequence of cells, each a small DAG of nodes and edges whose
//! candidates reference operations by catalog name. Descriptions are
//! value objects; every transformation (finalize, growth) produces a new
//! instance rather than editing in place.

use ndarray::ArrayD;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{MosaicError, Result};
use crate::ops::OpCatalog;

/// Catalog name of the no-connection operation.
pub const NONE_OP: &str = "none";

/// Shape parameters shared by every candidate on an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvMacroParams {
    pub ch_in: usize,
    pub ch_out: usize,
}

impl ConvMacroParams {
    pub fn new(ch_in: usize, ch_out: usize) -> Self {
        Self { ch_in, ch_out }
    }
}

/// Snapshot of an operation's trainable parameters, in visit order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainState {
    pub tensors: Vec<ArrayD<f64>>,
}

/// Identifies a catalog operation and the shape parameters to
/// instantiate it with. Immutable once attached to an edge, except for
/// `trainables` which is overwritten when parameters are snapshotted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpDesc {
    pub name: String,
    pub conv: ConvMacroParams,
    pub stride: usize,
    #[serde(default)]
    pub extra: BTreeMap<String, f64>,
    #[serde(default)]
    pub trainables: Option<TrainState>,
}

impl OpDesc {
    pub fn new(name: impl Into<String>, conv: ConvMacroParams, stride: usize) -> Self {
        Self {
            name: name.into(),
            conv,
            stride,
            extra: BTreeMap::new(),
            trainables: None,
        }
    }
}

/// An edge from `src` into its owning node.
///
/// While searching, `alphas` (if present) seed the per-candidate
/// architecture weights; after finalization `discrete` is set, exactly
/// one candidate remains and `alphas` is absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeDesc {
    pub src: usize,
    pub candidates: Vec<OpDesc>,
    #[serde(default)]
    pub alphas: Option<Vec<f64>>,
    #[serde(default)]
    pub discrete: bool,
}

impl EdgeDesc {
    /// Searchable edge whose candidates all share the same macro params.
    pub fn new(src: usize, names: &[&str], conv: ConvMacroParams, stride: usize) -> Self {
        Self {
            src,
            candidates: names
                .iter()
                .map(|n| OpDesc::new(*n, conv, stride))
                .collect(),
            alphas: None,
            discrete: false,
        }
    }

    /// Discrete single-candidate edge, as emitted by finalization.
    pub fn fixed(src: usize, op: OpDesc) -> Self {
        Self {
            src,
            candidates: vec![op],
            alphas: None,
            discrete: true,
        }
    }
}

/// A graph vertex: the ordered set of its incoming edges. The node's
/// output is the sum of its edge outputs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeDesc {
    pub edges: Vec<EdgeDesc>,
}

/// A reusable subgraph. Node 0 is the cell input and carries no edges;
/// every other node's edges reference strictly earlier nodes, so cells
/// are acyclic by construction. The cell output is the sum of all
/// internal node outputs.
///
/// In a reduction cell, edges sourced at the cell input use stride 2
/// (and may change channel count); internal edges are stride 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellDesc {
    pub reduction: bool,
    pub ch_in: usize,
    pub ch_out: usize,
    pub nodes: Vec<NodeDesc>,
}

impl CellDesc {
    pub fn new(reduction: bool, ch_in: usize, ch_out: usize) -> Self {
        Self {
            reduction,
            ch_in,
            ch_out,
            nodes: vec![NodeDesc::default()],
        }
    }

    /// Append an internal node with the given incoming edges.
    pub fn add_node(&mut self, edges: Vec<EdgeDesc>) {
        self.nodes.push(NodeDesc { edges });
    }

    /// Expected stride for an edge sourced at `src`.
    pub fn edge_stride(&self, src: usize) -> usize {
        if self.reduction && src == 0 {
            2
        } else {
            1
        }
    }

    /// Expected macro params for an edge sourced at `src`.
    pub fn edge_conv(&self, src: usize) -> ConvMacroParams {
        if src == 0 {
            ConvMacroParams::new(self.ch_in, self.ch_out)
        } else {
            ConvMacroParams::new(self.ch_out, self.ch_out)
        }
    }
}

/// The full architecture: stem, cells, head, and global shape metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDesc {
    pub ch_in: usize,
    pub n_classes: usize,
    pub stem: OpDesc,
    pub cells: Vec<CellDesc>,
    pub head: OpDesc,
}

impl ModelDesc {
    pub fn new(ch_in: usize, n_classes: usize, stem: OpDesc, cells: Vec<CellDesc>, head: OpDesc) -> Self {
        Self {
            ch_in,
            n_classes,
            stem,
            cells,
            head,
        }
    }

    /// Total internal node count across all cells.
    pub fn n_nodes(&self) -> usize {
        self.cells.iter().map(|c| c.nodes.len() - 1).sum()
    }

    /// Check structural invariants: catalog membership, acyclicity,
    /// channel consistency along every stem-to-head path, and edge
    /// discreteness rules. Construction errors are fatal and never
    /// retried.
    pub fn validate(&self, catalog: &OpCatalog) -> Result<()> {
        if self.cells.is_empty() {
            return Err(MosaicError::InvalidDescription(
                "model has no cells".to_string(),
            ));
        }
        for op in [&self.stem, &self.head] {
            if !catalog.contains(&op.name) {
                return Err(MosaicError::UnknownOperation(op.name.clone()));
            }
        }
        if self.stem.conv.ch_in != self.ch_in {
            return Err(shape_err(self.ch_in, self.stem.conv.ch_in, "stem ch_in"));
        }
        if self.head.conv.ch_out != self.n_classes {
            return Err(shape_err(self.n_classes, self.head.conv.ch_out, "head ch_out"));
        }

        let mut ch = self.stem.conv.ch_out;
        for (ci, cell) in self.cells.iter().enumerate() {
            if cell.ch_in != ch {
                return Err(shape_err(ch, cell.ch_in, &format!("cell {ci} ch_in")));
            }
            if cell.nodes.is_empty() || !cell.nodes[0].edges.is_empty() {
                return Err(MosaicError::InvalidDescription(format!(
                    "cell {ci}: node 0 must be the edgeless input node"
                )));
            }
            if cell.nodes.len() < 2 {
                return Err(MosaicError::InvalidDescription(format!(
                    "cell {ci}: no internal nodes"
                )));
            }
            for (ni, node) in cell.nodes.iter().enumerate().skip(1) {
                for (ei, edge) in node.edges.iter().enumerate() {
                    self.validate_edge(catalog, cell, ci, ni, ei, edge)?;
                }
            }
            ch = cell.ch_out;
        }
        if self.head.conv.ch_in != ch {
            return Err(shape_err(ch, self.head.conv.ch_in, "head ch_in"));
        }
        Ok(())
    }

    fn validate_edge(
        &self,
        catalog: &OpCatalog,
        cell: &CellDesc,
        ci: usize,
        ni: usize,
        ei: usize,
        edge: &EdgeDesc,
    ) -> Result<()> {
        let at = format!("cell {ci} node {ni} edge {ei}");
        if edge.src >= ni {
            return Err(MosaicError::InvalidDescription(format!(
                "{at}: src {} does not precede its node",
                edge.src
            )));
        }
        if edge.candidates.is_empty() {
            return Err(MosaicError::InvalidDescription(format!(
                "{at}: empty candidate list"
            )));
        }
        if edge.discrete && (edge.candidates.len() != 1 || edge.alphas.is_some()) {
            return Err(MosaicError::InvalidDescription(format!(
                "{at}: discrete edge must hold exactly one candidate and no alphas"
            )));
        }
        if let Some(alphas) = &edge.alphas {
            if alphas.len() != edge.candidates.len() {
                return Err(MosaicError::InvalidDescription(format!(
                    "{at}: {} alphas for {} candidates",
                    alphas.len(),
                    edge.candidates.len()
                )));
            }
        }
        let conv = cell.edge_conv(edge.src);
        let stride = cell.edge_stride(edge.src);
        for op in &edge.candidates {
            if !catalog.contains(&op.name) {
                return Err(MosaicError::UnknownOperation(op.name.clone()));
            }
            if op.conv != conv || op.stride != stride {
                return Err(shape_err_str(
                    &format!("{}x{} stride {}", conv.ch_in, conv.ch_out, stride),
                    &format!("{}x{} stride {}", op.conv.ch_in, op.conv.ch_out, op.stride),
                ));
            }
        }
        Ok(())
    }
}

fn shape_err(expected: usize, actual: usize, what: &str) -> MosaicError {
    MosaicError::ShapeMismatch {
        expected: format!("{what} = {expected}"),
        actual: actual.to_string(),
    }
}

fn shape_err_str(expected: &str, actual: &str) -> MosaicError {
    MosaicError::ShapeMismatch {
        expected: expected.to_string(),
        actual: actual.to_string(),
    }
}
