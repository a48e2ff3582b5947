//! Incremental growth: propose larger descriptions from a finalized one
//!
//! Each candidate adds one node to one cell, wired from a subset of
//! existing nodes with a configured candidate operation set and
//! uniformly re-initialized alphas. Candidates are probed concurrently
//! by an injected trainer; a probe whose training diverges is scored
//! worst and discarded, never propagated. The best candidate is
//! accepted only if it beats the baseline by a margin.

use std::collections::BTreeSet;

use rayon::prelude::*;
use tracing::{debug, info};

use crate::desc::{EdgeDesc, ModelDesc};
use crate::error::{MosaicError, Result};

/// Knobs for the growth loop.
#[derive(Debug, Clone)]
pub struct GrowthConfig {
    /// Stop growing a cell once it holds this many internal nodes.
    pub max_nodes: usize,
    /// A candidate must beat the baseline by this much to be accepted.
    pub margin: f64,
    /// Catalog names offered on every new edge; names illegal for an
    /// edge's shape (e.g. identity across a channel change) are
    /// filtered out per edge.
    pub candidate_ops: Vec<String>,
    /// Number of source nodes each new node is wired from.
    pub edges_per_node: usize,
    /// Upper bound on candidates probed per round.
    pub max_candidates: usize,
}

impl Default for GrowthConfig {
    fn default() -> Self {
        Self {
            max_nodes: 4,
            margin: 0.0,
            candidate_ops: vec![
                "identity".to_string(),
                "none".to_string(),
                "skip_connect".to_string(),
                "sep_conv_3x3".to_string(),
                "max_pool_3x3".to_string(),
            ],
            edges_per_node: 1,
            max_candidates: 16,
        }
    }
}

/// One probed expansion candidate.
#[derive(Debug, Clone)]
pub struct CandidateScore {
    pub cell: usize,
    pub sources: Vec<usize>,
    /// `None` when the probe diverged (scored worst, discarded).
    pub score: Option<f64>,
}

/// Outcome of one growth round.
#[derive(Debug, Clone)]
pub struct GrowthStep {
    pub desc: ModelDesc,
    pub accepted: bool,
    pub baseline: f64,
    pub best_score: Option<f64>,
    pub candidates: Vec<CandidateScore>,
}

/// Progressive growth over finalized descriptions.
pub struct GrowthSearch {
    config: GrowthConfig,
    exhausted: BTreeSet<usize>,
}

impl GrowthSearch {
    pub fn new(config: GrowthConfig) -> Self {
        Self {
            config,
            exhausted: BTreeSet::new(),
        }
    }

    /// Candidate expansions of `base`: per eligible cell, one new node
    /// per source-subset, in deterministic order.
    pub fn propose(&self, base: &ModelDesc) -> Vec<(usize, Vec<usize>, ModelDesc)> {
        let mut out = Vec::new();
        for (ci, cell) in base.cells.iter().enumerate() {
            if self.exhausted.contains(&ci) {
                continue;
            }
            let internal = cell.nodes.len() - 1;
            if internal >= self.config.max_nodes {
                continue;
            }
            for sources in combinations(cell.nodes.len(), self.config.edges_per_node) {
                if out.len() >= self.config.max_candidates {
                    debug!(
                        cap = self.config.max_candidates,
                        "candidate cap reached, remaining expansions skipped this round"
                    );
                    return out;
                }
                if let Some(candidate) = self.expand(base, ci, &sources) {
                    out.push((ci, sources, candidate));
                }
            }
        }
        out
    }

    /// New description with one node appended to cell `ci`, wired from
    /// `sources`. Returns `None` when no legal candidate op remains on
    /// some edge.
    fn expand(&self, base: &ModelDesc, ci: usize, sources: &[usize]) -> Option<ModelDesc> {
        let cell = &base.cells[ci];
        let mut edges = Vec::with_capacity(sources.len());
        for &src in sources {
            let conv = cell.edge_conv(src);
            let stride = cell.edge_stride(src);
            let names: Vec<&str> = self
                .config
                .candidate_ops
                .iter()
                .map(|s| s.as_str())
                .filter(|name| op_fits(name, conv.ch_in, conv.ch_out, stride))
                .collect();
            if names.is_empty() {
                return None;
            }
            let mut edge = EdgeDesc::new(src, &names, conv, stride);
            // uniform re-initialization: no candidate favored
            edge.alphas = Some(vec![0.0; edge.candidates.len()]);
            edges.push(edge);
        }
        let mut desc = base.clone();
        desc.cells[ci].add_node(edges);
        Some(desc)
    }

    /// One growth round: probe every candidate, accept the best if it
    /// clears the margin, otherwise mark the probed cells exhausted.
    ///
    /// Probes run concurrently over isolated descriptions; scores are
    /// aggregated only after every probe completes. A probe failing
    /// with `NonFiniteLoss` (or returning a non-finite score) is scored
    /// worst; any other probe error is a real failure and propagates.
    pub fn grow_once<F>(&mut self, base: &ModelDesc, baseline: f64, probe: &F) -> Result<GrowthStep>
    where
        F: Fn(&ModelDesc) -> Result<f64> + Sync,
    {
        let proposals = self.propose(base);
        if proposals.is_empty() {
            return Ok(GrowthStep {
                desc: base.clone(),
                accepted: false,
                baseline,
                best_score: None,
                candidates: Vec::new(),
            });
        }

        let results: Vec<Result<f64>> = proposals
            .par_iter()
            .map(|(_, _, desc)| probe(desc))
            .collect();

        let mut candidates = Vec::with_capacity(proposals.len());
        let mut scores = Vec::with_capacity(proposals.len());
        for ((ci, sources, _), result) in proposals.iter().zip(results) {
            let score = match result {
                Ok(s) if s.is_finite() => Some(s),
                Ok(_) | Err(MosaicError::NonFiniteLoss { .. }) => None,
                Err(e) => return Err(e),
            };
            candidates.push(CandidateScore {
                cell: *ci,
                sources: sources.clone(),
                score,
            });
            scores.push(score);
        }

        let best = scores
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.map(|s| (i, s)))
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal).then(b.0.cmp(&a.0)));

        match best {
            Some((i, score)) if score > baseline + self.config.margin => {
                let (ci, sources, desc) = proposals.into_iter().nth(i).expect("index in range");
                info!(cell = ci, ?sources, score, baseline, "expansion accepted");
                Ok(GrowthStep {
                    desc,
                    accepted: true,
                    baseline,
                    best_score: Some(score),
                    candidates,
                })
            }
            _ => {
                for (ci, _, _) in &proposals {
                    self.exhausted.insert(*ci);
                }
                info!(baseline, "no expansion beat the baseline; directions exhausted");
                Ok(GrowthStep {
                    desc: base.clone(),
                    accepted: false,
                    baseline,
                    best_score: best.map(|(_, s)| s),
                    candidates,
                })
            }
        }
    }

    /// Grow until no candidate improves the baseline or every cell is
    /// at its node budget. The baseline score moves with each accepted
    /// expansion.
    pub fn run<F>(&mut self, base: &ModelDesc, probe: &F) -> Result<ModelDesc>
    where
        F: Fn(&ModelDesc) -> Result<f64> + Sync,
    {
        let mut current = base.clone();
        let mut baseline = probe(&current)?;
        loop {
            let step = self.grow_once(&current, baseline, probe)?;
            if !step.accepted {
                return Ok(current);
            }
            baseline = step.best_score.expect("accepted step has a score");
            current = step.desc;
        }
    }
}

/// Whether an operation is legal on an edge with the given shape.
fn op_fits(name: &str, ch_in: usize, ch_out: usize, stride: usize) -> bool {
    match name {
        "identity" => ch_in == ch_out && stride == 1,
        "max_pool_3x3" | "avg_pool_3x3" => ch_in == ch_out,
        "skip_connect" => stride == 1 && ch_in == ch_out || stride == 2 && ch_out % 2 == 0,
        _ => true,
    }
}

/// k-subsets of 0..n in lexicographic order.
fn combinations(n: usize, k: usize) -> Vec<Vec<usize>> {
    if k == 0 || k > n {
        return Vec::new();
    }
    let mut out = Vec::new();
    let mut current = Vec::with_capacity(k);
    fn rec(start: usize, n: usize, k: usize, current: &mut Vec<usize>, out: &mut Vec<Vec<usize>>) {
        if current.len() == k {
            out.push(current.clone());
            return;
        }
        for i in start..n {
            current.push(i);
            rec(i + 1, n, k, current, out);
            current.pop();
        }
    }
    rec(0, n, k, &mut current, &mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::desc::{CellDesc, ConvMacroParams, OpDesc};
    use crate::ops::OpCatalog;

    /// A finalized three-node single-cell baseline.
    fn base_desc() -> ModelDesc {
        let ch = ConvMacroParams::new(4, 4);
        let mut cell = CellDesc::new(false, 4, 4);
        cell.add_node(vec![EdgeDesc::fixed(0, OpDesc::new("sep_conv_3x3", ch, 1))]);
        cell.add_node(vec![EdgeDesc::fixed(1, OpDesc::new("identity", ch, 1))]);
        ModelDesc::new(
            4,
            2,
            OpDesc::new("stem", ConvMacroParams::new(4, 4), 1),
            vec![cell],
            OpDesc::new("pool_linear", ConvMacroParams::new(4, 2), 1),
        )
    }

    #[test]
    fn test_combinations_order() {
        assert_eq!(combinations(3, 1), vec![vec![0], vec![1], vec![2]]);
        assert_eq!(
            combinations(3, 2),
            vec![vec![0, 1], vec![0, 2], vec![1, 2]]
        );
        assert!(combinations(2, 3).is_empty());
    }

    #[test]
    fn test_propose_adds_one_node_per_candidate() {
        let growth = GrowthSearch::new(GrowthConfig::default());
        let base = base_desc();
        let proposals = growth.propose(&base);
        // sources 0, 1 and 2 of the single cell
        assert_eq!(proposals.len(), 3);
        for (ci, _, desc) in &proposals {
            assert_eq!(*ci, 0);
            assert_eq!(desc.n_nodes(), base.n_nodes() + 1);
            desc.validate(&OpCatalog::with_defaults()).unwrap();
        }
    }

    #[test]
    fn test_new_edges_have_uniform_alphas() {
        let growth = GrowthSearch::new(GrowthConfig::default());
        let proposals = growth.propose(&base_desc());
        let (_, _, desc) = &proposals[0];
        let new_node = desc.cells[0].nodes.last().unwrap();
        for edge in &new_node.edges {
            let alphas = edge.alphas.as_ref().unwrap();
            assert!(alphas.iter().all(|&a| a == 0.0));
            assert_eq!(alphas.len(), edge.candidates.len());
        }
    }

    #[test]
    fn test_accepts_best_candidate_above_margin() {
        // baseline 0.70; candidates score by wiring source: 0 -> 0.68,
        // 1 -> 0.71, 2 -> 0.69
        let mut growth = GrowthSearch::new(GrowthConfig::default());
        let base = base_desc();
        let probe = |desc: &ModelDesc| -> Result<f64> {
            if desc.n_nodes() == 2 {
                return Ok(0.70);
            }
            let src = desc.cells[0].nodes.last().unwrap().edges[0].src;
            Ok(match src {
                0 => 0.68,
                1 => 0.71,
                _ => 0.69,
            })
        };

        let step = growth.grow_once(&base, 0.70, &probe).unwrap();
        assert!(step.accepted);
        assert_eq!(step.best_score, Some(0.71));
        assert_eq!(step.desc.n_nodes(), base.n_nodes() + 1);
        assert_eq!(step.desc.cells[0].nodes.last().unwrap().edges[0].src, 1);
    }

    #[test]
    fn test_rejects_when_no_candidate_clears_margin() {
        let mut growth = GrowthSearch::new(GrowthConfig {
            margin: 0.05,
            ..Default::default()
        });
        let base = base_desc();
        let probe = |_: &ModelDesc| -> Result<f64> { Ok(0.72) };

        let step = growth.grow_once(&base, 0.70, &probe).unwrap();
        assert!(!step.accepted);
        assert_eq!(step.desc, base);
        // the cell is now exhausted; later rounds propose nothing
        let step2 = growth.grow_once(&base, 0.70, &probe).unwrap();
        assert!(step2.candidates.is_empty());
    }

    #[test]
    fn test_diverged_probe_scored_worst_not_propagated() {
        let mut growth = GrowthSearch::new(GrowthConfig::default());
        let base = base_desc();
        let probe = |desc: &ModelDesc| -> Result<f64> {
            let src = desc.cells[0].nodes.last().unwrap().edges[0].src;
            match src {
                0 => Err(MosaicError::NonFiniteLoss {
                    step: 3,
                    value: f64::NAN,
                }),
                1 => Ok(f64::INFINITY),
                _ => Ok(0.71),
            }
        };

        let step = growth.grow_once(&base, 0.70, &probe).unwrap();
        assert!(step.accepted);
        assert_eq!(step.best_score, Some(0.71));
        assert_eq!(step.candidates.iter().filter(|c| c.score.is_none()).count(), 2);
    }

    #[test]
    fn test_run_stops_at_node_budget() {
        let mut growth = GrowthSearch::new(GrowthConfig {
            max_nodes: 4,
            ..Default::default()
        });
        let base = base_desc();
        // strictly increasing scores: every proposed expansion improves
        let probe =
            |desc: &ModelDesc| -> Result<f64> { Ok(desc.n_nodes() as f64) };

        let grown = growth.run(&base, &probe).unwrap();
        assert_eq!(grown.n_nodes(), 4);
        assert!(grown.validate(&OpCatalog::with_defaults()).is_ok());
    }
}
