//! PowersDag: turning a few source powers into all target powers
//!
//! The receiver encrypts only the powers in `query_powers`; the sender must
//! reconstruct every power it needs for polynomial evaluation from those. The
//! plan for doing so is a DAG whose nodes are labeled by the power value:
//! source nodes are exactly the requested powers (in-degree 0), and every
//! other node has two parents whose labels sum to its own. One
//! ciphertext-ciphertext multiplication plus one relinearization per
//! non-source node realizes the plan.
//!
//! Construction is greedy and layered: each round adds every still-missing
//! target that is a sum of two present nodes, choosing the parent pair with
//! the smallest resulting depth (ties broken by the smallest left parent, so
//! both parties build the same DAG from the same inputs). Configuration fails
//! if some target can never be produced.

#![allow(missing_docs)]

use std::collections::BTreeSet;

use crate::{PsiError, Result};

/// One node of a configured [`PowersDag`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PowersNode {
    /// The power this node computes.
    pub power: u32,
    /// Longest distance from a source node.
    pub depth: u32,
    /// Parent powers; `None` for sources.
    pub parents: Option<(u32, u32)>,
}

/// A configured plan for computing all target powers from the source powers.
#[derive(Clone, Debug, Default)]
pub struct PowersDag {
    nodes: std::collections::BTreeMap<u32, PowersNode>,
    depth: u32,
    source_count: usize,
    configured: bool,
}

impl PowersDag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the DAG. `source_powers` must be nonempty, zero-free, and a
    /// subset of what the protocol allows; every element of `target_powers`
    /// must come out reachable.
    pub fn configure(
        &mut self,
        source_powers: &BTreeSet<u32>,
        target_powers: &BTreeSet<u32>,
    ) -> Result<()> {
        *self = Self::default();

        if source_powers.is_empty() || target_powers.is_empty() {
            return Err(PsiError::InvalidParams("powers sets must be nonempty".into()));
        }
        if source_powers.contains(&0) || target_powers.contains(&0) {
            return Err(PsiError::InvalidParams("powers must be positive".into()));
        }

        for &p in source_powers {
            self.nodes.insert(p, PowersNode { power: p, depth: 0, parents: None });
        }

        let mut missing: BTreeSet<u32> =
            target_powers.difference(source_powers).copied().collect();

        // Layered closure: each round admits every missing target expressible
        // as a sum of two already-present nodes.
        while !missing.is_empty() {
            let mut additions: Vec<PowersNode> = Vec::new();
            for &p in &missing {
                let mut best: Option<(u32, u32, u32)> = None; // (depth, a, b)
                for (&a, na) in self.nodes.range(..p) {
                    if let Some(nb) = self.nodes.get(&(p - a)) {
                        let depth = na.depth.max(nb.depth) + 1;
                        let candidate = (depth, a, p - a);
                        if best.map_or(true, |b| candidate < b) {
                            best = Some(candidate);
                        }
                    }
                }
                if let Some((depth, a, b)) = best {
                    additions.push(PowersNode { power: p, depth, parents: Some((a, b)) });
                }
            }

            if additions.is_empty() {
                return Err(PsiError::InvalidParams(format!(
                    "powers {missing:?} cannot be produced from sources {source_powers:?}"
                )));
            }
            for node in additions {
                missing.remove(&node.power);
                self.nodes.insert(node.power, node);
            }
        }

        self.depth = self.nodes.values().map(|n| n.depth).max().unwrap_or(0);
        self.source_count = source_powers.len();
        self.configured = true;
        Ok(())
    }

    #[inline]
    pub fn is_configured(&self) -> bool {
        self.configured
    }

    /// Longest source-to-node path in the configured DAG.
    #[inline]
    pub fn depth(&self) -> u32 {
        self.depth
    }

    #[inline]
    pub fn source_count(&self) -> usize {
        self.source_count
    }

    /// Look up a node by power.
    pub fn node(&self, power: u32) -> Option<&PowersNode> {
        self.nodes.get(&power)
    }

    /// All nodes in an order safe for evaluation: parents always precede
    /// children (ascending depth, then power).
    pub fn topological_nodes(&self) -> Vec<PowersNode> {
        let mut nodes: Vec<PowersNode> = self.nodes.values().copied().collect();
        nodes.sort_by_key(|n| (n.depth, n.power));
        nodes
    }
}

/// The default target set for the given evaluation strategy: all powers up to
/// `max_items_per_bin` when Paterson–Stockmeyer is off, otherwise the low
/// powers `1..=ps_low_degree` plus the "giant step" multiples of
/// `ps_low_degree + 1`.
pub fn target_powers(ps_low_degree: u32, max_items_per_bin: u32) -> BTreeSet<u32> {
    let mut targets = BTreeSet::new();
    if ps_low_degree == 0 {
        targets.extend(1..=max_items_per_bin);
    } else {
        targets.extend(1..=ps_low_degree);
        let high = ps_low_degree + 1;
        targets.extend((1..=max_items_per_bin / high).map(|k| k * high));
    }
    targets
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn set(v: &[u32]) -> BTreeSet<u32> {
        v.iter().copied().collect()
    }

    fn check_well_formed(pd: &PowersDag, sources: &BTreeSet<u32>, targets: &BTreeSet<u32>) {
        for &p in targets {
            let node = pd.node(p).unwrap_or_else(|| panic!("target {p} missing"));
            match node.parents {
                None => assert!(sources.contains(&p), "non-source {p} has no parents"),
                Some((a, b)) => {
                    assert_eq!(a + b, p);
                    let da = pd.node(a).unwrap().depth;
                    let db = pd.node(b).unwrap().depth;
                    assert_eq!(node.depth, da.max(db) + 1);
                }
            }
        }
    }

    #[test]
    fn covers_all_targets_with_log_depth() {
        let sources = set(&[1, 2, 4]);
        let targets = target_powers(0, 8);
        let mut pd = PowersDag::new();
        pd.configure(&sources, &targets).unwrap();
        check_well_formed(&pd, &sources, &targets);
        // depth <= ceil(log2(max_target)) + 1
        assert!(pd.depth() <= 4, "depth {} too deep", pd.depth());
    }

    #[test]
    fn single_source_doubles_up() {
        let sources = set(&[1]);
        let targets = target_powers(0, 16);
        let mut pd = PowersDag::new();
        pd.configure(&sources, &targets).unwrap();
        check_well_formed(&pd, &sources, &targets);
        assert!(pd.depth() <= 5);
        assert_eq!(pd.source_count(), 1);
    }

    #[test]
    fn paterson_stockmeyer_target_set() {
        // l = 2, max 8: low powers {1, 2} and multiples of 3 up to 8.
        assert_eq!(target_powers(2, 8), set(&[1, 2, 3, 6]));
        assert_eq!(target_powers(0, 4), set(&[1, 2, 3, 4]));

        let sources = set(&[1, 2, 3]);
        let targets = target_powers(2, 8);
        let mut pd = PowersDag::new();
        pd.configure(&sources, &targets).unwrap();
        check_well_formed(&pd, &sources, &targets);
    }

    #[test]
    fn unreachable_target_is_rejected() {
        // From {2} alone no odd power is expressible.
        let mut pd = PowersDag::new();
        assert!(pd.configure(&set(&[2]), &set(&[2, 3])).is_err());
        assert!(!pd.is_configured());
    }

    #[test]
    fn identical_inputs_build_identical_dags() {
        let sources = set(&[1, 3, 5]);
        let targets = target_powers(0, 20);
        let mut a = PowersDag::new();
        let mut b = PowersDag::new();
        a.configure(&sources, &targets).unwrap();
        b.configure(&sources, &targets).unwrap();
        assert_eq!(a.topological_nodes(), b.topological_nodes());
    }

    #[test]
    fn topological_order_is_parent_first() {
        let sources = set(&[1, 2]);
        let targets = target_powers(0, 10);
        let mut pd = PowersDag::new();
        pd.configure(&sources, &targets).unwrap();

        let mut seen = BTreeSet::new();
        for node in pd.topological_nodes() {
            if let Some((a, b)) = node.parents {
                assert!(seen.contains(&a) && seen.contains(&b));
            }
            seen.insert(node.power);
        }
    }
}
