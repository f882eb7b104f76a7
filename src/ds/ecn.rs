//! Merged recomputation-cost classes (union-find with a summed payload).
//!
//! When a chain of pools is evicted together, recomputing any one of them
//! means recomputing the others: their cost estimates are coupled. Each
//! evicted pool holds a node in this forest; merging two nodes declares
//! "these recomputations are now one unit" and the class representative
//! carries the summed cost for the whole unit.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────────────┐
//! │                            EcnForest Layout                            │
//! │                                                                        │
//! │   nodes: Vec<Node>            (arena; EcnId = index, never freed)      │
//! │                                                                        │
//! │     id  parent  rank  cost                                             │
//! │    ┌───┬──────┬─────┬────────┐                                         │
//! │    │ 0 │  2   │  0  │   -    │      2 (root, cost = 10+7+3)            │
//! │    │ 1 │  2   │  0  │   -    │     ╱ ╲                                 │
//! │    │ 2 │  -   │  1  │  20ms  │    0   1                                │
//! │    │ 3 │  -   │  0  │   5ms  │                                         │
//! │    └───┴──────┴─────┴────────┘   3 (root, singleton)                   │
//! │                                                                        │
//! │   merge(0, 3):                                                         │
//! │     find(0) → 2, find(3) → 3                                           │
//! │     attach 3 under 2 (by rank), cost[2] = 20ms + 5ms = 25ms            │
//! │                                                                        │
//! │   get(1) → find(1) → 2 → 25ms   (any member sees the class total)      │
//! └────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Operations
//!
//! | Operation        | Description                                | Complexity |
//! |------------------|--------------------------------------------|------------|
//! | `seed`           | New singleton class with an initial cost   | O(1)       |
//! | `merge`          | Union two classes, summing their costs     | O(α(n))    |
//! | `get` / `update` | Read/write the class total via any member  | O(α(n))    |
//! | `find`           | Class representative (for deduplication)   | O(α(n))    |
//!
//! Lookups take `&mut self`: `find` performs path compression, so reads
//! flatten chains as a side effect. Merge totals are order-independent
//! (summation), so `merge(merge(a,b),c)` and `merge(a,merge(b,c))` agree.
//!
//! ## Example Usage
//!
//! ```
//! use std::time::Duration;
//!
//! use rematkit::ds::{EcnForest, EcnId};
//!
//! let mut forest = EcnForest::new();
//! let a = forest.seed(Duration::from_millis(10));
//! let b = forest.seed(Duration::from_millis(7));
//! let c = forest.seed(Duration::from_millis(3));
//!
//! forest.merge(a, b);
//! forest.merge(b, c);
//!
//! // Any member resolves to the class total.
//! assert_eq!(forest.get(c), Duration::from_millis(20));
//!
//! // Un-evicting the pool that contributed `b` withdraws its share.
//! let total = forest.get(b);
//! forest.update(b, total - Duration::from_millis(7));
//! assert_eq!(forest.get(a), Duration::from_millis(13));
//! ```
//!
//! ## Thread Safety
//!
//! `EcnForest` is not thread-safe; the engine keeps a single arena for all
//! devices behind one lock, so chains that span devices stay mergeable.

use std::time::Duration;

/// Handle to a node in an [`EcnForest`].
///
/// Plain arena index: cheap to copy, valid for the forest's lifetime, and
/// meaningless across forests. Nodes are never freed; an id stays usable
/// after its class is merged away (it resolves to the representative).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EcnId(usize);

#[derive(Debug, Clone)]
struct Node {
    parent: Option<EcnId>,
    rank: u8,
    cost: Duration,
}

/// Union-find forest of merged recomputation-cost classes.
///
/// See the [module docs](self) for layout and merge semantics.
///
/// # Example
///
/// ```
/// use std::time::Duration;
///
/// use rematkit::ds::EcnForest;
///
/// let mut forest = EcnForest::new();
/// let a = forest.seed(Duration::from_secs(1));
/// let b = forest.seed(Duration::from_secs(2));
/// let root = forest.merge(a, b);
/// assert_eq!(forest.get(root), Duration::from_secs(3));
/// assert_eq!(forest.find(a), forest.find(b));
/// ```
#[derive(Debug, Default)]
pub struct EcnForest {
    nodes: Vec<Node>,
}

impl EcnForest {
    /// Creates an empty forest.
    pub fn new() -> Self {
        Self { nodes: Vec::new() }
    }

    /// Creates an empty forest with pre-allocated node capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            nodes: Vec::with_capacity(capacity),
        }
    }

    /// Total nodes ever seeded (live plus merged-away).
    #[inline]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True when no node has been seeded yet.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Number of distinct classes currently in the forest.
    pub fn classes(&self) -> usize {
        self.nodes.iter().filter(|n| n.parent.is_none()).count()
    }

    /// Creates a new singleton class carrying `cost`.
    pub fn seed(&mut self, cost: Duration) -> EcnId {
        let id = EcnId(self.nodes.len());
        self.nodes.push(Node {
            parent: None,
            rank: 0,
            cost,
        });
        id
    }

    /// Returns the representative of `id`'s class, compressing the path.
    pub fn find(&mut self, id: EcnId) -> EcnId {
        let mut root = id;
        while let Some(parent) = self.nodes[root.0].parent {
            root = parent;
        }
        let mut cur = id;
        while let Some(parent) = self.nodes[cur.0].parent {
            self.nodes[cur.0].parent = Some(root);
            cur = parent;
        }
        root
    }

    /// True when `a` and `b` currently belong to the same class.
    pub fn same_class(&mut self, a: EcnId, b: EcnId) -> bool {
        self.find(a) == self.find(b)
    }

    /// Unions the classes of `a` and `b`, summing their costs.
    ///
    /// Returns the surviving representative. Merging two members of the same
    /// class is a no-op (the total is not double-counted).
    pub fn merge(&mut self, a: EcnId, b: EcnId) -> EcnId {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra == rb {
            return ra;
        }
        let total = self.nodes[ra.0].cost.saturating_add(self.nodes[rb.0].cost);
        let (winner, loser) = if self.nodes[ra.0].rank >= self.nodes[rb.0].rank {
            (ra, rb)
        } else {
            (rb, ra)
        };
        if self.nodes[ra.0].rank == self.nodes[rb.0].rank {
            self.nodes[winner.0].rank += 1;
        }
        self.nodes[loser.0].parent = Some(winner);
        self.nodes[loser.0].cost = Duration::ZERO;
        self.nodes[winner.0].cost = total;
        winner
    }

    /// Current cost total of `id`'s class.
    pub fn get(&mut self, id: EcnId) -> Duration {
        let root = self.find(id);
        self.nodes[root.0].cost
    }

    /// Overwrites the cost total of `id`'s class.
    pub fn update(&mut self, id: EcnId, cost: Duration) {
        let root = self.find(id);
        self.nodes[root.0].cost = cost;
    }

    /// Validates structural invariants; debug/test builds only.
    #[cfg(any(test, debug_assertions))]
    pub fn debug_validate_invariants(&self) {
        for (i, node) in self.nodes.iter().enumerate() {
            if let Some(parent) = node.parent {
                assert!(parent.0 < self.nodes.len(), "parent of node {i} out of bounds");
                assert_ne!(parent.0, i, "node {i} is its own parent");
            }
            // Chains terminate: walking up must reach a root within n steps.
            let mut cur = EcnId(i);
            let mut steps = 0usize;
            while let Some(parent) = self.nodes[cur.0].parent {
                cur = parent;
                steps += 1;
                assert!(steps <= self.nodes.len(), "parent cycle through node {i}");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
