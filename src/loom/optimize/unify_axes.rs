use rustc_hash::FxHashMap as HashMap;

use super::{OptimizeError, OptimizeRule};
use crate::{
    config::Config,
    loom::{LoomError, axis::Axis, graph::Graph},
};

/// Merges axis identities known to denote the same dimension.
///
/// Constraints come from user hints and, optionally, from requiring the first axis of every
/// graph output to be the batch axis. A named axis always wins over a free one; two distinct
/// named axes never unify.
#[derive(Debug, Default, Clone)]
pub struct UnifyAxes {
    hints: Vec<(Axis, Axis)>,
    batch_first: bool,
}

impl UnifyAxes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            hints: config.axis_hints.clone(),
            batch_first: config.batch_first,
        }
    }

    pub fn hint(mut self, x: Axis, y: Axis) -> Self {
        self.hints.push((x, y));
        self
    }

    pub fn batch_first(mut self, enabled: bool) -> Self {
        self.batch_first = enabled;
        self
    }
}

#[derive(Debug, Default)]
struct UnionFind {
    parent: HashMap<Axis, Axis>,
}

impl UnionFind {
    /// Finds the representative of `axis` and folds the path.
    fn find(&mut self, axis: &Axis) -> Axis {
        let mut root = axis.clone();
        while let Some(parent) = self.parent.get(&root) {
            root = parent.clone();
        }
        if &root != axis {
            self.parent.insert(axis.clone(), root.clone());
        }
        root
    }

    fn union(&mut self, x: &Axis, y: &Axis) -> Result<(), LoomError> {
        let x = self.find(x);
        let y = self.find(y);
        if x == y {
            return Ok(());
        }
        let (root, child) = match (x.is_free(), y.is_free()) {
            (false, false) => return Err(LoomError::AxisConflict(x, y)),
            (false, true) => (x, y),
            (true, false) => (y, x),
            (true, true) if x.id() < y.id() => (x, y),
            (true, true) => (y, x),
        };
        self.parent.insert(child, root);
        Ok(())
    }
}

impl OptimizeRule for UnifyAxes {
    fn name(&self) -> &str {
        "unify_axes"
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    fn optimize(&self, graph: &mut Graph) -> Result<bool, OptimizeError> {
        let mut constraints = self.hints.clone();
        if self.batch_first {
            for id in graph.outputs() {
                if let Some(axis) = graph.variable(id)?.order().first() {
                    constraints.push((axis.clone(), Axis::N));
                }
            }
        }

        let mut sets = UnionFind::default();
        for (x, y) in &constraints {
            sets.union(x, y)?;
        }

        let mut map = HashMap::default();
        for (x, y) in &constraints {
            for axis in [x, y] {
                let root = sets.find(axis);
                if &root != axis {
                    map.insert(axis.clone(), root);
                }
            }
        }
        if map.is_empty() {
            return Ok(false);
        }

        let changed = graph.rename_axes(|axis| map.get(axis).cloned().unwrap_or_else(|| axis.clone()))?;
        Ok(changed)
    }
}
