use std::collections::{BTreeMap, VecDeque};

use derive_more::Display;
use rustc_hash::{FxHashMap as HashMap, FxHashSet as HashSet};
use serde::Serialize;

use crate::loom::{
    LoomError,
    graph::{Graph, VarId},
    placeholder::Placeholder,
};

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum MemorySpace {
    /// Constants, written once when the model is loaded.
    #[display("static")]
    Static,
    /// Inputs and intermediate values.
    #[display("dynamic")]
    Dynamic,
}

/// A placement in linear memory. Offsets and sizes count `f32` elements.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Allocation {
    pub space: MemorySpace,
    pub offset: Placeholder,
    pub size: Placeholder,
}

/// Placement of every variable, for linear-address backends.
#[derive(Debug, Default, Clone, Serialize)]
pub struct MemoryLayout {
    pub allocations: BTreeMap<VarId, Allocation>,
    /// Elements of the static space.
    pub static_size: usize,
    /// Elements of the dynamic space; symbolic if any dynamic size is.
    pub dynamic_size: Placeholder,
}

/// Bump allocator of the dynamic space with exact-size reuse.
#[derive(Debug, Default)]
struct Allocator {
    free: HashMap<Placeholder, VecDeque<Placeholder>>,
    top: Placeholder,
}

impl Allocator {
    fn alloc(&mut self, size: Placeholder) -> Allocation {
        let offset = match self.free.get_mut(&size).and_then(VecDeque::pop_front) {
            Some(offset) => offset,
            None => {
                let offset = self.top.clone();
                self.top = &self.top + &size;
                offset
            }
        };
        Allocation {
            space: MemorySpace::Dynamic,
            offset,
            size,
        }
    }

    fn release(&mut self, allocation: &Allocation) {
        self.free
            .entry(allocation.size.clone())
            .or_default()
            .push_back(allocation.offset.clone());
    }
}

impl MemoryLayout {
    /// Places constants in the static space and everything else in the dynamic space.
    ///
    /// Inputs are placed first and never released. An intermediate value is released once its
    /// last consumer has been placed, and its region goes to the next value of the same size.
    /// The result only depends on the graph's structure.
    pub fn allocate(graph: &Graph) -> Result<Self, LoomError> {
        let vars = graph.variables()?;
        let ops = graph.topological_ops()?;
        let inputs = graph.inputs();
        let outputs = graph.outputs();

        let mut allocations = BTreeMap::new();
        let mut static_size = 0;
        for &id in &vars {
            if let Some(data) = graph.variable(id)?.data() {
                let allocation = Allocation {
                    space: MemorySpace::Static,
                    offset: Placeholder::Concrete(static_size),
                    size: Placeholder::Concrete(data.len()),
                };
                allocations.insert(id, allocation);
                static_size += data.len();
            }
        }

        let mut pending: HashMap<VarId, usize> = HashMap::default();
        for &op in &ops {
            let unique: HashSet<_> = graph.inputs_of(op)?.into_iter().collect();
            for id in unique {
                *pending.entry(id).or_default() += 1;
            }
        }

        let mut allocator = Allocator::default();
        for &id in &inputs {
            if !allocations.contains_key(&id) {
                allocations.insert(id, allocator.alloc(graph.variable(id)?.size()));
            }
        }

        for &op in &ops {
            let output = graph.operator(op)?.output();
            if !allocations.contains_key(&output) {
                allocations.insert(output, allocator.alloc(graph.variable(output)?.size()));
            }

            let unique: HashSet<_> = graph.inputs_of(op)?.into_iter().collect();
            let mut released = vec![];
            for id in unique {
                let Some(count) = pending.get_mut(&id) else {
                    continue;
                };
                *count -= 1;
                if *count == 0 && !inputs.contains(&id) && !outputs.contains(&id) {
                    released.push(id);
                }
            }
            // release in id order to stay independent of hashing
            released.sort();
            for id in released {
                match allocations.get(&id) {
                    Some(allocation) if allocation.space == MemorySpace::Dynamic => allocator.release(allocation),
                    _ => {}
                }
            }
        }

        // outputs that are neither produced nor fed, e.g. a folded constant, are covered above
        for &id in &vars {
            if !allocations.contains_key(&id) {
                allocations.insert(id, allocator.alloc(graph.variable(id)?.size()));
            }
        }

        Ok(Self {
            allocations,
            static_size,
            dynamic_size: allocator.top,
        })
    }

    pub fn get(&self, id: VarId) -> Option<&Allocation> {
        self.allocations.get(&id)
    }

    /// Concatenated constant data, in the layout of the static space.
    pub fn constants(&self, graph: &Graph) -> Result<Vec<f32>, LoomError> {
        let mut data = vec![0.0; self.static_size];
        for (&id, allocation) in &self.allocations {
            if allocation.space != MemorySpace::Static {
                continue;
            }
            let source = graph.variable(id)?.data().unwrap_or_default();
            let offset = allocation.offset.value().unwrap_or_default();
            data[offset..offset + source.len()].copy_from_slice(source);
        }
        Ok(data)
    }
}
