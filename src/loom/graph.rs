use derive_more::Display;
use itertools::Itertools;
use rustc_hash::{FxHashMap as HashMap, FxHashSet as HashSet};
use serde::Serialize;

use super::{
    LoomError,
    axis::Axis,
    ops::Operator,
    variable::{Attribute, Variable},
};

#[derive(Debug, Default, Display, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[display("v{_0}")]
pub struct VarId(u32);

#[derive(Debug, Default, Display, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[display("op{_0}")]
pub struct OpId(u32);

impl VarId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl OpId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone)]
enum Slot {
    Live(Variable),
    /// The variable was substituted; follow the link.
    Replaced(VarId),
}

#[derive(Debug, Clone)]
pub struct OperatorNode {
    op: Operator,
    inputs: Vec<VarId>,
    output: VarId,
}

impl OperatorNode {
    #[inline]
    pub fn op(&self) -> &Operator {
        &self.op
    }

    /// Input handles as registered. They may be stale; use [`Graph::inputs_of`] to resolve them.
    #[inline]
    pub fn raw_inputs(&self) -> &[VarId] {
        &self.inputs
    }

    #[inline]
    pub fn output(&self) -> VarId {
        self.output
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

/// An arena of variables and operators between declared inputs and outputs.
#[derive(Debug, Default, Clone)]
pub struct Graph {
    vars: Vec<Slot>,
    ops: Vec<Option<OperatorNode>>,
    producers: HashMap<VarId, OpId>,
    inputs: Vec<VarId>,
    outputs: Vec<VarId>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_variable(&mut self, variable: Variable) -> VarId {
        let id = VarId(self.vars.len() as u32);
        self.vars.push(Slot::Live(variable));
        id
    }

    /// Adds a variable fed by the runtime.
    pub fn add_input(&mut self, variable: Variable) -> VarId {
        let id = self.add_variable(variable.with_attribute(Attribute::Input));
        self.inputs.push(id);
        id
    }

    /// Declares `id` as read back by the runtime.
    pub fn mark_output(&mut self, id: VarId) -> Result<(), LoomError> {
        let id = self.resolve(id)?;
        self.live_mut(id)?.attributes_mut().insert(Attribute::Output);
        if !self.outputs.contains(&id) {
            self.outputs.push(id);
        }
        Ok(())
    }

    /// Adds an operator consuming `inputs` and returns its inferred output.
    pub fn add_op(&mut self, op: Operator, inputs: &[VarId]) -> Result<VarId, LoomError> {
        let inputs: Vec<VarId> = inputs.iter().map(|&id| self.resolve(id)).collect::<Result<_, _>>()?;
        let variables: Vec<&Variable> = inputs
            .iter()
            .map(|&id| self.variable(id))
            .collect::<Result<_, _>>()?;
        let variable = op.infer(&variables)?;

        let output = self.add_variable(variable);
        let id = OpId(self.ops.len() as u32);
        self.ops.push(Some(OperatorNode { op, inputs, output }));
        self.producers.insert(output, id);
        Ok(output)
    }

    /// Follows replacements from `id` to the live variable.
    pub fn resolve(&self, id: VarId) -> Result<VarId, LoomError> {
        let mut current = id;
        loop {
            match self.vars.get(current.index()) {
                Some(Slot::Live(_)) => return Ok(current),
                Some(Slot::Replaced(next)) => current = *next,
                None => return Err(LoomError::InvalidVariable(id)),
            }
        }
    }

    /// Gets a live variable. Fails on a replaced handle.
    pub fn variable(&self, id: VarId) -> Result<&Variable, LoomError> {
        match self.vars.get(id.index()) {
            Some(Slot::Live(variable)) => Ok(variable),
            Some(Slot::Replaced(_)) => Err(LoomError::StaleVariable(id)),
            None => Err(LoomError::InvalidVariable(id)),
        }
    }

    /// Gets the variable `id` currently stands for.
    pub fn get(&self, id: VarId) -> Result<&Variable, LoomError> {
        self.variable(self.resolve(id)?)
    }

    fn live_mut(&mut self, id: VarId) -> Result<&mut Variable, LoomError> {
        match self.vars.get_mut(id.index()) {
            Some(Slot::Live(variable)) => Ok(variable),
            Some(Slot::Replaced(_)) => Err(LoomError::StaleVariable(id)),
            None => Err(LoomError::InvalidVariable(id)),
        }
    }

    pub fn operator(&self, id: OpId) -> Result<&OperatorNode, LoomError> {
        self.ops
            .get(id.index())
            .and_then(Option::as_ref)
            .ok_or(LoomError::InvalidOperator(id))
    }

    /// Live operators in insertion order, reachable or not.
    pub fn operators(&self) -> impl Iterator<Item = (OpId, &OperatorNode)> {
        self.ops
            .iter()
            .enumerate()
            .filter_map(|(index, node)| node.as_ref().map(|node| (OpId(index as u32), node)))
    }

    pub fn inputs(&self) -> Vec<VarId> {
        self.inputs
            .iter()
            .filter_map(|&id| self.resolve(id).ok())
            .collect()
    }

    pub fn outputs(&self) -> Vec<VarId> {
        self.outputs
            .iter()
            .filter_map(|&id| self.resolve(id).ok())
            .collect()
    }

    /// The resolved inputs of an operator.
    pub fn inputs_of(&self, id: OpId) -> Result<Vec<VarId>, LoomError> {
        let node = self.operator(id)?;
        node.inputs.iter().map(|&id| self.resolve(id)).collect()
    }

    pub fn producer(&self, id: VarId) -> Option<OpId> {
        let id = self.resolve(id).ok()?;
        self.producers.get(&id).copied()
    }

    /// Operators consuming `id`, in insertion order.
    pub fn consumers(&self, id: VarId) -> Vec<OpId> {
        let Ok(id) = self.resolve(id) else {
            return vec![];
        };
        self.operators()
            .filter(|(_, node)| node.inputs.iter().any(|&x| self.resolve(x).ok() == Some(id)))
            .map(|(op, _)| op)
            .collect()
    }

    /// Detaches an operator from the graph. Its output loses its producer.
    pub fn remove_operator(&mut self, id: OpId) -> Result<OperatorNode, LoomError> {
        let node = self
            .ops
            .get_mut(id.index())
            .and_then(Option::take)
            .ok_or(LoomError::InvalidOperator(id))?;
        self.producers.remove(&node.output);
        Ok(node)
    }

    /// Redirects every reference to `old` to `new`.
    ///
    /// Both must have the same shape and order. `new` inherits the input/output attributes of `old`,
    /// and `old` becomes a stale handle.
    pub fn replace_variable(&mut self, old: VarId, new: VarId) -> Result<(), LoomError> {
        let old = self.resolve(old)?;
        let new = self.resolve(new)?;
        if old == new {
            return Ok(());
        }

        let (x, y) = (self.variable(old)?, self.variable(new)?);
        if x.shape() != y.shape() {
            return Err(LoomError::Replace {
                old: x.to_string(),
                new: y.to_string(),
                reason: "shapes differ",
            });
        }
        if x.order() != y.order() {
            return Err(LoomError::Replace {
                old: x.to_string(),
                new: y.to_string(),
                reason: "orders differ",
            });
        }
        let attributes = x.attributes().clone();
        self.live_mut(new)?.attributes_mut().inherit(&attributes);

        self.producers.remove(&old);
        self.vars[old.index()] = Slot::Replaced(new);
        Ok(())
    }

    /// Operators reachable backward from the outputs without passing the inputs,
    /// producers before consumers.
    pub fn topological_ops(&self) -> Result<Vec<OpId>, LoomError> {
        let inputs = self.inputs();
        let mut marks: HashMap<OpId, Mark> = HashMap::default();
        let mut order = vec![];

        let roots = self
            .outputs()
            .into_iter()
            .filter(|id| !inputs.contains(id))
            .filter_map(|id| self.producer(id));
        for root in roots {
            if marks.contains_key(&root) {
                continue;
            }
            marks.insert(root, Mark::Visiting);
            let mut stack = vec![(root, 0usize)];

            while let Some((op, next)) = stack.pop() {
                match self.inputs_of(op)?.get(next) {
                    Some(&var) => {
                        stack.push((op, next + 1));
                        if inputs.contains(&var) {
                            continue;
                        }
                        let Some(child) = self.producer(var) else {
                            continue;
                        };
                        match marks.get(&child) {
                            Some(Mark::Visiting) => return Err(LoomError::CyclicGraph(var)),
                            Some(Mark::Done) => {}
                            None => {
                                marks.insert(child, Mark::Visiting);
                                stack.push((child, 0));
                            }
                        }
                    }
                    None => {
                        marks.insert(op, Mark::Done);
                        order.push(op);
                    }
                }
            }
        }
        Ok(order)
    }

    /// Reachable variables: inputs first, then in the order operators touch them.
    pub fn variables(&self) -> Result<Vec<VarId>, LoomError> {
        let mut visited = HashSet::default();
        let mut vars = vec![];
        let mut visit = |id: VarId| {
            if visited.insert(id) {
                vars.push(id);
            }
        };

        self.inputs().into_iter().for_each(&mut visit);
        for op in self.topological_ops()? {
            self.inputs_of(op)?.into_iter().for_each(&mut visit);
            visit(self.operator(op)?.output);
        }
        self.outputs().into_iter().for_each(&mut visit);
        Ok(vars)
    }

    /// Checks the graph is acyclic and every reachable order is free of unresolved axes.
    pub fn validate(&self) -> Result<(), LoomError> {
        for id in self.variables()? {
            let variable = self.variable(id)?;
            if variable.order().has_free_axis() {
                return Err(LoomError::FreeAxis {
                    var: id,
                    order: variable.order().clone(),
                });
            }
        }
        Ok(())
    }

    /// Copies the graph restricted to the region between `inputs` and `outputs`.
    ///
    /// Every leaf the outputs depend on must be either a declared input or a constant.
    pub fn induced(&self, inputs: &[VarId], outputs: &[VarId]) -> Result<Graph, LoomError> {
        let mut graph = self.clone();
        graph.inputs = inputs.iter().map(|&id| self.resolve(id)).collect::<Result<_, _>>()?;
        graph.outputs = outputs.iter().map(|&id| self.resolve(id)).collect::<Result<_, _>>()?;

        for id in graph.variables()? {
            let leaf = graph.producer(id).is_none();
            let bound = graph.inputs.contains(&id) || graph.variable(id)?.is_constant();
            if leaf && !bound {
                return Err(LoomError::Unbound(id));
            }
        }
        Ok(graph)
    }

    /// Substitutes axis identities in every live variable and operator parameter.
    /// Returns whether anything changed.
    pub fn rename_axes(&mut self, f: impl Fn(&Axis) -> Axis) -> Result<bool, LoomError> {
        let mut changed = false;
        for slot in self.vars.iter_mut() {
            let Slot::Live(variable) = slot else {
                continue;
            };
            let order = variable.order().map(&f)?;
            if &order != variable.order() {
                *variable = variable.clone().with_order(order)?;
                changed = true;
            }
        }
        for node in self.ops.iter_mut().flatten() {
            let op = node.op.map_axes(&f)?;
            if op != node.op {
                node.op = op;
                changed = true;
            }
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use super::Graph;
    use crate::{
        loom::{
            LoomError,
            axis::Axis,
            ops::{OpKind, Operator},
            variable::{Attribute, Variable},
        },
        order,
    };

    #[test]
    fn test_topological_order() -> Result<(), Box<dyn Error>> {
        let mut graph = Graph::new();
        let x = graph.add_input(Variable::new([2usize, 3], order![Axis::N, Axis::C])?);
        let w = graph.add_variable(Variable::constant([3], order![Axis::C], vec![1.0f32; 3])?);
        let y = graph.add_op(Operator::Mul, &[x, w])?;
        let z = graph.add_op(Operator::ScalarAffine { scale: 2.0, bias: 0.0 }, &[y])?;
        let u = graph.add_op(Operator::Add, &[z, y])?;
        graph.mark_output(u)?;

        let ops = graph.topological_ops()?;
        let kinds = ops
            .iter()
            .map(|&op| graph.operator(op).map(|node| node.op().kind()))
            .collect::<Result<Vec<_>, _>>()?;
        assert_eq!(kinds, [OpKind::Mul, OpKind::ScalarAffine, OpKind::Add]);

        let vars = graph.variables()?;
        assert_eq!(vars[0], x);
        assert_eq!(vars.len(), 5);
        assert_eq!(graph.consumers(y).len(), 2);
        assert_eq!(graph.producer(u), Some(ops[2]));
        graph.validate()?;
        Ok(())
    }

    #[test]
    fn test_replace() -> Result<(), Box<dyn Error>> {
        let mut graph = Graph::new();
        let x = graph.add_input(Variable::new([4usize], order![Axis::C])?);
        let y = graph.add_op(Operator::ScalarAffine { scale: 1.0, bias: 1.0 }, &[x])?;
        let z = graph.add_op(Operator::Mul, &[y, y])?;
        graph.mark_output(z)?;

        let c = graph.add_variable(Variable::constant([4], order![Axis::C], vec![2.0f32; 4])?);
        let w = graph.add_op(Operator::ScalarAffine { scale: 3.0, bias: 0.0 }, &[c])?;
        graph.replace_variable(z, w)?;

        assert!(matches!(graph.variable(z), Err(LoomError::StaleVariable(_))));
        assert_eq!(graph.resolve(z)?, w);
        assert_eq!(graph.outputs(), [w]);
        assert!(graph.get(z)?.attributes().contains(&Attribute::Output));
        // the old producer is no longer reachable
        assert_eq!(graph.topological_ops()?.len(), 1);

        let v = graph.add_variable(Variable::new([5usize], order![Axis::C])?);
        assert!(matches!(graph.replace_variable(w, v), Err(LoomError::Replace { .. })));
        Ok(())
    }

    #[test]
    fn test_replace_keeps_order() -> Result<(), Box<dyn Error>> {
        let mut graph = Graph::new();
        let x = graph.add_input(Variable::new([3usize, 3], order![Axis::N, Axis::C])?);
        let y = graph.add_op(
            Operator::ReinterpretAxis {
                in_order: order![Axis::N, Axis::C],
                out_order: order![Axis::H, Axis::W],
            },
            &[x],
        )?;
        graph.mark_output(y)?;

        // same shape, transposed axes
        let t = graph.add_variable(Variable::constant([3, 3], order![Axis::C, Axis::N], vec![0.0f32; 9])?);
        let err = graph.replace_variable(x, t);
        assert!(matches!(err, Err(LoomError::Replace { reason: "orders differ", .. })));

        // the consumer still reads the original input
        let op = graph.producer(y).ok_or("missing producer")?;
        assert_eq!(graph.inputs_of(op)?, [x]);
        assert_eq!(graph.get(x)?.order(), &order![Axis::N, Axis::C]);
        Ok(())
    }

    #[test]
    fn test_cycle() -> Result<(), Box<dyn Error>> {
        let mut graph = Graph::new();
        let x = graph.add_input(Variable::new([4usize], order![Axis::C])?);
        let a = graph.add_op(Operator::ScalarAffine { scale: 1.0, bias: 1.0 }, &[x])?;
        let b = graph.add_op(Operator::ScalarAffine { scale: 2.0, bias: 0.0 }, &[a])?;
        let c = graph.add_op(Operator::ScalarAffine { scale: 3.0, bias: 0.0 }, &[b])?;
        graph.mark_output(c)?;

        // feeding `c` back into the consumer of `a` closes a loop
        graph.replace_variable(a, c)?;
        assert!(matches!(graph.topological_ops(), Err(LoomError::CyclicGraph(_))));
        assert!(graph.validate().is_err());
        Ok(())
    }

    #[test]
    fn test_free_axis() -> Result<(), Box<dyn Error>> {
        let mut graph = Graph::new();
        let x = graph.add_input(Variable::new([4usize], order![Axis::free()])?);
        graph.mark_output(x)?;
        assert!(matches!(graph.validate(), Err(LoomError::FreeAxis { .. })));
        Ok(())
    }

    #[test]
    fn test_induced() -> Result<(), Box<dyn Error>> {
        let mut graph = Graph::new();
        let x = graph.add_input(Variable::new([4usize], order![Axis::C])?);
        let c = graph.add_variable(Variable::constant([4], order![Axis::C], vec![2.0f32; 4])?);
        let y = graph.add_op(Operator::Add, &[x, c])?;
        let z = graph.add_op(Operator::Mul, &[y, y])?;
        graph.mark_output(z)?;

        let sub = graph.induced(&[y], &[z])?;
        assert_eq!(sub.topological_ops()?.len(), 1);
        assert_eq!(sub.inputs(), [y]);

        assert!(matches!(graph.induced(&[], &[z]), Err(LoomError::Unbound(id)) if id == x));
        Ok(())
    }
}
