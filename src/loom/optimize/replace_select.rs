use super::{OptimizeError, OptimizeRule};
use crate::loom::{
    graph::{Graph, OpId, VarId},
    ops::{OpKind, Operator},
};

/// Rewrites `select(cond, a, b)` into `cond * a + (1 - cond) * b`.
///
/// Only applies when `cond` is produced by a comparison, which guarantees values in {0, 1}.
/// A rewrite that would produce an output of another order is skipped.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReplaceSelect;

const INVERT: Operator = Operator::ScalarAffine {
    scale: -1.0,
    bias: 1.0,
};

impl ReplaceSelect {
    fn rewrite(graph: &mut Graph, op: OpId) -> Result<bool, OptimizeError> {
        let node = graph.operator(op)?;
        if node.op().kind() != OpKind::Select {
            return Ok(false);
        }
        let output = node.output();
        let [cond, a, b] = graph.inputs_of(op)?[..] else {
            return Ok(false);
        };

        let comparison = graph
            .producer(cond)
            .map(|id| graph.operator(id))
            .transpose()?
            .is_some_and(|node| matches!(node.op().kind(), OpKind::Greater | OpKind::GreaterEqual));
        if !comparison {
            return Ok(false);
        }

        // dry run the inference to make sure the arithmetic form keeps the output layout
        let (vc, va, vb) = (graph.variable(cond)?, graph.variable(a)?, graph.variable(b)?);
        let t1 = Operator::Mul.infer(&[vc, va])?;
        let nc = INVERT.infer(&[vc])?;
        let t2 = Operator::Mul.infer(&[&nc, vb])?;
        let y = Operator::Add.infer(&[&t1, &t2])?;
        let current = graph.variable(output)?;
        if y.order() != current.order() || y.shape() != current.shape() {
            log::debug!("select {op} kept: rewrite would yield {y} instead of {current}");
            return Ok(false);
        }

        graph.remove_operator(op)?;
        let t1 = graph.add_op(Operator::Mul, &[cond, a])?;
        let nc = graph.add_op(INVERT, &[cond])?;
        let t2 = graph.add_op(Operator::Mul, &[nc, b])?;
        let y: VarId = graph.add_op(Operator::Add, &[t1, t2])?;
        graph.replace_variable(output, y)?;
        Ok(true)
    }
}

impl OptimizeRule for ReplaceSelect {
    fn name(&self) -> &str {
        "replace_select"
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    fn optimize(&self, graph: &mut Graph) -> Result<bool, OptimizeError> {
        let mut changed = false;
        for op in graph.topological_ops()? {
            changed |= Self::rewrite(graph, op)?;
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use itertools::Itertools;

    use super::ReplaceSelect;
    use crate::loom::{
        axis::Axis,
        graph::Graph,
        ops::{OpKind, Operator},
        optimize::OptimizeRule,
        variable::Variable,
    };
    use crate::order;

    fn kinds(graph: &Graph) -> Result<Vec<OpKind>, Box<dyn Error>> {
        let kinds = graph
            .topological_ops()?
            .into_iter()
            .map(|op| graph.operator(op).map(|node| node.op().kind()))
            .collect::<Result<_, _>>()?;
        Ok(kinds)
    }

    #[test]
    fn test_rewrite_preserves_values() -> Result<(), Box<dyn Error>> {
        for comparison in [Operator::Greater, Operator::GreaterEqual] {
            let mut graph = Graph::new();
            let x = graph.add_input(Variable::new([2usize, 8], order![Axis::N, Axis::C])?);
            let t = graph.add_input(Variable::new([8usize], order![Axis::C])?);
            let a = graph.add_input(Variable::new([2usize, 8], order![Axis::N, Axis::C])?);
            let b = graph.add_input(Variable::new([2usize, 8], order![Axis::N, Axis::C])?);
            let cond = graph.add_op(comparison, &[x, t])?;
            let y = graph.add_op(Operator::Select, &[cond, a, b])?;
            graph.mark_output(y)?;

            let reference = graph.clone();
            assert!(ReplaceSelect.optimize(&mut graph)?);
            assert!(!ReplaceSelect.optimize(&mut graph)?);
            assert!(!kinds(&graph)?.contains(&OpKind::Select));

            for _ in 0..16 {
                let feeds = [(x, 16), (t, 8), (a, 16), (b, 16)]
                    .map(|(id, len)| (id, (0..len).map(|_| fastrand::f32() - 0.5).collect_vec()));
                let expected = reference.run(feeds.clone())?;
                let actual = graph.run(feeds)?;
                let expected = &expected[&reference.outputs()[0]];
                let actual = &actual[&graph.outputs()[0]];
                assert_eq!(expected, actual);
            }
        }
        Ok(())
    }

    #[test]
    fn test_unknown_provenance() -> Result<(), Box<dyn Error>> {
        let mut graph = Graph::new();
        let cond = graph.add_input(Variable::new([8usize], order![Axis::C])?);
        let a = graph.add_input(Variable::new([8usize], order![Axis::C])?);
        let b = graph.add_input(Variable::new([8usize], order![Axis::C])?);
        let m = graph.add_op(Operator::Mul, &[cond, cond])?;
        let y = graph.add_op(Operator::Select, &[m, a, b])?;
        let z = graph.add_op(Operator::Select, &[cond, a, y])?;
        graph.mark_output(z)?;

        let before = kinds(&graph)?;
        let vars = graph.variables()?;
        assert!(!ReplaceSelect.optimize(&mut graph)?);
        assert_eq!(kinds(&graph)?, before);
        assert_eq!(graph.variables()?, vars);
        Ok(())
    }
}
