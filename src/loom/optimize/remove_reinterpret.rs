use super::{OptimizeError, OptimizeRule};
use crate::loom::{graph::Graph, ops::Operator};

/// Drops reinterpretations whose input and output orders coincide.
///
/// Such operators typically remain after axis unification merged the two orders.
#[derive(Debug, Default, Clone, Copy)]
pub struct RemoveRedundantReinterpret;

impl OptimizeRule for RemoveRedundantReinterpret {
    fn name(&self) -> &str {
        "remove_redundant_reinterpret"
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    fn optimize(&self, graph: &mut Graph) -> Result<bool, OptimizeError> {
        let mut changed = false;
        for op in graph.topological_ops()? {
            let node = graph.operator(op)?;
            let Operator::ReinterpretAxis { in_order, out_order } = node.op() else {
                continue;
            };
            if in_order != out_order {
                continue;
            }
            let output = node.output();
            let [input] = graph.inputs_of(op)?[..] else {
                continue;
            };

            graph.remove_operator(op)?;
            graph.replace_variable(output, input)?;
            changed = true;
        }
        Ok(changed)
    }
}
