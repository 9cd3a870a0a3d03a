use super::{OptimizeError, OptimizeRule};
use crate::loom::graph::Graph;

/// Replaces operators whose inputs are all constants with their precomputed output.
///
/// Operators are visited in topological order, so chains of constant operators collapse in one pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConstantFolding;

impl OptimizeRule for ConstantFolding {
    fn name(&self) -> &str {
        "constant_folding"
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    fn optimize(&self, graph: &mut Graph) -> Result<bool, OptimizeError> {
        let mut changed = false;
        for op in graph.topological_ops()? {
            let node = graph.operator(op)?;
            let inputs = graph.inputs_of(op)?;

            let mut args = Vec::with_capacity(inputs.len());
            for &id in &inputs {
                let variable = graph.variable(id)?;
                match variable.data() {
                    Some(data) => args.push((variable, data)),
                    None => break,
                }
            }
            if args.len() < inputs.len() {
                continue;
            }

            let output = graph.variable(node.output())?;
            if !node.op().can_fold(output) {
                continue;
            }
            let data = node.op().evaluate(&args, output)?;
            let folded = output.fold(data)?;

            let kind = node.op().kind();
            let output = node.output();
            graph.remove_operator(op)?;
            let id = graph.add_variable(folded);
            graph.replace_variable(output, id)?;

            log::trace!("folded {kind} {op} into constant {id}");
            changed = true;
        }
        Ok(changed)
    }
}
