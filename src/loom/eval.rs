//! Reference interpreter over concrete data.

use std::sync::Arc;

use rustc_hash::FxHashMap as HashMap;

use super::{
    LoomError,
    graph::{Graph, VarId},
};

impl Graph {
    /// Evaluates the graph on `feeds` and returns the data of every output.
    ///
    /// All shapes must be concrete. Constants are read from the variables themselves.
    pub fn run(
        &self,
        feeds: impl IntoIterator<Item = (VarId, Vec<f32>)>,
    ) -> Result<HashMap<VarId, Arc<[f32]>>, LoomError> {
        let mut values: HashMap<VarId, Arc<[f32]>> = HashMap::default();
        for (id, data) in feeds {
            let id = self.resolve(id)?;
            let expected = self.variable(id)?.concrete_size()?;
            if data.len() != expected {
                return Err(LoomError::DataLength {
                    expected,
                    found: data.len(),
                });
            }
            values.insert(id, data.into());
        }

        let fetch = |values: &HashMap<VarId, Arc<[f32]>>, id: VarId| -> Result<Arc<[f32]>, LoomError> {
            if let Some(data) = values.get(&id) {
                return Ok(data.clone());
            }
            match self.variable(id)?.data() {
                Some(data) => Ok(data.into()),
                None => Err(LoomError::MissingFeed(id)),
            }
        };

        for op in self.topological_ops()? {
            let node = self.operator(op)?;
            let inputs = self.inputs_of(op)?;
            let data = inputs
                .iter()
                .map(|&id| fetch(&values, id))
                .collect::<Result<Vec<_>, _>>()?;
            let args = inputs
                .iter()
                .zip(data.iter())
                .map(|(&id, data)| Ok((self.variable(id)?, data.as_ref())))
                .collect::<Result<Vec<_>, LoomError>>()?;

            let output = self.variable(node.output())?;
            let result = node.op().evaluate(&args, output)?;
            values.insert(node.output(), result.into());
        }

        self.outputs()
            .into_iter()
            .map(|id| Ok((id, fetch(&values, id)?)))
            .collect()
    }
}
