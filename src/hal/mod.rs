//! The `hal` module turns an optimized graph into backend kernels.
//!
//! ## Key Components
//! 1. **Layout**:
//!    - Linear backends place variables in a static and a dynamic space (`MemoryLayout`).
//!    - The texture backend packs every variable into a 2D texture (`TextureLayout`).
//!
//! 2. **Generation**:
//!    - Each backend owns a dispatch table from operator kind to handler (`OpVTable`).
//!    - Handlers fill templates through a typed injector (`Injector`) and return kernels.
//!    - Kernels of distinct operators are generated independently and sorted back into
//!      topological order.

use std::sync::Arc;

use derive_more::Display;
use rustc_hash::{FxHashMap as HashMap, FxHashSet as HashSet};
use serde::Serialize;
use thiserror::Error;

use crate::{
    config::Config,
    loom::{
        LoomError,
        graph::{Graph, OpId, OperatorNode, VarId},
        ops::{OpKind, Operator},
        optimize::OptimizeError,
        placeholder::Placeholder,
        variable::Variable,
    },
};

pub use allocator::{Allocation, MemoryLayout, MemorySpace};
pub use cpu::WebAssembly;
pub use gl::WebGl;
pub use gpu::WebGpu;
pub use template::{BoundValue, KernelBinding, Patch, PatchSite};
pub use texture::{ChannelMode, TextureLayout, TextureShape};

pub mod allocator;
pub mod cpu;
pub mod gl;
pub mod gpu;
pub mod iteration;
pub mod template;
pub mod texture;

#[cfg(test)]
mod tests;

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum BackendKind {
    #[display("webassembly")]
    WebAssembly,
    #[display("webgpu")]
    WebGpu,
    #[display("webgl")]
    WebGl,
}

#[derive(Debug, Error)]
pub enum GenerateError {
    #[error("{backend} has no handler for operator {kind}")]
    UnsupportedOperator { backend: BackendKind, kind: OpKind },
    #[error("resource limit exceeded: {reason}")]
    ResourceLimitExceeded { reason: String },
    #[error("kernel name {0} is not unique")]
    DuplicateKernelName(String),
    #[error("variable {0} has no placement")]
    Unplaced(VarId),
    #[error(transparent)]
    Loom(#[from] LoomError),
    #[error(transparent)]
    Optimize(#[from] OptimizeError),
    #[error(transparent)]
    Template(#[from] template::TemplateError),
}

/// How a kernel is dispatched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Launch {
    /// Called once on one thread.
    Serial,
    /// A compute dispatch; the kernel strides over the output.
    Compute {
        workgroups: [u32; 3],
        workgroup_size: [u32; 3],
    },
    /// A fragment pass covering the output texture.
    Fragment { output: VarId, width: usize, height: usize },
}

/// An emitted unit of executable source with everything needed to invoke it.
///
/// Kernels carry no constant data. The static constants they read are shared by all kernels of a
/// backend and shipped once in [`Descriptor::constants`].
#[derive(Debug, Clone, Serialize)]
pub struct Kernel {
    /// Unique within one backend's kernels of a graph.
    pub name: String,
    pub kind: OpKind,
    pub source: String,
    /// The per-kernel integer table, as bytes.
    pub meta: Vec<u8>,
    pub bindings: Vec<KernelBinding>,
    /// Values to write once the symbolic dimensions are known.
    pub patches: Vec<Patch>,
    pub dynamic_buffer_size: Placeholder,
    pub launch: Launch,
}

/// Physical placement of every variable, as the runtime loader needs it.
#[derive(Debug, Clone, Serialize)]
pub enum Layout {
    Memory(MemoryLayout),
    Texture(TextureLayout),
}

/// Everything one backend emits for a graph.
#[derive(Debug, Clone, Serialize)]
pub struct Descriptor {
    pub backend: BackendKind,
    /// In topological order of their operators.
    pub kernels: Vec<Kernel>,
    pub layout: Layout,
    /// Constant data as bytes, laid out as `layout` describes.
    pub constants: Vec<u8>,
}

/// A code generation target.
pub trait Backend: Sized + Send + Sync + 'static {
    const KIND: BackendKind;

    /// Checks the graph against the platform limits and computes the layout.
    fn prepare(graph: &mut Graph, config: &Config) -> Result<Self, GenerateError>;

    fn layout(&self) -> Layout;

    fn constants(&self, graph: &Graph) -> Result<Vec<f32>, GenerateError>;
}

/// What a handler sees of the operator it generates kernels for.
pub struct OpContext<'a, B> {
    pub backend: &'a B,
    pub graph: &'a Graph,
    pub config: &'a Config,
    pub id: OpId,
    pub node: &'a OperatorNode,
    /// The unique name base of this operator's kernels.
    pub name: String,
}

impl<B> OpContext<'_, B> {
    #[inline]
    pub fn op(&self) -> &Operator {
        self.node.op()
    }

    pub fn inputs(&self) -> Result<Vec<(VarId, &Variable)>, LoomError> {
        self.graph
            .inputs_of(self.id)?
            .into_iter()
            .map(|id| Ok((id, self.graph.variable(id)?)))
            .collect()
    }

    pub fn output(&self) -> Result<(VarId, &Variable), LoomError> {
        let id = self.graph.resolve(self.node.output())?;
        Ok((id, self.graph.variable(id)?))
    }
}

pub type Handler<B> = fn(&OpContext<B>) -> Result<Vec<Kernel>, GenerateError>;

/// Handlers of one backend, keyed by operator kind.
pub type OpVTable<B> = HashMap<OpKind, Handler<B>>;

pub struct GeneratorBuilder<B: Backend> {
    ops: OpVTable<B>,
}

impl<B: Backend> Default for GeneratorBuilder<B> {
    fn default() -> Self {
        Self {
            ops: HashMap::default(),
        }
    }
}

impl<B: Backend> GeneratorBuilder<B> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_op(mut self, kind: OpKind, handler: Handler<B>) -> Self {
        self.ops.insert(kind, handler);
        self
    }

    pub fn build(self) -> Generator<B> {
        Generator {
            ops: Arc::new(self.ops),
        }
    }
}

/// Generates the kernels of one backend.
#[derive(Clone)]
pub struct Generator<B: Backend> {
    ops: Arc<OpVTable<B>>,
}

impl<B: Backend> Generator<B> {
    /// Lays out `graph` and emits one or more kernels per operator.
    ///
    /// The graph must be optimized and validated. Any failure aborts the whole backend.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all, fields(backend = %B::KIND)))]
    pub fn generate(&self, graph: &Graph, config: &Config) -> Result<Descriptor, GenerateError> {
        let mut graph = graph.clone();
        let backend = B::prepare(&mut graph, config)?;
        let ops = graph.topological_ops()?;

        let mut handlers = Vec::with_capacity(ops.len());
        for &id in &ops {
            let kind = graph.operator(id)?.op().kind();
            match self.ops.get(&kind) {
                Some(&handler) => handlers.push((id, handler)),
                None => return Err(GenerateError::UnsupportedOperator { backend: B::KIND, kind }),
            }
        }

        let generate = |(position, &(id, handler)): (usize, &(OpId, Handler<B>))| -> Result<(usize, Vec<Kernel>), GenerateError> {
            let node = graph.operator(id)?;
            let context = OpContext {
                backend: &backend,
                graph: &graph,
                config,
                id,
                node,
                name: format!("{}_{}", node.op().kind(), id.index()),
            };
            handler(&context).map(|kernels| (position, kernels))
        };

        #[cfg(feature = "rayon")]
        let mut kernels: Vec<(usize, Vec<Kernel>)> = match config.parallel {
            true => {
                use rayon::prelude::*;
                handlers
                    .par_iter()
                    .enumerate()
                    .map(generate)
                    .collect::<Result<_, _>>()?
            }
            false => handlers
                .iter()
                .enumerate()
                .map(generate)
                .collect::<Result<_, _>>()?,
        };
        #[cfg(not(feature = "rayon"))]
        let mut kernels: Vec<(usize, Vec<Kernel>)> = handlers
            .iter()
            .enumerate()
            .map(generate)
            .collect::<Result<_, _>>()?;

        kernels.sort_by_key(|(position, _)| *position);
        let kernels: Vec<Kernel> = kernels.into_iter().flat_map(|(_, kernels)| kernels).collect();

        let mut names = HashSet::default();
        for kernel in &kernels {
            if !names.insert(kernel.name.as_str()) {
                return Err(GenerateError::DuplicateKernelName(kernel.name.clone()));
            }
        }

        let constants = backend.constants(&graph)?;
        log::info!(
            "{}: {} kernels for {} operators, {} constants",
            B::KIND,
            kernels.len(),
            ops.len(),
            constants.len()
        );
        Ok(Descriptor {
            backend: B::KIND,
            kernels,
            layout: backend.layout(),
            constants: bytemuck::cast_slice(&constants).to_vec(),
        })
    }
}

/// Placement of `id` in a linear layout.
pub(crate) fn placement(layout: &MemoryLayout, id: VarId) -> Result<Allocation, GenerateError> {
    layout.get(id).cloned().ok_or(GenerateError::Unplaced(id))
}

/// Per-axis input coordinate of the data-movement operators, as an expression of `c`, the
/// output coordinate along axis `d`. Table names are resolved by `table`.
pub(crate) fn gather_coordinate(op: &Operator, table: impl Fn(&str) -> String) -> String {
    match op {
        Operator::Tile { .. } => format!("c % {}", table("x_shape")),
        Operator::Slice { .. } => format!("{} + c * {}", table("slice_begin"), table("slice_step")),
        Operator::Resize2D { .. } => format!("c * {} / {}", table("x_shape"), table("y_shape")),
        _ => "c".to_string(),
    }
}

/// Per-axis tables the data-movement operators read, besides the output shape and input stride.
pub(crate) fn gather_tables(op: &Operator, x: &Variable) -> Vec<(&'static str, Vec<Placeholder>)> {
    let concrete = |values: &[usize]| -> Vec<Placeholder> { values.iter().copied().map(Placeholder::from).collect() };
    match op {
        Operator::Tile { .. } => vec![("x_shape", x.shape().to_vec())],
        Operator::Slice { begin, stride, .. } => {
            vec![("slice_begin", concrete(begin)), ("slice_step", concrete(stride))]
        }
        Operator::Resize2D { .. } => vec![("x_shape", x.shape().to_vec())],
        _ => vec![],
    }
}
