//! A graph compiler lowering tensor graphs into kernels for in-browser backends.
//!
//! A graph is built in [`loom`], simplified once by the backend-independent optimizer, and then
//! handed to each [`hal`] backend, which lays out memory and emits one or more kernels per operator.

use thiserror::Error;

pub mod config;
pub mod hal;
pub mod loom;

use config::Config;
use hal::{BackendKind, Descriptor, GenerateError, GeneratorBuilder, WebAssembly, WebGl, WebGpu};
use loom::{
    LoomError,
    graph::Graph,
    optimize::{OptimizeError, OptimizeRule, default_rules},
};

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Loom(#[from] LoomError),
    #[error(transparent)]
    Optimize(#[from] OptimizeError),
    #[error(transparent)]
    Generate(#[from] GenerateError),
}

/// Emits kernels of `graph` for one backend with the default handlers.
pub fn generate(kind: BackendKind, graph: &Graph, config: &Config) -> Result<Descriptor, GenerateError> {
    match kind {
        BackendKind::WebAssembly => GeneratorBuilder::<WebAssembly>::new()
            .add_default_ops()
            .build()
            .generate(graph, config),
        BackendKind::WebGpu => GeneratorBuilder::<WebGpu>::new()
            .add_default_ops()
            .build()
            .generate(graph, config),
        BackendKind::WebGl => GeneratorBuilder::<WebGl>::new()
            .add_default_ops()
            .build()
            .generate(graph, config),
    }
}

/// Optimizes `graph` once and generates kernels for every backend in `backends`.
///
/// Backends are independent: one failing does not prevent the others from emitting. Errors of
/// the shared front half (optimization and validation) fail the whole call.
#[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
pub fn transpile(
    graph: &Graph,
    backends: &[BackendKind],
    config: &Config,
) -> Result<Vec<(BackendKind, Result<Descriptor, GenerateError>)>, Error> {
    let mut graph = graph.clone();
    graph.topological_ops()?;
    default_rules(config).optimize(&mut graph)?;
    graph.validate()?;

    let descriptors = backends
        .iter()
        .map(|&kind| {
            let descriptor = generate(kind, &graph, config);
            if let Err(err) = &descriptor {
                log::error!("{kind}: {err}");
            }
            (kind, descriptor)
        })
        .collect();
    Ok(descriptors)
}
