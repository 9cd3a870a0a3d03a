//! WebAssembly kernels: C-like functions over the runtime's linear memory.
//!
//! Every kernel has the signature `void name(const int *meta_buffer)` and reads the
//! `static_buffer` and `dynamic_buffer` pointers provided by the runtime.

use itertools::Itertools;

use super::{
    Backend, BackendKind, GenerateError, GeneratorBuilder, Kernel, Launch, Layout, MemoryLayout, OpContext,
    gather_coordinate, gather_tables, iteration, placement,
    template::{Binding, Dialect, Injector, Template},
};
use crate::{
    config::Config,
    loom::{
        graph::Graph,
        ops::{OpKind, Operator},
        placeholder::Placeholder,
    },
};

#[derive(Debug, Clone)]
pub struct WebAssembly {
    layout: MemoryLayout,
}

impl WebAssembly {
    #[inline]
    pub fn memory(&self) -> &MemoryLayout {
        &self.layout
    }
}

impl Backend for WebAssembly {
    const KIND: BackendKind = BackendKind::WebAssembly;

    fn prepare(graph: &mut Graph, _config: &Config) -> Result<Self, GenerateError> {
        let layout = MemoryLayout::allocate(graph)?;
        Ok(Self { layout })
    }

    fn layout(&self) -> Layout {
        Layout::Memory(self.layout.clone())
    }

    fn constants(&self, graph: &Graph) -> Result<Vec<f32>, GenerateError> {
        Ok(self.layout.constants(graph)?)
    }
}

impl GeneratorBuilder<WebAssembly> {
    pub fn add_default_ops(self) -> Self {
        OpKind::ALL.into_iter().fold(self, |builder, kind| match kind.is_elementwise() {
            true => builder.add_op(kind, elementwise),
            false => builder.add_op(kind, gather),
        })
    }
}

fn expression(op: &Operator) -> &'static str {
    match op {
        Operator::Add => "v0 + v1",
        Operator::Mul => "v0 * v1",
        Operator::Greater => "(v0 > v1) ? 1.0f : 0.0f",
        Operator::GreaterEqual => "(v0 >= v1) ? 1.0f : 0.0f",
        Operator::ScalarAffine { .. } => "v0 * %%LOAD_BUFFER(scale)%% + %%LOAD_BUFFER(bias)%%",
        Operator::Select => "(v0 != 0.0f) ? v1 : v2",
        _ => "v0",
    }
}

fn kernel(context: &OpContext<WebAssembly>, template: &str, injector: Injector) -> Result<Kernel, GenerateError> {
    let template = Template::parse(template)?;
    let injected = injector.inject(&template)?;
    Ok(Kernel {
        name: context.name.clone(),
        kind: context.op().kind(),
        source: injected.source,
        meta: injected.meta.to_bytes(),
        bindings: injected.bindings,
        patches: injected.patches,
        dynamic_buffer_size: context.backend.layout.dynamic_size.clone(),
        launch: Launch::Serial,
    })
}

fn elementwise(context: &OpContext<WebAssembly>) -> Result<Vec<Kernel>, GenerateError> {
    let op = context.op();
    let names = op.input_names();
    let (y, output) = context.output()?;
    let inputs = context.inputs()?;
    let variables = inputs.iter().map(|(_, x)| *x).collect_vec();
    let order = iteration::unify(output, &variables, None)?;

    let mut declare = vec!["    float *y = %%LOAD_BUFFER(y)%%;".to_string()];
    let mut walk = vec!["            y_index += c * y_stride[d];".to_string()];
    let mut load = vec![];
    for (index, name) in names.iter().enumerate() {
        declare.push(format!("    const float *{name} = %%LOAD_BUFFER({name})%%;"));
        declare.push(format!("    const int *{name}_stride = %%LOAD_BUFFER({name}_stride)%%;"));
        walk.push(format!("            {name}_index += c * {name}_stride[d];"));
        load.push(format!("        const float v{index} = {name}[{name}_index];"));
    }
    let indices = std::iter::once("y").chain(names.iter().copied()).map(|name| format!("{name}_index = 0")).join(", ");

    let template = format!(
        r#"void %%FUNC_NAME%%(const int *meta_buffer)
{{
{declare}
    const int *y_stride = %%LOAD_BUFFER(y_stride)%%;
    const int *shape = %%LOAD_BUFFER(shape)%%;
    const int size = %%LOAD_BUFFER(size)%%;
    const int rank = %%LOAD_BUFFER(rank)%%;

    for (int i = 0; i < size; i++) {{
        int rem = i;
        int {indices};
        for (int d = rank - 1; d >= 0; d--) {{
            const int c = rem % shape[d];
            rem /= shape[d];
{walk}
        }}
{load}
        y[y_index] = {expression};
    }}
}}
"#,
        declare = declare.join("\n"),
        walk = walk.join("\n"),
        load = load.join("\n"),
        expression = expression(op),
    );

    let mut injector = Injector::new(Dialect::C, &context.name)
        .bind("y", Binding::Buffer(placement(&context.backend.layout, y)?))
        .bind("y_stride", Binding::Ints(order.strides[0].clone()))
        .bind("shape", Binding::Ints(order.shape.clone()))
        .bind("size", Binding::Int(order.size()))
        .bind("rank", Binding::Int(Placeholder::Concrete(order.rank())));
    for (index, (name, (id, _))) in names.iter().zip_eq(&inputs).enumerate() {
        injector = injector
            .bind(*name, Binding::Buffer(placement(&context.backend.layout, *id)?))
            .bind(format!("{name}_stride"), Binding::Ints(order.strides[index + 1].clone()));
    }
    if let Operator::ScalarAffine { scale, bias } = op {
        injector = injector
            .bind("scale", Binding::Float(*scale))
            .bind("bias", Binding::Float(*bias));
    }
    Ok(vec![kernel(context, &template, injector)?])
}

/// Tile, slice, resize and reinterpretation: every output element copies one input element.
fn gather(context: &OpContext<WebAssembly>) -> Result<Vec<Kernel>, GenerateError> {
    let op = context.op();
    let (y, output) = context.output()?;
    let [(x, input)] = context.inputs()?[..] else {
        return Err(GenerateError::Loom(crate::loom::LoomError::Arity {
            op: op.kind(),
            expected: 1,
            found: context.inputs()?.len(),
        }));
    };
    let tables = gather_tables(op, input);

    let declare = tables
        .iter()
        .map(|(name, _)| format!("    const int *{name} = %%LOAD_BUFFER({name})%%;"))
        .join("\n");
    let coordinate = gather_coordinate(op, |name| format!("{name}[d]"));
    let template = format!(
        r#"void %%FUNC_NAME%%(const int *meta_buffer)
{{
    float *y = %%LOAD_BUFFER(y)%%;
    const float *x = %%LOAD_BUFFER(x)%%;
    const int *y_shape = %%LOAD_BUFFER(y_shape)%%;
    const int *x_stride = %%LOAD_BUFFER(x_stride)%%;
{declare}
    const int size = %%LOAD_BUFFER(size)%%;
    const int rank = %%LOAD_BUFFER(rank)%%;

    for (int i = 0; i < size; i++) {{
        int rem = i;
        int x_index = 0;
        for (int d = rank - 1; d >= 0; d--) {{
            const int c = rem % y_shape[d];
            rem /= y_shape[d];
            x_index += ({coordinate}) * x_stride[d];
        }}
        y[i] = x[x_index];
    }}
}}
"#
    );

    let mut injector = Injector::new(Dialect::C, &context.name)
        .bind("y", Binding::Buffer(placement(&context.backend.layout, y)?))
        .bind("x", Binding::Buffer(placement(&context.backend.layout, x)?))
        .bind("y_shape", Binding::Ints(output.shape().to_vec()))
        .bind("x_stride", Binding::Ints(input.stride()))
        .bind("size", Binding::Int(output.size()))
        .bind("rank", Binding::Int(Placeholder::Concrete(output.rank())));
    for (name, values) in tables {
        injector = injector.bind(name, Binding::Ints(values));
    }
    Ok(vec![kernel(context, &template, injector)?])
}
