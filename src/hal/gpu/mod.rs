//! WebGPU kernels: WGSL compute shaders over explicit storage buffers.
//!
//! Binding 0 is `data_buffer`, the static space followed by the dynamic space.
//! Binding 1 is the kernel's `meta_buffer`.

use itertools::Itertools;

use super::{
    Backend, BackendKind, GenerateError, GeneratorBuilder, Kernel, Launch, Layout, MemoryLayout, OpContext,
    gather_coordinate, gather_tables, iteration, placement,
    template::{Binding, Dialect, Injector, Template},
};
use crate::{
    config::Config,
    loom::{
        LoomError,
        graph::Graph,
        ops::{OpKind, Operator},
        placeholder::Placeholder,
    },
};

/// Workgroups per dispatch; kernels stride over whatever they do not cover.
const WORKGROUPS: u32 = 8;

const HEADER: &str = r#"@group(0) @binding(0) var<storage, read_write> data_buffer: array<f32>;
@group(0) @binding(1) var<storage, read> meta_buffer: array<i32>;

@compute @workgroup_size(%%LOAD_BUFFER(workgroup_size)%%)
fn %%FUNC_NAME%%(@builtin(global_invocation_id) invocation: vec3<u32>, @builtin(num_workgroups) groups: vec3<u32>) {
    let grid = i32(groups.x) * %%LOAD_BUFFER(workgroup_size)%%;"#;

#[derive(Debug, Clone)]
pub struct WebGpu {
    layout: MemoryLayout,
    workgroup_size: u32,
}

impl Backend for WebGpu {
    const KIND: BackendKind = BackendKind::WebGpu;

    fn prepare(graph: &mut Graph, config: &Config) -> Result<Self, GenerateError> {
        let layout = MemoryLayout::allocate(graph)?;
        let workgroup_size = config.workgroup_size.max(1);
        Ok(Self { layout, workgroup_size })
    }

    fn layout(&self) -> Layout {
        Layout::Memory(self.layout.clone())
    }

    fn constants(&self, graph: &Graph) -> Result<Vec<f32>, GenerateError> {
        Ok(self.layout.constants(graph)?)
    }
}

impl GeneratorBuilder<WebGpu> {
    pub fn add_default_ops(self) -> Self {
        self.add_op(OpKind::Add, elementwise)
            .add_op(OpKind::Mul, elementwise)
            .add_op(OpKind::Greater, elementwise)
            .add_op(OpKind::GreaterEqual, elementwise)
            .add_op(OpKind::ScalarAffine, elementwise)
            .add_op(OpKind::Select, elementwise)
            .add_op(OpKind::Tile, gather)
            .add_op(OpKind::Slice, gather)
            .add_op(OpKind::ReinterpretAxis, gather)
            .add_op(OpKind::Resize2D, gather)
    }
}

fn expression(op: &Operator) -> &'static str {
    match op {
        Operator::Add => "v0 + v1",
        Operator::Mul => "v0 * v1",
        Operator::Greater => "select(0.0, 1.0, v0 > v1)",
        Operator::GreaterEqual => "select(0.0, 1.0, v0 >= v1)",
        Operator::ScalarAffine { .. } => "v0 * (%%LOAD_BUFFER(scale)%%) + (%%LOAD_BUFFER(bias)%%)",
        Operator::Select => "select(v2, v1, v0 != 0.0)",
        _ => "v0",
    }
}

impl WebGpu {
    fn injector(&self, context: &OpContext<Self>) -> Injector {
        let dialect = Dialect::Wgsl {
            dynamic_base: self.layout.static_size,
        };
        Injector::new(dialect, &context.name).bind(
            "workgroup_size",
            Binding::Int(Placeholder::Concrete(self.workgroup_size as usize)),
        )
    }

    fn kernel(&self, context: &OpContext<Self>, template: &str, injector: Injector) -> Result<Kernel, GenerateError> {
        let template = Template::parse(template)?;
        let injected = injector.inject(&template)?;
        Ok(Kernel {
            name: context.name.clone(),
            kind: context.op().kind(),
            source: injected.source,
            meta: injected.meta.to_bytes(),
            bindings: injected.bindings,
            patches: injected.patches,
            dynamic_buffer_size: self.layout.dynamic_size.clone(),
            launch: Launch::Compute {
                workgroups: [WORKGROUPS, 1, 1],
                workgroup_size: [self.workgroup_size, 1, 1],
            },
        })
    }
}

fn elementwise(context: &OpContext<WebGpu>) -> Result<Vec<Kernel>, GenerateError> {
    let backend = context.backend;
    let op = context.op();
    let names = op.input_names();
    let (y, output) = context.output()?;
    let inputs = context.inputs()?;
    let variables = inputs.iter().map(|(_, x)| *x).collect_vec();
    let order = iteration::unify(output, &variables, None)?;

    let operands = std::iter::once("y").chain(names.iter().copied()).collect_vec();
    let declare = operands
        .iter()
        .map(|name| {
            format!("    let {name} = %%LOAD_BUFFER({name})%%;\n    let {name}_stride = %%LOAD_BUFFER({name}_stride)%%;")
        })
        .join("\n");
    let indices = operands
        .iter()
        .map(|name| format!("        var {name}_index = 0;"))
        .join("\n");
    let walk = operands
        .iter()
        .map(|name| format!("            {name}_index += c * meta_buffer[{name}_stride + d];"))
        .join("\n");
    let load = names
        .iter()
        .enumerate()
        .map(|(index, name)| format!("        let v{index} = data_buffer[{name} + {name}_index];"))
        .join("\n");

    let template = format!(
        r#"{HEADER}
{declare}
    let shape = %%LOAD_BUFFER(shape)%%;
    let size = %%LOAD_BUFFER(size)%%;
    let rank = %%LOAD_BUFFER(rank)%%;

    for (var i = i32(invocation.x); i < size; i += grid) {{
        var rem = i;
{indices}
        for (var d = rank - 1; d >= 0; d--) {{
            let c = rem % meta_buffer[shape + d];
            rem = rem / meta_buffer[shape + d];
{walk}
        }}
{load}
        data_buffer[y + y_index] = {expression};
    }}
}}
"#,
        expression = expression(op),
    );

    let layout = &backend.layout;
    let mut injector = backend
        .injector(context)
        .bind("y", Binding::Buffer(placement(layout, y)?))
        .bind("y_stride", Binding::Ints(order.strides[0].clone()))
        .bind("shape", Binding::Ints(order.shape.clone()))
        .bind("size", Binding::Int(order.size()))
        .bind("rank", Binding::Int(Placeholder::Concrete(order.rank())));
    for (index, (name, (id, _))) in names.iter().zip_eq(&inputs).enumerate() {
        injector = injector
            .bind(*name, Binding::Buffer(placement(layout, *id)?))
            .bind(format!("{name}_stride"), Binding::Ints(order.strides[index + 1].clone()));
    }
    if let Operator::ScalarAffine { scale, bias } = op {
        injector = injector
            .bind("scale", Binding::Float(*scale))
            .bind("bias", Binding::Float(*bias));
    }
    Ok(vec![backend.kernel(context, &template, injector)?])
}

fn gather(context: &OpContext<WebGpu>) -> Result<Vec<Kernel>, GenerateError> {
    let backend = context.backend;
    let op = context.op();
    let (y, output) = context.output()?;
    let inputs = context.inputs()?;
    let &[(x, input)] = inputs.as_slice() else {
        return Err(LoomError::Arity {
            op: op.kind(),
            expected: 1,
            found: inputs.len(),
        }
        .into());
    };
    let tables = gather_tables(op, input);

    let declare = tables
        .iter()
        .map(|(name, _)| format!("    let {name} = %%LOAD_BUFFER({name})%%;"))
        .join("\n");
    let coordinate = gather_coordinate(op, |name| format!("meta_buffer[{name} + d]"));
    let template = format!(
        r#"{HEADER}
    let y = %%LOAD_BUFFER(y)%%;
    let x = %%LOAD_BUFFER(x)%%;
    let y_shape = %%LOAD_BUFFER(y_shape)%%;
    let x_stride = %%LOAD_BUFFER(x_stride)%%;
{declare}
    let size = %%LOAD_BUFFER(size)%%;
    let rank = %%LOAD_BUFFER(rank)%%;

    for (var i = i32(invocation.x); i < size; i += grid) {{
        var rem = i;
        var x_index = 0;
        for (var d = rank - 1; d >= 0; d--) {{
            let c = rem % meta_buffer[y_shape + d];
            rem = rem / meta_buffer[y_shape + d];
            x_index += ({coordinate}) * meta_buffer[x_stride + d];
        }}
        data_buffer[y + i] = data_buffer[x + x_index];
    }}
}}
"#
    );

    let layout = &backend.layout;
    let mut injector = backend
        .injector(context)
        .bind("y", Binding::Buffer(placement(layout, y)?))
        .bind("x", Binding::Buffer(placement(layout, x)?))
        .bind("y_shape", Binding::Ints(output.shape().to_vec()))
        .bind("x_stride", Binding::Ints(input.stride()))
        .bind("size", Binding::Int(output.size()))
        .bind("rank", Binding::Int(Placeholder::Concrete(output.rank())));
    for (name, values) in tables {
        injector = injector.bind(name, Binding::Ints(values));
    }
    Ok(vec![backend.kernel(context, &template, injector)?])
}
