//! End-to-end checks of the three backends.
//!
//! Kernels are executed by an emulator that only reads the binding tables, the meta buffer and
//! the layout, the way a runtime loader would, and compared against the reference interpreter.

use std::error::Error;

use itertools::Itertools;
use rustc_hash::FxHashMap as HashMap;

use super::{
    Allocation, BackendKind, BoundValue, Descriptor, GenerateError, GeneratorBuilder, Kernel, Launch, Layout,
    MemorySpace, WebGpu, template::UniformValue,
};
use crate::{
    config::Config,
    generate,
    loom::{
        axis::Axis,
        graph::{Graph, VarId},
        ops::{OpKind, Operator},
        variable::Variable,
    },
    order,
};

const BACKENDS: [BackendKind; 3] = [BackendKind::WebAssembly, BackendKind::WebGpu, BackendKind::WebGl];

fn floats(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|b| f32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

/// The bindings of one kernel, read back.
struct Bound<'a> {
    kernel: &'a Kernel,
    meta: Vec<i64>,
}

impl<'a> Bound<'a> {
    fn new(kernel: &'a Kernel) -> Self {
        let meta = kernel
            .meta
            .chunks_exact(4)
            .map(|b| i32::from_ne_bytes([b[0], b[1], b[2], b[3]]) as i64)
            .collect();
        Self { kernel, meta }
    }

    fn value(&self, name: &str) -> Option<&BoundValue> {
        self.kernel
            .bindings
            .iter()
            .find(|binding| binding.name == name)
            .map(|binding| &binding.value)
    }

    fn ints(&self, name: &str) -> Option<Vec<i64>> {
        match self.value(name)? {
            BoundValue::Literal(x) => Some(vec![*x]),
            BoundValue::Meta { offset, len } => Some(self.meta[*offset..*offset + *len].to_vec()),
            BoundValue::Uniform {
                value: UniformValue::Int(x),
                ..
            } => Some(x.clone()),
            value => panic!("{name} is not an integer: {value:?}"),
        }
    }

    fn table(&self, name: &str) -> Vec<i64> {
        self.ints(name).unwrap_or_else(|| panic!("{} binds no {name}", self.kernel.name))
    }

    fn float(&self, name: &str) -> f32 {
        match self.value(name) {
            Some(BoundValue::Float(x)) => *x,
            value => panic!("{name} is not a float: {value:?}"),
        }
    }

    fn buffer(&self, name: &str) -> Allocation {
        match self.value(name) {
            Some(BoundValue::Buffer(allocation)) => allocation.clone(),
            value => panic!("{name} is not a buffer: {value:?}"),
        }
    }

    fn sampler(&self, name: &str) -> VarId {
        match self.value(name) {
            Some(BoundValue::Sampler { texture, .. }) => *texture,
            value => panic!("{name} is not a sampler: {value:?}"),
        }
    }

    /// Runs the kernel; returns `(output index, value)` pairs.
    fn evaluate(&self, load: impl Fn(&str, i64) -> f32) -> Vec<(i64, f32)> {
        let kind = self.kernel.kind;
        let size = self.ints("size").unwrap_or_else(|| self.table("y_size"))[0];
        let rank = self.ints("rank").map_or(4, |x| x[0]) as usize;

        let mut result = vec![];
        if kind.is_elementwise() {
            let names: &[&str] = match kind {
                OpKind::ScalarAffine => &["x"],
                OpKind::Select => &["x0", "x1", "x2"],
                _ => &["x0", "x1"],
            };
            let shape = self.table("shape");
            let y_stride = self.ints("y_stride");
            let strides = names.iter().map(|name| self.table(&format!("{name}_stride"))).collect_vec();
            for i in 0..size {
                let mut rem = i;
                let mut y_index = 0;
                let mut indices = vec![0; names.len()];
                for d in (0..rank).rev() {
                    let c = rem % shape[d];
                    rem /= shape[d];
                    if let Some(stride) = &y_stride {
                        y_index += c * stride[d];
                    }
                    for (index, stride) in indices.iter_mut().zip(&strides) {
                        *index += c * stride[d];
                    }
                }
                if y_stride.is_none() {
                    y_index = i;
                }
                let v = names.iter().zip(&indices).map(|(name, &index)| load(name, index)).collect_vec();
                let value = match kind {
                    OpKind::Add => v[0] + v[1],
                    OpKind::Mul => v[0] * v[1],
                    OpKind::Greater => f32::from(u8::from(v[0] > v[1])),
                    OpKind::GreaterEqual => f32::from(u8::from(v[0] >= v[1])),
                    OpKind::ScalarAffine => v[0] * self.float("scale") + self.float("bias"),
                    OpKind::Select => match v[0] != 0.0 {
                        true => v[1],
                        false => v[2],
                    },
                    _ => unreachable!(),
                };
                result.push((y_index, value));
            }
        } else {
            let y_shape = self.table("y_shape");
            let x_stride = self.table("x_stride");
            let x_shape = self.ints("x_shape");
            let begin = self.ints("slice_begin");
            let step = self.ints("slice_step");
            for i in 0..size {
                let mut rem = i;
                let mut x_index = 0;
                for d in (0..rank).rev() {
                    let c = rem % y_shape[d];
                    rem /= y_shape[d];
                    let coordinate = match kind {
                        OpKind::Tile => c % x_shape.as_ref().unwrap()[d],
                        OpKind::Slice => begin.as_ref().unwrap()[d] + c * step.as_ref().unwrap()[d],
                        OpKind::Resize2D => c * x_shape.as_ref().unwrap()[d] / y_shape[d],
                        _ => c,
                    };
                    x_index += coordinate * x_stride[d];
                }
                result.push((i, load("x", x_index)));
            }
        }
        result
    }
}

/// Executes `descriptor` on `feeds` and returns the data of `outputs`.
fn emulate(
    descriptor: &Descriptor,
    feeds: &[(VarId, Vec<f32>)],
    outputs: &[VarId],
) -> Result<Vec<Vec<f32>>, Box<dyn Error>> {
    let constants = floats(&descriptor.constants);
    match &descriptor.layout {
        Layout::Memory(layout) => {
            let dynamic_size = layout.dynamic_size.value().ok_or("symbolic dynamic size")?;
            let mut memory = vec![0.0f32; layout.static_size + dynamic_size];
            memory[..constants.len()].copy_from_slice(&constants);
            let address = |allocation: &Allocation| -> usize {
                let base = match allocation.space {
                    MemorySpace::Static => 0,
                    MemorySpace::Dynamic => layout.static_size,
                };
                base + allocation.offset.value().unwrap_or_default()
            };
            for (id, data) in feeds {
                let allocation = layout.get(*id).ok_or("input is not placed")?;
                let start = address(allocation);
                memory[start..start + data.len()].copy_from_slice(data);
            }
            for kernel in &descriptor.kernels {
                let bound = Bound::new(kernel);
                let y = address(&bound.buffer("y"));
                let values = bound.evaluate(|name, index| memory[address(&bound.buffer(name)) + index as usize]);
                for (index, value) in values {
                    memory[y + index as usize] = value;
                }
            }
            outputs
                .iter()
                .map(|id| {
                    let allocation = layout.get(*id).ok_or("output is not placed")?;
                    let start = address(allocation);
                    let size = allocation.size.value().ok_or("symbolic output")?;
                    Ok(memory[start..start + size].to_vec())
                })
                .collect()
        }
        Layout::Texture(layout) => {
            let mut textures: HashMap<VarId, Vec<f32>> = HashMap::default();
            for (&id, texture) in &layout.textures {
                let mut data = vec![0.0; texture.shape.texels() * texture.channel_mode.channels()];
                if let Some(offset) = texture.constant_offset {
                    data[..texture.size].copy_from_slice(&constants[offset..offset + texture.size]);
                }
                textures.insert(id, data);
            }
            for (id, data) in feeds {
                let texture = textures.get_mut(id).ok_or("input has no texture")?;
                texture[..data.len()].copy_from_slice(data);
            }
            for kernel in &descriptor.kernels {
                let Launch::Fragment { output, width, height } = kernel.launch else {
                    return Err("not a fragment kernel".into());
                };
                let texture = layout.get(output).ok_or("output has no texture")?;
                assert_eq!((width, height), (texture.shape.width, texture.shape.height));

                let bound = Bound::new(kernel);
                let values = bound.evaluate(|name, index| textures[&bound.sampler(name)][index as usize]);
                let y = textures.get_mut(&output).ok_or("output has no texture")?;
                for (index, value) in values {
                    y[index as usize] = value;
                }
            }
            outputs
                .iter()
                .map(|id| {
                    let size = layout.get(*id).ok_or("output has no texture")?.size;
                    Ok(textures[id][..size].to_vec())
                })
                .collect()
        }
    }
}

fn random(len: usize) -> Vec<f32> {
    (0..len).map(|_| fastrand::f32() * 2.0 - 1.0).collect()
}

fn check(graph: &Graph, feeds: Vec<(VarId, Vec<f32>)>, config: &Config) -> Result<(), Box<dyn Error>> {
    let outputs = graph.outputs();
    let expected = graph.run(feeds.clone())?;
    for backend in BACKENDS {
        let descriptor = generate(backend, graph, config)?;
        assert_eq!(descriptor.backend, backend);
        let actual = emulate(&descriptor, &feeds, &outputs)?;
        for (id, actual) in outputs.iter().zip_eq(actual) {
            let expected = &expected[id];
            assert_eq!(expected.len(), actual.len(), "{backend}");
            for (index, (x, y)) in expected.iter().zip(&actual).enumerate() {
                assert!((x - y).abs() <= 1e-2, "{backend}: {x} != {y} at {index}");
            }
        }
    }
    Ok(())
}

fn resize() -> Result<(Graph, VarId), Box<dyn Error>> {
    let mut graph = Graph::new();
    let x = graph.add_input(Variable::new([2usize, 14, 15, 4], order![Axis::N, Axis::H, Axis::W, Axis::C])?);
    let y = graph.add_op(
        Operator::Resize2D {
            axis1: Axis::H,
            size1: 28,
            axis2: Axis::W,
            size2: 30,
        },
        &[x],
    )?;
    graph.mark_output(y)?;
    Ok((graph, x))
}

#[test]
fn test_resize() -> Result<(), Box<dyn Error>> {
    let (graph, x) = resize()?;
    check(&graph, vec![(x, random(2 * 14 * 15 * 4))], &Config::new())
}

/// Every operator kind in one chain, fed by `x` of `[2, 3]` and `t` of `[3]`.
fn pipeline() -> Result<(Graph, VarId, VarId), Box<dyn Error>> {
    let mut graph = Graph::new();
    let x = graph.add_input(Variable::new([2usize, 3], order![Axis::N, Axis::C])?);
    let t = graph.add_input(Variable::new([3usize], order![Axis::C])?);
    let bias = graph.add_variable(Variable::constant([3], order![Axis::C], vec![0.5, -0.25, 1.0])?);
    let a = graph.add_op(Operator::Add, &[x, bias])?;
    let m = graph.add_op(Operator::Mul, &[a, x])?;
    let g = graph.add_op(Operator::Greater, &[m, t])?;
    let e = graph.add_op(Operator::GreaterEqual, &[a, t])?;
    let s = graph.add_op(Operator::Select, &[g, a, e])?;
    let tiled = graph.add_op(Operator::Tile { multiplier: vec![1, 2] }, &[s])?;
    let sliced = graph.add_op(
        Operator::Slice {
            begin: vec![0, 1],
            end: vec![2, 6],
            stride: vec![1, 2],
        },
        &[tiled],
    )?;
    let y = graph.add_op(Operator::ScalarAffine { scale: 0.5, bias: -1.0 }, &[sliced])?;
    let z = graph.add_op(
        Operator::ReinterpretAxis {
            in_order: order![Axis::N, Axis::C],
            out_order: order![Axis::N, Axis::H],
        },
        &[y],
    )?;
    graph.mark_output(z)?;
    Ok((graph, x, t))
}

#[test]
fn test_pipeline() -> Result<(), Box<dyn Error>> {
    let (graph, x, t) = pipeline()?;
    for _ in 0..4 {
        check(&graph, vec![(x, random(6)), (t, random(3))], &Config::new())?;
    }
    check(
        &graph,
        vec![(x, random(6)), (t, random(3))],
        &Config::new().channel_mode(super::ChannelMode::Rgba).parallel(false),
    )
}

#[test]
fn test_unique_names() -> Result<(), Box<dyn Error>> {
    let mut graph = Graph::new();
    let x = graph.add_input(Variable::new([4usize], order![Axis::C])?);
    let op = Operator::ScalarAffine { scale: 1.0, bias: 1.0 };
    let y0 = graph.add_op(op.clone(), &[x])?;
    let y1 = graph.add_op(op, &[x])?;
    graph.mark_output(y0)?;
    graph.mark_output(y1)?;

    for backend in BACKENDS {
        let descriptor = generate(backend, &graph, &Config::new())?;
        let names = descriptor.kernels.iter().map(|kernel| kernel.name.as_str()).collect_vec();
        assert_eq!(names, ["scalar_affine_0", "scalar_affine_1"], "{backend}");
    }
    Ok(())
}

/// A graph with one operator of `kind`.
fn single(kind: OpKind) -> Result<Graph, Box<dyn Error>> {
    let mut graph = Graph::new();
    let variable = || Variable::new([2usize, 4], order![Axis::N, Axis::C]);
    let x = graph.add_input(variable()?);
    let op = match kind {
        OpKind::Add => Operator::Add,
        OpKind::Mul => Operator::Mul,
        OpKind::Greater => Operator::Greater,
        OpKind::GreaterEqual => Operator::GreaterEqual,
        OpKind::ScalarAffine => Operator::ScalarAffine { scale: 3.0, bias: 0.0 },
        OpKind::Select => Operator::Select,
        OpKind::Tile => Operator::Tile { multiplier: vec![2, 1] },
        OpKind::Slice => Operator::Slice {
            begin: vec![1, 0],
            end: vec![2, 4],
            stride: vec![1, 3],
        },
        OpKind::ReinterpretAxis => Operator::ReinterpretAxis {
            in_order: order![Axis::N, Axis::C],
            out_order: order![Axis::N, Axis::T],
        },
        OpKind::Resize2D => Operator::Resize2D {
            axis1: Axis::N,
            size1: 3,
            axis2: Axis::C,
            size2: 2,
        },
    };
    let mut inputs = vec![x];
    while inputs.len() < op.input_names().len() {
        inputs.push(graph.add_input(variable()?));
    }
    let y = graph.add_op(op, &inputs)?;
    graph.mark_output(y)?;
    Ok(graph)
}

#[test]
fn test_every_kind() -> Result<(), Box<dyn Error>> {
    for kind in OpKind::ALL {
        let graph = single(kind)?;
        let feeds = graph.inputs().into_iter().map(|id| (id, random(8))).collect_vec();
        check(&graph, feeds, &Config::new())?;
        for backend in BACKENDS {
            let descriptor = generate(backend, &graph, &Config::new())?;
            assert_eq!(descriptor.kernels.len(), 1);
            assert_eq!(descriptor.kernels[0].kind, kind);
            assert_eq!(descriptor.kernels[0].name, format!("{kind}_0"));
        }
    }
    Ok(())
}

#[test]
fn test_unsupported_operator() -> Result<(), Box<dyn Error>> {
    let graph = single(OpKind::Tile)?;
    let generator = GeneratorBuilder::<WebGpu>::new().build();
    let err = generator.generate(&graph, &Config::new());
    assert!(matches!(
        err,
        Err(GenerateError::UnsupportedOperator {
            backend: BackendKind::WebGpu,
            kind: OpKind::Tile
        })
    ));
    Ok(())
}

#[test]
fn test_backend_isolation() -> Result<(), Box<dyn Error>> {
    let mut graph = Graph::new();
    let x = graph.add_input(Variable::new([8usize, 1000], order![Axis::N, Axis::C])?);
    let y = graph.add_op(Operator::ScalarAffine { scale: 1.0, bias: 2.0 }, &[x])?;
    graph.mark_output(y)?;

    // 8000 scalars cannot fit in 16x16 texels
    let config = Config::new().max_texture_size(16);
    assert!(matches!(
        generate(BackendKind::WebGl, &graph, &config),
        Err(GenerateError::ResourceLimitExceeded { .. })
    ));
    assert!(generate(BackendKind::WebAssembly, &graph, &config).is_ok());
    assert!(generate(BackendKind::WebGpu, &graph, &config).is_ok());
    Ok(())
}

#[test]
fn test_wgsl_parses() -> Result<(), Box<dyn Error>> {
    for kind in OpKind::ALL {
        let descriptor = generate(BackendKind::WebGpu, &single(kind)?, &Config::new())?;
        for kernel in &descriptor.kernels {
            if let Err(err) = naga::front::wgsl::parse_str(&kernel.source) {
                panic!("{}: {}\n{}", kernel.name, err.emit_to_string(&kernel.source), kernel.source);
            }
            assert!(matches!(
                kernel.launch,
                Launch::Compute {
                    workgroup_size: [64, 1, 1],
                    ..
                }
            ));
        }
    }
    Ok(())
}

#[test]
fn test_serialize_descriptor() -> Result<(), Box<dyn Error>> {
    let graph = single(OpKind::Add)?;
    let descriptor = generate(BackendKind::WebGl, &graph, &Config::new())?;
    let value = serde_json::to_value(&descriptor)?;
    assert_eq!(value["backend"], "WebGl");
    assert_eq!(value["kernels"][0]["name"], "add_0");
    assert!(value["layout"]["Texture"]["textures"].is_object());
    Ok(())
}

/// Builds a C program around the WebAssembly kernels that feeds the inputs, runs every kernel
/// in order and prints the outputs.
fn c_program(descriptor: &Descriptor, feeds: &[(VarId, Vec<f32>)], outputs: &[VarId]) -> Result<String, Box<dyn Error>> {
    let Layout::Memory(layout) = &descriptor.layout else {
        return Err("expected a memory layout".into());
    };
    let dynamic_size = layout.dynamic_size.value().ok_or("symbolic dynamic size")?;
    let literals = |data: &[f32]| data.iter().map(|x| format!("{x:e}f")).chain(["0".into()]).join(", ");
    let address = |id: VarId| -> Result<(&'static str, usize), Box<dyn Error>> {
        let allocation = layout.get(id).ok_or("missing allocation")?;
        let base = match allocation.space {
            MemorySpace::Static => "static_buffer",
            MemorySpace::Dynamic => "dynamic_buffer",
        };
        Ok((base, allocation.offset.value().ok_or("symbolic offset")?))
    };

    let mut lines = vec![
        "#include <stdio.h>".to_string(),
        format!("static float static_data[] = {{{}}};", literals(&floats(&descriptor.constants))),
        format!("static float dynamic_data[{}];", dynamic_size + 1),
        "static float *static_buffer = static_data;".to_string(),
        "static float *dynamic_buffer = dynamic_data;".to_string(),
    ];
    for kernel in &descriptor.kernels {
        let meta = kernel
            .meta
            .chunks_exact(4)
            .map(|b| i32::from_ne_bytes([b[0], b[1], b[2], b[3]]).to_string())
            .chain(["0".into()])
            .join(", ");
        lines.push(format!("static const int meta_{}[] = {{{meta}}};", kernel.name));
        lines.push(kernel.source.clone());
    }

    lines.push("int main(void)\n{".to_string());
    for (index, (id, data)) in feeds.iter().enumerate() {
        let (base, offset) = address(*id)?;
        lines.push(format!("    static const float feed_{index}[] = {{{}}};", literals(data)));
        lines.push(format!(
            "    for (int i = 0; i < {}; i++) {base}[{offset} + i] = feed_{index}[i];",
            data.len()
        ));
    }
    for kernel in &descriptor.kernels {
        lines.push(format!("    {0}(meta_{0});", kernel.name));
    }
    for &id in outputs {
        let (base, offset) = address(id)?;
        let size = layout.get(id).and_then(|allocation| allocation.size.value()).ok_or("symbolic size")?;
        lines.push(format!(
            "    for (int i = 0; i < {size}; i++) printf(\"%.9g\\n\", {base}[{offset} + i]);"
        ));
    }
    lines.push("    return 0;\n}".to_string());
    Ok(lines.join("\n"))
}

#[test]
#[ignore = "needs a C compiler"]
fn test_c_kernels_run() -> Result<(), Box<dyn Error>> {
    use std::process::Command;

    let (resize, x) = resize()?;
    let (pipeline, p, t) = pipeline()?;
    let cases = [
        (resize, vec![(x, random(2 * 14 * 15 * 4))]),
        (pipeline, vec![(p, random(6)), (t, random(3))]),
    ];

    let dir = std::env::temp_dir().join(format!("kiln-{}", fastrand::u64(..)));
    std::fs::create_dir_all(&dir)?;
    for (index, (graph, feeds)) in cases.into_iter().enumerate() {
        let outputs = graph.outputs();
        let descriptor = generate(BackendKind::WebAssembly, &graph, &Config::new())?;
        let source = dir.join(format!("case_{index}.c"));
        let binary = dir.join(format!("case_{index}"));
        std::fs::write(&source, c_program(&descriptor, &feeds, &outputs)?)?;

        let status = Command::new("cc").arg("-std=c99").arg("-o").arg(&binary).arg(&source).status()?;
        assert!(status.success(), "cc failed on {}", source.display());
        let output = Command::new(&binary).output()?;
        assert!(output.status.success());

        let actual: Vec<f32> = String::from_utf8(output.stdout)?
            .lines()
            .map(str::parse)
            .collect::<Result<_, _>>()?;
        let expected = graph.run(feeds)?;
        let expected = outputs.iter().flat_map(|id| expected[id].iter().copied()).collect_vec();
        assert_eq!(expected.len(), actual.len());
        for (index, (x, y)) in expected.iter().zip(&actual).enumerate() {
            assert!((x - y).abs() <= 1e-4, "{x} != {y} at {index}");
        }
    }
    std::fs::remove_dir_all(&dir)?;
    Ok(())
}
