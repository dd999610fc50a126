// =================================================================================================
// WGSL GENERATION
// =================================================================================================
// One compute entry point `main` per kernel description. Binding 0 is always the parameter
// block; the remaining bindings follow `KernelKind::bindings`.
//
// Combine order mirrors the host kernels: Hillis-Steele for scans, a stride-doubling tree for
// reductions.

use crate::kernel::{KernelKind, KernelSpec};
use crate::operator::{Combine, Load, Operator, ScalarFormat};

fn scalar(format: ScalarFormat) -> &'static str {
	match format {
		ScalarFormat::U32 => "u32",
		ScalarFormat::I32 => "i32",
		ScalarFormat::F32 => "f32",
	}
}

/// Shared declarations: parameter block, element types, operator functions.
fn prelude(op: &Operator, spec: &KernelSpec) -> String {
	let t = scalar(op.format);
	let mut src = String::new();

	src.push_str(&format!("const WL: u32 = {}u;\n", spec.workgroup_length));
	src.push_str(&format!("const BL: u32 = {}u;\n", spec.block_length));
	src.push_str(
		"
struct Params {
	source_offset: u32,
	destination_offset: u32,
	block_sums_offset: u32,
	element_count: u32,
	workgroup_offset: u32,
	exclusive: u32,
	initial_value: u32,
	padding: u32,
}

@group(0) @binding(0) var<uniform> params: Params;
",
	);
	src.push_str(&format!("\nstruct Elem {{ v: array<{}, {}> }}\n", t, op.lanes));
	src.push_str(&format!("struct InElem {{ v: array<{}, {}> }}\n", t, op.input_lanes));

	// ---------- identity ---------------------------------------------------------
	// read through a variable so infinite identities are never constant-folded
	let bits: Vec<String> = op.identity.iter().map(|bits| format!("{:#x}u", bits)).collect();
	src.push_str("\nfn identity_element() -> Elem {\n");
	src.push_str(&format!("\tvar bits = array<u32, {}>({});\n", op.lanes, bits.join(", ")));
	src.push_str("\tvar e: Elem;\n");
	for lane in 0..op.lanes {
		src.push_str(&format!("\te.v[{0}] = bitcast<{1}>(bits[{0}]);\n", lane, t));
	}
	src.push_str("\treturn e;\n}\n");

	// ---------- combine ----------------------------------------------------------
	src.push_str("\nfn combine(a: Elem, b: Elem) -> Elem {\n\tvar r: Elem;\n");
	for lane in 0..op.lanes {
		let expr = match (op.combine, lane) {
			(Combine::Add, _) => format!("a.v[{0}] + b.v[{0}]", lane),
			(Combine::Min, _) | (Combine::MinMax, 0) => format!("min(a.v[{0}], b.v[{0}])", lane),
			(Combine::Max, _) | (Combine::MinMax, _) => format!("max(a.v[{0}], b.v[{0}])", lane),
		};
		src.push_str(&format!("\tr.v[{}] = {};\n", lane, expr));
	}
	src.push_str("\treturn r;\n}\n");

	// ---------- load -------------------------------------------------------------
	src.push_str("\nfn load_element(x: InElem) -> Elem {\n\tvar e: Elem;\n");
	for lane in 0..op.lanes {
		let from = match op.load {
			Load::Direct => lane,
			Load::Splat => 0,
		};
		src.push_str(&format!("\te.v[{}] = x.v[{}];\n", lane, from));
	}
	src.push_str("\treturn e;\n}\n");

	// ---------- initial value ----------------------------------------------------
	src.push_str("\nfn initial_element() -> Elem {\n\tvar e: Elem;\n");
	for lane in 0..op.lanes {
		src.push_str(&format!("\te.v[{}] = bitcast<{}>(params.initial_value);\n", lane, t));
	}
	src.push_str("\treturn e;\n}\n");

	src
}

/// Expression reading element `index` of `array`, through `load_element` when it is a source.
fn read_source(array: &str, index: &str, load_source: bool) -> String {
	if load_source {
		format!("load_element({}[{}])", array, index)
	} else {
		format!("{}[{}]", array, index)
	}
}

fn source_type(load_source: bool) -> &'static str {
	if load_source {
		"InElem"
	} else {
		"Elem"
	}
}

fn workgroup_scan(emit_block_sums: bool, load_source: bool) -> String {
	let mut src = String::new();
	src.push_str(&format!(
		"@group(0) @binding(1) var<storage, read> source_elements: array<{}>;\n",
		source_type(load_source)
	));
	src.push_str("@group(0) @binding(2) var<storage, read_write> scan_result: array<Elem>;\n");
	if emit_block_sums {
		src.push_str("@group(0) @binding(3) var<storage, read_write> block_sums: array<Elem>;\n");
	}
	src.push_str("\nvar<workgroup> scratch: array<Elem, WL>;\n");

	let load = read_source("source_elements", "params.source_offset + gi", load_source);
	src.push_str(&format!(
		"
@compute @workgroup_size(WL)
fn main(@builtin(local_invocation_id) lid3: vec3<u32>, @builtin(workgroup_id) wid3: vec3<u32>) {{
	let lid = lid3.x;
	let group_index = params.workgroup_offset + wid3.x;
	let gi = group_index * WL + lid;

	var element = identity_element();
	if (gi < params.element_count) {{
		element = {load};
	}}
	scratch[lid] = element;
	workgroupBarrier();

	for (var span = 1u; span < WL; span = span * 2u) {{
		var previous = identity_element();
		let take = lid >= span;
		if (take) {{
			previous = scratch[lid - span];
		}}
		workgroupBarrier();
		if (take) {{
			scratch[lid] = combine(previous, scratch[lid]);
		}}
		workgroupBarrier();
	}}

	if (gi < params.element_count) {{
		var scanned = scratch[lid];
		if (params.exclusive != 0u) {{
			if (lid == 0u) {{
				scanned = initial_element();
			}} else {{
				scanned = combine(initial_element(), scratch[lid - 1u]);
			}}
		}}
		scan_result[params.destination_offset + gi] = scanned;
	}}
"
	));
	if emit_block_sums {
		src.push_str(
			"
	if (lid == WL - 1u) {
		block_sums[params.block_sums_offset + group_index] = scratch[WL - 1u];
	}
",
		);
	}
	src.push_str("}\n");
	src
}

fn apply_block_sums() -> String {
	"@group(0) @binding(1) var<storage, read> partial_scan: array<Elem>;
@group(0) @binding(2) var<storage, read> block_scan: array<Elem>;
@group(0) @binding(3) var<storage, read_write> scan_result: array<Elem>;

fn inclusive_at(j: u32) -> Elem {
	let partial = partial_scan[params.source_offset + j];
	let block_index = j / WL;
	if (block_index == 0u) {
		return partial;
	}
	return combine(block_scan[params.block_sums_offset + block_index - 1u], partial);
}

@compute @workgroup_size(WL)
fn main(@builtin(local_invocation_id) lid3: vec3<u32>, @builtin(workgroup_id) wid3: vec3<u32>) {
	let i = (params.workgroup_offset + wid3.x) * WL + lid3.x;
	if (i >= params.element_count) {
		return;
	}
	let destination = params.destination_offset + i;
	if (params.exclusive == 0u) {
		scan_result[destination] = inclusive_at(i);
	} else if (i == 0u) {
		scan_result[destination] = initial_element();
	} else {
		scan_result[destination] = combine(initial_element(), inclusive_at(i - 1u));
	}
}
"
	.to_string()
}

fn reduce(load_source: bool) -> String {
	let mut src = String::new();
	src.push_str(&format!(
		"@group(0) @binding(1) var<storage, read> source_elements: array<{}>;\n",
		source_type(load_source)
	));
	src.push_str("@group(0) @binding(2) var<storage, read_write> reduced: array<Elem>;\n");
	src.push_str("\nvar<workgroup> scratch: array<Elem, WL>;\n");

	let load = read_source("source_elements", "params.source_offset + i", load_source);
	src.push_str(&format!(
		"
@compute @workgroup_size(WL)
fn main(@builtin(local_invocation_id) lid3: vec3<u32>, @builtin(workgroup_id) wid3: vec3<u32>) {{
	let lid = lid3.x;
	let group_index = params.workgroup_offset + wid3.x;
	let base = group_index * WL * BL + lid * BL;

	var acc = identity_element();
	for (var k = 0u; k < BL; k = k + 1u) {{
		let i = base + k;
		if (i < params.element_count) {{
			acc = combine(acc, {load});
		}}
	}}
	scratch[lid] = acc;
	workgroupBarrier();

	for (var stride = 1u; stride < WL; stride = stride * 2u) {{
		if (lid % (2u * stride) == 0u && lid + stride < WL) {{
			scratch[lid] = combine(scratch[lid], scratch[lid + stride]);
		}}
		workgroupBarrier();
	}}

	if (lid == 0u) {{
		reduced[params.destination_offset + group_index] = scratch[0];
	}}
}}
"
	));
	src
}

/// Complete WGSL module for `spec`.
pub fn kernel_source(spec: &KernelSpec) -> String {
	let mut src = prelude(&spec.operator, spec);
	src.push('\n');
	src.push_str(&match spec.kind {
		KernelKind::WorkgroupScan { emit_block_sums, load_source } => {
			workgroup_scan(emit_block_sums, load_source)
		}
		KernelKind::ApplyBlockSums => apply_block_sums(),
		KernelKind::Reduce { load_source } => reduce(load_source),
	});
	src
}
