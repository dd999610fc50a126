// =================================================================================================
// REDUCE BUFFER
// =================================================================================================
// Reduces a buffer of any length to one operator element with a chain of tree reductions.
//
//   layer 0: source   -> layer_0   (one element per workgroup, block_length per thread)
//   layer 1: layer_0  -> layer_1
//   ...
//   layer k: layer_k-1 -> result[result_offset]
//
// Binding contract of every layer:
//   0 params  uniform, dynamic offset per dispatch slice
//   1 input   read
//   2 output  read_write

use compute_engine::{
	plan_params_image, record_planned_pass, BindingAccess, BufferId, BufferRole, ComputeDevice,
	ComputeError, DeviceBuffer, GpuContext, KernelKind, KernelSpec, Memo, Operator, OwnedBuffers,
	Overrides, PassParams, RecordCommands, ResolvedSizes, PASS_PARAMS_SIZE,
};
use dispatch_slicing::DispatchPlan;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Output element count of each reduction layer. The last entry is always 1.
///
/// An empty source still gets one layer, which writes the identity.
pub fn reduce_layer_counts(element_count: u32, workgroup_length: u32, block_length: u32) -> Vec<u32> {
	let per_workgroup = (workgroup_length.max(1) * block_length.max(1)).max(2);
	let mut counts = vec![element_count.div_ceil(per_workgroup).max(1)];
	let mut count = counts[0];
	while count > 1 {
		count = count.div_ceil(per_workgroup);
		counts.push(count);
	}
	counts
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReduceShape {
	pub workgroup_length: u32,
	pub block_length: u32,
	pub layer_counts: Vec<u32>,
}

impl ReduceShape {
	pub fn layers(&self) -> usize {
		self.layer_counts.len()
	}
}

pub struct ReduceBufferParams<D: ComputeDevice> {
	pub source: D::Buffer,
	pub operator: Arc<Operator>,
	pub source_offset: u32,
	/// Defaults to everything in `source` past `source_offset`.
	pub element_count: Option<u32>,
	/// Write the reduction into this buffer at `result_offset` instead of an owned one.
	pub result: Option<D::Buffer>,
	pub result_offset: u32,
	pub overrides: Overrides,
	pub label: Option<String>,
}

impl<D: ComputeDevice> ReduceBufferParams<D> {
	pub fn new(source: D::Buffer, operator: Arc<Operator>) -> Self {
		Self {
			source,
			operator,
			source_offset: 0,
			element_count: None,
			result: None,
			result_offset: 0,
			overrides: Overrides::default(),
			label: None,
		}
	}
}

#[derive(Debug, Clone, PartialEq)]
struct ReduceKey {
	source: BufferId,
	operator: Arc<Operator>,
	element_count: u32,
	source_offset: u32,
	result: Option<BufferId>,
	result_offset: u32,
	sizes: ResolvedSizes,
}

struct ReduceLayer<D: ComputeDevice> {
	pipeline: D::Pipeline,
	params: D::Buffer,
	input: D::Buffer,
	output: D::Buffer,
	plan: DispatchPlan,
}

struct BuiltReduce<D: ComputeDevice> {
	_owned: OwnedBuffers<D>,
	layers: Vec<ReduceLayer<D>>,
	result: D::Buffer,
}

pub struct ReduceBuffer<D: ComputeDevice> {
	ctx: GpuContext<D>,
	params: ReduceBufferParams<D>,
	built: Memo<ReduceKey, BuiltReduce<D>>,
}

impl<D: ComputeDevice> ReduceBuffer<D> {
	pub fn new(ctx: &GpuContext<D>, params: ReduceBufferParams<D>) -> Result<Self, ComputeError> {
		let reduce = Self { ctx: ctx.clone(), params, built: Memo::new() };
		reduce.key()?;
		Ok(reduce)
	}

	pub fn label(&self) -> &str {
		self.params.label.as_deref().unwrap_or("reduce_buffer")
	}

	pub fn operator(&self) -> &Arc<Operator> {
		&self.params.operator
	}

	pub fn sizes(&self) -> ResolvedSizes {
		self.params.overrides.resolve(&self.ctx.limits(), self.params.operator.elem_size())
	}

	pub fn element_count(&self) -> Result<u32, ComputeError> {
		let available = self
			.params
			.source
			.elements(self.params.operator.input_elem_size())
			.saturating_sub(self.params.source_offset as u64);
		match self.params.element_count {
			Some(count) if count as u64 > available => Err(ComputeError::config(
				"element_count",
				format!(
					"{} elements requested but `{}` holds {} past offset {}",
					count,
					self.params.source.label(),
					available,
					self.params.source_offset
				),
			)),
			Some(count) => Ok(count),
			None => Ok(available.min(u32::MAX as u64) as u32),
		}
	}

	pub fn shape(&self) -> Result<ReduceShape, ComputeError> {
		let sizes = self.sizes();
		Ok(ReduceShape {
			workgroup_length: sizes.workgroup_length,
			block_length: sizes.block_length,
			layer_counts: reduce_layer_counts(
				self.element_count()?,
				sizes.workgroup_length,
				sizes.block_length,
			),
		})
	}

	fn key(&self) -> Result<ReduceKey, ComputeError> {
		let params = &self.params;
		params.operator.validate()?;
		let element_count = self.element_count()?;

		if let Some(result) = &params.result {
			if result.id() == params.source.id() {
				return Err(ComputeError::config("result", "the result buffer must not alias the source"));
			}
			let needed = params.result_offset as u64 + 1;
			if result.elements(params.operator.elem_size()) < needed {
				return Err(ComputeError::config(
					"result",
					format!("`{}` holds fewer than {} elements", result.label(), needed),
				));
			}
		}

		Ok(ReduceKey {
			source: params.source.id(),
			operator: params.operator.clone(),
			element_count,
			source_offset: params.source_offset,
			result: params.result.as_ref().map(|b| b.id()),
			result_offset: params.result_offset,
			sizes: self.sizes(),
		})
	}

	fn built(&mut self) -> Result<&mut BuiltReduce<D>, ComputeError> {
		let key = self.key()?;
		let ctx = &self.ctx;
		let params = &self.params;
		let label = params.label.as_deref().unwrap_or("reduce_buffer");
		self.built.get_or_try_init(key.clone(), || build(ctx, params, label, &key))
	}

	/// Buffer holding the reduction at `result_offset`. Valid to read once the last layer has
	/// executed.
	pub fn result(&mut self) -> Result<D::Buffer, ComputeError> {
		Ok(self.built()?.result.clone())
	}

	/// Submit every layer and read the reduced element back, lanes flattened.
	pub fn run(&mut self) -> Result<Vec<f64>, ComputeError> {
		let device = self.ctx.device().clone();
		let mut stream = device.create_stream(self.label());
		self.record_commands(&mut stream)?;
		device.submit(stream)?;

		let result = self.result()?;
		self.ctx.read_values(&result, &self.params.operator, self.params.result_offset as u64, 1)
	}

	pub fn destroy(&mut self) {
		self.built.invalidate();
	}

	// ---------- configuration --------------------------------------------------

	pub fn set_source(&mut self, source: D::Buffer, source_offset: u32) {
		self.params.source = source;
		self.params.source_offset = source_offset;
	}

	pub fn set_operator(&mut self, operator: Arc<Operator>) {
		self.params.operator = operator;
	}

	pub fn set_element_count(&mut self, element_count: Option<u32>) {
		self.params.element_count = element_count;
	}

	pub fn set_result(&mut self, result: Option<D::Buffer>, result_offset: u32) {
		self.params.result = result;
		self.params.result_offset = result_offset;
	}

	pub fn set_overrides(&mut self, overrides: Overrides) {
		self.params.overrides = overrides;
	}

	pub fn generation(&self) -> u64 {
		self.built.generation()
	}
}

fn build<D: ComputeDevice>(
	ctx: &GpuContext<D>,
	params: &ReduceBufferParams<D>,
	label: &str,
	key: &ReduceKey,
) -> Result<BuiltReduce<D>, ComputeError> {
	let op = &params.operator;
	let sizes = key.sizes;
	let per_workgroup = sizes.workgroup_length * sizes.block_length;
	let counts = reduce_layer_counts(key.element_count, sizes.workgroup_length, sizes.block_length);
	let mut owned = OwnedBuffers::new(ctx.device().clone());

	log::debug!(
		"{}: {} elements over {} layer(s) {:?}, workgroup {} x block {}",
		label,
		key.element_count,
		counts.len(),
		counts,
		sizes.workgroup_length,
		sizes.block_length
	);

	let result = match &params.result {
		Some(result) => result.clone(),
		None => owned.allocate(
			&format!("{}_result", label),
			(params.result_offset as u64 + 1) * op.elem_size(),
			BufferRole::Storage,
		)?,
	};

	let mut layers = Vec::with_capacity(counts.len());
	let mut input = params.source.clone();
	let mut input_offset = params.source_offset;
	let mut input_count = key.element_count;

	for (depth, &output_count) in counts.iter().enumerate() {
		let last = depth + 1 == counts.len();
		let (output, destination_offset) = if last {
			(result.clone(), params.result_offset)
		} else {
			let layer = owned.allocate(
				&format!("{}_layer_{}", label, depth),
				output_count as u64 * op.elem_size(),
				BufferRole::Storage,
			)?;
			(layer, 0)
		};

		// at least one workgroup so an empty source still writes the identity
		let plan = DispatchPlan::at_least_one(
			input_count,
			per_workgroup,
			sizes.max_dispatches,
			PASS_PARAMS_SIZE,
			sizes.param_alignment,
		);
		let image = plan_params_image(&plan, |slice| PassParams {
			source_offset: input_offset,
			destination_offset,
			element_count: input_count,
			workgroup_offset: slice.dispatch_offset,
			..Default::default()
		});
		let params_buffer = owned.allocate_params(&format!("{}_params_{}", label, depth), &image)?;

		let pipeline = ctx.pipeline(&KernelSpec {
			kind: KernelKind::Reduce { load_source: depth == 0 },
			operator: op.clone(),
			workgroup_length: sizes.workgroup_length,
			block_length: sizes.block_length,
		})?;

		layers.push(ReduceLayer {
			pipeline,
			params: params_buffer,
			input: input.clone(),
			output: output.clone(),
			plan,
		});
		input = output;
		input_offset = 0;
		input_count = output_count;
	}

	Ok(BuiltReduce { _owned: owned, layers, result })
}

impl<D: ComputeDevice> RecordCommands<D> for ReduceBuffer<D> {
	fn record_commands(&mut self, stream: &mut D::Stream) -> Result<(), ComputeError> {
		let label = self.label().to_string();
		let device = self.ctx.device().clone();
		let built = self.built()?;

		for (depth, layer) in built.layers.iter().enumerate() {
			let buffers = [
				(&layer.params, BindingAccess::Params),
				(&layer.input, BindingAccess::Read),
				(&layer.output, BindingAccess::ReadWrite),
			];
			let pass_label = format!("{}_layer_{}", label, depth);
			record_planned_pass(&device, stream, &pass_label, &layer.pipeline, &buffers, &layer.plan)?;
		}
		Ok(())
	}
}
