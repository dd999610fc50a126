// =================================================================================================
// APPLY BLOCK SUMS
// =================================================================================================
// Adds each block's resolved prefix to a per-block partial scan, one workgroup per block.
//
// Binding contract:
//   0 params        uniform, dynamic offset per dispatch slice
//   1 partial_scan  read
//   2 block_scan    read  (inclusive scan of the partial scan's block sums)
//   3 result        read_write

use compute_engine::{
	plan_params_image, record_planned_pass, BindingAccess, BufferId, BufferRole, ComputeDevice,
	ComputeError, DeviceBuffer, GpuContext, KernelKind, KernelSpec, Memo, Operator, OwnedBuffers,
	Overrides, PassParams, RecordCommands, ResolvedSizes, PASS_PARAMS_SIZE,
};
use dispatch_slicing::DispatchPlan;
use std::sync::Arc;

pub struct ApplyBlockSumsParams<D: ComputeDevice> {
	pub partial_scan: D::Buffer,
	pub block_scan: D::Buffer,
	pub operator: Arc<Operator>,
	pub element_count: u32,
	pub partial_offset: u32,
	pub block_scan_offset: u32,
	/// Shift the result into an exclusive scan seeded with `initial_value`.
	pub exclusive: bool,
	pub initial_value: f64,
	/// Must match the workgroup length the partial scan was produced with.
	pub overrides: Overrides,
	pub label: Option<String>,
}

impl<D: ComputeDevice> ApplyBlockSumsParams<D> {
	pub fn new(
		partial_scan: D::Buffer,
		block_scan: D::Buffer,
		operator: Arc<Operator>,
		element_count: u32,
	) -> Self {
		Self {
			partial_scan,
			block_scan,
			operator,
			element_count,
			partial_offset: 0,
			block_scan_offset: 0,
			exclusive: false,
			initial_value: 0.0,
			overrides: Overrides::default(),
			label: None,
		}
	}
}

#[derive(Debug, Clone, PartialEq)]
struct ApplyKey {
	partial_scan: BufferId,
	block_scan: BufferId,
	operator: Arc<Operator>,
	element_count: u32,
	offsets: [u32; 2],
	exclusive: bool,
	initial_value: u32,
	sizes: ResolvedSizes,
}

struct BuiltApply<D: ComputeDevice> {
	_owned: OwnedBuffers<D>,
	pipeline: D::Pipeline,
	params: D::Buffer,
	result: D::Buffer,
	plan: DispatchPlan,
}

pub struct ApplyBlockSums<D: ComputeDevice> {
	ctx: GpuContext<D>,
	params: ApplyBlockSumsParams<D>,
	built: Memo<ApplyKey, BuiltApply<D>>,
}

impl<D: ComputeDevice> ApplyBlockSums<D> {
	pub fn new(ctx: &GpuContext<D>, params: ApplyBlockSumsParams<D>) -> Result<Self, ComputeError> {
		let apply = Self { ctx: ctx.clone(), params, built: Memo::new() };
		apply.key()?;
		Ok(apply)
	}

	pub fn label(&self) -> &str {
		self.params.label.as_deref().unwrap_or("apply_block_sums")
	}

	pub fn sizes(&self) -> ResolvedSizes {
		self.params.overrides.resolve(&self.ctx.limits(), self.params.operator.elem_size())
	}

	fn key(&self) -> Result<ApplyKey, ComputeError> {
		let params = &self.params;
		params.operator.validate()?;
		let sizes = self.sizes();
		let elem_size = params.operator.elem_size();
		let n = params.element_count as u64;

		if params.partial_scan.elements(elem_size) < params.partial_offset as u64 + n {
			return Err(ComputeError::config(
				"partial_scan",
				format!("`{}` holds fewer than {} elements", params.partial_scan.label(), n),
			));
		}
		// the last block reads the prefix of the block before it
		let prefixes = (params.element_count.div_ceil(sizes.workgroup_length) as u64).saturating_sub(1);
		if params.block_scan.elements(elem_size) < params.block_scan_offset as u64 + prefixes {
			return Err(ComputeError::config(
				"block_scan",
				format!("`{}` holds fewer than {} block prefixes", params.block_scan.label(), prefixes),
			));
		}

		Ok(ApplyKey {
			partial_scan: params.partial_scan.id(),
			block_scan: params.block_scan.id(),
			operator: params.operator.clone(),
			element_count: params.element_count,
			offsets: [params.partial_offset, params.block_scan_offset],
			exclusive: params.exclusive,
			initial_value: params.operator.format.encode(params.initial_value),
			sizes,
		})
	}

	fn built(&mut self) -> Result<&mut BuiltApply<D>, ComputeError> {
		let key = self.key()?;
		let ctx = &self.ctx;
		let params = &self.params;
		let label = params.label.as_deref().unwrap_or("apply_block_sums");
		self.built.get_or_try_init(key.clone(), || build(ctx, params, label, &key))
	}

	/// The globally correct scan. Valid to read once this pass has executed.
	pub fn result(&mut self) -> Result<D::Buffer, ComputeError> {
		Ok(self.built()?.result.clone())
	}

	pub fn run(&mut self) -> Result<Vec<f64>, ComputeError> {
		let device = self.ctx.device().clone();
		let mut stream = device.create_stream(self.label());
		self.record_commands(&mut stream)?;
		device.submit(stream)?;

		let result = self.result()?;
		self.ctx.read_values(&result, &self.params.operator, 0, self.params.element_count as u64)
	}

	pub fn destroy(&mut self) {
		self.built.invalidate();
	}

	pub fn set_exclusive(&mut self, exclusive: bool, initial_value: f64) {
		self.params.exclusive = exclusive;
		self.params.initial_value = initial_value;
	}

	pub fn set_inputs(&mut self, partial_scan: D::Buffer, block_scan: D::Buffer) {
		self.params.partial_scan = partial_scan;
		self.params.block_scan = block_scan;
	}

	pub fn set_overrides(&mut self, overrides: Overrides) {
		self.params.overrides = overrides;
	}
}

fn build<D: ComputeDevice>(
	ctx: &GpuContext<D>,
	params: &ApplyBlockSumsParams<D>,
	label: &str,
	key: &ApplyKey,
) -> Result<BuiltApply<D>, ComputeError> {
	let op = &params.operator;
	let wl = key.sizes.workgroup_length;
	let n = key.element_count;
	let mut owned = OwnedBuffers::new(ctx.device().clone());

	let plan = DispatchPlan::new(n, wl, key.sizes.max_dispatches, PASS_PARAMS_SIZE, key.sizes.param_alignment);
	log::debug!("{}: {} elements, {} dispatch slice(s)", label, n, plan.slices.len());

	let result = owned.allocate(&format!("{}_result", label), n as u64 * op.elem_size(), BufferRole::Storage)?;
	let image = plan_params_image(&plan, |slice| PassParams {
		source_offset: params.partial_offset,
		destination_offset: 0,
		block_sums_offset: params.block_scan_offset,
		element_count: n,
		workgroup_offset: slice.dispatch_offset,
		exclusive: key.exclusive as u32,
		initial_value: key.initial_value,
		padding: 0,
	});
	let params_buffer = owned.allocate_params(&format!("{}_params", label), &image)?;

	let pipeline = ctx.pipeline(&KernelSpec {
		kind: KernelKind::ApplyBlockSums,
		operator: op.clone(),
		workgroup_length: wl,
		block_length: 1,
	})?;

	Ok(BuiltApply { _owned: owned, pipeline, params: params_buffer, result, plan })
}

impl<D: ComputeDevice> RecordCommands<D> for ApplyBlockSums<D> {
	fn record_commands(&mut self, stream: &mut D::Stream) -> Result<(), ComputeError> {
		let partial_scan = self.params.partial_scan.clone();
		let block_scan = self.params.block_scan.clone();
		let label = self.label().to_string();
		let device = self.ctx.device().clone();
		let built = self.built()?;

		let buffers = [
			(&built.params, BindingAccess::Params),
			(&partial_scan, BindingAccess::Read),
			(&block_scan, BindingAccess::Read),
			(&built.result, BindingAccess::ReadWrite),
		];
		record_planned_pass(&device, stream, &label, &built.pipeline, &buffers, &built.plan)?;
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use compute_engine::{HostDevice, HostLinker, ScalarFormat};

	fn context() -> GpuContext<HostDevice> {
		GpuContext::new(HostDevice::default(), HostLinker::default())
	}

	#[test]
	fn test_adds_preceding_block_prefix() -> anyhow::Result<()> {
		let ctx = context();
		let partial = ctx.upload("partial", &[0u32, 1, 3, 6, 4, 9, 15])?;
		let block_scan = ctx.upload("block_scan", &[6u32, 21])?;
		let op = Arc::new(Operator::sum(ScalarFormat::U32));
		let mut params = ApplyBlockSumsParams::new(partial, block_scan, op, 7);
		params.overrides = Overrides::workgroup_length(4);
		let mut apply = ApplyBlockSums::new(&ctx, params)?;

		assert_eq!(apply.run()?, vec![0.0, 1.0, 3.0, 6.0, 10.0, 15.0, 21.0]);
		Ok(())
	}

	#[test]
	fn test_exclusive_shifts_and_seeds() -> anyhow::Result<()> {
		let ctx = context();
		let partial = ctx.upload("partial", &[0u32, 1, 3, 6, 4, 9, 15])?;
		let block_scan = ctx.upload("block_scan", &[6u32, 21])?;
		let op = Arc::new(Operator::sum(ScalarFormat::U32));
		let mut params = ApplyBlockSumsParams::new(partial, block_scan, op, 7);
		params.overrides = Overrides::workgroup_length(4);
		params.exclusive = true;
		params.initial_value = 9.0;
		let mut apply = ApplyBlockSums::new(&ctx, params)?;

		assert_eq!(apply.run()?, vec![9.0, 9.0, 10.0, 12.0, 15.0, 19.0, 24.0]);

		apply.set_exclusive(false, 0.0);
		assert_eq!(apply.run()?[6], 21.0);
		Ok(())
	}

	#[test]
	fn test_offsets_into_shared_inputs() -> anyhow::Result<()> {
		let ctx = context();
		let partial = ctx.upload("partial", &[77u32, 1, 2, 1, 2])?;
		let block_scan = ctx.upload("block_scan", &[77u32, 77, 3])?;
		let op = Arc::new(Operator::sum(ScalarFormat::U32));
		let mut params = ApplyBlockSumsParams::new(partial, block_scan, op, 4);
		params.partial_offset = 1;
		params.block_scan_offset = 2;
		params.overrides = Overrides::workgroup_length(2);
		let mut apply = ApplyBlockSums::new(&ctx, params)?;

		assert_eq!(apply.run()?, vec![1.0, 2.0, 4.0, 5.0]);
		Ok(())
	}

	#[test]
	fn test_short_block_scan_is_rejected() -> anyhow::Result<()> {
		let ctx = context();
		let partial = ctx.upload("partial", &[0u32; 12])?;
		let block_scan = ctx.upload("block_scan", &[0u32])?;
		let op = Arc::new(Operator::sum(ScalarFormat::U32));
		let mut params = ApplyBlockSumsParams::new(partial, block_scan, op, 12);
		params.overrides = Overrides::workgroup_length(4);
		let err = ApplyBlockSums::new(&ctx, params).err().expect("three blocks need two prefixes");
		assert!(err.is_config());
		Ok(())
	}
}
