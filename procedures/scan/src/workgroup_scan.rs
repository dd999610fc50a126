// =================================================================================================
// WORKGROUP SCAN
// =================================================================================================
// One pass scanning every workgroup-sized block of a source independently, optionally
// writing each block's total to a block-sums buffer.
//
// Binding contract:
//   0 params      uniform, dynamic offset per dispatch slice
//   1 source      read
//   2 scan        read_write
//   3 block_sums  read_write (only when emitting block sums)

use compute_engine::{
	plan_params_image, record_planned_pass, BindingAccess, BufferId, BufferRole, ComputeDevice,
	ComputeError, DeviceBuffer, GpuContext, KernelKind, KernelSpec, Memo, Operator, OwnedBuffers,
	Overrides, PassParams, RecordCommands, ResolvedSizes, PASS_PARAMS_SIZE,
};
use dispatch_slicing::DispatchPlan;
use std::sync::Arc;

pub struct WorkgroupScanParams<D: ComputeDevice> {
	pub source: D::Buffer,
	pub operator: Arc<Operator>,
	/// Elements to scan; defaults to everything in `source` past `source_offset`.
	pub element_count: Option<u32>,
	pub source_offset: u32,
	pub scan_offset: u32,
	pub block_sums_offset: u32,
	/// Write the scan into this buffer instead of an owned one.
	pub scan_target: Option<D::Buffer>,
	pub block_sums_target: Option<D::Buffer>,
	pub emit_block_sums: bool,
	/// Whether `source` holds raw source elements that go through the operator's load.
	/// Block-sum levels read operator elements directly.
	pub load_source: bool,
	/// Exclusive scan seeded with `initial_value`. Only valid when the input fits one workgroup.
	pub exclusive_small: bool,
	pub initial_value: f64,
	pub overrides: Overrides,
	pub label: Option<String>,
}

impl<D: ComputeDevice> Clone for WorkgroupScanParams<D> {
	fn clone(&self) -> Self {
		Self {
			source: self.source.clone(),
			operator: self.operator.clone(),
			element_count: self.element_count,
			source_offset: self.source_offset,
			scan_offset: self.scan_offset,
			block_sums_offset: self.block_sums_offset,
			scan_target: self.scan_target.clone(),
			block_sums_target: self.block_sums_target.clone(),
			emit_block_sums: self.emit_block_sums,
			load_source: self.load_source,
			exclusive_small: self.exclusive_small,
			initial_value: self.initial_value,
			overrides: self.overrides,
			label: self.label.clone(),
		}
	}
}

impl<D: ComputeDevice> WorkgroupScanParams<D> {
	pub fn new(source: D::Buffer, operator: Arc<Operator>) -> Self {
		Self {
			source,
			operator,
			element_count: None,
			source_offset: 0,
			scan_offset: 0,
			block_sums_offset: 0,
			scan_target: None,
			block_sums_target: None,
			emit_block_sums: true,
			load_source: true,
			exclusive_small: false,
			initial_value: 0.0,
			overrides: Overrides::default(),
			label: None,
		}
	}
}

/// Everything the built pass depends on.
#[derive(Debug, Clone, PartialEq)]
struct ScanKey {
	source: BufferId,
	operator: Arc<Operator>,
	element_count: u32,
	offsets: [u32; 3],
	scan_target: Option<BufferId>,
	block_sums_target: Option<BufferId>,
	emit_block_sums: bool,
	load_source: bool,
	exclusive_small: bool,
	initial_value: u32,
	sizes: ResolvedSizes,
}

struct BuiltScan<D: ComputeDevice> {
	// holds every buffer below that was allocated rather than supplied
	_owned: OwnedBuffers<D>,
	pipeline: D::Pipeline,
	params: D::Buffer,
	scan: D::Buffer,
	block_sums: Option<D::Buffer>,
	plan: DispatchPlan,
}

pub struct WorkgroupScan<D: ComputeDevice> {
	ctx: GpuContext<D>,
	params: WorkgroupScanParams<D>,
	built: Memo<ScanKey, BuiltScan<D>>,
}

impl<D: ComputeDevice> WorkgroupScan<D> {
	pub fn new(ctx: &GpuContext<D>, params: WorkgroupScanParams<D>) -> Result<Self, ComputeError> {
		let scan = Self { ctx: ctx.clone(), params, built: Memo::new() };
		scan.key()?;
		Ok(scan)
	}

	pub fn params(&self) -> &WorkgroupScanParams<D> {
		&self.params
	}

	pub fn label(&self) -> &str {
		self.params.label.as_deref().unwrap_or("workgroup_scan")
	}

	pub fn sizes(&self) -> ResolvedSizes {
		self.params.overrides.resolve(&self.ctx.limits(), self.params.operator.elem_size())
	}

	pub fn workgroup_length(&self) -> u32 {
		self.sizes().workgroup_length
	}

	fn source_elem_size(&self) -> u64 {
		if self.params.load_source {
			self.params.operator.input_elem_size()
		} else {
			self.params.operator.elem_size()
		}
	}

	pub fn element_count(&self) -> Result<u32, ComputeError> {
		let available = self
			.params
			.source
			.elements(self.source_elem_size())
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

	/// Number of workgroup blocks, and so of block sums.
	pub fn block_count(&self) -> Result<u32, ComputeError> {
		Ok(self.element_count()?.div_ceil(self.workgroup_length()))
	}

	/// Validate the configuration and derive the key the built pass is memoized under.
	fn key(&self) -> Result<ScanKey, ComputeError> {
		let params = &self.params;
		params.operator.validate()?;
		let sizes = self.sizes();
		let element_count = self.element_count()?;
		let elem_size = params.operator.elem_size();

		if params.exclusive_small && element_count > sizes.workgroup_length {
			return Err(ComputeError::config(
				"exclusive_small",
				format!(
					"{} elements do not fit one workgroup of {}",
					element_count, sizes.workgroup_length
				),
			));
		}
		if let Some(target) = &params.scan_target {
			let needed = params.scan_offset as u64 + element_count as u64;
			if target.elements(elem_size) < needed {
				return Err(ComputeError::config(
					"scan_target",
					format!("`{}` holds fewer than {} elements", target.label(), needed),
				));
			}
		}
		if let (true, Some(target)) = (params.emit_block_sums, &params.block_sums_target) {
			let needed =
				params.block_sums_offset as u64 + element_count.div_ceil(sizes.workgroup_length) as u64;
			if target.elements(elem_size) < needed {
				return Err(ComputeError::config(
					"block_sums_target",
					format!("`{}` holds fewer than {} elements", target.label(), needed),
				));
			}
		}

		Ok(ScanKey {
			source: params.source.id(),
			operator: params.operator.clone(),
			element_count,
			offsets: [params.source_offset, params.scan_offset, params.block_sums_offset],
			scan_target: params.scan_target.as_ref().map(|b| b.id()),
			block_sums_target: params.block_sums_target.as_ref().map(|b| b.id()),
			emit_block_sums: params.emit_block_sums,
			load_source: params.load_source,
			exclusive_small: params.exclusive_small,
			initial_value: params.operator.format.encode(params.initial_value),
			sizes,
		})
	}

	fn built(&mut self) -> Result<&mut BuiltScan<D>, ComputeError> {
		let key = self.key()?;
		let ctx = &self.ctx;
		let params = &self.params;
		let label = params.label.as_deref().unwrap_or("workgroup_scan");
		self.built.get_or_try_init(key.clone(), || build(ctx, params, label, &key))
	}

	/// The per-element scan. Valid to read once this pass has executed.
	pub fn result(&mut self) -> Result<D::Buffer, ComputeError> {
		Ok(self.built()?.scan.clone())
	}

	pub fn block_sums(&mut self) -> Result<Option<D::Buffer>, ComputeError> {
		Ok(self.built()?.block_sums.clone())
	}

	/// Submit this pass alone and read the scan back, decoded.
	pub fn run(&mut self) -> Result<Vec<f64>, ComputeError> {
		let device = self.ctx.device().clone();
		let mut stream = device.create_stream(self.label());
		self.record_commands(&mut stream)?;
		device.submit(stream)?;

		let scan = self.result()?;
		let count = self.element_count()? as u64;
		self.ctx.read_values(&scan, &self.params.operator, self.params.scan_offset as u64, count)
	}

	/// Release every buffer this instance allocated. The next access rebuilds.
	pub fn destroy(&mut self) {
		self.built.invalidate();
	}

	// ---------- configuration --------------------------------------------------

	pub fn set_source(&mut self, source: D::Buffer) {
		self.params.source = source;
	}

	pub fn set_operator(&mut self, operator: Arc<Operator>) {
		self.params.operator = operator;
	}

	pub fn set_element_count(&mut self, element_count: Option<u32>) {
		self.params.element_count = element_count;
	}

	pub fn set_exclusive_small(&mut self, exclusive: bool, initial_value: f64) {
		self.params.exclusive_small = exclusive;
		self.params.initial_value = initial_value;
	}

	pub fn set_overrides(&mut self, overrides: Overrides) {
		self.params.overrides = overrides;
	}

	/// How many times the pass has been (re)built.
	pub fn generation(&self) -> u64 {
		self.built.generation()
	}
}

fn build<D: ComputeDevice>(
	ctx: &GpuContext<D>,
	params: &WorkgroupScanParams<D>,
	label: &str,
	key: &ScanKey,
) -> Result<BuiltScan<D>, ComputeError> {
	let op = &params.operator;
	let wl = key.sizes.workgroup_length;
	let n = key.element_count;
	let blocks = n.div_ceil(wl);
	let mut owned = OwnedBuffers::new(ctx.device().clone());

	let plan = DispatchPlan::new(n, wl, key.sizes.max_dispatches, PASS_PARAMS_SIZE, key.sizes.param_alignment);
	log::debug!(
		"{}: {} elements in {} blocks of {}, {} dispatch slice(s)",
		label,
		n,
		blocks,
		wl,
		plan.slices.len()
	);

	let scan = match &params.scan_target {
		Some(target) => target.clone(),
		None => owned.allocate(
			&format!("{}_scan", label),
			(params.scan_offset as u64 + n as u64) * op.elem_size(),
			BufferRole::Storage,
		)?,
	};
	let block_sums = match (params.emit_block_sums, &params.block_sums_target) {
		(false, _) => None,
		(true, Some(target)) => Some(target.clone()),
		(true, None) => Some(owned.allocate(
			&format!("{}_block_sums", label),
			(params.block_sums_offset as u64 + blocks as u64) * op.elem_size(),
			BufferRole::Storage,
		)?),
	};

	let image = plan_params_image(&plan, |slice| PassParams {
		source_offset: params.source_offset,
		destination_offset: params.scan_offset,
		block_sums_offset: params.block_sums_offset,
		element_count: n,
		workgroup_offset: slice.dispatch_offset,
		exclusive: key.exclusive_small as u32,
		initial_value: key.initial_value,
		padding: 0,
	});
	let params_buffer = owned.allocate_params(&format!("{}_params", label), &image)?;

	let pipeline = ctx.pipeline(&KernelSpec {
		kind: KernelKind::WorkgroupScan {
			emit_block_sums: params.emit_block_sums,
			load_source: params.load_source,
		},
		operator: op.clone(),
		workgroup_length: wl,
		block_length: 1,
	})?;

	Ok(BuiltScan { _owned: owned, pipeline, params: params_buffer, scan, block_sums, plan })
}

impl<D: ComputeDevice> RecordCommands<D> for WorkgroupScan<D> {
	fn record_commands(&mut self, stream: &mut D::Stream) -> Result<(), ComputeError> {
		let source = self.params.source.clone();
		let label = self.label().to_string();
		let device = self.ctx.device().clone();
		let built = self.built()?;

		let mut buffers = vec![
			(&built.params, BindingAccess::Params),
			(&source, BindingAccess::Read),
			(&built.scan, BindingAccess::ReadWrite),
		];
		if let Some(block_sums) = &built.block_sums {
			buffers.push((block_sums, BindingAccess::ReadWrite));
		}
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

	fn sum() -> Arc<Operator> {
		Arc::new(Operator::sum(ScalarFormat::U32))
	}

	#[test]
	fn test_single_block_inclusive() -> anyhow::Result<()> {
		let ctx = context();
		let source = ctx.upload("source", &[0u32, 1, 2, 3, 4, 5, 6, 7])?;
		let mut params = WorkgroupScanParams::new(source, sum());
		params.overrides = Overrides::workgroup_length(8);
		let mut scan = WorkgroupScan::new(&ctx, params)?;

		assert_eq!(scan.run()?, vec![0.0, 1.0, 3.0, 6.0, 10.0, 15.0, 21.0, 28.0]);
		let block_sums = scan.block_sums()?.expect("emitting block sums");
		assert_eq!(ctx.read_bits(&block_sums, 0, 1)?, vec![28]);
		Ok(())
	}

	#[test]
	fn test_small_exclusive_uses_initial_value() -> anyhow::Result<()> {
		let ctx = context();
		let source = ctx.upload("source", &[1u32, 2, 3, 4, 5, 6, 7, 8])?;
		let mut params = WorkgroupScanParams::new(source, sum());
		params.exclusive_small = true;
		params.initial_value = 9.0;
		params.emit_block_sums = false;
		let mut scan = WorkgroupScan::new(&ctx, params)?;

		assert_eq!(scan.run()?, vec![9.0, 10.0, 12.0, 15.0, 19.0, 24.0, 30.0, 37.0]);
		Ok(())
	}

	#[test]
	fn test_blocks_scan_independently() -> anyhow::Result<()> {
		let ctx = context();
		let source = ctx.upload("source", &[0u32, 1, 2, 3, 4, 5, 6])?;
		let mut params = WorkgroupScanParams::new(source, sum());
		params.overrides = Overrides::workgroup_length(4);
		let mut scan = WorkgroupScan::new(&ctx, params)?;

		assert_eq!(scan.block_count()?, 2);
		assert_eq!(scan.run()?, vec![0.0, 1.0, 3.0, 6.0, 4.0, 9.0, 15.0]);
		let block_sums = scan.block_sums()?.expect("emitting block sums");
		assert_eq!(ctx.read_bits(&block_sums, 0, 2)?, vec![6, 15]);
		Ok(())
	}

	#[test]
	fn test_block_sums_index_across_slices() -> anyhow::Result<()> {
		let ctx = context();
		let data: Vec<u32> = (0..40).collect();
		let source = ctx.upload("source", &data)?;
		let mut params = WorkgroupScanParams::new(source, sum());
		// 10 blocks over slices of 3, 3, 3, 1 dispatches
		params.overrides = Overrides::workgroup_length(4).with_max_dispatches(3);
		let mut scan = WorkgroupScan::new(&ctx, params)?;
		scan.run()?;

		let block_sums = scan.block_sums()?.expect("emitting block sums");
		let expected: Vec<u32> = data.chunks(4).map(|c| c.iter().sum()).collect();
		assert_eq!(ctx.read_bits(&block_sums, 0, 10)?, expected);
		Ok(())
	}

	#[test]
	fn test_offsets_share_one_buffer() -> anyhow::Result<()> {
		let ctx = context();
		let source = ctx.upload("source", &[100u32, 100, 1, 2, 3, 4, 5])?;
		let target = ctx.create_storage("target", 8 * 4)?;
		let sums = ctx.create_storage("sums", 4 * 4)?;

		let mut params = WorkgroupScanParams::new(source, sum());
		params.source_offset = 2;
		params.scan_offset = 3;
		params.block_sums_offset = 1;
		params.scan_target = Some(target.clone());
		params.block_sums_target = Some(sums.clone());
		params.overrides = Overrides::workgroup_length(4);
		let mut scan = WorkgroupScan::new(&ctx, params)?;

		assert_eq!(scan.element_count()?, 5);
		assert_eq!(scan.run()?, vec![1.0, 3.0, 6.0, 10.0, 5.0]);
		assert_eq!(ctx.read_bits(&target, 0, 8)?, vec![0, 0, 0, 1, 3, 6, 10, 5]);
		assert_eq!(ctx.read_bits(&sums, 0, 4)?, vec![0, 10, 5, 0]);

		// supplied buffers are not released with the instance
		scan.destroy();
		assert_eq!(ctx.read_bits(&target, 3, 1)?, vec![1]);
		Ok(())
	}

	#[test]
	fn test_configuration_errors() -> anyhow::Result<()> {
		let ctx = context();
		let source = ctx.upload("source", &[1u32; 16])?;

		let mut params = WorkgroupScanParams::new(source.clone(), sum());
		params.element_count = Some(17);
		assert!(WorkgroupScan::new(&ctx, params).err().map(|e| e.is_config()).unwrap_or(false));

		let mut params = WorkgroupScanParams::new(source.clone(), sum());
		params.exclusive_small = true;
		params.overrides = Overrides::workgroup_length(8);
		assert!(WorkgroupScan::new(&ctx, params).is_err());

		let mut params = WorkgroupScanParams::new(source.clone(), sum());
		params.scan_target = Some(ctx.create_storage("small", 8)?);
		assert!(WorkgroupScan::new(&ctx, params).is_err());

		let mut bad = Operator::sum(ScalarFormat::U32);
		bad.identity.clear();
		let params = WorkgroupScanParams::new(source, Arc::new(bad));
		assert!(WorkgroupScan::new(&ctx, params).is_err());
		Ok(())
	}

	#[test]
	fn test_oversized_workgroup_is_clamped() -> anyhow::Result<()> {
		let ctx = context();
		let source = ctx.upload("source", &[1u32; 600])?;
		let mut params = WorkgroupScanParams::new(source, sum());
		params.overrides = Overrides::workgroup_length(1 << 16);
		let mut scan = WorkgroupScan::new(&ctx, params)?;

		assert_eq!(scan.workgroup_length(), 256);
		assert_eq!(scan.block_count()?, 3);
		let result = scan.run()?;
		assert_eq!(result[255], 256.0);
		assert_eq!(result[256], 1.0);
		Ok(())
	}

	#[test]
	fn test_setters_rebuild() -> anyhow::Result<()> {
		let ctx = context();
		let source = ctx.upload("source", &[1u32, 2, 3, 4])?;
		let mut scan = WorkgroupScan::new(&ctx, WorkgroupScanParams::new(source, sum()))?;
		scan.run()?;
		scan.run()?;
		assert_eq!(scan.generation(), 1);

		scan.set_operator(Arc::new(Operator::max(ScalarFormat::U32)));
		assert_eq!(scan.run()?, vec![1.0, 2.0, 3.0, 4.0]);
		assert_eq!(scan.generation(), 2);

		let other = ctx.upload("other", &[5u32, 5])?;
		scan.set_source(other);
		assert_eq!(scan.run()?, vec![5.0, 5.0]);
		assert_eq!(scan.generation(), 3);
		Ok(())
	}

	#[test]
	fn test_empty_source_records_nothing() -> anyhow::Result<()> {
		let ctx = context();
		let source = ctx.upload::<u32>("source", &[])?;
		let mut params = WorkgroupScanParams::new(source, sum());
		params.element_count = Some(0);
		let mut scan = WorkgroupScan::new(&ctx, params)?;

		let mut stream = ctx.device().create_stream("empty");
		scan.record_commands(&mut stream)?;
		assert!(stream.is_empty());
		assert_eq!(scan.run()?, Vec::<f64>::new());
		Ok(())
	}
}
