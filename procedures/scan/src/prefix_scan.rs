// =================================================================================================
// PREFIX SCAN
// =================================================================================================
// Scans of any length as a chain of workgroup-scan levels followed by apply passes.
//
//   level 0: source          -> scan_0, block_sums_0
//   level 1: block_sums_0    -> scan_1, block_sums_1
//   ...
//   level k: block_sums_k-1  -> scan_k               (fits one workgroup, already global)
//
// Apply passes then run deepest first: scan_k resolves scan_k-1, whose result resolves
// scan_k-2, and so on up to level 0. Only the final apply over level 0 is exclusive.

use crate::apply_block_sums::{ApplyBlockSums, ApplyBlockSumsParams};
use crate::workgroup_scan::{WorkgroupScan, WorkgroupScanParams};
use compute_engine::{
	BufferId, ComputeDevice, ComputeError, DeviceBuffer, GpuContext, Memo, Operator, Overrides,
	RecordCommands, ResolvedSizes,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Element count of each scan level, starting with the source.
///
/// A single entry means the source fits one workgroup and no block sums are needed.
pub fn scan_level_counts(element_count: u32, workgroup_length: u32) -> Vec<u32> {
	let workgroup_length = workgroup_length.max(2);
	let mut counts = vec![element_count];
	let mut count = element_count;
	while count > workgroup_length {
		count = count.div_ceil(workgroup_length);
		counts.push(count);
	}
	counts
}

/// Shape of the pass tree for a given size and device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanShape {
	pub workgroup_length: u32,
	pub level_counts: Vec<u32>,
}

impl ScanShape {
	/// Also the number of workgroup scan passes.
	pub fn levels(&self) -> usize {
		self.level_counts.len()
	}

	pub fn apply_passes(&self) -> usize {
		self.level_counts.len() - 1
	}
}

pub struct PrefixScanParams<D: ComputeDevice> {
	pub source: D::Buffer,
	pub operator: Arc<Operator>,
	pub exclusive: bool,
	/// Seed of an exclusive scan; ignored for inclusive scans.
	pub initial_value: f64,
	pub source_offset: u32,
	/// Defaults to everything in `source` past `source_offset`.
	pub element_count: Option<u32>,
	pub overrides: Overrides,
	pub label: Option<String>,
}

impl<D: ComputeDevice> PrefixScanParams<D> {
	pub fn new(source: D::Buffer, operator: Arc<Operator>) -> Self {
		Self {
			source,
			operator,
			exclusive: false,
			initial_value: 0.0,
			source_offset: 0,
			element_count: None,
			overrides: Overrides::default(),
			label: None,
		}
	}
}

#[derive(Debug, Clone, PartialEq)]
struct PrefixKey {
	source: BufferId,
	operator: Arc<Operator>,
	element_count: u32,
	source_offset: u32,
	exclusive: bool,
	initial_value: u32,
	sizes: ResolvedSizes,
}

/// Levels built top-down, applies built bottom-up; recorded in that order.
struct ScanLevels<D: ComputeDevice> {
	scans: Vec<WorkgroupScan<D>>,
	applies: Vec<ApplyBlockSums<D>>,
	result: D::Buffer,
}

pub struct PrefixScan<D: ComputeDevice> {
	ctx: GpuContext<D>,
	params: PrefixScanParams<D>,
	built: Memo<PrefixKey, ScanLevels<D>>,
}

impl<D: ComputeDevice> PrefixScan<D> {
	pub fn new(ctx: &GpuContext<D>, params: PrefixScanParams<D>) -> Result<Self, ComputeError> {
		let scan = Self { ctx: ctx.clone(), params, built: Memo::new() };
		scan.key()?;
		Ok(scan)
	}

	pub fn label(&self) -> &str {
		self.params.label.as_deref().unwrap_or("prefix_scan")
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

	pub fn shape(&self) -> Result<ScanShape, ComputeError> {
		let workgroup_length = self.sizes().workgroup_length;
		Ok(ScanShape {
			workgroup_length,
			level_counts: scan_level_counts(self.element_count()?, workgroup_length),
		})
	}

	fn key(&self) -> Result<PrefixKey, ComputeError> {
		let params = &self.params;
		params.operator.validate()?;
		Ok(PrefixKey {
			source: params.source.id(),
			operator: params.operator.clone(),
			element_count: self.element_count()?,
			source_offset: params.source_offset,
			exclusive: params.exclusive,
			initial_value: params.operator.format.encode(params.initial_value),
			sizes: self.sizes(),
		})
	}

	fn built(&mut self) -> Result<&mut ScanLevels<D>, ComputeError> {
		let key = self.key()?;
		let shape = self.shape()?;
		let ctx = &self.ctx;
		let params = &self.params;
		let label = params.label.as_deref().unwrap_or("prefix_scan");
		self.built.get_or_try_init(key, || build(ctx, params, label, &shape))
	}

	/// The full scan, one value per source element. Valid once the chain has executed.
	pub fn result(&mut self) -> Result<D::Buffer, ComputeError> {
		Ok(self.built()?.result.clone())
	}

	pub fn run(&mut self) -> Result<Vec<f64>, ComputeError> {
		let device = self.ctx.device().clone();
		let mut stream = device.create_stream(self.label());
		self.record_commands(&mut stream)?;
		device.submit(stream)?;

		let result = self.result()?;
		let count = self.element_count()? as u64;
		self.ctx.read_values(&result, &self.params.operator, 0, count)
	}

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

	pub fn set_exclusive(&mut self, exclusive: bool) {
		self.params.exclusive = exclusive;
	}

	pub fn set_initial_value(&mut self, initial_value: f64) {
		self.params.initial_value = initial_value;
	}

	pub fn set_element_count(&mut self, element_count: Option<u32>) {
		self.params.element_count = element_count;
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
	params: &PrefixScanParams<D>,
	label: &str,
	shape: &ScanShape,
) -> Result<ScanLevels<D>, ComputeError> {
	let counts = &shape.level_counts;
	let last = counts.len() - 1;
	log::debug!("{}: level counts {:?} at workgroup length {}", label, counts, shape.workgroup_length);

	// ---------- base case: one workgroup -------------------------------------
	if last == 0 {
		let mut level = WorkgroupScanParams::new(params.source.clone(), params.operator.clone());
		level.element_count = Some(counts[0]);
		level.source_offset = params.source_offset;
		level.emit_block_sums = false;
		level.exclusive_small = params.exclusive;
		level.initial_value = params.initial_value;
		level.overrides = params.overrides;
		level.label = Some(format!("{}_level0", label));
		let mut scan = WorkgroupScan::new(ctx, level)?;
		let result = scan.result()?;
		return Ok(ScanLevels { scans: vec![scan], applies: Vec::new(), result });
	}

	// ---------- levels, top-down ---------------------------------------------
	let mut scans: Vec<WorkgroupScan<D>> = Vec::with_capacity(counts.len());
	for (index, &count) in counts.iter().enumerate() {
		let source = match scans.last_mut() {
			Some(previous) => previous
				.block_sums()?
				.ok_or_else(|| ComputeError::config("levels", "inner level emitted no block sums"))?,
			None => params.source.clone(),
		};
		let mut level = WorkgroupScanParams::new(source, params.operator.clone());
		level.element_count = Some(count);
		level.source_offset = if index == 0 { params.source_offset } else { 0 };
		level.load_source = index == 0;
		level.emit_block_sums = index < last;
		level.overrides = params.overrides;
		level.label = Some(format!("{}_level{}", label, index));
		let mut scan = WorkgroupScan::new(ctx, level)?;
		scan.result()?;
		scans.push(scan);
	}

	// ---------- applies, bottom-up -------------------------------------------
	let mut resolved = scans[last].result()?;
	let mut applies = Vec::with_capacity(last);
	for index in (0..last).rev() {
		let partial = scans[index].result()?;
		let mut apply = ApplyBlockSumsParams::new(partial, resolved, params.operator.clone(), counts[index]);
		apply.exclusive = index == 0 && params.exclusive;
		apply.initial_value = params.initial_value;
		apply.overrides = params.overrides;
		apply.label = Some(format!("{}_apply{}", label, index));
		let mut apply = ApplyBlockSums::new(ctx, apply)?;
		resolved = apply.result()?;
		applies.push(apply);
	}

	Ok(ScanLevels { scans, applies, result: resolved })
}

impl<D: ComputeDevice> RecordCommands<D> for PrefixScan<D> {
	fn record_commands(&mut self, stream: &mut D::Stream) -> Result<(), ComputeError> {
		let levels = self.built()?;
		for scan in levels.scans.iter_mut() {
			scan.record_commands(stream)?;
		}
		for apply in levels.applies.iter_mut() {
			apply.record_commands(stream)?;
		}
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

	fn reference(data: &[u32]) -> Vec<f64> {
		data.iter()
			.scan(0u32, |acc, &x| {
				*acc += x;
				Some(*acc as f64)
			})
			.collect()
	}

	fn scan_with(ctx: &GpuContext<HostDevice>, data: &[u32], workgroup_length: u32) -> anyhow::Result<Vec<f64>> {
		let source = ctx.upload("source", data)?;
		let mut params = PrefixScanParams::new(source, sum());
		params.overrides = Overrides::workgroup_length(workgroup_length);
		Ok(PrefixScan::new(ctx, params)?.run()?)
	}

	#[test]
	fn test_level_counts() {
		assert_eq!(scan_level_counts(0, 4), vec![0]);
		assert_eq!(scan_level_counts(4, 4), vec![4]);
		assert_eq!(scan_level_counts(5, 4), vec![5, 2]);
		assert_eq!(scan_level_counts(32, 4), vec![32, 8, 2]);
		assert_eq!(scan_level_counts(128, 4), vec![128, 32, 8, 2]);
		assert_eq!(scan_level_counts(1 << 20, 256), vec![1 << 20, 4096, 16]);
		// chain length is the smallest k with wl^k >= n
		for n in 1..300u32 {
			let levels = scan_level_counts(n, 3).len() as u32;
			assert!(3u64.pow(levels) >= n as u64);
			assert!(levels == 1 || 3u64.pow(levels - 1) < n as u64);
		}
	}

	#[test]
	fn test_small_inclusive() -> anyhow::Result<()> {
		let ctx = context();
		let result = scan_with(&ctx, &[0, 1, 2, 3, 4, 5, 6, 7], 8)?;
		assert_eq!(result, vec![0.0, 1.0, 3.0, 6.0, 10.0, 15.0, 21.0, 28.0]);
		Ok(())
	}

	#[test]
	fn test_small_exclusive() -> anyhow::Result<()> {
		let ctx = context();
		let source = ctx.upload("source", &[1u32, 2, 3, 4, 5, 6, 7, 8])?;
		let mut params = PrefixScanParams::new(source, sum());
		params.exclusive = true;
		params.initial_value = 9.0;
		let mut scan = PrefixScan::new(&ctx, params)?;
		assert_eq!(scan.run()?, vec![9.0, 10.0, 12.0, 15.0, 19.0, 24.0, 30.0, 37.0]);
		Ok(())
	}

	#[test]
	fn test_one_level_of_block_sums() -> anyhow::Result<()> {
		let ctx = context();
		assert_eq!(
			scan_with(&ctx, &[0, 1, 2, 3, 4, 5, 6], 4)?,
			vec![0.0, 1.0, 3.0, 6.0, 10.0, 15.0, 21.0]
		);
		Ok(())
	}

	#[test]
	fn test_multi_level() -> anyhow::Result<()> {
		let ctx = context();
		for (n, levels) in [(32u32, 3usize), (128, 4)] {
			let data: Vec<u32> = (0..n).map(|i| i % 7 + 1).collect();
			let source = ctx.upload("source", &data)?;
			let mut params = PrefixScanParams::new(source, sum());
			params.overrides = Overrides::workgroup_length(4);
			let mut scan = PrefixScan::new(&ctx, params)?;

			assert_eq!(scan.shape()?.levels(), levels);
			assert_eq!(scan.run()?, reference(&data), "n = {}", n);
		}
		Ok(())
	}

	#[test]
	fn test_ragged_lengths() -> anyhow::Result<()> {
		let ctx = context();
		for n in [1u32, 3, 4, 5, 15, 16, 17, 63, 64, 65, 100] {
			let data: Vec<u32> = (0..n).map(|i| (i * 31) % 11).collect();
			assert_eq!(scan_with(&ctx, &data, 4)?, reference(&data), "n = {}", n);
		}
		Ok(())
	}

	#[test]
	fn test_exact_workgroup_is_base_case() -> anyhow::Result<()> {
		let ctx = context();
		let source = ctx.upload("source", &[1u32; 4])?;
		let mut params = PrefixScanParams::new(source, sum());
		params.overrides = Overrides::workgroup_length(4);
		let mut scan = PrefixScan::new(&ctx, params)?;

		let shape = scan.shape()?;
		assert_eq!((shape.levels(), shape.apply_passes()), (1, 0));
		let mut stream = ctx.device().create_stream("base");
		scan.record_commands(&mut stream)?;
		assert_eq!(stream.passes(), 1);
		Ok(())
	}

	#[test]
	fn test_large_exclusive_matches_small_path() -> anyhow::Result<()> {
		let ctx = context();
		let data: Vec<u32> = (0..8).collect();
		let run = |wl: u32| -> anyhow::Result<Vec<f64>> {
			let source = ctx.upload("source", &data)?;
			let mut params = PrefixScanParams::new(source, sum());
			params.exclusive = true;
			params.initial_value = 9.0;
			params.overrides = Overrides::workgroup_length(wl);
			Ok(PrefixScan::new(&ctx, params)?.run()?)
		};

		let small = run(8)?;
		assert_eq!(small, vec![9.0, 9.0, 10.0, 12.0, 15.0, 19.0, 24.0, 30.0]);
		assert_eq!(run(4)?, small);
		assert_eq!(run(2)?, small);
		Ok(())
	}

	#[test]
	fn test_zero_elements() -> anyhow::Result<()> {
		let ctx = context();
		let source = ctx.upload::<u32>("source", &[])?;
		let mut params = PrefixScanParams::new(source, sum());
		params.element_count = Some(0);
		let mut scan = PrefixScan::new(&ctx, params)?;
		assert_eq!(scan.shape()?.level_counts, vec![0]);
		assert!(scan.run()?.is_empty());
		Ok(())
	}

	#[test]
	fn test_run_is_idempotent() -> anyhow::Result<()> {
		let ctx = context();
		let data: Vec<u32> = (0..50).collect();
		let source = ctx.upload("source", &data)?;
		let mut params = PrefixScanParams::new(source.clone(), sum());
		params.overrides = Overrides::workgroup_length(4);
		let mut scan = PrefixScan::new(&ctx, params)?;

		let first = scan.run()?;
		let second = scan.run()?;
		assert_eq!(first, second);
		assert_eq!(scan.generation(), 1);
		assert_eq!(ctx.read_bits(&source, 0, 50)?, data);
		Ok(())
	}

	#[test]
	fn test_sub_range_matches_standalone() -> anyhow::Result<()> {
		let ctx = context();
		let data: Vec<u32> = (0..40).map(|i| i * 3 % 5).collect();
		let source = ctx.upload("source", &data)?;
		let mut params = PrefixScanParams::new(source, sum());
		params.source_offset = 7;
		params.element_count = Some(21);
		params.overrides = Overrides::workgroup_length(4);
		let mut scan = PrefixScan::new(&ctx, params)?;

		assert_eq!(scan.run()?, scan_with(&ctx, &data[7..28], 4)?);
		Ok(())
	}

	#[test]
	fn test_many_dispatch_slices() -> anyhow::Result<()> {
		let ctx = context();
		let data: Vec<u32> = (0..200).map(|i| i % 3).collect();
		let source = ctx.upload("source", &data)?;
		let mut params = PrefixScanParams::new(source, sum());
		params.overrides = Overrides::workgroup_length(4).with_max_dispatches(2);
		let mut scan = PrefixScan::new(&ctx, params)?;
		assert_eq!(scan.run()?, reference(&data));
		Ok(())
	}

	#[test]
	fn test_min_max_scan() -> anyhow::Result<()> {
		let ctx = context();
		let data = [3.0f32, 1.0, 4.0, 1.5, 5.0, 9.0, 2.0, 6.0, 0.5];
		let source = ctx.upload("source", &data)?;
		let mut params = PrefixScanParams::new(source, Arc::new(Operator::min_max(ScalarFormat::F32)));
		params.overrides = Overrides::workgroup_length(2);
		let mut scan = PrefixScan::new(&ctx, params)?;

		let result = scan.run()?;
		assert_eq!(result.len(), data.len() * 2);
		assert_eq!(&result[..4], &[3.0, 3.0, 1.0, 3.0]);
		assert_eq!(&result[16..], &[0.5, 9.0]);
		Ok(())
	}

	#[test]
	fn test_destroy_releases_every_level() -> anyhow::Result<()> {
		let ctx = context();
		let data: Vec<u32> = (0..128).collect();
		let source = ctx.upload("source", &data)?;
		let baseline = ctx.device().live_buffers();

		let mut params = PrefixScanParams::new(source.clone(), sum());
		params.overrides = Overrides::workgroup_length(4);
		let mut scan = PrefixScan::new(&ctx, params)?;
		scan.run()?;
		assert!(ctx.device().live_buffers() > baseline);

		scan.destroy();
		assert_eq!(ctx.device().live_buffers(), baseline);

		// rebuilt on next access
		assert_eq!(scan.run()?, reference(&data));
		drop(scan);
		assert_eq!(ctx.device().live_buffers(), baseline);
		Ok(())
	}

	#[test]
	fn test_override_change_rebuilds_levels() -> anyhow::Result<()> {
		let ctx = context();
		let data: Vec<u32> = (0..64).collect();
		let source = ctx.upload("source", &data)?;
		let mut scan = PrefixScan::new(&ctx, PrefixScanParams::new(source, sum()))?;
		assert_eq!(scan.shape()?.levels(), 1);
		scan.run()?;

		scan.set_overrides(Overrides::workgroup_length(4));
		assert_eq!(scan.shape()?.levels(), 3);
		assert_eq!(scan.run()?, reference(&data));
		assert_eq!(scan.generation(), 2);
		Ok(())
	}

	#[test]
	fn test_pipelines_are_shared_across_levels() -> anyhow::Result<()> {
		let linker = HostLinker::default();
		let links = linker.links();
		let ctx = GpuContext::new(HostDevice::default(), linker);
		let data: Vec<u32> = (0..128).collect();
		let source = ctx.upload("source", &data)?;
		let mut params = PrefixScanParams::new(source, sum());
		params.overrides = Overrides::workgroup_length(4);
		PrefixScan::new(&ctx, params)?.run()?;

		// level 0, middle levels, terminal level, apply
		assert_eq!(links.get(), 4);
		Ok(())
	}
}
