use compute_engine::{
	ComputeError, DeviceError, DeviceLimits, DispatchChain, GpuContext, HostDevice, HostLinker,
	Operator, Overrides, ScalarFormat,
};
use prefix_scan::{PrefixScan, PrefixScanParams};
use std::sync::Arc;

fn context() -> GpuContext<HostDevice> {
	GpuContext::new(HostDevice::default(), HostLinker::default())
}

fn sum() -> Arc<Operator> {
	Arc::new(Operator::sum(ScalarFormat::U32))
}

#[test]
fn test_independent_scans_share_one_submission() -> anyhow::Result<()> {
	let ctx = context();
	let a = ctx.upload("a", &(0..40u32).collect::<Vec<_>>())?;
	let b = ctx.upload("b", &[5u32; 9])?;

	let mut params = PrefixScanParams::new(a, sum());
	params.overrides = Overrides::workgroup_length(4);
	let mut first = PrefixScan::new(&ctx, params)?;
	let mut second = PrefixScan::new(&ctx, PrefixScanParams::new(b, sum()))?;

	let mut chain = DispatchChain::new("two_scans");
	chain.push(&mut first).push(&mut second);
	chain.submit(ctx.device())?;
	assert_eq!(ctx.device().submissions(), 1);

	let first_result = first.result()?;
	let second_result = second.result()?;
	assert_eq!(ctx.read_bits(&first_result, 39, 1)?, vec![780]);
	assert_eq!(ctx.read_bits(&second_result, 0, 9)?, (1..=9).map(|i| i * 5).collect::<Vec<u32>>());
	Ok(())
}

#[test]
fn test_scan_of_a_scan_in_recording_order() -> anyhow::Result<()> {
	let ctx = context();
	let source = ctx.upload("ones", &[1u32; 20])?;

	let mut params = PrefixScanParams::new(source, sum());
	params.overrides = Overrides::workgroup_length(4);
	let mut counts = PrefixScan::new(&ctx, params)?;

	let mut params = PrefixScanParams::new(counts.result()?, sum());
	params.overrides = Overrides::workgroup_length(4);
	let mut triangular = PrefixScan::new(&ctx, params)?;

	let mut chain = DispatchChain::new("scan_of_scan");
	chain.push(&mut counts).push(&mut triangular);
	chain.submit(ctx.device())?;

	let result = ctx.read_bits(&triangular.result()?, 0, 20)?;
	let expected: Vec<u32> = (1..=20).map(|n| n * (n + 1) / 2).collect();
	assert_eq!(result, expected);
	Ok(())
}

#[test]
fn test_signed_exclusive_scan() -> anyhow::Result<()> {
	let ctx = context();
	let data: Vec<i32> = (0..30).map(|i| if i % 2 == 0 { -i } else { i * 2 }).collect();
	let source = ctx.upload("signed", &data)?;
	let mut params = PrefixScanParams::new(source, Arc::new(Operator::sum(ScalarFormat::I32)));
	params.exclusive = true;
	params.initial_value = -100.0;
	params.overrides = Overrides::workgroup_length(4);
	let mut scan = PrefixScan::new(&ctx, params)?;

	let mut acc = -100i32;
	let mut expected = Vec::new();
	for x in &data {
		expected.push(acc as f64);
		acc += x;
	}
	assert_eq!(scan.run()?, expected);
	Ok(())
}

#[test]
fn test_lost_device_propagates() -> anyhow::Result<()> {
	let ctx = context();
	let source = ctx.upload("source", &[1u32; 64])?;
	let mut params = PrefixScanParams::new(source, sum());
	params.overrides = Overrides::workgroup_length(4);
	let mut scan = PrefixScan::new(&ctx, params)?;
	scan.result()?;

	ctx.device().lose();
	match scan.run() {
		Err(ComputeError::Device(DeviceError::Lost(_))) => Ok(()),
		Err(other) => Err(anyhow::anyhow!("unexpected error: {}", other)),
		Ok(_) => Err(anyhow::anyhow!("run succeeded on a lost device")),
	}
}

#[test]
fn test_out_of_memory_propagates() -> anyhow::Result<()> {
	let device = HostDevice::with_budget(DeviceLimits::default(), Some(4096));
	let ctx = GpuContext::new(device, HostLinker::default());
	let source = ctx.upload("source", &[1u32; 512])?;
	let mut params = PrefixScanParams::new(source, sum());
	params.overrides = Overrides::workgroup_length(4);
	let mut scan = PrefixScan::new(&ctx, params)?;

	let err = scan.run().err().ok_or_else(|| anyhow::anyhow!("expected allocation failure"))?;
	assert!(matches!(err, ComputeError::Device(DeviceError::OutOfMemory { .. })));
	Ok(())
}

#[test]
fn test_link_failure_propagates() -> anyhow::Result<()> {
	let ctx = GpuContext::new(HostDevice::default(), HostLinker::failing("no compiler"));
	let source = ctx.upload("source", &[1u32; 8])?;
	let mut scan = PrefixScan::new(&ctx, PrefixScanParams::new(source, sum()))?;

	let err = scan.run().err().ok_or_else(|| anyhow::anyhow!("expected link failure"))?;
	assert!(matches!(err, ComputeError::Device(DeviceError::Link { .. })));
	assert_eq!(ctx.device().submissions(), 0);
	Ok(())
}
