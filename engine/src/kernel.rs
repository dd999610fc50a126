// =================================================================================================
// KERNEL LINKING
// =================================================================================================
// The orchestrators ask for pipelines by description only; the linker behind a device decides
// how a description becomes something executable.

use crate::device::{BindingAccess, ComputeDevice};
use crate::error::DeviceError;
use crate::operator::Operator;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KernelKind {
	/// Block-local inclusive scan, optionally writing each block's total.
	WorkgroupScan { emit_block_sums: bool, load_source: bool },
	/// Adds resolved block prefixes into a per-block partial scan.
	ApplyBlockSums,
	/// Tree reduction of `workgroup_length * block_length` elements per workgroup.
	Reduce { load_source: bool },
}

impl KernelKind {
	/// Binding layout in binding-slot order.
	pub fn bindings(&self) -> Vec<BindingAccess> {
		use BindingAccess::*;
		match self {
			Self::WorkgroupScan { emit_block_sums: true, .. } => {
				vec![Params, Read, ReadWrite, ReadWrite]
			}
			Self::WorkgroupScan { emit_block_sums: false, .. } | Self::Reduce { .. } => {
				vec![Params, Read, ReadWrite]
			}
			Self::ApplyBlockSums => vec![Params, Read, Read, ReadWrite],
		}
	}

	pub fn name(&self) -> &'static str {
		match self {
			Self::WorkgroupScan { .. } => "workgroup_scan",
			Self::ApplyBlockSums => "apply_block_sums",
			Self::Reduce { .. } => "reduce",
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KernelSpec {
	pub kind: KernelKind,
	pub operator: Arc<Operator>,
	pub workgroup_length: u32,
	/// Elements per thread; 1 for scan kernels.
	pub block_length: u32,
}

impl KernelSpec {
	pub fn label(&self) -> String {
		format!(
			"{}_{}_wg{}_bl{}",
			self.kind.name(),
			self.operator.label,
			self.workgroup_length,
			self.block_length
		)
	}
}

/// Turns a kernel description into a device pipeline.
pub trait KernelLinker<D: ComputeDevice>: Send + Sync {
	fn link(&self, device: &D, spec: &KernelSpec) -> Result<D::Pipeline, DeviceError>;
}

/// Memoizes linked pipelines by kernel description.
pub struct PipelineCache<D: ComputeDevice> {
	linker: Box<dyn KernelLinker<D>>,
	cache: RwLock<HashMap<KernelSpec, D::Pipeline>>,
}

impl<D: ComputeDevice> PipelineCache<D> {
	pub fn new(linker: impl KernelLinker<D> + 'static) -> Self {
		Self { linker: Box::new(linker), cache: RwLock::new(HashMap::new()) }
	}

	pub fn get(&self, device: &D, spec: &KernelSpec) -> Result<D::Pipeline, DeviceError> {
		{
			let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());
			if let Some(pipeline) = cache.get(spec) {
				return Ok(pipeline.clone());
			}
		}

		log::debug!("linking kernel {}", spec.label());
		let pipeline = self.linker.link(device, spec)?;

		let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
		Ok(cache.entry(spec.clone()).or_insert(pipeline).clone())
	}

	pub fn len(&self) -> usize {
		self.cache.read().unwrap_or_else(|e| e.into_inner()).len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}
