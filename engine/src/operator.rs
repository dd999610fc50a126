// =================================================================================================
// OPERATOR DESCRIPTOR
// =================================================================================================
// Identity, combine, and load for a scan or reduction. Elements are fixed-width vectors of
// 32-bit lanes, stored on the host as raw lane bits so every format shares one code path.

use crate::error::ComputeError;
use serde::{Deserialize, Serialize};

/// Scalar type of every lane of an element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScalarFormat {
	U32,
	I32,
	F32,
}

impl ScalarFormat {
	/// Encode a host number into lane bits, saturating on conversion.
	pub fn encode(self, value: f64) -> u32 {
		match self {
			Self::U32 => value as u32,
			Self::I32 => (value as i32) as u32,
			Self::F32 => (value as f32).to_bits(),
		}
	}

	pub fn decode(self, bits: u32) -> f64 {
		match self {
			Self::U32 => bits as f64,
			Self::I32 => (bits as i32) as f64,
			Self::F32 => f32::from_bits(bits) as f64,
		}
	}

	fn add(self, a: u32, b: u32) -> u32 {
		match self {
			Self::U32 => a.wrapping_add(b),
			Self::I32 => (a as i32).wrapping_add(b as i32) as u32,
			Self::F32 => (f32::from_bits(a) + f32::from_bits(b)).to_bits(),
		}
	}

	fn min(self, a: u32, b: u32) -> u32 {
		match self {
			Self::U32 => a.min(b),
			Self::I32 => (a as i32).min(b as i32) as u32,
			Self::F32 => f32::from_bits(a).min(f32::from_bits(b)).to_bits(),
		}
	}

	fn max(self, a: u32, b: u32) -> u32 {
		match self {
			Self::U32 => a.max(b),
			Self::I32 => (a as i32).max(b as i32) as u32,
			Self::F32 => f32::from_bits(a).max(f32::from_bits(b)).to_bits(),
		}
	}

	/// Identity of `sum`. Floats use negative zero so a `-0.0` element keeps its sign.
	pub fn zero(self) -> u32 {
		match self {
			Self::U32 | Self::I32 => 0,
			Self::F32 => (-0.0f32).to_bits(),
		}
	}

	/// Identity of `min`: the largest representable value, `+inf` for floats.
	pub fn greatest(self) -> u32 {
		match self {
			Self::U32 => u32::MAX,
			Self::I32 => i32::MAX as u32,
			Self::F32 => f32::INFINITY.to_bits(),
		}
	}

	/// Identity of `max`: the smallest representable value, `-inf` for floats.
	pub fn least(self) -> u32 {
		match self {
			Self::U32 => 0,
			Self::I32 => i32::MIN as u32,
			Self::F32 => f32::NEG_INFINITY.to_bits(),
		}
	}
}

/// How two elements combine, lane by lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Combine {
	/// Lane-wise addition (sums, histogram merges).
	Add,
	Min,
	Max,
	/// Two lanes: lane 0 keeps the minimum, lane 1 the maximum.
	MinMax,
}

/// How a source element becomes an operator element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Load {
	/// The source element already has the operator's layout.
	Direct,
	/// A one-lane source element is copied into every lane.
	Splat,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Operator {
	pub label: String,
	pub format: ScalarFormat,
	pub lanes: u32,
	pub input_lanes: u32,
	pub combine: Combine,
	pub load: Load,
	/// Identity element as lane bits.
	pub identity: Vec<u32>,
}

impl Operator {
	pub fn sum(format: ScalarFormat) -> Self {
		Self {
			label: "sum".to_string(),
			format,
			lanes: 1,
			input_lanes: 1,
			combine: Combine::Add,
			load: Load::Direct,
			identity: vec![format.zero()],
		}
	}

	pub fn min(format: ScalarFormat) -> Self {
		Self {
			label: "min".to_string(),
			format,
			lanes: 1,
			input_lanes: 1,
			combine: Combine::Min,
			load: Load::Direct,
			identity: vec![format.greatest()],
		}
	}

	pub fn max(format: ScalarFormat) -> Self {
		Self {
			label: "max".to_string(),
			format,
			lanes: 1,
			input_lanes: 1,
			combine: Combine::Max,
			load: Load::Direct,
			identity: vec![format.least()],
		}
	}

	/// Minimum and maximum of a scalar source in one pass.
	pub fn min_max(format: ScalarFormat) -> Self {
		Self {
			label: "min_max".to_string(),
			format,
			lanes: 2,
			input_lanes: 1,
			combine: Combine::MinMax,
			load: Load::Splat,
			identity: vec![format.greatest(), format.least()],
		}
	}

	/// Bucket-wise sum of `buckets`-wide u32 histograms.
	pub fn histogram_merge(buckets: u32) -> Self {
		Self {
			label: format!("histogram_merge_{}", buckets),
			format: ScalarFormat::U32,
			lanes: buckets,
			input_lanes: buckets,
			combine: Combine::Add,
			load: Load::Direct,
			identity: vec![0; buckets as usize],
		}
	}

	pub fn validate(&self) -> Result<(), ComputeError> {
		if self.lanes == 0 {
			return Err(ComputeError::config("operator", "an element needs at least one lane"));
		}
		if self.identity.len() != self.lanes as usize {
			return Err(ComputeError::config(
				"operator",
				format!("identity has {} lanes, expected {}", self.identity.len(), self.lanes),
			));
		}
		if self.combine == Combine::MinMax && self.lanes != 2 {
			return Err(ComputeError::config("operator", "min/max pairs need exactly two lanes"));
		}
		match self.load {
			Load::Direct if self.input_lanes != self.lanes => Err(ComputeError::config(
				"operator",
				format!(
					"direct load reads {} lanes into a {} lane element",
					self.input_lanes, self.lanes
				),
			)),
			Load::Splat if self.input_lanes != 1 => {
				Err(ComputeError::config("operator", "splat load needs a one lane source"))
			}
			_ => Ok(()),
		}
	}

	/// Size in bytes of one operator element.
	pub fn elem_size(&self) -> u64 {
		self.lanes as u64 * 4
	}

	/// Size in bytes of one source element, before `load`.
	pub fn input_elem_size(&self) -> u64 {
		self.input_lanes as u64 * 4
	}

	pub fn combine_bits(&self, a: &[u32], b: &[u32]) -> Vec<u32> {
		let format = self.format;
		a.iter()
			.zip(b)
			.enumerate()
			.map(|(lane, (&a, &b))| match (self.combine, lane) {
				(Combine::Add, _) => format.add(a, b),
				(Combine::Min, _) | (Combine::MinMax, 0) => format.min(a, b),
				(Combine::Max, _) | (Combine::MinMax, _) => format.max(a, b),
			})
			.collect()
	}

	pub fn load_bits(&self, input: &[u32]) -> Vec<u32> {
		match self.load {
			Load::Direct => input.to_vec(),
			Load::Splat => vec![input.first().copied().unwrap_or(0); self.lanes as usize],
		}
	}

	/// A host number copied into every lane, used for exclusive-scan initial values.
	pub fn splat(&self, value: f64) -> Vec<u32> {
		vec![self.format.encode(value); self.lanes as usize]
	}

	pub fn decode(&self, bits: &[u32]) -> Vec<f64> {
		bits.iter().map(|&b| self.format.decode(b)).collect()
	}

	/// Host reference reduction of flattened source lanes.
	pub fn fold(&self, source: &[u32]) -> Vec<u32> {
		source
			.chunks(self.input_lanes.max(1) as usize)
			.fold(self.identity.clone(), |acc, element| self.combine_bits(&acc, &self.load_bits(element)))
	}

	/// Host reference inclusive scan of flattened source lanes; output is flattened too.
	pub fn scan(&self, source: &[u32]) -> Vec<u32> {
		let mut acc = self.identity.clone();
		let mut out = Vec::with_capacity(source.len() / self.input_lanes.max(1) as usize * self.lanes as usize);
		for element in source.chunks(self.input_lanes.max(1) as usize) {
			acc = self.combine_bits(&acc, &self.load_bits(element));
			out.extend_from_slice(&acc);
		}
		out
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn all_operators() -> Vec<Operator> {
		vec![
			Operator::sum(ScalarFormat::U32),
			Operator::sum(ScalarFormat::I32),
			Operator::sum(ScalarFormat::F32),
			Operator::min(ScalarFormat::U32),
			Operator::min(ScalarFormat::F32),
			Operator::max(ScalarFormat::I32),
			Operator::max(ScalarFormat::F32),
			Operator::min_max(ScalarFormat::F32),
			Operator::histogram_merge(4),
		]
	}

	#[test]
	fn test_builtins_are_valid() {
		for op in all_operators() {
			op.validate().unwrap();
		}
	}

	#[test]
	fn test_identity_is_neutral() {
		let samples = [0.0, 1.0, 7.0, 123.0, 4096.0];
		for op in all_operators() {
			for &sample in &samples {
				let x = op.splat(sample);
				assert_eq!(op.combine_bits(&op.identity, &x), x, "{}", op.label);
				assert_eq!(op.combine_bits(&x, &op.identity), x, "{}", op.label);
			}
		}
	}

	#[test]
	fn test_float_identity_is_neutral_at_the_extremes() {
		let floats = all_operators().into_iter().filter(|op| op.format == ScalarFormat::F32);
		for op in floats {
			let samples = [-0.0, f32::MAX as f64, f64::INFINITY, f64::NEG_INFINITY];
			for sample in samples {
				let x = op.splat(sample);
				assert_eq!(op.combine_bits(&op.identity, &x), x, "{} of {}", op.label, sample);
				assert_eq!(op.combine_bits(&x, &op.identity), x, "{} of {}", op.label, sample);
			}
		}
	}

	#[test]
	fn test_float_extremes_fold_to_infinity() {
		let max = Operator::max(ScalarFormat::F32);
		let source = vec![f32::NEG_INFINITY.to_bits(); 2];
		assert_eq!(max.decode(&max.fold(&source)), vec![f64::NEG_INFINITY]);
		assert_eq!(max.decode(&max.fold(&[])), vec![f64::NEG_INFINITY]);

		let min = Operator::min(ScalarFormat::F32);
		assert_eq!(min.decode(&min.fold(&[f32::INFINITY.to_bits()])), vec![f64::INFINITY]);
	}

	#[test]
	fn test_combine_is_associative() {
		for op in all_operators() {
			let a = op.splat(3.0);
			let b = op.splat(11.0);
			let c = op.splat(5.0);
			let left = op.combine_bits(&op.combine_bits(&a, &b), &c);
			let right = op.combine_bits(&a, &op.combine_bits(&b, &c));
			assert_eq!(left, right, "{}", op.label);
		}
	}

	#[test]
	fn test_min_max_splats_scalar_source() {
		let op = Operator::min_max(ScalarFormat::F32);
		let source: Vec<u32> = [4.0f32, -2.0, 9.5, 3.0].iter().map(|v| v.to_bits()).collect();
		assert_eq!(op.decode(&op.fold(&source)), vec![-2.0, 9.5]);
	}

	#[test]
	fn test_signed_formats_round_trip_negative_values() {
		let op = Operator::sum(ScalarFormat::I32);
		let source: Vec<u32> = [-5, 3, -1].iter().map(|&v: &i32| v as u32).collect();
		assert_eq!(op.decode(&op.scan(&source)), vec![-5.0, -2.0, -3.0]);
	}

	#[test]
	fn test_histogram_merge_adds_buckets() {
		let op = Operator::histogram_merge(3);
		let source = vec![1, 0, 2, 4, 1, 0];
		assert_eq!(op.fold(&source), vec![5, 1, 2]);
	}

	#[test]
	fn test_invalid_operators_are_rejected() {
		let mut op = Operator::sum(ScalarFormat::U32);
		op.identity = vec![];
		assert!(op.validate().unwrap_err().is_config());

		let mut op = Operator::min_max(ScalarFormat::U32);
		op.lanes = 3;
		op.identity = vec![0, 0, 0];
		assert!(op.validate().is_err());

		let mut op = Operator::sum(ScalarFormat::U32);
		op.input_lanes = 2;
		assert!(op.validate().is_err());

		let mut op = Operator::min_max(ScalarFormat::U32);
		op.input_lanes = 2;
		assert!(op.validate().is_err());
	}
}
