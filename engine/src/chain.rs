// =================================================================================================
// DISPATCH CHAIN
// =================================================================================================
// Several passes or orchestrators recorded into one stream and submitted as one unit.
// Recording order is execution order, so a consumer must be pushed after its producer.

use crate::device::ComputeDevice;
use crate::error::ComputeError;

/// Anything that appends compute work to an externally owned stream.
pub trait RecordCommands<D: ComputeDevice> {
	fn record_commands(&mut self, stream: &mut D::Stream) -> Result<(), ComputeError>;
}

pub struct DispatchChain<'a, D: ComputeDevice> {
	label: String,
	links: Vec<&'a mut dyn RecordCommands<D>>,
}

impl<'a, D: ComputeDevice> DispatchChain<'a, D> {
	pub fn new(label: impl Into<String>) -> Self {
		Self { label: label.into(), links: Vec::new() }
	}

	pub fn push(&mut self, link: &'a mut dyn RecordCommands<D>) -> &mut Self {
		self.links.push(link);
		self
	}

	pub fn len(&self) -> usize {
		self.links.len()
	}

	pub fn is_empty(&self) -> bool {
		self.links.is_empty()
	}

	/// Record every link in order into a fresh stream, without submitting it.
	pub fn record(&mut self, device: &D) -> Result<D::Stream, ComputeError> {
		let mut stream = device.create_stream(&self.label);
		for link in self.links.iter_mut() {
			link.record_commands(&mut stream)?;
		}
		Ok(stream)
	}

	pub fn submit(mut self, device: &D) -> Result<(), ComputeError> {
		log::debug!("submitting dispatch chain {} with {} links", self.label, self.links.len());
		let stream = self.record(device)?;
		device.submit(stream)?;
		Ok(())
	}
}
