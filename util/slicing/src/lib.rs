pub mod partition;
pub mod plan;
pub mod uniform;

pub use partition::{partition, total_dispatches, DispatchSlice};
pub use plan::DispatchPlan;
pub use uniform::{uniform_layout, UniformLayout};
