pub mod apply_block_sums;
pub mod prefix_scan;
pub mod workgroup_scan;

pub use apply_block_sums::{ApplyBlockSums, ApplyBlockSumsParams};
pub use prefix_scan::{scan_level_counts, PrefixScan, PrefixScanParams, ScanShape};
pub use workgroup_scan::{WorkgroupScan, WorkgroupScanParams};
