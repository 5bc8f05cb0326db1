// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! Scanning the debuggee's memory map for coroutine stacks.

use tracing::{trace, warn};

use crate::traits::{CommandOutput, Process, RegionInfo};

/// Collects the debuggee's memory regions, sorted ascending by base address.
///
/// Sorting makes the user-visible stack address of each coroutine stable
/// across invocations regardless of the host's enumeration order. Entries the
/// host failed to describe are reported and dropped; one bad entry never
/// aborts the scan.
pub fn process_memory_regions<P: Process>(
    process: &P,
    out: &mut CommandOutput,
) -> Vec<RegionInfo> {
    let mut regions = Vec::new();
    for (index, region) in process.memory_regions().into_iter().enumerate() {
        match region {
            Ok(info) => regions.push(info),
            Err(err) => {
                warn!(index, error = %err, "memory region enumeration entry failed");
                out.append_message(&format!(
                    "Failed to get memory region info at index {index}"
                ));
            }
        }
    }

    regions.sort_by_key(|region| region.begin);
    trace!(count = regions.len(), "memory regions collected");
    regions
}

/// Whether a region has exactly the footprint of one coroutine stack mapping
/// (the guard page is mprotected separately and not part of the region).
pub fn is_coroutine_stack(region: &RegionInfo, real_stack_size: u64) -> bool {
    region.len() == real_stack_size
}
