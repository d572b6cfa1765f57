//! Derived per-core values computed once all five threads are present.

use tracing::debug;

use super::CoreRecord;
use crate::device::codec::{BriscEventId, TriscEventId};
use crate::device::event::{BriscEventType, ThreadKind, TriscEventType, PERF_MAX_NUM_INPUTS};
use crate::device::parse::check_end_time_recorded;

/// Run every finalize pass on an assembled core. Returns the number of
/// events dropped for missing values.
pub fn finalize_core(core: &mut CoreRecord, quiet: bool) -> usize {
    let label = core.label();
    let mut dropped = 0;
    for record in core.threads.values_mut() {
        dropped += check_end_time_recorded(record, &label, quiet);
    }

    calculate_first_to_last_outer_loop_cycles(core, quiet);
    set_unpack_pack_num_tiles(core, quiet);
    calculate_brisc_bw_info(core, quiet);
    check_and_set_out_of_memory(core);

    debug!(
        core = %label,
        inputs = core.outer_loops.len(),
        out_of_memory = core.out_of_memory,
        dropped,
        "finalized core",
    );
    dropped
}

/// Fill the per-input windows from the unpack, math and pack threads.
pub fn calculate_first_to_last_outer_loop_cycles(core: &mut CoreRecord, quiet: bool) {
    let label = core.label();

    if let Some(unpack) = core.threads.get(&ThreadKind::Unpack) {
        for (&id, events) in &unpack.events {
            let event_id = TriscEventId::decode(id as u32);
            let window = core
                .outer_loops
                .entry(u32::from(event_id.outer_loop_idx))
                .or_default();
            let Some(first_event) = events.first() else {
                continue;
            };

            match event_id.kind() {
                Some(TriscEventType::UnpackFirstInstruction) => {
                    if window.unpack_first.is_some() {
                        crate::perf_warn!(
                            quiet,
                            core = %label,
                            input = event_id.outer_loop_idx,
                            "more than one first-unpack-instruction event for one input",
                        );
                        continue;
                    }
                    window.unpack_first = first_event.first;
                }
                Some(TriscEventType::StallTriscForDramPerfDump) => {
                    window.trisc0_stall_on_ncrisc +=
                        events.iter().filter_map(|e| e.diff()).sum::<u64>();
                }
                _ => {}
            }
        }

        for (&id, events) in &unpack.events {
            let event_id = TriscEventId::decode(id as u32);
            if event_id.kind() != Some(TriscEventType::WaitForIncomingTiles) {
                continue;
            }
            let window = core
                .outer_loops
                .entry(u32::from(event_id.outer_loop_idx))
                .or_default();
            let Some(first_unpack) = window.unpack_first else {
                continue;
            };
            for event in events {
                if event.first.is_some_and(|first| first > first_unpack) {
                    window.wait_for_tile_after_first_unpack += event.diff().unwrap_or(0);
                }
            }
        }
    }

    if let Some(math) = core.threads.get(&ThreadKind::Math) {
        for event in math.events.values().flatten() {
            let Some(activity) = event.second else {
                continue;
            };
            match core.math_activity {
                None => core.math_activity = Some(activity),
                Some(previous) if previous != activity => {
                    crate::perf_warn!(
                        quiet,
                        core = %label,
                        previous,
                        activity,
                        "math activity differs between inputs",
                    );
                }
                Some(_) => {}
            }
        }
    }

    if let Some(pack) = core.threads.get(&ThreadKind::Pack) {
        for (&id, events) in &pack.events {
            let event_id = TriscEventId::decode(id as u32);
            let Some(first_event) = events.first() else {
                continue;
            };
            let window = core
                .outer_loops
                .entry(u32::from(event_id.outer_loop_idx))
                .or_default();

            match event_id.kind() {
                Some(TriscEventType::OutputNumTiles) => {
                    core.packer_num_tiles = first_event.first.unwrap_or(0);
                }
                Some(TriscEventType::OutputTimestamp) => {
                    core.packer_push_runtime = first_event.diff().unwrap_or(0);
                }
                Some(TriscEventType::PackEachInput) => {
                    window.pack_first_start = first_event.first;
                    window.pack_last_end = first_event.second;
                }
                Some(TriscEventType::WaitForFreeTiles) => {
                    let Some(first_block) = window.unpack_first else {
                        continue;
                    };
                    for event in events {
                        let (Some(first), Some(second)) = (event.first, event.second) else {
                            continue;
                        };
                        if second >= first_block {
                            window.wait_for_free_tiles_after_first_unpack +=
                                second - first.max(first_block);
                        }
                    }
                }
                Some(TriscEventType::StallTriscForDramPerfDump) => {
                    window.trisc2_stall_on_ncrisc +=
                        events.iter().filter_map(|e| e.diff()).sum::<u64>();
                }
                _ => {}
            }
        }
    }

    set_number_of_inputs_recorded(core, quiet);
}

/// Count recorded inputs and check unpack/pack consistency.
pub fn set_number_of_inputs_recorded(core: &mut CoreRecord, quiet: bool) {
    let windows = core.outer_loops.values();
    let num_unpack = windows.clone().filter(|w| w.unpack_first.is_some()).count();
    let num_pack_start = windows.clone().filter(|w| w.pack_first_start.is_some()).count();
    let num_pack_end = windows.filter(|w| w.pack_last_end.is_some()).count();

    core.num_unpack_inputs = num_unpack;
    core.num_pack_inputs = num_pack_start;

    let oom = |kind| core.threads.get(&kind).is_some_and(|t| t.out_of_memory);
    let label = core.label();

    if !oom(ThreadKind::Pack) && num_pack_start != num_pack_end {
        crate::perf_warn!(
            quiet,
            core = %label,
            pack_start = num_pack_start,
            pack_end = num_pack_end,
            "number of pack end events differs from the number of inputs",
        );
    }
    if !oom(ThreadKind::Unpack) && !oom(ThreadKind::Pack) && num_unpack != num_pack_start {
        crate::perf_warn!(
            quiet,
            core = %label,
            unpack = num_unpack,
            pack = num_pack_start,
            "number of inputs recorded by unpacker and packer differ",
        );
    }
}

/// Per-operand tile counts and pop/push cycles from the brisc thread.
pub fn calculate_brisc_bw_info(core: &mut CoreRecord, quiet: bool) {
    let label = core.label();
    let Some(brisc) = core.threads.get(&ThreadKind::Brisc) else {
        return;
    };

    for (&id, events) in &brisc.events {
        let event_id = BriscEventId::decode(id as u32);
        let Some(kind) = event_id.kind() else {
            continue;
        };
        let operand = match kind {
            BriscEventType::InputNumTiles | BriscEventType::InputTilePop => {
                u32::from(event_id.operand_idx)
            }
            BriscEventType::OutputNumTiles | BriscEventType::OutputTilePush => {
                u32::from(event_id.operand_idx) + PERF_MAX_NUM_INPUTS
            }
            _ => continue,
        };
        let Some(first_event) = events.first() else {
            continue;
        };
        if events.len() != 1 {
            crate::perf_warn!(
                quiet,
                core = %label,
                operand,
                description = %first_event.description,
                count = events.len(),
                "expected a single brisc event per operand",
            );
        }

        match kind {
            BriscEventType::InputNumTiles | BriscEventType::OutputNumTiles => {
                core.brisc_operand_tiles
                    .insert(operand, first_event.first.unwrap_or(0));
            }
            _ => {
                core.brisc_operand_pop_cycles
                    .insert(operand, first_event.diff().unwrap_or(0));
            }
        }
    }
}

/// Tiles per operand from the unpack and pack threads.
pub fn set_unpack_pack_num_tiles(core: &mut CoreRecord, quiet: bool) {
    if let Some(unpack) = core.threads.get(&ThreadKind::Unpack) {
        for (&id, events) in &unpack.events {
            let event_id = TriscEventId::decode(id as u32);
            if event_id.kind() != Some(TriscEventType::NumTilesUnpack) {
                continue;
            }
            if let Some(tiles) = events.first().and_then(|e| e.first) {
                core.trisc_operand_tiles
                    .insert(u32::from(event_id.operand_idx), tiles);
            }
        }
    }

    if let Some(pack) = core.threads.get(&ThreadKind::Pack) {
        for (&id, events) in &pack.events {
            let event_id = TriscEventId::decode(id as u32);
            if event_id.kind() != Some(TriscEventType::NumTilesPack) {
                continue;
            }
            if event_id.operand_idx != 0 {
                crate::perf_warn!(
                    quiet,
                    operand = event_id.operand_idx,
                    "only a single output operand is supported",
                );
                continue;
            }
            if let Some(tiles) = events.first().and_then(|e| e.first) {
                core.trisc_operand_tiles.insert(PERF_MAX_NUM_INPUTS, tiles);
            }
        }
    }
}

/// A core is out of memory if any of its threads is.
pub fn check_and_set_out_of_memory(core: &mut CoreRecord) {
    if !core.is_complete() {
        return;
    }
    core.out_of_memory |= core.threads.values().any(|t| t.out_of_memory);
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::device::codec::CoreCoord;
    use crate::device::event::{Event, ThreadRecord};
    use crate::device::parse::MATH_EVENT_DESCRIPTION;

    fn trisc_id(event_type: TriscEventType, outer_loop: u16, operand: u8, tiles: u8) -> u64 {
        u64::from(
            TriscEventId {
                operand_idx: operand,
                num_tiles: tiles,
                event_type: event_type as u8,
                outer_loop_idx: outer_loop,
            }
            .encode(),
        )
    }

    fn brisc_id(event_type: BriscEventType, operand: u8) -> u64 {
        u64::from(
            BriscEventId {
                event_type: event_type as u8,
                epoch_id: 0,
                operand_idx: operand,
            }
            .encode(),
        )
    }

    fn push(record: &mut ThreadRecord, event: Event) {
        record.events.entry(event.id).or_default().push(event);
    }

    /// Core with one input: unpack at 1000, pack 1100..1500, math activity 300.
    pub(crate) fn sample_core() -> CoreRecord {
        let mut core = CoreRecord::new(0, CoreCoord::new(1, 1), 0);
        core.descriptor.op_name = "op0".to_string();

        let mut unpack = ThreadRecord::new(ThreadKind::Unpack);
        let first = trisc_id(TriscEventType::UnpackFirstInstruction, 0, 0, 0);
        push(&mut unpack, Event::paired(first, "unpack-first", 1000, 1001));
        let wait = trisc_id(TriscEventType::WaitForIncomingTiles, 0, 0, 4);
        push(&mut unpack, Event::paired(wait, "wait", 900, 950));
        push(&mut unpack, Event::paired(wait, "wait", 1100, 1150));
        let tiles = trisc_id(TriscEventType::NumTilesUnpack, 0, 0, 0);
        push(&mut unpack, Event::new(tiles, "tiles", 16));

        let mut math = ThreadRecord::new(ThreadKind::Math);
        push(&mut math, Event::paired(0, MATH_EVENT_DESCRIPTION, 600, 300));

        let mut pack = ThreadRecord::new(ThreadKind::Pack);
        let each = trisc_id(TriscEventType::PackEachInput, 0, 0, 0);
        push(&mut pack, Event::paired(each, "pack", 1100, 1500));
        let free = trisc_id(TriscEventType::WaitForFreeTiles, 0, 0, 1);
        push(&mut pack, Event::paired(free, "free", 980, 1020));
        let out_tiles = trisc_id(TriscEventType::NumTilesPack, 0, 0, 0);
        push(&mut pack, Event::new(out_tiles, "tiles", 8));

        let mut brisc = ThreadRecord::new(ThreadKind::Brisc);
        push(
            &mut brisc,
            Event::new(brisc_id(BriscEventType::InputNumTiles, 0), "in", 32),
        );
        push(
            &mut brisc,
            Event::paired(brisc_id(BriscEventType::InputTilePop, 0), "pop", 100, 300),
        );
        push(
            &mut brisc,
            Event::new(brisc_id(BriscEventType::OutputNumTiles, 0), "out", 8),
        );
        push(
            &mut brisc,
            Event::paired(brisc_id(BriscEventType::OutputTilePush, 0), "push", 200, 260),
        );

        for record in [
            unpack,
            math,
            pack,
            ThreadRecord::new(ThreadKind::Ncrisc),
            brisc,
        ] {
            core.insert_thread(record).expect("insert");
        }
        core
    }

    #[test]
    fn test_outer_loop_windows() {
        let mut core = sample_core();
        finalize_core(&mut core, true);

        let window = &core.outer_loops[&0];
        assert_eq!(window.unpack_first, Some(1000));
        assert_eq!(window.pack_first_start, Some(1100));
        assert_eq!(window.pack_last_end, Some(1500));
        // Only the wait that starts after the first unpack counts.
        assert_eq!(window.wait_for_tile_after_first_unpack, 50);
        // Clipped to the first unpack.
        assert_eq!(window.wait_for_free_tiles_after_first_unpack, 20);
        assert!(window.pack_last_end >= window.unpack_first);
        assert_eq!(core.math_activity, Some(300));
        assert_eq!(core.num_unpack_inputs, 1);
        assert_eq!(core.num_pack_inputs, 1);
        assert!(!core.out_of_memory);
    }

    #[test]
    fn test_tile_counts() {
        let mut core = sample_core();
        finalize_core(&mut core, true);

        assert_eq!(core.trisc_operand_tiles.get(&0), Some(&16));
        assert_eq!(core.trisc_operand_tiles.get(&8), Some(&8));
        assert_eq!(core.brisc_operand_tiles.get(&0), Some(&32));
        assert_eq!(core.brisc_operand_tiles.get(&8), Some(&8));
        assert_eq!(core.brisc_operand_pop_cycles.get(&0), Some(&200));
        assert_eq!(core.brisc_operand_pop_cycles.get(&8), Some(&60));
    }

    #[test]
    fn test_out_of_memory_propagates() {
        let mut core = sample_core();
        if let Some(ncrisc) = core.threads.get_mut(&ThreadKind::Ncrisc) {
            ncrisc.out_of_memory = true;
        }
        finalize_core(&mut core, true);
        assert!(core.out_of_memory);
    }

    #[test]
    fn test_out_of_memory_needs_all_threads() {
        let mut core = CoreRecord::new(0, CoreCoord::new(1, 1), 0);
        let mut unpack = ThreadRecord::new(ThreadKind::Unpack);
        unpack.out_of_memory = true;
        core.insert_thread(unpack).expect("insert");
        check_and_set_out_of_memory(&mut core);
        assert!(!core.out_of_memory);
    }

    #[test]
    fn test_stalls_accumulate() {
        let mut core = sample_core();
        let stall = trisc_id(TriscEventType::StallTriscForDramPerfDump, 0, 0, 0);
        if let Some(pack) = core.threads.get_mut(&ThreadKind::Pack) {
            push(pack, Event::paired(stall, "stall", 10, 15));
            push(pack, Event::paired(stall, "stall", 20, 30));
        }
        finalize_core(&mut core, true);
        assert_eq!(core.outer_loops[&0].trisc2_stall_on_ncrisc, 15);
    }
}
