//! Bit-packed identifiers and headers of device and host perf events.
//!
//! All layouts are listed low bit to high bit. Decoding is total: every
//! field is masked out of the raw word, so any input decodes to *some*
//! value, and [`describe`] returns `None` for event types it does not know.

use super::event::{BriscEventType, HostEventType, NcriscEventType, ThreadKind, TriscEventType};

/// Combine two 32-bit halves into one 64-bit counter value.
#[inline(always)]
pub fn events_32b_to_64b(hi: u32, lo: u32) -> u64 {
    (u64::from(hi) << 32) | u64::from(lo)
}

/// Split a 64-bit counter into (hi, lo).
#[inline(always)]
pub fn events_64b_to_32b(value: u64) -> (u32, u32) {
    ((value >> 32) as u32, value as u32)
}

/// Physical core coordinates on one chip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CoreCoord {
    pub x: u8,
    pub y: u8,
}

impl CoreCoord {
    pub const fn new(x: u8, y: u8) -> Self {
        Self { x, y }
    }

    /// Label used throughout the reports: "x-y".
    pub fn label(&self) -> String {
        format!("{}-{}", self.x, self.y)
    }
}

/// Thread dump header: `[x:4][y:4][chip_id:8][thread_id:3][epoch_id:13]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DumpHeader {
    pub x: u8,
    pub y: u8,
    pub chip_id: u8,
    pub thread_id: u8,
    pub epoch_id: u16,
}

impl DumpHeader {
    pub fn decode(word: u32) -> Self {
        Self {
            x: (word & 0xf) as u8,
            y: ((word >> 4) & 0xf) as u8,
            chip_id: ((word >> 8) & 0xff) as u8,
            thread_id: ((word >> 16) & 0x7) as u8,
            epoch_id: ((word >> 19) & 0x1fff) as u16,
        }
    }

    pub fn encode(&self) -> u32 {
        u32::from(self.x & 0xf)
            | (u32::from(self.y & 0xf) << 4)
            | (u32::from(self.chip_id) << 8)
            | (u32::from(self.thread_id & 0x7) << 16)
            | (u32::from(self.epoch_id & 0x1fff) << 19)
    }

    pub fn core(&self) -> CoreCoord {
        CoreCoord::new(self.x, self.y)
    }

    pub fn thread_kind(&self) -> Option<ThreadKind> {
        ThreadKind::from_u8(self.thread_id)
    }
}

/// Unpack/pack/math event id: `[operand_idx:8][num_tiles:8][event_type:4][outer_loop_idx:12]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriscEventId {
    pub operand_idx: u8,
    pub num_tiles: u8,
    pub event_type: u8,
    pub outer_loop_idx: u16,
}

impl TriscEventId {
    pub fn decode(id: u32) -> Self {
        Self {
            operand_idx: (id & 0xff) as u8,
            num_tiles: ((id >> 8) & 0xff) as u8,
            event_type: ((id >> 16) & 0xf) as u8,
            outer_loop_idx: ((id >> 20) & 0xfff) as u16,
        }
    }

    pub fn encode(&self) -> u32 {
        u32::from(self.operand_idx)
            | (u32::from(self.num_tiles) << 8)
            | (u32::from(self.event_type & 0xf) << 16)
            | (u32::from(self.outer_loop_idx & 0xfff) << 20)
    }

    pub fn kind(&self) -> Option<TriscEventType> {
        TriscEventType::from_u8(self.event_type)
    }
}

/// BRISC event id: `[event_type:4][epoch_id:16][operand_idx:8]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BriscEventId {
    pub event_type: u8,
    pub epoch_id: u16,
    pub operand_idx: u8,
}

impl BriscEventId {
    pub fn decode(id: u32) -> Self {
        Self {
            event_type: (id & 0xf) as u8,
            epoch_id: ((id >> 4) & 0xffff) as u16,
            operand_idx: ((id >> 20) & 0xff) as u8,
        }
    }

    pub fn encode(&self) -> u32 {
        u32::from(self.event_type & 0xf)
            | (u32::from(self.epoch_id) << 4)
            | (u32::from(self.operand_idx) << 20)
    }

    pub fn kind(&self) -> Option<BriscEventType> {
        BriscEventType::from_u8(self.event_type)
    }
}

/// Host event id:
/// `[event_type:8][device_id:8][epoch_id:16][program_id:8][custom_label:24]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostEventId {
    pub event_type: u8,
    pub device_id: u8,
    pub epoch_id: u16,
    pub program_id: u8,
    pub custom_label: u32,
}

impl HostEventId {
    pub fn decode(id: u64) -> Self {
        Self {
            event_type: (id & 0xff) as u8,
            device_id: ((id >> 8) & 0xff) as u8,
            epoch_id: ((id >> 16) & 0xffff) as u16,
            program_id: ((id >> 32) & 0xff) as u8,
            custom_label: ((id >> 40) & 0xff_ffff) as u32,
        }
    }

    pub fn encode(&self) -> u64 {
        u64::from(self.event_type)
            | (u64::from(self.device_id) << 8)
            | (u64::from(self.epoch_id) << 16)
            | (u64::from(self.program_id) << 32)
            | (u64::from(self.custom_label & 0xff_ffff) << 40)
    }

    pub fn kind(&self) -> Option<HostEventType> {
        HostEventType::from_u8(self.event_type)
    }
}

// ---------------------------------------------------------------------------
// Descriptions
// ---------------------------------------------------------------------------

/// Human-readable description for a device event id of the given thread.
pub fn describe(id: u32, thread: ThreadKind) -> Option<String> {
    match thread {
        ThreadKind::Unpack | ThreadKind::Math | ThreadKind::Pack => describe_trisc(id, thread),
        ThreadKind::Ncrisc => describe_ncrisc(id),
        ThreadKind::Brisc => describe_brisc(id),
    }
}

pub fn describe_trisc(id: u32, thread: ThreadKind) -> Option<String> {
    let props = TriscEventId::decode(id);
    let kind = props.kind()?;

    let mut desc = format!("{}-outer-loop-{}", kind.label(), props.outer_loop_idx);
    if thread.is_unpack_or_pack()
        && !matches!(
            kind,
            TriscEventType::PackEachInput
                | TriscEventType::UnpackFirstInstruction
                | TriscEventType::NumTilesPack
        )
    {
        desc.push_str(&format!("-operand-{}", props.operand_idx));
        if kind != TriscEventType::NumTilesUnpack {
            desc.push_str(&format!("-num-tiles-{}", props.num_tiles));
        }
    }
    Some(desc)
}

pub fn describe_brisc(id: u32) -> Option<String> {
    let props = BriscEventId::decode(id);
    let kind = props.kind()?;

    let mut desc = format!("{}-epoch-id-{}", kind.label(), props.epoch_id);
    if kind.has_operand() {
        desc.push_str(&format!("-operand-idx-{}", props.operand_idx));
    }
    Some(desc)
}

pub fn describe_ncrisc(id: u32) -> Option<String> {
    let kind = NcriscEventType::from_id(id)?;
    let label = kind.label()?;

    let desc = match kind {
        NcriscEventType::EpochQSlotComplete
        | NcriscEventType::DramWriteTilesCleared
        | NcriscEventType::DramIoQStatus
        | NcriscEventType::StreamRestart
        | NcriscEventType::StreamInfo
        | NcriscEventType::StreamBufStatus
        | NcriscEventType::StreamMiscInfo => format!("{label}-stream-{}", id & 0xff),
        NcriscEventType::DramReadIssued | NcriscEventType::DramWriteSent => {
            format!("{label}-stream-{}-{}", (id >> 16) & 0xff, id & 0xffff)
        }
        _ => label.to_string(),
    };
    Some(desc)
}

/// Description for a host event. `custom_labels` resolves CUSTOM events.
pub fn describe_host(id: u64, pid: u32, thread_id: u64, custom_labels: &[String]) -> Option<String> {
    let props = HostEventId::decode(id);
    let kind = props.kind()?;

    let mut desc = if kind == HostEventType::Custom {
        custom_labels.get(props.custom_label as usize)?.clone()
    } else {
        let mut d = kind.label().to_string();
        if kind == HostEventType::DeviceEpochFirstUnpackLastPack {
            d.push_str(&format!(
                "-program-id-{}-epoch-id-{}",
                props.program_id, props.epoch_id
            ));
        }
        if kind.has_device_suffix() {
            d.push_str(&format!("-device-{}", props.device_id));
        }
        d
    };
    desc.push_str(&format!("_pid_{pid}_th_{thread_id}"));
    Some(desc)
}

/// True for trisc/brisc ids that only ever carry a first value.
pub fn is_single_value(id: u32, thread: ThreadKind) -> bool {
    match thread {
        ThreadKind::Unpack | ThreadKind::Math | ThreadKind::Pack => TriscEventId::decode(id)
            .kind()
            .is_some_and(TriscEventType::is_single_value),
        ThreadKind::Brisc => BriscEventId::decode(id)
            .kind()
            .is_some_and(BriscEventType::is_single_value),
        ThreadKind::Ncrisc => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trisc_id(event_type: TriscEventType, outer_loop: u16, operand: u8, tiles: u8) -> u32 {
        TriscEventId {
            operand_idx: operand,
            num_tiles: tiles,
            event_type: event_type as u8,
            outer_loop_idx: outer_loop,
        }
        .encode()
    }

    #[test]
    fn test_header_layout() {
        let h = DumpHeader {
            x: 3,
            y: 11,
            chip_id: 2,
            thread_id: 4,
            epoch_id: 1234,
        };
        let word = h.encode();
        assert_eq!(word & 0xf, 3);
        assert_eq!((word >> 4) & 0xf, 11);
        assert_eq!((word >> 8) & 0xff, 2);
        assert_eq!((word >> 16) & 0x7, 4);
        assert_eq!(word >> 19, 1234);
        assert_eq!(DumpHeader::decode(word), h);
        assert_eq!(h.thread_kind(), Some(ThreadKind::Brisc));
    }

    #[test]
    fn test_trisc_id_layout() {
        let id = trisc_id(TriscEventType::WaitForIncomingTiles, 7, 1, 16);
        assert_eq!(id, (7 << 20) | (1 << 16) | (16 << 8) | 1);
        let props = TriscEventId::decode(id);
        assert_eq!(props.outer_loop_idx, 7);
        assert_eq!(props.kind(), Some(TriscEventType::WaitForIncomingTiles));
    }

    #[test]
    fn test_brisc_id_layout() {
        let id = BriscEventId {
            event_type: BriscEventType::InputTilePop as u8,
            epoch_id: 0xabcd,
            operand_idx: 2,
        }
        .encode();
        assert_eq!(id, 3 | (0xabcd << 4) | (2 << 20));
        assert_eq!(
            describe_brisc(id).as_deref(),
            Some("input-tile-pop-epoch-id-43981-operand-idx-2")
        );
    }

    #[test]
    fn test_host_id_layout() {
        let props = HostEventId {
            event_type: HostEventType::DeviceRuntime as u8,
            device_id: 1,
            epoch_id: 9,
            program_id: 3,
            custom_label: 0x12_3456,
        };
        let id = props.encode();
        assert_eq!(HostEventId::decode(id), props);
        assert_eq!(id >> 40, 0x12_3456);
    }

    #[test]
    fn test_describe_unpack_events() {
        let id = trisc_id(TriscEventType::UnpackFirstInstruction, 0, 0, 0);
        assert_eq!(
            describe_trisc(id, ThreadKind::Unpack).as_deref(),
            Some("unpack-first-instruction-outer-loop-0")
        );

        let id = trisc_id(TriscEventType::WaitForIncomingTiles, 2, 1, 4);
        assert_eq!(
            describe_trisc(id, ThreadKind::Unpack).as_deref(),
            Some("wait-for-incoming-tiles-outer-loop-2-operand-1-num-tiles-4")
        );

        let id = trisc_id(TriscEventType::NumTilesUnpack, 1, 0, 4);
        assert_eq!(
            describe_trisc(id, ThreadKind::Unpack).as_deref(),
            Some("num-tiles-input-outer-loop-1-operand-0")
        );
    }

    #[test]
    fn test_describe_math_has_no_operand() {
        let id = trisc_id(TriscEventType::MathPerfCounters, 0, 3, 3);
        assert_eq!(
            describe_trisc(id, ThreadKind::Math).as_deref(),
            Some("math-perf-counter-outer-loop-0")
        );
    }

    #[test]
    fn test_describe_ncrisc() {
        let read = (7 << 24) | (5 << 16) | 2048;
        assert_eq!(describe_ncrisc(read).as_deref(), Some("dram-read-stream-5-2048"));
        let info = (13 << 24) | 17;
        assert_eq!(describe_ncrisc(info).as_deref(), Some("info-stream-17"));
        assert_eq!(describe_ncrisc(1 << 24).as_deref(), Some("epoch"));
        assert!(describe_ncrisc(6 << 24).is_none());
        assert!(describe_ncrisc(40 << 24).is_none());
    }

    #[test]
    fn test_describe_host() {
        let id = HostEventId {
            event_type: HostEventType::DeviceEpochFirstUnpackLastPack as u8,
            device_id: 1,
            epoch_id: 4,
            program_id: 2,
            custom_label: 0,
        }
        .encode();
        assert_eq!(
            describe_host(id, 100, 7, &[]).as_deref(),
            Some("device-epoch-first-unpack-last-pack-program-id-2-epoch-id-4-device-1_pid_100_th_7")
        );

        let custom = HostEventId {
            event_type: HostEventType::Custom as u8,
            device_id: 0,
            epoch_id: 0,
            program_id: 0,
            custom_label: 1,
        }
        .encode();
        let labels = vec!["a".to_string(), "compile".to_string()];
        assert_eq!(
            describe_host(custom, 1, 2, &labels).as_deref(),
            Some("compile_pid_1_th_2")
        );
        assert!(describe_host(custom, 1, 2, &labels[..1]).is_none());
    }

    #[test]
    fn test_32b_to_64b() {
        let v = events_32b_to_64b(0x1, 0x2);
        assert_eq!(v, 0x1_0000_0002);
        assert_eq!(events_64b_to_32b(v), (1, 2));
    }
}
