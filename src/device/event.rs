use std::collections::BTreeMap;
use std::fmt;

/// First word of every thread dump written by the device.
pub const VALID_THREAD_DUMP_START_ID: u32 = 0xbeef_f00d;
/// Last word of a complete thread dump. Numerically equal to the start id.
pub const THREAD_DUMP_END_ID: u32 = 0xbeef_f00d;
/// Marker opening an event stream.
pub const PERF_VAL_FIRST: u32 = 0xbeef_f00d;
/// Marker closing an event stream.
pub const PERF_VAL_LAST: u32 = 0xbeef_f00d;
/// Host-written marker for a scratch slot that holds no data.
pub const PERF_SCRATCH_EMPTY_ID: u32 = 0x0;
/// Host-written marker on the last word of a slot that is still empty.
pub const PERF_SCRATCH_END_EMPTY_ID: u32 = 0xc0ba_14f3;
/// NCRISC filler for half-buffer ends that cannot fit a whole record.
pub const PERF_VAL_PADDING: u32 = 0xdead_bead;
/// Written by firmware when a thread runs out of buffer space.
pub const PERF_OUT_OF_MEM: u32 = 0xfeed_feed;
/// Filler word in concurrent math dumps and between trisc records.
pub const MATH_HEADER_WORD: u32 = 0xffff_ffff;

/// Maximum number of input operands tracked per core.
pub const PERF_MAX_NUM_INPUTS: u32 = 8;
/// Maximum number of output operands tracked per core.
pub const PERF_MAX_NUM_OUTPUTS: u32 = 1;

/// Number of traced threads per core.
pub const NUM_THREADS: usize = 5;

/// Words per record for unpack, pack and brisc: (id, hi, lo).
pub const WORDS_PER_EVENT_TRISC: usize = 3;
/// Words per math record.
pub const WORDS_PER_EVENT_MATH: usize = 4;
/// Minimum words per NCRISC record.
pub const WORDS_PER_EVENT_NCRISC: usize = 2;

/// Absent value placeholder used by the device and the text formats.
pub const ABSENT: u64 = u64::MAX;

/// ThreadKind identifies one of the five traced firmware threads of a core.
/// Values must match the thread id in the dump header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum ThreadKind {
    Unpack = 0,
    Math = 1,
    Pack = 2,
    Ncrisc = 3,
    Brisc = 4,
}

impl ThreadKind {
    /// Returns the thread name used in dumps and reports.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unpack => "T0",
            Self::Math => "T1",
            Self::Pack => "T2",
            Self::Ncrisc => "NCRISC",
            Self::Brisc => "BRISC",
        }
    }

    /// Convert from the raw header thread id.
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Unpack),
            1 => Some(Self::Math),
            2 => Some(Self::Pack),
            3 => Some(Self::Ncrisc),
            4 => Some(Self::Brisc),
            _ => None,
        }
    }

    /// Convert from the thread name used in textual dumps.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "T0" => Some(Self::Unpack),
            "T1" => Some(Self::Math),
            "T2" => Some(Self::Pack),
            "NCRISC" => Some(Self::Ncrisc),
            "BRISC" => Some(Self::Brisc),
            _ => None,
        }
    }

    /// Return all thread kinds in header order.
    pub fn all() -> &'static [Self; NUM_THREADS] {
        &[
            Self::Unpack,
            Self::Math,
            Self::Pack,
            Self::Ncrisc,
            Self::Brisc,
        ]
    }

    /// True for the unpack and pack compute threads.
    pub const fn is_unpack_or_pack(self) -> bool {
        matches!(self, Self::Unpack | Self::Pack)
    }
}

impl fmt::Display for ThreadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event types recorded by the unpack, math and pack threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TriscEventType {
    WaitForIncomingTiles = 1,
    WaitForFreeTiles = 2,
    PackEachInput = 3,
    MathPerfCounters = 4,
    UnpackFirstInstruction = 5,
    StallTriscForDramPerfDump = 6,
    NumTilesUnpack = 7,
    NumTilesPack = 8,
    OutputNumTiles = 9,
    OutputTimestamp = 10,
}

impl TriscEventType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::WaitForIncomingTiles),
            2 => Some(Self::WaitForFreeTiles),
            3 => Some(Self::PackEachInput),
            4 => Some(Self::MathPerfCounters),
            5 => Some(Self::UnpackFirstInstruction),
            6 => Some(Self::StallTriscForDramPerfDump),
            7 => Some(Self::NumTilesUnpack),
            8 => Some(Self::NumTilesPack),
            9 => Some(Self::OutputNumTiles),
            10 => Some(Self::OutputTimestamp),
            _ => None,
        }
    }

    /// Description prefix.
    pub const fn label(self) -> &'static str {
        match self {
            Self::WaitForIncomingTiles => "wait-for-incoming-tiles",
            Self::WaitForFreeTiles => "wait-for-free-tiles",
            Self::PackEachInput => "packer-each-input",
            Self::MathPerfCounters => "math-perf-counter",
            Self::UnpackFirstInstruction => "unpack-first-instruction",
            Self::StallTriscForDramPerfDump => "trisc-stall-on-dram-perf-dump",
            Self::NumTilesUnpack => "num-tiles-input",
            Self::NumTilesPack => "num-tiles-output",
            Self::OutputNumTiles => "output-num-tiles",
            Self::OutputTimestamp => "output-timestamp",
        }
    }

    /// Single-value events only carry a first value.
    pub const fn is_single_value(self) -> bool {
        matches!(
            self,
            Self::UnpackFirstInstruction
                | Self::NumTilesUnpack
                | Self::NumTilesPack
                | Self::OutputNumTiles
        )
    }
}

/// Event types recorded by the BRISC data-movement thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BriscEventType {
    InputNumTiles = 1,
    OutputNumTiles = 2,
    InputTilePop = 3,
    OutputTilePush = 4,
    StallBriscForDramPerfDump = 5,
    Epoch = 6,
}

impl BriscEventType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::InputNumTiles),
            2 => Some(Self::OutputNumTiles),
            3 => Some(Self::InputTilePop),
            4 => Some(Self::OutputTilePush),
            5 => Some(Self::StallBriscForDramPerfDump),
            6 => Some(Self::Epoch),
            _ => None,
        }
    }

    pub const fn label(self) -> &'static str {
        match self {
            Self::InputNumTiles => "input-num-tiles",
            Self::OutputNumTiles => "output-num-tiles",
            Self::InputTilePop => "input-tile-pop",
            Self::OutputTilePush => "output-tile-push",
            Self::StallBriscForDramPerfDump => "brisc-stall-on-dram-perf-dump",
            Self::Epoch => "epoch",
        }
    }

    pub const fn is_single_value(self) -> bool {
        matches!(self, Self::InputNumTiles | Self::OutputNumTiles)
    }

    /// Events whose description carries the operand index.
    pub const fn has_operand(self) -> bool {
        matches!(
            self,
            Self::InputNumTiles | Self::OutputNumTiles | Self::InputTilePop | Self::OutputTilePush
        )
    }
}

/// Event types recorded by the NCRISC DRAM I/O thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum NcriscEventType {
    Epoch = 1,
    StreamHandlerLoop = 2,
    EpochEpilogue = 3,
    StreamHandlerInit = 4,
    EpochQSlotComplete = 5,
    WallClockTop32b = 6,
    DramReadIssued = 7,
    DramReadTileFlushed = 8,
    DramWriteSent = 9,
    DramWriteTilesCleared = 10,
    DramIoQStatus = 11,
    StreamRestart = 12,
    StreamInfo = 13,
    StreamBufStatus = 14,
    EpochQEmpty = 15,
    StreamMiscInfo = 16,
}

impl NcriscEventType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::Epoch),
            2 => Some(Self::StreamHandlerLoop),
            3 => Some(Self::EpochEpilogue),
            4 => Some(Self::StreamHandlerInit),
            5 => Some(Self::EpochQSlotComplete),
            6 => Some(Self::WallClockTop32b),
            7 => Some(Self::DramReadIssued),
            8 => Some(Self::DramReadTileFlushed),
            9 => Some(Self::DramWriteSent),
            10 => Some(Self::DramWriteTilesCleared),
            11 => Some(Self::DramIoQStatus),
            12 => Some(Self::StreamRestart),
            13 => Some(Self::StreamInfo),
            14 => Some(Self::StreamBufStatus),
            15 => Some(Self::EpochQEmpty),
            16 => Some(Self::StreamMiscInfo),
            _ => None,
        }
    }

    /// Extract the type from the high byte of a raw NCRISC id.
    pub fn from_id(id: u32) -> Option<Self> {
        Self::from_u8(((id >> 24) & 0xff) as u8)
    }

    /// Description prefix. The clock pseudo-event has none.
    pub const fn label(self) -> Option<&'static str> {
        match self {
            Self::Epoch => Some("epoch"),
            Self::StreamHandlerLoop => Some("epoch-loop"),
            Self::EpochEpilogue => Some("epoch-epilogue"),
            Self::StreamHandlerInit => Some("epoch-prologue"),
            Self::EpochQSlotComplete => Some("epoch-q-slot-complete"),
            Self::WallClockTop32b => None,
            Self::DramReadIssued => Some("dram-read"),
            Self::DramReadTileFlushed => Some("dram-read-tile-flushed"),
            Self::DramWriteSent => Some("dram-write-sent"),
            Self::DramWriteTilesCleared => Some("dram-write-tile-cleared"),
            Self::DramIoQStatus => Some("dram-io-q-status"),
            Self::StreamRestart => Some("stream-restart"),
            Self::StreamInfo => Some("info"),
            Self::StreamBufStatus => Some("buffer-status"),
            Self::EpochQEmpty => Some("epoch-q-empty"),
            Self::StreamMiscInfo => Some("misc-info"),
        }
    }

    /// Number of words one record of this type occupies, id included.
    pub const fn words_per_record(self) -> usize {
        match self {
            Self::Epoch
            | Self::StreamHandlerLoop
            | Self::EpochEpilogue
            | Self::StreamHandlerInit
            | Self::StreamMiscInfo => 3,
            Self::StreamInfo => 7,
            _ => WORDS_PER_EVENT_NCRISC,
        }
    }

    /// Records carrying a full 64-bit timestamp as (lo, hi).
    pub const fn has_64b_timestamp(self) -> bool {
        matches!(
            self,
            Self::Epoch | Self::StreamHandlerLoop | Self::EpochEpilogue | Self::StreamHandlerInit
        )
    }
}

/// Event types recorded by the host runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum HostEventType {
    HwTilize = 1,
    SwTilize = 2,
    DeviceRuntime = 3,
    DeviceStartCycle = 4,
    DeviceEndCycle = 5,
    PipegenRuntime = 6,
    WaitForEpochComplete = 7,
    WaitForEpochUnaliased = 8,
    WaitForEpochQueuesReady = 9,
    WaitForQueueReady = 10,
    WaitForQueueReadyWc = 11,
    RunExecuteInstruction = 12,
    PushQueueSideEffects = 13,
    RunProgram = 14,
    GetUntilizedOutput = 15,
    GetTilizedOutput = 16,
    PopOutput = 17,
    QueueUpdateCommand = 18,
    QueueAllocateCommand = 19,
    SendEpochBinaries = 20,
    SendEpochCommands = 21,
    PerfPostprocessor = 22,
    DeviceStartCycleAligned = 23,
    DeviceEndCycleAligned = 24,
    DeviceEpochFirstUnpackLastPack = 25,
    LayoutBinaries = 26,
    QueueUpdateVarinst = 27,
    QueueCheckVarinst = 28,
    Custom = 29,
}

impl HostEventType {
    pub fn from_u8(v: u8) -> Option<Self> {
        use HostEventType::*;
        let t = match v {
            1 => HwTilize,
            2 => SwTilize,
            3 => DeviceRuntime,
            4 => DeviceStartCycle,
            5 => DeviceEndCycle,
            6 => PipegenRuntime,
            7 => WaitForEpochComplete,
            8 => WaitForEpochUnaliased,
            9 => WaitForEpochQueuesReady,
            10 => WaitForQueueReady,
            11 => WaitForQueueReadyWc,
            12 => RunExecuteInstruction,
            13 => PushQueueSideEffects,
            14 => RunProgram,
            15 => GetUntilizedOutput,
            16 => GetTilizedOutput,
            17 => PopOutput,
            18 => QueueUpdateCommand,
            19 => QueueAllocateCommand,
            20 => SendEpochBinaries,
            21 => SendEpochCommands,
            22 => PerfPostprocessor,
            23 => DeviceStartCycleAligned,
            24 => DeviceEndCycleAligned,
            25 => DeviceEpochFirstUnpackLastPack,
            26 => LayoutBinaries,
            27 => QueueUpdateVarinst,
            28 => QueueCheckVarinst,
            29 => Custom,
            _ => return None,
        };
        Some(t)
    }

    pub const fn label(self) -> &'static str {
        use HostEventType::*;
        match self {
            HwTilize => "push-input-hw-tilize",
            SwTilize => "push-input-sw-tilize",
            DeviceRuntime => "device-runtime",
            DeviceStartCycle => "device-start-cycle",
            DeviceEndCycle => "device-end-cycle",
            PipegenRuntime => "pipegen-runtime",
            WaitForEpochComplete => "wait-for-epoch-complete",
            WaitForEpochUnaliased => "wait-for-aliased-epoch-complete",
            WaitForEpochQueuesReady => "wait-for-epoch-command-queue-not-full",
            WaitForQueueReady => "wait-for-queue-not-full",
            WaitForQueueReadyWc => "wait-for-queue-wc-num-slots",
            RunExecuteInstruction => "run-execute-instruction",
            PushQueueSideEffects => "update-pending-queue-settings",
            RunProgram => "run-program",
            GetUntilizedOutput => "get-untilized-output-tensor-from-device",
            GetTilizedOutput => "get-tilized-output-tensor-from-device",
            PopOutput => "pop-output-tensor-from-device",
            QueueUpdateCommand => "send-queue-update-command",
            QueueAllocateCommand => "send-queue-allocate-command",
            SendEpochBinaries => "send-epoch-binary",
            SendEpochCommands => "send-epoch-command",
            PerfPostprocessor => "perf-postprocessor",
            DeviceStartCycleAligned => "device-start-cycle-aligned",
            DeviceEndCycleAligned => "device-end-cycle-aligned",
            DeviceEpochFirstUnpackLastPack => "device-epoch-first-unpack-last-pack",
            LayoutBinaries => "layout-binaries",
            QueueUpdateVarinst => "send-queue-update-varinst-command",
            QueueCheckVarinst => "check-queue-update-varinst-command",
            Custom => "",
        }
    }

    pub const fn is_single_value(self) -> bool {
        matches!(
            self,
            Self::DeviceStartCycle
                | Self::DeviceEndCycle
                | Self::DeviceStartCycleAligned
                | Self::DeviceEndCycleAligned
        )
    }

    /// Events whose description carries the device id.
    pub const fn has_device_suffix(self) -> bool {
        matches!(
            self,
            Self::DeviceStartCycle
                | Self::DeviceEndCycle
                | Self::DeviceStartCycleAligned
                | Self::DeviceEndCycleAligned
                | Self::DeviceRuntime
                | Self::WaitForEpochComplete
                | Self::DeviceEpochFirstUnpackLastPack
        )
    }
}

/// One recorded occurrence of an event id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub id: u64,
    pub description: String,
    pub first: Option<u64>,
    pub second: Option<u64>,
    /// Additional payload words (NCRISC stream info).
    pub extras: Vec<u32>,
}

impl Event {
    /// An event with only its first value observed.
    pub fn new(id: u64, description: impl Into<String>, first: u64) -> Self {
        Self {
            id,
            description: description.into(),
            first: Some(first),
            second: None,
            extras: Vec::new(),
        }
    }

    /// An event with both values observed.
    pub fn paired(id: u64, description: impl Into<String>, first: u64, second: u64) -> Self {
        Self {
            second: Some(second),
            ..Self::new(id, description, first)
        }
    }

    /// Second minus first, when both are present.
    pub fn diff(&self) -> Option<u64> {
        match (self.first, self.second) {
            (Some(first), Some(second)) => Some(second.wrapping_sub(first)),
            _ => None,
        }
    }
}

/// All events decoded from one thread's dump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadRecord {
    pub kind: ThreadKind,
    pub out_of_memory: bool,
    /// Events keyed by raw id, each list in recording order.
    pub events: BTreeMap<u64, Vec<Event>>,
}

impl ThreadRecord {
    pub fn new(kind: ThreadKind) -> Self {
        Self {
            kind,
            out_of_memory: false,
            events: BTreeMap::new(),
        }
    }

    /// Events recorded for `id`, or an empty slice.
    pub fn events_for(&self, id: u64) -> &[Event] {
        self.events.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Total number of recorded events across ids.
    pub fn num_events(&self) -> usize {
        self.events.values().map(Vec::len).sum()
    }
}
