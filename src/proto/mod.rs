pub mod frame;
pub mod records;

/// Arbitrary but fixed API version returned by GETVERSION. The exact value
/// is opaque to the host protocol as long as both sides agree on it.
pub const API_VERSION: u32 = 1;

/// The control channel's fixed numeric message-type registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
#[non_exhaustive]
pub enum MsgType {
    Ack = 0,
    Error = 1,
    Ready = 2,
    GetVersion = 3,
    StartPod = 4,
    GetPod = 5,
    StopPod = 6,
    DestroyPod = 7,
    ExecCmd = 8,
    NewContainer = 9,
    KillContainer = 10,
    RemoveContainer = 11,
    WriteFile = 12,
    ReadFile = 13,
    WinSize = 14,
    Ping = 15,
    OnlineCpuMem = 16,
    SetupInterface = 17,
    SetupRoute = 18,
}

impl MsgType {
    pub fn from_u32(v: u32) -> Option<Self> {
        use MsgType::*;
        Some(match v {
            0 => Ack,
            1 => Error,
            2 => Ready,
            3 => GetVersion,
            4 => StartPod,
            5 => GetPod,
            6 => StopPod,
            7 => DestroyPod,
            8 => ExecCmd,
            9 => NewContainer,
            10 => KillContainer,
            11 => RemoveContainer,
            12 => WriteFile,
            13 => ReadFile,
            14 => WinSize,
            15 => Ping,
            16 => OnlineCpuMem,
            17 => SetupInterface,
            18 => SetupRoute,
            _ => return None,
        })
    }
}
