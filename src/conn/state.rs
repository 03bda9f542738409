//! Socket state machine states.

/// DCCP socket states (RFC 4340 §8). Data transfer is allowed in OPEN and
/// PARTOPEN.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Closed,
    Listen,
    Request,
    Respond,
    PartOpen,
    Open,
    CloseReq,
    Closing,
    TimeWait,
}

impl SocketState {
    /// States in which the write pipeline serves application data.
    pub fn data_transfer_allowed(self) -> bool {
        matches!(self, SocketState::Open | SocketState::PartOpen)
    }
}

impl std::fmt::Display for SocketState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SocketState::Closed => "CLOSED",
            SocketState::Listen => "LISTEN",
            SocketState::Request => "REQUEST",
            SocketState::Respond => "RESPOND",
            SocketState::PartOpen => "PARTOPEN",
            SocketState::Open => "OPEN",
            SocketState::CloseReq => "CLOSEREQ",
            SocketState::Closing => "CLOSING",
            SocketState::TimeWait => "TIMEWAIT",
        };
        f.write_str(name)
    }
}
