//! WebSocket close codes with meaning to the client

/// Normal closure; never reconnect
pub const CLOSE_NORMAL: u16 = 1000;

/// No close code was present in the close frame
pub const CLOSE_NO_STATUS: u16 = 1005;

/// Connection dropped without a close frame; treated as server down
pub const CLOSE_ABNORMAL: u16 = 1006;

/// Server rejected the token
pub const CLOSE_AUTH_FAILED: u16 = 4001;

/// Server reports the token expired
pub const CLOSE_TOKEN_EXPIRED: u16 = 4003;

/// How the client reacts to a close code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseDisposition {
    /// Closed on purpose, stay closed
    Normal,
    /// Likely server down, wait for a manual reconnect
    Abnormal,
    /// Refresh the token and reconnect right away
    AuthRejected,
    /// Reconnect with backoff
    Retry,
}

impl CloseDisposition {
    /// Classify a close code
    pub fn of(code: u16) -> Self {
        match code {
            CLOSE_NORMAL => CloseDisposition::Normal,
            CLOSE_ABNORMAL => CloseDisposition::Abnormal,
            CLOSE_AUTH_FAILED | CLOSE_TOKEN_EXPIRED => CloseDisposition::AuthRejected,
            _ => CloseDisposition::Retry,
        }
    }
}

/// Details of a closed connection, passed to disconnect hooks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    pub code: u16,
    pub reason: String,
}

impl CloseInfo {
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    pub fn disposition(&self) -> CloseDisposition {
        CloseDisposition::of(self.code)
    }
}
