use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle of a connection
///
/// ```text
/// PreConnect ──► Connected ──► Closing ──► Closed
///     │  │           │            │          ▲
///     │  └─► Closing │            ▼          │
///     │              └────────► Broken ──────┘
///     └──────────────────────────────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionStatus {
    /// Created, transport not yet established
    PreConnect,
    /// Established and usable
    Connected,
    /// Close requested, draining queued sends
    Closing,
    /// Failed with an I/O error, awaiting close
    Broken,
    /// Final state
    Closed,
}

impl ConnectionStatus {
    /// Whether moving from `self` to `next` is a legal transition
    pub fn can_transition_to(self, next: ConnectionStatus) -> bool {
        use ConnectionStatus::*;
        matches!(
            (self, next),
            (PreConnect, Connected)
                | (PreConnect, Closing)
                | (PreConnect, Closed)
                | (Connected, Closing)
                | (Connected, Broken)
                | (Connected, Closed)
                | (Closing, Broken)
                | (Closing, Closed)
                | (Broken, Closed)
        )
    }

    /// Whether the connection still accepts new writes
    pub fn accepts_writes(self) -> bool {
        matches!(self, ConnectionStatus::PreConnect | ConnectionStatus::Connected)
    }

    /// Whether the connection has reached a terminal or failed state
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionStatus::Broken | ConnectionStatus::Closed)
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionStatus::PreConnect => "PRE_CONNECT",
            ConnectionStatus::Connected => "CONNECTED",
            ConnectionStatus::Closing => "CLOSING",
            ConnectionStatus::Broken => "BROKEN",
            ConnectionStatus::Closed => "CLOSED",
        };
        f.write_str(s)
    }
}
