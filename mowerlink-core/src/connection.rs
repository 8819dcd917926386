//! Connection state machine for the mower BLE link.
//!
//! Pure state tracking with no I/O. The host drives the transitions as the
//! GATT operations complete:
//!
//! ```text
//! Disconnected ──► Scanning ──► Connecting ──► ServiceDiscovery ──► Ready
//!      ▲               │             │                 │              │
//!      └───────────────┴─────────────┴─────────────────┴──────────────┘
//!                      failure / disconnect
//! ```
//!
//! There is no automatic reconnection. Every failure returns to
//! `Disconnected` and the caller decides whether to try again.
//!
//! # Usage
//!
//! ```rust
//! use mowerlink_core::connection::{ConnectionState, ConnectionTracker};
//!
//! let mut conn = ConnectionTracker::new();
//! assert!(conn.start_scanning(0));
//! conn.device_selected(10);
//! conn.gatt_connected(20);
//! conn.ready(30);
//! assert_eq!(conn.state(), ConnectionState::Ready);
//! ```

use serde::{Deserialize, Serialize};

// =============================================================================
// Connection State
// =============================================================================

/// Lifecycle of the single BLE connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No link, no attempt in progress
    #[default]
    Disconnected,
    /// Waiting for a device matching the filter
    Scanning,
    /// GATT connect in progress
    Connecting,
    /// Looking up service and characteristics, subscribing
    ServiceDiscovery,
    /// Subscribed and able to write commands
    Ready,
}

impl ConnectionState {
    /// Check if commands may be written
    pub fn can_send(&self) -> bool {
        matches!(self, ConnectionState::Ready)
    }

    /// Check if a connection attempt is in progress
    pub fn is_connecting(&self) -> bool {
        matches!(
            self,
            ConnectionState::Scanning
                | ConnectionState::Connecting
                | ConnectionState::ServiceDiscovery
        )
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "Disconnected"),
            ConnectionState::Scanning => write!(f, "Scanning"),
            ConnectionState::Connecting => write!(f, "Connecting"),
            ConnectionState::ServiceDiscovery => write!(f, "Service Discovery"),
            ConnectionState::Ready => write!(f, "Ready"),
        }
    }
}

/// Snapshot for status displays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub failure_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub notifications: u64,
}

// =============================================================================
// Connection Tracker
// =============================================================================

/// Tracks connection state, failures and notification activity.
#[derive(Debug, Clone, Default)]
pub struct ConnectionTracker {
    state: ConnectionState,
    /// Failures since the last successful connection
    failure_count: u32,
    last_error: Option<String>,
    /// Timestamp of last state change (ms)
    last_state_change_ms: u64,
    /// Timestamp of the last notification (0 = none yet)
    last_data_ms: u64,
    notifications: u64,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn notifications(&self) -> u64 {
        self.notifications
    }

    pub fn can_send(&self) -> bool {
        self.state.can_send()
    }

    pub fn is_connecting(&self) -> bool {
        self.state.is_connecting()
    }

    pub fn status(&self) -> ConnectionStatus {
        ConnectionStatus {
            state: self.state,
            failure_count: self.failure_count,
            last_error: self.last_error.clone(),
            notifications: self.notifications,
        }
    }

    /// Calculate time since last state change.
    pub fn time_in_state_ms(&self, current_time_ms: u64) -> u64 {
        current_time_ms.saturating_sub(self.last_state_change_ms)
    }

    /// Calculate time since the last notification.
    pub fn time_since_data_ms(&self, current_time_ms: u64) -> u64 {
        if self.notifications == 0 {
            u64::MAX
        } else {
            current_time_ms.saturating_sub(self.last_data_ms)
        }
    }

    // -------------------------------------------------------------------------
    // State Transitions
    // -------------------------------------------------------------------------

    /// Begin a connection attempt.
    ///
    /// Returns `false` (and changes nothing) unless currently disconnected.
    pub fn start_scanning(&mut self, current_time_ms: u64) -> bool {
        if self.state != ConnectionState::Disconnected {
            return false;
        }
        self.set_state(ConnectionState::Scanning, current_time_ms);
        true
    }

    /// A device matching the filter was chosen.
    pub fn device_selected(&mut self, current_time_ms: u64) {
        if self.state == ConnectionState::Scanning {
            self.set_state(ConnectionState::Connecting, current_time_ms);
        }
    }

    /// GATT server connection established.
    pub fn gatt_connected(&mut self, current_time_ms: u64) {
        if self.state == ConnectionState::Connecting {
            self.set_state(ConnectionState::ServiceDiscovery, current_time_ms);
        }
    }

    /// Characteristics found and notifications enabled.
    pub fn ready(&mut self, current_time_ms: u64) {
        if self.state == ConnectionState::ServiceDiscovery {
            self.set_state(ConnectionState::Ready, current_time_ms);
            self.failure_count = 0;
            self.last_error = None;
        }
    }

    /// Record a notification.
    pub fn data_received(&mut self, current_time_ms: u64) {
        if self.state == ConnectionState::Ready {
            self.last_data_ms = current_time_ms;
            self.notifications = self.notifications.saturating_add(1);
        }
    }

    /// A step failed. Returns to `Disconnected` from any state.
    pub fn failed(&mut self, reason: impl Into<String>, current_time_ms: u64) {
        self.set_state(ConnectionState::Disconnected, current_time_ms);
        self.failure_count = self.failure_count.saturating_add(1);
        self.last_error = Some(reason.into());
    }

    /// Explicit or GATT-level disconnect.
    pub fn disconnected(&mut self, current_time_ms: u64) {
        self.set_state(ConnectionState::Disconnected, current_time_ms);
    }

    fn set_state(&mut self, new_state: ConnectionState, current_time_ms: u64) {
        if self.state != new_state {
            self.state = new_state;
            self.last_state_change_ms = current_time_ms;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
