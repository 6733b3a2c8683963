use std::time::Duration;

use crate::error::RudpError;

/// Tuning knobs for a transport, applied to every connection it creates.
#[derive(Debug, Clone)]
pub struct RudpConfig {
    /// Interval at which the INIT packet is retransmitted while the handshake
    ///  is in progress.
    pub connect_interval: Duration,

    /// Deadline for the handshake: once it passes, handshake retransmissions
    ///  stop. The connection itself is reaped later by the inactivity timeout.
    pub connect_timeout: Duration,

    /// How long a connection may go without receiving any valid packet before
    ///  it is closed with `DisconnectReason::Timeout`.
    pub connection_timeout: Duration,

    /// PING emission period on an established connection.
    pub keep_alive_ping_time: Duration,

    /// Total number of times a reliable packet is put on the wire (the initial
    ///  send counts) before the send is silently abandoned.
    pub max_retries: u32,

    /// Retransmission period for unacknowledged reliable packets.
    pub retry_interval: Duration,

    /// When false, reliable packets are delivered in arrival order, bypassing
    ///  the reorder buffer and the duplicate check. They are still ACKed.
    pub use_ordering: bool,

    /// When set, an unexpected receive-loop error terminates the process
    ///  instead of being logged and skipped.
    pub exit_on_receive_exception: bool,
}

impl Default for RudpConfig {
    fn default() -> RudpConfig {
        RudpConfig {
            connect_interval: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(10),
            connection_timeout: Duration::from_secs(40),
            keep_alive_ping_time: Duration::from_secs(15),
            max_retries: 10,
            retry_interval: Duration::from_millis(500),
            use_ordering: true,
            exit_on_receive_exception: false,
        }
    }
}

impl RudpConfig {
    pub fn validate(&self) -> Result<(), RudpError> {
        if self.max_retries == 0 {
            return Err(RudpError::InvalidConfig(
                "max_retries must be at least 1".to_string(),
            ));
        }
        if self.retry_interval.is_zero()
            || self.connect_interval.is_zero()
            || self.keep_alive_ping_time.is_zero()
        {
            return Err(RudpError::InvalidConfig(
                "intervals must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}
