use std::time::Duration;

// ======= Connection heartbeat =======

/// How often the writer task sends a ping to its peer.
pub const PING_INTERVAL: Duration = Duration::from_secs(30);

/// A connection whose peer has been silent for this long is considered dead.
/// Refreshed by any inbound traffic, including pongs.
pub const READ_DEADLINE: Duration = Duration::from_secs(60);

/// Maximum time the writer will spend pushing a single frame into the socket.
pub const WRITE_WAIT: Duration = Duration::from_secs(10);

/// Bounded capacity of each connection's outbound frame queue. A full queue
/// surfaces as a backpressure error to the component trying to send.
pub const OUTBOUND_QUEUE_SIZE: usize = 64;

// ======= Ceremony timeouts =======

/// Outer deadline from keygen session creation to a terminal state.
pub const KEYGEN_SESSION_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Outer deadline from sign session creation to a terminal state.
pub const SIGN_SESSION_TIMEOUT: Duration = Duration::from_secs(2 * 60);

/// Terminal sessions linger in the live store for this long so that late
/// out-of-order frames still resolve to a useful error.
pub const SESSION_EVICTION_GRACE: Duration = Duration::from_secs(30);

// ======= Connection hub =======

/// Period of the sweep that evicts connections already marked closed.
pub const HUB_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

// ======= Helper process supervision =======

/// After an interrupt, how long to wait for the helper to exit before
/// escalating to a kill.
pub const HELPER_STOP_ESCALATION: Duration = Duration::from_secs(5);

// ======= Settings environment variables =======

/// Base path for all configuration files.
pub const CONFIG_ROOT: &str = "CE_CONFIG_ROOT";
pub const DEFAULT_CONFIG_ROOT: &str = "/etc/custody-engine";
