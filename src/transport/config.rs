use std::time::Duration;

/// Default deadline for a correlated request that did not set its own.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(2000); // 2 seconds
/// Default time allowed for a TCP dial to complete.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(2000);
/// Frames larger than this are treated as a malformed stream.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone)]
/// Transport configurations
pub struct Config {
    /// Deadline used by [super::Transport::request].
    ///
    /// Defaults to [DEFAULT_REQUEST_TIMEOUT]
    pub request_timeout: Duration,
    /// Largest accepted inbound frame, in bytes.
    ///
    /// A peer announcing a bigger frame gets its connection torn down.
    ///
    /// Defaults to [DEFAULT_MAX_FRAME_SIZE]
    pub max_frame_size: usize,
    /// How long [super::Transport::connect] waits for each resolved address.
    ///
    /// Defaults to [DEFAULT_CONNECT_TIMEOUT]
    pub connect_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}
