use std::time::Duration;

/// How remote (`http://`/`https://`) locators are turned into byte sources.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum HttpStrategy {
    /// Probe with `HEAD`, then stream with `Range: bytes=N-` requests; seeking reconnects.
    #[default]
    Range,
    /// One plain `GET` buffered in memory; seeking is limited to what has arrived.
    Progressive,
}

/// Network tuning for remote byte sources.
#[derive(Clone, Debug)]
pub struct HttpConfig {
    pub strategy: HttpStrategy,
    /// TCP/TLS connect timeout.
    pub connect_timeout: Duration,
    /// Time allowed for response headers to arrive.
    pub response_timeout: Duration,
    /// Bytes read per background chunk by the progressive source.
    pub chunk_size: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            strategy: HttpStrategy::Range,
            connect_timeout: Duration::from_secs(10),
            response_timeout: Duration::from_secs(10),
            chunk_size: 32 * 1024,
        }
    }
}

/// Output stage tuning (device selection, queueing, resampling).
#[derive(Clone, Debug)]
pub struct OutputConfig {
    /// Case-insensitive substring of the output device name; `None` selects the default device.
    pub device: Option<String>,
    /// Target duration of the queue between the PCM feeder and the device callback.
    pub buffer_seconds: f32,
    /// Resampler input chunk size in frames (also the feeder read size).
    pub chunk_frames: usize,
    /// Max frames pulled per output callback refill.
    pub refill_max_frames: usize,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            device: None,
            buffer_seconds: 2.0,
            chunk_frames: 1024,
            refill_max_frames: 4096,
        }
    }
}

/// Top-level player configuration.
#[derive(Clone, Debug)]
pub struct PlayerConfig {
    /// Monitor loop tick.
    pub poll_interval: Duration,
    /// How long the seeking flag stays raised after a seek request.
    pub seek_debounce: Duration,
    pub http: HttpConfig,
    pub output: OutputConfig,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            seek_debounce: Duration::from_millis(100),
            http: HttpConfig::default(),
            output: OutputConfig::default(),
        }
    }
}
