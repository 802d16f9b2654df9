use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use native_player::{HttpConfig, HttpStrategy, OutputConfig, PlayerConfig};

const VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("GIT_SHA"),
    ", ",
    env!("BUILD_DATE"),
    ")"
);

#[derive(Parser, Debug)]
#[command(name = "native-player", version = VERSION)]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Option<Command>,

    /// List output devices and exit
    #[arg(long)]
    pub list_devices: bool,

    /// Use a specific output device by substring match
    #[arg(long)]
    pub device: Option<String>,

    /// Resampler input chunk size in frames (higher => more latency, lower => more overhead)
    #[arg(long, default_value_t = 1024)]
    pub chunk_frames: usize,

    /// Playback callback refill cap (frames). Larger reduces lock churn but can add latency.
    #[arg(long, default_value_t = 4096)]
    pub refill_max_frames: usize,

    /// Output queue target in seconds
    #[arg(long, default_value_t = 2.0)]
    pub buffer_seconds: f32,

    /// How HTTP(S) locators are fetched
    #[arg(long, value_enum, default_value_t = HttpMode::Range)]
    pub http: HttpMode,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum HttpMode {
    /// Ranged requests; seeks reconnect at the target offset
    Range,
    /// One buffered GET; seeks only within what has arrived
    Progressive,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Play files or URLs back to back, gaplessly
    Play {
        /// Local paths or http(s) URLs
        #[arg(required = true)]
        locators: Vec<String>,

        /// Start offset into the first track, in seconds
        #[arg(long, default_value_t = 0.0)]
        start: f64,

        /// Output volume, 0-100
        #[arg(long, default_value_t = 100)]
        volume: i32,

        /// Print status snapshots as JSON lines
        #[arg(long)]
        json: bool,

        /// Status print interval in milliseconds (0 disables)
        #[arg(long, default_value_t = 1000)]
        status_interval_ms: u64,
    },

    /// Print the container formats the decoder understands
    Formats,
}

impl Args {
    pub fn player_config(&self) -> PlayerConfig {
        PlayerConfig {
            http: HttpConfig {
                strategy: match self.http {
                    HttpMode::Range => HttpStrategy::Range,
                    HttpMode::Progressive => HttpStrategy::Progressive,
                },
                ..HttpConfig::default()
            },
            output: OutputConfig {
                device: self.device.clone(),
                buffer_seconds: self.buffer_seconds,
                chunk_frames: self.chunk_frames,
                refill_max_frames: self.refill_max_frames,
            },
            ..PlayerConfig::default()
        }
    }
}

/// Parse a non-negative seconds value.
pub fn seconds(value: f64) -> anyhow::Result<Duration> {
    if !value.is_finite() || value < 0.0 {
        anyhow::bail!("expected a non-negative number of seconds, got {value}");
    }
    Ok(Duration::try_from_secs_f64(value)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn play_flags_map_onto_config() {
        let args = Args::try_parse_from([
            "native-player",
            "--device",
            "usb",
            "--http",
            "progressive",
            "--chunk-frames",
            "512",
            "play",
            "a.flac",
            "http://host/b.mp3",
            "--start",
            "12.5",
            "--json",
        ])
        .unwrap();
        let config = args.player_config();
        assert_eq!(config.http.strategy, HttpStrategy::Progressive);
        assert_eq!(config.output.device.as_deref(), Some("usb"));
        assert_eq!(config.output.chunk_frames, 512);
        match args.cmd {
            Some(Command::Play {
                locators,
                start,
                json,
                volume,
                ..
            }) => {
                assert_eq!(locators, vec!["a.flac", "http://host/b.mp3"]);
                assert_eq!(start, 12.5);
                assert!(json);
                assert_eq!(volume, 100);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn play_requires_a_locator() {
        assert!(Args::try_parse_from(["native-player", "play"]).is_err());
    }

    #[test]
    fn list_devices_needs_no_subcommand() {
        let args = Args::try_parse_from(["native-player", "--list-devices"]).unwrap();
        assert!(args.list_devices);
        assert!(args.cmd.is_none());
    }

    #[test]
    fn seconds_rejects_negative_and_nan() {
        assert_eq!(seconds(1.5).unwrap(), Duration::from_millis(1500));
        assert!(seconds(-1.0).is_err());
        assert!(seconds(f64::NAN).is_err());
    }
}
