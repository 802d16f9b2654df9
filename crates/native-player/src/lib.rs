//! Native audio playback engine.
//!
//! Opens local files or HTTP URLs, decodes them to interleaved s16le PCM and renders them
//! through CPAL, with gapless advance to a queued next track, debounced seeking and
//! wall-clock elapsed time. [`Player`] is the entry point.

pub mod clock;
pub mod config;
pub mod decode;
pub mod device;
pub mod engine;
pub mod error;
pub mod http_stream;
mod monitor;
pub mod output;
pub mod pcm;
pub mod playback;
pub mod player;
pub mod progressive;
pub mod queue;
pub mod resample;
pub mod source;

pub use config::{HttpConfig, HttpStrategy, OutputConfig, PlayerConfig};
pub use decode::{Decoder, MediaOpener, SUPPORTED_FORMATS, is_format_supported};
pub use device::list_output_devices;
pub use error::{PlayerError, Result};
pub use player::{Player, Track};
pub use player_types::{PlaybackState, PlayerStatus, TrackMetadata};
