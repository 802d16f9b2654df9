//! `native-player`: command-line front end for the native playback engine.
//!
//! Plays its locators back to back through the real output device, queueing each following
//! track as the next one so transitions are gapless, and prints status until the playlist
//! ends or Ctrl-C is pressed.

mod cli;

use std::collections::VecDeque;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use crossbeam_channel::{never, select, tick, unbounded};
use native_player::{Player, PlayerStatus, SUPPORTED_FORMATS, TrackMetadata};
use player_types::PlaybackState;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let args = cli::Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,native_player=info")),
        )
        .init();

    if args.list_devices {
        for name in native_player::list_output_devices()? {
            println!("{name}");
        }
        return Ok(());
    }

    match &args.cmd {
        Some(cli::Command::Formats) => {
            for ext in SUPPORTED_FORMATS {
                println!("{ext}");
            }
            Ok(())
        }
        Some(cli::Command::Play {
            locators,
            start,
            volume,
            json,
            status_interval_ms,
        }) => {
            let options = PlayOptions {
                start: cli::seconds(*start).context("--start")?,
                volume: *volume,
                json: *json,
                status_interval: Duration::from_millis(*status_interval_ms),
            };
            play_all(&args, locators, options)
        }
        None => anyhow::bail!("nothing to do; try `native-player play <FILE|URL>...`"),
    }
}

struct PlayOptions {
    start: Duration,
    volume: i32,
    json: bool,
    status_interval: Duration,
}

fn metadata_for(locator: &str) -> TrackMetadata {
    let name = locator
        .trim_end_matches('/')
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(locator);
    TrackMetadata {
        title: Some(name.to_string()),
        ..TrackMetadata::default()
    }
}

fn play_all(args: &cli::Args, locators: &[String], options: PlayOptions) -> Result<()> {
    let player = Player::new(args.player_config());
    player.init().context("init player")?;
    player.set_volume(options.volume);

    let (track_tx, track_rx) = unbounded::<()>();
    let (stopped_tx, stopped_rx) = unbounded::<()>();
    let (interrupt_tx, interrupt_rx) = unbounded::<()>();
    player.on_track_change(move || {
        let _ = track_tx.send(());
    });
    player.on_stopped(move || {
        let _ = stopped_tx.send(());
    });
    ctrlc::set_handler(move || {
        let _ = interrupt_tx.send(());
    })
    .context("install Ctrl-C handler")?;

    let mut queue: VecDeque<&String> = locators.iter().collect();
    let first = queue.pop_front().context("no locators")?;
    player
        .play(first, metadata_for(first), options.start)
        .with_context(|| format!("play {first}"))?;

    let status_ticks = if options.status_interval.is_zero() {
        never()
    } else {
        tick(options.status_interval)
    };

    loop {
        select! {
            recv(track_rx) -> _ => {
                if let Some(track) = player.current_track() {
                    tracing::info!(locator = %track.locator, "now playing");
                }
                if player.next_track().is_none() {
                    if let Some(next) = queue.pop_front() {
                        if let Err(e) = player.set_next(next, metadata_for(next)) {
                            tracing::warn!(locator = %next, error = %e, "could not queue next track");
                        }
                    }
                }
            }
            recv(stopped_rx) -> _ => {
                tracing::info!("playback stopped");
                break;
            }
            recv(interrupt_rx) -> _ => {
                tracing::info!("interrupted");
                break;
            }
            recv(status_ticks) -> _ => print_status(&player.status(), options.json)?,
        }
    }

    player.destroy().context("shut down player")?;
    Ok(())
}

fn print_status(status: &PlayerStatus, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(status)?);
        return Ok(());
    }
    if status.state == PlaybackState::Stopped {
        return Ok(());
    }
    let total = status
        .duration_ms
        .map(clock)
        .unwrap_or_else(|| "--:--".to_string());
    println!(
        "[{:?}] {} {}/{} vol {}%{} ({}/{})",
        status.state,
        status.now_playing.as_deref().unwrap_or("-"),
        clock(status.elapsed_ms),
        total,
        status.volume,
        if status.seeking { " seeking" } else { "" },
        status.playlist_pos + 1,
        status.playlist_len,
    );
    Ok(())
}

fn clock(ms: u64) -> String {
    let secs = ms / 1000;
    format!("{:02}:{:02}", secs / 60, secs % 60)
}
