//! Plays a synthesized click track and prints beats as the clock sees them.
//!
//! Run with `cargo run --example click_track`. Set `RUST_LOG=debug` to see
//! scheduling and drift-correction logs.

use anyhow::{Context, Result};
use beatsync::{
    AudioClip, BeatSequence, BeatSequencer, EngineDesc, Song, SongClock, SongClockConfig,
    SongClockEngine, SongClockEvent,
};
use std::time::{Duration, Instant};

const SAMPLE_RATE: u32 = 48000;
const BPM: f32 = 120.0;
const BARS: usize = 8;

/// Mono click on every beat, accented on the downbeat
fn click_track(bpm: f32, bars: usize) -> Result<AudioClip> {
    let beat_frames = (60.0 / bpm * SAMPLE_RATE as f32) as usize;
    let click_frames = SAMPLE_RATE as usize / 50;
    let mut samples = vec![0.0f32; beat_frames * 4 * bars];

    for beat in 0..4 * bars {
        let frequency = if beat % 4 == 0 { 1760.0 } else { 880.0 };
        let start = beat * beat_frames;
        for i in 0..click_frames {
            let t = i as f32 / SAMPLE_RATE as f32;
            let envelope = 1.0 - i as f32 / click_frames as f32;
            samples[start + i] = (t * frequency * std::f32::consts::TAU).sin() * envelope * 0.5;
        }
    }

    Ok(AudioClip::new(samples, SAMPLE_RATE, 1)?)
}

fn main() -> Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    // One bar of quarter notes
    let quarters = BeatSequence::new(4, 1, 0.25)?.with_hits(0, &[0, 1, 2, 3])?;
    let song = Song::new(BPM)
        .with_clip(click_track(BPM, BARS)?)
        .looping(true)
        .with_sequences(vec![quarters]);
    let mut sequencer = BeatSequencer::from_song(&song)?;

    let mut clock = SongClock::new(SongClockConfig::default().pre_roll(1.0))?;
    clock.set_song(song)?;

    let tap = clock.audio_tap().context("audio tap already taken")?;
    let mut engine = SongClockEngine::new(EngineDesc::new().sample_rate(SAMPLE_RATE), tap)?;
    clock.set_backend(Box::new(engine.backend()));
    engine.start()?;

    clock.on_started(|| println!("Song started"));
    clock.init_time(0.0)?;
    clock.play()?;

    let origin = Instant::now();
    let mut last = 0.0;
    while clock.loop_count() < 2 {
        let now = origin.elapsed().as_secs_f64();
        clock.step(now, now - last);
        last = now;

        for event in clock.poll_events() {
            sequencer.handle_event(&event, &clock);
            match event {
                SongClockEvent::Looped { loop_count } => println!("Loop {}", loop_count),
                SongClockEvent::BpmChanged { bpm, time } => {
                    println!("Tempo {} at {:.2}s", bpm, time)
                }
                _ => {}
            }
        }

        for _ in sequencer.update(&clock) {
            println!(
                "Beat at {:.3}s (bpm {}, frames {})",
                clock.current_audio_time(),
                clock.current_bpm(),
                engine.frames_processed()
            );
        }

        std::thread::sleep(Duration::from_millis(16));
    }

    clock.stop();
    engine.stop()?;
    Ok(())
}
