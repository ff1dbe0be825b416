//! Error types for beatsync

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SongClockError {
    #[error("Time has not been initialized, call init_time() before {0}()")]
    NotInitialized(&'static str),

    #[error("No song set, call set_song() first")]
    NoSong,

    #[error("No audio clip set for the song")]
    NoClip,

    #[error("Invalid song: {0}")]
    InvalidSong(String),

    #[error("Audio device error: {0}")]
    AudioDevice(String),

    #[error("Audio format error: {0}")]
    AudioFormat(String),

    #[error("Engine error: {0}")]
    Engine(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

pub type Result<T> = std::result::Result<T, SongClockError>;
