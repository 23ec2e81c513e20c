pub mod config;
pub mod ffmpeg;
pub mod logging;
