pub mod audio;
pub mod config;
pub mod database;
pub mod error;
pub mod features;
pub mod model;
pub mod pipeline;
pub mod preprocess;
pub mod quarantine;
pub mod scoring;
pub mod transcription;
