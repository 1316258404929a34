//! Offline call screening: record or load call audio, transcribe it with whisper.cpp,
//! score the transcript for spam and keep a durable log of every call.

pub mod core;
