pub mod api;
pub mod app;
pub mod cleanup;
pub mod cli;
pub mod config;
pub mod control;
pub mod correlation;
pub mod db;
pub mod dispatch;
pub mod flags;
pub mod global;
pub mod pbx;
pub mod provider;
pub mod spy;
pub mod storage;
pub mod transcription;

#[cfg(test)]
pub mod testing;
