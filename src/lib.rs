//! Core library for music-track-enricher
pub mod api;
pub mod checkpoint;
pub mod config;
pub mod db;
pub mod dedup;
pub mod export;
pub mod fetcher;
pub mod merge;
pub mod models;
pub mod scheduler;
