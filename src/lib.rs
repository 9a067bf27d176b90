//! Image prefetching pipeline for a scrolling photo grid.
//!
//! The grid coordinator starts image requests ahead of display, cell
//! presenters reuse those requests when they were made for the right size,
//! and library changes are turned into batched grid updates.

pub mod app;
pub mod collections;
pub mod config;
pub mod delivery;
pub mod error;
pub mod geometry;
pub mod grid;
pub mod imaging;
pub mod library;
pub mod memory;
pub mod models;

pub use config::GalleryConfig;
pub use error::{GalleryError, GalleryResult, ImageError};
