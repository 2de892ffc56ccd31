//! Core engine for tracking externally stored wiki content blobs.
//!
//! The local wiki database lives in SQLite, and each external storage
//! cluster is a further SQLite database holding a `blobs` table. This crate
//! rebuilds the derived `blob_tracking` index from revision and text
//! pointers, flags orphaned blobs, backfills content-model columns on
//! legacy rows, recounts categories, and untangles double redirects.
//! The `blobtrack` binary crate is a thin CLI over these entry points.

pub mod address;
pub mod bitmap;
pub mod cache;
pub mod category;
pub mod config;
pub mod content_model;
pub mod error;
pub mod maintenance;
pub mod redirects;
pub mod runtime;
pub mod store;
pub mod tracking;

pub use address::BlobAddress;
pub use bitmap::BlobBitmap;
pub use error::StoreError;
