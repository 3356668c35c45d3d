//! NoteScan - sticky note photo digitization
//!
//! Turns a photo of one or more handwritten notes into structured records:
//! text, titles, lists, to-dos, tags, decoded codes, colors and a
//! confidence score per note.
//!
//! ```no_run
//! use notescan::capture::frame::ImageFormat;
//! use notescan::config::PipelineConfig;
//! use notescan::pipeline::{Pipeline, ProcessingRequest};
//!
//! # async fn run(bytes: Vec<u8>) -> notescan::error::Result<()> {
//! let pipeline = Pipeline::from_config(PipelineConfig::default())?;
//! let output = pipeline
//!     .process(ProcessingRequest::new(bytes, ImageFormat::Jpeg))
//!     .await;
//! println!("{} notes", output.summary.total_notes);
//! # Ok(())
//! # }
//! ```

pub mod analysis;
pub mod capture;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod shared;
pub mod vision;
