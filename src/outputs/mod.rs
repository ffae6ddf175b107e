//! Output generation for run artifacts.
//!
//! - [`json`]: writes a [`JobReport`](crate::models::JobReport) per run
//!
//! # Output Structure
//!
//! ```text
//! report_dir/
//! ├── 2025-05-06/
//! │   ├── categorize_morning.json
//! │   ├── summarize_afternoon.json
//! │   └── extract_evening.json
//! ```

pub mod json;
