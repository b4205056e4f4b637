#![doc = include_str!("../README.md")]
#![warn(rustdoc::all)]
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![deny(unused_must_use, rust_2018_idioms)]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

#[macro_use]
extern crate tracing;

pub mod context;
pub mod digest;
pub mod error;
pub mod manager;
pub mod output_stream;
pub mod path_set;
pub mod path_utils;
pub mod resolver;
pub mod state;

pub use context::BuildContext;
pub use digest::Digester;
pub use error::{EngineError, IoError, Result};
pub use manager::{Manager, ManagerHooks, NullHooks};
pub use output_stream::IncrementalOutputStream;
pub use path_set::PathSet;
pub use resolver::{OutputScan, ResolvedInputs};
pub use state::{FileState, InputRecord, Message, Severity};

/// Utilities for creating and tearing down temporary project trees in tests.
#[cfg(feature = "project-util")]
pub mod project_util;
