#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

pub mod config;
pub mod dataset;
pub mod engine;
mod error;
mod io;
pub mod lookup;
pub mod output;
pub mod overwrite;
pub mod path;
pub mod provenance;
pub mod registry;
pub mod report;
pub mod step;

#[cfg(feature = "cli")]
pub mod cli;
#[cfg(feature = "logging")]
pub mod logging;

pub use crate::config::Config;
pub use crate::dataset::{Coords, Dataset, Filter, ItemState, Manifest, Source};
pub use crate::engine::{Apply, ApplyReport, Engine, Outcome, Produced, Serializer};
pub use crate::error::*;
pub use crate::output::{OutputManager, Saved, Table, Target};
pub use crate::overwrite::{AutoResponse, Decision, OverwriteMode, OverwritePolicy, Probe, Responder};
pub use crate::path::ArtifactId;
pub use crate::provenance::{Recorder, StepInfo};
pub use crate::registry::{OutputDescriptor, OutputRegistry, OutputSpec, Selection};
pub use crate::report::Report;
pub use crate::step::{Pipeline, PipelineBuilder, Step, StepContext};
