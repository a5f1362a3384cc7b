//! # mutrace
//!
//! `mutrace` localizes faults from mutation and execution traces:
//! - `trace`: captured executions (locations, steps, bounded traces)
//! - `pipeline`: candidate selection, mutant generation and execution, trace alignment,
//!   divergence simulation and the resumable trial ledger
//!
//! Parsing, compiling and running the analysed program are left to collaborators
//! (`pipeline::collaborators`); the crate ships filesystem and process adapters for them.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs)]

pub mod pipeline;
pub mod trace;
