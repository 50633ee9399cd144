//! Miniature FLE toolchain library.
//!
//! This library provides the core components for the `fld` linker and
//! loader. It is organized into several modules:
//! - `config`: CLI configuration.
//! - `object`: the shared FLE object model.
//! - `arch`: architecture-specific relocation arithmetic and stubs.
//! - `resolver`: global symbol table construction.
//! - `layout`: section merging and address assignment.
//! - `pic`: indirection-table and call-stub allocation.
//! - `linker`: link orchestration.
//! - `loader`: module loading, load-time relocation, execution.
//! - `mem`: the raw memory-mapping boundary.
//! - `format`: on-disk representation and dependency search.
//! - `nm`: symbol-table dump view.

pub mod arch;
pub mod config;
pub mod format;
pub mod layout;
pub mod linker;
pub mod loader;
pub mod mem;
pub mod nm;
pub mod object;
pub mod pic;
pub mod resolver;
pub mod utils;
