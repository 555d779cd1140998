//! Embeds a CPython runtime that the launcher was never compiled against.
//!
//! The runtime library is opened at run time and bound into a function-pointer
//! table ([`binder`]). Every other module only talks to the runtime through the
//! [`PythonApi`] capability trait, which the bound library implements and which
//! tests replace with recording fakes. [`launch::execute`] drives the whole
//! sequence for one [`HostContext`]:
//!
//! bind library, pre-initialize, populate `PyConfig`, initialize, import
//! bootstrap modules, install module collections, run entry scripts, finalize,
//! unload.

#![allow(clippy::missing_safety_doc)]

pub mod api;
pub mod binder;
pub mod bootstrap;
pub mod config;
pub mod context;
pub mod ffi;
pub mod launch;
pub mod lifecycle;
pub mod options;
pub mod scripts;

pub use api::PythonApi;
pub use binder::{
    candidate_library_names, BindError, BoundLibrary, PythonSymbols, SymbolSource,
    REQUIRED_SYMBOLS,
};
pub use context::HostContext;
pub use launch::{execute, DynamicLoader, PythonLoader};
pub use lifecycle::{Lifecycle, LifecycleState, StartupConfig};
pub use options::{BootOptions, RuntimeOptions};
