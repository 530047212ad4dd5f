//! Core library for edittool: model definitions, panel binding and form
//! option merging, the page hierarchy and chooser-root resolution, and the
//! sqlite-backed page index.

pub mod cache;
pub mod config;
pub mod hierarchy;
pub mod migrate;
pub mod model;
pub mod options;
pub mod panel;
pub mod runtime;
pub mod store;
