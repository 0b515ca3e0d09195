pub mod cache;
pub mod categories;
pub mod config;
pub mod crossref;
pub mod edits;
pub mod error;
pub mod handlers;
pub mod pipeline;
pub mod section;
pub mod service;
pub mod template;
