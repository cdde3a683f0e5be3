//! Field-aware compression engine for variant-call datasets.
//!
//! The archive model is a set of named streams of compressed parts.
//! Ingestion appends typed per-variant values into per-field buffers;
//! sealed buffers become packages that a worker pool routes through
//! type-specialised encoders (integer, real, flag, text, genotype
//! matrix). At close, an optimiser detects inter-field redundancy and
//! stores some fields as links or small functions of others. Reading
//! mirrors all of this in reverse.
//!
//! The top-level entry point is [`cfile::CompressedFile`]; VCF/BCF
//! parsing, CLI and configuration live with the caller.

pub mod archive;
pub mod buffer;
pub mod cfile;
pub mod context;
pub mod entropy;
pub mod graph_opt;
pub mod gt;
pub mod params;
pub mod pbwt;
pub mod queue;
pub mod rangecoder;
pub mod text_pp;
pub mod variant;

pub use cfile::CompressedFile;
pub use params::Params;
pub use variant::{FieldValue, KeyDesc, KeyDim, KeyKind, VariantDesc, INT_MISSING};
