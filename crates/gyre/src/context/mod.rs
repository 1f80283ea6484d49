//! Context management: budget accounting, window assembly, and history
//! compression.
//!
//! The pieces compose in one direction: a [`TokenCounter`](budget::TokenCounter)
//! turns content into token estimates, the [`ContextAssembler`](assembler::ContextAssembler)
//! spends a [`Budget`](budget::Budget) on prioritized blocks, and the
//! [`CompressionManager`](compression::CompressionManager) shrinks history
//! when usage crosses its threshold so the next assembly pass has room.

pub mod assembler;
pub mod budget;
pub mod compression;

pub use assembler::{Assembly, AssemblyReport, BlockDisposition, ContextAssembler, ContextBlock};
pub use budget::{Budget, DEFAULT_CHARS_PER_TOKEN, HeuristicCounter, TokenCounter};
pub use compression::{CompressionConfig, CompressionManager, CompressionMetadata};
