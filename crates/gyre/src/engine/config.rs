//! Engine configuration.
//!
//! One [`EngineConfig`] aggregates the per-module configs and the knobs the
//! control loop reads directly. All builders are by-value (`with_*`), so a
//! config chain reads top to bottom.

use crate::actions::pipeline::PipelineConfig;
use crate::actions::scheduler::SchedulerConfig;
use crate::context::assembler::ContextBlock;
use crate::context::budget::DEFAULT_CHARS_PER_TOKEN;
use crate::context::compression::CompressionConfig;

/// Default iteration ceiling for one turn.
pub const DEFAULT_MAX_ITERATIONS: u32 = 20;

/// Default context window, in tokens.
pub const DEFAULT_CONTEXT_WINDOW_TOKENS: usize = 200_000;

/// Everything the control loop needs to run a turn, minus the collaborators
/// it borrows (client, registry, store).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Pinned at the highest priority in every assembly pass.
    pub system_prompt: String,
    /// Model calls allowed before the turn fails.
    pub max_iterations: u32,
    /// Token budget for each assembly pass.
    pub context_window_tokens: usize,
    /// Estimation ratio for the default token counter.
    pub chars_per_token: f64,
    pub compression: CompressionConfig,
    pub scheduler: SchedulerConfig,
    pub pipeline: PipelineConfig,
    /// Extra blocks included in every assembly pass, e.g. a project brief or
    /// environment snapshot.
    pub auxiliary_blocks: Vec<ContextBlock>,
}

impl EngineConfig {
    pub fn new(system_prompt: impl Into<String>) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            max_iterations: DEFAULT_MAX_ITERATIONS,
            context_window_tokens: DEFAULT_CONTEXT_WINDOW_TOKENS,
            chars_per_token: DEFAULT_CHARS_PER_TOKEN,
            compression: CompressionConfig::default(),
            scheduler: SchedulerConfig::default(),
            pipeline: PipelineConfig::default(),
            auxiliary_blocks: Vec::new(),
        }
    }

    pub fn with_max_iterations(mut self, max: u32) -> Self {
        self.max_iterations = max;
        self
    }

    pub fn with_context_window_tokens(mut self, tokens: usize) -> Self {
        self.context_window_tokens = tokens;
        self
    }

    pub fn with_chars_per_token(mut self, ratio: f64) -> Self {
        self.chars_per_token = ratio;
        self
    }

    pub fn with_compression(mut self, compression: CompressionConfig) -> Self {
        self.compression = compression;
        self
    }

    pub fn with_scheduler(mut self, scheduler: SchedulerConfig) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn with_pipeline(mut self, pipeline: PipelineConfig) -> Self {
        self.pipeline = pipeline;
        self
    }

    /// Add an auxiliary context block (builder pattern).
    pub fn with_auxiliary_block(mut self, block: ContextBlock) -> Self {
        self.auxiliary_blocks.push(block);
        self
    }
}
