pub mod artifacts;
pub mod config;
pub mod corpus;
pub mod coverage;
pub mod engine;
pub mod feedback;
pub mod harness;
pub mod mutator;
pub mod probe;
pub mod state;
pub mod stats;
pub mod testcase;

pub use artifacts::{ArtifactError, CrashSink, ImportLedger};
pub use config::{FuzzerContext, MapVariant, RiffleConfig};
pub use corpus::{Corpus, CorpusEntry, CorpusError};
pub use coverage::{CoverageError, CoverageMap, CoverageSnapshot};
pub use engine::{Engine, EngineChannel, EngineError, ExecutionResult, ReprlChannel};
pub use feedback::{
    FeedbackError, IdentityStandardizer, ImportSummary, Standardizer, handle_new_file,
    import_directory, minimize_for_edges,
};
pub use harness::{ExecutionStatus, HarnessProfile};
pub use mutator::{MutationOutcome, Mutator, apply_random_mutation, default_mutators};
pub use state::{JsType, StateError, SyntaxClass, TestcaseState};
pub use stats::FuzzerStats;
pub use testcase::Testcase;
