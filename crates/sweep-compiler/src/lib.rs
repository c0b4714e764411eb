pub mod compile;
pub mod expr;
pub mod generate;
pub mod merge;
pub mod naming;
pub mod rebuild;
pub mod render;
pub mod resolver;
pub mod script;
pub mod sweep;

pub use compile::{compile_suite, CompileOptions, CompiledSuite, CompilerFlags, RunDescriptor};
pub use generate::{compile_experiment, generate_suite, write_suite, GeneratedSuite};
pub use merge::deep_merge;
pub use rebuild::{RebuildDecision, RebuildReason};
pub use render::{CommandRenderer, ConfigRenderer, StructuredRenderer};
pub use resolver::{ConfigDocument, ConfigResolver, ConfigSource, DirConfigSource};
pub use script::build_submit_script;
pub use sweep::{expand, ParameterCombination, SweepGroup, SweepSpec};
