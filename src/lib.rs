pub mod aggregate;
pub mod alignment;
pub mod analyzer;
pub mod config;
pub mod domain_utils;
pub mod error;
pub mod loader;
pub mod parser;
pub mod period;
pub mod providers;
pub mod recommendations;
pub mod record;
pub mod report;
pub mod resolver;
pub mod summary;

pub use aggregate::{AggregateKey, AggregateMap, Aggregator, PeriodStats, SourceAggregate};
pub use alignment::{AlignmentClassifier, AlignmentMode, AlignmentSetting, AlignmentVerdict};
pub use analyzer::{AnalysisOptions, Analyzer};
pub use config::AnalyzerConfig;
pub use error::{AnalyzerError, ConfigError, LoadError, ParseError, ResolutionError};
pub use parser::{parse_report, ParsedReport};
pub use period::{PeriodAnchor, PeriodFilter, TimePeriod};
pub use record::{Record, ReportMetadata};
pub use summary::AnalysisSummary;
