pub mod integrity;
pub mod report;
pub mod snapshot;
pub mod validator;

pub use integrity::{
    check_integrity, CheckKind, IntegrityCheck, IntegrityReport, DEFAULT_SAMPLE_SIZE,
    INTEGRITY_REPORT_FILE,
};
pub use report::{analyze_suite, RunHealth, SuiteHealthReport, VALIDATION_REPORT_FILE};
pub use snapshot::{load_snapshots, Snapshot};
pub use validator::{HealthMetrics, HealthStatus, SimulationHealth, SimulationValidator};
