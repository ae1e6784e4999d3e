use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Parser, Clone)]
#[clap(name = "recordsd", version, about = "Student records grading sidecar")]
pub struct Config {
    /// Workspace directory to open at startup; clients may also pick one
    /// later with `workspace.select`.
    #[clap(long, env = "RECORDSD_WORKSPACE")]
    pub workspace: Option<PathBuf>,

    #[clap(long, env = "RECORDSD_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}
