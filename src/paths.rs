use std::path::PathBuf;

/// Returns the user's home directory using common environment variables.
/// `EXPENSEFLOW_HOME` wins so tests and deployments can relocate state.
pub fn home_dir() -> Option<PathBuf> {
    std::env::var_os("EXPENSEFLOW_HOME")
        .map(PathBuf::from)
        .or_else(|| {
            std::env::var_os("HOME")
                .or_else(|| std::env::var_os("USERPROFILE"))
                .map(PathBuf::from)
        })
}

/// Returns the data directory holding the run database and server logs.
pub fn data_dir() -> PathBuf {
    if let Some(mut dir) = home_dir() {
        dir.push(".expenseflow");
        dir
    } else {
        PathBuf::from(".expenseflow")
    }
}

/// Directory for the rolling server log files.
pub fn log_dir() -> PathBuf {
    data_dir().join("logs")
}
