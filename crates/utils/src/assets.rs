use std::path::PathBuf;

use directories::ProjectDirs;

/// Platform data directory for the app, or `.habitlink` under the working directory when the
/// platform has no home directory.
pub fn data_dir() -> PathBuf {
    ProjectDirs::from("app", "habitlink", "habitlink")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".habitlink"))
}

/// Directory holding the on-device key-value blobs
pub fn local_storage_dir() -> PathBuf {
    data_dir().join("local")
}

/// Default location of the relational store file
pub fn database_path() -> PathBuf {
    data_dir().join("habitlink.sqlite")
}
