use std::path::{Path, PathBuf};

use marksync_core::config::marksync_root;

pub const CONTROL_SOCKET: &str = "control.sock";

pub fn run_dir(home: &Path) -> PathBuf {
    marksync_root(home).join("run")
}

pub fn control_socket_path(home: &Path) -> PathBuf {
    run_dir(home).join(CONTROL_SOCKET)
}
