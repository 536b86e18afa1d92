//! Common test helpers and utilities.

#![allow(dead_code)]

pub mod temp_workspace;

use mro_lens::SessionConfig;
use std::path::Path;
use std::time::Duration;

// Re-export for convenience
pub use temp_workspace::TestWorkspace;

/// The diamond hierarchy: `A(Generic)`, `B(A)`, `C(A)`, `D(B, C)`.
pub const DIAMOND: &str = r#"#- diamond.py
"""The classic diamond problem for multiple inheritance."""
from typing import TypeVar, Generic


T = TypeVar('T')  # class Hidden: pass


class A(Generic[T]):

    def func_a(self):
        pass


class B(A):

    def func_ab(self):
        return super().func_ab()


class C(A):

    def func_ac(self):
        return super().func_ac()


class D(B, C):

    def func_ad(self):
        return super().func_ad()
"#;

/// Sync kind advertised by the stub server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    Full,
    Incremental,
}

/// Path of the stub analysis server built alongside the tests
pub fn stub_server() -> &'static str {
    env!("CARGO_BIN_EXE_mro-stub-server")
}

/// Session config running the stub server from `root` with short policies.
/// `extra_args` go before the port.
pub fn stub_config(root: &Path, sync: SyncMode, extra_args: &[&str]) -> SessionConfig {
    let sync = match sync {
        SyncMode::Full => "full",
        SyncMode::Incremental => "incremental",
    };
    let mut args = vec!["--sync", sync];
    args.extend_from_slice(extra_args);

    // CI machines start processes more slowly
    let connect_timeout = if std::env::var("CI").is_ok() {
        Duration::from_secs(10)
    } else {
        Duration::from_secs(3)
    };

    SessionConfig::builder()
        .executable(stub_server())
        .args(args)
        .working_dir(root)
        .workspace_root(root)
        .preferred_ports(Vec::new())
        .connect_policy(Duration::from_millis(100), connect_timeout)
        .terminate_policy(
            Duration::from_secs(5),
            Duration::from_millis(50),
            Duration::from_secs(1),
        )
        .request_timeout(Duration::from_secs(5))
        .build()
        .expect("valid stub config")
}

/// Whether a process with `pid` still exists (zombies count as gone)
#[cfg(target_os = "linux")]
pub fn process_alive(pid: u32) -> bool {
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => !stat
            .rsplit_once(") ")
            .is_some_and(|(_, rest)| rest.starts_with('Z')),
        Err(_) => false,
    }
}
