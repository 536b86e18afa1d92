use mro_lens::{Providers, Session};
use std::path::PathBuf;
use tempfile::TempDir;

use super::{SyncMode, stub_config};

/// Represents a test fixture with files and an optional cursor position.
#[derive(Debug)]
pub struct Fixture {
    /// files in fixture
    pub files: Vec<(PathBuf, String)>,
    /// Position of cursor in fixture, 1-indexed
    pub cursor: Option<(PathBuf, u32, u32)>,
}

/// Parses a fixture into file contents and paths.
///
/// Files start with a `#- path` line. A `$0` marks the cursor and is removed.
/// ## Panics
/// if a cursor appears before the first file marker
pub fn parse_fixture(input: &str) -> Fixture {
    let mut files = Vec::new();
    let mut current_path: Option<PathBuf> = None;
    let mut current_content = String::new();

    let mut cursor = None;

    for line in input.lines() {
        if let Some(path) = line.strip_prefix("#- ") {
            if let Some(p) = current_path.take() {
                files.push((p, current_content.clone()));
                current_content.clear();
            }
            current_path = Some(PathBuf::from(path.trim().trim_start_matches('/')));
        } else {
            let mut l = line.to_string();
            if let Some(idx) = l.find("$0") {
                let line_no = u32::try_from(current_content.lines().count() + 1)
                    .expect("line count out of range");
                let col = u32::try_from(idx + 1).expect("line index out of range");
                cursor = Some((current_path.clone().unwrap(), line_no, col));
                l = l.replace("$0", "");
            }
            current_content.push_str(&l);
            current_content.push('\n');
        }
    }

    if let Some(p) = current_path {
        files.push((p, current_content));
    }

    Fixture { files, cursor }
}

/// Test workspace with a running session against the stub server
pub struct TestWorkspace {
    /// Temporary folder for the workspace
    pub root: TempDir,
    /// fixture for the workspace
    pub fixture: Fixture,
    /// The session; deactivated by the test
    pub session: Session,
    /// Providers over the session's client
    pub providers: Providers,
    canonical_root: PathBuf,
}

impl TestWorkspace {
    /// Creates a new builder for constructing a test workspace
    pub fn builder() -> TestWorkspaceBuilder {
        TestWorkspaceBuilder::new()
    }

    /// Converts a relative path to an absolute path
    pub fn apath(&self, path: &str) -> PathBuf {
        self.canonical_root.join(path)
    }

    /// Cursor position from the fixture
    /// ## Panics
    /// if the fixture has no `$0`
    pub fn cursor(&self) -> (PathBuf, u32, u32) {
        let (path, line, col) = self.fixture.cursor.clone().expect("missing $0 cursor");
        (self.canonical_root.join(path), line, col)
    }

    /// Overwrites a fixture file on disk
    pub fn write(&self, path: &str, content: &str) {
        std::fs::write(self.apath(path), content).unwrap();
    }
}

/// Builder for test workspaces
pub struct TestWorkspaceBuilder {
    fixture: Option<String>,
    sync: SyncMode,
}

impl TestWorkspaceBuilder {
    /// Creates a new builder
    pub fn new() -> Self {
        Self {
            fixture: None,
            sync: SyncMode::Incremental,
        }
    }

    /// Sets the fixture content
    #[must_use]
    pub fn fixture(mut self, fixture: &str) -> Self {
        self.fixture = Some(fixture.to_string());
        self
    }

    /// Sets the sync kind the stub server advertises
    #[must_use]
    pub fn sync(mut self, sync: SyncMode) -> Self {
        self.sync = sync;
        self
    }

    /// Writes the files and activates a session
    /// ## Panics
    /// Panics if fixture is not set or the session does not bridge
    pub async fn build(self) -> TestWorkspace {
        let fixture = parse_fixture(&self.fixture.expect("Fixture must be set using .fixture()"));
        let root = TempDir::new().expect("Failed to create temp directory");

        for (path, content) in &fixture.files {
            let abs = root.path().join(path);
            std::fs::create_dir_all(abs.parent().unwrap()).unwrap();
            std::fs::write(&abs, content).unwrap();
        }

        let canonical_root = root
            .path()
            .canonicalize()
            .expect("Failed to canonicalize root");

        let mut session = Session::new(stub_config(&canonical_root, self.sync, &[]));
        let client = session.activate().await.expect("session should activate");
        assert!(!client.is_degraded(), "stub server should be reachable");

        TestWorkspace {
            root,
            fixture,
            session,
            providers: Providers::new(client),
            canonical_root,
        }
    }
}

impl Default for TestWorkspaceBuilder {
    fn default() -> Self {
        Self::new()
    }
}
