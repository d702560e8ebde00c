//! Per-problem workspace store.
//!
//! A workspace is the on-disk directory `<root>/<user_id>/<pid_key>/`
//! holding every artifact for one problem: the canonical statement,
//! source samples, the generated data, the reference solution, the
//! upload receipt, and per-stage logs. The `has_*` predicates are the
//! idempotency oracle the pipeline runner consults to decide skip vs.
//! execute, so a fresh process reconstructs runnability solely from disk.
//!
//! All file writes go through write-temp-then-rename, so a crashed write
//! never leaves a half-written artifact behind an oracle probe.

use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::WorkspaceError;
use crate::judge::{Statement, UploadReceipt, Verdict};

const STATEMENT_FILE: &str = "statement.json";
const RECEIPT_FILE: &str = "upload/receipt.json";
const SOLVE_MARKER_FILE: &str = "sol/verdict.json";
const GENERATOR_SCRIPT: &str = "gen/gen.py";

/// Store of per-problem workspaces under one root directory.
#[derive(Debug, Clone)]
pub struct WorkspaceStore {
    root: PathBuf,
}

impl WorkspaceStore {
    /// Create a store rooted at `root`. `~` is expanded. The directory
    /// itself is created lazily on first write.
    pub fn new(root: &str) -> Self {
        Self {
            root: PathBuf::from(crate::storage::expand_tilde(root)),
        }
    }

    /// Open the workspace for `(user_id, pid_key)`, creating nothing yet.
    ///
    /// Two concurrent calls for the same pair return handles to the same
    /// directory; admission semantics guarantee at most one runner writes.
    pub fn open_or_create(&self, user_id: i64, pid_key: &str) -> Workspace {
        Workspace {
            dir: self.root.join(user_id.to_string()).join(pid_key),
        }
    }

    /// The store root.
    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Proof that the reference solution was judged accepted, persisted so a
/// re-run can skip the Solve stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolveMarker {
    /// Target adapter the verdict came from.
    pub adapter: String,
    /// Problem id on the target judge.
    pub real_id: String,
    /// Submission id on the target judge.
    pub submission_id: String,
    /// The terminal verdict.
    pub verdict: Verdict,
    /// RFC 3339 timestamp of the verdict.
    pub checked_at: String,
}

/// Handle to one per-problem directory.
#[derive(Debug, Clone)]
pub struct Workspace {
    dir: PathBuf,
}

impl Workspace {
    /// The workspace directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    // ── Statement ────────────────────────────────────────────────────

    /// Whether a statement has been fetched.
    pub fn has_statement(&self) -> bool {
        self.dir.join(STATEMENT_FILE).is_file()
    }

    /// Read the canonical statement.
    pub fn read_statement(&self) -> Result<Statement, WorkspaceError> {
        let path = self.dir.join(STATEMENT_FILE);
        let raw = fs::read(&path).map_err(|source| WorkspaceError::Io {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_slice(&raw).map_err(|e| WorkspaceError::Corrupt {
            path: path.display().to_string(),
            message: e.to_string(),
        })
    }

    /// Write the canonical statement atomically.
    pub fn write_statement(&self, statement: &Statement) -> Result<(), WorkspaceError> {
        let raw = serde_json::to_vec_pretty(statement).map_err(|e| WorkspaceError::Corrupt {
            path: STATEMENT_FILE.to_string(),
            message: e.to_string(),
        })?;
        self.write_atomic(Path::new(STATEMENT_FILE), &raw)
    }

    /// Write one source sample pair (`samples/<i>.in`, `samples/<i>.out`).
    pub fn write_sample(&self, index: usize, input: &str, output: &str) -> Result<(), WorkspaceError> {
        self.write_atomic(
            &PathBuf::from("samples").join(format!("{index}.in")),
            input.as_bytes(),
        )?;
        self.write_atomic(
            &PathBuf::from("samples").join(format!("{index}.out")),
            output.as_bytes(),
        )
    }

    /// Remove the statement and samples (user-initiated retry from Fetch).
    pub fn clear_statement(&self) -> Result<(), WorkspaceError> {
        self.remove_path(Path::new(STATEMENT_FILE))?;
        self.remove_path(Path::new("samples"))
    }

    // ── Generated data ───────────────────────────────────────────────

    /// Store the LLM-produced generator script at `gen/gen.py`.
    pub fn put_generator_script(&self, code: &str) -> Result<PathBuf, WorkspaceError> {
        self.write_atomic(Path::new(GENERATOR_SCRIPT), code.as_bytes())?;
        Ok(self.dir.join(GENERATOR_SCRIPT))
    }

    /// Path of the generator script, present or not.
    pub fn generator_script_path(&self) -> PathBuf {
        self.dir.join(GENERATOR_SCRIPT)
    }

    /// Store one generated case pair (`gen/<i>.in`, `gen/<i>.ans`).
    pub fn put_generated_case(
        &self,
        index: u32,
        input: &str,
        expected: &str,
    ) -> Result<(), WorkspaceError> {
        self.write_atomic(
            &PathBuf::from("gen").join(format!("{index}.in")),
            input.as_bytes(),
        )?;
        self.write_atomic(
            &PathBuf::from("gen").join(format!("{index}.ans")),
            expected.as_bytes(),
        )
    }

    /// Whether at least one complete generated case pair exists.
    pub fn has_generated_data(&self) -> bool {
        self.generated_case_count() > 0
    }

    /// Count of complete `(in, ans)` pairs under `gen/`.
    pub fn generated_case_count(&self) -> usize {
        let gen_dir = self.dir.join("gen");
        let Ok(entries) = fs::read_dir(&gen_dir) else {
            return 0;
        };
        entries
            .flatten()
            .filter(|entry| {
                let path = entry.path();
                path.extension().is_some_and(|ext| ext == "in")
                    && path.with_extension("ans").is_file()
            })
            .count()
    }

    /// List complete generated case pairs as `(index, in_path, ans_path)`,
    /// ordered by index.
    pub fn generated_cases(&self) -> Vec<(u32, PathBuf, PathBuf)> {
        let gen_dir = self.dir.join("gen");
        let Ok(entries) = fs::read_dir(&gen_dir) else {
            return Vec::new();
        };
        let mut cases: Vec<(u32, PathBuf, PathBuf)> = entries
            .flatten()
            .filter_map(|entry| {
                let path = entry.path();
                if path.extension()? != "in" {
                    return None;
                }
                let index: u32 = path.file_stem()?.to_str()?.parse().ok()?;
                let ans = path.with_extension("ans");
                ans.is_file().then_some((index, path, ans))
            })
            .collect();
        cases.sort_by_key(|(index, _, _)| *index);
        cases
    }

    /// Remove all generated data including the generator script.
    pub fn clear_generated(&self) -> Result<(), WorkspaceError> {
        self.remove_path(Path::new("gen"))
    }

    // ── Reference solution ───────────────────────────────────────────

    /// Store the reference solution as `sol/solution.<ext>`.
    pub fn put_solution(&self, code: &str, ext: &str) -> Result<PathBuf, WorkspaceError> {
        let rel = PathBuf::from("sol").join(format!("solution.{ext}"));
        self.write_atomic(&rel, code.as_bytes())?;
        Ok(self.dir.join(rel))
    }

    /// Find an existing reference solution, returning `(path, ext)`.
    pub fn find_solution(&self) -> Option<(PathBuf, String)> {
        let sol_dir = self.dir.join("sol");
        let entries = fs::read_dir(&sol_dir).ok()?;
        let mut found: Vec<(PathBuf, String)> = entries
            .flatten()
            .filter_map(|entry| {
                let path = entry.path();
                let stem = path.file_stem()?.to_str()?;
                if stem != "solution" {
                    return None;
                }
                let ext = path.extension()?.to_str()?.to_string();
                // verdict.json and compiled artifacts are not source.
                if ext == "json" || ext == "bin" {
                    return None;
                }
                Some((path, ext))
            })
            .collect();
        // Prefer compiled languages first for deterministic behavior.
        found.sort_by_key(|(_, ext)| (ext != "cpp", ext.clone()));
        found.into_iter().next()
    }

    /// Read the reference solution code and extension, when present.
    pub fn read_solution(&self) -> Result<Option<(String, String)>, WorkspaceError> {
        let Some((path, ext)) = self.find_solution() else {
            return Ok(None);
        };
        let code = fs::read_to_string(&path).map_err(|source| WorkspaceError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Ok(Some((code, ext)))
    }

    // ── Upload receipt ───────────────────────────────────────────────

    /// Read the upload receipt, filtered to the given target adapter.
    pub fn get_upload_receipt(
        &self,
        adapter: &str,
    ) -> Result<Option<UploadReceipt>, WorkspaceError> {
        let path = self.dir.join(RECEIPT_FILE);
        if !path.is_file() {
            return Ok(None);
        }
        let raw = fs::read(&path).map_err(|source| WorkspaceError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let receipt: UploadReceipt =
            serde_json::from_slice(&raw).map_err(|e| WorkspaceError::Corrupt {
                path: path.display().to_string(),
                message: e.to_string(),
            })?;
        Ok((receipt.adapter == adapter).then_some(receipt))
    }

    /// Persist the upload receipt atomically.
    pub fn put_upload_receipt(&self, receipt: &UploadReceipt) -> Result<(), WorkspaceError> {
        let raw = serde_json::to_vec_pretty(receipt).map_err(|e| WorkspaceError::Corrupt {
            path: RECEIPT_FILE.to_string(),
            message: e.to_string(),
        })?;
        self.write_atomic(Path::new(RECEIPT_FILE), &raw)
    }

    /// Remove the upload receipt (user-initiated retry of Upload).
    pub fn clear_upload_receipt(&self) -> Result<(), WorkspaceError> {
        self.remove_path(Path::new(RECEIPT_FILE))
    }

    // ── Solve marker ─────────────────────────────────────────────────

    /// Persist the terminal solve verdict.
    pub fn put_solve_marker(&self, marker: &SolveMarker) -> Result<(), WorkspaceError> {
        let raw = serde_json::to_vec_pretty(marker).map_err(|e| WorkspaceError::Corrupt {
            path: SOLVE_MARKER_FILE.to_string(),
            message: e.to_string(),
        })?;
        self.write_atomic(Path::new(SOLVE_MARKER_FILE), &raw)
    }

    /// Whether an accepted verdict is recorded for the given adapter.
    pub fn has_accepted_solve(&self, adapter: &str) -> bool {
        let path = self.dir.join(SOLVE_MARKER_FILE);
        let Ok(raw) = fs::read(&path) else {
            return false;
        };
        let Ok(marker) = serde_json::from_slice::<SolveMarker>(&raw) else {
            return false;
        };
        marker.adapter == adapter && marker.verdict == Verdict::Accepted
    }

    /// Remove the solve marker (retry of Solve or upstream stages).
    pub fn clear_solve_marker(&self) -> Result<(), WorkspaceError> {
        self.remove_path(Path::new(SOLVE_MARKER_FILE))
    }

    // ── Stage logs ───────────────────────────────────────────────────

    /// Append one line to `logs/<stage>.log`. Failures are swallowed:
    /// logging never fails a stage.
    pub fn append_stage_log(&self, stage: &str, line: &str) {
        let rel = PathBuf::from("logs").join(format!("{stage}.log"));
        let path = self.dir.join(&rel);
        if let Some(parent) = path.parent() {
            if fs::create_dir_all(parent).is_err() {
                return;
            }
        }
        if let Ok(mut file) = fs::OpenOptions::new().create(true).append(true).open(&path) {
            let _ = writeln!(file, "{line}");
        }
    }

    // ── Snapshot ─────────────────────────────────────────────────────

    /// Sorted relative paths of every file in the workspace. Used by the
    /// snapshot and by task-level downloads that bundle several
    /// workspaces into one archive.
    pub fn file_manifest(&self) -> Vec<PathBuf> {
        let mut paths = Vec::new();
        let _ = collect_files(&self.dir, &self.dir, &mut paths);
        paths.sort();
        paths
    }

    /// Read one file by its manifest-relative path.
    pub fn read_file(&self, rel: &Path) -> Result<Vec<u8>, WorkspaceError> {
        let path = self.dir.join(rel);
        fs::read(&path).map_err(|source| WorkspaceError::Io {
            path: path.display().to_string(),
            source,
        })
    }

    /// Zip the workspace subtree with 0644 file modes and UTF-8 paths.
    /// Entries are sorted so the archive is reproducible.
    pub fn snapshot_zip(&self) -> Result<Vec<u8>, WorkspaceError> {
        let paths = self.file_manifest();

        let mut cursor = std::io::Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut cursor);
            let options = zip::write::SimpleFileOptions::default()
                .compression_method(zip::CompressionMethod::Deflated)
                .unix_permissions(0o644);
            for rel in &paths {
                let name = rel
                    .to_str()
                    .ok_or_else(|| WorkspaceError::Archive {
                        message: format!("non-UTF-8 path in workspace: {}", rel.display()),
                    })?
                    .replace('\\', "/");
                writer
                    .start_file(name, options)
                    .map_err(|e| WorkspaceError::Archive {
                        message: e.to_string(),
                    })?;
                let full = self.dir.join(rel);
                let bytes = fs::read(&full).map_err(|source| WorkspaceError::Io {
                    path: full.display().to_string(),
                    source,
                })?;
                writer
                    .write_all(&bytes)
                    .map_err(|e| WorkspaceError::Archive {
                        message: e.to_string(),
                    })?;
            }
            writer.finish().map_err(|e| WorkspaceError::Archive {
                message: e.to_string(),
            })?;
        }
        Ok(cursor.into_inner())
    }

    // ── Internals ────────────────────────────────────────────────────

    /// Write bytes to `rel` under the workspace via temp-then-rename.
    fn write_atomic(&self, rel: &Path, bytes: &[u8]) -> Result<(), WorkspaceError> {
        let path = self.dir.join(rel);
        let parent = path.parent().unwrap_or(&self.dir);
        fs::create_dir_all(parent).map_err(|source| WorkspaceError::Io {
            path: parent.display().to_string(),
            source,
        })?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "artifact".to_string());
        let tmp = parent.join(format!(".tmp-{file_name}"));
        fs::write(&tmp, bytes).map_err(|source| WorkspaceError::Io {
            path: tmp.display().to_string(),
            source,
        })?;
        fs::rename(&tmp, &path).map_err(|source| WorkspaceError::Io {
            path: path.display().to_string(),
            source,
        })
    }

    fn remove_path(&self, rel: &Path) -> Result<(), WorkspaceError> {
        let path = self.dir.join(rel);
        let result = if path.is_dir() {
            fs::remove_dir_all(&path)
        } else if path.is_file() {
            fs::remove_file(&path)
        } else {
            return Ok(());
        };
        result.map_err(|source| WorkspaceError::Io {
            path: path.display().to_string(),
            source,
        })
    }
}

fn collect_files(
    root: &Path,
    dir: &Path,
    out: &mut Vec<PathBuf>,
) -> Result<(), WorkspaceError> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Ok(());
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_files(root, &path, out)?;
        } else if let Ok(rel) = path.strip_prefix(root) {
            out.push(rel.to_path_buf());
        }
    }
    Ok(())
}
