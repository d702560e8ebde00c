//! Problem-reference normalization.
//!
//! Raw refs arrive as full judge URLs or bare ids. Normalization maps
//! them to `(source_adapter, short_id)` with a first-match-wins rule
//! table. An explicit adapter hint on the ref skips detection and takes
//! the bare id verbatim.

use regex::Regex;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

/// A raw problem reference as submitted by a user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProblemRef {
    /// The raw string: a URL or a bare id.
    pub raw: String,
    /// Explicit source adapter, skipping auto-detection.
    #[serde(default)]
    pub source_adapter: Option<String>,
}

/// A normalized problem id: detected source adapter plus a stable short id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NormalizedPid {
    /// The source adapter name.
    pub source_adapter: String,
    /// The adapter-scoped short id.
    pub short_id: String,
}

impl NormalizedPid {
    /// The stable display form of the short id.
    pub fn display(&self) -> &str {
        &self.short_id
    }

    /// Directory-safe key for workspace paths, unique across adapters.
    pub fn workspace_key(&self) -> String {
        format!("{}-{}", self.source_adapter, sanitize(&self.short_id))
    }
}

impl std::fmt::Display for NormalizedPid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.source_adapter, self.short_id)
    }
}

/// Replace path-hostile characters so the short id can name a directory.
fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect()
}

fn numeric_problem_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"/problem/(\d+)").expect("numeric problem regex must compile"))
}

fn cf_problem_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"/problem/(\d+)/([A-Z]\d?)").expect("codeforces problem regex must compile")
    })
}

fn atcoder_task_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"/tasks/([^/?]+)").expect("atcoder task regex must compile"))
}

fn luogu_problem_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"/problem/([A-Z]?\d+)").expect("luogu problem regex must compile")
    })
}

fn bare_luogu_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[PBTU]\d+$").expect("bare luogu regex must compile"))
}

fn bare_cf_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d+[A-Z]$").expect("bare codeforces regex must compile"))
}

fn bare_numeric_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d+$").expect("bare numeric regex must compile"))
}

/// Normalize a raw problem ref into `(source_adapter, short_id)`.
///
/// Returns `None` when no rule matches and no explicit adapter was given.
pub fn normalize(problem_ref: &ProblemRef) -> Option<NormalizedPid> {
    let raw = problem_ref.raw.trim();

    // Explicit adapter: the bare id is accepted verbatim.
    if let Some(adapter) = &problem_ref.source_adapter {
        if !adapter.is_empty() {
            return Some(NormalizedPid {
                source_adapter: adapter.clone(),
                short_id: raw.to_string(),
            });
        }
    }

    // URL rules, first match wins.
    if raw.contains("aicoders.cn") {
        let caps = numeric_problem_re().captures(raw)?;
        return Some(NormalizedPid {
            source_adapter: "aicoders".to_string(),
            short_id: caps[1].to_string(),
        });
    }
    if raw.contains("shsoj") || raw.contains("shsbnu") {
        let caps = numeric_problem_re().captures(raw)?;
        return Some(NormalizedPid {
            source_adapter: "shsoj".to_string(),
            short_id: caps[1].to_string(),
        });
    }
    if raw.contains("codeforces.com") {
        let caps = cf_problem_re().captures(raw)?;
        return Some(NormalizedPid {
            source_adapter: "cf".to_string(),
            short_id: format!("{}{}", &caps[1], &caps[2]),
        });
    }
    if raw.contains("atcoder.jp") {
        let caps = atcoder_task_re().captures(raw)?;
        return Some(NormalizedPid {
            source_adapter: "atcoder".to_string(),
            short_id: caps[1].to_string(),
        });
    }
    if raw.contains("luogu.com") {
        let caps = luogu_problem_re().captures(raw)?;
        return Some(NormalizedPid {
            source_adapter: "luogu".to_string(),
            short_id: caps[1].to_string(),
        });
    }
    if raw.contains("hydro") {
        // Hydro instances live on arbitrary domains; the path tail is the id.
        let tail = raw.trim_end_matches('/').rsplit('/').next()?;
        if tail.is_empty() {
            return None;
        }
        return Some(NormalizedPid {
            source_adapter: "hydrooj".to_string(),
            short_id: tail.to_string(),
        });
    }

    // Bare id rules.
    if bare_luogu_re().is_match(raw) {
        return Some(NormalizedPid {
            source_adapter: "luogu".to_string(),
            short_id: raw.to_string(),
        });
    }
    if bare_cf_re().is_match(raw) {
        return Some(NormalizedPid {
            source_adapter: "cf".to_string(),
            short_id: raw.to_string(),
        });
    }
    if bare_numeric_re().is_match(raw) {
        return Some(NormalizedPid {
            source_adapter: "shsoj".to_string(),
            short_id: raw.to_string(),
        });
    }

    None
}
