//! Fail-closed classification of a requested run. Pure: reads nothing but
//! its arguments and touches nothing.

use crate::config::{
    CheckMode, Mode, RawConfig, RunConfig, ARMING_SENTINEL, PAPER_OPT_IN_SENTINEL,
};
use crate::error::{SupervisorError, SupervisorResult};
use crate::fsutil::{dangling_symlink, normalize_path, resolve_path};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Where the supervisor is permitted to write.
#[derive(Debug, Clone)]
pub struct Policy {
    pub artifacts_root: PathBuf,
    /// Base for relative `outDir` values.
    pub base_dir: PathBuf,
}

impl Policy {
    /// The operational artifacts root is `artifacts/` under the working
    /// directory the supervisor is launched from.
    pub fn for_working_dir(cwd: &Path) -> Self {
        Self {
            artifacts_root: cwd.join("artifacts"),
            base_dir: cwd.to_path_buf(),
        }
    }
}

#[derive(Debug)]
pub enum Verdict {
    Accept(RunConfig),
    /// Configuration is acceptable but the arming flag is absent.
    NotArmed,
}

pub fn validate(raw: &RawConfig, policy: &Policy) -> SupervisorResult<Verdict> {
    let mode = validate_mode(raw)?;

    let check_mode = CheckMode::parse(raw.check_mode.trim()).ok_or_else(|| {
        SupervisorError::usage(format!(
            "checkMode must be p76 or p86, got {:?}",
            raw.check_mode
        ))
    })?;

    let out_dir = raw
        .out_dir
        .as_deref()
        .filter(|p| !p.as_os_str().is_empty())
        .ok_or_else(|| SupervisorError::usage("outDir is required"))?;
    let out_dir = confine_out_dir(out_dir, policy)?;

    if raw.run_id.trim().is_empty() {
        return Err(SupervisorError::usage("runId must not be empty"));
    }
    if raw.max_log_files == 0 || raw.max_tick_dirs == 0 {
        return Err(SupervisorError::usage(
            "maxLogFiles and maxTickDirs must be at least 1",
        ));
    }
    let gate_command = raw.gate_commands.for_mode(check_mode).to_vec();
    if gate_command.is_empty() {
        return Err(SupervisorError::usage(format!(
            "no gate command configured for {}",
            check_mode
        )));
    }

    match raw.armed.as_deref().map(str::trim) {
        None | Some("") => return Ok(Verdict::NotArmed),
        Some(ARMING_SENTINEL) => {}
        Some(_) => {
            return Err(SupervisorError::not_allowed(
                "arming flag present but does not carry the arming sentinel",
            ))
        }
    }

    Ok(Verdict::Accept(RunConfig {
        mode,
        out_dir,
        run_id: raw.run_id.trim().to_string(),
        interval: Duration::from_secs(raw.interval_seconds),
        iterations: raw.iterations,
        check_mode,
        max_log_files: raw.max_log_files,
        max_tick_dirs: raw.max_tick_dirs,
        backoff: Duration::from_secs(raw.backoff_seconds),
        check_timeout: (raw.check_timeout_seconds > 0)
            .then(|| Duration::from_secs(raw.check_timeout_seconds)),
        gate_command,
    }))
}

fn validate_mode(raw: &RawConfig) -> SupervisorResult<Mode> {
    let requested = raw
        .mode
        .as_deref()
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .ok_or_else(|| SupervisorError::usage("mode is required"))?;
    match requested {
        "shadow" => Ok(Mode::Shadow),
        "paper" => {
            if raw.allow_paper.as_deref().map(str::trim) == Some(PAPER_OPT_IN_SENTINEL) {
                Ok(Mode::Paper)
            } else {
                Err(SupervisorError::not_allowed(
                    "mode=paper requires the paper opt-in flag",
                ))
            }
        }
        other => Err(SupervisorError::not_allowed(format!(
            "mode {:?} is not permitted; only paper or shadow",
            other
        ))),
    }
}

/// Resolve `out_dir` and require it to sit strictly inside the artifacts
/// root.
pub fn confine_out_dir(out_dir: &Path, policy: &Policy) -> SupervisorResult<PathBuf> {
    let root = resolve_path(&policy.artifacts_root, &policy.base_dir);
    let lexical_out = normalize_path(&policy.base_dir.join(out_dir));
    if let Some(link) = dangling_symlink(&lexical_out) {
        return Err(SupervisorError::not_allowed(format!(
            "outDir {} passes through dangling symlink {}",
            out_dir.display(),
            link.display()
        )));
    }
    let resolved = resolve_path(out_dir, &policy.base_dir);
    if resolved.starts_with(&root) && resolved != root {
        Ok(resolved)
    } else {
        Err(SupervisorError::not_allowed(format!(
            "outDir {} is outside the artifacts root {}",
            out_dir.display(),
            root.display()
        )))
    }
}
