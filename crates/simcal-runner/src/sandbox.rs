use crate::error::{SandboxCreateError, SandboxDestroyError};
use serde::{Deserialize, Serialize};
use simcal_core::WorkerId;
use std::fs;
use std::io;
#[cfg(unix)]
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Per-project state directory (run records, control files). Never copied
/// into a sandbox.
pub const STATE_DIR: &str = ".simcal";

pub const DEFAULT_SANDBOX_PREFIX: &str = "simcal_sandbox_";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxLayout {
    /// Directory the sandboxes are created in; the template itself when unset.
    #[serde(default)]
    pub root: Option<PathBuf>,
    #[serde(default = "default_prefix")]
    pub prefix: String,
    /// Template-relative paths left out of every copy.
    #[serde(default)]
    pub exclude: Vec<String>,
}

fn default_prefix() -> String {
    DEFAULT_SANDBOX_PREFIX.to_string()
}

impl Default for SandboxLayout {
    fn default() -> Self {
        Self {
            root: None,
            prefix: default_prefix(),
            exclude: Vec::new(),
        }
    }
}

impl SandboxLayout {
    pub fn sandbox_root(&self, template_dir: &Path) -> PathBuf {
        self.root
            .clone()
            .unwrap_or_else(|| template_dir.to_path_buf())
    }

    pub fn sandbox_path(&self, template_dir: &Path, worker: &WorkerId) -> PathBuf {
        self.sandbox_root(template_dir)
            .join(format!("{}{}", self.prefix, worker))
    }
}

/// A private working copy of the template owned by one evaluation.
///
/// The subtree is removed exactly once: by [`Sandbox::destroy`], or on drop if
/// the owner never got that far.
#[derive(Debug)]
pub struct Sandbox {
    path: PathBuf,
    worker: WorkerId,
    destroyed: bool,
}

impl Sandbox {
    pub fn create(
        template_dir: &Path,
        worker: &WorkerId,
        layout: &SandboxLayout,
    ) -> Result<Self, SandboxCreateError> {
        if !template_dir.is_dir() {
            return Err(SandboxCreateError::MissingTemplate(
                template_dir.to_path_buf(),
            ));
        }
        let started = Instant::now();
        let template_real =
            fs::canonicalize(template_dir).map_err(|source| SandboxCreateError::Copy {
                path: template_dir.to_path_buf(),
                source,
            })?;
        let path = layout.sandbox_path(template_dir, worker);
        if path.exists() {
            warn!(
                worker = %worker,
                sandbox = %path.display(),
                "removing stale sandbox left by an earlier run"
            );
            fs::remove_dir_all(&path).map_err(|source| SandboxCreateError::Stale {
                path: path.clone(),
                source,
            })?;
        }
        fs::create_dir_all(&path).map_err(|source| SandboxCreateError::Copy {
            path: path.clone(),
            source,
        })?;

        let mut exclude: Vec<PathBuf> = vec![PathBuf::from(STATE_DIR)];
        exclude.extend(layout.exclude.iter().map(PathBuf::from));
        if let Some(rel) = nested_root(template_dir, &layout.sandbox_root(template_dir)) {
            exclude.push(rel);
        }
        let copied = fs::canonicalize(&path)
            .map_err(|source| SandboxCreateError::Copy {
                path: path.clone(),
                source,
            })
            .and_then(|sandbox_real| {
                let plan = CopyPlan {
                    template: template_real.clone(),
                    sandbox: sandbox_real,
                    filter: CopyFilter {
                        prefix: &layout.prefix,
                        exclude: &exclude,
                    },
                };
                copy_dir_filtered(
                    &plan,
                    template_dir,
                    &path,
                    Some(Path::new("")),
                    &[template_real.clone()],
                )
            });
        if let Err(err) = copied {
            let _ = fs::remove_dir_all(&path);
            return Err(err);
        }
        info!(
            worker = %worker,
            sandbox = %path.display(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "sandbox created"
        );
        Ok(Self {
            path,
            worker: worker.clone(),
            destroyed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn worker(&self) -> &WorkerId {
        &self.worker
    }

    pub fn destroy(mut self) -> Result<(), SandboxDestroyError> {
        self.destroyed = true;
        remove_sandbox(&self.path)?;
        info!(worker = %self.worker, sandbox = %self.path.display(), "sandbox removed");
        Ok(())
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        if let Err(err) = remove_sandbox(&self.path) {
            warn!(worker = %self.worker, error = %err, "sandbox cleanup on drop failed");
        }
    }
}

pub(crate) fn remove_sandbox(path: &Path) -> Result<(), SandboxDestroyError> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(SandboxDestroyError {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Removes every sandbox under `root` whose name carries `prefix`, e.g. those
/// leaked by a killed process.
pub fn sweep_leaked(root: &Path, prefix: &str) -> io::Result<Vec<PathBuf>> {
    let mut removed = Vec::new();
    if prefix.is_empty() || !root.is_dir() {
        return Ok(removed);
    }
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        let name = entry.file_name();
        let is_sandbox = name.to_str().map(|n| n.starts_with(prefix)).unwrap_or(false);
        if is_sandbox && entry.file_type()?.is_dir() {
            fs::remove_dir_all(entry.path())?;
            removed.push(entry.path());
        }
    }
    Ok(removed)
}

fn nested_root(template_dir: &Path, root: &Path) -> Option<PathBuf> {
    let template = fs::canonicalize(template_dir).ok()?;
    let root = fs::canonicalize(root).ok()?;
    let rel = root.strip_prefix(&template).ok()?;
    if rel.as_os_str().is_empty() {
        None
    } else {
        Some(rel.to_path_buf())
    }
}

struct CopyFilter<'a> {
    prefix: &'a str,
    exclude: &'a [PathBuf],
}

impl CopyFilter<'_> {
    fn skips(&self, rel: &Path) -> bool {
        if self.exclude.iter().any(|ex| rel.starts_with(ex)) {
            return true;
        }
        let mut components = rel.components();
        match (components.next(), components.next()) {
            (Some(first), None) => first
                .as_os_str()
                .to_str()
                .map(|n| !self.prefix.is_empty() && n.starts_with(self.prefix))
                .unwrap_or(false),
            _ => false,
        }
    }
}

/// Canonical anchors of one template copy.
struct CopyPlan<'a> {
    template: PathBuf,
    sandbox: PathBuf,
    filter: CopyFilter<'a>,
}

impl CopyPlan<'_> {
    /// Template-relative location of a canonical path inside the template.
    fn template_rel(&self, real: &Path) -> Option<PathBuf> {
        real.strip_prefix(&self.template).ok().map(Path::to_path_buf)
    }

    /// Following a directory link to `real` would copy the sandbox into
    /// itself or revisit a directory already being copied.
    fn would_nest(&self, real: &Path, link_dir: Option<&Path>, active: &[PathBuf]) -> bool {
        self.sandbox.starts_with(real)
            || real.starts_with(&self.sandbox)
            || active.iter().any(|dir| dir.starts_with(real))
            || link_dir.map(|dir| dir.starts_with(real)).unwrap_or(false)
    }
}

/// Copies `src` into `dst`. `base` is the template-relative location of `src`
/// when it lies inside the template, so the filter sees template paths even
/// below a followed link; `active` holds the canonical directories being
/// copied on the current link chain.
fn copy_dir_filtered(
    plan: &CopyPlan<'_>,
    src: &Path,
    dst: &Path,
    base: Option<&Path>,
    active: &[PathBuf],
) -> Result<(), SandboxCreateError> {
    let copy_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source: io::Error| SandboxCreateError::Copy { path, source }
    };
    let walker = walkdir::WalkDir::new(src).into_iter().filter_entry(|e| {
        let rel = e.path().strip_prefix(src).unwrap_or(e.path());
        rel.as_os_str().is_empty()
            || base
                .map(|base| !plan.filter.skips(&base.join(rel)))
                .unwrap_or(true)
    });
    for entry in walker {
        let entry = entry.map_err(|source| SandboxCreateError::Walk {
            path: src.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        let rel = match path.strip_prefix(src) {
            Ok(rel) if !rel.as_os_str().is_empty() => rel,
            _ => continue,
        };
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target).map_err(copy_err(&target))?;
        } else if entry.file_type().is_symlink() {
            match fs::canonicalize(path) {
                Ok(real) if real.is_dir() => {
                    let link_dir = path.parent().and_then(|p| fs::canonicalize(p).ok());
                    if plan.would_nest(&real, link_dir.as_deref(), active) {
                        warn!(
                            link = %path.display(),
                            target = %real.display(),
                            "skipping directory link that would nest the sandbox"
                        );
                        continue;
                    }
                    let real_base = plan.template_rel(&real);
                    if let Some(real_base) = &real_base {
                        if plan.filter.skips(real_base) {
                            debug!(link = %path.display(), "skipping link into excluded path");
                            continue;
                        }
                    }
                    fs::create_dir_all(&target).map_err(copy_err(&target))?;
                    let mut chain = active.to_vec();
                    chain.push(real.clone());
                    copy_dir_filtered(plan, &real, &target, real_base.as_deref(), &chain)?;
                }
                Ok(real) if real.is_file() => {
                    fs::copy(real, &target).map_err(copy_err(&target))?;
                }
                Ok(_) => {}
                Err(_) => {
                    // Broken links are recreated as-is.
                    let link_target = fs::read_link(path).map_err(copy_err(path))?;
                    debug!(link = %path.display(), "preserving broken symlink");
                    #[cfg(unix)]
                    {
                        symlink(&link_target, &target).map_err(copy_err(&target))?;
                    }
                    #[cfg(not(unix))]
                    {
                        let _ = link_target;
                    }
                }
            }
        } else if entry.file_type().is_file() {
            fs::copy(path, &target).map_err(copy_err(&target))?;
        }
    }
    Ok(())
}
