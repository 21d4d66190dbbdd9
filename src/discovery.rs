use ignore::WalkBuilder;
use ignore::overrides::OverrideBuilder;
use regex::Regex;
use serde::Serialize;
use std::fs;
use std::io::Read;
use std::path::{Component, Path, PathBuf};

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FileEntry {
    /// Relative to the walk root.
    pub path: String,
    pub is_dir: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct GrepMatch {
    pub path: String,
    pub line: usize,
    pub text: String,
}

const PROJECT_MARKERS: &[&str] = &[".git", "Cargo.toml", "package.json", "go.mod", "pyproject.toml", "pom.xml", "Makefile"];

fn relative(root: &Path, path: &Path) -> String {
    path.strip_prefix(root).unwrap_or(path).to_string_lossy().to_string()
}

fn walker(dir: &Path) -> WalkBuilder {
    let mut b = WalkBuilder::new(dir);
    b.hidden(true).git_ignore(true).sort_by_file_name(|a, b| a.cmp(b));
    b
}

/// Entries under `dir`, depth-first, gitignore-aware, at most `max`.
pub fn list_files(dir: &Path, max: usize) -> Vec<FileEntry> {
    let mut out = Vec::new();
    for dirent in walker(dir).build().flatten() {
        if out.len() >= max {
            break;
        }
        let path = dirent.path();
        if path == dir {
            continue;
        }
        out.push(FileEntry { path: relative(dir, path), is_dir: path.is_dir() });
    }
    out
}

/// Files under `dir` whose relative path matches the glob `pattern`.
pub fn glob_files(dir: &Path, pattern: &str, max: usize) -> anyhow::Result<Vec<FileEntry>> {
    let mut ob = OverrideBuilder::new(dir);
    ob.add(pattern)?;
    let overrides = ob.build()?;
    let mut out = Vec::new();
    for dirent in walker(dir).overrides(overrides).build().flatten() {
        if out.len() >= max {
            break;
        }
        let path = dirent.path();
        if path == dir || path.is_dir() {
            continue;
        }
        out.push(FileEntry { path: relative(dir, path), is_dir: false });
    }
    Ok(out)
}

/// Lines matching `pattern` in files under `dir`, optionally limited by an `include` glob.
pub fn grep_files(dir: &Path, pattern: &str, include: Option<&str>, max: usize) -> anyhow::Result<Vec<GrepMatch>> {
    let re = Regex::new(pattern)?;
    let mut builder = walker(dir);
    if let Some(glob) = include {
        let mut ob = OverrideBuilder::new(dir);
        ob.add(glob)?;
        builder.overrides(ob.build()?);
    }
    let mut out = Vec::new();
    'files: for dirent in builder.build().flatten() {
        let path = dirent.path();
        if !path.is_file() {
            continue;
        }
        let Ok(content) = fs::read_to_string(path) else { continue };
        for (i, line) in content.lines().enumerate() {
            if re.is_match(line) {
                out.push(GrepMatch { path: relative(dir, path), line: i + 1, text: line.to_string() });
                if out.len() >= max {
                    break 'files;
                }
            }
        }
    }
    Ok(out)
}

pub fn looks_like_project(dir: &Path) -> bool {
    PROJECT_MARKERS.iter().any(|m| dir.join(m).exists())
}

fn normalize_root(root: &Path) -> Option<PathBuf> {
    let abs = if root.is_absolute() { root.to_path_buf() } else { std::env::current_dir().ok()?.join(root) };
    abs.canonicalize().ok()
}

/// Resolves `rel` against `root`, refusing anything that escapes it.
pub fn resolve_under_root(root: &Path, rel: &str) -> Option<PathBuf> {
    let root_abs = normalize_root(root)?;
    let rel_path = Path::new(rel);
    let rel_path = if rel_path.is_absolute() {
        rel_path.strip_prefix(&root_abs).ok()?.to_path_buf()
    } else {
        rel_path.to_path_buf()
    };
    let mut normalized = PathBuf::new();
    for comp in rel_path.components() {
        match comp {
            Component::ParentDir => {
                if !normalized.pop() {
                    return None;
                }
            }
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
            other => normalized.push(other.as_os_str()),
        }
    }
    let full_path = root_abs.join(&normalized);
    match full_path.canonicalize() {
        Ok(canonical) => canonical.starts_with(&root_abs).then_some(canonical),
        Err(_) => {
            // Not created yet: the parent must still be inside the root.
            let parent = full_path.parent().unwrap_or(&root_abs);
            let parent_canon = parent.canonicalize().ok()?;
            parent_canon.starts_with(&root_abs).then_some(full_path)
        }
    }
}

pub fn read_file_under_root(root: &Path, rel: &str, max_bytes: usize) -> anyhow::Result<String> {
    let path = resolve_under_root(root, rel).ok_or_else(|| anyhow::anyhow!("path outside root: {rel}"))?;
    let meta = fs::metadata(&path)?;
    if !meta.is_file() {
        anyhow::bail!("not a file: {rel}");
    }
    let file = fs::File::open(&path)?;
    let mut bytes = Vec::with_capacity(max_bytes.min(meta.len() as usize));
    file.take(max_bytes as u64).read_to_end(&mut bytes)?;
    Ok(String::from_utf8_lossy(&bytes).to_string())
}
