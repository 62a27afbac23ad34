//! Framework detection heuristics (fastapi / flask / django / none).
//!
//! Affects default entrypoints and ports only; an explicit user entrypoint
//! always wins regardless of what's detected here.

use std::path::{Path, PathBuf};

use crate::project::Framework;

const MARKER_FILE_DJANGO: &str = "manage.py";

/// Scans declared dependencies (exact match), then a requirements file,
/// then a marker file, in that order. The first hit wins.
pub fn detect(context_root: &Path, declared_dependencies: &[String], include_paths: &[PathBuf]) -> Framework {
    if let Some(framework) = detect_from_dependency_names(declared_dependencies) {
        return framework;
    }
    if let Some(framework) = detect_from_requirements_file(context_root) {
        return framework;
    }
    if context_root.join(MARKER_FILE_DJANGO).is_file() {
        return Framework::Django;
    }
    let _ = include_paths;
    Framework::None
}

fn package_name_from_dependency_line(line: &str) -> &str {
    let line = line.trim();
    let cut = line
        .find(|c: char| matches!(c, '=' | '<' | '>' | '!' | '~' | ';' | '[' | ' '))
        .unwrap_or(line.len());
    &line[..cut]
}

fn framework_for_package_name(name: &str) -> Option<Framework> {
    match name {
        "fastapi" => Some(Framework::FastApi),
        "flask" => Some(Framework::Flask),
        "django" | "Django" => Some(Framework::Django),
        _ => None,
    }
}

fn detect_from_dependency_names(dependencies: &[String]) -> Option<Framework> {
    dependencies
        .iter()
        .find_map(|dep| framework_for_package_name(package_name_from_dependency_line(dep)))
}

fn detect_from_requirements_file(context_root: &Path) -> Option<Framework> {
    let text = std::fs::read_to_string(context_root.join("requirements.txt")).ok()?;
    text.lines()
        .filter(|line| !line.trim().is_empty() && !line.trim_start().starts_with('#'))
        .find_map(|line| framework_for_package_name(package_name_from_dependency_line(line)))
}

/// Default entrypoint argv for a detected framework; `None` for `Framework::None`,
/// in which case the caller falls back to the project-scripts-derived entrypoint.
pub fn default_entrypoint(framework: Framework, module: Option<&str>, interpreter: &str) -> Option<Vec<String>> {
    match framework {
        Framework::FastApi => {
            let module = module.unwrap_or("main");
            Some(vec![
                "uvicorn".to_string(),
                format!("{module}:app"),
                "--host".to_string(),
                "0.0.0.0".to_string(),
                "--port".to_string(),
                "8000".to_string(),
            ])
        }
        Framework::Flask => Some(vec![
            "flask".to_string(),
            "run".to_string(),
            "--host=0.0.0.0".to_string(),
        ]),
        Framework::Django => Some(vec![
            interpreter.to_string(),
            "manage.py".to_string(),
            "runserver".to_string(),
            "0.0.0.0:8000".to_string(),
        ]),
        Framework::None => None,
    }
}

/// Line-oriented search for the first `*.py` file (in lexicographic path
/// order) that imports `FastAPI` and instantiates it as `= FastAPI(`.
/// Deliberately not a Python parser: a substring scan over two adjacent
/// signals (an import line, then an instantiation line) in the same file.
pub fn find_fastapi_module(include_paths: &[PathBuf], context_root: &Path) -> Option<String> {
    let mut python_files = Vec::new();
    for include_path in include_paths {
        let full = context_root.join(include_path);
        collect_python_files(&full, &mut python_files);
    }
    python_files.sort();

    for path in &python_files {
        let Ok(text) = std::fs::read_to_string(path) else {
            continue;
        };
        let mut saw_import = false;
        for line in text.lines() {
            let trimmed = line.trim();
            if (trimmed.starts_with("import ") || trimmed.starts_with("from ")) && trimmed.contains("FastAPI") {
                saw_import = true;
                continue;
            }
            if saw_import && (trimmed.contains("= FastAPI(") || trimmed.contains("=FastAPI(")) {
                return Some(module_name_for(path, context_root));
            }
        }
    }
    None
}

fn collect_python_files(dir: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_python_files(&path, out);
        } else if path.extension().is_some_and(|ext| ext == "py") {
            out.push(path);
        }
    }
}

fn module_name_for(path: &Path, context_root: &Path) -> String {
    let relative = path.strip_prefix(context_root).unwrap_or(path);
    let without_ext = relative.with_extension("");
    without_ext
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect::<Vec<_>>()
        .join(".")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_from_dependency_name() {
        let deps = vec!["fastapi>=0.100".to_string(), "uvicorn".to_string()];
        assert_eq!(detect_from_dependency_names(&deps), Some(Framework::FastApi));
    }

    #[test]
    fn detects_django_marker_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(MARKER_FILE_DJANGO), "").unwrap();
        assert_eq!(detect(dir.path(), &[], &[]), Framework::Django);
    }

    #[test]
    fn none_when_nothing_matches() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(detect(dir.path(), &[], &[]), Framework::None);
    }

    #[test]
    fn finds_fastapi_module() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("main.py"),
            "from fastapi import FastAPI\napp = FastAPI()\n",
        )
        .unwrap();
        let found = find_fastapi_module(&[PathBuf::from(".")], dir.path());
        assert_eq!(found, Some("main".to_string()));
    }

    #[test]
    fn default_entrypoint_for_flask() {
        let argv = default_entrypoint(Framework::Flask, None, "python").unwrap();
        assert_eq!(argv, vec!["flask", "run", "--host=0.0.0.0"]);
    }
}
