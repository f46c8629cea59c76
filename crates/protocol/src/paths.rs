//! Logical directory paths: always absolute, `/`-separated, no trailing slash
//! (except the root itself).

pub const ROOT_PATH: &str = "/";

/// Normalize a logical directory path.
///
/// Backslashes become `/`, empty and `.` segments are dropped, `..` removes the
/// segment before it (never climbing above the root), and the result always
/// starts with `/`. An empty input maps to the root.
pub fn normalize_dir_path(raw: &str) -> String {
    let value = raw.trim().replace('\\', "/");
    let mut segments: Vec<&str> = Vec::new();
    for segment in value.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            name => segments.push(name),
        }
    }
    if segments.is_empty() {
        return ROOT_PATH.to_string();
    }
    format!("/{}", segments.join("/"))
}

/// Depth of a normalized path; the root is 0.
pub fn path_depth(path: &str) -> usize {
    if path == ROOT_PATH {
        return 0;
    }
    path.matches('/').count()
}

/// Parent of a normalized path, `None` for the root.
pub fn parent_dir(path: &str) -> Option<String> {
    if path == ROOT_PATH {
        return None;
    }
    match path.rfind('/') {
        Some(0) | None => Some(ROOT_PATH.to_string()),
        Some(idx) => Some(path[..idx].to_string()),
    }
}

/// Directory holding a logical file path (`/a/b/x.md` → `/a/b`).
pub fn file_dir(logical_path: &str) -> String {
    let normalized = normalize_dir_path(logical_path);
    parent_dir(&normalized).unwrap_or_else(|| ROOT_PATH.to_string())
}

/// Lowercased extension of a file name, without the dot.
pub fn file_extension(file_name: &str) -> Option<String> {
    let (stem, ext) = file_name.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}
