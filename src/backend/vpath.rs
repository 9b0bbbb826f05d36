//! Virtual path canonicalization.
//!
//! Every path entering the gateway is normalized to an absolute
//! `/`-separated form with `.` and `..` resolved and no trailing slash,
//! the root itself being the single exception.

/// Canonicalize `input` by rooting it at `/` and resolving dot segments.
///
/// `..` at the root is clamped, so no canonical path can escape the
/// exported tree.
pub fn canonical(input: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for segment in input.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        "/".to_owned()
    } else {
        format!("/{}", parts.join("/"))
    }
}

/// Parent of a canonical path. The root is its own parent.
pub fn parent(path: &str) -> String {
    match path.rfind('/') {
        Some(0) | None => "/".to_owned(),
        Some(idx) => path[..idx].to_owned(),
    }
}

/// Last component of a canonical path, `/` for the root.
pub fn leaf(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) if idx + 1 < path.len() => &path[idx + 1..],
        _ => "/",
    }
}

/// Join a child name onto a canonical directory path.
pub fn join(dir: &str, name: &str) -> String {
    if dir == "/" {
        format!("/{name}")
    } else {
        format!("{dir}/{name}")
    }
}
