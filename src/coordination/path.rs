//! Node path helpers

use crate::error::{Error, Result};

/// Width of the zero-padded counter appended to sequential node names
pub const SEQUENCE_WIDTH: usize = 10;

/// Check that `path` is absolute, has no empty components and no trailing slash
pub fn validate(path: &str) -> Result<()> {
    if path == "/" {
        return Ok(());
    }
    if !path.starts_with('/') {
        return Err(Error::InvalidPath(format!("{} is not absolute", path)));
    }
    if path.ends_with('/') {
        return Err(Error::InvalidPath(format!("{} has a trailing slash", path)));
    }
    for component in path[1..].split('/') {
        if component.is_empty() || component == "." || component == ".." {
            return Err(Error::InvalidPath(format!("{} has an invalid component", path)));
        }
    }
    Ok(())
}

/// Join a parent path and a child name
pub fn join(parent: &str, child: &str) -> String {
    if parent == "/" {
        format!("/{}", child)
    } else {
        format!("{}/{}", parent, child)
    }
}

/// Parent of a path; `None` for the root
pub fn parent(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

/// Last component of a path
pub fn local_name(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[idx + 1..],
        None => path,
    }
}

/// Numeric suffix assigned to a sequential node name
pub fn sequence_suffix(name: &str) -> Option<u64> {
    if name.len() < SEQUENCE_WIDTH {
        return None;
    }
    let digits = name.get(name.len() - SEQUENCE_WIDTH..)?;
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Whether `path` lies strictly below `ancestor`
pub fn is_descendant(path: &str, ancestor: &str) -> bool {
    if ancestor == "/" {
        return path != "/";
    }
    path.len() > ancestor.len()
        && path.starts_with(ancestor)
        && path.as_bytes()[ancestor.len()] == b'/'
}

/// Every non-root prefix of `path`, shortest first, ending with `path` itself
pub fn ancestors_and_self(path: &str) -> Vec<String> {
    let mut prefixes = Vec::new();
    let mut current = String::new();
    for component in path.split('/').filter(|c| !c.is_empty()) {
        current.push('/');
        current.push_str(component);
        prefixes.push(current.clone());
    }
    prefixes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate() {
        assert!(validate("/").is_ok());
        assert!(validate("/election").is_ok());
        assert!(validate("/services/registry").is_ok());
        assert!(validate("election").is_err());
        assert!(validate("/election/").is_err());
        assert!(validate("/a//b").is_err());
        assert!(validate("/a/../b").is_err());
    }

    #[test]
    fn test_join_and_split() {
        assert_eq!(join("/", "election"), "/election");
        assert_eq!(join("/election", "c_0000000001"), "/election/c_0000000001");
        assert_eq!(parent("/election/c_0000000001"), Some("/election"));
        assert_eq!(parent("/election"), Some("/"));
        assert_eq!(parent("/"), None);
        assert_eq!(local_name("/election/c_0000000001"), "c_0000000001");
    }

    #[test]
    fn test_sequence_suffix() {
        assert_eq!(sequence_suffix("c_0000000042"), Some(42));
        assert_eq!(sequence_suffix("n_0000000000"), Some(0));
        assert_eq!(sequence_suffix("c_42"), None);
        assert_eq!(sequence_suffix("registry"), None);
    }

    #[test]
    fn test_is_descendant() {
        assert!(is_descendant("/cluster/registry", "/cluster"));
        assert!(is_descendant("/a/b/c", "/a"));
        assert!(is_descendant("/election", "/"));
        assert!(!is_descendant("/cluster", "/cluster"));
        assert!(!is_descendant("/clusters", "/cluster"));
        assert!(!is_descendant("/cluster", "/cluster/registry"));
    }

    #[test]
    fn test_ancestors() {
        assert_eq!(
            ancestors_and_self("/a/b/c"),
            vec!["/a".to_string(), "/a/b".to_string(), "/a/b/c".to_string()]
        );
        assert!(ancestors_and_self("/").is_empty());
    }
}
