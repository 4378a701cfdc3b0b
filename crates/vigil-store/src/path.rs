use crate::error::StoreError;

/// Check that `path` is a valid absolute store path.
///
/// Paths are `/`-separated, start with `/`, and contain no empty, `.` or `..`
/// segments. The root `/` itself is reserved and cannot hold a node.
pub fn validate(path: &str) -> Result<(), StoreError> {
    let invalid = |reason| StoreError::InvalidPath {
        path: path.to_string(),
        reason,
    };

    if !path.starts_with('/') {
        return Err(invalid("must be absolute"));
    }
    if path == "/" {
        return Err(invalid("root cannot hold a node"));
    }
    if path.ends_with('/') {
        return Err(invalid("trailing slash"));
    }
    for segment in path[1..].split('/') {
        match segment {
            "" => return Err(invalid("empty segment")),
            "." | ".." => return Err(invalid("relative segment")),
            s if s.chars().any(char::is_control) => {
                return Err(invalid("control character"))
            }
            _ => {}
        }
    }
    Ok(())
}
