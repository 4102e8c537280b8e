/// Strips exactly one leading and one trailing slash. An empty result
/// marks the request as malformed; the caller drops it permanently.
pub fn normalize_remote_path(raw: &str) -> String {
    let mut path = raw;
    if let Some(rest) = path.strip_prefix('/') {
        path = rest;
    }
    if let Some(rest) = path.strip_suffix('/') {
        path = rest;
    }
    path.to_string()
}

/// Absolute containing directory of a normalized remote file path.
/// Files directly under the root have no ancestors to create.
pub fn parent_directory(normalized: &str) -> Option<String> {
    normalized
        .rsplit_once('/')
        .map(|(dir, _)| format!("/{dir}"))
}

/// All ancestors of an absolute directory path, root-to-leaf:
/// `/pub/x` yields `["/pub", "/pub/x"]`.
pub fn ancestor_chain(dir: &str) -> Vec<String> {
    let mut chain = Vec::new();
    let mut current = String::new();
    for part in dir.split('/').filter(|part| !part.is_empty()) {
        current.push('/');
        current.push_str(part);
        chain.push(current.clone());
    }
    chain
}

pub fn join_dir(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{name}")
    } else {
        format!("{parent}/{name}")
    }
}
