use std::collections::HashSet;

/// Set of absolute remote directory paths known to exist. Owned
/// exclusively by the sync worker; rebuilt wholesale on every refresh
/// and extended by successful mkdir calls in between. A stale entry
/// costs at most one redundant mkdir or one failed store that retries.
#[derive(Debug, Default)]
pub struct DirectoryCache {
    inner: HashSet<String>,
}

impl DirectoryCache {
    pub fn contains(&self, path: &str) -> bool {
        self.inner.contains(path)
    }

    /// Returns `true` if the path was not already present.
    pub fn mark_present(&mut self, path: String) -> bool {
        self.inner.insert(path)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.inner.iter().map(String::as_str)
    }
}
