pub mod download;
pub mod list;
pub mod mkdir;
pub mod mount;
pub mod mv;
pub mod rm;
pub mod upload;

/// Splits a path argument into its parent and leaf components.
pub fn parent_and_leaf(path: &str) -> (String, String) {
    let trimmed = path.trim_matches('/');
    match trimmed.rsplit_once('/') {
        Some((parent, leaf)) => (parent.to_string(), leaf.to_string()),
        None => (String::new(), trimmed.to_string()),
    }
}
