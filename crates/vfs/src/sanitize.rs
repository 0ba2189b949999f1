use nimbus_core::Error;

const ILLEGAL: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];
const MAX_BYTES: usize = 255;

/// Makes a remote filename legal across target file systems: strips the
/// characters no mainstream file system accepts plus control characters,
/// truncates to 255 bytes on a UTF-8 boundary, and rejects the reserved
/// dot entries.
pub fn sanitize(name: &str) -> Result<String, Error> {
    if name == "." || name == ".." {
        return Err(Error::invalid_argument("reserved file name"));
    }
    let mut out: String = name
        .chars()
        .filter(|c| !ILLEGAL.contains(c) && !c.is_control())
        .collect();
    if out.is_empty() {
        return Err(Error::invalid_argument("file name is empty after sanitization"));
    }
    while out.len() > MAX_BYTES {
        out.pop();
    }
    Ok(out)
}
