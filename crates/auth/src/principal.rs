//! Principal to user name mapping

/// User name recorded for sessions that never authenticated
pub const UNKNOWN_USER: &str = "unknown";

/// Reduce a mechanism principal to the bare user name
///
/// Everything from the first `@` is dropped, then everything from the first
/// `/`: `bob@EXAMPLE.COM/node1` and `bob/node1@EXAMPLE.COM` both become
/// `bob`.
pub fn canonicalize_username(principal: &str) -> &str {
    let name = match principal.find('@') {
        Some(pos) => &principal[..pos],
        None => principal,
    };
    match name.find('/') {
        Some(pos) => &name[..pos],
        None => name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonicalize_username() {
        assert_eq!(canonicalize_username("bob@EXAMPLE.COM/node1"), "bob");
        assert_eq!(canonicalize_username("bob/node1@EXAMPLE.COM"), "bob");
        assert_eq!(canonicalize_username("bob@EXAMPLE.COM"), "bob");
        assert_eq!(canonicalize_username("pegasus/host.example.com"), "pegasus");
        assert_eq!(canonicalize_username("client.admin"), "client.admin");
        assert_eq!(canonicalize_username("a@b@c"), "a");
        assert_eq!(canonicalize_username("@EXAMPLE.COM"), "");
        assert_eq!(canonicalize_username(""), "");
    }
}
