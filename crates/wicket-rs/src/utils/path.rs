//! Path helpers: upstream URL assembly, glob compilation, prefix stripping.

use regex::Regex;

/// Formats a complete URL for upstream service requests.
///
/// Combines scheme, host, port and the rewritten path into the target URL
/// used by the forwarder.
///
/// # Examples
///
/// ```rust
/// use wicket_rs::utils::path::format_route;
///
/// let url = format_route("http", "api-server", 8080, "/v1/users/123");
/// assert_eq!(url, "http://api-server:8080/v1/users/123");
/// ```
pub fn format_route(scheme: &str, host: &str, port: u16, path: &str) -> String {
    format!("{}://{}:{}{}", scheme, host, port, path)
}

/// Compiles a path glob into an anchored regex.
///
/// Glob semantics:
/// - `*` matches exactly one path segment (no `/`)
/// - `**` matches any suffix, including nested segments
///
/// `/api/*` matches `/api/x` but not `/api/x/y`; `/api/**` matches both.
pub fn compile_glob(pattern: &str) -> Result<Regex, regex::Error> {
    let mut out = String::with_capacity(pattern.len() * 2);
    out.push('^');

    let bytes = pattern.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'*' => {
                if i + 1 < bytes.len() && bytes[i + 1] == b'*' {
                    out.push_str(".*");
                    i += 2;
                } else {
                    out.push_str("[^/]+");
                    i += 1;
                }
            }
            c => {
                let ch = c as char;
                // Escape regex metacharacters in the literal parts
                if ".?+^$[]()|\\{}".contains(ch) {
                    out.push('\\');
                }
                out.push(ch);
                i += 1;
            }
        }
    }

    out.push('$');
    Regex::new(&out)
}

/// Returns true when `path` matches the glob `pattern`.
///
/// Invalid patterns never match; they are reported at config validation time.
pub fn glob_matches(pattern: &str, path: &str) -> bool {
    match compile_glob(pattern) {
        Ok(re) => re.is_match(path),
        Err(_) => false,
    }
}

/// Drops the first `n` segments from a path.
///
/// `strip_prefix_segments("/api/v1/users", 1)` yields `/v1/users`;
/// stripping more segments than the path has yields `/`.
pub fn strip_prefix_segments(path: &str, n: usize) -> String {
    if n == 0 {
        return path.to_string();
    }

    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if n >= segments.len() {
        return "/".to_string();
    }

    let mut out = String::new();
    for segment in &segments[n..] {
        out.push('/');
        out.push_str(segment);
    }
    out
}
