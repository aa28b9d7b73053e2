//! Path rewriting: turn a gateway URI into the upstream URI

use crate::config::RewriteRule;

/// Apply `rule` to `uri`, whose path is known to start with `prefix`
///
/// The query string is preserved and the result always starts with `/`.
pub fn rewrite_uri(rule: &RewriteRule, prefix: &str, uri: &http::Uri) -> http::Uri {
    let path = uri.path();

    let new_path = match rule {
        RewriteRule::Preserve => path.to_string(),
        RewriteRule::StripPrefix => ensure_leading_slash(strip(path, prefix)),
        RewriteRule::Replace(replacement) => {
            let rest = strip(path, prefix);
            let base = replacement.trim_end_matches('/');
            let joined = if rest.is_empty() || rest == "/" {
                format!("{}{}", base, rest)
            } else {
                format!("{}{}", base, ensure_leading_slash(rest))
            };
            ensure_leading_slash(&joined)
        }
    };

    let path_and_query = match uri.query() {
        Some(query) => format!("{}?{}", new_path, query),
        None => new_path,
    };

    http::Uri::builder()
        .path_and_query(path_and_query)
        .build()
        .unwrap_or_else(|_| uri.clone())
}

fn strip<'a>(path: &'a str, prefix: &str) -> &'a str {
    if prefix == "/" {
        return path;
    }
    path.strip_prefix(prefix).unwrap_or(path)
}

fn ensure_leading_slash(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    }
}
