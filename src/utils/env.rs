/// Get an environment variable with the `TOLLGATE_` prefix, falling back to the bare name
///
/// `get_env_with_prefix("PORT")` checks `TOLLGATE_PORT` first, then `PORT`, which
/// keeps platform-provided variables working without renaming them.
///
/// ```rust
/// use tollgate::utils::get_env_with_prefix;
///
/// let secret = get_env_with_prefix("PAYMENTS_WEBHOOK_SECRET");
/// ```
pub fn get_env_with_prefix(key: &str) -> Option<String> {
    std::env::var(format!("TOLLGATE_{}", key))
        .or_else(|_| std::env::var(key))
        .ok()
}

/// Parse an environment variable, ignoring values that fail to parse.
pub fn parse_env_with_prefix<T: std::str::FromStr>(key: &str) -> Option<T> {
    get_env_with_prefix(key).and_then(|v| v.trim().parse().ok())
}
