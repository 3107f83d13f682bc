use std::borrow::Cow;

/// Normalize a bind address.
///
/// The shorthand `":PORT"` means "all interfaces"; tokio's bind APIs do not
/// accept it, so it becomes `"0.0.0.0:PORT"`. Tunnel uris always carry a
/// host, so only config-level addresses such as `metrics_addr` use the
/// shorthand.
pub fn normalize_bind_addr(addr: &str) -> Cow<'_, str> {
    let addr = addr.trim();
    if addr.starts_with(':') {
        Cow::Owned(format!("0.0.0.0{addr}"))
    } else {
        Cow::Borrowed(addr)
    }
}

/// Joins a host and port, bracketing bare IPv6 literals.
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// Splits `host:port` back into its parts. The host keeps any IPv6 brackets.
pub fn split_host_port(addr: &str) -> Option<(&str, u16)> {
    let (host, port) = addr.trim().rsplit_once(':')?;
    let port = port.parse().ok()?;
    Some((host, port))
}
