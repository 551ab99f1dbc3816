use std::num::ParseIntError;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum HostPortError {
    #[error("missing ']' in address {0:?}")]
    MissingBracket(String),
    #[error("unexpected '[' or ']' in address {0:?}")]
    UnexpectedBracket(String),
    #[error("too many colons in address {0:?}")]
    TooManyColons(String),
    #[error("missing port in address {0:?}")]
    MissingPort(String),
    #[error("invalid port in address {address:?}: {source}")]
    InvalidPort {
        address: String,
        #[source]
        source: ParseIntError,
    },
}

/// Default port for a URL scheme, if it has one.
pub fn default_port(scheme: &str) -> Option<u16> {
    if scheme.eq_ignore_ascii_case("https") {
        Some(443)
    } else if scheme.eq_ignore_ascii_case("http") {
        Some(80)
    } else {
        None
    }
}

/// Splits `host`, `host%zone`, `[host]`, `[host%zone]`, `host:port`,
/// `host%zone:port`, `[host]:port`, `[host%zone]:port` or `:port` into host
/// and port.
///
/// When the input carries no port the default port of `scheme` is returned,
/// or `None` for an unknown scheme.
///
/// ```
/// use http_telemetry::host_port::split_host_port;
///
/// assert_eq!(split_host_port("[::1]:8080", "").unwrap(), ("::1".to_string(), Some(8080)));
/// assert_eq!(split_host_port("example.com", "https").unwrap(), ("example.com".to_string(), Some(443)));
/// assert!(split_host_port("[::1", "").is_err());
/// ```
pub fn split_host_port(
    hostport: &str,
    scheme: &str,
) -> Result<(String, Option<u16>), HostPortError> {
    if let Some(rest) = hostport.strip_prefix('[') {
        let Some(end) = rest.find(']') else {
            return Err(HostPortError::MissingBracket(hostport.to_owned()));
        };
        let host = &rest[..end];
        let after = &rest[end + 1..];

        if host.contains('[') || host.contains(']') {
            return Err(HostPortError::UnexpectedBracket(hostport.to_owned()));
        }

        if after.is_empty() {
            return Ok((host.to_owned(), default_port(scheme)));
        }

        let Some(port) = after.strip_prefix(':') else {
            return Err(if after.contains(']') {
                HostPortError::UnexpectedBracket(hostport.to_owned())
            } else {
                HostPortError::MissingPort(hostport.to_owned())
            });
        };

        return Ok((host.to_owned(), Some(parse_port(hostport, port)?)));
    }

    let Some(colon) = hostport.rfind(':') else {
        if hostport.contains(']') {
            return Err(HostPortError::UnexpectedBracket(hostport.to_owned()));
        }
        return Ok((hostport.to_owned(), default_port(scheme)));
    };

    let (host, port) = (&hostport[..colon], &hostport[colon + 1..]);

    if host.contains(':') {
        return Err(HostPortError::TooManyColons(hostport.to_owned()));
    }
    if host.contains('[') || host.contains(']') {
        return Err(HostPortError::UnexpectedBracket(hostport.to_owned()));
    }

    Ok((host.to_owned(), Some(parse_port(hostport, port)?)))
}

fn parse_port(address: &str, port: &str) -> Result<u16, HostPortError> {
    port.parse::<u16>().map_err(|source| HostPortError::InvalidPort {
        address: address.to_owned(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn split(hostport: &str, scheme: &str) -> (String, Option<u16>) {
        split_host_port(hostport, scheme).unwrap()
    }

    #[test]
    fn host_only_uses_scheme_default() {
        assert_eq!(split("example.com", "https"), ("example.com".into(), Some(443)));
        assert_eq!(split("example.com", "http"), ("example.com".into(), Some(80)));
        assert_eq!(split("example.com", "HTTPS"), ("example.com".into(), Some(443)));
        assert_eq!(split("example.com", ""), ("example.com".into(), None));
        assert_eq!(split("example.com", "ftp"), ("example.com".into(), None));
    }

    #[test]
    fn host_and_port() {
        assert_eq!(split("example.com:8080", "https"), ("example.com".into(), Some(8080)));
        assert_eq!(split("127.0.0.1:1", ""), ("127.0.0.1".into(), Some(1)));
    }

    #[test]
    fn zone_with_port() {
        assert_eq!(split("host%eth0:9000", ""), ("host%eth0".into(), Some(9000)));
    }

    #[test]
    fn bracketed_ipv6() {
        assert_eq!(split("[::1]:8080", ""), ("::1".into(), Some(8080)));
        assert_eq!(split("[::1]", "http"), ("::1".into(), Some(80)));
        assert_eq!(split("[::1]", ""), ("::1".into(), None));
        assert_eq!(split("[fe80::1%lo0]:443", ""), ("fe80::1%lo0".into(), Some(443)));
    }

    #[test]
    fn bare_port() {
        assert_eq!(split(":8080", "https"), ("".into(), Some(8080)));
    }

    #[test]
    fn rejects_malformed_input() {
        assert_eq!(
            split_host_port("[::1", ""),
            Err(HostPortError::MissingBracket("[::1".into()))
        );
        assert!(matches!(
            split_host_port("example.com:http", ""),
            Err(HostPortError::InvalidPort { .. })
        ));
        assert!(matches!(
            split_host_port("example.com:70000", ""),
            Err(HostPortError::InvalidPort { .. })
        ));
        assert!(matches!(
            split_host_port("example.com:", ""),
            Err(HostPortError::InvalidPort { .. })
        ));
        assert_eq!(
            split_host_port("::1:80", ""),
            Err(HostPortError::TooManyColons("::1:80".into()))
        );
        assert_eq!(
            split_host_port("[::1]x", ""),
            Err(HostPortError::MissingPort("[::1]x".into()))
        );
    }
}
