//! Semantic validation of tunnel specs.
//!
//! Shape is assumed valid (it deserialized); this checks ports, targets,
//! backend compatibility and collisions with tunnels already accepted.

use std::collections::HashSet;
use std::fmt;
use std::net::{IpAddr, Ipv6Addr};

use smite_core::config::PortRange;

use crate::model::{BackendKind, Tunnel, TunnelKind, TunnelRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationKind {
    InvalidPort,
    InvalidTarget,
    UnsupportedType,
    MissingNode,
    PortConflict,
    /// A `node_id` on a kind that never runs on a node.
    UnexpectedNode,
    /// The id cannot be used as a service or file name.
    InvalidId,
}

impl ValidationKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidPort => "InvalidPort",
            Self::InvalidTarget => "InvalidTarget",
            Self::UnsupportedType => "UnsupportedType",
            Self::MissingNode => "MissingNode",
            Self::PortConflict => "PortConflict",
            Self::UnexpectedNode => "UnexpectedNode",
            Self::InvalidId => "InvalidId",
        }
    }
}

impl fmt::Display for ValidationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct ValidationError {
    pub kind: ValidationKind,
    pub message: String,
}

impl ValidationError {
    pub fn new(kind: ValidationKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// What a spec is checked against.
pub struct ValidationContext<'a> {
    pub port_range: PortRange,
    /// Accepted tunnels that still hold their ports (everything not stopped).
    pub claims: &'a [Tunnel],
    /// Ids of registered nodes.
    pub nodes: &'a HashSet<String>,
}

/// Validate `req` and return the typed tunnel.
///
/// A claim with the same id as `req` is ignored so a spec replacement never
/// conflicts with itself.
pub fn validate(req: &TunnelRequest, ctx: &ValidationContext<'_>) -> Result<Tunnel, ValidationError> {
    check_tunnel_id(&req.id)?;
    let kind = TunnelKind::parse(&req.kind).ok_or_else(|| {
        ValidationError::new(
            ValidationKind::UnsupportedType,
            format!("unsupported tunnel type '{}'", req.kind),
        )
    })?;

    check_port(ctx.port_range, req.spec.listen_port, "listen_port")?;
    parse_target(&req.spec.forward_to)?;

    let node_id = match kind {
        TunnelKind::Rathole => {
            let node_id = req
                .node_id
                .as_deref()
                .filter(|id| !id.is_empty())
                .ok_or_else(|| {
                    ValidationError::new(
                        ValidationKind::MissingNode,
                        "rathole tunnels require node_id",
                    )
                })?;
            if !ctx.nodes.contains(node_id) {
                return Err(ValidationError::new(
                    ValidationKind::MissingNode,
                    format!("node '{node_id}' is not registered"),
                ));
            }
            let remote_port = req.spec.remote_port.ok_or_else(|| {
                ValidationError::new(
                    ValidationKind::InvalidPort,
                    "rathole tunnels require remote_port",
                )
            })?;
            check_port(ctx.port_range, remote_port, "remote_port")?;
            Some(node_id.to_string())
        }
        _ => {
            if req.node_id.as_deref().is_some_and(|id| !id.is_empty()) {
                return Err(ValidationError::new(
                    ValidationKind::UnexpectedNode,
                    format!("{kind} tunnels do not run on a node"),
                ));
            }
            None
        }
    };

    let backend = kind.backend();
    for other in ctx.claims.iter().filter(|t| t.id != req.id) {
        if other.backend() == backend && other.spec.listen_port == req.spec.listen_port {
            return Err(ValidationError::new(
                ValidationKind::PortConflict,
                format!(
                    "listen_port {} already used by tunnel {} on the {backend} backend",
                    req.spec.listen_port, other.id
                ),
            ));
        }
        if backend == BackendKind::Reverse
            && other.node_id == node_id
            && other.spec.remote_port.is_some()
            && other.spec.remote_port == req.spec.remote_port
        {
            return Err(ValidationError::new(
                ValidationKind::PortConflict,
                format!(
                    "remote_port {} already used by tunnel {} on node {}",
                    req.spec.remote_port.unwrap_or_default(),
                    other.id,
                    node_id.as_deref().unwrap_or_default()
                ),
            ));
        }
    }

    Ok(Tunnel {
        id: req.id.clone(),
        name: if req.name.is_empty() {
            req.id.clone()
        } else {
            req.name.clone()
        },
        kind,
        spec: req.spec.clone(),
        node_id,
    })
}

/// Tunnel ids become rathole service names and config file names: ASCII
/// letters, digits, `-`, `_` and `.`, not starting with a dot.
pub fn check_tunnel_id(id: &str) -> Result<(), ValidationError> {
    let valid = !id.is_empty()
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(ValidationError::new(
            ValidationKind::InvalidId,
            format!("tunnel id '{id}' may only contain letters, digits, '-', '_' and '.', and must not start with '.'"),
        ))
    }
}

fn check_port(range: PortRange, port: u16, field: &str) -> Result<(), ValidationError> {
    if port == 0 || !range.contains(port) {
        return Err(ValidationError::new(
            ValidationKind::InvalidPort,
            format!("{field} {port} outside allowed range {}-{}", range.min, range.max),
        ));
    }
    Ok(())
}

/// Parse a `host:port` target. IPv6 literals must be bracketed.
pub fn parse_target(target: &str) -> Result<(String, u16), ValidationError> {
    let invalid = |why: &str| {
        ValidationError::new(
            ValidationKind::InvalidTarget,
            format!("forward_to '{target}' {why}"),
        )
    };

    let (host, port) = target
        .rsplit_once(':')
        .ok_or_else(|| invalid("is not host:port"))?;
    let port: u16 = port.parse().map_err(|_| invalid("has an invalid port"))?;
    if port == 0 {
        return Err(invalid("has port 0"));
    }

    if let Some(inner) = host.strip_prefix('[') {
        let inner = inner
            .strip_suffix(']')
            .ok_or_else(|| invalid("has an unterminated IPv6 literal"))?;
        inner
            .parse::<Ipv6Addr>()
            .map_err(|_| invalid("has an invalid IPv6 address"))?;
        return Ok((inner.to_string(), port));
    }

    if host.is_empty() {
        return Err(invalid("has an empty host"));
    }
    if host.contains(':') {
        return Err(invalid("needs brackets around an IPv6 address"));
    }
    if host.parse::<IpAddr>().is_err() && !is_hostname(host) {
        return Err(invalid("has an invalid host"));
    }
    Ok((host.to_string(), port))
}

fn is_hostname(host: &str) -> bool {
    host.len() <= 253
        && host.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::model::TunnelSpec;

    fn request(id: &str, kind: &str, listen_port: u16) -> TunnelRequest {
        TunnelRequest {
            id: id.into(),
            name: String::new(),
            kind: kind.into(),
            spec: TunnelSpec {
                listen_port,
                forward_to: "10.0.0.5:80".into(),
                remote_port: None,
                token: None,
            },
            node_id: None,
        }
    }

    fn rathole(id: &str, listen_port: u16, remote_port: u16) -> TunnelRequest {
        let mut req = request(id, "rathole", listen_port);
        req.spec.remote_port = Some(remote_port);
        req.node_id = Some("node-1".into());
        req
    }

    fn check(req: &TunnelRequest, claims: &[Tunnel]) -> Result<Tunnel, ValidationError> {
        let nodes: HashSet<String> = ["node-1".to_string()].into();
        validate(
            req,
            &ValidationContext {
                port_range: PortRange { min: 1024, max: 65535 },
                claims,
                nodes: &nodes,
            },
        )
    }

    fn kind_of(result: Result<Tunnel, ValidationError>) -> ValidationKind {
        result.unwrap_err().kind
    }

    #[test]
    fn accepts_plain_tcp() {
        let tunnel = check(&request("t1", "tcp", 8001), &[]).unwrap();
        assert_eq!(tunnel.kind, TunnelKind::Tcp);
        assert_eq!(tunnel.name, "t1");
        assert!(tunnel.node_id.is_none());
    }

    #[test]
    fn rejects_unknown_type() {
        assert_eq!(
            kind_of(check(&request("t1", "wireguard", 8001), &[])),
            ValidationKind::UnsupportedType
        );
    }

    #[test]
    fn rejects_port_outside_range() {
        assert_eq!(
            kind_of(check(&request("t1", "tcp", 80), &[])),
            ValidationKind::InvalidPort
        );
    }

    #[test]
    fn rejects_bad_targets() {
        for target in ["10.0.0.5", "10.0.0.5:0", ":80", "host:http", "[::1:80", "::1:80", "bad_host:80"] {
            let mut req = request("t1", "tcp", 8001);
            req.spec.forward_to = target.into();
            assert_eq!(kind_of(check(&req, &[])), ValidationKind::InvalidTarget, "{target}");
        }
    }

    #[test]
    fn rejects_ids_unusable_as_file_names() {
        for id in ["", ".hidden", "../../etc/x", "a/b", "has space", "tünnel"] {
            let req = rathole(id, 2333, 443);
            assert_eq!(kind_of(check(&req, &[])), ValidationKind::InvalidId, "{id:?}");
        }
        for id in ["web-1", "ssh_bastion", "api.v2", "A9"] {
            assert!(check(&rathole(id, 2333, 443), &[]).is_ok(), "{id:?}");
        }
    }

    #[test]
    fn accepts_hostname_and_ipv6_targets() {
        assert_eq!(parse_target("backend.internal:443").unwrap().1, 443);
        assert_eq!(parse_target("[::1]:22").unwrap().0, "::1");
    }

    #[test]
    fn rathole_requires_registered_node_and_remote_port() {
        let mut req = rathole("r1", 2333, 443);
        req.node_id = None;
        assert_eq!(kind_of(check(&req, &[])), ValidationKind::MissingNode);

        req.node_id = Some("node-9".into());
        assert_eq!(kind_of(check(&req, &[])), ValidationKind::MissingNode);

        let mut req = rathole("r1", 2333, 443);
        req.spec.remote_port = None;
        assert_eq!(kind_of(check(&req, &[])), ValidationKind::InvalidPort);
    }

    #[test]
    fn node_on_forwarding_kind_is_rejected() {
        let mut req = request("t1", "udp", 8001);
        req.node_id = Some("node-1".into());
        assert_eq!(kind_of(check(&req, &[])), ValidationKind::UnexpectedNode);
    }

    #[test]
    fn duplicate_listen_port_on_same_backend_conflicts() {
        let first = check(&request("t1", "tcp", 9000), &[]).unwrap();
        assert_eq!(
            kind_of(check(&request("t2", "grpc", 9000), &[first])),
            ValidationKind::PortConflict
        );
    }

    #[test]
    fn same_listen_port_on_other_backend_is_allowed() {
        let first = check(&request("t1", "tcp", 9000), &[]).unwrap();
        assert!(check(&rathole("r1", 9000, 443), &[first]).is_ok());
    }

    #[test]
    fn replacement_does_not_conflict_with_itself() {
        let first = check(&request("t1", "tcp", 9000), &[]).unwrap();
        assert!(check(&request("t1", "tcp", 9000), &[first]).is_ok());
    }

    #[test]
    fn remote_port_unique_per_node() {
        let first = check(&rathole("r1", 2333, 443), &[]).unwrap();
        assert_eq!(
            kind_of(check(&rathole("r2", 2334, 443), &[first])),
            ValidationKind::PortConflict
        );
    }
}
