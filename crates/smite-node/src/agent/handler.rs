//! Applies pushed rathole fragments to local client configs.
//!
//! Each reverse tunnel talks to its own panel-side rathole server, so every
//! service gets its own `<service>.client.toml` in the state directory. A
//! hot-reloading rathole client watches those files. The files are the
//! agent's durable state: they survive restarts and are listed on load.

use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use smite_proto::{ConfigPayload, RatholeFragment};

use super::error::AgentError;

const CLIENT_SUFFIX: &str = ".client.toml";

#[derive(Serialize)]
struct ClientFile<'a> {
    client: ClientSection<'a>,
}

#[derive(Serialize)]
struct ClientSection<'a> {
    remote_addr: &'a str,
    services: BTreeMap<&'a str, ClientService<'a>>,
}

#[derive(Serialize)]
struct ClientService<'a> {
    token: &'a str,
    local_addr: &'a str,
}

/// Render the rathole client config for one fragment.
pub fn render_client_toml(fragment: &RatholeFragment) -> Result<String, toml::ser::Error> {
    let mut services = BTreeMap::new();
    services.insert(
        fragment.service.as_str(),
        ClientService {
            token: &fragment.token,
            local_addr: &fragment.local_addr,
        },
    );
    toml::to_string(&ClientFile {
        client: ClientSection {
            remote_addr: &fragment.remote_addr,
            services,
        },
    })
}

/// Result of handling one push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Written,
    Unchanged,
    Removed,
    /// Remove for a service this node does not carry.
    Absent,
}

pub struct ConfigHandler {
    state_dir: PathBuf,
    /// Services with a client config on disk. Serializes file updates.
    services: Mutex<BTreeSet<String>>,
}

impl ConfigHandler {
    /// Open the state directory, creating it if needed, and pick up the
    /// client configs already in it.
    pub async fn load(state_dir: impl Into<PathBuf>) -> Result<Self, AgentError> {
        let state_dir = state_dir.into();
        tokio::fs::create_dir_all(&state_dir)
            .await
            .map_err(|e| state_error(&state_dir, &e))?;

        let mut services = BTreeSet::new();
        let mut entries = tokio::fs::read_dir(&state_dir)
            .await
            .map_err(|e| state_error(&state_dir, &e))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| state_error(&state_dir, &e))?
        {
            let name = entry.file_name();
            if let Some(service) = name.to_str().and_then(|n| n.strip_suffix(CLIENT_SUFFIX)) {
                services.insert(service.to_string());
            }
        }
        info!(state_dir = %state_dir.display(), services = services.len(), "Loaded client configs");

        Ok(Self {
            state_dir,
            services: Mutex::new(services),
        })
    }

    pub fn config_path(&self, service: &str) -> PathBuf {
        self.state_dir.join(format!("{service}{CLIENT_SUFFIX}"))
    }

    /// Services currently configured, sorted.
    pub async fn services(&self) -> Vec<String> {
        self.services.lock().await.iter().cloned().collect()
    }

    /// Apply one pushed payload. An `Err` carries the nack reason.
    pub async fn handle(&self, payload: &ConfigPayload) -> Result<Applied, String> {
        check_service(payload.service())?;
        match payload {
            ConfigPayload::Apply(fragment) => self.apply(fragment).await,
            ConfigPayload::Remove { service } => self.remove(service).await,
        }
    }

    async fn apply(&self, fragment: &RatholeFragment) -> Result<Applied, String> {
        check_fragment(fragment)?;
        let rendered = render_client_toml(fragment).map_err(|e| format!("render failed: {e}"))?;
        let path = self.config_path(&fragment.service);

        let mut services = self.services.lock().await;
        if let Ok(existing) = tokio::fs::read(&path).await {
            if existing == rendered.as_bytes() {
                debug!(service = %fragment.service, "Client config unchanged");
                services.insert(fragment.service.clone());
                return Ok(Applied::Unchanged);
            }
        }
        write_atomic(&path, rendered.as_bytes())
            .await
            .map_err(|e| format!("failed to write {}: {e}", path.display()))?;
        services.insert(fragment.service.clone());
        info!(service = %fragment.service, remote_addr = %fragment.remote_addr, "Client config written");
        Ok(Applied::Written)
    }

    async fn remove(&self, service: &str) -> Result<Applied, String> {
        let path = self.config_path(service);
        let mut services = self.services.lock().await;
        services.remove(service);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                info!(service = %service, "Client config removed");
                Ok(Applied::Removed)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(service = %service, "Client config already absent");
                Ok(Applied::Absent)
            }
            Err(e) => {
                warn!(service = %service, error = %e, "Failed to remove client config");
                Err(format!("failed to remove {}: {e}", path.display()))
            }
        }
    }
}

/// Service names become file names.
fn check_service(service: &str) -> Result<(), String> {
    let valid = !service.is_empty()
        && !service.starts_with('.')
        && service
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(format!("invalid service name '{service}'"))
    }
}

fn check_fragment(fragment: &RatholeFragment) -> Result<(), String> {
    if fragment.token.is_empty() {
        return Err("empty token".into());
    }
    if fragment.remote_port == 0 {
        return Err("remote_port must be non-zero".into());
    }
    if fragment.local_addr.parse::<SocketAddr>().is_err() && !is_host_port(&fragment.local_addr) {
        return Err(format!("invalid local_addr '{}'", fragment.local_addr));
    }
    if !is_host_port(&fragment.remote_addr) {
        return Err(format!("invalid remote_addr '{}'", fragment.remote_addr));
    }
    Ok(())
}

fn is_host_port(addr: &str) -> bool {
    addr.rsplit_once(':').is_some_and(|(host, port)| {
        !host.is_empty() && port.parse::<u16>().is_ok_and(|p| p != 0)
    })
}

fn state_error(path: &Path, e: &std::io::Error) -> AgentError {
    AgentError::State(format!("{}: {e}", path.display()))
}

async fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("toml.tmp");
    tokio::fs::write(&tmp, contents).await?;
    tokio::fs::rename(&tmp, path).await
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn fragment(service: &str) -> RatholeFragment {
        RatholeFragment {
            service: service.into(),
            remote_addr: "panel.example:2333".into(),
            token: "tok".into(),
            local_addr: "127.0.0.1:22".into(),
            remote_port: 6022,
        }
    }

    #[test]
    fn client_toml_layout() {
        let rendered = render_client_toml(&fragment("ssh")).unwrap();
        let value: toml::Value = toml::from_str(&rendered).unwrap();
        assert_eq!(value["client"]["remote_addr"].as_str(), Some("panel.example:2333"));
        assert_eq!(value["client"]["services"]["ssh"]["token"].as_str(), Some("tok"));
        assert_eq!(
            value["client"]["services"]["ssh"]["local_addr"].as_str(),
            Some("127.0.0.1:22")
        );
        assert_eq!(rendered, render_client_toml(&fragment("ssh")).unwrap());
    }

    #[tokio::test]
    async fn apply_writes_then_reports_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let handler = ConfigHandler::load(dir.path()).await.unwrap();
        let push = ConfigPayload::Apply(fragment("ssh"));

        assert_eq!(handler.handle(&push).await.unwrap(), Applied::Written);
        assert_eq!(handler.handle(&push).await.unwrap(), Applied::Unchanged);

        let on_disk = std::fs::read_to_string(handler.config_path("ssh")).unwrap();
        assert_eq!(on_disk, render_client_toml(&fragment("ssh")).unwrap());
        assert!(!dir.path().join("ssh.client.toml.tmp").exists());
        assert_eq!(handler.services().await, vec!["ssh".to_string()]);
    }

    #[tokio::test]
    async fn changed_fragment_is_rewritten() {
        let dir = tempfile::tempdir().unwrap();
        let handler = ConfigHandler::load(dir.path()).await.unwrap();
        handler
            .handle(&ConfigPayload::Apply(fragment("ssh")))
            .await
            .unwrap();

        let mut moved = fragment("ssh");
        moved.local_addr = "127.0.0.1:2222".into();
        assert_eq!(
            handler.handle(&ConfigPayload::Apply(moved)).await.unwrap(),
            Applied::Written
        );
        let on_disk = std::fs::read_to_string(handler.config_path("ssh")).unwrap();
        assert!(on_disk.contains("127.0.0.1:2222"));
    }

    #[tokio::test]
    async fn remove_deletes_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let handler = ConfigHandler::load(dir.path()).await.unwrap();
        handler
            .handle(&ConfigPayload::Apply(fragment("ssh")))
            .await
            .unwrap();

        let remove = ConfigPayload::Remove {
            service: "ssh".into(),
        };
        assert_eq!(handler.handle(&remove).await.unwrap(), Applied::Removed);
        assert_eq!(handler.handle(&remove).await.unwrap(), Applied::Absent);
        assert!(!handler.config_path("ssh").exists());
        assert!(handler.services().await.is_empty());
    }

    #[tokio::test]
    async fn state_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        {
            let handler = ConfigHandler::load(dir.path()).await.unwrap();
            for service in ["b", "a"] {
                handler
                    .handle(&ConfigPayload::Apply(fragment(service)))
                    .await
                    .unwrap();
            }
        }
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let handler = ConfigHandler::load(dir.path()).await.unwrap();
        assert_eq!(handler.services().await, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(
            handler
                .handle(&ConfigPayload::Apply(fragment("a")))
                .await
                .unwrap(),
            Applied::Unchanged
        );
    }

    #[tokio::test]
    async fn bad_pushes_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let handler = ConfigHandler::load(dir.path()).await.unwrap();

        let escape = ConfigPayload::Remove {
            service: "../etc/passwd".into(),
        };
        assert!(handler.handle(&escape).await.unwrap_err().contains("invalid service"));

        let mut no_token = fragment("ssh");
        no_token.token.clear();
        assert!(handler.handle(&ConfigPayload::Apply(no_token)).await.is_err());

        let mut bad_local = fragment("ssh");
        bad_local.local_addr = "nowhere".into();
        assert!(handler.handle(&ConfigPayload::Apply(bad_local)).await.is_err());

        let mut bad_port = fragment("ssh");
        bad_port.remote_port = 0;
        assert!(handler.handle(&ConfigPayload::Apply(bad_port)).await.is_err());

        assert!(handler.services().await.is_empty());
    }

    #[test]
    fn host_port_accepts_bracketed_ipv6() {
        assert!(is_host_port("[2001:db8::1]:2333"));
        assert!(is_host_port("panel:1"));
        assert!(!is_host_port(":2333"));
        assert!(!is_host_port("panel"));
        assert!(!is_host_port("panel:0"));
    }
}
