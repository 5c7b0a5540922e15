//! SSH reachability checks against a provisioned fleet.

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::types::DeploymentInfo;
use crate::{Error, Result};

const SSH_PORT: u16 = 22;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for SshTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    /// `true` when the target answers like an SSH server.
    async fn is_up(&self, target: &SshTarget) -> bool;
}

/// Connects and reads the server identification line.
pub struct SshBannerProbe {
    pub connect_timeout: Duration,
}

impl Default for SshBannerProbe {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
        }
    }
}

#[async_trait]
impl ConnectivityProbe for SshBannerProbe {
    async fn is_up(&self, target: &SshTarget) -> bool {
        let attempt = async {
            let mut stream = TcpStream::connect((target.host.as_str(), target.port)).await?;
            let mut banner = [0u8; 3];
            stream.read_exact(&mut banner).await?;
            Ok::<_, std::io::Error>(banner)
        };
        match tokio::time::timeout(self.connect_timeout, attempt).await {
            Ok(Ok(banner)) => &banner == b"SSH",
            Ok(Err(e)) => {
                debug!(%target, error = %e, "ssh probe failed");
                false
            }
            Err(_) => false,
        }
    }
}

/// Where SSH should answer: every endpoint mapped to local port 22, and
/// port 22 of every public IP that has an address.
pub fn ssh_targets(deployment: &DeploymentInfo) -> Vec<SshTarget> {
    let mut targets = BTreeSet::new();
    for role in &deployment.roles {
        for ep in role.endpoints.iter().filter(|e| e.local_port == SSH_PORT) {
            targets.insert(SshTarget {
                host: ep.vip.clone(),
                port: ep.public_port,
            });
        }
        for address in role.public_ips.iter().filter_map(|ip| ip.address.as_ref()) {
            targets.insert(SshTarget {
                host: address.clone(),
                port: SSH_PORT,
            });
        }
    }
    targets.into_iter().collect()
}

/// Probe all targets, retrying the ones that are down every `retry` until
/// all are up or `timeout` elapses.
pub async fn wait_for_ssh(
    probe: &dyn ConnectivityProbe,
    targets: Vec<SshTarget>,
    retry: Duration,
    timeout: Duration,
) -> Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut down = targets;

    loop {
        let mut still_down = Vec::new();
        for target in down {
            if probe.is_up(&target).await {
                info!(%target, "ssh up");
            } else {
                still_down.push(target);
            }
        }
        down = still_down;

        if down.is_empty() {
            return Ok(());
        }
        if tokio::time::Instant::now() + retry > deadline {
            let names: Vec<String> = down.iter().map(ToString::to_string).collect();
            warn!(down = %names.join(", "), "ssh still unreachable");
            return Err(Error::Unreachable(names));
        }
        debug!(down = down.len(), "retrying ssh probes");
        tokio::time::sleep(retry).await;
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use pretty_assertions::assert_eq;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    use super::*;
    use crate::types::{EndpointInfo, PublicIpInfo, RoleInfo};

    /// Target comes up after a number of failed probes.
    struct Flaky {
        failures_left: Mutex<HashMap<SshTarget, usize>>,
    }

    #[async_trait]
    impl ConnectivityProbe for Flaky {
        async fn is_up(&self, target: &SshTarget) -> bool {
            let mut left = self.failures_left.lock().unwrap();
            match left.get_mut(target) {
                Some(0) | None => true,
                Some(n) => {
                    *n -= 1;
                    false
                }
            }
        }
    }

    fn target(host: &str, port: u16) -> SshTarget {
        SshTarget {
            host: host.into(),
            port,
        }
    }

    #[test]
    fn targets_from_ssh_endpoints_and_public_ips() {
        let deployment = DeploymentInfo {
            name: "dep".into(),
            roles: vec![RoleInfo {
                role_name: "vma".into(),
                endpoints: vec![
                    EndpointInfo {
                        name: "ssh".into(),
                        protocol: "tcp".into(),
                        vip: "198.51.100.7".into(),
                        local_port: 22,
                        public_port: 40022,
                    },
                    EndpointInfo {
                        name: "http".into(),
                        protocol: "tcp".into(),
                        vip: "198.51.100.7".into(),
                        local_port: 80,
                        public_port: 80,
                    },
                ],
                public_ips: vec![
                    PublicIpInfo {
                        name: "ip-vma".into(),
                        address: Some("203.0.113.4".into()),
                    },
                    PublicIpInfo {
                        name: "pending".into(),
                        address: None,
                    },
                ],
                ..RoleInfo::default()
            }],
        };

        assert_eq!(
            ssh_targets(&deployment),
            vec![target("198.51.100.7", 40022), target("203.0.113.4", 22)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_every_target_is_up() {
        let probe = Flaky {
            failures_left: Mutex::new(HashMap::from([(target("a", 22), 3)])),
        };

        wait_for_ssh(
            &probe,
            vec![target("a", 22), target("b", 22)],
            Duration::from_secs(1),
            Duration::from_secs(10),
        )
        .await
        .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_the_timeout() {
        let probe = Flaky {
            failures_left: Mutex::new(HashMap::from([(target("a", 22), usize::MAX)])),
        };

        let err = wait_for_ssh(
            &probe,
            vec![target("a", 22), target("b", 22)],
            Duration::from_secs(1),
            Duration::from_secs(5),
        )
        .await
        .unwrap_err();

        match err {
            Error::Unreachable(down) => assert_eq!(down, vec!["a:22".to_string()]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn banner_probe_recognises_ssh_servers() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            sock.write_all(b"SSH-2.0-OpenSSH_9.6\r\n").await.unwrap();
        });

        let probe = SshBannerProbe::default();
        assert!(probe.is_up(&target("127.0.0.1", port)).await);
    }

    #[tokio::test]
    async fn banner_probe_rejects_other_servers() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            sock.write_all(b"HTTP/1.1 400 Bad Request\r\n").await.unwrap();
        });

        let probe = SshBannerProbe::default();
        assert!(!probe.is_up(&target("127.0.0.1", port)).await);
    }
}
