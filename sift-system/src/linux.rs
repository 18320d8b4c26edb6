//! Linux resolver redirection
//!
//! Two configuration branches: a systemd-resolved drop-in when
//! resolved is managing the system, otherwise a direct rewrite of
//! `/etc/resolv.conf`. Either way the resolver ends up at 127.0.0.1
//! and an iptables nat/OUTPUT REDIRECT maps port 53 to the proxy's
//! listen port.

use std::path::PathBuf;
use std::sync::Arc;

use crate::dns::DnsBackup;
use crate::error::Result;
use crate::runner::{expect_success, CommandRunner};

/// Resolver paths, overridable for tests
#[derive(Debug, Clone)]
pub struct LinuxPaths {
    pub resolv_conf: PathBuf,
    pub dropin: PathBuf,
}

impl Default for LinuxPaths {
    fn default() -> Self {
        Self {
            resolv_conf: PathBuf::from("/etc/resolv.conf"),
            dropin: PathBuf::from("/etc/systemd/resolved.conf.d/wgsift.conf"),
        }
    }
}

/// Drop-in pointing systemd-resolved at the loopback for every domain
pub fn dropin_content() -> &'static str {
    "[Resolve]\nDNS=127.0.0.1\nDomains=~.\n"
}

/// resolv.conf contents while redirection is active
pub fn resolv_conf_content() -> &'static str {
    "# managed by wgsift; original restored on shutdown\nnameserver 127.0.0.1\n"
}

/// iptables invocation for one protocol; `op` is `-A` or `-D`
pub fn iptables_redirect_args(op: &str, proto: &str, proxy_port: u16) -> Vec<String> {
    vec![
        "-t".into(),
        "nat".into(),
        op.into(),
        "OUTPUT".into(),
        "-p".into(),
        proto.into(),
        "--dport".into(),
        "53".into(),
        "-j".into(),
        "REDIRECT".into(),
        "--to-port".into(),
        proxy_port.to_string(),
    ]
}

/// Whether systemd-resolved is managing the resolver
pub async fn resolved_in_charge(runner: &dyn CommandRunner) -> bool {
    matches!(
        runner.run("resolvectl", &["status"]).await,
        Ok(output) if output.status.success()
    )
}

pub async fn configure(
    runner: &Arc<dyn CommandRunner>,
    privileged: &Arc<dyn CommandRunner>,
    proxy_port: u16,
    paths: &LinuxPaths,
) -> Result<DnsBackup> {
    // Capture the backup before touching anything so a failed apply
    // can be rolled back.
    let resolved = resolved_in_charge(runner.as_ref()).await;
    let backup = if resolved {
        DnsBackup::LinuxResolved
    } else {
        DnsBackup::LinuxResolvConf {
            original: std::fs::read_to_string(&paths.resolv_conf)?,
        }
    };

    if let Err(e) = apply(privileged, proxy_port, paths, resolved).await {
        let _ = restore(runner, privileged, proxy_port, paths, &backup).await;
        return Err(e);
    }

    flush_caches(runner).await;
    log::info!("resolver redirected to 127.0.0.1, port 53 -> {}", proxy_port);
    Ok(backup)
}

async fn apply(
    privileged: &Arc<dyn CommandRunner>,
    proxy_port: u16,
    paths: &LinuxPaths,
    resolved: bool,
) -> Result<()> {
    if resolved {
        apply_resolved(privileged, paths).await?;
    } else {
        write_file(privileged, &paths.resolv_conf, resolv_conf_content()).await?;
    }

    for proto in ["udp", "tcp"] {
        let args = iptables_redirect_args("-A", proto, proxy_port);
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = privileged.run("iptables", &arg_refs).await?;
        expect_success("iptables", &output)?;
    }
    Ok(())
}

pub async fn restore(
    runner: &Arc<dyn CommandRunner>,
    privileged: &Arc<dyn CommandRunner>,
    proxy_port: u16,
    paths: &LinuxPaths,
    backup: &DnsBackup,
) -> Result<()> {
    let mut first_error = None;

    for proto in ["udp", "tcp"] {
        let args = iptables_redirect_args("-D", proto, proxy_port);
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        match privileged.run("iptables", &arg_refs).await {
            Ok(output) => {
                if let Err(e) = expect_success("iptables", &output) {
                    log::warn!("iptables rule removal failed: {}", e);
                    first_error.get_or_insert(e);
                }
            }
            Err(e) => {
                first_error.get_or_insert(e);
            }
        }
    }

    let result = match backup {
        DnsBackup::LinuxResolved => remove_resolved_dropin(privileged, paths).await,
        DnsBackup::LinuxResolvConf { original } => {
            write_file(privileged, &paths.resolv_conf, original).await
        }
        other => {
            log::warn!("ignoring non-Linux DNS backup: {:?}", other);
            Ok(())
        }
    };
    if let Err(e) = result {
        first_error.get_or_insert(e);
    }

    flush_caches(runner).await;
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Does the live configuration still point at the loopback?
pub async fn is_redirected(paths: &LinuxPaths) -> bool {
    if paths.dropin.exists() {
        return true;
    }
    std::fs::read_to_string(&paths.resolv_conf)
        .map(|content| {
            content
                .lines()
                .any(|l| l.trim() == "nameserver 127.0.0.1")
        })
        .unwrap_or(false)
}

async fn apply_resolved(privileged: &Arc<dyn CommandRunner>, paths: &LinuxPaths) -> Result<()> {
    if let Some(dir) = paths.dropin.parent() {
        let output = privileged
            .run("mkdir", &["-p", &dir.to_string_lossy()])
            .await?;
        expect_success("mkdir", &output)?;
    }
    write_file(privileged, &paths.dropin, dropin_content()).await?;
    restart_resolved(privileged).await
}

async fn remove_resolved_dropin(
    privileged: &Arc<dyn CommandRunner>,
    paths: &LinuxPaths,
) -> Result<()> {
    let output = privileged
        .run("rm", &["-f", &paths.dropin.to_string_lossy()])
        .await?;
    expect_success("rm", &output)?;
    restart_resolved(privileged).await
}

async fn restart_resolved(privileged: &Arc<dyn CommandRunner>) -> Result<()> {
    let output = privileged
        .run("systemctl", &["restart", "systemd-resolved"])
        .await?;
    expect_success("systemctl", &output)?;
    Ok(())
}

async fn write_file(
    privileged: &Arc<dyn CommandRunner>,
    path: &std::path::Path,
    content: &str,
) -> Result<()> {
    let output = privileged
        .run_with_stdin("tee", &[&path.to_string_lossy()], content.as_bytes())
        .await?;
    expect_success("tee", &output)?;
    Ok(())
}

async fn flush_caches(runner: &Arc<dyn CommandRunner>) {
    // Best effort; only meaningful under resolved.
    if let Ok(output) = runner.run("resolvectl", &["flush-caches"]).await {
        if !output.status.success() {
            log::debug!("resolvectl flush-caches failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iptables_args_shape() {
        let args = iptables_redirect_args("-A", "udp", 5353);
        assert_eq!(
            args,
            vec![
                "-t", "nat", "-A", "OUTPUT", "-p", "udp", "--dport", "53", "-j", "REDIRECT",
                "--to-port", "5353"
            ]
        );
    }

    #[test]
    fn test_dropin_points_at_loopback() {
        let content = dropin_content();
        assert!(content.starts_with("[Resolve]"));
        assert!(content.contains("DNS=127.0.0.1"));
    }

    #[tokio::test]
    async fn test_is_redirected_reads_resolv_conf() {
        let dir = tempfile::tempdir().unwrap();
        let resolv = dir.path().join("resolv.conf");
        let paths = LinuxPaths {
            resolv_conf: resolv.clone(),
            dropin: dir.path().join("absent.conf"),
        };

        std::fs::write(&resolv, "nameserver 9.9.9.9\n").unwrap();
        assert!(!is_redirected(&paths).await);

        std::fs::write(&resolv, resolv_conf_content()).unwrap();
        assert!(is_redirected(&paths).await);
    }

    #[tokio::test]
    async fn test_is_redirected_sees_dropin() {
        let dir = tempfile::tempdir().unwrap();
        let dropin = dir.path().join("wgsift.conf");
        std::fs::write(&dropin, dropin_content()).unwrap();
        let paths = LinuxPaths {
            resolv_conf: dir.path().join("missing"),
            dropin,
        };
        assert!(is_redirected(&paths).await);
    }
}
