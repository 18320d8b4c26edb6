//! macOS resolver redirection
//!
//! The resolver is set per network service with `networksetup`; the
//! port-53 redirect is a PF anchor loaded with `pfctl`. Cache flushes
//! go through dscacheutil and mDNSResponder.

use std::sync::Arc;

use crate::dns::{DnsBackup, ServiceDns};
use crate::error::Result;
use crate::runner::{expect_success, CommandRunner};

/// PF anchor owning the redirect rules
pub const PF_ANCHOR: &str = "wgsift";

/// Anchor file location
pub const PF_ANCHOR_FILE: &str = "/etc/pf.anchors/wgsift";

/// PF rules redirecting loopback port 53 (UDP and TCP) to the proxy
pub fn anchor_rules(proxy_port: u16) -> String {
    format!(
        "rdr pass on lo0 inet proto udp from any to 127.0.0.1 port 53 -> 127.0.0.1 port {port}\n\
         rdr pass on lo0 inet proto tcp from any to 127.0.0.1 port 53 -> 127.0.0.1 port {port}\n",
        port = proxy_port
    )
}

/// Parse `networksetup -listallnetworkservices` output.
///
/// The first line is a banner; disabled services are prefixed with
/// an asterisk and skipped.
pub fn parse_service_list(output: &str) -> Vec<String> {
    output
        .lines()
        .skip(1)
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('*'))
        .map(str::to_string)
        .collect()
}

/// Parse `networksetup -getdnsservers <service>` output.
///
/// Returns an empty list when no servers are statically configured
/// (networksetup prints a sentence instead of addresses).
pub fn parse_dns_servers(output: &str) -> Vec<String> {
    let servers: Vec<String> = output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && line.parse::<std::net::IpAddr>().is_ok())
        .map(str::to_string)
        .collect();
    servers
}

pub async fn configure(
    runner: &Arc<dyn CommandRunner>,
    privileged: &Arc<dyn CommandRunner>,
    proxy_port: u16,
) -> Result<DnsBackup> {
    let services = list_services(runner).await?;

    let mut backup = Vec::with_capacity(services.len());
    for service in &services {
        let servers = get_dns_servers(runner, service).await?;
        backup.push(ServiceDns {
            service: service.clone(),
            servers,
        });
    }

    let backup = DnsBackup::Macos { services: backup };
    if let Err(e) = apply(privileged, &services, proxy_port).await {
        let _ = restore(runner, privileged, &backup).await;
        return Err(e);
    }

    flush_caches(runner, privileged).await;
    log::info!(
        "resolver set to 127.0.0.1 on {} service(s), PF anchor '{}' loaded",
        services.len(),
        PF_ANCHOR
    );
    Ok(backup)
}

async fn apply(
    privileged: &Arc<dyn CommandRunner>,
    services: &[String],
    proxy_port: u16,
) -> Result<()> {
    for service in services {
        let output = privileged
            .run("networksetup", &["-setdnsservers", service, "127.0.0.1"])
            .await?;
        expect_success("networksetup", &output)?;
    }

    // Load the redirect anchor.
    let rules = anchor_rules(proxy_port);
    let output = privileged
        .run_with_stdin("tee", &[PF_ANCHOR_FILE], rules.as_bytes())
        .await?;
    expect_success("tee", &output)?;

    let output = privileged
        .run("pfctl", &["-a", PF_ANCHOR, "-f", PF_ANCHOR_FILE])
        .await?;
    expect_success("pfctl", &output)?;

    // Enabling when already enabled exits non-zero; not a failure.
    if let Ok(output) = privileged.run("pfctl", &["-e"]).await {
        if !output.status.success() {
            log::debug!("pfctl -e: {}", String::from_utf8_lossy(&output.stderr).trim());
        }
    }
    Ok(())
}

pub async fn restore(
    runner: &Arc<dyn CommandRunner>,
    privileged: &Arc<dyn CommandRunner>,
    backup: &DnsBackup,
) -> Result<()> {
    let mut first_error = None;

    if let Ok(output) = privileged.run("pfctl", &["-a", PF_ANCHOR, "-F", "all"]).await {
        if let Err(e) = expect_success("pfctl", &output) {
            log::warn!("PF anchor flush failed: {}", e);
            first_error.get_or_insert(e);
        }
    }

    if let DnsBackup::Macos { services } = backup {
        for entry in services {
            let mut args = vec!["-setdnsservers", entry.service.as_str()];
            if entry.servers.is_empty() {
                args.push("Empty");
            } else {
                args.extend(entry.servers.iter().map(String::as_str));
            }
            match privileged.run("networksetup", &args).await {
                Ok(output) => {
                    if let Err(e) = expect_success("networksetup", &output) {
                        log::warn!("restore of {} failed: {}", entry.service, e);
                        first_error.get_or_insert(e);
                    }
                }
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
    } else {
        log::warn!("ignoring non-macOS DNS backup: {:?}", backup);
    }

    flush_caches(runner, privileged).await;
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Does the first service still point at the loopback?
pub async fn is_redirected(runner: &Arc<dyn CommandRunner>) -> bool {
    let Ok(services) = list_services(runner).await else {
        return false;
    };
    for service in services {
        if let Ok(servers) = get_dns_servers(runner, &service).await {
            return servers == ["127.0.0.1"];
        }
    }
    false
}

async fn list_services(runner: &Arc<dyn CommandRunner>) -> Result<Vec<String>> {
    let output = runner
        .run("networksetup", &["-listallnetworkservices"])
        .await?;
    let text = expect_success("networksetup", &output)?;
    Ok(parse_service_list(&text))
}

async fn get_dns_servers(runner: &Arc<dyn CommandRunner>, service: &str) -> Result<Vec<String>> {
    let output = runner
        .run("networksetup", &["-getdnsservers", service])
        .await?;
    let text = expect_success("networksetup", &output)?;
    Ok(parse_dns_servers(&text))
}

async fn flush_caches(runner: &Arc<dyn CommandRunner>, privileged: &Arc<dyn CommandRunner>) {
    if let Ok(output) = runner.run("dscacheutil", &["-flushcache"]).await {
        if !output.status.success() {
            log::debug!("dscacheutil flush failed");
        }
    }
    if let Ok(output) = privileged.run("killall", &["-HUP", "mDNSResponder"]).await {
        if !output.status.success() {
            log::debug!("mDNSResponder HUP failed");
        }
    }
}
