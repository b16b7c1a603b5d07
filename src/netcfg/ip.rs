//! Route adapter backed by the iproute2 `ip` tool.

use std::net::IpAddr;
#[cfg(target_os = "linux")]
use std::process::Command;

use ipnet::IpNet;

use super::RouteAdapter;
use crate::error::{Error, Result};

/// Routes managed with `ip route` (Linux).
#[derive(Debug, Clone)]
pub struct IpRouteCommand {
    /// Routing table to operate on (`None` = main).
    table: Option<u32>,
    /// Metric for installed routes.
    metric: Option<u32>,
}

impl Default for IpRouteCommand {
    fn default() -> Self {
        Self::new()
    }
}

impl IpRouteCommand {
    pub fn new() -> Self {
        Self {
            table: None,
            metric: None,
        }
    }

    /// Operate on a specific routing table.
    pub fn with_table(mut self, table: u32) -> Self {
        self.table = Some(table);
        self
    }

    /// Set the metric used for installed routes.
    pub fn with_metric(mut self, metric: u32) -> Self {
        self.metric = Some(metric);
        self
    }

    fn route_args(
        &self,
        verb: &str,
        ifname: &str,
        gateway: Option<IpAddr>,
        destination: &IpNet,
    ) -> Vec<String> {
        let mut args = vec!["route".to_string(), verb.to_string(), destination.to_string()];

        if let Some(gw) = gateway {
            args.push("via".into());
            args.push(gw.to_string());
        }

        args.push("dev".into());
        args.push(ifname.to_string());

        if let Some(metric) = self.metric {
            args.push("metric".into());
            args.push(metric.to_string());
        }

        if let Some(table) = self.table {
            args.push("table".into());
            args.push(table.to_string());
        }

        args
    }

    /// Run `ip` and treat stderr containing `tolerated` as success.
    #[cfg(target_os = "linux")]
    fn run(&self, args: &[String], tolerated: Option<&str>) -> Result<String> {
        let output = Command::new("ip").args(args).output()?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let ignore = tolerated.is_some_and(|t| stderr.contains(t));
            if !ignore {
                return Err(Error::RouteCommand(format!(
                    "ip {}: {}",
                    args.join(" "),
                    stderr.trim()
                )));
            }
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    #[cfg(not(target_os = "linux"))]
    fn run(&self, _args: &[String], _tolerated: Option<&str>) -> Result<String> {
        Err(Error::Unsupported)
    }

    fn show_exact(&self, destination: &IpNet) -> Option<String> {
        let mut args = vec![
            "route".to_string(),
            "show".to_string(),
            "exact".to_string(),
            destination.to_string(),
        ];
        if let Some(table) = self.table {
            args.push("table".into());
            args.push(table.to_string());
        }

        match self.run(&args, None) {
            Ok(stdout) => Some(stdout),
            Err(e) => {
                tracing::debug!(destination = %destination, error = %e, "Route lookup failed");
                None
            }
        }
    }
}

/// Extract the `dev` of the first route line.
fn parse_device(stdout: &str) -> Option<String> {
    // Format: 10.1.0.0/24 dev wg0 proto static scope link
    stdout.lines().find_map(|line| {
        let mut parts = line.split_whitespace();
        while let Some(part) = parts.next() {
            if part == "dev" {
                return parts.next().map(str::to_string);
            }
        }
        None
    })
}

impl RouteAdapter for IpRouteCommand {
    fn route_add(&self, ifname: &str, gateway: Option<IpAddr>, destination: &IpNet) -> Result<()> {
        let args = self.route_args("add", ifname, gateway, destination);
        self.run(&args, Some("File exists"))?;
        tracing::debug!(destination = %destination, interface = %ifname, "Added route");
        Ok(())
    }

    fn route_del(&self, ifname: &str, destination: &IpNet) -> Result<()> {
        let args = self.route_args("del", ifname, None, destination);
        self.run(&args, Some("No such process"))?;
        tracing::debug!(destination = %destination, interface = %ifname, "Removed route");
        Ok(())
    }

    fn route_replace(
        &self,
        ifname: &str,
        gateway: Option<IpAddr>,
        destination: &IpNet,
    ) -> Result<()> {
        let args = self.route_args("replace", ifname, gateway, destination);
        self.run(&args, None)?;
        tracing::debug!(destination = %destination, interface = %ifname, "Replaced route");
        Ok(())
    }

    fn route_exists(&self, destination: &IpNet) -> bool {
        self.show_exact(destination)
            .is_some_and(|stdout| !stdout.trim().is_empty())
    }

    fn route_conflict(&self, destination: &IpNet) -> Option<String> {
        self.show_exact(destination)
            .and_then(|stdout| parse_device(&stdout))
    }
}
