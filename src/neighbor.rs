use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr as _;
use std::sync::Arc;

use async_trait::async_trait;
use log::debug;
use mac_address::MacAddress;

use crate::error::{NeighborError, ParseReason};

const PROC_NET_ARP: &str = "/proc/net/arp";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeighborRecord {
    pub hardware_address: MacAddress,
    pub ip: IpAddr,
    pub interface: String,
}

/// One fully parsed `/proc/net/arp` line.
#[allow(dead_code)]
#[derive(Debug, Clone, PartialEq, Eq)]
struct ArpCacheLine {
    ip: IpAddr,
    hw_type: u64,
    flags: u64,
    hw_addr: MacAddress,
    mask: String,
    device: String,
}

impl From<ArpCacheLine> for NeighborRecord {
    fn from(line: ArpCacheLine) -> Self {
        NeighborRecord {
            hardware_address: line.hw_addr,
            ip: line.ip,
            interface: line.device,
        }
    }
}

/// A source of neighbor records, selected once at startup.
#[async_trait]
pub trait NeighborTable: Send + Sync {
    async fn read(&self) -> Result<Vec<NeighborRecord>, NeighborError>;
}

/// Linux neighbor cache exposed by procfs.
pub struct ProcNetArp {
    path: PathBuf,
}

impl ProcNetArp {
    pub fn new() -> Self {
        ProcNetArp {
            path: PathBuf::from(PROC_NET_ARP),
        }
    }
}

#[async_trait]
impl NeighborTable for ProcNetArp {
    async fn read(&self) -> Result<Vec<NeighborRecord>, NeighborError> {
        let contents = tokio::fs::read_to_string(&self.path).await?;
        let lines = parse_arp_cache(&contents)?;

        Ok(lines.into_iter().map(NeighborRecord::from).collect())
    }
}

/// Neighbor table read through the `arp` command, for platforms without procfs.
///
/// Only a single interface is queried to avoid an ARP storm.
pub struct ArpCommand {
    interface: Option<String>,
}

impl ArpCommand {
    pub fn new(interface: Option<String>) -> Self {
        ArpCommand { interface }
    }
}

#[async_trait]
impl NeighborTable for ArpCommand {
    async fn read(&self) -> Result<Vec<NeighborRecord>, NeighborError> {
        let mut cmd = tokio::process::Command::new("arp");
        cmd.arg("-an");
        if let Some(interface) = &self.interface {
            cmd.args(["-i", interface.as_str()]);
        }

        let output = cmd.output().await?;
        if !output.status.success() {
            return Err(NeighborError::Command(format!(
                "arp exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        parse_arp_output(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Picks the neighbor table implementation for the running platform.
pub fn platform_table(interface: Option<&str>) -> Arc<dyn NeighborTable> {
    if cfg!(target_os = "linux") {
        Arc::new(ProcNetArp::new())
    } else {
        Arc::new(ArpCommand::new(interface.map(str::to_string)))
    }
}

/// Answers which IP addresses belong to a hardware address. Every call
/// re-reads the live table.
#[derive(Clone)]
pub struct NeighborResolver {
    table: Arc<dyn NeighborTable>,
}

impl NeighborResolver {
    pub fn new(table: Arc<dyn NeighborTable>) -> Self {
        NeighborResolver { table }
    }

    pub async fn locate(&self, mac: MacAddress) -> Result<Vec<NeighborRecord>, NeighborError> {
        let records: Vec<_> = self
            .table
            .read()
            .await?
            .into_iter()
            .filter(|record| record.hardware_address == mac)
            .collect();

        if records.is_empty() {
            return Err(NeighborError::NotFound(mac));
        }

        Ok(records)
    }

    /// Lists every record, or only those attached to `interface`.
    pub async fn scan(&self, interface: Option<&str>) -> Result<Vec<NeighborRecord>, NeighborError> {
        let records = self.table.read().await?;
        debug!("read {} neighbor records", records.len());

        Ok(match interface {
            Some(interface) => records
                .into_iter()
                .filter(|record| record.interface == interface)
                .collect(),
            None => records,
        })
    }
}

fn parse_arp_cache(contents: &str) -> Result<Vec<ArpCacheLine>, NeighborError> {
    let mut lines = Vec::new();

    for (id, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with("IP address") {
            continue;
        }

        let parsed = parse_arp_cache_line(line).map_err(|reason| NeighborError::Parse {
            line: id + 1,
            content: line.to_string(),
            reason,
        })?;
        lines.push(parsed);
    }

    Ok(lines)
}

fn parse_arp_cache_line(line: &str) -> Result<ArpCacheLine, ParseReason> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() != 6 {
        return Err(ParseReason::FieldCount(parts.len()));
    }

    let ip = IpAddr::from_str(parts[0]).map_err(|_| ParseReason::InvalidIp)?;
    let hw_type = parse_hex(parts[1]).ok_or(ParseReason::InvalidHardwareType)?;
    let flags = parse_hex(parts[2]).ok_or(ParseReason::InvalidFlags)?;
    let hw_addr = parse_hardware_address(parts[3]).ok_or(ParseReason::InvalidHardwareAddress)?;

    Ok(ArpCacheLine {
        ip,
        hw_type,
        flags,
        hw_addr,
        mask: parts[4].to_string(),
        device: parts[5].to_string(),
    })
}

/// Parses `arp -an` output, e.g.
/// `? (192.168.1.1) at fc:ec:da:41:8d:19 on en0 ifscope [ethernet]`.
fn parse_arp_output(output: &str) -> Result<Vec<NeighborRecord>, NeighborError> {
    let mut records = Vec::new();

    for (id, line) in output.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let parse_error = |reason| NeighborError::Parse {
            line: id + 1,
            content: line.to_string(),
            reason,
        };

        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 4 {
            return Err(parse_error(ParseReason::FieldCount(parts.len())));
        }

        let ip = parts[1]
            .trim_matches(|c: char| c == '(' || c == ')')
            .parse::<IpAddr>()
            .map_err(|_| parse_error(ParseReason::InvalidIp))?;

        if parts[3] == "(incomplete)" {
            continue;
        }

        let hardware_address = parse_hardware_address(parts[3])
            .ok_or_else(|| parse_error(ParseReason::InvalidHardwareAddress))?;

        let interface = parts
            .iter()
            .position(|part| *part == "on")
            .and_then(|id| parts.get(id + 1))
            .map(|name| name.to_string())
            .unwrap_or_default();

        records.push(NeighborRecord {
            hardware_address,
            ip,
            interface,
        });
    }

    Ok(records)
}

fn parse_hex(v: &str) -> Option<u64> {
    let digits = v.strip_prefix("0x").or_else(|| v.strip_prefix("0X"))?;
    if !is_hex(digits) {
        return None;
    }
    u64::from_str_radix(digits, 16).ok()
}

/// `from_str_radix` alone also takes a leading sign.
fn is_hex(v: &str) -> bool {
    !v.is_empty() && v.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Accepts colon separated octets, including the abbreviated single digit
/// form printed by BSD `arp`.
pub fn parse_hardware_address(v: &str) -> Option<MacAddress> {
    let mut bytes = [0u8; 6];
    let mut parts = v.split(':');

    for byte in bytes.iter_mut() {
        let part = parts.next()?;
        if part.len() > 2 || !is_hex(part) {
            return None;
        }
        *byte = u8::from_str_radix(part, 16).ok()?;
    }

    if parts.next().is_some() {
        return None;
    }

    Some(MacAddress::new(bytes))
}
