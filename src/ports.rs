use std::collections::HashSet;
use std::path::Path;

use anyhow::{bail, Context, Result};

/// Parse a port specification into a deduplicated list of TCP ports (1..=65535).
///
/// Entries are separated by commas or newlines. Each entry is a single port
/// (`80`) or an inclusive range (`8000-8010`). Everything after `#` on a
/// line is a comment. First appearance wins the position in the output.
pub fn parse_port_spec(s: &str) -> Result<Vec<u16>> {
    let mut out = Vec::new();
    let mut seen = HashSet::new();

    for (idx, raw_line) in s.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw_line.split('#').next().unwrap_or_default();
        for entry in line.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (start, end) = match entry.split_once('-') {
                Some((a, b)) => {
                    let start = parse_port(a.trim())
                        .with_context(|| format!("line {line_no}: invalid range start in {entry}"))?;
                    let end = parse_port(b.trim())
                        .with_context(|| format!("line {line_no}: invalid range end in {entry}"))?;
                    if start > end {
                        bail!("line {line_no}: invalid range {start}-{end} (start > end)");
                    }
                    (start, end)
                }
                None => {
                    let p = parse_port(entry)
                        .with_context(|| format!("line {line_no}: invalid port value: {entry}"))?;
                    (p, p)
                }
            };
            out.extend((start..=end).filter(|p| seen.insert(*p)));
        }
    }

    Ok(out)
}

/// Resolve the `--ports` option: an existing file is read as a port list,
/// anything else is parsed inline. An empty result falls back to [`default_ports`].
pub fn load_port_option(value: Option<&str>) -> Result<Vec<u16>> {
    let Some(value) = value.map(str::trim).filter(|v| !v.is_empty()) else {
        return Ok(default_ports());
    };
    let path = Path::new(value);
    let ports = if path.is_file() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read ports file: {}", path.display()))?;
        parse_port_spec(&content)?
    } else {
        parse_port_spec(value)?
    };
    Ok(if ports.is_empty() { default_ports() } else { ports })
}

/// Ports probed on each device when nothing else is configured.
///
/// Common LAN services plus the ports the category heuristic keys on
/// (Chromecast, JetDirect/IPP, Apple sync).
pub fn default_ports() -> Vec<u16> {
    const DEFAULT: &[u16] = &[
        21, 22, 23, 25, 53, 80, 81, 110, 111, 135, 139, 143, 161, 389, 443, 445, 515, 548, 554,
        587, 631, 873, 993, 995, 1080, 1400, 1433, 1723, 1883, 1900, 2049, 3000, 3128, 3306, 3389,
        3689, 5000, 5001, 5060, 5353, 5357, 5432, 5900, 6379, 7000, 7100, 8000, 8008, 8009, 8060,
        8080, 8081, 8088, 8443, 8888, 9000, 9080, 9100, 9443, 10000, 32400, 49152, 62078,
    ];
    DEFAULT.to_vec()
}

/// Ports used to decide whether a host is up during the discovery sweep.
pub fn liveness_ports() -> Vec<u16> {
    vec![80, 443, 22, 445, 139, 53, 62078, 8080, 8009, 5353]
}

/// Conventional service name for a TCP port, if well known.
pub fn service_name(port: u16) -> Option<&'static str> {
    let name = match port {
        21 => "ftp",
        22 => "ssh",
        23 => "telnet",
        25 | 587 => "smtp",
        53 => "domain",
        80 | 81 | 8000 | 8080 | 8081 | 8088 | 9080 => "http",
        110 => "pop3",
        111 => "rpcbind",
        135 => "msrpc",
        139 => "netbios-ssn",
        143 => "imap",
        161 => "snmp",
        389 => "ldap",
        443 | 8443 | 9443 => "https",
        445 => "microsoft-ds",
        515 => "printer",
        548 => "afp",
        554 => "rtsp",
        631 => "ipp",
        873 => "rsync",
        993 => "imaps",
        995 => "pop3s",
        1080 => "socks",
        1400 => "sonos",
        1433 => "ms-sql-s",
        1723 => "pptp",
        1883 => "mqtt",
        1900 => "upnp",
        2049 => "nfs",
        3306 => "mysql",
        3389 => "ms-wbt-server",
        3689 => "daap",
        5000 | 7000 => "upnp",
        5060 => "sip",
        5353 => "mdns",
        5357 => "wsdapi",
        5432 => "postgresql",
        5900 => "vnc",
        6379 => "redis",
        8008 | 8009 => "castv2",
        8060 => "roku-ecp",
        8888 => "http-alt",
        9100 => "jetdirect",
        32400 => "plex",
        62078 => "iphone-sync",
        _ => return None,
    };
    Some(name)
}

fn parse_port(s: &str) -> Result<u16> {
    let val: u32 = s.parse::<u32>().map_err(|e| anyhow::anyhow!(e))?;
    if val == 0 || val > 65535 {
        bail!("port out of range: {val}");
    }
    Ok(val as u16)
}
