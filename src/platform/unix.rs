use crate::platform::{
    extract_extension_port, extract_token, sorted_unique, PlatformStrategy, ProcessInfo,
    EXTENSION_PORT_FLAG,
};
use once_cell::sync::Lazy;
use regex::Regex;

// ss -tlnp: "LISTEN 0 4096 127.0.0.1:42100 0.0.0.0:* users:((\"language_serve\",pid=1234,fd=9))"
static SS_LISTEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*LISTEN\s+\d+\s+\d+\s+(\S+):(\d+)\s").unwrap());
// lsof -nP: "language_ 1234 dev 9u IPv4 0x1 0t0 TCP 127.0.0.1:42100 (LISTEN)"
static LSOF_LISTEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"TCP\s+(\S+):(\d+)\s+\(LISTEN\)").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kernel {
    Linux,
    MacOs,
}

pub struct UnixStrategy {
    kernel: Kernel,
}

impl UnixStrategy {
    pub fn new(kernel: Kernel) -> Self {
        Self { kernel }
    }

    fn lsof_command(pid: u32) -> String {
        format!("lsof -nP -a -iTCP -sTCP:LISTEN -p {pid} 2>/dev/null")
    }

    fn parse_ss(output: &str, pid: u32) -> Vec<u16> {
        let owner = format!("pid={pid},");
        output
            .lines()
            .filter(|line| line.contains(&owner))
            .filter_map(|line| SS_LISTEN_RE.captures(line))
            .filter_map(|c| c[2].parse().ok())
            .collect()
    }

    fn parse_lsof(output: &str, pid: u32) -> Vec<u16> {
        let pid = pid.to_string();
        output
            .lines()
            .filter(|line| line.split_whitespace().nth(1) == Some(pid.as_str()))
            .filter_map(|line| LSOF_LISTEN_RE.captures(line))
            .filter_map(|c| c[2].parse().ok())
            .collect()
    }
}

impl PlatformStrategy for UnixStrategy {
    fn name(&self) -> &'static str {
        match self.kernel {
            Kernel::Linux => "linux",
            Kernel::MacOs => "macos",
        }
    }

    fn default_process_name(&self) -> &'static str {
        match self.kernel {
            Kernel::Linux => "language_server_linux",
            Kernel::MacOs => "language_server_macos",
        }
    }

    fn process_list_command(&self, process_name: &str) -> String {
        match self.kernel {
            Kernel::Linux => format!("pgrep -af {process_name}"),
            Kernel::MacOs => format!("pgrep -fl {process_name}"),
        }
    }

    fn parse_process_info(&self, output: &str) -> Option<ProcessInfo> {
        output.lines().find_map(|line| {
            let line = line.trim();
            if !line.contains(EXTENSION_PORT_FLAG) {
                return None;
            }
            let (pid, args) = line.split_once(char::is_whitespace)?;
            Some(ProcessInfo {
                pid: pid.parse().ok()?,
                extension_port: extract_extension_port(args)?,
                auth_token: extract_token(args).unwrap_or_default(),
            })
        })
    }

    fn port_list_command(&self, pid: u32) -> String {
        match self.kernel {
            Kernel::Linux => format!(
                "ss -tlnp 2>/dev/null | grep \"pid={pid},\" || {}",
                Self::lsof_command(pid)
            ),
            Kernel::MacOs => Self::lsof_command(pid),
        }
    }

    fn parse_ports(&self, output: &str, pid: u32) -> Vec<u16> {
        let ports = match self.kernel {
            Kernel::Linux => {
                let from_ss = Self::parse_ss(output, pid);
                if from_ss.is_empty() {
                    Self::parse_lsof(output, pid)
                } else {
                    from_ss
                }
            }
            Kernel::MacOs => Self::parse_lsof(output, pid),
        };
        sorted_unique(ports)
    }
}
