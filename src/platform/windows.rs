use crate::platform::{
    extract_extension_port, extract_token, sorted_unique, PlatformStrategy, ProcessInfo,
};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

static NETSTAT_LISTEN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^\s*TCP\s+(127\.0\.0\.1|0\.0\.0\.0|\[::1?\]):(\d+)\s+\S+\s+LISTENING\s+(\d+)\s*$",
    )
    .unwrap()
});

pub struct WindowsStrategy;

impl WindowsStrategy {
    /// The name filter also matches unrelated products shipping the same
    /// language server binary, so the command line must point at our app.
    fn is_target_app(command_line: &str) -> bool {
        let lower = command_line.to_ascii_lowercase();
        lower.contains("--app_data_dir antigravity") || lower.contains("\\antigravity\\")
    }

    fn candidate(pid: u32, command_line: &str) -> Option<ProcessInfo> {
        if !Self::is_target_app(command_line) {
            return None;
        }
        let auth_token = extract_token(command_line)?;
        Some(ProcessInfo {
            pid,
            extension_port: extract_extension_port(command_line).unwrap_or(0),
            auth_token,
        })
    }

    /// `ConvertTo-Json` emits a bare object for one match and an array for
    /// several.
    fn parse_structured(output: &str) -> Option<Vec<(u32, String)>> {
        let parsed: Value = serde_json::from_str(output.trim()).ok()?;
        let records = match parsed {
            Value::Array(items) => items,
            obj @ Value::Object(_) => vec![obj],
            _ => return None,
        };
        Some(
            records
                .iter()
                .filter_map(|r| {
                    let pid = r.get("ProcessId").and_then(Value::as_u64)?;
                    let cmd = r.get("CommandLine").and_then(Value::as_str)?;
                    Some((u32::try_from(pid).ok()?, cmd.to_string()))
                })
                .collect(),
        )
    }

    /// `wmic ... /format:list` output: `Key=Value` lines, records separated
    /// by blank lines.
    fn parse_legacy(output: &str) -> Vec<(u32, String)> {
        let mut out = Vec::new();
        let mut pid: Option<u32> = None;
        let mut cmd: Option<String> = None;

        for line in output.lines().chain(std::iter::once("")) {
            let line = line.trim();
            if line.is_empty() {
                if let (Some(p), Some(c)) = (pid.take(), cmd.take()) {
                    out.push((p, c));
                }
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            match key.trim() {
                "ProcessId" => pid = value.trim().parse().ok(),
                "CommandLine" => cmd = Some(value.trim().to_string()),
                _ => {}
            }
        }
        out
    }
}

impl PlatformStrategy for WindowsStrategy {
    fn name(&self) -> &'static str {
        "windows"
    }

    fn default_process_name(&self) -> &'static str {
        "language_server_windows_x64.exe"
    }

    fn process_list_command(&self, process_name: &str) -> String {
        format!(
            "powershell -NoProfile -NonInteractive -Command \"Get-CimInstance Win32_Process -Filter 'name=''{process_name}''' | Select-Object ProcessId,CommandLine | ConvertTo-Json -Compress\""
        )
    }

    fn fallback_process_list_command(&self, process_name: &str) -> Option<String> {
        Some(format!(
            "wmic process where \"name='{process_name}'\" get ProcessId,CommandLine /format:list"
        ))
    }

    fn parse_process_info(&self, output: &str) -> Option<ProcessInfo> {
        let records =
            Self::parse_structured(output).unwrap_or_else(|| Self::parse_legacy(output));
        records
            .iter()
            .find_map(|(pid, cmd)| Self::candidate(*pid, cmd))
    }

    fn port_list_command(&self, pid: u32) -> String {
        format!("netstat -ano | findstr \"{pid}\" | findstr \"LISTENING\"")
    }

    fn parse_ports(&self, output: &str, pid: u32) -> Vec<u16> {
        let ports = output
            .lines()
            .filter_map(|line| NETSTAT_LISTEN_RE.captures(line))
            .filter(|c| c[3].parse::<u32>().ok() == Some(pid))
            .filter_map(|c| c[2].parse::<u16>().ok())
            .collect();
        sorted_unique(ports)
    }
}
