use once_cell::sync::Lazy;
use regex::Regex;

pub mod unix;
pub mod windows;

pub use unix::{Kernel, UnixStrategy};
pub use windows::WindowsStrategy;

pub const EXTENSION_PORT_FLAG: &str = "--extension_server_port";

static EXTENSION_PORT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"--extension_server_port(?:=|\s+)(\d+)").unwrap());
static TOKEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"--csrf_token(?:=|\s+)["']?([^\s"']+)"#).unwrap());

/// Launch metadata pulled from a language server command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub extension_port: u16,
    pub auth_token: String,
}

/// OS-specific process and port inspection.
///
/// Commands are plain shell strings so they can be logged and replayed by
/// hand. Parsers never fail: unrecognized output means "no match" or no
/// ports.
pub trait PlatformStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn default_process_name(&self) -> &'static str;

    fn process_list_command(&self, process_name: &str) -> String;

    /// Secondary enumeration to try when the primary command fails or
    /// produces nothing.
    fn fallback_process_list_command(&self, _process_name: &str) -> Option<String> {
        None
    }

    fn parse_process_info(&self, output: &str) -> Option<ProcessInfo>;

    fn port_list_command(&self, pid: u32) -> String;

    /// Listening ports for `pid`, deduplicated and sorted ascending.
    fn parse_ports(&self, output: &str, pid: u32) -> Vec<u16>;
}

/// Picks the strategy for the OS this binary was built for.
pub fn host_strategy() -> Box<dyn PlatformStrategy> {
    if cfg!(target_os = "windows") {
        Box::new(WindowsStrategy)
    } else if cfg!(target_os = "macos") {
        Box::new(UnixStrategy::new(Kernel::MacOs))
    } else {
        Box::new(UnixStrategy::new(Kernel::Linux))
    }
}

pub(crate) fn extract_extension_port(command_line: &str) -> Option<u16> {
    EXTENSION_PORT_RE
        .captures(command_line)
        .and_then(|c| c[1].parse().ok())
}

pub(crate) fn extract_token(command_line: &str) -> Option<String> {
    TOKEN_RE
        .captures(command_line)
        .map(|c| c[1].to_string())
        .filter(|t| !t.is_empty())
}

pub(crate) fn sorted_unique(mut ports: Vec<u16>) -> Vec<u16> {
    ports.sort_unstable();
    ports.dedup();
    ports
}
