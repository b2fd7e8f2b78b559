// Per-host terminal output for spot

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::io::IsTerminal;
use std::time::Duration;

use colored::*;

const HOST_COLORS: [Color; 12] = [
    Color::BrightRed,
    Color::BrightGreen,
    Color::BrightYellow,
    Color::BrightBlue,
    Color::BrightMagenta,
    Color::BrightCyan,
    Color::Cyan,
    Color::Magenta,
    Color::Blue,
    Color::Yellow,
    Color::Green,
    Color::Red,
];

/// Prints one line per finished command, coloured by host
#[derive(Debug, Clone)]
pub struct HostPrinter {
    quiet: bool,
}

impl Default for HostPrinter {
    fn default() -> Self {
        Self::new(false)
    }
}

impl HostPrinter {
    pub fn new(quiet: bool) -> Self {
        // Respect NO_COLOR environment variable (https://no-color.org/)
        // Also disable colors if not a TTY
        if std::env::var("NO_COLOR").is_ok() || !std::io::stdout().is_terminal() {
            colored::control::set_override(false);
        }
        HostPrinter { quiet }
    }

    /// Pick a stable colour for a host address
    pub fn host_color(host: &str) -> Color {
        let mut hasher = DefaultHasher::new();
        host.hash(&mut hasher);
        HOST_COLORS[(hasher.finish() % HOST_COLORS.len() as u64) as usize]
    }

    /// Format a command result line without printing it
    pub fn format_line(
        host: &str,
        command: &str,
        details: &str,
        elapsed: Duration,
        failed: bool,
    ) -> String {
        let elapsed = Duration::from_millis(elapsed.as_millis() as u64);
        let status = if failed { "failed " } else { "" };
        format!("[{host}] {status}{command}{details} ({elapsed:?})")
    }

    pub fn print_command_result(
        &self,
        host: &str,
        command: &str,
        details: &str,
        elapsed: Duration,
        failed: bool,
    ) {
        if self.quiet && !failed {
            return;
        }
        let line = Self::format_line(host, command, details, elapsed, failed);
        println!("{}", line.color(Self::host_color(host)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_color_is_stable() {
        assert_eq!(
            HostPrinter::host_color("h1.example.com:22"),
            HostPrinter::host_color("h1.example.com:22")
        );
    }

    #[test]
    fn test_format_line() {
        let line = HostPrinter::format_line(
            "h1:22",
            "copy config",
            " {copy: a -> b}",
            Duration::from_micros(1_500_700),
            false,
        );
        assert_eq!(line, "[h1:22] copy config {copy: a -> b} (1.5s)");

        let failed = HostPrinter::format_line("h1:22", "x", "", Duration::ZERO, true);
        assert_eq!(failed, "[h1:22] failed x (0ns)");
    }
}
