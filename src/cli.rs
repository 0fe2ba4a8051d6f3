//! CLI argument types and server-command splitting.
//!
//! The invocation shape is
//! `rass [OPTIONS] -- cmd1 [args1...] -- cmd2 [args2...] ...`:
//! everything before the first `--` is parsed by clap, and the rest is split
//! on `--` into one argv per server. These types are defined separately from
//! `main.rs` so integration tests can parse command lines directly.

use clap::{Parser, ValueEnum};

/// Proxy options (the part of argv before the first `--`).
#[derive(Parser, Debug)]
#[command(
    name = "rass",
    version,
    about = "LSP multiplexing proxy: one client, many language servers",
    after_help = "Servers are given as `--`-separated command lines:\n\
                  rass [OPTIONS] -- basedpyright-langserver --stdio -- ruff server"
)]
pub struct Options {
    /// Delay each message to the client by this many milliseconds.
    #[arg(long, value_name = "N", default_value_t = 0)]
    pub delay_ms: u64,

    /// Discard late server responses and diagnostics after their deadline.
    #[arg(long)]
    pub drop_tardy: bool,

    /// Aggregation deadline for general requests, in milliseconds.
    #[arg(long, value_name = "N", default_value_t = 2000)]
    pub request_timeout_ms: u64,

    /// Aggregation deadline for initialize, in milliseconds.
    #[arg(long, value_name = "N", default_value_t = 2500)]
    pub initialize_timeout_ms: u64,

    /// Per-server diagnostics tardiness threshold, in milliseconds.
    #[arg(long, value_name = "N", default_value_t = 1000)]
    pub diagnostic_timeout_ms: u64,

    /// Coalescing window for merged diagnostics, in milliseconds.
    #[arg(long, value_name = "N", default_value_t = 50)]
    pub diagnostic_coalesce_ms: u64,

    /// Policy implementation to route with.
    #[arg(long, value_name = "NAME", default_value = "lsp")]
    pub logic_class: String,

    /// Log verbosity (RUST_LOG overrides).
    #[arg(long, value_enum, value_name = "LEVEL", default_value = "info")]
    pub log_level: LogLevel,

    /// Do not forward server stderr.
    #[arg(long)]
    pub quiet_server: bool,
}

/// Log verbosity selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// The tracing filter directive this level maps to.
    pub fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Split argv on `--` separators into the proxy's own options and one argv
/// per server. Empty command groups are dropped.
pub fn split_server_commands(args: &[String]) -> (Vec<String>, Vec<Vec<String>>) {
    let mut groups = args.split(|arg| arg == "--");
    let options = groups.next().unwrap_or_default().to_vec();
    let servers: Vec<Vec<String>> = groups
        .map(<[String]>::to_vec)
        .filter(|cmd| !cmd.is_empty())
        .collect();
    (options, servers)
}

/// Positional display name for a server command: the executable's basename,
/// suffixed `#index` past the primary so repeated commands stay tellable
/// apart.
pub fn positional_name(argv: &[String], index: usize) -> String {
    let basename = argv
        .first()
        .map(|cmd| {
            std::path::Path::new(cmd)
                .file_name()
                .map(|f| f.to_string_lossy().into_owned())
                .unwrap_or_else(|| cmd.clone())
        })
        .unwrap_or_else(|| format!("server{index}"));
    if index > 0 {
        format!("{basename}#{index}")
    } else {
        basename
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn splits_multiple_server_commands() {
        let (options, servers) = split_server_commands(&args(&[
            "--drop-tardy",
            "--",
            "basedpyright-langserver",
            "--stdio",
            "--",
            "ruff",
            "server",
        ]));
        assert_eq!(options, args(&["--drop-tardy"]));
        assert_eq!(
            servers,
            vec![
                args(&["basedpyright-langserver", "--stdio"]),
                args(&["ruff", "server"]),
            ]
        );
    }

    #[test]
    fn no_separator_means_no_servers() {
        let (options, servers) = split_server_commands(&args(&["--delay-ms", "5"]));
        assert_eq!(options, args(&["--delay-ms", "5"]));
        assert!(servers.is_empty());
    }

    #[test]
    fn empty_groups_are_dropped() {
        let (_, servers) = split_server_commands(&args(&["--", "--", "ruff", "server", "--"]));
        assert_eq!(servers, vec![args(&["ruff", "server"])]);
    }

    #[test]
    fn positional_names_use_basename_and_index() {
        assert_eq!(
            positional_name(&args(&["/usr/bin/clangd", "--background-index"]), 0),
            "clangd"
        );
        assert_eq!(positional_name(&args(&["clangd"]), 2), "clangd#2");
    }
}
