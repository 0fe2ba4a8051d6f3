//! rass CLI entry point.
//!
//! Splits argv into proxy options and `--`-separated server commands, wires
//! stdio and the spawned servers into the router, and maps the outcome to
//! an exit code: 0 for an orderly shutdown, 1 for fatal failures, 2 for
//! argument errors (clap's own convention).

use clap::Parser;
use tokio::time::Duration;

use rass::cli::{self, Options};
use rass::endpoint::{Endpoint, Source};
use rass::error::ProxyError;
use rass::policy::{self, PolicyConfig};
use rass::router::{self, Router, RouterOptions};
use rass::supervisor::{ShutdownGrace, Supervisor, spawn_servers};

#[tokio::main]
async fn main() {
    let argv: Vec<String> = std::env::args().collect();
    let (options, server_commands) = cli::split_server_commands(&argv[1..]);

    let opts = match Options::try_parse_from(std::iter::once(argv[0].clone()).chain(options)) {
        Ok(opts) => opts,
        Err(e) => e.exit(),
    };

    if server_commands.is_empty() {
        eprintln!("rass: no server commands given");
        eprintln!("usage: rass [OPTIONS] -- <server> [args] [-- <server> [args]]...");
        std::process::exit(2);
    }

    init_tracing(&opts);

    let code = match run(opts, server_commands).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "fatal");
            eprintln!("rass: {e}");
            1
        }
    };
    std::process::exit(code);
}

async fn run(opts: Options, commands: Vec<Vec<String>>) -> Result<i32, ProxyError> {
    let names: Vec<String> = commands
        .iter()
        .enumerate()
        .map(|(i, argv)| cli::positional_name(argv, i))
        .collect();

    let policy_config = PolicyConfig {
        request_timeout: Duration::from_millis(opts.request_timeout_ms),
        initialize_timeout: Duration::from_millis(opts.initialize_timeout_ms),
        diagnostic_timeout: Duration::from_millis(opts.diagnostic_timeout_ms),
        drop_tardy: opts.drop_tardy,
    };
    let Some(policy) = policy::create_policy(&opts.logic_class, names.clone(), policy_config)
    else {
        eprintln!("rass: unknown logic class: {}", opts.logic_class);
        std::process::exit(2);
    };

    tracing::info!(primary = %names[0], "starting");
    if names.len() > 1 {
        tracing::info!(secondaries = %names[1..].join(", "), "with secondary servers");
    }

    let spawned = spawn_servers(&commands, &names)?;

    let (events_tx, events_rx) = router::channel();
    let delay = (opts.delay_ms > 0).then(|| Duration::from_millis(opts.delay_ms));
    let client = Endpoint::start(
        Source::Client,
        "client",
        tokio::io::stdin(),
        tokio::io::stdout(),
        events_tx.clone(),
        delay,
    );

    let mut servers = Vec::with_capacity(spawned.len());
    let mut children = Vec::with_capacity(spawned.len());
    for (index, server) in spawned.into_iter().enumerate() {
        let endpoint = Endpoint::start(
            Source::Server(index),
            server.name,
            server.stdout,
            server.stdin,
            events_tx.clone(),
            None,
        );
        children.push((server.child, server.stderr, endpoint.name_watch()));
        servers.push(endpoint);
    }

    let supervisor = Supervisor::start(
        children,
        events_tx.clone(),
        opts.quiet_server,
        ShutdownGrace::default(),
    );

    let router_opts = RouterOptions {
        coalesce_window: Duration::from_millis(opts.diagnostic_coalesce_ms),
        drop_tardy: opts.drop_tardy,
        exit_grace: ShutdownGrace::default().wait,
    };
    let router = Router::new(client, servers, policy, router_opts, events_tx, events_rx);

    let outcome = router.run().await;
    supervisor.shutdown().await;
    outcome
}

/// Initialise the tracing subscriber: stderr writer, `--log-level` default
/// refined by `RUST_LOG`, ANSI off under `NO_COLOR`.
fn init_tracing(opts: &Options) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(opts.log_level.as_filter()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(std::env::var_os("NO_COLOR").is_none())
        .init();
}
