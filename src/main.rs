use stratus::cli::{self, Cli};
use tracing_subscriber::EnvFilter;

fn main() {
    let cli = Cli::parse_args();
    init_tracing(cli.debug);

    match cli::run(cli) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            stratus::ui::output::error(format!("{:#}", e));
            std::process::exit(1);
        }
    }
}

/// Log to stderr, filtered by `STRATUS_LOG` (default `warn`, `debug` with `--debug`).
fn init_tracing(debug: bool) {
    let filter = if debug {
        EnvFilter::new("debug,hyper=warn,h2=warn,reqwest=warn,rustls=warn")
    } else {
        EnvFilter::try_from_env("STRATUS_LOG").unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
