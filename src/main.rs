use tracing_subscriber::EnvFilter;

fn main() {
    let filter = EnvFilter::try_from_env("AGENTWS_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = agentws::run() {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}
