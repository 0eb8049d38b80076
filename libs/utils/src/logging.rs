/// Set up the tracing subscriber for a command line tool.
///
/// We fall back to printing all spans at info-level or above if
/// the RUST_LOG environment variable is not set. Passing `verbose`
/// lowers the default to debug.
pub fn init(verbose: bool) -> anyhow::Result<()> {
    let default_filter_str = if verbose { "debug" } else { "info" };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter_str));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_ansi(false)
        .with_writer(std::io::stderr)
        .init();

    Ok(())
}
