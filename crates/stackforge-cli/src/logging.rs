use tracing_subscriber::EnvFilter;

const VERBOSE_FILTER: &str =
    "warn,stackforge=debug,stackforge_core=debug,stackforge_release=debug,stackforge_installer=debug";

pub(crate) fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new(VERBOSE_FILTER)
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
