fn main() {
    let args = std::env::args();
    // Initialize logging as early as possible; fallback to stderr on failure.
    let _ = ovfs::logging::init_logging(ovfs::logging::LogFormat::Human);

    if let Err(err) = ovfs::run(args) {
        eprintln!("ovfs error: {err}");
        std::process::exit(1);
    }
}
