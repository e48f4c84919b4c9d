//! Imgcache.
//!
//! A command line front end for the image cache. It fetches images through the memory and disk
//! tiers, and maintains the on-disk cache directory.

mod cli;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            imgcache_service::logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
