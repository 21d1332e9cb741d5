mod capabilities;
mod daemonize;
mod entry;
mod fs;
mod mount;
mod mount_helper;
mod privmap;
mod rendezvous;
mod subid;
mod util;

use std::{
    ffi::{OsStr, OsString},
    path::PathBuf,
    process::ExitCode,
};

use clap::Parser;

#[derive(Parser)]
#[command(
    name = "groot",
    version,
    about = "Run a command tree as a faked root, with a permission-faking overlay filesystem"
)]
struct Cli {
    #[arg(short = 'w', long = "wrap", value_name = "DIR")]
    wrap: Vec<PathBuf>,

    #[arg(short = 'd', long = "debug")]
    debug: bool,

    command: OsString,

    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<OsString>,
}

fn init_logging(debug: bool) {
    if debug && std::env::var_os("RUST_LOG").is_none() {
        // SAFETY: called once, before any other thread exists (start of main).
        unsafe { std::env::set_var("RUST_LOG", "groot=debug") };
    }
    env_logger::init();
}

// GROOT_WRAPFS is a colon-separated list of additional wrap directories,
// appended after those given with -w.
fn wraps_from_env(cli_wraps: Vec<PathBuf>) -> Vec<PathBuf> {
    let mut wraps = cli_wraps;
    if let Ok(extra) = std::env::var("GROOT_WRAPFS") {
        wraps.extend(extra.split(':').filter(|s| !s.is_empty()).map(PathBuf::from));
    }
    wraps
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.debug);

    let wraps = wraps_from_env(cli.wrap);

    if let Err(err) = entry::run_in_namespace(&wraps, OsStr::new(&cli.command), &cli.args) {
        eprintln!("groot: {err:#}");
        return ExitCode::FAILURE;
    }

    // run_in_namespace only returns on failure; a successful execve
    // replaces this process image before we get here.
    unreachable!("execve either replaced this process or returned an error above")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_wraps_are_appended_after_cli_wraps() {
        // SAFETY: single-threaded test, no other test reads this var.
        unsafe { std::env::set_var("GROOT_WRAPFS", "/a:/b::/c") };
        let wraps = wraps_from_env(vec![PathBuf::from("/cli")]);
        unsafe { std::env::remove_var("GROOT_WRAPFS") };
        assert_eq!(
            wraps,
            vec![
                PathBuf::from("/cli"),
                PathBuf::from("/a"),
                PathBuf::from("/b"),
                PathBuf::from("/c"),
            ]
        );
    }

    #[test]
    fn no_env_var_leaves_cli_wraps_untouched() {
        // SAFETY: single-threaded test, no other test reads this var.
        unsafe { std::env::remove_var("GROOT_WRAPFS") };
        assert_eq!(wraps_from_env(vec![PathBuf::from("/cli")]), vec![PathBuf::from("/cli")]);
    }
}
