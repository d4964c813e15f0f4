//! The migrator (M, §4.2) command line entry point.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use hacksm::config::Config;
use hacksm::migrate::{self, Outcome};
use hacksm::store::Store;

#[cfg(feature = "real-dmapi")]
use hacksm::dmapi::sys::SysSession;
#[cfg(not(feature = "real-dmapi"))]
use hacksm::dmapi::virtual_session::{VirtualFs, VirtualSession};

/// Migrate resident files to the store, marking them MIGRATED.
#[derive(Parser, Debug)]
#[command(name = "hacksm_migrate")]
struct Args {
    /// Files to migrate.
    paths: Vec<PathBuf>,

    /// Config file (TOML), merged over the built-in defaults.
    #[arg(short = 'f', long = "config")]
    config: Option<PathBuf>,

    /// Quiescence gap, in milliseconds, before punching the hole.
    #[arg(short = 'w', long = "wait-time")]
    wait_time_ms: Option<u64>,

    /// Respond CONTINUE to every token left outstanding by a crashed
    /// prior invocation, then exit.
    #[arg(short = 'c', long = "cleanup")]
    cleanup: bool,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut cfg = Config::load(args.config.as_deref()).context("loading config")?;
    if let Some(w) = args.wait_time_ms {
        cfg.wait_time_ms = w;
    }
    let store = Store::init(&cfg.store_path).context("opening store")?;

    #[cfg(feature = "real-dmapi")]
    {
        let sess = SysSession::recover_or_create("hacksm_migrate")?;
        return run(&sess, &store, &cfg, &args);
    }

    #[cfg(not(feature = "real-dmapi"))]
    {
        let fs = VirtualFs::new();
        let sess = VirtualSession::recover_or_create(fs, "hacksm_migrate")?;
        run(&sess, &store, &cfg, &args)
    }
}

fn run(sess: &impl hacksm::dmapi::DmSession, store: &Store, cfg: &Config, args: &Args) -> Result<()> {
    if args.cleanup {
        let n = migrate::cleanup_tokens(sess)?;
        log::info!("cleaned up {} outstanding token(s)", n);
        return Ok(());
    }

    let mut failed = 0;
    for path in &args.paths {
        match migrate::migrate(sess, store, cfg, path) {
            Ok(Outcome::Migrated) => println!("migrated {}", path.display()),
            Ok(Outcome::Skipped(reason)) => println!("skipped {}: {}", path.display(), reason),
            Err(e) => {
                eprintln!("error migrating {}: {}", path.display(), e);
                failed += 1;
            }
        }
    }

    if failed > 0 {
        anyhow::bail!("{} of {} file(s) failed to migrate", failed, args.paths.len());
    }
    Ok(())
}
