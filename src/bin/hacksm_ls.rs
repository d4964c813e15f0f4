//! The listing tool (§6): report which files are plain (`p`) versus
//! migrated (`m`), optionally walking a directory tree.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;

use hacksm::ls;

#[cfg(feature = "real-dmapi")]
use hacksm::dmapi::sys::SysSession;
#[cfg(not(feature = "real-dmapi"))]
use hacksm::dmapi::virtual_session::{VirtualFs, VirtualSession};

/// List files, marking migrated ones.
#[derive(Parser, Debug)]
#[command(name = "hacksm_ls")]
struct Args {
    paths: Vec<PathBuf>,

    /// Recurse into directories.
    #[arg(short = 'R', long = "recursive")]
    recursive: bool,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    #[cfg(feature = "real-dmapi")]
    {
        let sess = SysSession::recover_or_create("hacksm_ls")?;
        return run(&sess, &args);
    }

    #[cfg(not(feature = "real-dmapi"))]
    {
        let fs = VirtualFs::new();
        let sess = VirtualSession::recover_or_create(fs, "hacksm_ls")?;
        run(&sess, &args)
    }
}

fn run(sess: &impl hacksm::dmapi::DmSession, args: &Args) -> Result<()> {
    for path in &args.paths {
        list_one(sess, path, args.recursive)?;
    }
    Ok(())
}

fn list_one(sess: &impl hacksm::dmapi::DmSession, path: &Path, recursive: bool) -> Result<()> {
    let meta = std::fs::symlink_metadata(path).with_context(|| format!("stat {:?}", path))?;
    if meta.is_dir() {
        if !recursive {
            anyhow::bail!("{:?} is a directory (pass -R to recurse)", path);
        }
        for entry in std::fs::read_dir(path)? {
            list_one(sess, &entry?.path(), recursive)?;
        }
        return Ok(());
    }

    let listing = ls::ls(sess, path)?;
    println!("{}", listing);
    Ok(())
}
