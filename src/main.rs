// Mount a local directory as a record namespace. The same binary shape
// works for any engine backend; the local-directory engine doubles as a
// demo and a test fixture.

use anyhow::Context;
use clap::Parser;
use recordfs::engine::localdir::LocalDirEngine;
use recordfs::fuse::RecordFuse;
use recordfs::vfs::cache::{CacheConfig, DEFAULT_FREE_SPACE_REQUIRED};
use recordfs::vfs::fs::{FsOptions, Vfs};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about = "Read-only caching mount over a record namespace")]
struct Args {
    /// Directory served as the record namespace
    #[arg(long)]
    root: PathBuf,
    /// Empty directory to mount on
    #[arg(long)]
    mountpoint: PathBuf,
    /// Local cache directory (defaults beneath the user cache dir)
    #[arg(long)]
    cache_dir: Option<PathBuf>,
    /// Cache ceiling in bytes (unbounded when omitted)
    #[arg(long)]
    max_size: Option<u64>,
    /// Bytes kept free below the ceiling before admitting a download
    #[arg(long, default_value_t = DEFAULT_FREE_SPACE_REQUIRED)]
    free_space: u64,
    /// Seconds a streamed read waits for its range response
    #[arg(long, default_value_t = 30)]
    stream_timeout_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    #[cfg(not(target_os = "linux"))]
    {
        anyhow::bail!(
            "this mount binary only works on Linux (FUSE); run under WSL2 or a Linux host"
        );
    }

    #[cfg(target_os = "linux")]
    {
        use recordfs::fuse::mount::mount_vfs_unprivileged;

        let engine = Arc::new(LocalDirEngine::new(&args.root));
        let vfs = Vfs::new(
            engine.clone(),
            engine,
            FsOptions {
                cache: CacheConfig {
                    data_dir: args.cache_dir,
                    max_size: args.max_size,
                    free_space_required: args.free_space,
                },
                stream_read_timeout: Duration::from_secs(args.stream_timeout_secs),
            },
        )
        .context("init vfs")?;
        let fs = RecordFuse::new(vfs);

        std::fs::create_dir_all(&args.mountpoint).context("create mount point")?;
        println!(
            "Mounting recordfs at {} (records: {})...",
            args.mountpoint.display(),
            args.root.display()
        );
        println!("Press Ctrl+C to unmount and exit.");

        let handle = mount_vfs_unprivileged(fs, &args.mountpoint)
            .await
            .context("mount failed; ensure FUSE (fusermount3) is available")?;

        tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
        println!("Unmounting...");
        handle.unmount().await.context("unmount")?;
        Ok(())
    }
}
