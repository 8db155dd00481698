use std::path::{Path, PathBuf};
use std::sync::Arc;

use drive_api::{ClientBuilder, Drive, DriveError};
use drivefs::fs::NodeTree;
use drivefs::remote::DriveStore;
use thiserror::Error;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::app_config;

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("failed to start the async runtime: {0}")]
    Runtime(#[source] std::io::Error),

    #[error("failed to set up the drive client")]
    Client(#[from] DriveError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

mod managed_fuse {
    //! fuser only does a lazy unmount when the `BackgroundSession` is dropped. Dropping a
    //! [`ManagedFuse`] after the session makes sure the mount point is really released, even
    //! when something still holds files open on it.
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::Duration;

    use drivefs::fs::NodeTree;
    use drivefs::fs::fuser::FuserAdapter;
    use drivefs::remote::RemoteStore;
    use fuser::BackgroundSession;
    use nix::errno::Errno;
    use tokio_util::sync::CancellationToken;

    use super::{debug, error};

    pub struct ManagedFuse {
        mount_point: PathBuf,
        allow_other: bool,
        read_only: bool,
    }

    impl ManagedFuse {
        pub fn new(mount_point: PathBuf, allow_other: bool, read_only: bool) -> Self {
            Self {
                mount_point,
                allow_other,
                read_only,
            }
        }

        pub fn spawn<S: RemoteStore>(
            &self,
            tree: Arc<NodeTree<S>>,
            handle: tokio::runtime::Handle,
            shutdown: CancellationToken,
        ) -> Result<BackgroundSession, std::io::Error> {
            let adapter = FuserAdapter::new(tree, handle, shutdown);

            let mut mount_opts = vec![
                fuser::MountOption::FSName("drivefs".to_owned()),
                fuser::MountOption::Subtype("drivefs".to_owned()),
                fuser::MountOption::NoDev,
                fuser::MountOption::NoSuid,
                fuser::MountOption::DefaultPermissions,
            ];
            if self.read_only {
                mount_opts.push(fuser::MountOption::RO);
            }
            if self.allow_other {
                mount_opts.push(fuser::MountOption::AllowOther);
            }

            fuser::spawn_mount2(adapter, &self.mount_point, &mount_opts)
        }
    }

    impl Drop for ManagedFuse {
        fn drop(&mut self) {
            const UMOUNT_ATTEMPT_COUNT: usize = 10;
            const UMOUNT_ATTEMPT_DELAY: Duration = Duration::from_millis(10);

            debug!(mount_point = ?self.mount_point, "Confirming unmount of FUSE filesystem...");

            for attempt in 1..=UMOUNT_ATTEMPT_COUNT {
                match nix::mount::umount2(&self.mount_point, nix::mount::MntFlags::MNT_DETACH) {
                    Ok(()) => {
                        debug!(attempt, "Unmounted FUSE filesystem.");
                        break;
                    }
                    Err(Errno::EBUSY) => {
                        debug!(attempt, "FUSE filesystem still busy, retrying...");
                        std::thread::sleep(UMOUNT_ATTEMPT_DELAY);
                    }
                    Err(Errno::EINVAL | Errno::ENOENT) => {
                        debug!(attempt, "FUSE filesystem already unmounted.");
                        break;
                    }
                    Err(e) => {
                        error!(attempt, "Failed to unmount FUSE filesystem: {e}");
                        break;
                    }
                }
            }
        }
    }
}

/// Prepares the mount point directory.
///
/// - If the directory exists and is non-empty, returns an error.
/// - If the directory does not exist, creates it (including parents).
/// - If the directory exists and is empty, does nothing.
async fn prepare_mount_point(mount_point: &Path) -> Result<(), std::io::Error> {
    match tokio::fs::read_dir(mount_point).await {
        Ok(mut entries) => {
            if entries.next_entry().await?.is_some() {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    format!(
                        "Mount point '{}' already exists and is not empty.",
                        mount_point.display()
                    ),
                ));
            }
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tokio::fs::create_dir_all(mount_point).await?;
            info!(path = %mount_point.display(), "Created mount point directory.");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

async fn wait_for_exit() -> Result<(), std::io::Error> {
    use tokio::signal;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    let mut sighup = signal::unix::signal(signal::unix::SignalKind::hangup())?;
    select! {
        _ = signal::ctrl_c() => {
            debug!("Received Ctrl+C signal, shutting down...");
        },
        _ = sigterm.recv() => {
            debug!("Received termination signal, shutting down...");
        },
        _ = sighup.recv() => {
            debug!("Received hangup signal, shutting down...");
        },
    }
    Ok(())
}

/// Mount the configured drive at `mount_point` and serve it until a signal arrives.
pub async fn run(
    config: app_config::Config,
    mount_point: PathBuf,
    handle: tokio::runtime::Handle,
) -> Result<(), DaemonError> {
    let client: Drive = ClientBuilder::new(config.client_config())
        .timeout(config.timeout())
        .build()?;
    let store = Arc::new(DriveStore::new(client));
    let tree = Arc::new(NodeTree::new(store, config.mount_options()));

    prepare_mount_point(&mount_point).await?;
    info!(
        mount_point = %mount_point.display(),
        read_only = config.mount.read_only,
        "Mounting drive directory {}.",
        config.api.directory_id
    );

    let shutdown = CancellationToken::new();
    let fuse = managed_fuse::ManagedFuse::new(
        mount_point,
        config.mount.allow_other,
        config.mount.read_only,
    );
    {
        let _session = fuse.spawn(tree, handle, shutdown.clone())?;
        info!("drivefs is running. Press Ctrl+C to stop.");

        wait_for_exit().await?;
        shutdown.cancel();
    }
    Ok(())
}

pub fn spawn(config: app_config::Config, mount_point: PathBuf) -> Result<(), DaemonError> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(DaemonError::Runtime)?;
    runtime.block_on(run(config, mount_point, runtime.handle().clone()))
}
