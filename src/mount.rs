//! The mount orchestrator: gates the external filesystem mount on a
//! readiness report, so an unreadable data path becomes an immediate
//! `Unmountable` error instead of an indefinite hang inside the
//! filesystem layer.

#[cfg(feature = "log")]
use log::{debug, warn};

#[cfg(feature = "defmt-log")]
use defmt::{debug, warn};

use embedded_hal::blocking::delay::DelayMs;

use crate::block_device::BlockDevice;
use crate::report::ReadinessReport;

/// The external filesystem collaborator. The bring-up core never owns a
/// filesystem; it hands a validated block device to one of these.
pub trait Filesystem {
    type Error: core::fmt::Debug;

    /// Mount the filesystem on `device` at `path`.
    fn mount<D>(&mut self, device: &mut D, path: &str) -> Result<(), Self::Error>
    where
        D: BlockDevice;

    /// Release the binding at `path`.
    fn unmount(&mut self, path: &str) -> Result<(), Self::Error>;

    /// Enumerate the root directory at `path`. Only used for cache
    /// priming; results are discarded.
    fn enumerate_root(&mut self, path: &str) -> Result<(), Self::Error>;
}

/// The possible failures of [`mount`].
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MountError {
    /// The readiness report shows an unreadable data path; the filesystem
    /// mount was not attempted.
    Unmountable,
    /// The external filesystem mount call failed.
    FilesystemMountFailed,
}

/// Settings for one mount attempt.
#[derive(Debug, Clone)]
pub struct MountOptions<'p> {
    /// Where the filesystem collaborator should bind the volume.
    pub path: &'p str,
    /// When set, wait this long after mounting and then run one
    /// discard-result directory enumeration. Works around boards whose
    /// directory metadata is unreliable until the filesystem cache has
    /// been primed; callers on unaffected hardware leave this `None`.
    pub settle_millis: Option<u16>,
}

impl<'p> MountOptions<'p> {
    /// The settle period observed to be sufficient on affected hardware.
    pub const DEFAULT_SETTLE_MILLIS: u16 = 200;

    pub fn new(path: &'p str) -> Self {
        MountOptions {
            path,
            settle_millis: None,
        }
    }

    /// Enable cache priming with the default settle period.
    pub fn with_cache_priming(mut self) -> Self {
        self.settle_millis = Some(Self::DEFAULT_SETTLE_MILLIS);
        self
    }
}

/// A successfully mounted volume.
///
/// Holds the path and the report that justified mounting. Dropping a
/// session does not unmount; call [`unmount`] so the filesystem binding
/// is released deliberately.
#[derive(Debug)]
pub struct MountSession<'p> {
    path: &'p str,
    report: ReadinessReport,
}

impl<'p> MountSession<'p> {
    pub fn path(&self) -> &'p str {
        self.path
    }

    /// The report this session was mounted on.
    pub fn report(&self) -> &ReadinessReport {
        &self.report
    }
}

/// Hand a validated block device to the external filesystem.
///
/// Refuses immediately with [`MountError::Unmountable`] when the report
/// shows an unreadable MBR, a hang, or a failed communication probe. The
/// filesystem mount call is not attempted at all in those cases, since it
/// would itself hang on the dead data path. A capacity mismatch or a
/// failed sustained read does not block mounting.
///
/// The same device (and therefore the same owned hardware handle) used
/// for validation must be passed here; the bus is never re-opened.
/// Calling this again after [`unmount`] with the same retained device and
/// the same report is valid and does not re-run initialization; whether
/// the prior report is still trustworthy is the caller's decision.
pub fn mount<'p, D, F, T>(
    device: &mut D,
    fs: &mut F,
    report: &ReadinessReport,
    delay: &mut T,
    options: MountOptions<'p>,
) -> Result<MountSession<'p>, MountError>
where
    D: BlockDevice,
    F: Filesystem,
    T: DelayMs<u16>,
{
    if !report.mountable() {
        warn!(
            "Refusing to mount: comm_init_ok={} mbr_read_ok={} hung={}",
            report.comm_init_ok, report.mbr_read_ok, report.hung
        );
        return Err(MountError::Unmountable);
    }

    fs.mount(device, options.path).map_err(|_e| {
        warn!("Filesystem mount failed");
        MountError::FilesystemMountFailed
    })?;
    debug!("Mounted at {}", options.path);

    if let Some(settle) = options.settle_millis {
        // Prime the filesystem's directory cache after the board has had
        // time to settle; the result itself is of no interest.
        delay.delay_ms(settle);
        if fs.enumerate_root(options.path).is_err() {
            warn!("Cache-priming enumeration failed");
        }
    }

    Ok(MountSession {
        path: options.path,
        report: report.clone(),
    })
}

/// Release the filesystem binding of a session.
///
/// Only the binding is released: the hardware handle inside the block
/// device stays valid and may be handed straight back to [`mount`]
/// without re-validating, at the caller's discretion.
pub fn unmount<F>(session: MountSession<'_>, fs: &mut F)
where
    F: Filesystem,
{
    if fs.unmount(session.path).is_err() {
        warn!("Unmount of {} failed", session.path);
    } else {
        debug!("Unmounted {}", session.path);
    }
}
