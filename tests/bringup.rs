//! End-to-end bring-up behaviour over simulated devices: validation
//! stage outcomes, mount gating, keepalive and the capacity heuristic.

use std::cell::Cell;

use embedded_hal::blocking::delay::DelayMs;

use sd_bringup::{
    mount, size_class_bytes, unmount, Block, BlockCount, BlockDevice, BlockIdx, CardIdentity,
    Clock, Filesystem, InitError, LivenessKeeper, MemoryBlockDevice, MountError, MountOptions,
    PartitionKind, ReadError, TimeBudget, Validator,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A clock whose time is owned by the test, so simulated devices can make
/// "slow" operations happen instantly.
#[derive(Copy, Clone)]
struct SharedClock<'a>(&'a Cell<u64>);

impl<'a> Clock for SharedClock<'a> {
    fn now_millis(&mut self) -> u64 {
        self.0.get()
    }
}

/// Fill a block-0 image with a valid MBR: FAT32-LBA first partition and
/// the boot signature at offset 510.
fn write_mbr(block: &mut [u8]) {
    block[446 + 4] = 0x0C;
    block[510] = 0x55;
    block[511] = 0xAA;
}

fn card_image(blocks: usize) -> Vec<u8> {
    let mut image = vec![0u8; blocks * Block::LEN];
    write_mbr(&mut image[..Block::LEN]);
    image
}

/// Counts bus transactions on the wrapped device.
struct SpyDevice<D> {
    inner: D,
    init_calls: u32,
    read_calls: u32,
    poisoned: bool,
}

impl<D> SpyDevice<D> {
    fn new(inner: D) -> Self {
        SpyDevice {
            inner,
            init_calls: 0,
            read_calls: 0,
            poisoned: false,
        }
    }
}

impl<D> BlockDevice for SpyDevice<D>
where
    D: BlockDevice,
{
    fn initialize(&mut self) -> Result<CardIdentity, InitError> {
        self.init_calls += 1;
        self.inner.initialize()
    }

    fn read_block(&mut self, block_idx: BlockIdx, block: &mut Block) -> Result<(), ReadError> {
        self.read_calls += 1;
        self.inner.read_block(block_idx, block)
    }

    fn mark_poisoned(&mut self) {
        self.poisoned = true;
        self.inner.mark_poisoned();
    }
}

/// A device whose reads take far longer than any sane budget. The read
/// does return (a test cannot literally hang), but only after pushing the
/// shared clock past the deadline.
struct WedgedReadDevice<'a> {
    clock: &'a Cell<u64>,
    read_cost_millis: u64,
}

impl<'a> BlockDevice for WedgedReadDevice<'a> {
    fn initialize(&mut self) -> Result<CardIdentity, InitError> {
        Ok(CardIdentity {
            block_count: BlockCount(8),
        })
    }

    fn read_block(&mut self, _block_idx: BlockIdx, _block: &mut Block) -> Result<(), ReadError> {
        self.clock.set(self.clock.get() + self.read_cost_millis);
        Ok(())
    }
}

/// First read succeeds, every following read returns an error token, as
/// seen on controllers that reset their internal read pointer wrongly.
struct FirstReadOnlyDevice {
    image: Vec<u8>,
    reads: u32,
}

impl BlockDevice for FirstReadOnlyDevice {
    fn initialize(&mut self) -> Result<CardIdentity, InitError> {
        Ok(CardIdentity {
            block_count: BlockCount((self.image.len() / Block::LEN) as u32),
        })
    }

    fn read_block(&mut self, block_idx: BlockIdx, block: &mut Block) -> Result<(), ReadError> {
        self.reads += 1;
        if self.reads > 1 {
            return Err(ReadError::IoError);
        }
        MemoryBlockDevice::new(&self.image).read_block(block_idx, block)
    }
}

/// Reports whatever block count the test asks for; reads return a valid
/// MBR in block 0 and zeroes elsewhere.
struct SizedDevice {
    block_count: u32,
}

impl BlockDevice for SizedDevice {
    fn initialize(&mut self) -> Result<CardIdentity, InitError> {
        Ok(CardIdentity {
            block_count: BlockCount(self.block_count),
        })
    }

    fn read_block(&mut self, block_idx: BlockIdx, block: &mut Block) -> Result<(), ReadError> {
        block.contents = [0u8; Block::LEN];
        if block_idx == BlockIdx(0) {
            write_mbr(&mut block.contents);
        }
        Ok(())
    }
}

#[derive(Default)]
struct StubFs {
    mount_calls: u32,
    unmount_calls: u32,
    enumerate_calls: u32,
    fail_mount: bool,
}

impl Filesystem for StubFs {
    type Error = &'static str;

    fn mount<D>(&mut self, _device: &mut D, _path: &str) -> Result<(), Self::Error>
    where
        D: BlockDevice,
    {
        self.mount_calls += 1;
        if self.fail_mount {
            Err("mount rejected")
        } else {
            Ok(())
        }
    }

    fn unmount(&mut self, _path: &str) -> Result<(), Self::Error> {
        self.unmount_calls += 1;
        Ok(())
    }

    fn enumerate_root(&mut self, _path: &str) -> Result<(), Self::Error> {
        self.enumerate_calls += 1;
        Ok(())
    }
}

#[derive(Default)]
struct StubDelay {
    delays: Vec<u16>,
}

impl DelayMs<u16> for StubDelay {
    fn delay_ms(&mut self, ms: u16) {
        self.delays.push(ms);
    }
}

#[test]
fn fault_free_device_yields_full_report() {
    init_logging();
    let image = card_image(8);
    let mut device = MemoryBlockDevice::new(&image);
    let time = Cell::new(0);

    let report = Validator::new(SharedClock(&time)).validate(&mut device, TimeBudget::DEFAULT);

    assert!(report.comm_init_ok);
    assert!(report.mbr_read_ok);
    assert!(!report.hung);
    assert_eq!(report.mbr_signature, [0x55, 0xAA]);
    assert!(report.mbr_signature_valid);
    assert_eq!(report.partition_type, PartitionKind::Fat32Lba);
    assert!(report.multiblock_read_ok);
    assert_eq!(report.reported_capacity_bytes, 8 * 512);
    assert!(report.usable());
    assert!(report.mountable());
}

#[test]
fn wedged_mbr_read_is_reported_as_hung_and_poisons_the_device() {
    init_logging();
    let time = Cell::new(0);
    let mut device = SpyDevice::new(WedgedReadDevice {
        clock: &time,
        read_cost_millis: 60_000,
    });

    let report =
        Validator::new(SharedClock(&time)).validate(&mut device, TimeBudget::from_secs(10));

    assert!(report.comm_init_ok);
    assert!(!report.mbr_read_ok);
    assert!(report.hung);
    assert!(device.poisoned);
    assert_eq!(report.timings.mbr_millis, 60_000);
    // The sustained read never ran on the wedged path.
    assert_eq!(device.read_calls, 1);
    assert!(!report.mountable());
}

#[test]
fn hung_report_refuses_mount_without_touching_the_filesystem() {
    init_logging();
    let time = Cell::new(0);
    let mut device = WedgedReadDevice {
        clock: &time,
        read_cost_millis: 60_000,
    };
    let report =
        Validator::new(SharedClock(&time)).validate(&mut device, TimeBudget::from_secs(10));

    let mut fs = StubFs::default();
    let mut delay = StubDelay::default();
    let result = mount(
        &mut device,
        &mut fs,
        &report,
        &mut delay,
        MountOptions::new("/sd"),
    );

    assert_eq!(result.unwrap_err(), MountError::Unmountable);
    assert_eq!(fs.mount_calls, 0);
}

#[test]
fn failed_sustained_read_does_not_block_mounting() {
    init_logging();
    let time = Cell::new(0);
    let mut device = FirstReadOnlyDevice {
        image: card_image(8),
        reads: 0,
    };

    let report = Validator::new(SharedClock(&time)).validate(&mut device, TimeBudget::DEFAULT);

    assert!(report.mbr_read_ok);
    assert!(!report.multiblock_read_ok);
    assert!(!report.usable());
    assert!(report.mountable());

    let mut fs = StubFs::default();
    let mut delay = StubDelay::default();
    let session = mount(
        &mut device,
        &mut fs,
        &report,
        &mut delay,
        MountOptions::new("/sd"),
    )
    .unwrap();

    assert_eq!(fs.mount_calls, 1);
    assert_eq!(session.path(), "/sd");
    assert!(!session.report().multiblock_read_ok);
}

#[test]
fn remount_after_unmount_reuses_the_handle_without_reinitializing() {
    init_logging();
    let image = card_image(8);
    let mut device = SpyDevice::new(MemoryBlockDevice::new(&image));
    let time = Cell::new(0);

    let report = Validator::new(SharedClock(&time)).validate(&mut device, TimeBudget::DEFAULT);
    assert_eq!(device.init_calls, 1);

    let mut fs = StubFs::default();
    let mut delay = StubDelay::default();

    let session = mount(
        &mut device,
        &mut fs,
        &report,
        &mut delay,
        MountOptions::new("/sd"),
    )
    .unwrap();
    unmount(session, &mut fs);
    assert_eq!(fs.unmount_calls, 1);

    // Re-mounting on the retained handle and the prior report must not
    // re-run chip-select setup or the handshake.
    mount(
        &mut device,
        &mut fs,
        &report,
        &mut delay,
        MountOptions::new("/sd"),
    )
    .unwrap();

    assert_eq!(device.init_calls, 1);
    assert_eq!(fs.mount_calls, 2);
}

#[test]
fn filesystem_rejection_maps_to_mount_failed() {
    init_logging();
    let image = card_image(8);
    let mut device = MemoryBlockDevice::new(&image);
    let time = Cell::new(0);
    let report = Validator::new(SharedClock(&time)).validate(&mut device, TimeBudget::DEFAULT);

    let mut fs = StubFs {
        fail_mount: true,
        ..StubFs::default()
    };
    let mut delay = StubDelay::default();
    let result = mount(
        &mut device,
        &mut fs,
        &report,
        &mut delay,
        MountOptions::new("/sd"),
    );

    assert_eq!(result.unwrap_err(), MountError::FilesystemMountFailed);
    assert_eq!(fs.mount_calls, 1);
}

#[test]
fn cache_priming_waits_then_enumerates_once() {
    init_logging();
    let image = card_image(8);
    let mut device = MemoryBlockDevice::new(&image);
    let time = Cell::new(0);
    let report = Validator::new(SharedClock(&time)).validate(&mut device, TimeBudget::DEFAULT);

    let mut fs = StubFs::default();
    let mut delay = StubDelay::default();
    mount(
        &mut device,
        &mut fs,
        &report,
        &mut delay,
        MountOptions::new("/sd").with_cache_priming(),
    )
    .unwrap();

    assert_eq!(delay.delays, vec![MountOptions::DEFAULT_SETTLE_MILLIS]);
    assert_eq!(fs.enumerate_calls, 1);

    // Without priming configured, neither the delay nor the enumeration
    // happens.
    let mut quiet_fs = StubFs::default();
    let mut quiet_delay = StubDelay::default();
    mount(
        &mut device,
        &mut quiet_fs,
        &report,
        &mut quiet_delay,
        MountOptions::new("/sd"),
    )
    .unwrap();
    assert!(quiet_delay.delays.is_empty());
    assert_eq!(quiet_fs.enumerate_calls, 0);
}

#[test]
fn read_mbr_only_skips_the_sustained_read() {
    init_logging();
    let image = card_image(8);
    let mut device = SpyDevice::new(MemoryBlockDevice::new(&image));
    let time = Cell::new(0);

    let report =
        Validator::new(SharedClock(&time)).read_mbr_only(&mut device, TimeBudget::DEFAULT);

    assert!(report.comm_init_ok);
    assert!(report.mbr_read_ok);
    assert!(!report.multiblock_read_ok);
    assert_eq!(device.read_calls, 1);
    // Still good enough to gate a later mount on.
    assert!(report.mountable());
}

#[test]
fn tick_below_idle_threshold_touches_nothing() {
    init_logging();
    let image = card_image(8);
    let mut device = SpyDevice::new(MemoryBlockDevice::new(&image));
    let time = Cell::new(0);
    let mut clock = SharedClock(&time);
    let mut keeper = LivenessKeeper::new(0);

    time.set(500);
    assert_eq!(keeper.tick(&mut device, &mut clock), Ok(false));
    assert_eq!(device.read_calls, 0);

    time.set(900);
    assert_eq!(keeper.tick(&mut device, &mut clock), Ok(true));
    assert_eq!(device.read_calls, 1);

    // Other bus activity resets the idle window.
    time.set(1600);
    keeper.note_activity(1600);
    time.set(2300);
    assert_eq!(keeper.tick(&mut device, &mut clock), Ok(false));
    assert_eq!(device.read_calls, 1);

    time.set(2500);
    assert_eq!(keeper.tick(&mut device, &mut clock), Ok(true));
    assert_eq!(device.read_calls, 2);
}

#[test]
fn half_of_nominal_class_flags_capacity_mismatch() {
    init_logging();
    let time = Cell::new(0);
    let nominal = size_class_bytes(64);

    // Exactly half the class: flagged.
    let mut half_card = SizedDevice {
        block_count: (nominal / 2 / Block::LEN as u64) as u32,
    };
    let report = Validator::new(SharedClock(&time))
        .with_nominal_capacity(nominal)
        .validate(&mut half_card, TimeBudget::DEFAULT);
    assert!(report.capacity_mismatch);
    // Advisory only: the report still mounts.
    assert!(report.mountable());

    // The full class: not flagged.
    let mut full_card = SizedDevice {
        block_count: (nominal / Block::LEN as u64) as u32,
    };
    let report = Validator::new(SharedClock(&time))
        .with_nominal_capacity(nominal)
        .validate(&mut full_card, TimeBudget::DEFAULT);
    assert!(!report.capacity_mismatch);

    // No expectation configured, no flag.
    let report =
        Validator::new(SharedClock(&time)).validate(&mut half_card, TimeBudget::DEFAULT);
    assert!(!report.capacity_mismatch);
}
