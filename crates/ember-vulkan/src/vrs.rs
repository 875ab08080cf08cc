//! Forced per-vertex variable rate shading (GFX10.3).
//!
//! The rate comes from `EMBER_FORCE_VRS`, or from a file named by
//! `EMBER_FORCE_VRS_CONFIG_FILE` that a notifier thread re-reads whenever it
//! changes. Draws that use the forced rate need a device-wide HTILE buffer,
//! created on first use by [`Device::init_vrs_state`].

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime};

use ember_core::{GpuAddr, align_up, div_round_up};
use ember_surface::image::UnifiedLayout;
use ember_surface::{
    DepthStencilSurfaceDescriptor, Extent3d, Format, Image, ImageUsage, Surface, encode_vrs_surface,
};

use crate::buffer::{BindBufferMemoryInfo, Buffer, BufferCreateInfo, BufferUsageFlags};
use crate::device::Device;
use crate::memory::{DeviceMemory, MemoryAllocateInfo};
use crate::result::Result;

/// Largest framebuffer the VRS image has to cover
pub const MAX_FRAMEBUFFER_SIZE: u32 = 16384;

/// 64 KiB Z-order swizzle used for the VRS depth image
const VRS_SWIZZLE_MODE: u32 = 24;

const NOTIFIER_POLL_INTERVAL: Duration = Duration::from_millis(100);

// =============================================================================
// RATES
// =============================================================================

/// Forced shading rate
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum VrsRate {
    /// One invocation per pixel
    Rate1x1 = 0,
    /// One invocation per 2x1 block
    Rate2x1 = 1,
    /// One invocation per 1x2 block
    Rate1x2 = 2,
    /// One invocation per 2x2 block
    Rate2x2 = 3,
}

impl VrsRate {
    fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Self::Rate2x1,
            2 => Self::Rate1x2,
            3 => Self::Rate2x2,
            _ => Self::Rate1x1,
        }
    }
}

/// Parse a rate string; anything unrecognized is 1x1
pub fn parse_vrs_rates(s: &str) -> VrsRate {
    match s {
        "2x2" => VrsRate::Rate2x2,
        "2x1" => VrsRate::Rate2x1,
        "1x2" => VrsRate::Rate1x2,
        "1x1" => VrsRate::Rate1x1,
        _ => {
            log::warn!("invalid VRS rates specified (valid values are 2x2, 2x1, 1x2 and 1x1)");
            VrsRate::Rate1x1
        }
    }
}

/// Read the rate from the first three bytes of `path`
///
/// The file must hold at least four bytes (the rate and a terminator);
/// shorter or unreadable files give 1x1.
pub fn parse_force_vrs_config_file(path: &Path) -> VrsRate {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(err) => {
            log::warn!("can't open file '{}': {err}", path.display());
            return VrsRate::Rate1x1;
        }
    };

    let mut buf = [0u8; 4];
    if file.read_exact(&mut buf).is_err() {
        return VrsRate::Rate1x1;
    }
    match core::str::from_utf8(&buf[..3]) {
        Ok(s) => parse_vrs_rates(s),
        Err(_) => parse_vrs_rates(""),
    }
}

// =============================================================================
// NOTIFIER
// =============================================================================

/// File state the notifier compares between polls
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct FileStamp {
    modified: Option<SystemTime>,
    len: u64,
}

fn stamp(path: &Path) -> Option<FileStamp> {
    let meta = std::fs::metadata(path).ok()?;
    Some(FileStamp {
        modified: meta.modified().ok(),
        len: meta.len(),
    })
}

/// Last seen state of a watched file; a missing file is a state too
#[derive(Debug)]
struct FileWatch {
    path: PathBuf,
    last: Option<FileStamp>,
}

impl FileWatch {
    fn new(path: PathBuf) -> Self {
        let last = stamp(&path);
        Self { path, last }
    }

    fn changed(&self) -> bool {
        stamp(&self.path) != self.last
    }

    fn rearm(&mut self) {
        self.last = stamp(&self.path);
    }
}

/// Background thread that reloads the config file on change
#[derive(Debug)]
pub(crate) struct VrsNotifier {
    quit: Arc<AtomicBool>,
    reloads: Arc<AtomicU32>,
    thread: Option<JoinHandle<()>>,
}

impl VrsNotifier {
    /// Start watching `path`; `None` when it cannot be watched
    pub(crate) fn start(path: PathBuf, rate: Arc<AtomicU8>) -> Option<Self> {
        let mut watch = FileWatch::new(path);
        if watch.last.is_none() {
            return None;
        }
        let quit = Arc::new(AtomicBool::new(false));
        let reloads = Arc::new(AtomicU32::new(0));
        let thread_quit = Arc::clone(&quit);
        let thread_reloads = Arc::clone(&reloads);

        let thread = std::thread::Builder::new()
            .name("ember-vrs-notifier".into())
            .spawn(move || {
                while !thread_quit.load(Ordering::Acquire) {
                    if watch.changed() {
                        // Editors replace the file through a temporary; let them finish.
                        std::thread::sleep(NOTIFIER_POLL_INTERVAL);
                        let new_rate = parse_force_vrs_config_file(&watch.path);
                        rate.store(new_rate as u8, Ordering::Release);
                        watch.rearm();
                        thread_reloads.fetch_add(1, Ordering::AcqRel);
                        log::info!("Updated the per-vertex VRS rate to '{new_rate:?}'");
                    }
                    std::thread::sleep(NOTIFIER_POLL_INTERVAL);
                }
            })
            .ok()?;

        Some(Self {
            quit,
            reloads,
            thread: Some(thread),
        })
    }

    fn reloads(&self) -> u32 {
        self.reloads.load(Ordering::Acquire)
    }

    /// Stop and join the thread
    pub(crate) fn finish(mut self) {
        self.quit.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::warn!("VRS notifier thread panicked");
            }
        }
    }
}

/// Device-wide forced rate
#[derive(Debug)]
pub(crate) struct ForceVrs {
    rate: Arc<AtomicU8>,
    enabled: bool,
    notifier: Option<VrsNotifier>,
}

impl ForceVrs {
    /// No forced rate
    pub(crate) fn disabled() -> Self {
        Self {
            rate: Arc::new(AtomicU8::new(VrsRate::Rate1x1 as u8)),
            enabled: false,
            notifier: None,
        }
    }

    /// Rate from a config file, followed by a notifier
    pub(crate) fn from_config_file(path: &Path) -> Self {
        let initial = parse_force_vrs_config_file(path);
        let rate = Arc::new(AtomicU8::new(initial as u8));
        let notifier = VrsNotifier::start(path.to_path_buf(), Arc::clone(&rate));
        if notifier.is_none() {
            log::warn!("Failed to initialize the notifier for EMBER_FORCE_VRS_CONFIG_FILE!");
        }
        Self {
            rate,
            enabled: notifier.is_some(),
            notifier,
        }
    }

    /// Fixed rate from a string
    pub(crate) fn from_rates(s: &str) -> Self {
        let rate = parse_vrs_rates(s);
        Self {
            rate: Arc::new(AtomicU8::new(rate as u8)),
            enabled: rate != VrsRate::Rate1x1,
            notifier: None,
        }
    }

    pub(crate) fn enabled(&self) -> bool {
        self.enabled
    }

    pub(crate) fn rate(&self) -> VrsRate {
        VrsRate::from_raw(self.rate.load(Ordering::Acquire))
    }

    pub(crate) fn reloads(&self) -> u32 {
        self.notifier.as_ref().map_or(0, VrsNotifier::reloads)
    }

    pub(crate) fn finish(self) {
        if let Some(notifier) = self.notifier {
            notifier.finish();
        }
    }
}

// =============================================================================
// HTILE STATE
// =============================================================================

/// HTILE bytes for a VRS image: 4 bits of rate per 8x8 tile, rounded up
/// to 32 bits per tile and a whole page
pub fn vrs_htile_size(width: u32, height: u32) -> u64 {
    let tiles = div_round_up(u64::from(width), 8) * div_round_up(u64::from(height), 8);
    align_up(tiles * 4, 4096)
}

/// Depth image, HTILE buffer and its memory
#[derive(Debug)]
pub struct VrsState {
    image: Image,
    buffer: Buffer,
    memory: DeviceMemory,
}

impl VrsState {
    /// The D16 image VRS rates are written through
    pub fn image(&self) -> &Image {
        &self.image
    }

    /// The HTILE buffer
    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }
}

fn vrs_image() -> Image {
    let layout = UnifiedLayout {
        swizzle_mode: VRS_SWIZZLE_MODE,
        epitch: MAX_FRAMEBUFFER_SIZE - 1,
        ..UnifiedLayout::default()
    };
    let mut image = Image::new_2d(
        Format::D16Unorm,
        Extent3d::new_2d(MAX_FRAMEBUFFER_SIZE, MAX_FRAMEBUFFER_SIZE),
        Surface::unified(2, layout),
    );
    image.usage = ImageUsage::DEPTH_STENCIL_ATTACHMENT;
    image.meta.htile_levels = 1;
    image.meta.vrs_htile = true;
    image
}

impl Device {
    /// Create the VRS HTILE state if it does not exist yet
    ///
    /// Safe to call from any thread; only the first successful call
    /// allocates. A failure leaves nothing behind.
    pub fn init_vrs_state(&self) -> Result<()> {
        let mut state = self.vrs_state.lock();
        if state.is_some() {
            return Ok(());
        }

        let image = vrs_image();
        let htile_size = vrs_htile_size(image.extent.width, image.extent.height);

        let buffer_info = BufferCreateInfo::new(htile_size, BufferUsageFlags::STORAGE_BUFFER);
        let mut buffer = self.create_buffer_internal(&buffer_info, true)?;

        let reqs = self.buffer_memory_requirements(buffer.size(), buffer.flags(), buffer.usage());
        let memory = match self.allocate_memory(&MemoryAllocateInfo::new(reqs.size, 0)) {
            Ok(memory) => memory,
            Err(err) => {
                self.destroy_buffer(Some(buffer));
                return Err(err);
            }
        };

        if let Err(err) = self.bind_buffer_memory(&mut [BindBufferMemoryInfo::new(&mut buffer, &memory, 0)]) {
            self.free_memory(Some(memory));
            self.destroy_buffer(Some(buffer));
            return Err(err);
        }

        log::debug!("VRS HTILE state created ({htile_size} bytes)");
        *state = Some(VrsState {
            image,
            buffer,
            memory,
        });
        Ok(())
    }

    /// Depth state for writing forced rates, once [`Device::init_vrs_state`]
    /// has succeeded
    pub fn vrs_surface(&self) -> Option<DepthStencilSurfaceDescriptor> {
        let state = self.vrs_state.lock();
        let state = state.as_ref()?;
        let htile_va = GpuAddr::new(self.buffer_device_address(&state.buffer));
        Some(encode_vrs_surface(&state.image, htile_va))
    }

    /// Rate forced on every draw, `None` when not forcing
    pub fn force_vrs_rate(&self) -> Option<VrsRate> {
        self.force_vrs
            .as_ref()
            .filter(|vrs| vrs.enabled())
            .map(ForceVrs::rate)
    }

    /// How many times the forced-VRS config file has been re-read
    pub fn force_vrs_reload_count(&self) -> u32 {
        self.force_vrs.as_ref().map_or(0, ForceVrs::reloads)
    }

    pub(crate) fn finish_vrs_state(&self) {
        if let Some(state) = self.vrs_state.lock().take() {
            self.free_memory(Some(state.memory));
            self.destroy_buffer(Some(state.buffer));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_rates() {
        assert_eq!(parse_vrs_rates("2x2"), VrsRate::Rate2x2);
        assert_eq!(parse_vrs_rates("2x1"), VrsRate::Rate2x1);
        assert_eq!(parse_vrs_rates("1x2"), VrsRate::Rate1x2);
        assert_eq!(parse_vrs_rates("1x1"), VrsRate::Rate1x1);
        assert_eq!(parse_vrs_rates("4x4"), VrsRate::Rate1x1);
        assert_eq!(parse_vrs_rates(""), VrsRate::Rate1x1);
    }

    #[test]
    fn test_config_file_needs_four_bytes() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"2x1\n").unwrap();
        assert_eq!(parse_force_vrs_config_file(file.path()), VrsRate::Rate2x1);

        let mut short = tempfile::NamedTempFile::new().unwrap();
        short.write_all(b"2x1").unwrap();
        assert_eq!(parse_force_vrs_config_file(short.path()), VrsRate::Rate1x1);

        assert_eq!(
            parse_force_vrs_config_file(Path::new("/nonexistent/ember-vrs")),
            VrsRate::Rate1x1
        );
    }

    #[test]
    fn test_from_rates_enables_only_coarse_rates() {
        assert!(!ForceVrs::from_rates("1x1").enabled());
        assert!(!ForceVrs::from_rates("bogus").enabled());
        let vrs = ForceVrs::from_rates("2x2");
        assert!(vrs.enabled());
        assert_eq!(vrs.rate(), VrsRate::Rate2x2);
    }

    #[test]
    fn test_missing_config_file_disables() {
        let vrs = ForceVrs::from_config_file(Path::new("/nonexistent/ember-vrs"));
        assert!(!vrs.enabled());
        assert_eq!(vrs.rate(), VrsRate::Rate1x1);
        vrs.finish();
    }

    #[test]
    fn test_file_watch_settles_on_deleted_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let mut watch = FileWatch::new(file.path().to_path_buf());
        assert!(watch.last.is_some());
        assert!(!watch.changed());

        file.close().unwrap();
        assert!(watch.changed());
        watch.rearm();
        assert_eq!(watch.last, None);
        assert!(!watch.changed());
    }

    #[test]
    fn test_htile_size() {
        assert_eq!(vrs_htile_size(16384, 16384), 2048 * 2048 * 4);
        assert_eq!(vrs_htile_size(1, 1), 4096);
    }
}
