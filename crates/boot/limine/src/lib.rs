//! Bindings for the subset of the Limine boot protocol muon consumes.
//!
//! The protocol is request/response: the kernel places `#[used]` request
//! statics in the `.requests` linker section, the bootloader scans for their
//! IDs and fills in the response pointers before jumping to the entry point.
//!
//! Only the requests the muon boot stub actually issues are modeled: base
//! revision, memory map, HHDM, kernel address, RSDP, modules and
//! framebuffer.

#![no_std]

pub mod memmap;

use core::cell::UnsafeCell;

pub use memmap::{MemMapEntry, MemMapEntryType};

/// Builds the 4-part Limine request ID from the two request-specific words.
macro_rules! limine_id {
    ($part3:expr, $part4:expr) => {
        [
            0xc7b1_dd30_df4c_8b88u64,
            0x0a82_e883_a194_f07bu64,
            $part3,
            $part4,
        ]
    };
}

/// Common header of every request: ID words plus the response slot the
/// bootloader fills in.
#[repr(C)]
struct RequestHeader<T> {
    id: [u64; 4],
    revision: u64,
    response: UnsafeCell<*mut T>,
}

// SAFETY: The response pointer is written exactly once by the bootloader
// before the kernel runs; afterwards it is read-only.
unsafe impl<T> Sync for RequestHeader<T> {}

impl<T> RequestHeader<T> {
    const fn new(id: [u64; 4]) -> Self {
        Self {
            id,
            revision: 0,
            response: UnsafeCell::new(core::ptr::null_mut()),
        }
    }

    /// Reads the response pointer published by the bootloader.
    fn response(&self) -> Option<&'static T> {
        // SAFETY: The bootloader writes a valid pointer (or leaves null)
        // before control transfers; it is never written again.
        let ptr = unsafe { core::ptr::read_volatile(self.response.get()) };
        if ptr.is_null() {
            None
        } else {
            // SAFETY: Non-null responses point at bootloader-owned memory
            // that stays mapped for the kernel's lifetime.
            Some(unsafe { &*ptr })
        }
    }
}

/// Marker placed ahead of the request block to speed up the bootloader's
/// scan. Paired with [`RequestsEndMarker`].
#[repr(C, align(8))]
pub struct RequestsStartMarker([u64; 4]);

impl RequestsStartMarker {
    /// Creates the marker.
    pub const fn new() -> Self {
        Self([
            0xf6b8_f4b3_9de7_d1ae,
            0xfab9_1a69_40fc_b9cf,
            0x785c_6ed0_15d3_e316,
            0x181e_920a_7852_b9d9,
        ])
    }
}

impl Default for RequestsStartMarker {
    fn default() -> Self {
        Self::new()
    }
}

/// Marker terminating the request block.
#[repr(C, align(8))]
pub struct RequestsEndMarker([u64; 2]);

impl RequestsEndMarker {
    /// Creates the marker.
    pub const fn new() -> Self {
        Self([0xadc0_e053_1bb1_0d03, 0x9572_709f_3176_4c62])
    }
}

impl Default for RequestsEndMarker {
    fn default() -> Self {
        Self::new()
    }
}

/// Base-revision tag: declares which protocol revision the kernel speaks.
///
/// The bootloader zeroes the last word if the revision is supported.
#[repr(C)]
pub struct BaseRevision(UnsafeCell<[u64; 3]>);

// SAFETY: Written once by the bootloader pre-entry, then read-only.
unsafe impl Sync for BaseRevision {}

impl BaseRevision {
    /// Creates a revision-2 tag.
    pub const fn new() -> Self {
        Self(UnsafeCell::new([
            0xf9562b2d5c95a6c8,
            0x6a7b384944536bdc,
            2,
        ]))
    }

    /// Whether the loaded bootloader supports the requested revision.
    pub fn is_supported(&self) -> bool {
        // SAFETY: See the Sync rationale above.
        unsafe { core::ptr::read_volatile(self.0.get())[2] == 0 }
    }
}

impl Default for BaseRevision {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Memory map
// ---------------------------------------------------------------------------

/// Memory map response: an array of entry pointers.
#[repr(C)]
pub struct MemMapResponse {
    revision: u64,
    entry_count: u64,
    entries: *const *const MemMapEntry,
}

impl MemMapResponse {
    /// Iterates the memory map entries in bootloader order.
    pub fn entries(&self) -> impl Iterator<Item = &'static MemMapEntry> + '_ {
        // SAFETY: The bootloader provides entry_count valid entry pointers.
        (0..self.entry_count as usize)
            .map(move |i| unsafe { &**self.entries.add(i) })
    }
}

/// Memory map request.
#[repr(C)]
pub struct MemMapRequest(RequestHeader<MemMapResponse>);

impl MemMapRequest {
    /// Creates the request.
    pub const fn new() -> Self {
        Self(RequestHeader::new(limine_id!(
            0x67cf_3d9d_378a_806f,
            0xe304_acdf_c50c_3c62
        )))
    }

    /// The bootloader's response, if provided.
    pub fn response(&self) -> Option<&'static MemMapResponse> {
        self.0.response()
    }
}

impl Default for MemMapRequest {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// HHDM
// ---------------------------------------------------------------------------

/// Higher-half direct map response.
#[repr(C)]
pub struct HhdmResponse {
    revision: u64,
    /// Virtual base of the physical mirror.
    pub offset: u64,
}

/// HHDM request.
#[repr(C)]
pub struct HhdmRequest(RequestHeader<HhdmResponse>);

impl HhdmRequest {
    /// Creates the request.
    pub const fn new() -> Self {
        Self(RequestHeader::new(limine_id!(
            0x48dc_f1cb_8ad2_b852,
            0x6398_4e95_9a98_244b
        )))
    }

    /// The bootloader's response, if provided.
    pub fn response(&self) -> Option<&'static HhdmResponse> {
        self.0.response()
    }
}

impl Default for HhdmRequest {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Kernel address
// ---------------------------------------------------------------------------

/// Kernel load-address response.
#[repr(C)]
pub struct KernelAddressResponse {
    revision: u64,
    /// Physical base the kernel was loaded at.
    pub physical_base: u64,
    /// Virtual base the kernel runs at.
    pub virtual_base: u64,
}

/// Kernel address request.
#[repr(C)]
pub struct KernelAddressRequest(RequestHeader<KernelAddressResponse>);

impl KernelAddressRequest {
    /// Creates the request.
    pub const fn new() -> Self {
        Self(RequestHeader::new(limine_id!(
            0x71ba_76863cc5_5f63,
            0xb2644a48c516a487
        )))
    }

    /// The bootloader's response, if provided.
    pub fn response(&self) -> Option<&'static KernelAddressResponse> {
        self.0.response()
    }
}

impl Default for KernelAddressRequest {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// RSDP
// ---------------------------------------------------------------------------

/// RSDP response.
#[repr(C)]
pub struct RsdpResponse {
    revision: u64,
    /// Address of the RSDP structure (physical on revision >= 3 loaders).
    pub address: u64,
}

/// RSDP request.
#[repr(C)]
pub struct RsdpRequest(RequestHeader<RsdpResponse>);

impl RsdpRequest {
    /// Creates the request.
    pub const fn new() -> Self {
        Self(RequestHeader::new(limine_id!(
            0xc5e7_7b6b_397e_7b43,
            0x2763_7845_accd_cf3c
        )))
    }

    /// The bootloader's response, if provided.
    pub fn response(&self) -> Option<&'static RsdpResponse> {
        self.0.response()
    }
}

impl Default for RsdpRequest {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Modules
// ---------------------------------------------------------------------------

/// A file loaded by the bootloader alongside the kernel.
#[repr(C)]
pub struct File {
    revision: u64,
    /// Virtual (HHDM) address of the file contents.
    pub address: u64,
    /// File size in bytes.
    pub size: u64,
    /// NUL-terminated path string.
    pub path: *const u8,
    cmdline: *const u8,
    media_type: u64,
    unused: u32,
    tftp_ip: u32,
    tftp_port: u32,
    partition_index: u32,
    mbr_disk_id: u32,
    gpt_disk_uuid: [u8; 16],
    gpt_part_uuid: [u8; 16],
    part_uuid: [u8; 16],
}

impl File {
    /// The module path as a str, if valid UTF-8.
    pub fn path_str(&self) -> Option<&'static str> {
        if self.path.is_null() {
            return None;
        }
        // SAFETY: The bootloader provides a NUL-terminated string that
        // stays mapped.
        unsafe {
            let mut len = 0;
            while *self.path.add(len) != 0 {
                len += 1;
            }
            core::str::from_utf8(core::slice::from_raw_parts(self.path, len)).ok()
        }
    }
}

/// Module response: the loaded files.
#[repr(C)]
pub struct ModuleResponse {
    revision: u64,
    module_count: u64,
    modules: *const *const File,
}

impl ModuleResponse {
    /// Iterates the loaded modules.
    pub fn modules(&self) -> impl Iterator<Item = &'static File> + '_ {
        // SAFETY: The bootloader provides module_count valid file pointers.
        (0..self.module_count as usize)
            .map(move |i| unsafe { &**self.modules.add(i) })
    }
}

/// Module request.
#[repr(C)]
pub struct ModuleRequest(RequestHeader<ModuleResponse>);

impl ModuleRequest {
    /// Creates the request.
    pub const fn new() -> Self {
        Self(RequestHeader::new(limine_id!(
            0x3e7e_279702be32af,
            0xca1c_4f3bd1280cee
        )))
    }

    /// The bootloader's response, if provided.
    pub fn response(&self) -> Option<&'static ModuleResponse> {
        self.0.response()
    }
}

impl Default for ModuleRequest {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Framebuffer
// ---------------------------------------------------------------------------

/// One linear framebuffer.
#[repr(C)]
pub struct Framebuffer {
    /// Virtual (HHDM) address of the pixel memory.
    pub address: u64,
    /// Width in pixels.
    pub width: u64,
    /// Height in pixels.
    pub height: u64,
    /// Bytes per scanline.
    pub pitch: u64,
    /// Bits per pixel.
    pub bpp: u16,
    /// Memory model (1 = RGB).
    pub memory_model: u8,
    /// Red channel mask size.
    pub red_mask_size: u8,
    /// Red channel shift.
    pub red_mask_shift: u8,
    /// Green channel mask size.
    pub green_mask_size: u8,
    /// Green channel shift.
    pub green_mask_shift: u8,
    /// Blue channel mask size.
    pub blue_mask_size: u8,
    /// Blue channel shift.
    pub blue_mask_shift: u8,
    unused: [u8; 7],
    edid_size: u64,
    edid: u64,
}

/// Framebuffer response.
#[repr(C)]
pub struct FramebufferResponse {
    revision: u64,
    framebuffer_count: u64,
    framebuffers: *const *const Framebuffer,
}

impl FramebufferResponse {
    /// Iterates the available framebuffers.
    pub fn framebuffers(&self) -> impl Iterator<Item = &'static Framebuffer> + '_ {
        // SAFETY: The bootloader provides framebuffer_count valid pointers.
        (0..self.framebuffer_count as usize)
            .map(move |i| unsafe { &**self.framebuffers.add(i) })
    }
}

/// Framebuffer request.
#[repr(C)]
pub struct FramebufferRequest(RequestHeader<FramebufferResponse>);

impl FramebufferRequest {
    /// Creates the request.
    pub const fn new() -> Self {
        Self(RequestHeader::new(limine_id!(
            0x9d58_93a3_6c9e_b5d7,
            0xa0db_15ab_4b2e_f37a
        )))
    }

    /// The bootloader's response, if provided.
    pub fn response(&self) -> Option<&'static FramebufferResponse> {
        self.0.response()
    }
}

impl Default for FramebufferRequest {
    fn default() -> Self {
        Self::new()
    }
}
