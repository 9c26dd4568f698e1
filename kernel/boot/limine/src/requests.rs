//! The Limine request block, placed in the `.requests` section.

use muon_limine::{
    BaseRevision, FramebufferRequest, HhdmRequest, KernelAddressRequest, MemMapRequest,
    ModuleRequest, RequestsEndMarker, RequestsStartMarker, RsdpRequest,
};

/// Every request the stub issues, bracketed by the scan markers.
#[repr(C, align(8))]
pub struct LimineRequests {
    _start: RequestsStartMarker,
    /// Protocol revision tag.
    pub base_revision: BaseRevision,
    /// Physical memory map.
    pub memmap: MemMapRequest,
    /// Higher-half direct map offset.
    pub hhdm: HhdmRequest,
    /// Kernel load addresses.
    pub kernel_address: KernelAddressRequest,
    /// ACPI RSDP pointer.
    pub rsdp: RsdpRequest,
    /// Loaded modules (the root USTAR image).
    pub modules: ModuleRequest,
    /// Framebuffers.
    pub framebuffer: FramebufferRequest,
    _end: RequestsEndMarker,
}

impl LimineRequests {
    const fn new() -> Self {
        Self {
            _start: RequestsStartMarker::new(),
            base_revision: BaseRevision::new(),
            memmap: MemMapRequest::new(),
            hhdm: HhdmRequest::new(),
            kernel_address: KernelAddressRequest::new(),
            rsdp: RsdpRequest::new(),
            modules: ModuleRequest::new(),
            framebuffer: FramebufferRequest::new(),
            _end: RequestsEndMarker::new(),
        }
    }
}

/// The request block the bootloader scans for.
#[used]
#[unsafe(link_section = ".requests")]
pub static REQUESTS: LimineRequests = LimineRequests::new();
