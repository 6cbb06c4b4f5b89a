//! Virtual interrupt state
//!
//! One `Virq` per interrupt line a guest can see. Private lines (SGI/PPI,
//! IDs 0-31) exist once per vCPU; shared lines (SPI, 32 and up) once per VM.

use crate::arch::aarch64::defs::IRQ_DEFAULT_PRIORITY;
use crate::arch::traits::PhysicalGic;

/// GICv3 interrupt life cycle
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VirqState {
    Inactive,
    Pending,
    Active,
    PendingActive,
}

impl VirqState {
    pub fn set_pending(self) -> Self {
        match self {
            VirqState::Inactive | VirqState::Pending => VirqState::Pending,
            VirqState::Active | VirqState::PendingActive => VirqState::PendingActive,
        }
    }

    pub fn clear_pending(self) -> Self {
        match self {
            VirqState::Inactive | VirqState::Pending => VirqState::Inactive,
            VirqState::Active | VirqState::PendingActive => VirqState::Active,
        }
    }

    pub fn set_active(self) -> Self {
        match self {
            VirqState::Inactive | VirqState::Active => VirqState::Active,
            VirqState::Pending | VirqState::PendingActive => VirqState::PendingActive,
        }
    }

    pub fn clear_active(self) -> Self {
        match self {
            VirqState::Inactive | VirqState::Active => VirqState::Inactive,
            VirqState::Pending | VirqState::PendingActive => VirqState::Pending,
        }
    }

    /// The vCPU read IAR: the pending assertion becomes active.
    pub fn acknowledge(self) -> Self {
        match self {
            VirqState::Pending => VirqState::Active,
            other => other,
        }
    }

    /// The vCPU wrote EOIR.
    pub fn end_of_interrupt(self) -> Self {
        self.clear_active()
    }

    pub fn is_pending(self) -> bool {
        matches!(self, VirqState::Pending | VirqState::PendingActive)
    }

    pub fn is_active(self) -> bool {
        matches!(self, VirqState::Active | VirqState::PendingActive)
    }

    /// ICH_LR<n>_EL2.State encoding
    pub fn lr_bits(self) -> u64 {
        match self {
            VirqState::Inactive => 0b00,
            VirqState::Pending => 0b01,
            VirqState::Active => 0b10,
            VirqState::PendingActive => 0b11,
        }
    }

    pub fn from_lr_bits(bits: u64) -> Self {
        match bits & 0b11 {
            0b01 => VirqState::Pending,
            0b10 => VirqState::Active,
            0b11 => VirqState::PendingActive,
            _ => VirqState::Inactive,
        }
    }
}

/// Edge or level sensitivity (one ICFGR field)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TriggerMode {
    Level,
    Edge,
}

impl TriggerMode {
    pub fn from_icfgr(field: u8) -> Self {
        if field & 0b10 != 0 {
            TriggerMode::Edge
        } else {
            TriggerMode::Level
        }
    }

    pub fn icfgr(self) -> u8 {
        match self {
            TriggerMode::Level => 0b00,
            TriggerMode::Edge => 0b10,
        }
    }
}

/// One register-level change to a single virq
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VirqUpdate {
    Enable,
    Disable,
    SetPending,
    ClearPending,
    SetActive,
    ClearActive,
    Group(bool),
    Priority(u8),
    Config(TriggerMode),
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Virq {
    pub id: u16,
    /// Physical INTID when hardware-backed
    pub pintid: Option<u16>,
    /// Delivery vCPU: the owner for private lines, the IROUTER target for SPIs
    pub vcpu: usize,
    pub state: VirqState,
    pub priority: u8,
    pub trigger: TriggerMode,
    pub enabled: bool,
    pub group1: bool,
    /// Resident in a list register of `vcpu`
    pub in_lr: bool,
    pub lr: Option<u8>,
    /// vCPU whose candidate list holds this virq
    pub queued_on: Option<usize>,
}

impl Virq {
    pub const fn new(id: u16, vcpu: usize) -> Self {
        Self {
            id,
            pintid: None,
            vcpu,
            state: VirqState::Inactive,
            priority: IRQ_DEFAULT_PRIORITY,
            // SGIs are edge-triggered and cannot be reconfigured.
            trigger: if id < 16 { TriggerMode::Edge } else { TriggerMode::Level },
            enabled: false,
            group1: true,
            in_lr: false,
            lr: None,
            queued_on: None,
        }
    }

    pub fn is_hw(&self) -> bool {
        self.pintid.is_some()
    }

    /// Can be presented to the guest right now
    pub fn deliverable(&self) -> bool {
        self.enabled && (self.state.is_pending() || self.state.is_active())
    }

    /// Change software state, then mirror the change to the physical GIC if
    /// a hardware line backs this virq.
    pub fn apply<G: PhysicalGic + ?Sized>(&mut self, update: VirqUpdate, gic: &mut G) {
        match update {
            VirqUpdate::Enable => self.enabled = true,
            VirqUpdate::Disable => self.enabled = false,
            VirqUpdate::SetPending => self.state = self.state.set_pending(),
            VirqUpdate::ClearPending => self.state = self.state.clear_pending(),
            VirqUpdate::SetActive => self.state = self.state.set_active(),
            VirqUpdate::ClearActive => self.state = self.state.clear_active(),
            VirqUpdate::Group(g1) => self.group1 = g1,
            VirqUpdate::Priority(p) => self.priority = p,
            VirqUpdate::Config(mode) => {
                if self.id >= 16 {
                    self.trigger = mode;
                }
            }
        }

        let Some(pintid) = self.pintid else {
            return;
        };
        let pintid = pintid as u32;
        match update {
            VirqUpdate::Enable => gic.unmask(pintid),
            VirqUpdate::Disable => gic.mask(pintid),
            VirqUpdate::SetPending => gic.set_pending(pintid),
            VirqUpdate::ClearPending => gic.clear_pending(pintid),
            VirqUpdate::Priority(p) => gic.set_priority(pintid, p),
            VirqUpdate::Config(mode) => gic.set_config(pintid, mode.icfgr()),
            // Active state of a hardware line is owned by the LR HW bit.
            VirqUpdate::SetActive | VirqUpdate::ClearActive | VirqUpdate::Group(_) => {}
        }
    }
}
