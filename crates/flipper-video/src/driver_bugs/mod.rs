//! Known driver defects and the identity rewrites that work around them.
//!
//! Detection is a static table keyed on (api, vendor, driver, version range). The rewrites in
//! [`workarounds`] are pure functions of an identity plus a [`WorkaroundContext`], so they can
//! be exercised with synthetic bug sets and no backend at all.

mod workarounds;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::caps::ApiType;

pub use workarounds::{apply_driver_bugs, apply_uber_driver_bugs, WorkaroundContext};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Vendor {
    Unknown,
    Nvidia,
    Amd,
    Intel,
    Arm,
    Qualcomm,
    ImgTec,
    Apple,
    Mesa,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DriverKind {
    Unknown,
    Proprietary,
    MesaRadv,
    MesaAnv,
    MesaI965,
    MoltenVk,
    Freedreno,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DriverIdentity {
    pub api: ApiType,
    pub vendor: Vendor,
    pub driver: DriverKind,
    /// Vendor version packed as `major << 16 | minor`.
    pub version: u32,
}

impl DriverIdentity {
    pub fn unknown(api: ApiType) -> Self {
        Self {
            api,
            vendor: Vendor::Unknown,
            driver: DriverKind::Unknown,
            version: 0,
        }
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct DriverBugs: u32 {
        /// Dual-source blending produces garbage; only use it when the blend equation needs it.
        const BROKEN_DUAL_SOURCE_BLENDING = 1 << 0;
        /// `discard` combined with early depth writes depth for discarded fragments.
        const BROKEN_DISCARD_WITH_EARLY_Z = 1 << 1;
        /// Compiling on several threads at once crashes or corrupts binaries.
        const BROKEN_MULTITHREADED_SHADER_PRECOMPILATION = 1 << 2;
        /// Hardware logic ops are advertised but do not work.
        const BROKEN_LOGIC_OP = 1 << 3;
    }
}

struct BugEntry {
    api: Option<ApiType>,
    vendor: Vendor,
    driver: Option<DriverKind>,
    /// Half-open `[start, end)` range of affected versions.
    versions: (u32, u32),
    bug: DriverBugs,
}

const ANY_VERSION: (u32, u32) = (0, u32::MAX);

const BUG_TABLE: &[BugEntry] = &[
    BugEntry {
        api: Some(ApiType::OpenGl),
        vendor: Vendor::Intel,
        driver: Some(DriverKind::MesaI965),
        versions: ANY_VERSION,
        bug: DriverBugs::BROKEN_DUAL_SOURCE_BLENDING,
    },
    BugEntry {
        api: None,
        vendor: Vendor::ImgTec,
        driver: None,
        versions: ANY_VERSION,
        bug: DriverBugs::BROKEN_DUAL_SOURCE_BLENDING,
    },
    BugEntry {
        api: Some(ApiType::Vulkan),
        vendor: Vendor::Intel,
        driver: Some(DriverKind::MoltenVk),
        versions: ANY_VERSION,
        bug: DriverBugs::BROKEN_DUAL_SOURCE_BLENDING,
    },
    BugEntry {
        api: None,
        vendor: Vendor::Qualcomm,
        driver: Some(DriverKind::Proprietary),
        versions: ANY_VERSION,
        bug: DriverBugs::BROKEN_DISCARD_WITH_EARLY_Z,
    },
    BugEntry {
        api: Some(ApiType::Metal),
        vendor: Vendor::Nvidia,
        driver: None,
        versions: ANY_VERSION,
        bug: DriverBugs::BROKEN_DISCARD_WITH_EARLY_Z,
    },
    BugEntry {
        api: Some(ApiType::OpenGl),
        vendor: Vendor::Arm,
        driver: None,
        versions: ANY_VERSION,
        bug: DriverBugs::BROKEN_MULTITHREADED_SHADER_PRECOMPILATION,
    },
    BugEntry {
        api: Some(ApiType::D3D),
        vendor: Vendor::Amd,
        driver: Some(DriverKind::Proprietary),
        versions: (0, 22 << 16),
        bug: DriverBugs::BROKEN_LOGIC_OP,
    },
];

impl DriverBugs {
    pub fn detect(identity: &DriverIdentity) -> Self {
        BUG_TABLE
            .iter()
            .filter(|entry| entry.api.map_or(true, |api| api == identity.api))
            .filter(|entry| entry.vendor == identity.vendor)
            .filter(|entry| entry.driver.map_or(true, |driver| driver == identity.driver))
            .filter(|entry| (entry.versions.0..entry.versions.1).contains(&identity.version))
            .fold(Self::empty(), |bugs, entry| bugs | entry.bug)
    }
}
