//! Device capability queries that gate code generation.
//!
//! [`DeviceCapabilities`] is captured once when a device is bound. Every
//! field, including the extension set, is read-only afterwards, so
//! concurrent queries from different configure calls need no locking.
//!
//! Architecture detection works from the device name. Names that are not
//! recognised map to [`GpuTarget::Unknown`], which selects the generic code
//! path instead of failing.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::driver::{DeviceId, DeviceInfo, Driver};
use crate::error::Result;

pub const EXT_FP16: &str = "cl_khr_fp16";
pub const EXT_DOT8: &str = "cl_arm_integer_dot_product_int8";
pub const EXT_DOT8_KHR: &str = "cl_khr_integer_dot_product";
pub const EXT_DOT8_ACC: &str = "cl_arm_integer_dot_product_accumulate_int8";
pub const EXT_INT64_BASE_ATOMICS: &str = "cl_khr_int64_base_atomics";
pub const EXT_ARM_NON_UNIFORM_WORK_GROUP: &str = "cl_arm_non_uniform_work_group_size";

// ── Architecture ─────────────────────────────────────────────────────────────

/// GPU architecture family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuArch {
    Unknown,
    Midgard,
    Bifrost,
    Valhall,
    FifthGen,
}

impl GpuArch {
    /// Value of the `GPU_ARCH` macro passed to kernels.
    pub const fn code(self) -> u32 {
        match self {
            Self::Unknown => 0x000,
            Self::Midgard => 0x100,
            Self::Bifrost => 0x200,
            Self::Valhall => 0x300,
            Self::FifthGen => 0x400,
        }
    }
}

/// Concrete GPU model.
///
/// The bare family variants (`Midgard`, `Valhall`, ...) stand for models of
/// that family without a dedicated entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuTarget {
    Unknown,
    Midgard,
    T600,
    T700,
    T800,
    Bifrost,
    G71,
    G72,
    G51,
    G51Big,
    G51Lit,
    G31,
    G76,
    G52,
    G52Lit,
    Valhall,
    G77,
    G57,
    G78,
    G68,
    G78Ae,
    G710,
    G610,
    G510,
    G310,
    FifthGen,
    G715,
    G615,
    G720,
    G620,
}

impl GpuTarget {
    pub const fn arch(self) -> GpuArch {
        match self {
            Self::Unknown => GpuArch::Unknown,
            Self::Midgard | Self::T600 | Self::T700 | Self::T800 => GpuArch::Midgard,
            Self::Bifrost
            | Self::G71
            | Self::G72
            | Self::G51
            | Self::G51Big
            | Self::G51Lit
            | Self::G31
            | Self::G76
            | Self::G52
            | Self::G52Lit => GpuArch::Bifrost,
            Self::Valhall
            | Self::G77
            | Self::G57
            | Self::G78
            | Self::G68
            | Self::G78Ae
            | Self::G710
            | Self::G610
            | Self::G510
            | Self::G310 => GpuArch::Valhall,
            Self::FifthGen | Self::G715 | Self::G615 | Self::G720 | Self::G620 => GpuArch::FifthGen,
        }
    }

    /// Parse a target from a device name such as `"Mali-G77 MC9"`.
    pub fn from_device_name(name: &str) -> Self {
        static RE: OnceLock<Regex> = OnceLock::new();
        let re = RE.get_or_init(|| Regex::new(r"Mali-([TG])(\d+)([A-Z]*)").expect("valid regex"));

        let Some(caps) = re.captures(name) else {
            return Self::Unknown;
        };
        let (series, number, suffix) = (&caps[1], &caps[2], &caps[3]);
        if series == "T" {
            return match number.as_bytes().first() {
                Some(b'6') => Self::T600,
                Some(b'7') => Self::T700,
                Some(b'8') => Self::T800,
                _ => Self::Midgard,
            };
        }
        match (number, suffix) {
            ("71", _) => Self::G71,
            ("72", _) => Self::G72,
            ("51", "BIG") => Self::G51Big,
            ("51", "LIT") => Self::G51Lit,
            ("51", _) => Self::G51,
            ("31", _) => Self::G31,
            ("76", _) => Self::G76,
            ("52", "LIT") => Self::G52Lit,
            ("52", _) => Self::G52,
            ("77", _) => Self::G77,
            ("57", _) => Self::G57,
            ("78", "AE") => Self::G78Ae,
            ("78", _) => Self::G78,
            ("68", _) => Self::G68,
            ("710", _) => Self::G710,
            ("610", _) => Self::G610,
            ("510", _) => Self::G510,
            ("310", _) => Self::G310,
            ("715", _) => Self::G715,
            ("615", _) => Self::G615,
            ("720", _) => Self::G720,
            ("620", _) => Self::G620,
            _ => Self::Valhall,
        }
    }
}

// ── OpenCL version ───────────────────────────────────────────────────────────

/// OpenCL version reported by `CL_DEVICE_VERSION`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ClVersion {
    Unknown,
    Cl10,
    Cl11,
    Cl12,
    Cl20,
    Cl30,
}

impl ClVersion {
    pub fn parse(device_version: &str) -> Self {
        static RE: OnceLock<Regex> = OnceLock::new();
        let re = RE.get_or_init(|| Regex::new(r"OpenCL (\d+)\.(\d+)").expect("valid regex"));
        let Some(caps) = re.captures(device_version) else {
            return Self::Unknown;
        };
        match (&caps[1], &caps[2]) {
            ("1", "0") => Self::Cl10,
            ("1", "1") => Self::Cl11,
            ("1", "2") => Self::Cl12,
            ("2", _) => Self::Cl20,
            ("3", _) => Self::Cl30,
            _ => Self::Unknown,
        }
    }
}

/// DDK major version from a string like `"v1.r38p1-01eac0"`, or `-1`.
pub fn parse_driver_version(version: &str) -> i32 {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"r(\d+)p\d").expect("valid regex"));
    re.captures(version).and_then(|caps| caps[1].parse().ok()).unwrap_or(-1)
}

// ── DeviceCapabilities ───────────────────────────────────────────────────────

/// Hardware profile of the bound device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCapabilities {
    device: DeviceId,
    name: String,
    vendor: String,
    device_version: String,
    driver_version_string: String,
    extensions: BTreeSet<String>,
    compute_units: u32,
    max_work_group_size: usize,
    non_uniform_work_group: bool,
    target: GpuTarget,
    cl_version: ClVersion,
    driver_version: i32,
}

impl DeviceCapabilities {
    /// Profile assembled from already-known properties.
    pub fn new(device: DeviceId, name: impl Into<String>, device_version: impl Into<String>) -> Self {
        let name = name.into();
        let device_version = device_version.into();
        Self {
            device,
            target: GpuTarget::from_device_name(&name),
            cl_version: ClVersion::parse(&device_version),
            driver_version: parse_driver_version(&device_version),
            name,
            vendor: String::new(),
            device_version,
            driver_version_string: String::new(),
            extensions: BTreeSet::new(),
            compute_units: 1,
            max_work_group_size: 1,
            non_uniform_work_group: false,
        }
    }

    #[must_use]
    pub fn with_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extensions.extend(extensions.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn with_compute_units(mut self, compute_units: u32) -> Self {
        self.compute_units = compute_units;
        self
    }

    #[must_use]
    pub fn with_max_work_group_size(mut self, size: usize) -> Self {
        self.max_work_group_size = size;
        self
    }

    /// Device-level `CL_DEVICE_NON_UNIFORM_WORK_GROUP_SUPPORT`.
    #[must_use]
    pub fn with_non_uniform_work_group(mut self, supported: bool) -> Self {
        self.non_uniform_work_group = supported;
        self
    }

    /// Query every capability of `device` through `driver`.
    pub fn query(driver: &Driver, device: DeviceId) -> Result<Self> {
        let name = driver.device_info_string(device, DeviceInfo::Name)?;
        let version = driver.device_info_string(device, DeviceInfo::Version)?;
        let mut caps = Self::new(device, name, version);

        caps.vendor = driver.device_info_string(device, DeviceInfo::Vendor)?;
        caps.driver_version_string = driver.device_info_string(device, DeviceInfo::DriverVersion)?;
        caps.extensions = driver
            .device_info_string(device, DeviceInfo::Extensions)?
            .split_whitespace()
            .map(String::from)
            .collect();
        caps.compute_units =
            u32::try_from(driver.device_info_uint(device, DeviceInfo::MaxComputeUnits)?).unwrap_or(u32::MAX);
        caps.max_work_group_size =
            usize::try_from(driver.device_info_uint(device, DeviceInfo::MaxWorkGroupSize)?).unwrap_or(usize::MAX);
        // Only OpenCL 3.0 devices answer this query.
        caps.non_uniform_work_group = caps.cl_version >= ClVersion::Cl30
            && driver
                .device_info_uint(device, DeviceInfo::NonUniformWorkGroupSupport)
                .is_ok_and(|v| v != 0);

        debug!(device = %caps, "queried device capabilities");
        Ok(caps)
    }

    pub const fn device(&self) -> DeviceId {
        self.device
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn vendor(&self) -> &str {
        &self.vendor
    }

    pub fn device_version(&self) -> &str {
        &self.device_version
    }

    pub fn driver_version_string(&self) -> &str {
        &self.driver_version_string
    }

    pub fn extensions(&self) -> impl Iterator<Item = &str> {
        self.extensions.iter().map(String::as_str)
    }

    pub fn supports_extension(&self, name: &str) -> bool {
        self.extensions.contains(name)
    }

    pub const fn target(&self) -> GpuTarget {
        self.target
    }

    pub const fn target_architecture(&self) -> GpuArch {
        self.target.arch()
    }

    pub const fn cl_version(&self) -> ClVersion {
        self.cl_version
    }

    /// DDK major version, or `-1` when the version string has no `rNpM` tag.
    pub const fn driver_version(&self) -> i32 {
        self.driver_version
    }

    pub const fn compute_unit_count(&self) -> u32 {
        self.compute_units
    }

    pub const fn max_work_group_size(&self) -> usize {
        self.max_work_group_size
    }

    pub fn fp16_supported(&self) -> bool {
        self.supports_extension(EXT_FP16)
    }

    pub fn dot8_supported(&self) -> bool {
        self.supports_extension(EXT_DOT8) || self.supports_extension(EXT_DOT8_KHR)
    }

    pub fn dot8_acc_supported(&self) -> bool {
        self.supports_extension(EXT_DOT8_ACC)
    }

    pub fn int64_base_atomics_supported(&self) -> bool {
        self.supports_extension(EXT_INT64_BASE_ATOMICS)
    }

    /// Compiler flag enabling non-uniform work-groups, if the device has one.
    ///
    /// On OpenCL 3.0 the feature is optional and only the device query counts.
    pub fn non_uniform_work_group_option(&self) -> Option<&'static str> {
        match self.cl_version {
            ClVersion::Cl30 => self.non_uniform_work_group.then_some("-cl-std=CL3.0"),
            ClVersion::Cl20 => Some("-cl-std=CL2.0"),
            _ if self.supports_extension(EXT_ARM_NON_UNIFORM_WORK_GROUP) => {
                Some("-cl-arm-non-uniform-work-group-size")
            }
            _ => None,
        }
    }

    /// Whether kernels may use `#pragma unroll`.
    ///
    /// Never true when the driver version is unknown.
    pub fn unroll_with_pragma(&self) -> bool {
        !matches!(self.target_architecture(), GpuArch::Unknown | GpuArch::Midgard) && self.driver_version >= 11
    }

    /// SHA-256 over name, device version and driver version, as hex.
    ///
    /// Compiled binaries are only valid for a device with the same
    /// fingerprint.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for part in [&self.name, &self.device_version, &self.driver_version_string] {
            hasher.update(part.as_bytes());
            hasher.update([0]);
        }
        hasher.finalize().iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl fmt::Display for DeviceCapabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({:?}/{:?}, {:?}, ddk {}, {} CUs, max wg {})",
            self.name,
            self.target,
            self.target_architecture(),
            self.cl_version,
            self.driver_version,
            self.compute_units,
            self.max_work_group_size
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(name: &str, version: &str) -> DeviceCapabilities {
        DeviceCapabilities::new(DeviceId::from_raw(1), name, version)
    }

    #[test]
    fn targets_from_names() {
        assert_eq!(GpuTarget::from_device_name("Mali-G77 MC9"), GpuTarget::G77);
        assert_eq!(GpuTarget::from_device_name("Mali-G51BIG"), GpuTarget::G51Big);
        assert_eq!(GpuTarget::from_device_name("Mali-G78AE"), GpuTarget::G78Ae);
        assert_eq!(GpuTarget::from_device_name("Mali-T760"), GpuTarget::T700);
        assert_eq!(GpuTarget::from_device_name("Mali-G999"), GpuTarget::Valhall);
        assert_eq!(GpuTarget::from_device_name("GeForce RTX 4090"), GpuTarget::Unknown);
        assert_eq!(GpuTarget::from_device_name("Mali-G720").arch(), GpuArch::FifthGen);
    }

    #[test]
    fn driver_version_sentinel() {
        assert_eq!(parse_driver_version("OpenCL 3.0 v1.r38p1-01eac0"), 38);
        assert_eq!(parse_driver_version("OpenCL 3.0"), -1);
        assert_eq!(parse_driver_version("r12"), -1);
    }

    #[test]
    fn cl_versions() {
        assert_eq!(ClVersion::parse("OpenCL 1.2 v1.r20p0"), ClVersion::Cl12);
        assert_eq!(ClVersion::parse("OpenCL 3.0"), ClVersion::Cl30);
        assert_eq!(ClVersion::parse("garbage"), ClVersion::Unknown);
    }

    #[test]
    fn non_uniform_option_precedence() {
        let cl3 = caps("Mali-G77", "OpenCL 3.0 v1.r38p1").with_non_uniform_work_group(true);
        assert_eq!(cl3.non_uniform_work_group_option(), Some("-cl-std=CL3.0"));

        let cl3_without = caps("Mali-G77", "OpenCL 3.0 v1.r38p1");
        assert_eq!(cl3_without.non_uniform_work_group_option(), None);

        let cl3_with_ext = caps("Mali-G77", "OpenCL 3.0 v1.r38p1").with_extensions([EXT_ARM_NON_UNIFORM_WORK_GROUP]);
        assert_eq!(cl3_with_ext.non_uniform_work_group_option(), None);

        let cl2 = caps("Mali-G71", "OpenCL 2.0 v1.r20p0");
        assert_eq!(cl2.non_uniform_work_group_option(), Some("-cl-std=CL2.0"));

        let cl12 = caps("Mali-T760", "OpenCL 1.2 v1.r20p0").with_extensions([EXT_ARM_NON_UNIFORM_WORK_GROUP]);
        assert_eq!(cl12.non_uniform_work_group_option(), Some("-cl-arm-non-uniform-work-group-size"));

        assert_eq!(caps("Mali-T760", "OpenCL 1.2").non_uniform_work_group_option(), None);
    }

    #[test]
    fn unroll_requires_known_driver() {
        assert!(caps("Mali-G77", "OpenCL 3.0 v1.r38p1").unroll_with_pragma());
        assert!(!caps("Mali-G77", "OpenCL 3.0").unroll_with_pragma());
        assert!(!caps("Mali-G77", "OpenCL 3.0 v1.r10p0").unroll_with_pragma());
        assert!(!caps("Mali-T860", "OpenCL 1.2 v1.r20p0").unroll_with_pragma());
    }

    #[test]
    fn fingerprint_tracks_driver() {
        let a = caps("Mali-G77", "OpenCL 3.0 v1.r38p1");
        let b = caps("Mali-G77", "OpenCL 3.0 v1.r40p0");
        assert_eq!(a.fingerprint(), a.clone().fingerprint());
        assert_ne!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint().len(), 64);
    }
}
