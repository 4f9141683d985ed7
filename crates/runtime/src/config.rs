//! Device configuration
//!
//! Defaults describe a mid-sized integrated part. Every value can be
//! overridden through a `with_*` builder method or, for quick experiments,
//! through `ANVIL_*` environment variables read by [`DeviceConfig::from_env`].

use std::time::Duration;

use anvil_packets::HardwareFamily;

use crate::error::ConfigError;

/// Static description of the device a runtime drives
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    pub family: HardwareFamily,
    /// Largest work-group (in work-items) a dispatch may use
    pub max_work_group_size: u32,
    /// Per-dimension local size limits
    pub max_work_item_sizes: [u32; 3],
    /// Hardware threads available to the front end
    pub hw_threads: u32,
    /// How long blocking calls poll before giving up
    pub wait_timeout: Duration,
    /// Size of each surface-state, indirect-object and dynamic-state heap
    pub heap_size: u64,
    /// Base and size of the device virtual address range
    pub address_space_base: u64,
    pub address_space_size: u64,
    pub printf_buffer_size: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            family: HardwareFamily::default(),
            max_work_group_size: 1024,
            max_work_item_sizes: [1024, 1024, 1024],
            hw_threads: 448,
            wait_timeout: Duration::from_secs(5),
            heap_size: 256 * 1024,
            address_space_base: 0x1_0000_0000,
            address_space_size: 4 << 30,
            printf_buffer_size: 64 * 1024,
        }
    }
}

impl DeviceConfig {
    pub fn new(family: HardwareFamily) -> Self {
        Self {
            family,
            ..Self::default()
        }
    }

    /// Defaults overridden by `ANVIL_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each `ANVIL_*` name
    ///
    /// A value that does not parse, or a configuration that fails
    /// [`validate`](Self::validate), is an error.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(family) = parse_value::<HardwareFamily>(&lookup, "ANVIL_HW_FAMILY")? {
            config.family = family;
        }
        if let Some(size) = parse_value::<u32>(&lookup, "ANVIL_MAX_WORK_GROUP_SIZE")? {
            config.max_work_group_size = size;
        }
        if let Some(threads) = parse_value::<u32>(&lookup, "ANVIL_HW_THREADS")? {
            config.hw_threads = threads;
        }
        if let Some(ms) = parse_value::<u64>(&lookup, "ANVIL_WAIT_TIMEOUT_MS")? {
            config.wait_timeout = Duration::from_millis(ms);
        }
        if let Some(size) = parse_value::<u64>(&lookup, "ANVIL_HEAP_SIZE")? {
            config.heap_size = size;
        }
        config.validate()?;
        Ok(config)
    }

    /// Check the values the front end and the heaps are programmed from
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.front_end_threads()?;
        if self.max_work_group_size == 0 {
            return Err(ConfigError::ZeroLimit {
                name: "max_work_group_size",
            });
        }
        if self.max_work_item_sizes.contains(&0) {
            return Err(ConfigError::ZeroLimit {
                name: "max_work_item_sizes",
            });
        }
        if self.heap_size == 0 {
            return Err(ConfigError::ZeroLimit { name: "heap_size" });
        }
        Ok(())
    }

    /// Thread count the front end is programmed with
    ///
    /// The front end's field cannot hold zero or more threads than the
    /// family supports.
    pub fn front_end_threads(&self) -> Result<u32, ConfigError> {
        let limit = self.family.max_hw_threads();
        if self.hw_threads == 0 || self.hw_threads > limit {
            return Err(ConfigError::InvalidHwThreads {
                threads: self.hw_threads,
                limit,
            });
        }
        Ok(self.hw_threads)
    }

    pub fn with_family(mut self, family: HardwareFamily) -> Self {
        self.family = family;
        self
    }

    pub fn with_max_work_group_size(mut self, size: u32) -> Self {
        self.max_work_group_size = size;
        self
    }

    pub fn with_hw_threads(mut self, threads: u32) -> Self {
        self.hw_threads = threads;
        self
    }

    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }

    pub fn with_heap_size(mut self, size: u64) -> Self {
        self.heap_size = size;
        self
    }

    pub fn with_address_space(mut self, base: u64, size: u64) -> Self {
        self.address_space_base = base;
        self.address_space_size = size;
        self
    }
}

fn parse_value<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<Option<T>, ConfigError> {
    let Some(raw) = lookup(name) else {
        return Ok(None);
    };
    match raw.trim().parse() {
        Ok(value) => Ok(Some(value)),
        Err(_) => Err(ConfigError::InvalidValue { name, value: raw }),
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn lookup_from<'a>(vars: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        move |name: &str| {
            vars.iter()
                .find(|(key, _)| *key == name)
                .map(|(_, value)| value.to_string())
        }
    }

    #[test]
    fn test_builder() {
        let config = DeviceConfig::new(HardwareFamily::XeHpc)
            .with_max_work_group_size(512)
            .with_hw_threads(64)
            .with_heap_size(4096);
        assert_eq!(config.family, HardwareFamily::XeHpc);
        assert_eq!(config.max_work_group_size, 512);
        assert_eq!(config.hw_threads, 64);
        assert_eq!(config.heap_size, 4096);
        assert_eq!(config.wait_timeout, Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_lookup_overrides() {
        let vars = [
            ("ANVIL_HW_FAMILY", "xehpc"),
            ("ANVIL_HW_THREADS", " 17 "),
            ("ANVIL_WAIT_TIMEOUT_MS", "250"),
        ];
        let config = DeviceConfig::from_lookup(lookup_from(&vars)).unwrap();
        assert_eq!(config.family, HardwareFamily::XeHpc);
        assert_eq!(config.hw_threads, 17);
        assert_eq!(config.wait_timeout, Duration::from_millis(250));
        assert_eq!(config.heap_size, DeviceConfig::default().heap_size);

        let unset = DeviceConfig::from_lookup(|_| None).unwrap();
        assert_eq!(unset, DeviceConfig::default());
    }

    #[test]
    fn test_lookup_unparsable_value() {
        let vars = [("ANVIL_HW_THREADS", "seventeen")];
        assert_eq!(
            DeviceConfig::from_lookup(lookup_from(&vars)),
            Err(ConfigError::InvalidValue {
                name: "ANVIL_HW_THREADS",
                value: "seventeen".into()
            })
        );
    }

    #[rstest]
    #[case("0")]
    #[case("65537")]
    #[case("4294967295")]
    fn test_lookup_hw_threads_out_of_range(#[case] threads: &str) {
        let vars = [("ANVIL_HW_THREADS", threads)];
        assert!(matches!(
            DeviceConfig::from_lookup(lookup_from(&vars)),
            Err(ConfigError::InvalidHwThreads { limit: 65536, .. })
        ));
    }

    #[rstest]
    #[case(DeviceConfig::default().with_hw_threads(0), ConfigError::InvalidHwThreads { threads: 0, limit: 65536 })]
    #[case(DeviceConfig::default().with_hw_threads(70_000), ConfigError::InvalidHwThreads { threads: 70_000, limit: 65536 })]
    #[case(DeviceConfig::default().with_max_work_group_size(0), ConfigError::ZeroLimit { name: "max_work_group_size" })]
    #[case(DeviceConfig::default().with_heap_size(0), ConfigError::ZeroLimit { name: "heap_size" })]
    fn test_validate_rejects(#[case] config: DeviceConfig, #[case] expected: ConfigError) {
        assert_eq!(config.validate(), Err(expected));
    }

    #[test]
    fn test_front_end_threads_limit_inclusive() {
        for family in HardwareFamily::ALL {
            let config = DeviceConfig::new(family).with_hw_threads(65536);
            assert_eq!(config.front_end_threads(), Ok(65536));
            assert!(config.validate().is_ok());
            assert!(config.with_hw_threads(65537).front_end_threads().is_err());
        }
    }
}
