//! Runtime configuration for the [`HazardPointerStack`][crate::HazardPointerStack].

/// The factor by which the slot count is multiplied to get the default
/// scan threshold.
pub const DEFAULT_SCAN_FACTOR: usize = 2;

////////////////////////////////////////////////////////////////////////////////////////////////////
// Config
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Runtime parameters of a hazard pointer stack.
///
/// The number of hazard slots itself is a type parameter of the stack, this
/// only tunes when retired nodes are reclaimed.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Config {
    scan_threshold: Option<usize>,
}

/********** impl inherent *************************************************************************/

impl Config {
    /// Creates a new [`Config`] with the default parameters.
    #[inline]
    pub const fn new() -> Self {
        Self { scan_threshold: None }
    }

    /// Returns the minimum number of pending retired nodes required before a
    /// reclamation scan actually checks them against all hazard slots, given
    /// the stack's number of slots.
    ///
    /// Defaults to `2 * max_hazards`.
    #[inline]
    pub fn scan_threshold(&self, max_hazards: usize) -> usize {
        self.scan_threshold.unwrap_or(DEFAULT_SCAN_FACTOR * max_hazards)
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// ConfigBuilder
////////////////////////////////////////////////////////////////////////////////////////////////////

/// A builder type for gradually initializing a [`Config`].
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct ConfigBuilder {
    scan_threshold: Option<usize>,
}

/********** impl inherent *************************************************************************/

impl ConfigBuilder {
    /// Creates a new [`ConfigBuilder`] with default values.
    #[inline]
    pub const fn new() -> Self {
        Self { scan_threshold: None }
    }

    /// Sets a fixed scan threshold.
    ///
    /// A threshold of `0` or `1` checks the pending list on every pop.
    #[inline]
    pub const fn scan_threshold(mut self, scan_threshold: usize) -> Self {
        self.scan_threshold = Some(scan_threshold);
        self
    }

    /// Consumes the [`ConfigBuilder`] and returns an initialized [`Config`].
    #[inline]
    pub const fn build(self) -> Config {
        Config { scan_threshold: self.scan_threshold }
    }
}

#[cfg(test)]
mod tests {
    use super::{Config, ConfigBuilder};

    #[test]
    fn default_threshold_scales_with_slots() {
        let config = Config::default();
        assert_eq!(config.scan_threshold(4), 8);
        assert_eq!(config.scan_threshold(100), 200);
    }

    #[test]
    fn fixed_threshold() {
        let config = ConfigBuilder::new().scan_threshold(3).build();
        assert_eq!(config.scan_threshold(100), 3);
    }
}
