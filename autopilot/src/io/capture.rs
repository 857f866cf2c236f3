//! Observation capture seam.

use anyhow::Result;

use crate::core::types::{Dimensions, Observation};

/// Captures the current state of the controlled environment.
///
/// Implementations should return an image no larger than `target`; the
/// executor passes the screen size already scaled to the configured maximum.
pub trait ObservationSource: Send + Sync {
    fn capture(&self, target: Dimensions) -> Result<Observation>;
}

impl<F> ObservationSource for F
where
    F: Fn(Dimensions) -> Result<Observation> + Send + Sync,
{
    fn capture(&self, target: Dimensions) -> Result<Observation> {
        self(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closures_act_as_sources() {
        let source =
            |target: Dimensions| -> Result<Observation> { Ok(Observation::new(vec![1u8], target)) };
        let observation = source
            .capture(Dimensions::new(1280, 720))
            .expect("capture");
        assert_eq!(observation.size, Dimensions::new(1280, 720));
    }
}
