//! Built-in algorithms selectable by name from the command line.
pub mod dual_moving_average;

use crate::{
    error::{Error, Result},
    executor::Algorithm,
};

pub use dual_moving_average::DualMovingAverage;

pub const ALGORITHMS: &[&str] = &["dual_moving_average"];

pub fn algorithm_by_name(name: &str) -> Result<Box<dyn Algorithm>> {
    match name {
        "dual_moving_average" => Ok(Box::new(DualMovingAverage::default())),
        other => Err(Error::UnknownAlgorithm(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry() {
        for name in ALGORITHMS {
            assert!(algorithm_by_name(name).is_ok());
        }
        assert!(matches!(
            algorithm_by_name("buy_the_dip"),
            Err(Error::UnknownAlgorithm(name)) if name == "buy_the_dip"
        ));
    }
}
