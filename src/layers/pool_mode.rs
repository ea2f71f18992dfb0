//! Pooling reductions applied per output window

use std::fmt;
use std::str::FromStr;
use serde::{Serialize, Deserialize};
use crate::error::{PoolError, Result};

/// Reduction applied to each pooling window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolMode {
    /// Largest element of the window
    Max,
    /// Window sum divided by the full window size, padding counted as zeros
    Average,
    /// Window sum divided by the number of elements inside the input
    AverageNoPad,
}

impl PoolMode {
    /// Whether the im2col CPU path implements this mode
    pub fn cpu_supported(self) -> bool {
        self.cpu_reduction().is_ok()
    }

    /// Configuration error for modes the CPU path does not implement
    pub fn ensure_cpu_supported(self) -> Result<()> {
        self.cpu_reduction().map(|_| ())
    }

    /// The reduction the im2col CPU path applies for this mode
    pub fn cpu_reduction(self) -> Result<CpuReduction> {
        match self {
            PoolMode::Max => Ok(CpuReduction::Max),
            PoolMode::Average => Ok(CpuReduction::Average),
            PoolMode::AverageNoPad => Err(PoolError::configuration(format!(
                "CPU pooling only implements max and average pooling, got {}",
                self
            ))),
        }
    }
}

/// Reductions available on the im2col CPU path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuReduction {
    Max,
    Average,
}

impl CpuReduction {
    /// Reduce one window segment of a column matrix.
    ///
    /// Padding entries are already zero in the segment, so averaging always
    /// divides by the full window.
    pub fn reduce<'a, I>(self, window: I, window_size: usize) -> f32
    where
        I: IntoIterator<Item = &'a f32>,
    {
        match self {
            CpuReduction::Max => window.into_iter().fold(f32::NEG_INFINITY, |acc, &v| acc.max(v)),
            CpuReduction::Average => window.into_iter().sum::<f32>() / window_size as f32,
        }
    }
}

/// Index of the first maximal entry; ties go to the lowest index
pub fn argmax_first<'a, I>(window: I) -> usize
where
    I: IntoIterator<Item = &'a f32>,
{
    let mut max_index = 0;
    let mut max_entry = f32::NEG_INFINITY;
    for (i, &entry) in window.into_iter().enumerate() {
        if entry > max_entry {
            max_index = i;
            max_entry = entry;
        }
    }
    max_index
}

impl fmt::Display for PoolMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PoolMode::Max => "max",
            PoolMode::Average => "average",
            PoolMode::AverageNoPad => "average_no_pad",
        };
        f.write_str(name)
    }
}

impl FromStr for PoolMode {
    type Err = PoolError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "max" => Ok(PoolMode::Max),
            "average" | "avg" => Ok(PoolMode::Average),
            "average_no_pad" => Ok(PoolMode::AverageNoPad),
            other => Err(PoolError::invalid_parameter(
                "pool_mode".to_string(),
                format!("unknown pooling mode '{}'", other),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        for mode in [PoolMode::Max, PoolMode::Average, PoolMode::AverageNoPad] {
            assert_eq!(mode.to_string().parse::<PoolMode>().unwrap(), mode);
        }
        assert_eq!("AVG".parse::<PoolMode>().unwrap(), PoolMode::Average);
        assert!("median".parse::<PoolMode>().is_err());
    }

    #[test]
    fn test_cpu_support() {
        assert!(PoolMode::Max.ensure_cpu_supported().is_ok());
        assert!(PoolMode::Average.ensure_cpu_supported().is_ok());
        assert_eq!(PoolMode::Max.cpu_reduction().unwrap(), CpuReduction::Max);
        assert!(!PoolMode::AverageNoPad.cpu_supported());
        let err = PoolMode::AverageNoPad.ensure_cpu_supported().unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_reduce() {
        let window = [1.0, -3.0, 7.0, 2.0];
        assert_eq!(CpuReduction::Max.reduce(&window, 4), 7.0);
        assert_eq!(CpuReduction::Average.reduce(&window, 4), 1.75);
    }

    #[test]
    fn test_all_padding_max_is_zero() {
        assert_eq!(CpuReduction::Max.reduce(&[0.0, 0.0, 0.0], 3), 0.0);
    }

    #[test]
    fn test_argmax_ties_take_lowest_index() {
        assert_eq!(argmax_first(&[1.0, 5.0, 5.0, 2.0]), 1);
        assert_eq!(argmax_first(&[-1.0, -1.0]), 0);
        assert_eq!(argmax_first(&[0.0, 0.0, 3.0]), 2);
    }

    #[test]
    fn test_serde_names() {
        let json = serde_json::to_string(&PoolMode::AverageNoPad).unwrap();
        assert_eq!(json, "\"average_no_pad\"");
        let mode: PoolMode = serde_json::from_str("\"max\"").unwrap();
        assert_eq!(mode, PoolMode::Max);
    }
}
