//! Predefined spectral indices, expressed as formula + required bands.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A named index evaluated through the formula kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PredefinedIndex {
    Ndvi,
    Ndwi,
    Savi,
    Evi,
    Gndvi,
}

/// The fixed public index table.
pub const PREDEFINED_INDICES: [PredefinedIndex; 5] = [
    PredefinedIndex::Ndvi,
    PredefinedIndex::Ndwi,
    PredefinedIndex::Savi,
    PredefinedIndex::Evi,
    PredefinedIndex::Gndvi,
];

impl PredefinedIndex {
    pub fn name(self) -> &'static str {
        match self {
            Self::Ndvi => "NDVI",
            Self::Ndwi => "NDWI",
            Self::Savi => "SAVI",
            Self::Evi => "EVI",
            Self::Gndvi => "GNDVI",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Self::Ndvi => "Normalized Difference Vegetation Index",
            Self::Ndwi => "Normalized Difference Water Index",
            Self::Savi => "Soil Adjusted Vegetation Index",
            Self::Evi => "Enhanced Vegetation Index",
            Self::Gndvi => "Green Normalized Difference Vegetation Index",
        }
    }

    pub fn formula(self) -> &'static str {
        match self {
            Self::Ndvi => "(nir - red) / (nir + red)",
            Self::Ndwi => "(green - nir) / (green + nir)",
            Self::Savi => "((nir - red) / (nir + red + 0.5)) * 1.5",
            Self::Evi => "2.5 * ((nir - red) / (nir + 6 * red - 7.5 * blue + 1))",
            Self::Gndvi => "(nir - green) / (nir + green)",
        }
    }

    pub fn required_bands(self) -> &'static [&'static str] {
        match self {
            Self::Ndvi => &["nir", "red"],
            Self::Ndwi => &["green", "nir"],
            Self::Savi => &["nir", "red"],
            Self::Evi => &["nir", "red", "blue"],
            Self::Gndvi => &["nir", "green"],
        }
    }

    /// Case-insensitive lookup by name.
    pub fn from_name(name: &str) -> Option<Self> {
        PREDEFINED_INDICES
            .into_iter()
            .find(|index| index.name().eq_ignore_ascii_case(name.trim()))
    }
}

impl fmt::Display for PredefinedIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PredefinedIndex {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s).ok_or_else(|| {
            let known: Vec<&str> = PREDEFINED_INDICES.iter().map(|i| i.name()).collect();
            format!("unknown index '{}' (known: {})", s, known.join(", "))
        })
    }
}
