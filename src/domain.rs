use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::HarvestError;

/// Static grid-cell area variable; the only variable harvested from the `fx` table.
pub const AREA_VARIABLE: &str = "areacella";
pub const FIXED_TABLE: &str = "fx";
pub const MONTHLY_TABLE: &str = "Amon";

static VARIANT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^r(\d+)i(\d+)p(\d+)f(\d+)$").expect("variant label pattern"));

/// Frequency facet sent to the index node for a variable.
pub fn search_frequency(variable: &str) -> &'static str {
    if variable == AREA_VARIABLE { "fx" } else { "mon" }
}

/// CMIP table id a dataset of `variable` must carry to be cataloged.
pub fn expected_table(variable: &str) -> &'static str {
    if variable == AREA_VARIABLE {
        FIXED_TABLE
    } else {
        MONTHLY_TABLE
    }
}

/// Ensemble member label `r<R>i<I>p<P>f<F>`, ordered numerically on (R, I, P, F).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VariantLabel {
    realization: u32,
    initialization: u32,
    physics: u32,
    forcing: u32,
}

impl VariantLabel {
    pub fn new(realization: u32, initialization: u32, physics: u32, forcing: u32) -> Self {
        Self {
            realization,
            initialization,
            physics,
            forcing,
        }
    }
}

impl fmt::Display for VariantLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "r{}i{}p{}f{}",
            self.realization, self.initialization, self.physics, self.forcing
        )
    }
}

impl FromStr for VariantLabel {
    type Err = HarvestError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = || HarvestError::InvalidVariantLabel(value.to_string());
        let caps = VARIANT_RE.captures(value.trim()).ok_or_else(invalid)?;
        let mut parts = [0u32; 4];
        for (slot, idx) in parts.iter_mut().zip(1..=4) {
            *slot = caps[idx].parse().map_err(|_| invalid())?;
        }
        Ok(Self::new(parts[0], parts[1], parts[2], parts[3]))
    }
}

impl Serialize for VariantLabel {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for VariantLabel {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Facets encoded in a dataset master id such as
/// `CMIP6.CMIP.NCAR.CESM2.piControl.r1i1p1f1.Amon.tas.gn.v20190320`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FacetTuple {
    pub project: String,
    pub activity_id: String,
    pub institution_id: String,
    pub source_id: String,
    pub experiment_id: String,
    pub variant_label: VariantLabel,
    pub frequency: String,
    pub variable_id: String,
    pub grid_label: String,
}

impl FacetTuple {
    /// Whether the table id agrees with the variable (`fx` for area, `Amon` otherwise).
    pub fn has_expected_frequency(&self) -> bool {
        self.frequency == expected_table(&self.variable_id)
    }
}

impl FromStr for FacetTuple {
    type Err = HarvestError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let master_id = value.split('|').next().unwrap_or_default().trim();
        let fields = master_id.split('.').collect::<Vec<_>>();
        if fields.len() < 9 || fields[..9].iter().any(|field| field.is_empty()) {
            return Err(HarvestError::InvalidMasterId(value.to_string()));
        }
        Ok(Self {
            project: fields[0].to_string(),
            activity_id: fields[1].to_string(),
            institution_id: fields[2].to_string(),
            source_id: fields[3].to_string(),
            experiment_id: fields[4].to_string(),
            variant_label: fields[5].parse()?,
            frequency: fields[6].to_string(),
            variable_id: fields[7].to_string(),
            grid_label: fields[8].to_string(),
        })
    }
}

/// Facets encoded in a CMIP6 filename:
/// `<variable>_<table>_<source>_<experiment>_<variant>_<grid>[_<time range>].nc`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilenameFacets {
    pub variable_id: String,
    pub table_id: String,
    pub source_id: String,
    pub experiment_id: String,
    pub variant_label: VariantLabel,
    pub grid_label: String,
}

impl FromStr for FilenameFacets {
    type Err = HarvestError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = || HarvestError::InvalidFilename(value.to_string());
        let stem = value.trim().strip_suffix(".nc").ok_or_else(invalid)?;
        let fields = stem.split('_').collect::<Vec<_>>();
        if fields.len() < 6 || fields[..6].iter().any(|field| field.is_empty()) {
            return Err(invalid());
        }
        Ok(Self {
            variable_id: fields[0].to_string(),
            table_id: fields[1].to_string(),
            source_id: fields[2].to_string(),
            experiment_id: fields[3].to_string(),
            variant_label: fields[4].parse().map_err(|_| invalid())?,
            grid_label: fields[5].to_string(),
        })
    }
}
