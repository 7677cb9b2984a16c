//! Reference data used to enrich aircraft states
//!
//! Two CSV sources are loaded wholesale before each analysis pass:
//! - `aircraftDatabase.csv`: the OpenSky airframe registry, keyed by `icao24`
//! - `doc8643AircraftTypes.csv`: ICAO Doc 8643 aircraft type designators
//!
//! Both files carry more columns than we use; unknown columns are ignored and
//! ragged rows are tolerated.

use anyhow::{Context, Result};
use csv::ReaderBuilder;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use tracing::{info, warn};

/// One row of the airframe registry
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Airframe {
    pub icao24: String,
    #[serde(default)]
    pub registration: Option<String>,
    #[serde(default)]
    pub manufacturericao: Option<String>,
    #[serde(default)]
    pub manufacturername: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub typecode: Option<String>,
    #[serde(default)]
    pub icaoaircrafttype: Option<String>,
    #[serde(default)]
    pub operator: Option<String>,
    #[serde(default)]
    pub operatorcallsign: Option<String>,
    #[serde(default)]
    pub operatoricao: Option<String>,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub built: Option<String>,
    #[serde(default)]
    pub engines: Option<String>,
    #[serde(default, rename = "categoryDescription")]
    pub category_description: Option<String>,
}

/// One row of the Doc 8643 type designator table
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AircraftModel {
    #[serde(rename = "Designator")]
    pub designator: String,
    #[serde(default, rename = "AircraftDescription")]
    pub aircraft_description: Option<String>,
    #[serde(default, rename = "Description")]
    pub description: Option<String>,
    #[serde(default, rename = "EngineCount")]
    pub engine_count: Option<String>,
    #[serde(default, rename = "EngineType")]
    pub engine_type: Option<String>,
    #[serde(default, rename = "ManufacturerCode")]
    pub manufacturer_code: Option<String>,
    #[serde(default, rename = "ModelFullName")]
    pub model_full_name: Option<String>,
    #[serde(default, rename = "WTC")]
    pub wtc: Option<String>,
}

/// Reference tables indexed for the enrichment join
#[derive(Debug, Clone, Default)]
pub struct ReferenceData {
    airframes: HashMap<String, Airframe>,
    models: HashMap<String, AircraftModel>,
}

impl ReferenceData {
    /// Index airframes by lowercase `icao24` and models by uppercase designator
    ///
    /// The first row wins when a key repeats, so the join never fans out.
    pub fn new(airframes: Vec<Airframe>, models: Vec<AircraftModel>) -> Self {
        let mut airframe_index = HashMap::with_capacity(airframes.len());
        for mut airframe in airframes {
            airframe.icao24 = airframe.icao24.trim().to_lowercase();
            if airframe.icao24.is_empty() {
                continue;
            }
            airframe_index
                .entry(airframe.icao24.clone())
                .or_insert(airframe);
        }

        let mut model_index = HashMap::with_capacity(models.len());
        for model in models {
            let designator = model.designator.trim().to_uppercase();
            if designator.is_empty() {
                continue;
            }
            model_index.entry(designator).or_insert(model);
        }

        Self {
            airframes: airframe_index,
            models: model_index,
        }
    }

    /// Load both reference files from disk
    pub fn load(airframes_path: &Path, models_path: &Path) -> Result<Self> {
        let airframes: Vec<Airframe> = read_csv_file(airframes_path)?;
        let models: Vec<AircraftModel> = read_csv_file(models_path)?;
        let data = Self::new(airframes, models);

        info!(
            "Loaded reference data: {} airframes from {}, {} aircraft types from {}",
            data.airframes.len(),
            airframes_path.display(),
            data.models.len(),
            models_path.display()
        );
        Ok(data)
    }

    pub fn airframe(&self, icao24: &str) -> Option<&Airframe> {
        self.airframes.get(icao24)
    }

    pub fn model(&self, designator: &str) -> Option<&AircraftModel> {
        self.models.get(&designator.trim().to_uppercase())
    }

    /// Model for an airframe: `typecode` match preferred over `icaoaircrafttype`
    pub fn model_for(&self, airframe: &Airframe) -> Option<&AircraftModel> {
        airframe
            .typecode
            .as_deref()
            .and_then(|code| self.model(code))
            .or_else(|| {
                airframe
                    .icaoaircrafttype
                    .as_deref()
                    .and_then(|code| self.model(code))
            })
    }
}

fn read_csv_file<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let file = std::fs::File::open(path)
        .context(format!("Failed to open reference file {}", path.display()))?;
    read_csv(file, &path.display().to_string())
}

/// Parse reference rows, skipping (and logging) rows that do not deserialize
pub fn read_csv<T: DeserializeOwned, R: Read>(reader: R, origin: &str) -> Result<Vec<T>> {
    let mut csv_reader = ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    csv_reader
        .headers()
        .context(format!("Failed to read CSV header from {}", origin))?;

    let mut rows = Vec::new();
    let mut skipped = 0usize;
    for (index, result) in csv_reader.deserialize().enumerate() {
        match result {
            Ok(row) => rows.push(row),
            Err(e) => {
                if skipped == 0 {
                    warn!("Skipping unreadable row {} in {}: {}", index + 2, origin, e);
                }
                skipped += 1;
            }
        }
    }

    if skipped > 0 {
        warn!("Skipped {} unreadable rows in {}", skipped, origin);
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    const AIRFRAMES: &str = "\
icao24,registration,manufacturericao,manufacturername,model,typecode,serialnumber,icaoaircrafttype,operator,owner,categoryDescription
4CA7B3,EI-DCL,BOEING,Boeing,737-8AS,B738,33544,L2J,Ryanair,Ryanair,Large
a0b1c2,N123AB,,Cessna,172S,,,L1P,,Private,
a0b1c2,N999ZZ,,Other,Dup,,,,,,
3c6444,D-AIBD,AIRBUS,Airbus,A319-112,A319,,L2J,Lufthansa,,
";

    const MODELS: &str = "\
AircraftDescription,Description,Designator,EngineCount,EngineType,ManufacturerCode,ModelFullName,WTC
LandPlane,L2J,B738,2,Jet,BOEING,737-800,M
LandPlane,L1P,L1P,1,Piston,GENERIC,Generic single piston,L
LandPlane,L2J,B738,2,Jet,BOEING,Duplicate 737,M
";

    fn reference() -> ReferenceData {
        let airframes: Vec<Airframe> = read_csv(AIRFRAMES.as_bytes(), "airframes").unwrap();
        let models: Vec<AircraftModel> = read_csv(MODELS.as_bytes(), "models").unwrap();
        ReferenceData::new(airframes, models)
    }

    #[test]
    fn test_airframes_indexed_by_lowercase_icao() {
        let data = reference();
        assert_eq!(data.airframes.len(), 3);
        let airframe = data.airframe("4ca7b3").unwrap();
        assert_eq!(airframe.typecode.as_deref(), Some("B738"));
        assert_eq!(airframe.category_description.as_deref(), Some("Large"));
        // First row wins for duplicated keys
        assert_eq!(
            data.airframe("a0b1c2").unwrap().registration.as_deref(),
            Some("N123AB")
        );
    }

    #[test]
    fn test_model_lookup_prefers_typecode() {
        let data = reference();
        let boeing = data.airframe("4ca7b3").unwrap();
        assert_eq!(
            data.model_for(boeing).unwrap().model_full_name.as_deref(),
            Some("737-800")
        );

        let cessna = data.airframe("a0b1c2").unwrap();
        assert!(cessna.typecode.is_none());
        assert_eq!(data.model_for(cessna).unwrap().designator, "L1P");

        // A319 is not in the type table
        let airbus = data.airframe("3c6444").unwrap();
        assert!(data.model_for(airbus).is_none());
    }

    #[test]
    fn test_ragged_rows_are_tolerated() {
        let csv = "Designator,ModelFullName,WTC\nC172,Skyhawk\nPA28,Cherokee,L,extra\n";
        let models: Vec<AircraftModel> = read_csv(csv.as_bytes(), "models").unwrap();
        assert_eq!(models.len(), 2);
        assert_eq!(models[0].wtc, None);
        assert_eq!(models[1].wtc.as_deref(), Some("L"));
    }
}
