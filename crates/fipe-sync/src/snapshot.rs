//! Offline comparison of two CSV extracts: the catalog export against an
//! external reference file. Pure apart from reading and writing the files.

use std::collections::{BTreeMap, HashSet};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fipe_core::{month_year_stamp, normalize_name};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::export::{BRAND_HEADER, MODEL_HEADER};

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("{origin}: {source}")]
    Csv {
        origin: String,
        #[source]
        source: csv::Error,
    },
    #[error("{origin} line {line}: expected {expected} columns, found {found}")]
    ShortRow {
        origin: String,
        line: u64,
        expected: usize,
        found: usize,
    },
    #[error("{origin} line {line}: vehicle type code `{value}` is not an integer")]
    BadVehicleCode {
        origin: String,
        line: u64,
        value: String,
    },
    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Composite brand key: uppercased name, catalog id without quotes, type code.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct BrandKey {
    pub name: String,
    pub external_id: String,
    pub vehicle_code: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelRecord {
    pub brand_name: String,
    pub brand_external_id: String,
    pub model_name: String,
    pub model_external_id: String,
    pub vehicle_code: i32,
}

impl ModelRecord {
    /// Brand name, model name and type code, compared case-sensitively after
    /// trimming. Catalog ids are carried along but are not part of the identity.
    pub fn key(&self) -> (String, String, i32) {
        (
            self.brand_name.trim().to_string(),
            self.model_name.trim().to_string(),
            self.vehicle_code,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComparisonSummary {
    pub left_total: usize,
    pub right_total: usize,
    pub emitted: usize,
    pub output: PathBuf,
}

fn clean_id(raw: &str) -> String {
    raw.trim().trim_matches('"').trim().to_string()
}

fn rows<R: Read>(
    input: R,
    origin: &str,
    expected: usize,
) -> Result<Vec<(u64, csv::StringRecord)>, SnapshotError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(input);
    let mut out = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|source| SnapshotError::Csv {
            origin: origin.to_string(),
            source,
        })?;
        let line = record.position().map(|p| p.line()).unwrap_or_default();
        if record.iter().all(|field| field.trim().is_empty()) {
            continue;
        }
        if record.len() < expected {
            return Err(SnapshotError::ShortRow {
                origin: origin.to_string(),
                line,
                expected,
                found: record.len(),
            });
        }
        out.push((line, record));
    }
    Ok(out)
}

fn vehicle_code(origin: &str, line: u64, raw: &str) -> Result<i32, SnapshotError> {
    raw.trim()
        .parse()
        .map_err(|_| SnapshotError::BadVehicleCode {
            origin: origin.to_string(),
            line,
            value: raw.to_string(),
        })
}

pub fn read_brands<R: Read>(input: R, origin: &str) -> Result<Vec<BrandKey>, SnapshotError> {
    rows(input, origin, BRAND_HEADER.len())?
        .into_iter()
        .map(|(line, record)| -> Result<BrandKey, SnapshotError> {
            Ok(BrandKey {
                name: normalize_name(&record[0]),
                external_id: clean_id(&record[1]),
                vehicle_code: vehicle_code(origin, line, &record[2])?,
            })
        })
        .collect()
}

pub fn read_models<R: Read>(input: R, origin: &str) -> Result<Vec<ModelRecord>, SnapshotError> {
    rows(input, origin, MODEL_HEADER.len())?
        .into_iter()
        .map(|(line, record)| -> Result<ModelRecord, SnapshotError> {
            Ok(ModelRecord {
                brand_name: record[0].trim().to_string(),
                brand_external_id: clean_id(&record[1]),
                model_name: record[2].trim().to_string(),
                model_external_id: clean_id(&record[3]),
                vehicle_code: vehicle_code(origin, line, &record[4])?,
            })
        })
        .collect()
}

/// Keys of `left` absent from `right`, sorted and deduplicated.
pub fn brands_missing_from(left: &[BrandKey], right: &[BrandKey]) -> Vec<BrandKey> {
    let right: HashSet<&BrandKey> = right.iter().collect();
    let mut missing: Vec<BrandKey> = left.iter().filter(|k| !right.contains(k)).cloned().collect();
    missing.sort();
    missing.dedup();
    missing
}

/// Records of `left` whose key is absent from `right`, one per key, sorted by key.
pub fn models_missing_from(left: &[ModelRecord], right: &[ModelRecord]) -> Vec<ModelRecord> {
    let right: HashSet<_> = right.iter().map(ModelRecord::key).collect();
    let mut missing = BTreeMap::new();
    for record in left {
        let key = record.key();
        if !right.contains(&key) {
            missing.entry(key).or_insert_with(|| record.clone());
        }
    }
    missing.into_values().collect()
}

pub fn sql_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

pub fn render_brand_inserts(brands: &[BrandKey]) -> String {
    brands
        .iter()
        .map(|b| {
            format!(
                "INSERT INTO marca (descricao, fipeid, tipoveiculo) VALUES ({}, {}, {});\n",
                sql_quote(&b.name),
                sql_quote(&b.external_id),
                b.vehicle_code
            )
        })
        .collect()
}

pub fn write_brand_csv<W: Write>(out: W, brands: &[BrandKey]) -> Result<(), csv::Error> {
    let mut writer = csv::Writer::from_writer(out);
    writer.write_record(BRAND_HEADER)?;
    for brand in brands {
        let code = brand.vehicle_code.to_string();
        writer.write_record([brand.name.as_str(), brand.external_id.as_str(), code.as_str()])?;
    }
    writer.flush()?;
    Ok(())
}

pub fn write_model_csv<W: Write>(out: W, models: &[ModelRecord]) -> Result<(), csv::Error> {
    let mut writer = csv::Writer::from_writer(out);
    writer.write_record(MODEL_HEADER)?;
    for model in models {
        let code = model.vehicle_code.to_string();
        writer.write_record([
            model.brand_name.as_str(),
            model.brand_external_id.as_str(),
            model.model_name.as_str(),
            model.model_external_id.as_str(),
            code.as_str(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

fn open(path: &Path) -> Result<std::fs::File, SnapshotError> {
    std::fs::File::open(path).map_err(|source| SnapshotError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn create(path: &Path) -> Result<std::fs::File, SnapshotError> {
    std::fs::File::create(path).map_err(|source| SnapshotError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn load_brands(path: &Path) -> Result<Vec<BrandKey>, SnapshotError> {
    read_brands(open(path)?, &path.display().to_string())
}

fn load_models(path: &Path) -> Result<Vec<ModelRecord>, SnapshotError> {
    read_models(open(path)?, &path.display().to_string())
}

fn csv_to_file(path: &Path, source: csv::Error) -> SnapshotError {
    SnapshotError::Csv {
        origin: path.display().to_string(),
        source,
    }
}

/// Brands in the catalog extract but not in the reference, as SQL inserts in
/// `carga_fipe_marcas_<MMYYYY>.sql`.
pub fn compare_brands(
    catalog: &Path,
    reference: &Path,
    out_dir: &Path,
    at: DateTime<Utc>,
) -> Result<ComparisonSummary, SnapshotError> {
    let left = load_brands(catalog)?;
    let right = load_brands(reference)?;
    let missing = brands_missing_from(&left, &right);

    let output = out_dir.join(format!("carga_fipe_marcas_{}.sql", month_year_stamp(at)));
    let mut file = create(&output)?;
    file.write_all(render_brand_inserts(&missing).as_bytes())
        .map_err(|source| SnapshotError::Io {
            path: output.clone(),
            source,
        })?;

    info!(
        catalog = left.len(),
        reference = right.len(),
        to_insert = missing.len(),
        output = %output.display(),
        "brand comparison written"
    );
    Ok(ComparisonSummary {
        left_total: left.len(),
        right_total: right.len(),
        emitted: missing.len(),
        output,
    })
}

/// Brands in the reference but not in the catalog extract, as
/// `marcas_apenas_ojc_<MMYYYY>.csv`.
pub fn compare_brands_inverse(
    catalog: &Path,
    reference: &Path,
    out_dir: &Path,
    at: DateTime<Utc>,
) -> Result<ComparisonSummary, SnapshotError> {
    let catalog_rows = load_brands(catalog)?;
    let reference_rows = load_brands(reference)?;
    let missing = brands_missing_from(&reference_rows, &catalog_rows);

    let output = out_dir.join(format!("marcas_apenas_ojc_{}.csv", month_year_stamp(at)));
    write_brand_csv(create(&output)?, &missing).map_err(|err| csv_to_file(&output, err))?;

    for brand in &missing {
        debug!(name = %brand.name, external_id = %brand.external_id, code = brand.vehicle_code, "only in reference");
    }
    info!(
        reference = reference_rows.len(),
        catalog = catalog_rows.len(),
        only_in_reference = missing.len(),
        output = %output.display(),
        "inverse brand comparison written"
    );
    Ok(ComparisonSummary {
        left_total: reference_rows.len(),
        right_total: catalog_rows.len(),
        emitted: missing.len(),
        output,
    })
}

/// Models in the catalog extract but not in the reference, as
/// `modelos_unicos_fipe_<MMYYYY>.csv`.
pub fn compare_models(
    catalog: &Path,
    reference: &Path,
    out_dir: &Path,
    at: DateTime<Utc>,
) -> Result<ComparisonSummary, SnapshotError> {
    let left = load_models(catalog)?;
    let right = load_models(reference)?;
    let missing = models_missing_from(&left, &right);

    let output = out_dir.join(format!("modelos_unicos_fipe_{}.csv", month_year_stamp(at)));
    write_model_csv(create(&output)?, &missing).map_err(|err| csv_to_file(&output, err))?;

    info!(
        catalog = left.len(),
        reference = right.len(),
        unique = missing.len(),
        output = %output.display(),
        "model comparison written"
    );
    Ok(ComparisonSummary {
        left_total: left.len(),
        right_total: right.len(),
        emitted: missing.len(),
        output,
    })
}
