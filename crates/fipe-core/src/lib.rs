//! Core domain model for the FIPE catalog: vehicle types, reference periods and
//! the brand/model/year hierarchy that is always scoped to one period.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "fipe-core";

/// Month names exactly as the catalog prints them in period labels.
pub const MONTH_NAMES: [&str; 12] = [
    "janeiro",
    "fevereiro",
    "março",
    "abril",
    "maio",
    "junho",
    "julho",
    "agosto",
    "setembro",
    "outubro",
    "novembro",
    "dezembro",
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DomainError {
    #[error("unknown vehicle type `{0}`")]
    UnknownVehicleType(String),
    #[error("period label `{0}` is not in the form <mês>/<ano>")]
    MalformedPeriodLabel(String),
    #[error("unknown month name `{0}`")]
    UnknownMonth(String),
    #[error("month {0} out of range 1..=12")]
    MonthOutOfRange(u32),
}

/// Vehicle categories exposed as tabs on the catalog page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VehicleType {
    Car,
    Motorcycle,
    Truck,
}

impl VehicleType {
    /// Processing order used by the batch jobs.
    pub const ALL: [VehicleType; 3] = [VehicleType::Car, VehicleType::Truck, VehicleType::Motorcycle];

    /// Slug used by the page (`data-slug`, select id suffixes) and by `tipo_veiculo.descricao`.
    pub fn slug(self) -> &'static str {
        match self {
            VehicleType::Car => "carro",
            VehicleType::Motorcycle => "moto",
            VehicleType::Truck => "caminhao",
        }
    }

    /// `codigoTipoVeiculo` expected by the JSON endpoints.
    pub fn catalog_code(self) -> u8 {
        match self {
            VehicleType::Car => 1,
            VehicleType::Motorcycle => 2,
            VehicleType::Truck => 3,
        }
    }

    /// `tipo_veiculo.codigo` in the persisted schema and CSV extracts.
    pub fn schema_code(self) -> i32 {
        match self {
            VehicleType::Car => 0,
            VehicleType::Motorcycle => 1,
            VehicleType::Truck => 2,
        }
    }

    pub fn from_slug(slug: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.slug() == slug)
    }

    pub fn from_schema_code(code: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.schema_code() == code)
    }
}

impl fmt::Display for VehicleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

impl FromStr for VehicleType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_lowercase();
        if let Some(t) = Self::from_slug(&lower) {
            return Ok(t);
        }
        match lower.as_str() {
            "car" => Ok(VehicleType::Car),
            "motorcycle" => Ok(VehicleType::Motorcycle),
            "truck" => Ok(VehicleType::Truck),
            _ => Err(DomainError::UnknownVehicleType(s.to_string())),
        }
    }
}

/// A persisted catalog edition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferencePeriod {
    pub id: i32,
    pub month: u32,
    pub year: i32,
    pub label: String,
    /// `codigoTabelaReferencia`, when the period was discovered through the API.
    pub catalog_code: Option<i32>,
}

/// A period not yet stored.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NewReferencePeriod {
    pub month: u32,
    pub year: i32,
    pub label: String,
    pub catalog_code: Option<i32>,
}

impl NewReferencePeriod {
    /// Parses a catalog label such as `"março/2025"`. Surrounding whitespace and
    /// case are ignored; the stored label is the trimmed lowercase form.
    pub fn parse_label(label: &str) -> Result<Self, DomainError> {
        let trimmed = label.trim().to_lowercase();
        let (month_text, year_text) = trimmed
            .split_once('/')
            .ok_or_else(|| DomainError::MalformedPeriodLabel(label.to_string()))?;
        let month = month_number(month_text.trim())?;
        let year = year_text
            .trim()
            .parse::<i32>()
            .map_err(|_| DomainError::MalformedPeriodLabel(label.to_string()))?;
        Ok(Self {
            month,
            year,
            label: format!("{}/{}", month_text.trim(), year),
            catalog_code: None,
        })
    }

    pub fn from_month_year(month: u32, year: i32) -> Result<Self, DomainError> {
        let name = month_name(month)?;
        Ok(Self {
            month,
            year,
            label: format!("{name}/{year}"),
            catalog_code: None,
        })
    }

    pub fn with_catalog_code(mut self, code: i32) -> Self {
        self.catalog_code = Some(code);
        self
    }
}

pub fn month_number(name: &str) -> Result<u32, DomainError> {
    let lower = name.trim().to_lowercase();
    MONTH_NAMES
        .iter()
        .position(|m| *m == lower)
        .map(|idx| idx as u32 + 1)
        .ok_or(DomainError::UnknownMonth(name.to_string()))
}

pub fn month_name(month: u32) -> Result<&'static str, DomainError> {
    month
        .checked_sub(1)
        .and_then(|idx| MONTH_NAMES.get(idx as usize))
        .copied()
        .ok_or(DomainError::MonthOutOfRange(month))
}

/// Uppercased, trimmed form used for every name comparison.
pub fn normalize_name(name: &str) -> String {
    name.trim().to_uppercase()
}

/// One option read from a populated selector or returned by an endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CatalogItem {
    pub label: String,
    pub external_id: i32,
}

impl CatalogItem {
    pub fn new(label: impl Into<String>, external_id: i32) -> Self {
        Self {
            label: label.into(),
            external_id,
        }
    }

    pub fn normalized_name(&self) -> String {
        normalize_name(&self.label)
    }
}

/// Year/fuel pair split from a label such as `"2014 Gasolina"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct YearFuel {
    pub year: String,
    pub fuel: String,
}

impl YearFuel {
    /// First whitespace token is the year, the remainder is the fuel. Returns
    /// `None` for blank labels.
    pub fn parse_label(label: &str) -> Option<Self> {
        let mut parts = label.split_whitespace();
        let year = parts.next()?.to_string();
        let fuel = parts.collect::<Vec<_>>().join(" ");
        Some(Self { year, fuel })
    }

    pub fn key(&self) -> (String, String) {
        (normalize_name(&self.year), normalize_name(&self.fuel))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Brand {
    pub id: i32,
    pub name: String,
    pub external_id: i32,
    pub vehicle_type: VehicleType,
    pub period_id: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Model {
    pub id: i32,
    pub name: String,
    pub external_id: Option<i32>,
    pub brand_id: i32,
    pub period_id: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct YearVariant {
    pub id: i32,
    pub year_label: String,
    pub fuel_label: String,
    pub model_id: i32,
    pub period_id: i32,
}

/// Flattened brand row used by the CSV extract (`descricao,fipeid,tipoveiculo`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BrandExportRow {
    pub name: String,
    pub external_id: i32,
    pub vehicle_code: i32,
}

/// Flattened model row used by the CSV extract.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModelExportRow {
    pub brand_name: String,
    pub brand_external_id: i32,
    pub model_name: String,
    pub model_external_id: Option<i32>,
    pub vehicle_code: i32,
}

/// Timestamp helper shared by reports and output file names.
pub fn month_year_stamp(at: DateTime<Utc>) -> String {
    at.format("%m%Y").to_string()
}
