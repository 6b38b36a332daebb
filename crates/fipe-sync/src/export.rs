use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use fipe_core::{BrandExportRow, ModelExportRow};
use fipe_storage::CatalogStore;
use tracing::info;

pub const BRANDS_EXPORT_FILE: &str = "marcas_fipescrapper.csv";
pub const MODELS_EXPORT_FILE: &str = "modelos_fipescrapper.csv";

pub const BRAND_HEADER: [&str; 3] = ["descricao", "fipeid", "tipoveiculo"];
/// The blank-headed column holds the model name.
pub const MODEL_HEADER: [&str; 5] = ["descricao", "fipeid_marca", "", "fipeid_modelo", "tipoveiculo"];

pub fn write_brand_rows<W: Write>(out: W, rows: &[BrandExportRow]) -> Result<()> {
    let mut writer = csv::Writer::from_writer(out);
    writer.write_record(BRAND_HEADER)?;
    for row in rows {
        let external_id = row.external_id.to_string();
        let vehicle_code = row.vehicle_code.to_string();
        writer.write_record([row.name.as_str(), external_id.as_str(), vehicle_code.as_str()])?;
    }
    writer.flush()?;
    Ok(())
}

pub fn write_model_rows<W: Write>(out: W, rows: &[ModelExportRow]) -> Result<()> {
    let mut writer = csv::Writer::from_writer(out);
    writer.write_record(MODEL_HEADER)?;
    for row in rows {
        let brand_id = row.brand_external_id.to_string();
        let model_id = row
            .model_external_id
            .map(|id| id.to_string())
            .unwrap_or_default();
        let vehicle_code = row.vehicle_code.to_string();
        writer.write_record([
            row.brand_name.as_str(),
            brand_id.as_str(),
            row.model_name.as_str(),
            model_id.as_str(),
            vehicle_code.as_str(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

/// Writes the distinct stored brands to `path` and returns the row count.
pub async fn export_brands(store: &dyn CatalogStore, path: &Path) -> Result<usize> {
    let rows = store
        .brand_export_rows()
        .await
        .context("reading brands for export")?;
    let file = std::fs::File::create(path).with_context(|| format!("creating {}", path.display()))?;
    write_brand_rows(file, &rows).with_context(|| format!("writing {}", path.display()))?;
    info!(path = %path.display(), rows = rows.len(), "brands exported");
    Ok(rows.len())
}

pub async fn export_models(store: &dyn CatalogStore, path: &Path) -> Result<usize> {
    let rows = store
        .model_export_rows()
        .await
        .context("reading models for export")?;
    let file = std::fs::File::create(path).with_context(|| format!("creating {}", path.display()))?;
    write_model_rows(file, &rows).with_context(|| format!("writing {}", path.display()))?;
    info!(path = %path.display(), rows = rows.len(), "models exported");
    Ok(rows.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use fipe_core::{CatalogItem, NewReferencePeriod, VehicleType};
    use fipe_storage::MemoryStore;
    use tempfile::tempdir;

    #[test]
    fn model_layout_keeps_blank_header_column() {
        let mut out = Vec::new();
        write_model_rows(
            &mut out,
            &[ModelExportRow {
                brand_name: "HONDA".into(),
                brand_external_id: 25,
                model_name: "Civic EXL 2.0, Aut.".into(),
                model_external_id: None,
                vehicle_code: 0,
            }],
        )
        .unwrap();
        let text = String::from_utf8(out).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some("descricao,fipeid_marca,,fipeid_modelo,tipoveiculo"));
        assert_eq!(lines.next(), Some("HONDA,25,\"Civic EXL 2.0, Aut.\",,0"));
    }

    #[tokio::test]
    async fn brands_export_is_grouped_and_ordered() {
        let store = MemoryStore::new();
        store
            .insert_reference_periods(&[
                NewReferencePeriod::parse_label("março/2025").unwrap(),
                NewReferencePeriod::parse_label("abril/2025").unwrap(),
            ])
            .await
            .unwrap();
        for period in store.reference_periods().await.unwrap() {
            store
                .insert_brands(
                    VehicleType::Car,
                    period.id,
                    &[CatalogItem::new("Toyota", 56), CatalogItem::new("Honda", 25)],
                )
                .await
                .unwrap();
        }

        let dir = tempdir().expect("tempdir");
        let path = dir.path().join(BRANDS_EXPORT_FILE);
        let rows = export_brands(&store, &path).await.expect("export");
        assert_eq!(rows, 2);
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "descricao,fipeid,tipoveiculo\nHONDA,25,0\nTOYOTA,56,0\n");
    }
}
