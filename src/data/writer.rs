//! Result persistence.
//!
//! The sequencer hands every finished (or cancelled) program dataset to a
//! [`ResultWriter`]. The default writer stores pretty-printed JSON:
//!
//! ```text
//! <data_folder>/die_x_0_y_0/gax_000_r0_c0_2024_03_07_09_05_01/
//!     sweep.json                  target metadata
//!     00_keysight_id_vgs.json     {metadata, program, config, dataset}
//!     01_keysight_rram_1t1r.json
//! ```

use super::buffer::ResultDataset;
use crate::experiment::run::SweepMetadata;
use crate::program::ProgramConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::path::PathBuf;
use tracing::debug;

/// File name of the per-target metadata record.
pub const METADATA_FILE: &str = "sweep.json";

/// Persists target metadata and program datasets.
#[async_trait]
pub trait ResultWriter: Send + Sync {
    /// Store the metadata of a target before its programs run.
    async fn write_metadata(&self, metadata: &SweepMetadata) -> Result<PathBuf>;

    /// Store the dataset of program `index` at a target.
    async fn write_dataset(
        &self,
        metadata: &SweepMetadata,
        index: usize,
        program: &ProgramConfig,
        dataset: &ResultDataset,
    ) -> Result<PathBuf>;
}

#[derive(Serialize)]
struct DatasetFile<'a> {
    metadata: &'a SweepMetadata,
    program: &'a str,
    config: &'a serde_json::Value,
    dataset: &'a ResultDataset,
}

/// Writes JSON files under each target's save directory.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonResultWriter;

impl JsonResultWriter {
    /// New JSON writer.
    pub fn new() -> Self {
        Self
    }

    /// File name of program `index`'s dataset.
    pub fn dataset_file_name(index: usize, program: &str) -> String {
        format!("{index:02}_{program}.json")
    }

    async fn write_json<T: Serialize + Sync>(path: PathBuf, value: &T) -> Result<PathBuf> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create result directory {:?}", parent))?;
        }
        let text = serde_json::to_string_pretty(value).context("Failed to serialize result")?;
        tokio::fs::write(&path, text)
            .await
            .with_context(|| format!("Failed to write {:?}", path))?;
        debug!(path = %path.display(), "result written");
        Ok(path)
    }
}

#[async_trait]
impl ResultWriter for JsonResultWriter {
    async fn write_metadata(&self, metadata: &SweepMetadata) -> Result<PathBuf> {
        let path = metadata.output_dir().join(METADATA_FILE);
        Self::write_json(path, metadata).await
    }

    async fn write_dataset(
        &self,
        metadata: &SweepMetadata,
        index: usize,
        program: &ProgramConfig,
        dataset: &ResultDataset,
    ) -> Result<PathBuf> {
        let path = metadata
            .output_dir()
            .join(Self::dataset_file_name(index, &program.name));
        let file = DatasetFile {
            metadata,
            program: &program.name,
            config: &program.config,
            dataset,
        };
        Self::write_json(path, &file).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::SweepResultBuffer;
    use crate::experiment::run::MeasurementRun;
    use crate::program::SweepStep;
    use crate::sweep::{StartAddress, SweepSpec};
    use crate::wafer::WaferCalibration;

    #[tokio::test]
    async fn test_json_writer_layout() {
        let dir = tempfile::tempdir().unwrap();
        let program = ProgramConfig::new("debug", serde_json::json!({}));
        let run = MeasurementRun::new(
            "public",
            StartAddress::default(),
            WaferCalibration::default(),
            vec![program.clone()],
            SweepSpec::single(),
        )
        .with_data_folder(dir.path(), true);
        let target = &run.sweep.targets(&run.start).unwrap()[0];
        let position = crate::wafer::compute_position(0, 0, 0, 0, &run.calibration);
        let metadata = SweepMetadata::for_target(&run, target, position);

        let mut buffer = SweepResultBuffer::new("debug", &[]);
        buffer.push(SweepStep::new("a").with_channel("v_gs", vec![vec![1.0, 2.0]]));
        buffer.push(SweepStep::new("b").with_channel("v_gs", vec![vec![3.0]]));

        let writer = JsonResultWriter::new();
        let meta_path = writer.write_metadata(&metadata).await.unwrap();
        let data_path = writer
            .write_dataset(&metadata, 0, &program, &buffer.snapshot())
            .await
            .unwrap();

        assert!(meta_path.ends_with(METADATA_FILE));
        assert!(data_path.ends_with("00_debug.json"));
        assert!(data_path.starts_with(dir.path().join("die_x_0_y_0")));

        let text = std::fs::read_to_string(&data_path).unwrap();
        let json: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(json["dataset"]["num_points"], serde_json::json!([2, 1]));
        assert!(json["dataset"]["data"]["v_gs"][1][0][1].is_null());
    }
}
