//! Storage sinks for sensor payloads.

use crate::context::lock;

use framesync_env::{EnvError, PayloadKind, SensorPayload, StorageSink};
use image::{ImageFormat, RgbaImage};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

/// Writes images as PNG and point clouds as ASCII PLY.
#[derive(Debug, Default)]
pub struct DiskSink;

impl DiskSink {
    pub fn new() -> Self {
        Self
    }

    fn write_png(payload: &SensorPayload, width: u32, height: u32, path: &Path) -> Result<(), EnvError> {
        let image = RgbaImage::from_raw(width, height, payload.data.clone()).ok_or_else(|| {
            EnvError::rejected(format!(
                "{} bytes do not form a {}x{} RGBA image",
                payload.data.len(),
                width,
                height
            ))
        })?;
        image
            .save_with_format(path, ImageFormat::Png)
            .map_err(|e| EnvError::Io(std::io::Error::other(e)))
    }

    fn write_ply(payload: &SensorPayload, points: u32, path: &Path) -> Result<(), EnvError> {
        let mut out = BufWriter::new(File::create(path)?);
        writeln!(out, "ply")?;
        writeln!(out, "format ascii 1.0")?;
        writeln!(out, "element vertex {}", points)?;
        writeln!(out, "property float32 x")?;
        writeln!(out, "property float32 y")?;
        writeln!(out, "property float32 z")?;
        writeln!(out, "property float32 I")?;
        writeln!(out, "end_header")?;

        for chunk in payload.data.chunks_exact(16).take(points as usize) {
            let mut v = [0f32; 4];
            for (i, bytes) in chunk.chunks_exact(4).enumerate() {
                v[i] = f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            }
            writeln!(out, "{:.4} {:.4} {:.4} {:.4}", v[0], v[1], v[2], v[3])?;
        }
        out.flush()?;
        Ok(())
    }
}

impl StorageSink for DiskSink {
    fn save(&self, payload: &SensorPayload, path: &Path) -> Result<(), EnvError> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }

        match payload.kind {
            PayloadKind::Image { width, height } => Self::write_png(payload, width, height, path)?,
            PayloadKind::PointCloud { points } => Self::write_ply(payload, points, path)?,
        }

        debug!("Saved {}", path.display());
        Ok(())
    }
}

/// Remembers where payloads would have been written.
#[derive(Debug, Default)]
pub struct MemorySink {
    saved: Mutex<Vec<(u64, PathBuf)>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        lock(&self.saved).iter().map(|(_, p)| p.clone()).collect()
    }

    /// Payloads saved for `frame`.
    pub fn count_for_frame(&self, frame: u64) -> usize {
        lock(&self.saved).iter().filter(|(f, _)| *f == frame).count()
    }

    pub fn len(&self) -> usize {
        lock(&self.saved).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.saved).is_empty()
    }
}

impl StorageSink for MemorySink {
    fn save(&self, payload: &SensorPayload, path: &Path) -> Result<(), EnvError> {
        lock(&self.saved).push((payload.frame, path.to_path_buf()));
        Ok(())
    }
}

/// Sink picked at runtime by the CLI.
#[derive(Debug)]
pub enum AnySink {
    Disk(DiskSink),
    Memory(MemorySink),
}

impl StorageSink for AnySink {
    fn save(&self, payload: &SensorPayload, path: &Path) -> Result<(), EnvError> {
        match self {
            AnySink::Disk(sink) => sink.save(payload, path),
            AnySink::Memory(sink) => sink.save(payload, path),
        }
    }
}
