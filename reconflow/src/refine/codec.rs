//! Volume file I/O.

use super::affine::Affine;
use super::nifti::{is_nifti, NiftiVolumeCodec};
use super::volume::{IntensityVolume, LabelVolume, Mask, Volume};
use crate::core::Frame;
use crate::errors::VolumeError;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Reads and writes the rasters the refinement stage works on.
#[cfg_attr(test, mockall::automock)]
pub trait VolumeCodec: Send + Sync {
    /// Reads a label volume.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is unreadable or not integer-typed.
    fn read_labels(&self, path: &Path) -> Result<LabelVolume, VolumeError>;

    /// Reads an intensity volume.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is unreadable.
    fn read_intensity(&self, path: &Path) -> Result<IntensityVolume, VolumeError>;

    /// Reads a binary mask; any non-zero voxel is foreground.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is unreadable or not integer-typed.
    fn read_mask(&self, path: &Path) -> Result<Mask, VolumeError>;

    /// Writes a binary mask. Either the whole file appears or nothing does.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    fn write_mask(&self, path: &Path, mask: &Mask) -> Result<(), VolumeError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum DataType {
    U8,
    U16,
    F32,
}

impl DataType {
    const fn width(self) -> usize {
        match self {
            Self::U8 => 1,
            Self::U16 => 2,
            Self::F32 => 4,
        }
    }

    const fn name(self) -> &'static str {
        match self {
            Self::U8 => "u8",
            Self::U16 => "u16",
            Self::F32 => "f32",
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Header {
    shape: [usize; 3],
    frame: Frame,
    affine: Affine,
    dtype: DataType,
}

/// A minimal raster format: one JSON header line, then little-endian voxels, x fastest.
///
/// ```text
/// {"shape":[256,256,256],"frame":"native","affine":[[...]],"dtype":"u16"}\n<payload>
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct RawVolumeCodec;

impl RawVolumeCodec {
    /// Creates the codec.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn read_raw(path: &Path) -> Result<(Header, Vec<u8>), VolumeError> {
        let bytes = std::fs::read(path).map_err(|source| VolumeError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let newline = bytes.iter().position(|&b| b == b'\n').ok_or_else(|| VolumeError::Header {
            path: path.to_path_buf(),
            reason: "missing header line".to_string(),
        })?;
        let header: Header = serde_json::from_slice(&bytes[..newline]).map_err(|e| VolumeError::Header {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        header.affine.inverse().map_err(|source| VolumeError::Affine {
            path: path.to_path_buf(),
            source,
        })?;

        let payload = bytes[newline + 1..].to_vec();
        let expected: usize = header.shape.iter().product();
        let found = payload.len() / header.dtype.width();
        if found != expected || payload.len() % header.dtype.width() != 0 {
            return Err(VolumeError::ShapeMismatch {
                shape: header.shape,
                expected,
                found,
            });
        }
        Ok((header, payload))
    }

    fn decode_integers(path: &Path, header: &Header, payload: &[u8]) -> Result<Vec<u16>, VolumeError> {
        match header.dtype {
            DataType::U8 => Ok(payload.iter().map(|&b| u16::from(b)).collect()),
            DataType::U16 => Ok(payload
                .chunks_exact(2)
                .map(|c| u16::from_le_bytes([c[0], c[1]]))
                .collect()),
            DataType::F32 => Err(VolumeError::DataType {
                path: path.to_path_buf(),
                dtype: header.dtype.name().to_string(),
            }),
        }
    }
}

pub(super) fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(std::ffi::OsStr::to_os_string).unwrap_or_default();
    name.push(".partial");
    path.with_file_name(name)
}

impl VolumeCodec for RawVolumeCodec {
    fn read_labels(&self, path: &Path) -> Result<LabelVolume, VolumeError> {
        let (header, payload) = Self::read_raw(path)?;
        let data = Self::decode_integers(path, &header, &payload)?;
        Volume::new(header.shape, header.frame, header.affine, data)
    }

    fn read_intensity(&self, path: &Path) -> Result<IntensityVolume, VolumeError> {
        let (header, payload) = Self::read_raw(path)?;
        let data: Vec<f32> = match header.dtype {
            DataType::U8 => payload.iter().map(|&b| f32::from(b)).collect(),
            DataType::U16 => payload
                .chunks_exact(2)
                .map(|c| f32::from(u16::from_le_bytes([c[0], c[1]])))
                .collect(),
            DataType::F32 => payload
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        };
        Volume::new(header.shape, header.frame, header.affine, data)
    }

    fn read_mask(&self, path: &Path) -> Result<Mask, VolumeError> {
        let (header, payload) = Self::read_raw(path)?;
        let data = Self::decode_integers(path, &header, &payload)?;
        Volume::new(header.shape, header.frame, header.affine, data.into_iter().map(|v| v != 0).collect())
    }

    fn write_mask(&self, path: &Path, mask: &Mask) -> Result<(), VolumeError> {
        let io_err = |source| VolumeError::Io {
            path: path.to_path_buf(),
            source,
        };
        let header = Header {
            shape: mask.shape(),
            frame: mask.frame(),
            affine: *mask.affine(),
            dtype: DataType::U8,
        };
        let line = serde_json::to_string(&header).map_err(|e| VolumeError::Header {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let tmp = temp_path(path);
        let mut file = std::fs::File::create(&tmp).map_err(io_err)?;
        file.write_all(line.as_bytes()).map_err(io_err)?;
        file.write_all(b"\n").map_err(io_err)?;
        let payload: Vec<u8> = mask.data().iter().map(|&v| u8::from(v)).collect();
        file.write_all(&payload).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
        drop(file);
        std::fs::rename(&tmp, path).map_err(io_err)
    }
}

/// Picks the format from the file name: NIfTI-1 for `.nii` and `.nii.gz`,
/// the raw format for anything else.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileVolumeCodec {
    raw: RawVolumeCodec,
    nifti: NiftiVolumeCodec,
}

impl FileVolumeCodec {
    /// Creates the codec.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            raw: RawVolumeCodec::new(),
            nifti: NiftiVolumeCodec::new(),
        }
    }

    fn pick(&self, path: &Path) -> &dyn VolumeCodec {
        if is_nifti(path) {
            &self.nifti
        } else {
            &self.raw
        }
    }
}

impl VolumeCodec for FileVolumeCodec {
    fn read_labels(&self, path: &Path) -> Result<LabelVolume, VolumeError> {
        self.pick(path).read_labels(path)
    }

    fn read_intensity(&self, path: &Path) -> Result<IntensityVolume, VolumeError> {
        self.pick(path).read_intensity(path)
    }

    fn read_mask(&self, path: &Path) -> Result<Mask, VolumeError> {
        self.pick(path).read_mask(path)
    }

    fn write_mask(&self, path: &Path, mask: &Mask) -> Result<(), VolumeError> {
        self.pick(path).write_mask(path, mask)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_raw(path: &Path, header: &str, payload: &[u8]) {
        let mut bytes = header.as_bytes().to_vec();
        bytes.push(b'\n');
        bytes.extend_from_slice(payload);
        std::fs::write(path, bytes).unwrap();
    }

    const IDENTITY: &str = "[[1,0,0,0],[0,1,0,0],[0,0,1,0],[0,0,0,1]]";

    #[test]
    fn test_mask_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mri/brainmask.consensus.vol");
        let mut mask = Mask::filled([3, 2, 2], Frame::Native, Affine::from_zooms([0.8, 0.8, 0.8], [1.0, 2.0, 3.0]), false);
        mask.set(2, 1, 0, true);

        let codec = RawVolumeCodec::new();
        codec.write_mask(&path, &mask).unwrap();
        assert!(!temp_path(&path).exists());
        assert_eq!(codec.read_mask(&path).unwrap(), mask);
    }

    #[test]
    fn test_read_u16_labels_and_f32_intensity() {
        let dir = tempfile::tempdir().unwrap();
        let labels = dir.path().join("aseg.vol");
        let header = format!(r#"{{"shape":[2,1,1],"frame":"native","affine":{IDENTITY},"dtype":"u16"}}"#);
        write_raw(&labels, &header, &[3, 0, 0xEA, 0x07]);

        let codec = RawVolumeCodec::new();
        assert_eq!(codec.read_labels(&labels).unwrap().data(), &[3, 2026]);
        assert_eq!(codec.read_intensity(&labels).unwrap().data(), &[3.0, 2026.0]);

        let anat = dir.path().join("t1.vol");
        let header = format!(r#"{{"shape":[1,1,1],"frame":"native","affine":{IDENTITY},"dtype":"f32"}}"#);
        write_raw(&anat, &header, &1.5f32.to_le_bytes());
        assert_eq!(codec.read_intensity(&anat).unwrap().data(), &[1.5]);
        assert!(matches!(codec.read_labels(&anat), Err(VolumeError::DataType { .. })));
    }

    #[test]
    fn test_rejects_bad_files() {
        let dir = tempfile::tempdir().unwrap();
        let codec = RawVolumeCodec::new();

        let short = dir.path().join("short.vol");
        let header = format!(r#"{{"shape":[2,2,2],"frame":"native","affine":{IDENTITY},"dtype":"u8"}}"#);
        write_raw(&short, &header, &[1, 1, 1]);
        assert!(matches!(codec.read_mask(&short), Err(VolumeError::ShapeMismatch { .. })));

        let singular = dir.path().join("singular.vol");
        let header = r#"{"shape":[1,1,1],"frame":"native","affine":[[0,0,0,0],[0,1,0,0],[0,0,1,0],[0,0,0,1]],"dtype":"u8"}"#;
        write_raw(&singular, header, &[1]);
        assert!(matches!(codec.read_mask(&singular), Err(VolumeError::Affine { .. })));

        let garbage = dir.path().join("garbage.vol");
        std::fs::write(&garbage, b"no header here").unwrap();
        assert!(matches!(codec.read_mask(&garbage), Err(VolumeError::Header { .. })));

        assert!(matches!(codec.read_mask(&dir.path().join("missing.vol")), Err(VolumeError::Io { .. })));
    }

    #[test]
    fn test_file_codec_dispatches_on_name() {
        let dir = tempfile::tempdir().unwrap();
        let codec = FileVolumeCodec::new();
        let mut mask = Mask::filled([2, 2, 2], Frame::Native, Affine::from_zooms([1.0, 1.0, 2.0], [0.0; 3]), false);
        mask.set(1, 1, 1, true);

        let nifti = dir.path().join("mri/brainmask.consensus.nii.gz");
        codec.write_mask(&nifti, &mask).unwrap();
        assert_eq!(codec.read_mask(&nifti).unwrap(), mask);
        assert!(matches!(RawVolumeCodec::new().read_mask(&nifti), Err(VolumeError::Header { .. })));

        let raw = dir.path().join("mri/brainmask.consensus.vol");
        codec.write_mask(&raw, &mask).unwrap();
        assert_eq!(RawVolumeCodec::new().read_mask(&raw).unwrap(), mask);
    }
}
