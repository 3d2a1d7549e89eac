//! NIfTI-1 single-file volumes, plain (`.nii`) or gzip-compressed (`.nii.gz`).
//!
//! The resampling tools write segmentations and masks in this format. The
//! voxel-to-world affine comes from the sform when set, else from the qform
//! quaternion, else from the voxel sizes alone.

use super::affine::Affine;
use super::codec::{temp_path, VolumeCodec};
use super::volume::{IntensityVolume, LabelVolume, Mask, Volume};
use crate::core::Frame;
use crate::errors::VolumeError;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Read, Write};
use std::path::Path;

const HEADER_SIZE: usize = 348;
const VOX_OFFSET: usize = 352;
const MAGIC: &[u8; 4] = b"n+1\0";
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Unit code for millimetres in `xyzt_units`.
const UNITS_MM: u8 = 2;

/// Returns true for `.nii` and `.nii.gz` file names.
#[must_use]
pub fn is_nifti(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.ends_with(".nii") || name.ends_with(".nii.gz"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DataType {
    U8,
    I8,
    I16,
    U16,
    I32,
    U32,
    F32,
    F64,
}

impl DataType {
    const fn from_code(code: i16) -> Option<Self> {
        match code {
            2 => Some(Self::U8),
            256 => Some(Self::I8),
            4 => Some(Self::I16),
            512 => Some(Self::U16),
            8 => Some(Self::I32),
            768 => Some(Self::U32),
            16 => Some(Self::F32),
            64 => Some(Self::F64),
            _ => None,
        }
    }

    const fn code(self) -> i16 {
        match self {
            Self::U8 => 2,
            Self::I8 => 256,
            Self::I16 => 4,
            Self::U16 => 512,
            Self::I32 => 8,
            Self::U32 => 768,
            Self::F32 => 16,
            Self::F64 => 64,
        }
    }

    const fn width(self) -> usize {
        match self {
            Self::U8 | Self::I8 => 1,
            Self::I16 | Self::U16 => 2,
            Self::I32 | Self::U32 | Self::F32 => 4,
            Self::F64 => 8,
        }
    }
}

/// Fixed-offset field access in either byte order.
struct Fields<'a> {
    bytes: &'a [u8],
    big_endian: bool,
}

impl Fields<'_> {
    fn array<const N: usize>(&self, at: usize) -> [u8; N] {
        let mut raw = [0u8; N];
        raw.copy_from_slice(&self.bytes[at..at + N]);
        if self.big_endian {
            raw.reverse();
        }
        raw
    }

    fn i16(&self, at: usize) -> i16 {
        i16::from_le_bytes(self.array(at))
    }

    fn f32(&self, at: usize) -> f32 {
        f32::from_le_bytes(self.array(at))
    }

    fn f64s<const N: usize>(&self, at: usize) -> [f64; N] {
        std::array::from_fn(|k| f64::from(self.f32(at + 4 * k)))
    }

    fn value(&self, dtype: DataType, at: usize) -> f64 {
        match dtype {
            DataType::U8 => f64::from(self.bytes[at]),
            DataType::I8 => f64::from(i8::from_le_bytes(self.array(at))),
            DataType::I16 => f64::from(self.i16(at)),
            DataType::U16 => f64::from(u16::from_le_bytes(self.array(at))),
            DataType::I32 => f64::from(i32::from_le_bytes(self.array(at))),
            DataType::U32 => f64::from(u32::from_le_bytes(self.array(at))),
            DataType::F32 => f64::from(self.f32(at)),
            DataType::F64 => f64::from_le_bytes(self.array(at)),
        }
    }
}

#[derive(Debug)]
struct Header {
    shape: [usize; 3],
    dtype: DataType,
    affine: Affine,
    slope: f64,
    inter: f64,
    offset: usize,
    big_endian: bool,
}

fn header_err(path: &Path, reason: impl Into<String>) -> VolumeError {
    VolumeError::Header {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

/// Rotation from the qform quaternion, columns scaled by the voxel sizes.
fn quaternion_rows(fields: &Fields<'_>, pixdim: [f64; 8]) -> [[f64; 4]; 4] {
    let [b, c, d] = fields.f64s::<3>(256);
    let [qx, qy, qz] = fields.f64s::<3>(268);
    let a = (1.0 - (b * b + c * c + d * d)).max(0.0).sqrt();
    let qfac = if pixdim[0] < 0.0 { -1.0 } else { 1.0 };
    let (dx, dy, dz) = (pixdim[1], pixdim[2], pixdim[3] * qfac);
    [
        [
            (a * a + b * b - c * c - d * d) * dx,
            2.0 * (b * c - a * d) * dy,
            2.0 * (b * d + a * c) * dz,
            qx,
        ],
        [
            2.0 * (b * c + a * d) * dx,
            (a * a + c * c - b * b - d * d) * dy,
            2.0 * (c * d - a * b) * dz,
            qy,
        ],
        [
            2.0 * (b * d - a * c) * dx,
            2.0 * (c * d + a * b) * dy,
            (a * a + d * d - b * b - c * c) * dz,
            qz,
        ],
        [0.0, 0.0, 0.0, 1.0],
    ]
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
fn parse_header(path: &Path, bytes: &[u8]) -> Result<Header, VolumeError> {
    if bytes.len() < HEADER_SIZE {
        return Err(header_err(path, "truncated NIfTI header"));
    }
    let size_le = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let size_be = i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let big_endian = match (size_le, size_be) {
        (348, _) => false,
        (_, 348) => true,
        _ => return Err(header_err(path, "not a NIfTI-1 header")),
    };
    if &bytes[344..348] != MAGIC {
        return Err(header_err(path, "only single-file NIfTI-1 (n+1) is supported"));
    }
    let fields = Fields { bytes, big_endian };

    let ndim = fields.i16(40);
    if !(3..=7).contains(&ndim) {
        return Err(header_err(path, format!("unsupported dimensionality {ndim}")));
    }
    let dims: Vec<i16> = (1..=ndim as usize).map(|k| fields.i16(40 + 2 * k)).collect();
    if dims.iter().any(|&d| d < 1) {
        return Err(header_err(path, format!("invalid dimensions {dims:?}")));
    }
    if dims[3..].iter().any(|&d| d != 1) {
        return Err(header_err(path, format!("expected a 3D volume, found dimensions {dims:?}")));
    }
    let shape = [dims[0] as usize, dims[1] as usize, dims[2] as usize];

    let code = fields.i16(70);
    let dtype = DataType::from_code(code).ok_or_else(|| VolumeError::DataType {
        path: path.to_path_buf(),
        dtype: format!("nifti:{code}"),
    })?;

    let pixdim = fields.f64s::<8>(76);
    let vox_offset = fields.f32(108);
    if !(vox_offset >= HEADER_SIZE as f32 && vox_offset.fract() == 0.0) {
        return Err(header_err(path, format!("invalid vox_offset {vox_offset}")));
    }

    let rows = if fields.i16(254) > 0 {
        let [x, y, z] = [280, 296, 312].map(|at| fields.f64s::<4>(at));
        [x, y, z, [0.0, 0.0, 0.0, 1.0]]
    } else if fields.i16(252) > 0 {
        quaternion_rows(&fields, pixdim)
    } else {
        *Affine::from_zooms([pixdim[1], pixdim[2], pixdim[3]], [0.0; 3]).rows()
    };
    let affine = Affine::from_rows(rows).map_err(|source| VolumeError::Affine {
        path: path.to_path_buf(),
        source,
    })?;
    affine.inverse().map_err(|source| VolumeError::Affine {
        path: path.to_path_buf(),
        source,
    })?;

    Ok(Header {
        shape,
        dtype,
        affine,
        slope: f64::from(fields.f32(112)),
        inter: f64::from(fields.f32(116)),
        offset: vox_offset as usize,
        big_endian,
    })
}

fn put(buf: &mut [u8], at: usize, bytes: &[u8]) {
    buf[at..at + bytes.len()].copy_from_slice(bytes);
}

/// Reads and writes NIfTI-1 volumes.
///
/// NIfTI carries no notion of reconstruction versus native space, so every
/// volume read is tagged with the codec's frame.
#[derive(Debug, Clone, Copy)]
pub struct NiftiVolumeCodec {
    frame: Frame,
}

impl Default for NiftiVolumeCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl NiftiVolumeCodec {
    /// Creates a codec reading volumes as native-space.
    #[must_use]
    pub const fn new() -> Self {
        Self { frame: Frame::Native }
    }

    /// Sets the frame volumes are read into.
    #[must_use]
    pub const fn with_frame(mut self, frame: Frame) -> Self {
        self.frame = frame;
        self
    }

    fn load(path: &Path) -> Result<(Header, Vec<f64>), VolumeError> {
        let io_err = |source| VolumeError::Io {
            path: path.to_path_buf(),
            source,
        };
        let raw = std::fs::read(path).map_err(io_err)?;
        let bytes = if raw.starts_with(&GZIP_MAGIC) {
            let mut inflated = Vec::new();
            GzDecoder::new(raw.as_slice()).read_to_end(&mut inflated).map_err(io_err)?;
            inflated
        } else {
            raw
        };

        let header = parse_header(path, &bytes)?;
        let voxels: usize = header.shape.iter().product();
        let width = header.dtype.width();
        let available = bytes.len().saturating_sub(header.offset) / width;
        if available < voxels {
            return Err(VolumeError::ShapeMismatch {
                shape: header.shape,
                expected: voxels,
                found: available,
            });
        }
        let fields = Fields {
            bytes: &bytes,
            big_endian: header.big_endian,
        };
        let values = (0..voxels)
            .map(|i| fields.value(header.dtype, header.offset + i * width))
            .collect();
        Ok((header, values))
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
    fn store(path: &Path, like: &Volume<impl Copy>, dtype: DataType, payload: &[u8]) -> Result<(), VolumeError> {
        let io_err = |source| VolumeError::Io {
            path: path.to_path_buf(),
            source,
        };
        let mut header = vec![0u8; VOX_OFFSET];
        put(&mut header, 0, &348i32.to_le_bytes());
        let mut dim = [3i16, 1, 1, 1, 1, 1, 1, 1];
        for (axis, &n) in like.shape().iter().enumerate() {
            dim[axis + 1] = i16::try_from(n)
                .map_err(|_| header_err(path, format!("dimension {n} exceeds the NIfTI-1 limit")))?;
        }
        for (k, d) in dim.iter().enumerate() {
            put(&mut header, 40 + 2 * k, &d.to_le_bytes());
        }
        put(&mut header, 70, &dtype.code().to_le_bytes());
        put(&mut header, 72, &(dtype.width() as i16 * 8).to_le_bytes());
        let zooms = like.affine().zooms();
        let pixdim = [1.0, zooms[0], zooms[1], zooms[2], 0.0, 0.0, 0.0, 0.0];
        for (k, p) in pixdim.iter().enumerate() {
            put(&mut header, 76 + 4 * k, &(*p as f32).to_le_bytes());
        }
        put(&mut header, 108, &(VOX_OFFSET as f32).to_le_bytes());
        put(&mut header, 112, &1.0f32.to_le_bytes());
        header[123] = UNITS_MM;
        put(&mut header, 254, &1i16.to_le_bytes());
        for (r, at) in [280, 296, 312].into_iter().enumerate() {
            for (c, v) in like.affine().rows()[r].iter().enumerate() {
                put(&mut header, at + 4 * c, &(*v as f32).to_le_bytes());
            }
        }
        put(&mut header, 344, MAGIC);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let tmp = temp_path(path);
        let file = std::fs::File::create(&tmp).map_err(io_err)?;
        let file = if path.extension().is_some_and(|e| e == "gz") {
            let mut encoder = GzEncoder::new(file, Compression::default());
            encoder.write_all(&header).map_err(io_err)?;
            encoder.write_all(payload).map_err(io_err)?;
            encoder.finish().map_err(io_err)?
        } else {
            let mut file = file;
            file.write_all(&header).map_err(io_err)?;
            file.write_all(payload).map_err(io_err)?;
            file
        };
        file.sync_all().map_err(io_err)?;
        drop(file);
        std::fs::rename(&tmp, path).map_err(io_err)
    }

    /// Writes a label volume as unsigned 16-bit integers.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn write_labels(&self, path: &Path, labels: &LabelVolume) -> Result<(), VolumeError> {
        let payload: Vec<u8> = labels.data().iter().flat_map(|l| l.to_le_bytes()).collect();
        Self::store(path, labels, DataType::U16, &payload)
    }

    /// Writes an intensity volume as 32-bit floats.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn write_intensity(&self, path: &Path, anat: &IntensityVolume) -> Result<(), VolumeError> {
        let payload: Vec<u8> = anat.data().iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::store(path, anat, DataType::F32, &payload)
    }
}

impl VolumeCodec for NiftiVolumeCodec {
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn read_labels(&self, path: &Path) -> Result<LabelVolume, VolumeError> {
        let (header, values) = Self::load(path)?;
        let labels = values
            .into_iter()
            .map(|v| {
                if v.fract() == 0.0 && (0.0..=f64::from(u16::MAX)).contains(&v) {
                    Ok(v as u16)
                } else {
                    Err(VolumeError::LabelValue {
                        path: path.to_path_buf(),
                        value: v,
                    })
                }
            })
            .collect::<Result<Vec<u16>, _>>()?;
        Volume::new(header.shape, self.frame, header.affine, labels)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn read_intensity(&self, path: &Path) -> Result<IntensityVolume, VolumeError> {
        let (header, values) = Self::load(path)?;
        let scaled = header.slope != 0.0 && header.slope.is_finite() && !(header.slope == 1.0 && header.inter == 0.0);
        let data = values
            .into_iter()
            .map(|v| {
                let value = if scaled { v * header.slope + header.inter } else { v };
                value as f32
            })
            .collect();
        Volume::new(header.shape, self.frame, header.affine, data)
    }

    fn read_mask(&self, path: &Path) -> Result<Mask, VolumeError> {
        let (header, values) = Self::load(path)?;
        Volume::new(header.shape, self.frame, header.affine, values.into_iter().map(|v| v != 0.0).collect())
    }

    fn write_mask(&self, path: &Path, mask: &Mask) -> Result<(), VolumeError> {
        let payload: Vec<u8> = mask.data().iter().map(|&v| u8::from(v)).collect();
        Self::store(path, mask, DataType::U8, &payload)
    }
}
