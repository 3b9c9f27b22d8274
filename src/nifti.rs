//! NIfTI-1 header access: dimensions and voxel-to-world orientation only.

use std::fs;
use std::io::Read;

use camino::Utf8Path;
use flate2::read::GzDecoder;

use crate::config::{Orientation, SliceDirection};
use crate::error::KiraError;

const HEADER_SIZE: usize = 348;

#[derive(Debug, Clone, PartialEq)]
pub struct NiftiHeader {
    pub dim: [i16; 8],
    pub pixdim: [f32; 8],
    pub qform_code: i16,
    pub sform_code: i16,
    pub quatern: [f32; 3],
    pub srow: [[f32; 4]; 3],
}

impl NiftiHeader {
    pub fn read(path: &Utf8Path) -> Result<Self, KiraError> {
        let file = fs::File::open(path.as_std_path()).map_err(|err| KiraError::Nifti {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?;
        let mut bytes = Vec::with_capacity(HEADER_SIZE);
        let result = if path.as_str().ends_with(".gz") {
            GzDecoder::new(file)
                .take(HEADER_SIZE as u64)
                .read_to_end(&mut bytes)
        } else {
            file.take(HEADER_SIZE as u64).read_to_end(&mut bytes)
        };
        result.map_err(|err| KiraError::Nifti {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?;
        Self::parse(&bytes).map_err(|message| KiraError::Nifti {
            path: path.to_path_buf(),
            message,
        })
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, String> {
        if bytes.len() < HEADER_SIZE {
            return Err(format!("header truncated at {} bytes", bytes.len()));
        }
        let little = match (
            i32::from_le_bytes(word(bytes, 0)),
            i32::from_be_bytes(word(bytes, 0)),
        ) {
            (348, _) => true,
            (_, 348) => false,
            _ => return Err("sizeof_hdr is not 348, not a NIfTI-1 file".to_string()),
        };
        let reader = Fields { bytes, little };

        let mut dim = [0i16; 8];
        for (i, value) in dim.iter_mut().enumerate() {
            *value = reader.i16_at(40 + 2 * i);
        }
        let mut pixdim = [0f32; 8];
        for (i, value) in pixdim.iter_mut().enumerate() {
            *value = reader.f32_at(76 + 4 * i);
        }
        let mut srow = [[0f32; 4]; 3];
        for (row, values) in srow.iter_mut().enumerate() {
            for (col, value) in values.iter_mut().enumerate() {
                *value = reader.f32_at(280 + 16 * row + 4 * col);
            }
        }
        Ok(Self {
            dim,
            pixdim,
            qform_code: reader.i16_at(252),
            sform_code: reader.i16_at(254),
            quatern: [reader.f32_at(256), reader.f32_at(260), reader.f32_at(264)],
            srow,
        })
    }

    /// Number of slices along the acquisition axis.
    pub fn slice_count(&self, direction: SliceDirection) -> usize {
        let axis = usize::from(direction.get());
        usize::try_from(self.dim[axis]).unwrap_or(0).max(1)
    }

    /// 3x3 voxel-to-world matrix (sform, then qform, then the analyze default).
    pub fn affine(&self) -> [[f64; 3]; 3] {
        if self.sform_code > 0 {
            let mut m = [[0.0; 3]; 3];
            for (row, values) in m.iter_mut().enumerate() {
                for (col, value) in values.iter_mut().enumerate() {
                    *value = f64::from(self.srow[row][col]);
                }
            }
            return m;
        }
        let spacing = [
            f64::from(self.pixdim[1]),
            f64::from(self.pixdim[2]),
            f64::from(self.pixdim[3]),
        ];
        if self.qform_code > 0 {
            let [b, c, d] = self.quatern.map(f64::from);
            let a = (1.0 - (b * b + c * c + d * d)).max(0.0).sqrt();
            let r = [
                [
                    a * a + b * b - c * c - d * d,
                    2.0 * (b * c - a * d),
                    2.0 * (b * d + a * c),
                ],
                [
                    2.0 * (b * c + a * d),
                    a * a + c * c - b * b - d * d,
                    2.0 * (c * d - a * b),
                ],
                [
                    2.0 * (b * d - a * c),
                    2.0 * (c * d + a * b),
                    a * a + d * d - b * b - c * c,
                ],
            ];
            let qfac = if self.pixdim[0] < 0.0 { -1.0 } else { 1.0 };
            let scale = [spacing[0], spacing[1], spacing[2] * qfac];
            let mut m = [[0.0; 3]; 3];
            for row in 0..3 {
                for col in 0..3 {
                    m[row][col] = r[row][col] * scale[col];
                }
            }
            return m;
        }
        [
            [-spacing[0].abs(), 0.0, 0.0],
            [0.0, spacing[1].abs(), 0.0],
            [0.0, 0.0, spacing[2].abs()],
        ]
    }

    /// Voxel orientation in the from-side convention used by `fslswapdim`.
    pub fn orientation(&self) -> Result<Orientation, String> {
        let m = self.affine();
        let mut used = [false; 3];
        let mut letters = ['?'; 3];
        for (col, letter) in letters.iter_mut().enumerate() {
            let Some(row) = (0..3)
                .filter(|row| !used[*row])
                .max_by(|a, b| m[*a][col].abs().total_cmp(&m[*b][col].abs()))
            else {
                return Err("degenerate affine".to_string());
            };
            used[row] = true;
            let increasing = m[row][col] >= 0.0;
            *letter = match (row, increasing) {
                (0, true) => 'L',
                (0, false) => 'R',
                (1, true) => 'P',
                (1, false) => 'A',
                (_, true) => 'I',
                (_, false) => 'S',
            };
        }
        Orientation::from_letters(letters)
    }
}

struct Fields<'a> {
    bytes: &'a [u8],
    little: bool,
}

impl Fields<'_> {
    fn i16_at(&self, offset: usize) -> i16 {
        let raw = [self.bytes[offset], self.bytes[offset + 1]];
        if self.little {
            i16::from_le_bytes(raw)
        } else {
            i16::from_be_bytes(raw)
        }
    }

    fn f32_at(&self, offset: usize) -> f32 {
        let raw = word(self.bytes, offset);
        if self.little {
            f32::from_le_bytes(raw)
        } else {
            f32::from_be_bytes(raw)
        }
    }
}

fn word(bytes: &[u8], offset: usize) -> [u8; 4] {
    [
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ]
}
