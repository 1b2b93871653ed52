use nifti::NiftiHeader;

/// Row-major 4x4 voxel-to-world transform (RAS+).
pub type Affine = [[f64; 4]; 4];

/// NIFTI_XFORM_SCANNER_ANAT
const XFORM_SCANNER_ANAT: i16 = 1;
/// NIFTI_UNITS_MM
const UNITS_MM: u8 = 2;

/// Spatial fields of a NIfTI-1 header.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Geometry {
    /// pixdim[0] holds qfac, pixdim[1..4] the voxel size
    pub pixdim: [f32; 8],
    pub xyzt_units: u8,
    pub qform_code: i16,
    /// quaternion parameters b, c, d
    pub quatern: [f32; 3],
    pub qoffset: [f32; 3],
    pub sform_code: i16,
    pub srow_x: [f32; 4],
    pub srow_y: [f32; 4],
    pub srow_z: [f32; 4],
}

impl Default for Geometry {
    fn default() -> Self {
        Self {
            pixdim: [1.0; 8],
            xyzt_units: UNITS_MM,
            qform_code: 0,
            quatern: [0.0; 3],
            qoffset: [0.0; 3],
            sform_code: 0,
            srow_x: [1.0, 0.0, 0.0, 0.0],
            srow_y: [0.0, 1.0, 0.0, 0.0],
            srow_z: [0.0, 0.0, 1.0, 0.0],
        }
    }
}

impl Geometry {
    pub fn from_header(header: &NiftiHeader) -> Self {
        Self {
            pixdim: header.pixdim,
            xyzt_units: header.xyzt_units,
            qform_code: header.qform_code,
            quatern: [header.quatern_b, header.quatern_c, header.quatern_d],
            qoffset: [header.quatern_x, header.quatern_y, header.quatern_z],
            sform_code: header.sform_code,
            srow_x: header.srow_x,
            srow_y: header.srow_y,
            srow_z: header.srow_z,
        }
    }

    /// Copy the spatial fields into `header`, leaving everything else.
    pub fn apply_to_header(&self, header: &mut NiftiHeader) {
        header.pixdim = self.pixdim;
        header.xyzt_units = self.xyzt_units;
        header.qform_code = self.qform_code;
        header.quatern_b = self.quatern[0];
        header.quatern_c = self.quatern[1];
        header.quatern_d = self.quatern[2];
        header.quatern_x = self.qoffset[0];
        header.quatern_y = self.qoffset[1];
        header.quatern_z = self.qoffset[2];
        header.sform_code = self.sform_code;
        header.srow_x = self.srow_x;
        header.srow_y = self.srow_y;
        header.srow_z = self.srow_z;
    }

    /// Voxel size along the three spatial axes.
    pub fn spacing(&self) -> [f64; 3] {
        [
            self.pixdim[1] as f64,
            self.pixdim[2] as f64,
            self.pixdim[3] as f64,
        ]
    }

    /// Voxel-to-world transform: sform when set, then qform, then plain
    /// voxel scaling.
    pub fn affine(&self) -> Affine {
        if self.sform_code > 0 {
            let row = |r: &[f32; 4]| [r[0] as f64, r[1] as f64, r[2] as f64, r[3] as f64];
            return [
                row(&self.srow_x),
                row(&self.srow_y),
                row(&self.srow_z),
                [0.0, 0.0, 0.0, 1.0],
            ];
        }
        if self.qform_code > 0 {
            return self.qform_affine();
        }
        let [dx, dy, dz] = self.spacing().map(|v| if v == 0.0 { 1.0 } else { v.abs() });
        [
            [dx, 0.0, 0.0, 0.0],
            [0.0, dy, 0.0, 0.0],
            [0.0, 0.0, dz, 0.0],
            [0.0, 0.0, 0.0, 1.0],
        ]
    }

    fn qform_affine(&self) -> Affine {
        let [b, c, d] = self.quatern.map(|v| v as f64);
        let a = (1.0 - (b * b + c * c + d * d)).max(0.0).sqrt();
        let qfac = if self.pixdim[0] < 0.0 { -1.0 } else { 1.0 };
        let [dx, dy, dz] = self.spacing().map(|v| if v <= 0.0 { 1.0 } else { v });
        let dz = dz * qfac;

        let r = [
            [a * a + b * b - c * c - d * d, 2.0 * (b * c - a * d), 2.0 * (b * d + a * c)],
            [2.0 * (b * c + a * d), a * a + c * c - b * b - d * d, 2.0 * (c * d - a * b)],
            [2.0 * (b * d - a * c), 2.0 * (c * d + a * b), a * a + d * d - c * c - b * b],
        ];
        let zooms = [dx, dy, dz];
        let mut affine = [[0.0; 4]; 4];
        for (i, row) in r.iter().enumerate() {
            for (j, value) in row.iter().enumerate() {
                affine[i][j] = value * zooms[j];
            }
            affine[i][3] = self.qoffset[i] as f64;
        }
        affine[3][3] = 1.0;
        affine
    }

    /// Scanner-anatomical geometry with both sform and qform describing
    /// `affine`. The rotation part must be orthogonal up to scaling.
    pub fn from_affine(affine: &Affine) -> Self {
        let mut zooms = [0.0f64; 3];
        for (j, zoom) in zooms.iter_mut().enumerate() {
            let norm = (0..3).map(|i| affine[i][j] * affine[i][j]).sum::<f64>().sqrt();
            *zoom = if norm == 0.0 { 1.0 } else { norm };
        }

        let mut r = [[0.0f64; 3]; 3];
        for (r_row, a_row) in r.iter_mut().zip(affine.iter()) {
            for (j, value) in r_row.iter_mut().enumerate() {
                *value = a_row[j] / zooms[j];
            }
        }

        let mut qfac = 1.0f32;
        if determinant(&r) < 0.0 {
            qfac = -1.0;
            for row in r.iter_mut() {
                row[2] = -row[2];
            }
        }

        let [b, c, d] = rotation_to_quaternion(&r);
        let row = |i: usize| {
            [
                affine[i][0] as f32,
                affine[i][1] as f32,
                affine[i][2] as f32,
                affine[i][3] as f32,
            ]
        };

        Self {
            pixdim: [
                qfac,
                zooms[0] as f32,
                zooms[1] as f32,
                zooms[2] as f32,
                1.0,
                1.0,
                1.0,
                1.0,
            ],
            xyzt_units: UNITS_MM,
            qform_code: XFORM_SCANNER_ANAT,
            quatern: [b as f32, c as f32, d as f32],
            qoffset: [affine[0][3] as f32, affine[1][3] as f32, affine[2][3] as f32],
            sform_code: XFORM_SCANNER_ANAT,
            srow_x: row(0),
            srow_y: row(1),
            srow_z: row(2),
        }
    }
}

fn determinant(m: &[[f64; 3]; 3]) -> f64 {
    m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1])
        - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
        + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0])
}

/// Quaternion (b, c, d) of a proper rotation, with a >= 0.
fn rotation_to_quaternion(r: &[[f64; 3]; 3]) -> [f64; 3] {
    let trace = r[0][0] + r[1][1] + r[2][2] + 1.0;
    let (a, b, c, d);
    if trace > 0.5 {
        a = 0.5 * trace.sqrt();
        b = 0.25 * (r[2][1] - r[1][2]) / a;
        c = 0.25 * (r[0][2] - r[2][0]) / a;
        d = 0.25 * (r[1][0] - r[0][1]) / a;
    } else {
        let xd = 1.0 + r[0][0] - (r[1][1] + r[2][2]);
        let yd = 1.0 + r[1][1] - (r[0][0] + r[2][2]);
        let zd = 1.0 + r[2][2] - (r[0][0] + r[1][1]);
        if xd > 1.0 {
            b = 0.5 * xd.sqrt();
            c = 0.25 * (r[0][1] + r[1][0]) / b;
            d = 0.25 * (r[0][2] + r[2][0]) / b;
            a = 0.25 * (r[2][1] - r[1][2]) / b;
        } else if yd > 1.0 {
            c = 0.5 * yd.sqrt();
            b = 0.25 * (r[0][1] + r[1][0]) / c;
            d = 0.25 * (r[1][2] + r[2][1]) / c;
            a = 0.25 * (r[0][2] - r[2][0]) / c;
        } else {
            d = 0.5 * zd.sqrt();
            b = 0.25 * (r[0][2] + r[2][0]) / d;
            c = 0.25 * (r[1][2] + r[2][1]) / d;
            a = 0.25 * (r[1][0] - r[0][1]) / d;
        }
    }
    if a < 0.0 {
        [-b, -c, -d]
    } else {
        [b, c, d]
    }
}

/// Axis permutation and flips that bring `affine` closest to RAS+.
///
/// `perm[i]` is the voxel axis that becomes output axis `i`; `flip[i]` says
/// whether that output axis runs against world axis `i`.
pub fn canonical_axes(affine: &Affine) -> ([usize; 3], [bool; 3]) {
    let mut perm = [0usize; 3];
    let mut flip = [false; 3];
    let mut world_used = [false; 3];
    let mut voxel_used = [false; 3];

    // greedily pair the strongest world/voxel axis couplings
    for _ in 0..3 {
        let mut best = (0usize, 0usize, -1.0f64);
        for (i, used_world) in world_used.iter().enumerate() {
            if *used_world {
                continue;
            }
            for (j, used_voxel) in voxel_used.iter().enumerate() {
                if *used_voxel {
                    continue;
                }
                let weight = affine[i][j].abs();
                if weight > best.2 {
                    best = (i, j, weight);
                }
            }
        }
        let (i, j, _) = best;
        world_used[i] = true;
        voxel_used[j] = true;
        perm[i] = j;
        flip[i] = affine[i][j] < 0.0;
    }
    (perm, flip)
}

/// Affine of a volume after reordering its axes with `perm`/`flip`, given
/// the original `shape`.
pub fn reoriented_affine(affine: &Affine, shape: [usize; 3], perm: [usize; 3], flip: [bool; 3]) -> Affine {
    let mut out = [[0.0; 4]; 4];
    for (out_row, row) in out.iter_mut().zip(affine.iter()) {
        out_row[3] = row[3];
    }
    for (new_axis, (&old_axis, &flipped)) in perm.iter().zip(flip.iter()).enumerate() {
        let sign = if flipped { -1.0 } else { 1.0 };
        for (out_row, row) in out.iter_mut().zip(affine.iter()).take(3) {
            out_row[new_axis] = row[old_axis] * sign;
            if flipped {
                out_row[3] += row[old_axis] * (shape[old_axis] as f64 - 1.0);
            }
        }
    }
    out[3][3] = 1.0;
    out
}
