//! Arena corner model and the grid ↔ pixel projective transform.

use nalgebra::{Matrix3, Point2, SMatrix, SVector, Vector3};
use serde::Deserialize;

/// A point in camera pixel space.
pub type PixelPoint = Point2<f64>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Corner {
    TopLeft,
    TopRight,
    BottomLeft,
    BottomRight,
}

impl Corner {
    pub const ALL: [Corner; 4] = [
        Corner::TopLeft,
        Corner::TopRight,
        Corner::BottomLeft,
        Corner::BottomRight,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Corner::TopLeft => "top_left",
            Corner::TopRight => "top_right",
            Corner::BottomLeft => "bottom_left",
            Corner::BottomRight => "bottom_right",
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ArenaError {
    #[error("arena corner '{0}' was not detected")]
    MissingCorner(&'static str),
    #[error("arena corners do not form a valid quadrilateral: {reason}")]
    Degenerate { reason: String },
    #[error("arena dimension {name} = {value} must be positive and finite")]
    InvalidDimension { name: &'static str, value: f64 },
    #[error("arena grid of {cols}x{rows} cells is too small to route on")]
    GridTooSmall { cols: usize, rows: usize },
    #[error("projective transform could not be solved")]
    Homography,
}

/// The four calibrated arena corners in pixel space.
///
/// Construction validates the quadrilateral, so a value of this type is
/// always non-degenerate: corners are finite, the outline
/// TL → TR → BR → BL is strictly convex and the TL→TR / TL→BR extents are
/// positive.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "RawCorners")]
pub struct ArenaCorners {
    top_left: PixelPoint,
    top_right: PixelPoint,
    bottom_left: PixelPoint,
    bottom_right: PixelPoint,
}

#[derive(Deserialize)]
struct RawCorners {
    top_left: [f64; 2],
    top_right: [f64; 2],
    bottom_left: [f64; 2],
    bottom_right: [f64; 2],
}

impl TryFrom<RawCorners> for ArenaCorners {
    type Error = ArenaError;

    fn try_from(raw: RawCorners) -> Result<Self, Self::Error> {
        let p = |a: [f64; 2]| PixelPoint::new(a[0], a[1]);
        ArenaCorners::new(
            p(raw.top_left),
            p(raw.top_right),
            p(raw.bottom_left),
            p(raw.bottom_right),
        )
    }
}

impl ArenaCorners {
    pub fn new(
        top_left: PixelPoint,
        top_right: PixelPoint,
        bottom_left: PixelPoint,
        bottom_right: PixelPoint,
    ) -> Result<Self, ArenaError> {
        let corners = Self {
            top_left,
            top_right,
            bottom_left,
            bottom_right,
        };
        corners.validate()?;
        Ok(corners)
    }

    /// Builds the corner set from `(name, point)` detections such as
    /// `("top_left", p)`. Unknown names are ignored.
    pub fn from_named<'a, I>(detections: I) -> Result<Self, ArenaError>
    where
        I: IntoIterator<Item = (&'a str, PixelPoint)>,
    {
        let mut found: [Option<PixelPoint>; 4] = [None; 4];
        for (name, point) in detections {
            if let Some(idx) = Corner::ALL.iter().position(|c| c.name() == name) {
                found[idx] = Some(point);
            }
        }
        let take = |idx: usize| found[idx].ok_or(ArenaError::MissingCorner(Corner::ALL[idx].name()));
        Self::new(take(0)?, take(1)?, take(2)?, take(3)?)
    }

    pub fn get(&self, corner: Corner) -> PixelPoint {
        match corner {
            Corner::TopLeft => self.top_left,
            Corner::TopRight => self.top_right,
            Corner::BottomLeft => self.bottom_left,
            Corner::BottomRight => self.bottom_right,
        }
    }

    /// Horizontal pixel extent, measured along the top edge.
    pub fn pixel_length(&self) -> f64 {
        self.top_right.x - self.top_left.x
    }

    /// Vertical pixel extent, measured top-left to bottom-right.
    pub fn pixel_height(&self) -> f64 {
        self.bottom_right.y - self.top_left.y
    }

    fn validate(&self) -> Result<(), ArenaError> {
        for corner in Corner::ALL {
            let p = self.get(corner);
            if !(p.x.is_finite() && p.y.is_finite()) {
                return Err(ArenaError::Degenerate {
                    reason: format!("{} is not finite", corner.name()),
                });
            }
        }
        if self.pixel_length() <= 0.0 || self.pixel_height() <= 0.0 {
            return Err(ArenaError::Degenerate {
                reason: format!(
                    "non-positive extent {:.1}x{:.1} px",
                    self.pixel_length(),
                    self.pixel_height()
                ),
            });
        }

        // Walk the outline clockwise (in image coordinates); every turn must
        // bend the same way for the quad to be convex and correctly ordered.
        let outline = [
            self.top_left,
            self.top_right,
            self.bottom_right,
            self.bottom_left,
        ];
        for i in 0..4 {
            let a = outline[i];
            let b = outline[(i + 1) % 4];
            let c = outline[(i + 2) % 4];
            let ab = b - a;
            let bc = c - b;
            let cross = ab.x * bc.y - ab.y * bc.x;
            if cross <= f64::EPSILON {
                return Err(ArenaError::Degenerate {
                    reason: "outline is not strictly convex in TL, TR, BR, BL order".into(),
                });
            }
        }
        Ok(())
    }

    /// Solves the transform mapping grid coordinates of a `cols × rows` grid
    /// onto these corners: `(0,0)` → TL, `(cols-1,0)` → TR,
    /// `(0,rows-1)` → BL, `(cols-1,rows-1)` → BR.
    pub fn grid_transform(&self, cols: usize, rows: usize) -> Result<Homography, ArenaError> {
        if cols < 2 || rows < 2 {
            return Err(ArenaError::GridTooSmall { cols, rows });
        }
        let (w, h) = ((cols - 1) as f64, (rows - 1) as f64);
        let src = [[0.0, 0.0], [w, 0.0], [0.0, h], [w, h]];
        let dst = [
            self.top_left,
            self.top_right,
            self.bottom_left,
            self.bottom_right,
        ]
        .map(|p| [p.x, p.y]);
        Homography::from_correspondences(&src, &dst)
    }
}

/// A 3×3 projective transform together with its inverse.
#[derive(Debug, Clone, PartialEq)]
pub struct Homography {
    forward: Matrix3<f64>,
    inverse: Matrix3<f64>,
}

impl Homography {
    /// Exact solve from four point correspondences (h33 fixed to 1).
    pub fn from_correspondences(src: &[[f64; 2]; 4], dst: &[[f64; 2]; 4]) -> Result<Self, ArenaError> {
        let mut a = SMatrix::<f64, 8, 8>::zeros();
        let mut b = SVector::<f64, 8>::zeros();
        for i in 0..4 {
            let [x, y] = src[i];
            let [u, v] = dst[i];
            let r = 2 * i;
            a[(r, 0)] = x;
            a[(r, 1)] = y;
            a[(r, 2)] = 1.0;
            a[(r, 6)] = -x * u;
            a[(r, 7)] = -y * u;
            b[r] = u;

            a[(r + 1, 3)] = x;
            a[(r + 1, 4)] = y;
            a[(r + 1, 5)] = 1.0;
            a[(r + 1, 6)] = -x * v;
            a[(r + 1, 7)] = -y * v;
            b[r + 1] = v;
        }

        let h = a.lu().solve(&b).ok_or(ArenaError::Homography)?;
        let forward = Matrix3::new(h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], 1.0);
        let inverse = forward.try_inverse().ok_or(ArenaError::Homography)?;
        Ok(Self { forward, inverse })
    }

    /// Grid coordinate → pixel.
    pub fn project(&self, p: Point2<f64>) -> PixelPoint {
        apply(&self.forward, p)
    }

    /// Pixel → grid coordinate.
    pub fn unproject(&self, p: PixelPoint) -> Point2<f64> {
        apply(&self.inverse, p)
    }
}

fn apply(m: &Matrix3<f64>, p: Point2<f64>) -> Point2<f64> {
    let q = m * Vector3::new(p.x, p.y, 1.0);
    if q.z.abs() < 1e-15 {
        return Point2::new(f64::NAN, f64::NAN);
    }
    Point2::new(q.x / q.z, q.y / q.z)
}
